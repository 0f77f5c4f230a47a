use serde::{Deserialize, Serialize};

/// A MAVLink link endpoint. The set is fixed at controller construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Endpoint {
    Serial { device: String, baud_rate: u32 },
    TcpClient { addr: String },
    TcpServer { addr: String },
    UdpClient { addr: String },
    UdpServer { addr: String },
    UdpBroadcast { local: String, broadcast: String },
}

impl Endpoint {
    /// The `mavlink::connect_async` address string for this endpoint.
    pub(crate) fn connection_string(&self) -> String {
        match self {
            Endpoint::Serial { device, baud_rate } => format!("serial:{device}:{baud_rate}"),
            Endpoint::TcpClient { addr } => format!("tcpout:{addr}"),
            Endpoint::TcpServer { addr } => format!("tcpin:{addr}"),
            Endpoint::UdpClient { addr } => format!("udpout:{addr}"),
            Endpoint::UdpServer { addr } => format!("udpin:{addr}"),
            Endpoint::UdpBroadcast { broadcast, .. } => format!("udpbcast:{broadcast}"),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.connection_string())
    }
}
