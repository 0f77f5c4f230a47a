use std::sync::Arc;

use mavlink::ardupilotmega::{GpsFixType, MavMessage, MavSeverity};
use mavlink::MavHeader;

use crate::drone::Drone;
use crate::endpoint::Endpoint;
use crate::geo::{Gps, Rotate};

/// Events emitted by the [`Controller`](crate::Controller) to the upper layer.
///
/// The channel is bounded; a consumer that stops draining it will eventually
/// stall frame ingest, so treat the stream as mandatory.
#[derive(Debug, Clone)]
pub enum Event {
    ChannelOpen {
        endpoint: Endpoint,
    },
    ChannelClose {
        endpoint: Endpoint,
    },
    DroneConnected {
        drone: Arc<Drone>,
    },
    DroneDisconnected {
        drone: Arc<Drone>,
    },
    DroneStatusChanged {
        drone: Arc<Drone>,
    },
    DronePositionChanged {
        drone: Arc<Drone>,
        gps_type: GpsFixType,
        gps: Gps,
        rotate: Rotate,
    },
    DroneStatusText {
        drone: Arc<Drone>,
        severity: MavSeverity,
        text: String,
    },
    /// Every routed frame, after the owning drone has ingested it.
    DroneMessage {
        drone: Arc<Drone>,
        header: MavHeader,
        message: Box<MavMessage>,
    },
}
