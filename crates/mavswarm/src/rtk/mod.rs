//! u-blox RTK base-station subsystem: serial port lifecycle with reconnect,
//! survey-in control, constellation configuration, and the RTCM3/UBX/NMEA
//! stream demultiplexer.

pub mod proxy;
pub mod rtcm3;
pub mod ubx;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StationError;
use proxy::{Demux, SharedWriter};
pub use rtcm3::RtcmFrame;
pub use ubx::{NavSvin, UbxFrame, UbxMessage};

/// Which RTCM observation families the base emits once activated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteConfig {
    pub gps: bool,
    pub glonass: bool,
    pub galileo: bool,
    pub beidou: bool,
    /// RTCM 4072 moving-baseline PVT.
    pub pvt: bool,
}

#[derive(Debug, Clone)]
pub struct RtkConfig {
    pub device: String,
    pub baud_rate: u32,
    /// First retry delay after the port drops.
    pub reopen_delay_min: Duration,
    /// Backoff cap for reopen attempts.
    pub reopen_delay_max: Duration,
}

impl Default for RtkConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            baud_rate: 115_200,
            reopen_delay_min: Duration::from_secs(1),
            reopen_delay_max: Duration::from_secs(3),
        }
    }
}

/// Handle to the base station. Clones share the port; dropping the last
/// handle closes it.
#[derive(Clone)]
pub struct RtkBase {
    inner: Arc<RtkInner>,
    // Held by handles only, so the last handle drop cancels the port tasks.
    _shutdown: Arc<ShutdownGuard>,
}

struct ShutdownGuard {
    cancel: CancellationToken,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct RtkInner {
    demux: Demux,
    writer: SharedWriter,
    connect_tx: watch::Sender<u32>,
    cancel: CancellationToken,
    baud_rate: u32,
}

impl RtkBase {
    /// Open the configured serial port and keep it open: failed opens and
    /// dropped sessions retry with backoff until [`RtkBase::close`].
    #[cfg(feature = "serial")]
    pub fn open(config: RtkConfig) -> Self {
        use tokio_serial::SerialPortBuilderExt;

        let base = Self::make(config.baud_rate);
        let inner = base.inner.clone();
        tokio::spawn(async move {
            let mut delay = config.reopen_delay_min;
            loop {
                let builder = tokio_serial::new(&config.device, config.baud_rate)
                    .data_bits(tokio_serial::DataBits::Eight)
                    .parity(tokio_serial::Parity::None)
                    .stop_bits(tokio_serial::StopBits::One);
                match builder.open_native_async() {
                    Ok(stream) => {
                        debug!(device = %config.device, "rtk port open");
                        inner.run_session(stream).await;
                        warn!(device = %config.device, "rtk port lost");
                        delay = config.reopen_delay_min;
                    }
                    Err(err) => {
                        warn!(device = %config.device, "rtk open failed: {err}");
                    }
                }
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(config.reopen_delay_max);
            }
        });
        base
    }

    /// Run the base over an already-open bidirectional stream. Used by tests
    /// and by transports other than a local serial port; there is no reopen.
    pub fn attach<S>(stream: S, baud_rate: u32) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let base = Self::make(baud_rate);
        let inner = base.inner.clone();
        tokio::spawn(async move {
            inner.run_session(stream).await;
        });
        base
    }

    fn make(baud_rate: u32) -> Self {
        let (connect_tx, connect_rx) = watch::channel(0u32);
        let cancel = CancellationToken::new();
        Self {
            inner: Arc::new(RtkInner {
                demux: Demux::new(),
                writer: SharedWriter::new(connect_rx, cancel.clone()),
                connect_tx,
                cancel: cancel.clone(),
                baud_rate,
            }),
            _shutdown: Arc::new(ShutdownGuard { cancel }),
        }
    }

    /// Validated RTCM3 correction frames from the receiver.
    pub fn rtcm_frames(&self) -> broadcast::Receiver<RtcmFrame> {
        self.inner.demux.subscribe_rtcm()
    }

    /// Decoded UBX traffic (NAV-SVIN typed, everything else raw).
    pub fn ubx_messages(&self) -> broadcast::Receiver<UbxMessage> {
        self.inner.demux.subscribe_ubx()
    }

    /// Raw NMEA sentences.
    pub fn nmea_sentences(&self) -> broadcast::Receiver<String> {
        self.inner.demux.subscribe_nmea()
    }

    /// Version counter whose parity encodes connectivity: odd means the port
    /// is up. Every open/close bumps it, so watchers can detect flaps.
    pub fn connect_signal(&self) -> watch::Receiver<u32> {
        self.inner.connect_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connect_tx.borrow() % 2 == 1
    }

    /// Begin a survey-in: enable the NAV-SVIN report and configure TMODE3.
    ///
    /// `acc_limit_m` is the target mean accuracy in meters. Convergence shows
    /// up as a NAV-SVIN with `valid` set and `active` clear on
    /// [`RtkBase::ubx_messages`]; call [`RtkBase::activate_rtcm`] then.
    pub async fn start_survey_in(
        &self,
        min_duration: Duration,
        acc_limit_m: f32,
    ) -> Result<(), StationError> {
        self.write_ubx(&ubx::cfg_msg(ubx::CLASS_NAV, ubx::NAV_SVIN, 1))
            .await?;
        let min_dur_s = min_duration.as_secs_f64().ceil() as u32;
        let acc_limit = (acc_limit_m as f64 * 1e4) as u32;
        self.write_ubx(&ubx::cfg_tmode3_survey_in(min_dur_s, acc_limit))
            .await
    }

    /// Switch the converged base into correction mode: fix the measurement
    /// rate, silence NAV-SVIN, and enable the RTCM outputs selected by
    /// `satellites` (station ARP always, MSM7 per constellation).
    pub async fn activate_rtcm(&self, satellites: &SatelliteConfig) -> Result<(), StationError> {
        self.write_ubx(&ubx::cfg_rate(1000, 1)).await?;
        self.write_ubx(&ubx::cfg_msg(ubx::CLASS_NAV, ubx::NAV_SVIN, 0))
            .await?;
        // 1005: station antenna reference point
        self.write_ubx(&ubx::cfg_msg(ubx::CLASS_RTCM3, 0x05, 5)).await?;
        if satellites.gps {
            // 1077 GPS MSM7
            self.write_ubx(&ubx::cfg_msg(ubx::CLASS_RTCM3, 0x4d, 1)).await?;
        }
        if satellites.glonass {
            // 1087 GLONASS MSM7 + 1230 code-phase biases
            self.write_ubx(&ubx::cfg_msg(ubx::CLASS_RTCM3, 0x57, 1)).await?;
            self.write_ubx(&ubx::cfg_msg(ubx::CLASS_RTCM3, 0xe6, 1)).await?;
        }
        if satellites.galileo {
            // 1097 Galileo MSM7
            self.write_ubx(&ubx::cfg_msg(ubx::CLASS_RTCM3, 0x61, 1)).await?;
        }
        if satellites.beidou {
            // 1127 BeiDou MSM7
            self.write_ubx(&ubx::cfg_msg(ubx::CLASS_RTCM3, 0x7f, 1)).await?;
        }
        if satellites.pvt {
            // 4072 moving-baseline PVT
            self.write_ubx(&ubx::cfg_msg(ubx::CLASS_RTCM3, 0xfe, 1)).await?;
        }
        Ok(())
    }

    /// Write one UBX frame to the receiver. Serialized against other writers;
    /// waits out a port reopen.
    pub async fn write_ubx(&self, frame: &UbxFrame) -> Result<(), StationError> {
        self.inner.writer.write_all(&frame.encode()).await
    }

    /// Write raw bytes to the receiver (e.g. forwarding NTRIP corrections).
    pub async fn write_raw(&self, buf: &[u8]) -> Result<(), StationError> {
        self.inner.writer.write_all(buf).await
    }

    /// Drop the port and stop all retries.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// A combined consumer handle: one subscription per stream kind plus
    /// write access. Handy for proxying the receiver to another transport.
    pub fn subscribe(&self) -> RtkConn {
        RtkConn {
            rtcm: self.rtcm_frames(),
            ubx: self.ubx_messages(),
            nmea: self.nmea_sentences(),
            base: self.clone(),
        }
    }
}

/// One proxied consumer of the base-station streams. Each handle owns its
/// own bounded subscriptions (latest-wins on overflow); writes from all
/// handles serialize through the shared port writer.
pub struct RtkConn {
    pub rtcm: broadcast::Receiver<RtcmFrame>,
    pub ubx: broadcast::Receiver<UbxMessage>,
    pub nmea: broadcast::Receiver<String>,
    base: RtkBase,
}

impl RtkConn {
    pub async fn write_ubx(&self, frame: &UbxFrame) -> Result<(), StationError> {
        self.base.write_ubx(frame).await
    }

    pub async fn write_raw(&self, buf: &[u8]) -> Result<(), StationError> {
        self.base.write_raw(buf).await
    }
}

impl RtkInner {
    /// Drive one open port session: configure output ports, mark connected,
    /// then demux the inbound byte stream until the port dies.
    async fn run_session<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(stream);
        self.writer.install(Box::new(write_half)).await;

        // UBX+RTCM3 out on the DDC and USB ports.
        for port_id in [0u8, 3u8] {
            if let Err(err) = self
                .writer
                .write_now(&ubx::cfg_prt(port_id, self.baud_rate).encode())
                .await
            {
                warn!("rtk port configuration failed: {err}");
                break;
            }
        }

        self.connect_tx.send_modify(|v| {
            if *v % 2 == 0 {
                *v += 1;
            }
        });

        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = read_half.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(_) => self.demux.feed(&mut buf),
                        Err(err) => {
                            debug!("rtk read error: {err}");
                            break;
                        }
                    }
                }
            }
        }

        self.writer.clear().await;
        self.connect_tx.send_modify(|v| {
            if *v % 2 == 1 {
                *v += 1;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decode every UBX frame out of a raw byte stream.
    fn decode_all(mut bytes: &[u8]) -> Vec<UbxFrame> {
        let mut frames = Vec::new();
        while bytes.len() >= 8 {
            let len = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
            let total = 8 + len;
            frames.push(UbxFrame::decode(&bytes[..total]).expect("valid frame"));
            bytes = &bytes[total..];
        }
        assert!(bytes.is_empty(), "trailing garbage");
        frames
    }

    fn msg_rates(frames: &[UbxFrame]) -> Vec<(u8, u8, u8)> {
        frames
            .iter()
            .filter(|f| f.class == ubx::CLASS_CFG && f.id == ubx::CFG_MSG)
            .map(|f| (f.payload[0], f.payload[1], f.payload[2]))
            .collect()
    }

    #[tokio::test]
    async fn survey_in_to_rtcm_activation() {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let base = RtkBase::attach(ours, 115_200);
        let (mut rx_side, mut tx_side) = tokio::io::split(theirs);

        let mut connect = base.connect_signal();
        connect
            .wait_for(|v| *v % 2 == 1)
            .await
            .expect("connect signal");
        assert!(base.is_connected());

        base.start_survey_in(Duration::from_secs(10), 3.0)
            .await
            .unwrap();

        // The receiver converges and reports it.
        let mut ubx_rx = base.ubx_messages();
        let svin = NavSvin {
            itow_ms: 1000,
            duration_s: 12,
            mean_acc: 25_000,
            observations: 12,
            valid: true,
            active: false,
        };
        use tokio::io::AsyncWriteExt;
        tx_side.write_all(&svin.encode().encode()).await.unwrap();
        loop {
            match ubx_rx.recv().await.unwrap() {
                UbxMessage::NavSvin(got) if got.valid && !got.active => break,
                _ => {}
            }
        }

        base.activate_rtcm(&SatelliteConfig {
            gps: true,
            beidou: true,
            ..Default::default()
        })
        .await
        .unwrap();

        // Collect everything the base wrote to the port.
        base.close();
        drop(base);
        let mut written = Vec::new();
        rx_side.read_to_end(&mut written).await.unwrap();
        let frames = decode_all(&written);

        let rates = frames
            .iter()
            .filter(|f| f.class == ubx::CLASS_CFG && f.id == ubx::CFG_RATE)
            .count();
        assert_eq!(rates, 1, "exactly one CFG-RATE");

        let msgs = msg_rates(&frames);
        assert!(msgs.contains(&(ubx::CLASS_RTCM3, 0x05, 5)));
        assert!(msgs.contains(&(ubx::CLASS_RTCM3, 0x4d, 1)));
        assert!(msgs.contains(&(ubx::CLASS_RTCM3, 0x7f, 1)));
        assert!(!msgs.iter().any(|&(c, i, _)| c == ubx::CLASS_RTCM3
            && matches!(i, 0x57 | 0x61 | 0xe6 | 0xfe)));
        // NAV-SVIN enabled for the survey, disabled on activation.
        assert!(msgs.contains(&(ubx::CLASS_NAV, ubx::NAV_SVIN, 1)));
        assert!(msgs.contains(&(ubx::CLASS_NAV, ubx::NAV_SVIN, 0)));
        // Both output ports configured on open.
        let prts: Vec<u8> = frames
            .iter()
            .filter(|f| f.class == ubx::CLASS_CFG && f.id == ubx::CFG_PRT)
            .map(|f| f.payload[0])
            .collect();
        assert_eq!(prts, vec![0, 3]);
    }

    #[tokio::test]
    async fn rtcm_frames_reach_subscribers() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let base = RtkBase::attach(ours, 9600);
        let mut rtcm_rx = base.rtcm_frames();
        let (_rx_side, mut tx_side) = tokio::io::split(theirs);

        let frame = RtcmFrame::from_payload(&[0x43, 0x50, 1, 2, 3, 4]);
        use tokio::io::AsyncWriteExt;
        tx_side.write_all(frame.as_bytes()).await.unwrap();

        let got = rtcm_rx.recv().await.unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn session_end_flips_connect_parity() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let base = RtkBase::attach(ours, 9600);
        let mut connect = base.connect_signal();
        connect.wait_for(|v| *v == 1).await.unwrap();
        drop(theirs);
        connect.wait_for(|v| *v == 2).await.unwrap();
        assert!(!base.is_connected());
    }
}
