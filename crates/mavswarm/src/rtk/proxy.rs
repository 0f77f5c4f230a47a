//! Byte-stream demultiplexer for the u-blox port. The receiver interleaves
//! RTCM3 frames, UBX frames, and NMEA sentences on one serial stream; the
//! demux splits them and fans each kind out to subscribers.
//!
//! Fan-out uses bounded broadcast channels: a subscriber that stops draining
//! loses the oldest items rather than stalling the reader.

use bytes::{Buf, BytesMut};
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::rtcm3::{self, RtcmFrame, Scan};
use super::ubx::{self, UbxFrame, UbxMessage};
use crate::error::StationError;

/// Per-stream subscriber capacity.
const CHANNEL_CAPACITY: usize = 8;
/// A UBX length field above this is treated as line noise.
const MAX_UBX_PAYLOAD: usize = 2048;
/// NMEA sentences are short; a longer run without a newline is garbage.
const MAX_NMEA_LINE: usize = 512;

pub(crate) struct Demux {
    rtcm_tx: broadcast::Sender<RtcmFrame>,
    ubx_tx: broadcast::Sender<UbxMessage>,
    nmea_tx: broadcast::Sender<String>,
}

impl Demux {
    pub(crate) fn new() -> Self {
        let (rtcm_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (ubx_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (nmea_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            rtcm_tx,
            ubx_tx,
            nmea_tx,
        }
    }

    pub(crate) fn subscribe_rtcm(&self) -> broadcast::Receiver<RtcmFrame> {
        self.rtcm_tx.subscribe()
    }

    pub(crate) fn subscribe_ubx(&self) -> broadcast::Receiver<UbxMessage> {
        self.ubx_tx.subscribe()
    }

    pub(crate) fn subscribe_nmea(&self) -> broadcast::Receiver<String> {
        self.nmea_tx.subscribe()
    }

    /// Consume as many complete items from `buf` as possible.
    pub(crate) fn feed(&self, buf: &mut BytesMut) {
        loop {
            let Some(&head) = buf.first() else {
                return;
            };
            match head {
                rtcm3::PREAMBLE => match rtcm3::scan(buf) {
                    Scan::Incomplete => return,
                    Scan::Bad => buf.advance(1),
                    Scan::Frame(frame, consumed) => {
                        buf.advance(consumed);
                        trace!(len = frame.len(), "rtcm frame");
                        let _ = self.rtcm_tx.send(frame);
                    }
                },
                ubx::SYNC1 => match self.scan_ubx(buf) {
                    UbxScan::Incomplete => return,
                    UbxScan::Bad => buf.advance(1),
                    UbxScan::Frame(consumed) => buf.advance(consumed),
                },
                b'$' => {
                    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
                        if buf.len() > MAX_NMEA_LINE {
                            buf.advance(1);
                            continue;
                        }
                        return;
                    };
                    let line = String::from_utf8_lossy(&buf[..newline])
                        .trim_end_matches('\r')
                        .to_string();
                    buf.advance(newline + 1);
                    let _ = self.nmea_tx.send(line);
                }
                _ => buf.advance(1),
            }
        }
    }

    fn scan_ubx(&self, buf: &BytesMut) -> UbxScan {
        if buf.len() < 2 {
            return UbxScan::Incomplete;
        }
        if buf[1] != ubx::SYNC2 {
            return UbxScan::Bad;
        }
        if buf.len() < 6 {
            return UbxScan::Incomplete;
        }
        let len = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        if len > MAX_UBX_PAYLOAD {
            return UbxScan::Bad;
        }
        let total = 8 + len;
        if buf.len() < total {
            return UbxScan::Incomplete;
        }
        match UbxFrame::decode(&buf[..total]) {
            Ok(frame) => {
                let msg = UbxMessage::from_frame(frame);
                trace!(?msg, "ubx message");
                let _ = self.ubx_tx.send(msg);
                UbxScan::Frame(total)
            }
            Err(_) => UbxScan::Bad,
        }
    }
}

enum UbxScan {
    Incomplete,
    Bad,
    Frame(usize),
}

/// Serialized writer over whatever stream is currently open. Writes issued
/// while no session is up wait for the next session, so callers survive a
/// port reopen transparently.
pub(crate) struct SharedWriter {
    slot: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    connect_rx: watch::Receiver<u32>,
    cancel: CancellationToken,
}

impl SharedWriter {
    pub(crate) fn new(connect_rx: watch::Receiver<u32>, cancel: CancellationToken) -> Self {
        Self {
            slot: Mutex::new(None),
            connect_rx,
            cancel,
        }
    }

    pub(crate) async fn install(&self, writer: Box<dyn AsyncWrite + Send + Unpin>) {
        *self.slot.lock().await = Some(writer);
    }

    pub(crate) async fn clear(&self) {
        *self.slot.lock().await = None;
    }

    /// Write without waiting for a session; used during session setup where
    /// a failed write should surface instead of blocking on a reopen.
    pub(crate) async fn write_now(&self, buf: &[u8]) -> Result<(), StationError> {
        let mut slot = self.slot.lock().await;
        let writer = slot.as_mut().ok_or(StationError::RtkClosed)?;
        writer.write_all(buf).await?;
        writer.flush().await?;
        Ok(())
    }

    pub(crate) async fn write_all(&self, buf: &[u8]) -> Result<(), StationError> {
        let mut connect_rx = self.connect_rx.clone();
        loop {
            {
                let mut slot = self.slot.lock().await;
                if let Some(writer) = slot.as_mut() {
                    match writer.write_all(buf).await {
                        Ok(()) => {
                            writer.flush().await?;
                            return Ok(());
                        }
                        Err(err) => {
                            // The read loop will notice too; drop the writer
                            // and fall through to wait for the reopen.
                            trace!("rtk write failed, awaiting reopen: {err}");
                            *slot = None;
                        }
                    }
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(StationError::RtkClosed),
                changed = connect_rx.changed() => {
                    if changed.is_err() {
                        return Err(StationError::RtkClosed);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtk::ubx::NavSvin;

    fn demux_with_subs() -> (
        Demux,
        broadcast::Receiver<RtcmFrame>,
        broadcast::Receiver<UbxMessage>,
        broadcast::Receiver<String>,
    ) {
        let demux = Demux::new();
        let rtcm = demux.subscribe_rtcm();
        let ubx = demux.subscribe_ubx();
        let nmea = demux.subscribe_nmea();
        (demux, rtcm, ubx, nmea)
    }

    #[test]
    fn demux_splits_interleaved_streams() {
        let (demux, mut rtcm_rx, mut ubx_rx, mut nmea_rx) = demux_with_subs();

        let rtcm = RtcmFrame::from_payload(&[0x3e, 0xd0, 0xaa, 0xbb]);
        let svin = NavSvin {
            itow_ms: 1,
            duration_s: 2,
            mean_acc: 3,
            observations: 4,
            valid: false,
            active: true,
        };

        let mut buf = BytesMut::new();
        buf.extend_from_slice(rtcm.as_bytes());
        buf.extend_from_slice(b"$GNGGA,123519,4807.038,N*47\r\n");
        buf.extend_from_slice(&svin.encode().encode());
        demux.feed(&mut buf);

        assert!(buf.is_empty());
        assert_eq!(rtcm_rx.try_recv().unwrap(), rtcm);
        assert_eq!(
            nmea_rx.try_recv().unwrap(),
            "$GNGGA,123519,4807.038,N*47"
        );
        match ubx_rx.try_recv().unwrap() {
            UbxMessage::NavSvin(got) => assert_eq!(got, svin),
            other => panic!("expected NavSvin, got {other:?}"),
        }
    }

    #[test]
    fn demux_survives_partial_input() {
        let (demux, mut rtcm_rx, _ubx, _nmea) = demux_with_subs();
        let frame = RtcmFrame::from_payload(&[1, 2, 3, 4, 5]);
        let bytes = frame.as_bytes();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bytes[..4]);
        demux.feed(&mut buf);
        assert!(rtcm_rx.try_recv().is_err());

        buf.extend_from_slice(&bytes[4..]);
        demux.feed(&mut buf);
        assert_eq!(rtcm_rx.try_recv().unwrap(), frame);
    }

    #[test]
    fn demux_skips_garbage() {
        let (demux, mut rtcm_rx, _ubx, _nmea) = demux_with_subs();
        let frame = RtcmFrame::from_payload(&[7; 16]);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0xff, 0xd3, 0x13]); // noise, incl. a fake preamble
        buf.extend_from_slice(frame.as_bytes());
        demux.feed(&mut buf);

        assert_eq!(rtcm_rx.try_recv().unwrap(), frame);
    }

    #[test]
    fn slow_subscriber_loses_oldest() {
        let demux = Demux::new();
        let mut rx = demux.subscribe_rtcm();
        for i in 0..CHANNEL_CAPACITY + 3 {
            let mut buf = BytesMut::from(
                RtcmFrame::from_payload(&[i as u8; 4]).as_bytes(),
            );
            demux.feed(&mut buf);
        }
        // The receiver lagged; the first recv reports the loss.
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }
}
