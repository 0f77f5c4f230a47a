//! Minimal u-blox UBX codec: framing, Fletcher checksum, and the handful of
//! payloads the base station speaks (CFG-PRT, CFG-MSG, CFG-RATE, CFG-TMODE3,
//! NAV-SVIN).

use crate::error::StationError;

pub const SYNC1: u8 = 0xb5;
pub const SYNC2: u8 = 0x62;

pub const CLASS_NAV: u8 = 0x01;
pub const CLASS_CFG: u8 = 0x06;
/// RTCM3 output message class on generation-9 receivers.
pub const CLASS_RTCM3: u8 = 0xf5;

pub const NAV_SVIN: u8 = 0x3b;
pub const CFG_PRT: u8 = 0x00;
pub const CFG_MSG: u8 = 0x01;
pub const CFG_RATE: u8 = 0x08;
pub const CFG_TMODE3: u8 = 0x71;

/// One UBX frame, checksum stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UbxFrame {
    pub class: u8,
    pub id: u8,
    pub payload: Vec<u8>,
}

impl UbxFrame {
    pub fn new(class: u8, id: u8, payload: Vec<u8>) -> Self {
        Self { class, id, payload }
    }

    /// Serialize with sync bytes and checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.payload.len());
        out.push(SYNC1);
        out.push(SYNC2);
        out.push(self.class);
        out.push(self.id);
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        let (ck_a, ck_b) = fletcher(&out[2..]);
        out.push(ck_a);
        out.push(ck_b);
        out
    }

    /// Decode a complete frame (sync bytes through checksum).
    pub fn decode(raw: &[u8]) -> Result<Self, StationError> {
        if raw.len() < 8 || raw[0] != SYNC1 || raw[1] != SYNC2 {
            return Err(StationError::UbxCodec("bad sync or truncated header".into()));
        }
        let len = u16::from_le_bytes([raw[4], raw[5]]) as usize;
        if raw.len() != 8 + len {
            return Err(StationError::UbxCodec(format!(
                "length mismatch: header says {len}, frame has {}",
                raw.len().saturating_sub(8)
            )));
        }
        let (ck_a, ck_b) = fletcher(&raw[2..6 + len]);
        if (ck_a, ck_b) != (raw[6 + len], raw[7 + len]) {
            return Err(StationError::UbxCodec("checksum mismatch".into()));
        }
        Ok(Self {
            class: raw[2],
            id: raw[3],
            payload: raw[6..6 + len].to_vec(),
        })
    }
}

/// Fletcher-8 checksum over class, id, length, and payload.
pub fn fletcher(bytes: &[u8]) -> (u8, u8) {
    let mut ck_a: u8 = 0;
    let mut ck_b: u8 = 0;
    for &b in bytes {
        ck_a = ck_a.wrapping_add(b);
        ck_b = ck_b.wrapping_add(ck_a);
    }
    (ck_a, ck_b)
}

/// A decoded message of interest, or the raw frame for everything else.
#[derive(Debug, Clone, PartialEq)]
pub enum UbxMessage {
    NavSvin(NavSvin),
    Other(UbxFrame),
}

impl UbxMessage {
    pub fn from_frame(frame: UbxFrame) -> Self {
        if frame.class == CLASS_NAV && frame.id == NAV_SVIN {
            if let Some(svin) = NavSvin::decode(&frame.payload) {
                return UbxMessage::NavSvin(svin);
            }
        }
        UbxMessage::Other(frame)
    }
}

/// NAV-SVIN survey-in status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavSvin {
    /// Observation time of week, milliseconds.
    pub itow_ms: u32,
    /// Seconds the survey has been running.
    pub duration_s: u32,
    /// Mean position accuracy in 0.1 mm units.
    pub mean_acc: u32,
    /// Number of observations used.
    pub observations: u32,
    pub valid: bool,
    pub active: bool,
}

impl NavSvin {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 40 {
            return None;
        }
        Some(Self {
            itow_ms: u32::from_le_bytes(payload[4..8].try_into().ok()?),
            duration_s: u32::from_le_bytes(payload[8..12].try_into().ok()?),
            mean_acc: u32::from_le_bytes(payload[28..32].try_into().ok()?),
            observations: u32::from_le_bytes(payload[32..36].try_into().ok()?),
            valid: payload[36] == 1,
            active: payload[37] == 1,
        })
    }

    /// Mean accuracy in meters.
    pub fn mean_acc_m(&self) -> f32 {
        self.mean_acc as f32 / 1e4
    }

    /// Build the report frame; the counterpart of [`NavSvin::decode`], used
    /// by receiver simulations.
    pub fn encode(&self) -> UbxFrame {
        let mut payload = vec![0u8; 40];
        payload[4..8].copy_from_slice(&self.itow_ms.to_le_bytes());
        payload[8..12].copy_from_slice(&self.duration_s.to_le_bytes());
        payload[28..32].copy_from_slice(&self.mean_acc.to_le_bytes());
        payload[32..36].copy_from_slice(&self.observations.to_le_bytes());
        payload[36] = self.valid as u8;
        payload[37] = self.active as u8;
        UbxFrame::new(CLASS_NAV, NAV_SVIN, payload)
    }
}

/// CFG-PRT for a UART-style port: 8N1, UBX in, UBX+RTCM3 out.
pub fn cfg_prt(port_id: u8, baud: u32) -> UbxFrame {
    const MODE_8N1: u32 = 0x0000_08d0;
    const PROTO_UBX: u16 = 0x0001;
    const PROTO_RTCM3: u16 = 0x0020;

    let mut payload = vec![0u8; 20];
    payload[0] = port_id;
    payload[4..8].copy_from_slice(&MODE_8N1.to_le_bytes());
    payload[8..12].copy_from_slice(&baud.to_le_bytes());
    payload[12..14].copy_from_slice(&PROTO_UBX.to_le_bytes());
    payload[14..16].copy_from_slice(&(PROTO_UBX | PROTO_RTCM3).to_le_bytes());
    UbxFrame::new(CLASS_CFG, CFG_PRT, payload)
}

/// CFG-MSG: output rate of (class, id) on the current port.
pub fn cfg_msg(class: u8, id: u8, rate: u8) -> UbxFrame {
    UbxFrame::new(CLASS_CFG, CFG_MSG, vec![class, id, rate])
}

/// CFG-RATE: measurement period in milliseconds and navigation rate in
/// measurement cycles.
pub fn cfg_rate(meas_ms: u16, nav_cycles: u16) -> UbxFrame {
    let mut payload = vec![0u8; 6];
    payload[0..2].copy_from_slice(&meas_ms.to_le_bytes());
    payload[2..4].copy_from_slice(&nav_cycles.to_le_bytes());
    // time reference: UTC
    payload[4..6].copy_from_slice(&0u16.to_le_bytes());
    UbxFrame::new(CLASS_CFG, CFG_RATE, payload)
}

/// CFG-TMODE3 in survey-in mode.
///
/// `acc_limit` is in 0.1 mm units, `min_dur_s` in seconds.
pub fn cfg_tmode3_survey_in(min_dur_s: u32, acc_limit: u32) -> UbxFrame {
    const MODE_SURVEY_IN: u16 = 1;

    let mut payload = vec![0u8; 40];
    payload[2..4].copy_from_slice(&MODE_SURVEY_IN.to_le_bytes());
    payload[24..28].copy_from_slice(&min_dur_s.to_le_bytes());
    payload[28..32].copy_from_slice(&acc_limit.to_le_bytes());
    UbxFrame::new(CLASS_CFG, CFG_TMODE3, payload)
}
