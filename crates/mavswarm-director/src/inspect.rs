//! Pre-flight inspectors. Each one checks a single readiness criterion on
//! the drone currently being assigned; the director runs them in order and
//! reports the first failure with its step index.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mavlink::ardupilotmega::{GpsFixType, MavMessage};
use mavswarm::Drone;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DirectorError;

/// VIBRATION message id for [`Drone::request_message`].
const MSG_ID_VIBRATION: u32 = 241;

#[async_trait]
pub trait Inspector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn inspect(
        &self,
        drone: &Arc<Drone>,
        cancel: &CancellationToken,
    ) -> Result<(), DirectorError>;
}

/// Requires an RTK-fixed GPS solution.
pub struct GpsTypeInspector;

#[async_trait]
impl Inspector for GpsTypeInspector {
    fn name(&self) -> &'static str {
        "gps-fix"
    }

    async fn inspect(
        &self,
        drone: &Arc<Drone>,
        _cancel: &CancellationToken,
    ) -> Result<(), DirectorError> {
        let got = drone.gps_type();
        if (got as u32) < (GpsFixType::GPS_FIX_TYPE_RTK_FIXED as u32) {
            return Err(DirectorError::GpsFixTooLow { got });
        }
        Ok(())
    }
}

/// Requires low vibration and a near-level attitude.
pub struct AttitudeInspector {
    pub max_vibration: f32,
    pub max_tilt_deg: f32,
}

#[async_trait]
impl Inspector for AttitudeInspector {
    fn name(&self) -> &'static str {
        "attitude"
    }

    async fn inspect(
        &self,
        drone: &Arc<Drone>,
        cancel: &CancellationToken,
    ) -> Result<(), DirectorError> {
        debug!(id = drone.id(), "requesting vibration");
        let msg = drone.request_message(cancel, MSG_ID_VIBRATION).await?;
        if let MavMessage::VIBRATION(v) = msg {
            let vib = (v.vibration_x * v.vibration_x
                + v.vibration_y * v.vibration_y
                + v.vibration_z * v.vibration_z)
                .sqrt();
            if vib > self.max_vibration {
                return Err(DirectorError::ExcessVibration {
                    got: vib,
                    limit: self.max_vibration,
                });
            }
        }
        let rotate = drone.rotate().ok_or(DirectorError::AttitudeUnavailable)?;
        if rotate.pitch.abs() > self.max_tilt_deg || rotate.roll.abs() > self.max_tilt_deg {
            return Err(DirectorError::TiltTooHigh {
                pitch: rotate.pitch,
                roll: rotate.roll,
                limit: self.max_tilt_deg,
            });
        }
        Ok(())
    }
}

/// Requires a minimum battery voltage. Battery telemetry is polled until it
/// shows up, so the inspector works right after a drone connects.
pub struct BatteryInspector {
    pub min_voltage: f32,
    pub poll: Duration,
}

impl BatteryInspector {
    pub fn new(min_voltage: f32) -> Self {
        Self {
            min_voltage,
            poll: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl Inspector for BatteryInspector {
    fn name(&self) -> &'static str {
        "battery"
    }

    async fn inspect(
        &self,
        drone: &Arc<Drone>,
        cancel: &CancellationToken,
    ) -> Result<(), DirectorError> {
        let battery = loop {
            if let Some(battery) = drone.battery() {
                break battery;
            }
            debug!(id = drone.id(), "waiting for battery telemetry");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(DirectorError::Station(mavswarm::StationError::Cancelled))
                }
                _ = tokio::time::sleep(self.poll) => {}
            }
        };
        if battery.voltage < self.min_voltage {
            return Err(DirectorError::VoltageTooLow {
                got: battery.voltage,
                want: self.min_voltage,
            });
        }
        Ok(())
    }
}
