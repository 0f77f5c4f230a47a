use mavlink::ardupilotmega::MavState;
use serde::{Deserialize, Serialize};

/// Coarse per-drone lifecycle status derived from heartbeats and
/// acknowledged commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DroneStatus {
    #[default]
    None,
    Unstable,
    Ready,
    Sleeping,
    Armed,
    TakenOff,
    Manual,
    Error,
}

impl DroneStatus {
    /// Armed, flying, or under manual control.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DroneStatus::Armed | DroneStatus::TakenOff | DroneStatus::Manual
        )
    }

    /// Next status after observing a heartbeat system state.
    ///
    /// `Error` is sticky against POWEROFF / FLIGHT_TERMINATION, and an
    /// already-active status survives ACTIVE so an armed drone is not
    /// demoted to a bare `TakenOff`.
    pub fn on_heartbeat(self, state: MavState) -> DroneStatus {
        match state {
            MavState::MAV_STATE_STANDBY => DroneStatus::Ready,
            MavState::MAV_STATE_ACTIVE => {
                if self.is_active() {
                    self
                } else {
                    DroneStatus::TakenOff
                }
            }
            MavState::MAV_STATE_CRITICAL | MavState::MAV_STATE_EMERGENCY => DroneStatus::Error,
            MavState::MAV_STATE_POWEROFF | MavState::MAV_STATE_FLIGHT_TERMINATION => {
                if self == DroneStatus::Error {
                    self
                } else {
                    DroneStatus::Sleeping
                }
            }
            // UNINIT / BOOT / CALIBRATING
            _ => DroneStatus::Unstable,
        }
    }
}
