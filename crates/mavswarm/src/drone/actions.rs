//! High-level drone operations: arming, guided movement, mission control,
//! and LED signaling. Every waiting operation takes a cancellation token and
//! returns early when it (or the controller) fires.

use std::time::Duration;

use mavlink::ardupilotmega::{
    MavCmd, MavFrame, MavGoto, MavMessage, MavMissionResult, PositionTargetTypemask,
    LED_CONTROL_DATA, MISSION_CLEAR_ALL_DATA, MISSION_ITEM_INT_DATA,
    SET_POSITION_TARGET_GLOBAL_INT_DATA,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Drone;
use crate::error::StationError;
use crate::geo::{angle_diff, Color, Gps};
use crate::status::DroneStatus;

/// ArduPilot magic for forcing arm state changes past the safety checks.
const FORCE_ARM_MAGIC: f32 = 21196.0;

/// Poll period for GPS-based reach detection.
const REACH_POLL: Duration = Duration::from_millis(250);
/// Consecutive missed polls before the position target is re-issued.
const REACH_RETRY_POLLS: u32 = 10;
/// Poll period for [`Drone::wait_until_ready`].
const READY_POLL: Duration = Duration::from_millis(100);

/// Ignore velocity, acceleration, force, yaw, and yaw rate.
const MASK_POSITION: u16 = 0x0ff8;
/// As [`MASK_POSITION`] but with yaw driven.
const MASK_POSITION_YAW: u16 = 0x0bf8;
/// Yaw only: position, velocity, acceleration, force, and yaw rate ignored.
const MASK_YAW: u16 = 0x0bff;

impl Drone {
    /// Arm after the prearm checks; the flight controller auto-disarms again
    /// after its idle window. `force` skips the checks.
    pub async fn arm(&self, cancel: &CancellationToken, force: bool) -> Result<(), StationError> {
        let param2 = if force { FORCE_ARM_MAGIC } else { 0.0 };
        self.command_long(
            cancel,
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [1.0, param2, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await?;
        self.status_tx.send_replace(DroneStatus::Armed);
        Ok(())
    }

    pub async fn disarm(
        &self,
        cancel: &CancellationToken,
        force: bool,
    ) -> Result<(), StationError> {
        let param2 = if force { FORCE_ARM_MAGIC } else { 0.0 };
        self.command_long(
            cancel,
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [0.0, param2, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    /// Climb to `height` meters above the current position. The drone must
    /// already be armed and in guided mode.
    pub async fn takeoff(
        &self,
        cancel: &CancellationToken,
        height: f32,
    ) -> Result<(), StationError> {
        self.command_long(
            cancel,
            MavCmd::MAV_CMD_NAV_TAKEOFF,
            [0.0, 0.0, 0.0, f32::NAN, 0.0, 0.0, height],
        )
        .await?;
        self.status_tx.send_replace(DroneStatus::TakenOff);
        Ok(())
    }

    /// Land at the current position.
    pub async fn land(&self, cancel: &CancellationToken) -> Result<(), StationError> {
        self.command_long(
            cancel,
            MavCmd::MAV_CMD_NAV_LAND,
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    /// Land at an explicit position.
    pub async fn land_at(
        &self,
        cancel: &CancellationToken,
        target: &Gps,
    ) -> Result<(), StationError> {
        let (lat, lon) = target.to_wgs84();
        self.command_int(
            cancel,
            MavFrame::MAV_FRAME_GLOBAL,
            MavCmd::MAV_CMD_NAV_LAND,
            [0.0, 0.0, 0.0, f32::NAN],
            lat,
            lon,
            target.alt,
        )
        .await
    }

    /// Return to the launch point.
    pub async fn home(&self, cancel: &CancellationToken) -> Result<(), StationError> {
        self.command_long(
            cancel,
            MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH,
            [0.0; 7],
        )
        .await
    }

    /// Pause the current mission or guided motion.
    pub async fn hold(&self, cancel: &CancellationToken) -> Result<(), StationError> {
        self.pause_or_continue(cancel, 0.0).await
    }

    /// Resume after [`Drone::hold`].
    pub async fn resume(&self, cancel: &CancellationToken) -> Result<(), StationError> {
        self.pause_or_continue(cancel, 1.0).await
    }

    async fn pause_or_continue(
        &self,
        cancel: &CancellationToken,
        param1: f32,
    ) -> Result<(), StationError> {
        self.command_long(
            cancel,
            MavCmd::MAV_CMD_DO_PAUSE_CONTINUE,
            [param1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    /// Hold position at an explicit point.
    pub async fn hold_at(
        &self,
        cancel: &CancellationToken,
        target: &Gps,
    ) -> Result<(), StationError> {
        let (lat, lon) = target.to_wgs84();
        self.command_int(
            cancel,
            MavFrame::MAV_FRAME_GLOBAL,
            MavCmd::MAV_CMD_OVERRIDE_GOTO,
            [
                MavGoto::MAV_GOTO_DO_HOLD as u32 as f32,
                MavGoto::MAV_GOTO_HOLD_AT_SPECIFIED_POSITION as u32 as f32,
                0.0,
                f32::NAN,
            ],
            lat,
            lon,
            target.alt,
        )
        .await
    }

    fn position_target(&self, target: Option<&Gps>, yaw_deg: Option<f32>) -> MavMessage {
        let (lat, lon, alt) = match target {
            Some(gps) => {
                let (lat, lon) = gps.to_wgs84();
                (lat, lon, gps.alt)
            }
            None => (0, 0, 0.0),
        };
        let type_mask = match (target, yaw_deg) {
            (Some(_), None) => MASK_POSITION,
            (Some(_), Some(_)) => MASK_POSITION_YAW,
            (None, _) => MASK_YAW,
        };
        MavMessage::SET_POSITION_TARGET_GLOBAL_INT(SET_POSITION_TARGET_GLOBAL_INT_DATA {
            time_boot_ms: 0,
            target_system: self.id(),
            target_component: self.component(),
            coordinate_frame: MavFrame::MAV_FRAME_GLOBAL_INT,
            type_mask: PositionTargetTypemask::from_bits_truncate(type_mask),
            lat_int: lat,
            lon_int: lon,
            alt,
            vx: 0.0,
            vy: 0.0,
            vz: 0.0,
            afx: 0.0,
            afy: 0.0,
            afz: 0.0,
            yaw: yaw_deg.map(f32::to_radians).unwrap_or(0.0),
            yaw_rate: 0.0,
        })
    }

    /// Command a guided-mode reposition. Does not wait for arrival.
    pub async fn move_to(&self, target: &Gps) -> Result<(), StationError> {
        self.send_message(&self.position_target(Some(target), None))
            .await
    }

    /// [`Drone::move_to`] with a commanded heading in degrees.
    pub async fn move_to_yaw(&self, target: &Gps, heading_deg: f32) -> Result<(), StationError> {
        self.send_message(&self.position_target(Some(target), Some(heading_deg)))
            .await
    }

    /// Rotate in place to a heading in degrees.
    pub async fn rotate_yaw(&self, heading_deg: f32) -> Result<(), StationError> {
        self.send_message(&self.position_target(None, Some(heading_deg)))
            .await
    }

    /// Reposition and poll until within `radius` meters of `target`. The
    /// target is re-issued after ten consecutive missed polls.
    pub async fn move_until_reached(
        &self,
        cancel: &CancellationToken,
        target: &Gps,
        radius: f32,
    ) -> Result<(), StationError> {
        self.move_to(target).await?;
        self.poll_until_reached(cancel, target, radius, None).await
    }

    /// [`Drone::move_until_reached`] with a commanded heading.
    pub async fn move_with_yaw_until_reached(
        &self,
        cancel: &CancellationToken,
        target: &Gps,
        heading_deg: f32,
        radius: f32,
    ) -> Result<(), StationError> {
        self.move_to_yaw(target, heading_deg).await?;
        self.poll_until_reached(cancel, target, radius, Some(heading_deg))
            .await
    }

    async fn poll_until_reached(
        &self,
        cancel: &CancellationToken,
        target: &Gps,
        radius: f32,
        heading_deg: Option<f32>,
    ) -> Result<(), StationError> {
        let mut misses = 0u32;
        loop {
            if let Some(current) = self.gps() {
                if current.distance_to(target) <= radius {
                    return Ok(());
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StationError::Cancelled),
                _ = self.cancel.cancelled() => return Err(StationError::Shutdown),
                _ = tokio::time::sleep(REACH_POLL) => {}
            }
            misses += 1;
            if misses >= REACH_RETRY_POLLS {
                debug!(id = self.id(), "re-issuing position target");
                match heading_deg {
                    Some(yaw) => self.move_to_yaw(target, yaw).await?,
                    None => self.move_to(target).await?,
                }
                misses = 0;
            }
        }
    }

    /// Rotate in place and poll until the heading is within `tolerance`
    /// degrees (shortest angular difference).
    pub async fn rotate_until_yaw(
        &self,
        cancel: &CancellationToken,
        heading_deg: f32,
        tolerance: f32,
    ) -> Result<(), StationError> {
        self.rotate_yaw(heading_deg).await?;
        let mut misses = 0u32;
        loop {
            if let Some(rotate) = self.rotate() {
                if angle_diff(rotate.yaw, heading_deg).abs() <= tolerance {
                    return Ok(());
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StationError::Cancelled),
                _ = self.cancel.cancelled() => return Err(StationError::Shutdown),
                _ = tokio::time::sleep(REACH_POLL) => {}
            }
            misses += 1;
            if misses >= REACH_RETRY_POLLS {
                self.rotate_yaw(heading_deg).await?;
                misses = 0;
            }
        }
    }

    /// Replace the stored mission with `path`, one waypoint per position.
    ///
    /// Items are streamed after a clear; the flight stack is expected to
    /// answer with a single MISSION_ACK rather than per-item requests.
    pub async fn set_mission(&self, path: &[Gps]) -> Result<(), StationError> {
        if path.len() > u16::MAX as usize {
            return Err(StationError::MissionTooLong(path.len()));
        }
        self.send_message(&MavMessage::MISSION_CLEAR_ALL(MISSION_CLEAR_ALL_DATA {
            target_system: self.id(),
            target_component: self.component(),
            ..Default::default()
        }))
        .await?;
        self.mission_ack_tx.send_replace(None);
        for (seq, point) in path.iter().enumerate() {
            let (lat, lon) = point.to_wgs84();
            self.send_message(&MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
                target_system: self.id(),
                target_component: self.component(),
                seq: seq as u16,
                frame: MavFrame::MAV_FRAME_GLOBAL_INT,
                command: MavCmd::MAV_CMD_NAV_WAYPOINT,
                current: 0,
                autocontinue: 1,
                x: lat,
                y: lon,
                z: point.alt,
                ..Default::default()
            }))
            .await?;
        }
        Ok(())
    }

    /// Run the stored mission from item `start_id` through `end_id`.
    pub async fn start_mission(
        &self,
        cancel: &CancellationToken,
        start_id: u16,
        end_id: u16,
    ) -> Result<(), StationError> {
        self.command_long(
            cancel,
            MavCmd::MAV_CMD_MISSION_START,
            [start_id as f32, end_id as f32, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await?;
        self.mission_ack_tx.send_replace(None);
        Ok(())
    }

    /// Wait until the mission is accepted and waypoint `id` is reported
    /// reached.
    pub async fn wait_until_arrived(
        &self,
        cancel: &CancellationToken,
        id: i32,
    ) -> Result<(), StationError> {
        let mut ack_rx = self.mission_ack_tx.subscribe();
        let ack = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StationError::Cancelled),
            _ = self.cancel.cancelled() => return Err(StationError::Shutdown),
            ack = ack_rx.wait_for(|ack| ack.is_some()) => {
                (*ack.map_err(|_| StationError::Shutdown)?).expect("ack present")
            }
        };
        if ack != MavMissionResult::MAV_MISSION_ACCEPTED {
            return Err(StationError::MissionResult(ack));
        }
        let mut reached_rx = self.mission_reached_tx.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StationError::Cancelled),
            _ = self.cancel.cancelled() => Err(StationError::Shutdown),
            reached = reached_rx.wait_for(|reached| *reached == id) => {
                reached.map(|_| ()).map_err(|_| StationError::Shutdown)
            }
        }
    }

    /// Poll until within `radius` meters of `target` without commanding any
    /// motion.
    pub async fn wait_until_reached(
        &self,
        cancel: &CancellationToken,
        target: &Gps,
        radius: f32,
    ) -> Result<(), StationError> {
        loop {
            if let Some(current) = self.gps() {
                if current.distance_to(target) <= radius {
                    return Ok(());
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StationError::Cancelled),
                _ = self.cancel.cancelled() => return Err(StationError::Shutdown),
                _ = tokio::time::sleep(REACH_POLL) => {}
            }
        }
    }

    /// Poll until the drone reports [`DroneStatus::Ready`].
    pub async fn wait_until_ready(&self, cancel: &CancellationToken) -> Result<(), StationError> {
        loop {
            if self.status() == DroneStatus::Ready {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StationError::Cancelled),
                _ = self.cancel.cancelled() => return Err(StationError::Shutdown),
                _ = tokio::time::sleep(READY_POLL) => {}
            }
        }
    }

    /// Switch the flight mode (ArduPilot custom mode number).
    pub async fn update_mode(
        &self,
        cancel: &CancellationToken,
        mode: u32,
    ) -> Result<(), StationError> {
        // param1: MAV_MODE_FLAG_CUSTOM_MODE_ENABLED
        self.command_long(
            cancel,
            MavCmd::MAV_CMD_DO_SET_MODE,
            [1.0, mode as f32, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    /// Set the home position: the current location when `target` is `None`,
    /// an explicit position otherwise.
    pub async fn update_home(
        &self,
        cancel: &CancellationToken,
        target: Option<&Gps>,
    ) -> Result<(), StationError> {
        match target {
            None => {
                self.command_long(
                    cancel,
                    MavCmd::MAV_CMD_DO_SET_HOME,
                    [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                )
                .await
            }
            Some(gps) => {
                let (lat, lon) = gps.to_wgs84();
                self.command_int(
                    cancel,
                    MavFrame::MAV_FRAME_GLOBAL,
                    MavCmd::MAV_CMD_DO_SET_HOME,
                    [0.0, 0.0, 0.0, f32::NAN],
                    lat,
                    lon,
                    gps.alt,
                )
                .await
            }
        }
    }

    /// Light the status LED with `color` for `duration` (clipped to the
    /// 65535 ms the message can carry). Does not wait for an ack.
    pub async fn active_led(
        &self,
        color: Color,
        duration: Duration,
    ) -> Result<(), StationError> {
        let millis = duration.as_millis().min(u16::MAX as u128) as u16;
        let mut custom_bytes = [0u8; 24];
        custom_bytes[0] = color.r;
        custom_bytes[1] = color.g;
        custom_bytes[2] = color.b;
        custom_bytes[3..5].copy_from_slice(&millis.to_le_bytes());
        self.send_message(&MavMessage::LED_CONTROL(LED_CONTROL_DATA {
            target_system: self.id(),
            target_component: self.component(),
            instance: 42,
            // LED_CONTROL_PATTERN_CUSTOM
            pattern: 255,
            custom_len: 5,
            custom_bytes,
        }))
        .await?;
        *self.led_color.lock().expect("led lock") = Some(color);
        Ok(())
    }
}
