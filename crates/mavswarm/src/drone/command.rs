//! Request/confirm/ack protocol engine: one in-flight command per MAV_CMD,
//! long-form retransmission on a fixed ping, progress fan-out, and typed
//! message requests.

use mavlink::ardupilotmega::{
    MavCmd, MavFrame, MavMessage, MavResult, COMMAND_ACK_DATA, COMMAND_INT_DATA,
    COMMAND_LONG_DATA,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{Drone, SinkEntry, MSG_ID_HOME_POSITION, MSG_ID_SYSTEM_TIME};
use crate::error::StationError;

/// Acks buffered per in-flight command; retransmission duplicates beyond
/// this are dropped rather than blocking ingest.
const ACK_SINK_DEPTH: usize = 4;

/// Frees the pending-ack slot when the waiting future completes or is
/// dropped mid-flight. The token check keeps a late drop from evicting a
/// successor that already claimed the slot.
struct AckGuard<'a> {
    drone: &'a Drone,
    cmd: MavCmd,
    token: u64,
}

impl Drop for AckGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.drone.pending_acks.lock().expect("ack lock");
        if pending
            .get(&(self.cmd as u32))
            .is_some_and(|entry| entry.token == self.token)
        {
            pending.remove(&(self.cmd as u32));
        }
    }
}

struct RequestGuard<'a> {
    drone: &'a Drone,
    message_id: u32,
    token: u64,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.drone.pending_requests.lock().expect("request lock");
        if pending
            .get(&self.message_id)
            .is_some_and(|entry| entry.token == self.token)
        {
            pending.remove(&self.message_id);
        }
    }
}

impl Drone {
    fn install_ack_sink(
        &self,
        cmd: MavCmd,
    ) -> Result<(mpsc::Receiver<COMMAND_ACK_DATA>, AckGuard<'_>), StationError> {
        let mut pending = self.pending_acks.lock().expect("ack lock");
        if pending.contains_key(&(cmd as u32)) {
            return Err(StationError::CommandPending(cmd));
        }
        let token = self
            .sink_token
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(ACK_SINK_DEPTH);
        pending.insert(cmd as u32, SinkEntry { token, tx });
        Ok((
            rx,
            AckGuard {
                drone: self,
                cmd,
                token,
            },
        ))
    }

    async fn send_long_frame(
        &self,
        cmd: MavCmd,
        confirmation: u8,
        params: [f32; 7],
    ) -> Result<(), StationError> {
        self.send_message(&MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: self.id(),
            target_component: self.component(),
            command: cmd,
            confirmation,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        }))
        .await
    }

    /// Fire a COMMAND_INT and wait for its ack. Fails fast with
    /// [`StationError::CommandPending`] while an earlier command with the
    /// same code is outstanding.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_command_int(
        &self,
        cancel: &CancellationToken,
        frame: MavFrame,
        cmd: MavCmd,
        params: [f32; 4],
        x: i32,
        y: i32,
        z: f32,
    ) -> Result<COMMAND_ACK_DATA, StationError> {
        let (mut rx, _guard) = self.install_ack_sink(cmd)?;
        self.send_message(&MavMessage::COMMAND_INT(COMMAND_INT_DATA {
            target_system: self.id(),
            target_component: self.component(),
            frame,
            command: cmd,
            current: 0,
            autocontinue: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            x,
            y,
            z,
        }))
        .await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StationError::Cancelled),
            _ = self.cancel.cancelled() => Err(StationError::Shutdown),
            ack = rx.recv() => ack.ok_or(StationError::Shutdown),
        }
    }

    /// Fire a COMMAND_LONG and wait for a final ack, retransmitting with an
    /// incremented confirmation counter until the first ack arrives.
    /// IN_PROGRESS acks go to `progress` (when given) and stop the
    /// retransmission; the final ack is then awaited without a deadline.
    pub async fn send_command_long(
        &self,
        cancel: &CancellationToken,
        progress: Option<&mpsc::Sender<COMMAND_ACK_DATA>>,
        cmd: MavCmd,
        params: [f32; 7],
    ) -> Result<COMMAND_ACK_DATA, StationError> {
        let (mut rx, _guard) = self.install_ack_sink(cmd)?;
        self.drive_command_long(cancel, progress, cmd, params, &mut rx)
            .await
    }

    async fn drive_command_long(
        &self,
        cancel: &CancellationToken,
        progress: Option<&mpsc::Sender<COMMAND_ACK_DATA>>,
        cmd: MavCmd,
        params: [f32; 7],
        rx: &mut mpsc::Receiver<COMMAND_ACK_DATA>,
    ) -> Result<COMMAND_ACK_DATA, StationError> {
        self.send_long_frame(cmd, 0, params).await?;

        let mut confirmation: u8 = 0;
        let mut ack = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StationError::Cancelled),
                _ = self.cancel.cancelled() => return Err(StationError::Shutdown),
                ack = rx.recv() => break ack.ok_or(StationError::Shutdown)?,
                _ = tokio::time::sleep(self.command_ping) => {
                    confirmation = confirmation.wrapping_add(1);
                    trace!(id = self.id(), ?cmd, confirmation, "command retransmit");
                    self.send_long_frame(cmd, confirmation, params).await?;
                }
            }
        };

        loop {
            if ack.result != MavResult::MAV_RESULT_IN_PROGRESS {
                return Ok(ack);
            }
            if let Some(progress) = progress {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(StationError::Cancelled),
                    _ = self.cancel.cancelled() => return Err(StationError::Shutdown),
                    _ = progress.send(ack.clone()) => {}
                }
            }
            ack = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StationError::Cancelled),
                _ = self.cancel.cancelled() => return Err(StationError::Shutdown),
                ack = rx.recv() => ack.ok_or(StationError::Shutdown)?,
            };
        }
    }

    /// [`Drone::send_command_int`] with the ack result checked.
    #[allow(clippy::too_many_arguments)]
    pub async fn command_int(
        &self,
        cancel: &CancellationToken,
        frame: MavFrame,
        cmd: MavCmd,
        params: [f32; 4],
        x: i32,
        y: i32,
        z: f32,
    ) -> Result<(), StationError> {
        let ack = self
            .send_command_int(cancel, frame, cmd, params, x, y, z)
            .await?;
        accepted(&ack)
    }

    /// [`Drone::send_command_long`] with the ack result checked.
    pub async fn command_long(
        &self,
        cancel: &CancellationToken,
        cmd: MavCmd,
        params: [f32; 7],
    ) -> Result<(), StationError> {
        let ack = self.send_command_long(cancel, None, cmd, params).await?;
        accepted(&ack)
    }

    /// Ask the flight controller to emit message `message_id` once and wait
    /// for it. At most one outstanding request per message id.
    pub async fn request_message(
        &self,
        cancel: &CancellationToken,
        message_id: u32,
    ) -> Result<MavMessage, StationError> {
        let (rx, _guard) = {
            let mut pending = self.pending_requests.lock().expect("request lock");
            if pending.contains_key(&message_id) {
                return Err(StationError::RequestPending(message_id));
            }
            let token = self
                .sink_token
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            pending.insert(message_id, SinkEntry { token, tx });
            (
                rx,
                RequestGuard {
                    drone: self,
                    message_id,
                    token,
                },
            )
        };

        // Fire-and-forget on purpose: the answer we want is the message
        // itself, and concurrent requests must not collide on the
        // REQUEST_MESSAGE ack slot.
        self.send_long_frame(
            MavCmd::MAV_CMD_REQUEST_MESSAGE,
            0,
            [message_id as f32, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        )
        .await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StationError::Cancelled),
            _ = self.cancel.cancelled() => Err(StationError::Shutdown),
            msg = rx => msg.map_err(|_| StationError::Shutdown),
        }
    }

    /// Probe the drone: request SYSTEM_TIME and HOME_POSITION concurrently,
    /// refreshing the boot-time and home caches. Errors from both legs are
    /// joined.
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<(), StationError> {
        let (time, home) = tokio::join!(
            self.request_message(cancel, MSG_ID_SYSTEM_TIME),
            self.request_message(cancel, MSG_ID_HOME_POSITION),
        );
        let mut errors: Vec<StationError> = Vec::new();
        if let Err(err) = time {
            errors.push(err);
        }
        if let Err(err) = home {
            errors.push(err);
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.pop().expect("one error")),
            _ => Err(StationError::Multiple(errors)),
        }
    }
}

fn accepted(ack: &COMMAND_ACK_DATA) -> Result<(), StationError> {
    if ack.result == MavResult::MAV_RESULT_ACCEPTED {
        Ok(())
    } else {
        Err(StationError::CommandResult(ack.result))
    }
}
