//! A scriptable simulated flight controller for integration tests. It speaks
//! real MAVLink over UDP against a running [`Controller`](crate::Controller):
//! streams heartbeat/telemetry, acks commands, teleports to position targets,
//! and answers message requests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mavlink::ardupilotmega::{
    GpsFixType, MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavResult, MavState, MavType,
    MavMissionResult, ATTITUDE_DATA, BATTERY_STATUS_DATA, COMMAND_ACK_DATA,
    COMMAND_LONG_DATA, GLOBAL_POSITION_INT_DATA, GPS_RAW_INT_DATA, HEARTBEAT_DATA,
    HOME_POSITION_DATA, MISSION_ACK_DATA, MISSION_ITEM_REACHED_DATA, SYSTEM_TIME_DATA,
    TIMESYNC_DATA, VIBRATION_DATA,
};
use mavlink::{AsyncMavConnection, MavHeader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::geo::Gps;

#[derive(Debug, Clone)]
pub struct SimDroneConfig {
    pub system_id: u8,
    pub component_id: u8,
    pub heartbeat_interval: Duration,
    pub telemetry_interval: Duration,
    pub position: Gps,
    pub fix_type: GpsFixType,
    pub satellites: u8,
    /// Battery voltage in volts.
    pub battery_voltage: f32,
    /// Drop the first N COMMAND_LONG frames of the given command codes
    /// without acking; exercises the station's retransmission path.
    pub ignore_first: Vec<(MavCmd, u32)>,
    /// Ack MAV_CMD codes in this list with MAV_RESULT_FAILED.
    pub reject_commands: Vec<MavCmd>,
    /// Pace of MISSION_ITEM_REACHED reports after MISSION_START.
    pub reached_interval: Duration,
}

impl Default for SimDroneConfig {
    fn default() -> Self {
        Self {
            system_id: 1,
            component_id: 1,
            heartbeat_interval: Duration::from_millis(100),
            telemetry_interval: Duration::from_millis(50),
            position: Gps::new(47.397742, 8.545594, 488.0),
            fix_type: GpsFixType::GPS_FIX_TYPE_RTK_FIXED,
            satellites: 14,
            battery_voltage: 16.2,
            ignore_first: Vec::new(),
            reject_commands: Vec::new(),
            reached_interval: Duration::from_millis(50),
        }
    }
}

struct SimState {
    config: SimDroneConfig,
    armed: AtomicBool,
    custom_mode: AtomicU32,
    position: Mutex<Gps>,
    yaw_deg: Mutex<f32>,
    ground_alt: f32,
    ignore_budget: Mutex<std::collections::HashMap<u32, u32>>,
    received: Mutex<Vec<MavMessage>>,
    received_count: watch::Sender<usize>,
    cancel: CancellationToken,
}

/// Handle to a running simulated drone.
pub struct SimDrone {
    state: Arc<SimState>,
}

impl Drop for SimDrone {
    fn drop(&mut self) {
        self.state.cancel.cancel();
    }
}

impl SimDrone {
    /// Connect to a station UDP endpoint (`host:port` of a `UdpServer`).
    pub async fn connect(addr: &str, config: SimDroneConfig) -> std::io::Result<Self> {
        let conn: Arc<Box<dyn AsyncMavConnection<MavMessage> + Sync + Send>> = Arc::new(
            mavlink::connect_async::<MavMessage>(&format!("udpout:{addr}")).await?,
        );
        let ignore_budget = config
            .ignore_first
            .iter()
            .map(|&(cmd, n)| (cmd as u32, n))
            .collect();
        let state = Arc::new(SimState {
            ground_alt: config.position.alt,
            ignore_budget: Mutex::new(ignore_budget),
            armed: AtomicBool::new(false),
            custom_mode: AtomicU32::new(0),
            position: Mutex::new(config.position),
            yaw_deg: Mutex::new(0.0),
            received: Mutex::new(Vec::new()),
            received_count: watch::channel(0).0,
            cancel: CancellationToken::new(),
            config,
        });

        tokio::spawn(heartbeat_loop(state.clone(), conn.clone()));
        tokio::spawn(telemetry_loop(state.clone(), conn.clone()));
        tokio::spawn(recv_loop(state.clone(), conn));

        Ok(Self { state })
    }

    pub fn system_id(&self) -> u8 {
        self.state.config.system_id
    }

    pub fn position(&self) -> Gps {
        *self.state.position.lock().expect("position lock")
    }

    pub fn is_armed(&self) -> bool {
        self.state.armed.load(Ordering::Acquire)
    }

    pub fn custom_mode(&self) -> u32 {
        self.state.custom_mode.load(Ordering::Acquire)
    }

    /// Snapshot of every message received from the station so far.
    pub fn received(&self) -> Vec<MavMessage> {
        self.state.received.lock().expect("received lock").clone()
    }

    pub fn received_matching<F>(&self, mut pred: F) -> usize
    where
        F: FnMut(&MavMessage) -> bool,
    {
        self.received().iter().filter(|m| pred(m)).count()
    }

    /// Wait until `pred` matches any received message, up to `timeout`.
    pub async fn wait_received<F>(&self, mut pred: F, timeout: Duration) -> bool
    where
        F: FnMut(&MavMessage) -> bool,
    {
        let mut count_rx = self.state.received_count.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut checked = 0usize;
        loop {
            {
                let received = self.state.received.lock().expect("received lock");
                if received[checked..].iter().any(&mut pred) {
                    return true;
                }
                checked = received.len();
            }
            tokio::select! {
                _ = &mut deadline => return false,
                changed = count_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Stop all traffic, simulating a powered-off drone.
    pub fn stop(&self) {
        self.state.cancel.cancel();
    }
}

fn header(state: &SimState) -> MavHeader {
    MavHeader {
        system_id: state.config.system_id,
        component_id: state.config.component_id,
        sequence: 0,
    }
}

async fn send(
    state: &SimState,
    conn: &Arc<Box<dyn AsyncMavConnection<MavMessage> + Sync + Send>>,
    msg: MavMessage,
) {
    let _ = conn.send(&header(state), &msg).await;
}

async fn heartbeat_loop(
    state: Arc<SimState>,
    conn: Arc<Box<dyn AsyncMavConnection<MavMessage> + Sync + Send>>,
) {
    let mut ticker = tokio::time::interval(state.config.heartbeat_interval);
    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let armed = state.armed.load(Ordering::Acquire);
        let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: state.custom_mode.load(Ordering::Acquire),
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode: if armed {
                MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED
            } else {
                MavModeFlag::empty()
            },
            system_status: if armed {
                MavState::MAV_STATE_ACTIVE
            } else {
                MavState::MAV_STATE_STANDBY
            },
            mavlink_version: 3,
        });
        send(&state, &conn, msg).await;
    }
}

async fn telemetry_loop(
    state: Arc<SimState>,
    conn: Arc<Box<dyn AsyncMavConnection<MavMessage> + Sync + Send>>,
) {
    let mut ticker = tokio::time::interval(state.config.telemetry_interval);
    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let pos = *state.position.lock().expect("position lock");
        let yaw = *state.yaw_deg.lock().expect("yaw lock");
        let (lat, lon) = pos.to_wgs84();
        send(
            &state,
            &conn,
            MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
                time_boot_ms: 0,
                lat,
                lon,
                alt: pos.alt_mm(),
                relative_alt: ((pos.alt - state.ground_alt) * 1000.0) as i32,
                vx: 0,
                vy: 0,
                vz: 0,
                hdg: u16::MAX,
            }),
        )
        .await;
        send(
            &state,
            &conn,
            MavMessage::GPS_RAW_INT(GPS_RAW_INT_DATA {
                fix_type: state.config.fix_type,
                lat,
                lon,
                alt: pos.alt_mm(),
                eph: 100,
                epv: 100,
                vel: 0,
                cog: 0,
                satellites_visible: state.config.satellites,
                time_usec: 0,
                ..Default::default()
            }),
        )
        .await;
        send(
            &state,
            &conn,
            MavMessage::ATTITUDE(ATTITUDE_DATA {
                time_boot_ms: 0,
                roll: 0.0,
                pitch: 0.0,
                yaw: yaw.to_radians(),
                rollspeed: 0.0,
                pitchspeed: 0.0,
                yawspeed: 0.0,
            }),
        )
        .await;
        let mut battery = BATTERY_STATUS_DATA {
            current_battery: 120,
            battery_remaining: 87,
            ..Default::default()
        };
        battery.voltages = [u16::MAX; 10];
        battery.voltages[0] = (state.config.battery_voltage * 1000.0) as u16;
        send(&state, &conn, MavMessage::BATTERY_STATUS(battery)).await;
    }
}

async fn recv_loop(
    state: Arc<SimState>,
    conn: Arc<Box<dyn AsyncMavConnection<MavMessage> + Sync + Send>>,
) {
    loop {
        let received = tokio::select! {
            _ = state.cancel.cancelled() => return,
            received = conn.recv() => received,
        };
        let (head, msg) = match received {
            Ok(pair) => pair,
            Err(_) => continue,
        };
        // Only react to frames addressed to us from the station side.
        if head.system_id == state.config.system_id {
            continue;
        }
        {
            let mut received = state.received.lock().expect("received lock");
            received.push(msg.clone());
            let len = received.len();
            drop(received);
            state.received_count.send_replace(len);
        }
        handle(&state, &conn, msg).await;
    }
}

async fn handle(
    state: &Arc<SimState>,
    conn: &Arc<Box<dyn AsyncMavConnection<MavMessage> + Sync + Send>>,
    msg: MavMessage,
) {
    match msg {
        MavMessage::COMMAND_LONG(cmd) => {
            if cmd.target_system != state.config.system_id {
                return;
            }
            {
                let mut budgets = state.ignore_budget.lock().expect("budget lock");
                if let Some(remaining) = budgets.get_mut(&(cmd.command as u32)) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return;
                    }
                }
            }
            run_command_long(state, conn, &cmd).await;
        }
        MavMessage::COMMAND_INT(cmd) => {
            if cmd.target_system != state.config.system_id {
                return;
            }
            ack(state, conn, cmd.command, result_for(state, cmd.command)).await;
        }
        MavMessage::SET_POSITION_TARGET_GLOBAL_INT(target) => {
            if target.target_system != state.config.system_id {
                return;
            }
            let mask = target.type_mask.bits();
            if mask & 0x0007 == 0 {
                *state.position.lock().expect("position lock") =
                    Gps::from_wgs84(target.lat_int, target.lon_int, (target.alt * 1000.0) as i32);
            }
            if mask & 0x0400 == 0 {
                *state.yaw_deg.lock().expect("yaw lock") = target.yaw.to_degrees();
            }
        }
        MavMessage::MISSION_ITEM_INT(item) => {
            if item.target_system != state.config.system_id {
                return;
            }
            send(
                state,
                conn,
                MavMessage::MISSION_ACK(MISSION_ACK_DATA {
                    target_system: 0,
                    target_component: 0,
                    mavtype: MavMissionResult::MAV_MISSION_ACCEPTED,
                    ..Default::default()
                }),
            )
            .await;
        }
        MavMessage::TIMESYNC(ts) => {
            if ts.tc1 == 0 {
                send(
                    state,
                    conn,
                    MavMessage::TIMESYNC(TIMESYNC_DATA {
                        tc1: 1,
                        ts1: ts.ts1,
                        ..Default::default()
                    }),
                )
                .await;
            }
        }
        _ => {}
    }
}

fn result_for(state: &SimState, cmd: MavCmd) -> MavResult {
    if state.config.reject_commands.contains(&cmd) {
        MavResult::MAV_RESULT_FAILED
    } else {
        MavResult::MAV_RESULT_ACCEPTED
    }
}

async fn ack(
    state: &Arc<SimState>,
    conn: &Arc<Box<dyn AsyncMavConnection<MavMessage> + Sync + Send>>,
    cmd: MavCmd,
    result: MavResult,
) {
    send(
        state,
        conn,
        MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
            command: cmd,
            result,
            ..Default::default()
        }),
    )
    .await;
}

async fn run_command_long(
    state: &Arc<SimState>,
    conn: &Arc<Box<dyn AsyncMavConnection<MavMessage> + Sync + Send>>,
    cmd: &COMMAND_LONG_DATA,
) {
    let result = result_for(state, cmd.command);
    match cmd.command {
        MavCmd::MAV_CMD_COMPONENT_ARM_DISARM => {
            if result == MavResult::MAV_RESULT_ACCEPTED {
                state.armed.store(cmd.param1 >= 0.5, Ordering::Release);
            }
        }
        MavCmd::MAV_CMD_DO_SET_MODE => {
            if result == MavResult::MAV_RESULT_ACCEPTED {
                state
                    .custom_mode
                    .store(cmd.param2 as u32, Ordering::Release);
            }
        }
        MavCmd::MAV_CMD_NAV_TAKEOFF => {
            if result == MavResult::MAV_RESULT_ACCEPTED {
                let mut pos = state.position.lock().expect("position lock");
                pos.alt += cmd.param7;
            }
        }
        MavCmd::MAV_CMD_NAV_LAND => {
            if result == MavResult::MAV_RESULT_ACCEPTED {
                state.position.lock().expect("position lock").alt = state.ground_alt;
                state.armed.store(false, Ordering::Release);
            }
        }
        MavCmd::MAV_CMD_MISSION_START => {
            if result == MavResult::MAV_RESULT_ACCEPTED {
                // Accept the run, then report waypoints reached one by one.
                let start = cmd.param1 as u16;
                let end = cmd.param2 as u16;
                let state = state.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    // The station clears its ack cache right after the
                    // command resolves; report acceptance a beat later, like
                    // a real mission engine.
                    tokio::select! {
                        _ = state.cancel.cancelled() => return,
                        _ = tokio::time::sleep(state.config.reached_interval) => {}
                    }
                    send(
                        &state,
                        &conn,
                        MavMessage::MISSION_ACK(MISSION_ACK_DATA {
                            target_system: 0,
                            target_component: 0,
                            mavtype: MavMissionResult::MAV_MISSION_ACCEPTED,
                            ..Default::default()
                        }),
                    )
                    .await;
                    for seq in start..=end {
                        tokio::select! {
                            _ = state.cancel.cancelled() => return,
                            _ = tokio::time::sleep(state.config.reached_interval) => {}
                        }
                        send(
                            &state,
                            &conn,
                            MavMessage::MISSION_ITEM_REACHED(MISSION_ITEM_REACHED_DATA {
                                seq,
                            }),
                        )
                        .await;
                    }
                });
            }
        }
        MavCmd::MAV_CMD_REQUEST_MESSAGE => {
            answer_request(state, conn, cmd.param1 as u32).await;
        }
        _ => {}
    }
    ack(state, conn, cmd.command, result).await;
}

async fn answer_request(
    state: &Arc<SimState>,
    conn: &Arc<Box<dyn AsyncMavConnection<MavMessage> + Sync + Send>>,
    message_id: u32,
) {
    match message_id {
        // SYSTEM_TIME
        2 => {
            let unix_us = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros() as u64)
                .unwrap_or(0);
            send(
                state,
                conn,
                MavMessage::SYSTEM_TIME(SYSTEM_TIME_DATA {
                    time_unix_usec: unix_us,
                    time_boot_ms: 60_000,
                }),
            )
            .await;
        }
        // HOME_POSITION
        242 => {
            let pos = *state.position.lock().expect("position lock");
            let (lat, lon) = pos.to_wgs84();
            send(
                state,
                conn,
                MavMessage::HOME_POSITION(HOME_POSITION_DATA {
                    latitude: lat,
                    longitude: lon,
                    altitude: pos.alt_mm(),
                    ..Default::default()
                }),
            )
            .await;
        }
        // VIBRATION
        241 => {
            send(
                state,
                conn,
                MavMessage::VIBRATION(VIBRATION_DATA {
                    time_usec: 0,
                    vibration_x: 0.5,
                    vibration_y: 0.5,
                    vibration_z: 0.5,
                    clipping_0: 0,
                    clipping_1: 0,
                    clipping_2: 0,
                }),
            )
            .await;
        }
        _ => {}
    }
}
