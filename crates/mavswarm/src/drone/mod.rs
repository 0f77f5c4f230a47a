mod actions;
mod command;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mavlink::ardupilotmega::{
    GpsFixType, MavMessage, MavResult, COMMAND_ACK_DATA, COMMAND_LONG_DATA, MavCmd,
    MavMissionResult, TIMESYNC_DATA,
};
use mavlink::{MavHeader, Message};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::StationConfig;
use crate::controller::Link;
use crate::error::StationError;
use crate::events::Event;
use crate::geo::{Color, Gps, Rotate};
use crate::status::DroneStatus;

/// MAVLink message ids the station asks for by number.
pub(crate) const MSG_ID_SYSTEM_TIME: u32 = 2;
pub(crate) const MSG_ID_ATTITUDE: u32 = 30;
pub(crate) const MSG_ID_BATTERY_STATUS: u32 = 147;
pub(crate) const MSG_ID_HOME_POSITION: u32 = 242;

/// Battery snapshot in volts, amperes, and remaining fraction. Fields the
/// flight controller reports as unknown are `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryStat {
    pub voltage: f32,
    pub current: f32,
    pub remaining: f32,
}

/// Wind estimate from the flight controller, direction in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Wind {
    pub direction: f32,
    pub speed: f32,
    pub speed_z: f32,
}

/// Pending-sink table entry. The token ties a waiter to its own entry so a
/// late cleanup cannot evict a successor that reused the slot.
pub(crate) struct SinkEntry<T> {
    pub(crate) token: u64,
    pub(crate) tx: T,
}

/// One observed flight controller.
///
/// A `Drone` is created by the [`Controller`](crate::Controller) on the first
/// frame from a new system id and lives for the controller's lifetime;
/// disconnection only resets its status. All public waiting operations take a
/// `CancellationToken` and stop early when it or the controller fires.
pub struct Drone {
    id: u8,
    component: u8,
    station_system_id: u8,
    station_component_id: u8,
    command_ping: Duration,

    link: RwLock<Arc<Link>>,
    event_tx: mpsc::Sender<Event>,
    pub(crate) cancel: CancellationToken,

    alive: AtomicBool,
    activity_tx: watch::Sender<Instant>,

    status_tx: watch::Sender<DroneStatus>,
    custom_mode: AtomicU32,
    gps_tx: watch::Sender<Option<Gps>>,
    gps_type_tx: watch::Sender<GpsFixType>,
    rotate_tx: watch::Sender<Option<Rotate>>,
    battery_tx: watch::Sender<Option<BatteryStat>>,
    home_tx: watch::Sender<Option<Gps>>,
    satellites: AtomicU32,
    /// Estimated unix epoch of the flight controller boot, microseconds.
    boot_time_us: AtomicU64,
    /// Half round-trip time, microseconds.
    ping_us: AtomicU64,
    /// Outstanding TIMESYNC ts1 (station boot nanoseconds), 0 when none.
    timesync_id: AtomicI64,
    led_color: Mutex<Option<Color>>,
    free_memory: AtomicU32,
    wind_tx: watch::Sender<Option<Wind>>,

    pub(crate) sink_token: AtomicU64,
    pub(crate) pending_acks: Mutex<HashMap<u32, SinkEntry<mpsc::Sender<COMMAND_ACK_DATA>>>>,
    pub(crate) pending_requests: Mutex<HashMap<u32, SinkEntry<oneshot::Sender<MavMessage>>>>,
    mission_ack_tx: watch::Sender<Option<MavMissionResult>>,
    mission_reached_tx: watch::Sender<i32>,
}

impl std::fmt::Debug for Drone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drone")
            .field("id", &self.id)
            .field("component", &self.component)
            .field("status", &self.status())
            .finish()
    }
}

impl Drone {
    /// Create the drone and start its liveness watchdog.
    pub(crate) fn spawn(
        id: u8,
        component: u8,
        link: Arc<Link>,
        event_tx: mpsc::Sender<Event>,
        config: &StationConfig,
        parent_cancel: &CancellationToken,
    ) -> Arc<Self> {
        let (activity_tx, activity_rx) = watch::channel(Instant::now());
        let drone = Arc::new(Self {
            id,
            component,
            station_system_id: config.system_id,
            station_component_id: config.component_id,
            command_ping: config.command_ping,
            link: RwLock::new(link),
            event_tx,
            cancel: parent_cancel.child_token(),
            alive: AtomicBool::new(false),
            activity_tx,
            status_tx: watch::channel(DroneStatus::None).0,
            custom_mode: AtomicU32::new(0),
            gps_tx: watch::channel(None).0,
            gps_type_tx: watch::channel(GpsFixType::GPS_FIX_TYPE_NO_GPS).0,
            rotate_tx: watch::channel(None).0,
            battery_tx: watch::channel(None).0,
            home_tx: watch::channel(None).0,
            satellites: AtomicU32::new(0),
            boot_time_us: AtomicU64::new(0),
            ping_us: AtomicU64::new(0),
            timesync_id: AtomicI64::new(0),
            led_color: Mutex::new(None),
            free_memory: AtomicU32::new(0),
            wind_tx: watch::channel(None).0,
            sink_token: AtomicU64::new(0),
            pending_acks: Mutex::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
            mission_ack_tx: watch::channel(None).0,
            mission_reached_tx: watch::channel(-1).0,
        });
        tokio::spawn(Self::watchdog(
            drone.clone(),
            activity_rx,
            config.inactive_timeout,
        ));
        drone
    }

    /// Liveness watchdog: flips `alive` exactly once per lapse and emits the
    /// disconnect event. Re-armed by every ingested message.
    async fn watchdog(
        drone: Arc<Drone>,
        mut activity_rx: watch::Receiver<Instant>,
        timeout: Duration,
    ) {
        loop {
            let deadline = *activity_rx.borrow_and_update() + timeout;
            tokio::select! {
                _ = drone.cancel.cancelled() => return,
                changed = activity_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if drone
                        .alive
                        .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        drone.status_tx.send_replace(DroneStatus::None);
                        debug!(id = drone.id, "drone inactive");
                        drone
                            .emit(Event::DroneDisconnected {
                                drone: drone.clone(),
                            })
                            .await;
                    }
                    // Park until traffic resumes.
                    if activity_rx.changed().await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    // --- Identity and cached telemetry ---

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn component(&self) -> u8 {
        self.component
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn last_activate(&self) -> Instant {
        *self.activity_tx.borrow()
    }

    pub fn status(&self) -> DroneStatus {
        *self.status_tx.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<DroneStatus> {
        self.status_tx.subscribe()
    }

    pub fn custom_mode(&self) -> u32 {
        self.custom_mode.load(Ordering::Acquire)
    }

    pub fn gps(&self) -> Option<Gps> {
        *self.gps_tx.borrow()
    }

    pub fn gps_watch(&self) -> watch::Receiver<Option<Gps>> {
        self.gps_tx.subscribe()
    }

    pub fn gps_type(&self) -> GpsFixType {
        *self.gps_type_tx.borrow()
    }

    pub fn rotate(&self) -> Option<Rotate> {
        *self.rotate_tx.borrow()
    }

    pub fn battery(&self) -> Option<BatteryStat> {
        *self.battery_tx.borrow()
    }

    pub fn battery_watch(&self) -> watch::Receiver<Option<BatteryStat>> {
        self.battery_tx.subscribe()
    }

    pub fn home_position(&self) -> Option<Gps> {
        *self.home_tx.borrow()
    }

    pub fn satellite_count(&self) -> u32 {
        self.satellites.load(Ordering::Acquire)
    }

    /// Estimated unix time of the flight controller boot, in microseconds.
    /// Accurate to roughly one ping.
    pub fn boot_time_us(&self) -> Option<u64> {
        match self.boot_time_us.load(Ordering::Acquire) {
            0 => None,
            us => Some(us),
        }
    }

    /// Last measured half round-trip to the flight controller.
    pub fn ping_duration(&self) -> Option<Duration> {
        match self.ping_us.load(Ordering::Acquire) {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    pub fn led_color(&self) -> Option<Color> {
        *self.led_color.lock().expect("led lock")
    }

    pub fn free_memory(&self) -> u32 {
        self.free_memory.load(Ordering::Acquire)
    }

    pub fn wind(&self) -> Option<Wind> {
        *self.wind_tx.borrow()
    }

    pub fn mission_reached(&self) -> i32 {
        *self.mission_reached_tx.borrow()
    }

    // --- Outbound ---

    pub(crate) fn update_link(&self, link: &Arc<Link>) {
        let mut slot = self.link.write().expect("link lock");
        if !Arc::ptr_eq(&*slot, link) {
            *slot = link.clone();
        }
    }

    fn header(&self) -> MavHeader {
        MavHeader {
            system_id: self.station_system_id,
            component_id: self.station_component_id,
            sequence: 0,
        }
    }

    /// Write one message to the link this drone was last seen on.
    pub async fn send_message(&self, msg: &MavMessage) -> Result<(), StationError> {
        let link = self.link.read().expect("link lock").clone();
        link.send(&self.header(), msg).await
    }

    async fn emit(&self, event: Event) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.event_tx.send(event) => {}
        }
    }

    // --- Ingest ---

    /// Ingest one routed message. Called by the single router consumer, so
    /// state mutations here are totally ordered per drone.
    pub(crate) async fn handle_message(self: Arc<Self>, msg: &MavMessage) {
        self.activity_tx.send_replace(Instant::now());
        if self
            .alive
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(id = self.id, "drone connected");
            self.emit(Event::DroneConnected {
                drone: self.clone(),
            })
            .await;
            let drone = self.clone();
            tokio::spawn(async move {
                drone.on_connected().await;
            });
        }

        match msg {
            MavMessage::HEARTBEAT(hb) => {
                let mode_changed = self.custom_mode.swap(hb.custom_mode, Ordering::AcqRel)
                    != hb.custom_mode;
                let prev = *self.status_tx.borrow();
                let next = prev.on_heartbeat(hb.system_status);
                let status_changed = next != prev;
                if status_changed {
                    self.status_tx.send_replace(next);
                }
                if mode_changed || status_changed {
                    self.emit(Event::DroneStatusChanged {
                        drone: self.clone(),
                    })
                    .await;
                }
            }
            MavMessage::TIMESYNC(ts) => self.handle_timesync(ts).await,
            MavMessage::SYSTEM_TIME(st) => {
                let now_us = unix_time_us();
                let ping = self.ping_us.load(Ordering::Acquire);
                let boot = now_us
                    .saturating_sub(ping)
                    .saturating_sub(st.time_boot_ms as u64 * 1000);
                self.boot_time_us.store(boot, Ordering::Release);
            }
            MavMessage::BATTERY_STATUS(bs) => {
                let voltage = match bs.voltages[0] {
                    u16::MAX => -1.0,
                    mv => mv as f32 / 1000.0,
                };
                let current = if bs.current_battery < 0 {
                    -1.0
                } else {
                    bs.current_battery as f32 / 100.0
                };
                let remaining = if bs.battery_remaining < 0 {
                    -1.0
                } else {
                    bs.battery_remaining as f32 / 100.0
                };
                self.battery_tx.send_replace(Some(BatteryStat {
                    voltage,
                    current,
                    remaining,
                }));
            }
            MavMessage::GLOBAL_POSITION_INT(pos) => {
                let gps = Gps::from_wgs84(pos.lat, pos.lon, pos.alt);
                self.gps_tx.send_replace(Some(gps));
                self.emit(Event::DronePositionChanged {
                    drone: self.clone(),
                    gps_type: self.gps_type(),
                    gps,
                    rotate: self.rotate().unwrap_or_default(),
                })
                .await;
            }
            MavMessage::ATTITUDE(att) => {
                self.rotate_tx
                    .send_replace(Some(Rotate::from_radians(att.roll, att.pitch, att.yaw)));
            }
            MavMessage::GPS_RAW_INT(raw) => {
                self.gps_type_tx.send_replace(raw.fix_type);
                self.satellites
                    .store(raw.satellites_visible as u32, Ordering::Release);
            }
            MavMessage::HOME_POSITION(home) => {
                self.home_tx.send_replace(Some(Gps::from_wgs84(
                    home.latitude,
                    home.longitude,
                    home.altitude,
                )));
            }
            MavMessage::COMMAND_ACK(ack) => self.handle_command_ack(ack),
            MavMessage::MISSION_ACK(ack) => {
                self.mission_ack_tx.send_replace(Some(ack.mavtype));
            }
            MavMessage::MISSION_ITEM_REACHED(reached) => {
                self.mission_reached_tx.send_replace(reached.seq as i32);
            }
            MavMessage::STATUSTEXT(st) => {
                let text = decode_text(&st.text[..]);
                self.emit(Event::DroneStatusText {
                    drone: self.clone(),
                    severity: st.severity,
                    text,
                })
                .await;
            }
            MavMessage::MEMINFO(mem) => {
                let free = if mem.freemem32 != 0 {
                    mem.freemem32
                } else {
                    mem.freemem as u32
                };
                self.free_memory.store(free, Ordering::Release);
            }
            MavMessage::WIND(wind) => {
                self.wind_tx.send_replace(Some(Wind {
                    direction: wind.direction,
                    speed: wind.speed,
                    speed_z: wind.speed_z,
                }));
            }
            _ => {
                trace!(id = self.id, msgid = msg.message_id(), "unhandled message");
            }
        }

        // A waiter asked for this exact message type.
        let entry = self
            .pending_requests
            .lock()
            .expect("request lock")
            .remove(&msg.message_id());
        if let Some(entry) = entry {
            let _ = entry.tx.send(msg.clone());
        }
    }

    /// Two-legged MAVLink timesync: answer inbound requests with our clock,
    /// match responses against the outstanding sync id.
    async fn handle_timesync(&self, ts: &TIMESYNC_DATA) {
        if ts.tc1 == 0 {
            let reply = MavMessage::TIMESYNC(TIMESYNC_DATA {
                tc1: station_boot_ns(),
                ts1: ts.ts1,
                ..Default::default()
            });
            if let Err(err) = self.send_message(&reply).await {
                trace!(id = self.id, "timesync reply failed: {err}");
            }
        } else if self
            .timesync_id
            .compare_exchange(ts.ts1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let rtt_ns = station_boot_ns().saturating_sub(ts.ts1);
            self.ping_us.store((rtt_ns / 2 / 1000) as u64, Ordering::Release);
        }
    }

    fn handle_command_ack(&self, ack: &COMMAND_ACK_DATA) {
        let mut pending = self.pending_acks.lock().expect("ack lock");
        let key = ack.command as u32;
        let Some(entry) = pending.get(&key) else {
            trace!(id = self.id, cmd = ?ack.command, "unsolicited command ack");
            return;
        };
        let sink = if ack.result == MavResult::MAV_RESULT_IN_PROGRESS {
            entry.tx.clone()
        } else {
            pending.remove(&key).expect("pending ack present").tx
        };
        drop(pending);
        // Bounded try-send: a waiter that fell behind only misses duplicate
        // retransmission acks, and ingest never blocks on it.
        let _ = sink.try_send(ack.clone());
    }

    /// First traffic after a silence: nudge the flight controller for the
    /// low-rate telemetry streams and start a timesync probe.
    async fn on_connected(self: Arc<Self>) {
        for msg_id in [MSG_ID_BATTERY_STATUS, MSG_ID_ATTITUDE] {
            let msg = MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
                target_system: self.id,
                target_component: self.component,
                command: MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL,
                confirmation: 0,
                param1: msg_id as f32,
                param2: 1_000_000.0,
                ..Default::default()
            });
            if let Err(err) = self.send_message(&msg).await {
                debug!(id = self.id, "message interval request failed: {err}");
                return;
            }
        }
        self.send_timesync().await;
    }

    async fn send_timesync(&self) {
        let ts1 = station_boot_ns();
        self.timesync_id.store(ts1, Ordering::Release);
        let msg = MavMessage::TIMESYNC(TIMESYNC_DATA {
            tc1: 0,
            ts1,
            ..Default::default()
        });
        if let Err(err) = self.send_message(&msg).await {
            trace!(id = self.id, "timesync probe failed: {err}");
        }
    }
}

/// Nanoseconds since the station process started; the station-side clock for
/// MAVLink timesync.
fn station_boot_ns() -> i64 {
    use std::sync::OnceLock;
    static STARTED: OnceLock<std::time::Instant> = OnceLock::new();
    let started = STARTED.get_or_init(std::time::Instant::now);
    started.elapsed().as_nanos() as i64
}

fn unix_time_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn decode_text(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
