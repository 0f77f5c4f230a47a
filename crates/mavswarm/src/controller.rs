use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use mavlink::ardupilotmega::{
    MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA,
};
use mavlink::error::MessageReadError;
use mavlink::{AsyncMavConnection, MavHeader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::StationConfig;
use crate::drone::Drone;
use crate::endpoint::Endpoint;
use crate::error::StationError;
use crate::events::Event;
use crate::rtcm;

/// One open MAVLink connection. Writes share the connection's internal lock;
/// reads happen only on the owning endpoint task.
pub(crate) struct Link {
    endpoint: Endpoint,
    conn: Box<dyn AsyncMavConnection<MavMessage> + Sync + Send>,
}

impl Link {
    pub(crate) async fn send(
        &self,
        header: &MavHeader,
        msg: &MavMessage,
    ) -> Result<(), StationError> {
        self.conn
            .send(header, msg)
            .await
            .map(|_| ())
            .map_err(StationError::transport)
    }
}

/// The ground station: opens the configured endpoints, routes inbound frames
/// to per-drone state machines, and broadcasts station traffic (heartbeat,
/// RTCM corrections) to the fleet.
///
/// `Controller` is `Clone`; clones share the same station. Dropping the last
/// clone shuts everything down.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
    // Held by handles only, never by worker tasks, so the last handle drop
    // reliably cancels the root context.
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

pub(crate) struct ControllerInner {
    config: StationConfig,
    links: RwLock<Vec<Arc<Link>>>,
    drones: RwLock<HashMap<u8, Arc<Drone>>>,
    event_tx: mpsc::Sender<Event>,
    rtcm_seq: AtomicU8,
    cancel: CancellationToken,
}

impl Controller {
    /// Build the station and start opening `endpoints`. Endpoints that fail
    /// to open retry with backoff; the controller is usable immediately.
    ///
    /// The returned receiver carries every [`Event`]; it must be drained,
    /// otherwise ingest eventually stalls on the bounded channel.
    pub fn new(
        endpoints: Vec<Endpoint>,
        config: StationConfig,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let inner = Arc::new(ControllerInner {
            config,
            links: RwLock::new(Vec::new()),
            drones: RwLock::new(HashMap::new()),
            event_tx,
            rtcm_seq: AtomicU8::new(0),
            cancel: CancellationToken::new(),
        });

        for endpoint in endpoints {
            tokio::spawn(ControllerInner::endpoint_task(inner.clone(), endpoint));
        }
        tokio::spawn(ControllerInner::heartbeat_task(inner.clone()));

        let shutdown = Arc::new(ShutdownGuard {
            cancel: inner.cancel.clone(),
        });
        (
            Self {
                inner,
                _shutdown: shutdown,
            },
            event_rx,
        )
    }

    pub fn config(&self) -> &StationConfig {
        &self.inner.config
    }

    /// All drones ever observed, connected or not.
    pub fn drones(&self) -> Vec<Arc<Drone>> {
        self.inner
            .drones
            .read()
            .expect("drone map lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn get_drone(&self, id: u8) -> Option<Arc<Drone>> {
        self.inner
            .drones
            .read()
            .expect("drone map lock")
            .get(&id)
            .cloned()
    }

    /// Send one message out of every open endpoint. The first write error
    /// aborts the broadcast.
    pub async fn broadcast(&self, msg: &MavMessage) -> Result<(), StationError> {
        self.inner.broadcast(msg).await
    }

    /// Fragment one RTCM frame and broadcast it as GPS_RTCM_DATA. Frames over
    /// 720 bytes are dropped, as the four-fragment window cannot carry them.
    pub async fn broadcast_rtcm(&self, frame: &[u8]) -> Result<(), StationError> {
        let seq = self.inner.rtcm_seq.fetch_add(1, Ordering::AcqRel) & 0x1f;
        let fragments = rtcm::fragment(seq, frame);
        if fragments.is_empty() && !frame.is_empty() {
            debug!(len = frame.len(), "rtcm frame too long, dropped");
        }
        for fragment in fragments {
            self.inner
                .broadcast(&MavMessage::GPS_RTCM_DATA(fragment))
                .await?;
        }
        Ok(())
    }

    /// Cancel the root context: endpoint loops, drone watchdogs, and every
    /// pending operation observe it and wind down.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// A token that fires when the controller shuts down.
    pub fn cancelled_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

impl ControllerInner {
    async fn emit(&self, event: Event) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.event_tx.send(event) => {}
        }
    }

    async fn broadcast(&self, msg: &MavMessage) -> Result<(), StationError> {
        let links: Vec<Arc<Link>> = self.links.read().expect("links lock").clone();
        let header = MavHeader {
            system_id: self.config.system_id,
            component_id: self.config.component_id,
            sequence: 0,
        };
        for link in links {
            link.send(&header, msg).await?;
        }
        Ok(())
    }

    /// Keep one endpoint open for the controller's lifetime, with backoff
    /// between attempts.
    async fn endpoint_task(self: Arc<Self>, endpoint: Endpoint) {
        let mut delay = self.config.reopen_delay_min;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let address = endpoint.connection_string();
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return,
                conn = mavlink::connect_async::<MavMessage>(&address) => conn,
            };
            match connected {
                Ok(conn) => {
                    debug!(%endpoint, "channel open");
                    delay = self.config.reopen_delay_min;
                    let link = Arc::new(Link {
                        endpoint: endpoint.clone(),
                        conn,
                    });
                    self.links.write().expect("links lock").push(link.clone());
                    self.emit(Event::ChannelOpen {
                        endpoint: endpoint.clone(),
                    })
                    .await;

                    self.read_loop(&link).await;

                    self.links
                        .write()
                        .expect("links lock")
                        .retain(|l| !Arc::ptr_eq(l, &link));
                    warn!(%endpoint, "channel closed");
                    self.emit(Event::ChannelClose {
                        endpoint: endpoint.clone(),
                    })
                    .await;
                }
                Err(err) => {
                    warn!(%endpoint, "endpoint open failed: {err}");
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.config.reopen_delay_max);
        }
    }

    async fn read_loop(&self, link: &Arc<Link>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                received = link.conn.recv() => match received {
                    Ok((header, msg)) => self.route(link, header, msg).await,
                    Err(MessageReadError::Io(err))
                        if err.kind() == std::io::ErrorKind::WouldBlock =>
                    {
                        continue;
                    }
                    Err(MessageReadError::Io(err)) => {
                        debug!(endpoint = %link.endpoint, "link read error: {err}");
                        return;
                    }
                    // Frames that fail to parse or checksum are dropped; the
                    // wire is noisy and logging every one would flood.
                    Err(_) => continue,
                },
            }
        }
    }

    async fn route(&self, link: &Arc<Link>, header: MavHeader, msg: MavMessage) {
        if header.system_id == self.config.system_id {
            return;
        }
        let drone = {
            let drones = self.drones.read().expect("drone map lock");
            drones.get(&header.system_id).cloned()
        };
        let drone = match drone {
            Some(drone) => {
                if drone.component() != header.component_id {
                    trace!(
                        id = header.system_id,
                        component = header.component_id,
                        "frame from unexpected component dropped"
                    );
                    return;
                }
                drone
            }
            None => {
                let drone = Drone::spawn(
                    header.system_id,
                    header.component_id,
                    link.clone(),
                    self.event_tx.clone(),
                    &self.config,
                    &self.cancel,
                );
                self.drones
                    .write()
                    .expect("drone map lock")
                    .insert(header.system_id, drone.clone());
                drone
            }
        };
        drone.update_link(link);
        drone.clone().handle_message(&msg).await;
        self.emit(Event::DroneMessage {
            drone,
            header,
            message: Box::new(msg),
        })
        .await;
    }

    /// The 500 ms station heartbeat MAVLink peers expect.
    async fn heartbeat_task(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let heartbeat = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_GENERIC,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        });
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.broadcast(&heartbeat).await {
                trace!("heartbeat broadcast failed: {err}");
            }
        }
    }
}
