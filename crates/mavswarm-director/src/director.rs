use std::sync::{Arc, Mutex};
use std::time::Duration;

use mavswarm::{Controller, Drone, Gps};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::DirectorError;
use crate::flash::{self, WarningTiming};
use crate::inspect::Inspector;

#[derive(Debug, Clone)]
pub struct DirectorConfig {
    /// Transfer altitude above the takeoff point, meters.
    pub height: f32,
    /// Heading flown during the transfer, degrees.
    pub heading: f32,
    /// Arrival radius for the transfer waypoints, meters.
    pub reach_radius: f32,
    /// Maximum drift from the inspection position before transfer, meters.
    pub tamper_radius: f32,
    /// Final waypoint altitude above the takeoff altitude, meters.
    pub land_clearance: f32,
    /// Tilt limit while holding on the ground, degrees.
    pub max_tilt_deg: f32,
    /// How long the pre-transfer attitude watch runs.
    pub stabilize_duration: Duration,
    /// Sampling period of the attitude watch.
    pub stabilize_interval: Duration,
    /// Pause after arming and after takeoff.
    pub settle_delay: Duration,
    /// Mode the drone must sit in before a transfer (STABILIZE).
    pub pre_guided_mode: u32,
    /// Mode used for the transfer itself (GUIDED).
    pub guided_mode: u32,
    /// Rainbow flash period during pre-assignment.
    pub rainbow_period: Duration,
    /// Warning flash color period during the first phase of a transfer.
    pub warn_slow_period: Duration,
    /// Warning flash color period after escalation.
    pub warn_fast_period: Duration,
    /// When the warning flash escalates.
    pub warn_escalate_after: Duration,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            height: 4.0,
            heading: 0.0,
            reach_radius: 0.8,
            tamper_radius: 0.8,
            land_clearance: 1.5,
            max_tilt_deg: 15.0,
            stabilize_duration: Duration::from_secs(10),
            stabilize_interval: Duration::from_millis(500),
            settle_delay: Duration::from_secs(5),
            pre_guided_mode: 0,
            guided_mode: 4,
            rainbow_period: Duration::from_secs(1),
            warn_slow_period: Duration::from_millis(250),
            warn_fast_period: Duration::from_millis(125),
            warn_escalate_after: Duration::from_secs(5),
        }
    }
}

struct State {
    points: Vec<Gps>,
    arrived: Vec<Option<Arc<Drone>>>,
    assigning: Option<Arc<Drone>>,
    inspect_at: Option<Gps>,
    flash: Option<CancellationToken>,
}

/// Sequentially ferries drones from wherever they sit onto an ordered list
/// of geographic slots: pre-assign, inspect, then transfer through a guided
/// three-point trajectory.
pub struct Director {
    controller: Controller,
    config: DirectorConfig,
    inspectors: Vec<Box<dyn Inspector>>,
    state: Mutex<State>,
}

impl Director {
    pub fn new(controller: Controller, points: Vec<Gps>) -> Self {
        Self::with_config(controller, points, DirectorConfig::default())
    }

    pub fn with_config(
        controller: Controller,
        points: Vec<Gps>,
        config: DirectorConfig,
    ) -> Self {
        let arrived = vec![None; points.len()];
        Self {
            controller,
            config,
            inspectors: Vec::new(),
            state: Mutex::new(State {
                points,
                arrived,
                assigning: None,
                inspect_at: None,
                flash: None,
            }),
        }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn config(&self) -> &DirectorConfig {
        &self.config
    }

    pub fn add_inspector(&mut self, inspector: Box<dyn Inspector>) {
        self.inspectors.push(inspector);
    }

    pub fn points(&self) -> Vec<Gps> {
        self.state.lock().expect("state lock").points.clone()
    }

    /// Index of the last contiguously filled slot, `-1` when none are.
    pub fn arrived_index(&self) -> isize {
        let state = self.state.lock().expect("state lock");
        arrived_index_of(&state.arrived)
    }

    pub fn is_done(&self) -> bool {
        let state = self.state.lock().expect("state lock");
        state.arrived.iter().all(Option::is_some)
    }

    pub fn is_assigned(&self, drone: &Arc<Drone>) -> bool {
        let state = self.state.lock().expect("state lock");
        state
            .arrived
            .iter()
            .flatten()
            .any(|d| Arc::ptr_eq(d, drone))
    }

    /// The drone currently being inspected or transferred.
    pub fn assigning(&self) -> Option<Arc<Drone>> {
        self.state.lock().expect("state lock").assigning.clone()
    }

    /// The slot occupants in slot order.
    pub fn arrived(&self) -> Vec<Option<Arc<Drone>>> {
        self.state.lock().expect("state lock").arrived.clone()
    }

    /// Claim `drone` as the next transfer candidate and start its marker
    /// flash. Exactly one drone can be in this stage at a time.
    pub fn pre_assign_drone(&self, drone: Arc<Drone>) -> Result<(), DirectorError> {
        let mut state = self.state.lock().expect("state lock");
        if state.assigning.is_some() {
            return Err(DirectorError::Busy);
        }
        if arrived_index_of(&state.arrived) + 1 >= state.arrived.len() as isize {
            return Err(DirectorError::SlotsFull);
        }
        if state.arrived.iter().flatten().any(|d| Arc::ptr_eq(d, &drone)) {
            return Err(DirectorError::AlreadyAssigned);
        }
        info!(id = drone.id(), "pre-assigning drone");
        state.assigning = Some(drone.clone());
        state.inspect_at = None;
        if let Some(flash) = state.flash.take() {
            flash.cancel();
        }
        let flash = CancellationToken::new();
        state.flash = Some(flash.clone());
        flash::spawn_rainbow(drone, flash, self.config.rainbow_period);
        Ok(())
    }

    /// Run every inspector in order against the pre-assigned drone. On
    /// success the drone's position is recorded for the pre-transfer tamper
    /// check.
    pub async fn inspect_drone(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), DirectorError> {
        let drone = self.assigning().ok_or(DirectorError::NoAssignment)?;
        if drone.gps().is_none() {
            return Err(DirectorError::GpsUnavailable);
        }
        for (seq, inspector) in self.inspectors.iter().enumerate() {
            info!(id = drone.id(), step = seq, name = inspector.name(), "inspecting");
            inspector
                .inspect(&drone, cancel)
                .await
                .map_err(|source| DirectorError::Inspect {
                    seq,
                    source: Box::new(source),
                })?;
        }
        let position = drone.gps().ok_or(DirectorError::GpsUnavailable)?;
        self.state.lock().expect("state lock").inspect_at = Some(position);
        info!(id = drone.id(), "inspection passed");
        Ok(())
    }

    /// Fly the pre-assigned drone onto its slot.
    ///
    /// The slot is the farthest unfilled point from the drone's current
    /// position; the trajectory climbs to the transfer height, crosses at
    /// altitude, and descends over the slot before landing.
    pub async fn transfer_drone(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), DirectorError> {
        let (drone, inspect_at) = {
            let mut state = self.state.lock().expect("state lock");
            let drone = state
                .assigning
                .clone()
                .ok_or(DirectorError::NoAssignment)?;
            let inspect_at = state.inspect_at.ok_or(DirectorError::NoAssignment)?;
            if let Some(flash) = state.flash.take() {
                flash.cancel();
            }
            let flash = CancellationToken::new();
            state.flash = Some(flash.clone());
            flash::spawn_warning(
                drone.clone(),
                flash,
                WarningTiming {
                    slow_period: self.config.warn_slow_period,
                    fast_period: self.config.warn_fast_period,
                    escalate_after: self.config.warn_escalate_after,
                },
            );
            (drone, inspect_at)
        };

        self.watch_attitude(&drone, cancel).await?;

        let current = drone.gps().ok_or(DirectorError::GpsUnavailable)?;
        let drift = inspect_at.distance_to(&current);
        if drift > self.config.tamper_radius {
            return Err(DirectorError::MovedSinceInspection { distance: drift });
        }

        let (slot_index, target) = self.claim_slot(&current);
        info!(id = drone.id(), slot = slot_index, "transferring drone");

        let start = current.up(self.config.height);
        let mid = Gps::new(target.lat, target.lon, start.alt);
        let end = Gps::new(target.lat, target.lon, current.alt + self.config.land_clearance);

        let mode = drone.custom_mode();
        if mode != self.config.pre_guided_mode {
            return Err(DirectorError::WrongMode {
                got: mode,
                want: self.config.pre_guided_mode,
            });
        }

        drone.arm(cancel, false).await?;
        tokio::time::sleep(self.config.settle_delay).await;
        drone.update_mode(cancel, self.config.guided_mode).await?;
        drone.takeoff(cancel, self.config.height).await?;
        tokio::time::sleep(self.config.settle_delay).await;

        let flight = async {
            drone
                .move_with_yaw_until_reached(
                    cancel,
                    &mid,
                    self.config.heading,
                    self.config.reach_radius,
                )
                .await?;
            drone
                .move_with_yaw_until_reached(
                    cancel,
                    &end,
                    self.config.heading,
                    self.config.reach_radius,
                )
                .await
        }
        .await;
        if let Err(err) = flight {
            warn!(id = drone.id(), "transfer flight failed, landing: {err}");
            if let Err(land_err) = drone.land(cancel).await {
                warn!(id = drone.id(), "emergency land failed: {land_err}");
            }
            return Err(err.into());
        }

        if let Some(flash) = self.state.lock().expect("state lock").flash.take() {
            flash.cancel();
        }
        drone.land(cancel).await?;
        drone.wait_until_ready(cancel).await?;
        drone.disarm(cancel, false).await?;

        let mut state = self.state.lock().expect("state lock");
        state.arrived[slot_index] = Some(drone.clone());
        state.assigning = None;
        state.inspect_at = None;
        info!(id = drone.id(), slot = slot_index, "drone arrived");
        Ok(())
    }

    /// Drop the current assignment, stopping its flash. Returns the drone
    /// that was being assigned, if any.
    pub fn cancel_drone_assign(&self) -> Option<Arc<Drone>> {
        let mut state = self.state.lock().expect("state lock");
        if let Some(flash) = state.flash.take() {
            flash.cancel();
        }
        state.inspect_at = None;
        state.assigning.take()
    }

    /// Sample the attitude for the stabilization window; any excessive tilt
    /// aborts the transfer before the props spin.
    async fn watch_attitude(
        &self,
        drone: &Arc<Drone>,
        cancel: &CancellationToken,
    ) -> Result<(), DirectorError> {
        let deadline = tokio::time::Instant::now() + self.config.stabilize_duration;
        while tokio::time::Instant::now() < deadline {
            if let Some(rotate) = drone.rotate() {
                if rotate.pitch.abs() > self.config.max_tilt_deg
                    || rotate.roll.abs() > self.config.max_tilt_deg
                {
                    return Err(DirectorError::TiltTooHigh {
                        pitch: rotate.pitch,
                        roll: rotate.roll,
                        limit: self.config.max_tilt_deg,
                    });
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(DirectorError::Station(mavswarm::StationError::Cancelled))
                }
                _ = tokio::time::sleep(self.config.stabilize_interval) => {}
            }
        }
        Ok(())
    }

    /// Pick the farthest unfilled slot (ground distance, ties to the higher
    /// slot) and swap it to the next arrival position.
    fn claim_slot(&self, from: &Gps) -> (usize, Gps) {
        let mut state = self.state.lock().expect("state lock");
        let base = (arrived_index_of(&state.arrived) + 1) as usize;
        let mut best = base;
        for k in base..state.points.len() {
            let candidate = &state.points[k];
            let incumbent = &state.points[best];
            let further = from.distance_no_alt(candidate) > from.distance_no_alt(incumbent);
            let tie = from.distance_no_alt(candidate) == from.distance_no_alt(incumbent);
            if further || (tie && candidate.alt > incumbent.alt) {
                best = k;
            }
        }
        state.points.swap(base, best);
        (base, state.points[base])
    }
}

fn arrived_index_of(arrived: &[Option<Arc<Drone>>]) -> isize {
    for (i, slot) in arrived.iter().enumerate() {
        if slot.is_none() {
            return i as isize - 1;
        }
    }
    arrived.len() as isize - 1
}
