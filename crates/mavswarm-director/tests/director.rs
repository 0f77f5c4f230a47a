//! Director end-to-end tests: two simulated drones, two slots, compressed
//! timings.

use std::sync::Arc;
use std::time::Duration;

use mavswarm::sim::{SimDrone, SimDroneConfig};
use mavswarm::{Controller, Drone, Endpoint, Event, Gps, StationConfig};
use mavswarm_director::{
    AttitudeInspector, BatteryInspector, Director, DirectorConfig, DirectorError,
    GpsTypeInspector,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn fast_config() -> DirectorConfig {
    DirectorConfig {
        stabilize_duration: Duration::from_millis(200),
        stabilize_interval: Duration::from_millis(50),
        settle_delay: Duration::from_millis(50),
        rainbow_period: Duration::from_millis(50),
        warn_slow_period: Duration::from_millis(50),
        warn_fast_period: Duration::from_millis(25),
        warn_escalate_after: Duration::from_millis(200),
        ..Default::default()
    }
}

struct Fleet {
    controller: Controller,
    events: mpsc::UnboundedReceiver<Event>,
    sims: Vec<SimDrone>,
    drones: Vec<Arc<Drone>>,
}

/// One UDP endpoint per simulated drone, so each link has a single peer.
async fn fleet(positions: &[Gps]) -> Fleet {
    let ports: Vec<u16> = positions
        .iter()
        .map(|_| portpicker::pick_unused_port().expect("free udp port"))
        .collect();
    let endpoints = ports
        .iter()
        .map(|port| Endpoint::UdpServer {
            addr: format!("127.0.0.1:{port}"),
        })
        .collect();
    let (controller, mut event_rx) = Controller::new(endpoints, StationConfig::default());

    let (tx, events) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if tx.send(event).is_err() {
                return;
            }
        }
    });

    let mut fleet = Fleet {
        controller,
        events,
        sims: Vec::new(),
        drones: Vec::new(),
    };
    for (i, (port, position)) in ports.iter().zip(positions).enumerate() {
        let sim = SimDrone::connect(
            &format!("127.0.0.1:{port}"),
            SimDroneConfig {
                system_id: (i + 1) as u8,
                position: *position,
                ..Default::default()
            },
        )
        .await
        .expect("sim connects");
        let drone = wait_connected(&mut fleet.events, sim.system_id()).await;
        fleet.sims.push(sim);
        fleet.drones.push(drone);
    }
    fleet
}

async fn wait_connected(
    events: &mut mpsc::UnboundedReceiver<Event>,
    id: u8,
) -> Arc<Drone> {
    let deadline = tokio::time::sleep(EVENT_TIMEOUT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => panic!("drone {id} never connected"),
            event = events.recv() => match event.expect("event stream open") {
                Event::DroneConnected { drone } if drone.id() == id => return drone,
                _ => {}
            }
        }
    }
}

async fn wait_gps(drone: &Arc<Drone>) {
    let mut rx = drone.gps_watch();
    tokio::time::timeout(EVENT_TIMEOUT, rx.wait_for(|g| g.is_some()))
        .await
        .expect("gps timeout")
        .expect("gps watch open");
}

fn stock_inspectors(director: &mut Director) {
    director.add_inspector(Box::new(GpsTypeInspector));
    director.add_inspector(Box::new(AttitudeInspector {
        max_vibration: 2.0,
        max_tilt_deg: 15.0,
    }));
    director.add_inspector(Box::new(BatteryInspector {
        min_voltage: 10.0,
        poll: Duration::from_millis(50),
    }));
}

// ---------------------------------------------------------------------------
// Happy path: two drones fill two slots farthest-first
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn two_drones_fill_two_slots() {
    let origin = Gps::new(47.397742, 8.545594, 488.0);
    let fleet = fleet(&[origin, Gps::new(origin.lat, origin.lon + 0.00002, origin.alt)])
        .await;
    for drone in &fleet.drones {
        wait_gps(drone).await;
    }

    // Slot 1 is farther from the origin than slot 0.
    let near = Gps::new(origin.lat + 0.0003, origin.lon, origin.alt);
    let far = Gps::new(origin.lat + 0.0008, origin.lon, origin.alt);
    let mut director = Director::with_config(
        fleet.controller.clone(),
        vec![near, far],
        fast_config(),
    );
    stock_inspectors(&mut director);

    let cancel = CancellationToken::new();
    assert_eq!(director.arrived_index(), -1);

    // First drone goes to the farther slot.
    let drone_a = fleet.drones[0].clone();
    director.pre_assign_drone(drone_a.clone()).unwrap();
    director.inspect_drone(&cancel).await.unwrap();
    director.transfer_drone(&cancel).await.unwrap();
    assert_eq!(director.arrived_index(), 0);
    assert!(director.is_assigned(&drone_a));
    assert!(!director.is_done());

    let landed_a = fleet.sims[0].position();
    assert!(landed_a.distance_no_alt(&far) < 2.0, "drone A should land at the far slot");

    // Second drone takes the remaining slot.
    let drone_b = fleet.drones[1].clone();
    director.pre_assign_drone(drone_b.clone()).unwrap();
    director.inspect_drone(&cancel).await.unwrap();
    director.transfer_drone(&cancel).await.unwrap();
    assert_eq!(director.arrived_index(), 1);
    assert!(director.is_done());

    let landed_b = fleet.sims[1].position();
    assert!(landed_b.distance_no_alt(&near) < 2.0, "drone B should land at the near slot");

    // Both sims end disarmed on the ground.
    assert!(!fleet.sims[0].is_armed());
    assert!(!fleet.sims[1].is_armed());

    fleet.controller.shutdown();
}

// ---------------------------------------------------------------------------
// Inspection failure and re-assignment
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn failed_inspection_reports_step_and_frees_assignment() {
    let origin = Gps::new(47.397742, 8.545594, 488.0);
    let fleet = fleet(&[origin, Gps::new(origin.lat, origin.lon + 0.00002, origin.alt)])
        .await;
    for drone in &fleet.drones {
        wait_gps(drone).await;
    }

    let mut director = Director::with_config(
        fleet.controller.clone(),
        vec![Gps::new(origin.lat + 0.0003, origin.lon, origin.alt)],
        fast_config(),
    );
    director.add_inspector(Box::new(GpsTypeInspector));
    director.add_inspector(Box::new(AttitudeInspector {
        max_vibration: 2.0,
        max_tilt_deg: 15.0,
    }));
    // Impossible threshold: the sims report 16.2 V.
    director.add_inspector(Box::new(BatteryInspector {
        min_voltage: 99.0,
        poll: Duration::from_millis(50),
    }));

    let cancel = CancellationToken::new();
    let drone_a = fleet.drones[0].clone();
    director.pre_assign_drone(drone_a.clone()).unwrap();

    match director.inspect_drone(&cancel).await {
        Err(DirectorError::Inspect { seq, source }) => {
            assert_eq!(seq, 2);
            assert!(matches!(*source, DirectorError::VoltageTooLow { .. }));
        }
        other => panic!("expected inspection failure, got {other:?}"),
    }

    // A second pre-assign is refused while the first is pending.
    match director.pre_assign_drone(fleet.drones[1].clone()) {
        Err(DirectorError::Busy) => {}
        other => panic!("expected Busy, got {other:?}"),
    }

    let released = director.cancel_drone_assign().expect("assignment released");
    assert_eq!(released.id(), drone_a.id());
    assert!(director.assigning().is_none());

    // With the assignment cleared, another drone can be claimed.
    director.pre_assign_drone(fleet.drones[1].clone()).unwrap();

    fleet.controller.shutdown();
}

// ---------------------------------------------------------------------------
// Transfer preconditions
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn transfer_requires_inspection_and_pre_guided_mode() {
    let origin = Gps::new(47.397742, 8.545594, 488.0);
    let fleet = fleet(&[origin]).await;
    wait_gps(&fleet.drones[0]).await;

    let mut director = Director::with_config(
        fleet.controller.clone(),
        vec![Gps::new(origin.lat + 0.0003, origin.lon, origin.alt)],
        fast_config(),
    );
    stock_inspectors(&mut director);
    let cancel = CancellationToken::new();

    // Transfer before inspection is refused.
    let drone = fleet.drones[0].clone();
    director.pre_assign_drone(drone.clone()).unwrap();
    match director.transfer_drone(&cancel).await {
        Err(DirectorError::NoAssignment) => {}
        other => panic!("expected NoAssignment (no inspection), got {other:?}"),
    }

    // A drone sitting in the wrong mode is refused.
    drone.update_mode(&cancel, 5).await.unwrap();
    director.inspect_drone(&cancel).await.unwrap();
    match director.transfer_drone(&cancel).await {
        Err(DirectorError::WrongMode { got: 5, want: 0 }) => {}
        other => panic!("expected WrongMode, got {other:?}"),
    }

    fleet.controller.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn full_director_rejects_further_assignments() {
    let origin = Gps::new(47.397742, 8.545594, 488.0);
    let fleet = fleet(&[origin, Gps::new(origin.lat, origin.lon + 0.00002, origin.alt)])
        .await;
    for drone in &fleet.drones {
        wait_gps(drone).await;
    }

    let mut director = Director::with_config(
        fleet.controller.clone(),
        vec![Gps::new(origin.lat + 0.0003, origin.lon, origin.alt)],
        fast_config(),
    );
    stock_inspectors(&mut director);
    let cancel = CancellationToken::new();

    let drone_a = fleet.drones[0].clone();
    director.pre_assign_drone(drone_a.clone()).unwrap();
    director.inspect_drone(&cancel).await.unwrap();
    director.transfer_drone(&cancel).await.unwrap();
    assert!(director.is_done());

    // Every slot is filled.
    match director.pre_assign_drone(fleet.drones[1].clone()) {
        Err(DirectorError::SlotsFull) => {}
        other => panic!("expected SlotsFull, got {other:?}"),
    }
    // The arrived drone cannot be claimed again either.
    match director.pre_assign_drone(drone_a) {
        Err(DirectorError::SlotsFull | DirectorError::AlreadyAssigned) => {}
        other => panic!("expected refusal, got {other:?}"),
    }

    fleet.controller.shutdown();
}
