//! End-to-end controller tests against a simulated flight controller over a
//! real UDP loopback link.

use std::sync::Arc;
use std::time::Duration;

use mavlink::ardupilotmega::{MavCmd, MavMessage};
use mavswarm::sim::{SimDrone, SimDroneConfig};
use mavswarm::{
    Controller, Drone, DroneStatus, Endpoint, Event, Gps, StationConfig, StationError,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> StationConfig {
    StationConfig {
        inactive_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

struct Harness {
    controller: Controller,
    events: mpsc::UnboundedReceiver<Event>,
    addr: String,
}

impl Harness {
    fn start(config: StationConfig) -> Self {
        let port = portpicker::pick_unused_port().expect("free udp port");
        let addr = format!("127.0.0.1:{port}");
        let (controller, mut event_rx) = Controller::new(
            vec![Endpoint::UdpServer { addr: addr.clone() }],
            config,
        );
        // The bounded event stream must always be drained; tests watch the
        // unbounded mirror instead.
        let (tx, events) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if tx.send(event).is_err() {
                    return;
                }
            }
        });
        Self {
            controller,
            events,
            addr,
        }
    }

    async fn spawn_sim(&mut self, config: SimDroneConfig) -> (SimDrone, Arc<Drone>) {
        let sim = SimDrone::connect(&self.addr, config)
            .await
            .expect("sim connects");
        let drone = self
            .wait_event(|event| match event {
                Event::DroneConnected { drone } if drone.id() == sim.system_id() => {
                    Some(drone.clone())
                }
                _ => None,
            })
            .await;
        (sim, drone)
    }

    async fn wait_event<T>(&mut self, mut pred: impl FnMut(&Event) -> Option<T>) -> T {
        let deadline = tokio::time::sleep(EVENT_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => panic!("timed out waiting for event"),
                event = self.events.recv() => {
                    let event = event.expect("event stream open");
                    if let Some(found) = pred(&event) {
                        return found;
                    }
                }
            }
        }
    }
}

async fn wait_status(drone: &Arc<Drone>, status: DroneStatus) {
    let mut rx = drone.status_watch();
    tokio::time::timeout(EVENT_TIMEOUT, rx.wait_for(|s| *s == status))
        .await
        .expect("status timeout")
        .expect("status watch open");
}

// ---------------------------------------------------------------------------
// Scenario: arm, takeoff, land
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn arm_takeoff_land() {
    let mut harness = Harness::start(test_config());
    let (sim, drone) = harness.spawn_sim(SimDroneConfig::default()).await;
    let cancel = CancellationToken::new();

    wait_status(&drone, DroneStatus::Ready).await;

    drone.arm(&cancel, false).await.unwrap();
    assert!(sim.is_armed());
    assert_eq!(drone.status(), DroneStatus::Armed);

    drone.update_mode(&cancel, 4).await.unwrap(); // GUIDED
    assert_eq!(sim.custom_mode(), 4);

    let before = sim.position();
    drone.takeoff(&cancel, 2.5).await.unwrap();
    assert_eq!(drone.status(), DroneStatus::TakenOff);
    assert!((sim.position().alt - before.alt - 2.5).abs() < 1e-3);

    drone.land(&cancel).await.unwrap();
    assert!(!sim.is_armed());
    wait_status(&drone, DroneStatus::Ready).await;

    harness.controller.shutdown();
}

// ---------------------------------------------------------------------------
// Scenario: long-command retransmission
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn command_long_retransmits_until_acked() {
    let mut harness = Harness::start(test_config());
    let (sim, drone) = harness
        .spawn_sim(SimDroneConfig {
            ignore_first: vec![(MavCmd::MAV_CMD_DO_SET_MODE, 1)],
            ..Default::default()
        })
        .await;
    let cancel = CancellationToken::new();

    drone.update_mode(&cancel, 4).await.unwrap();

    // Give a potential spurious third transmission time to show up.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let confirmations: Vec<u8> = sim
        .received()
        .iter()
        .filter_map(|msg| match msg {
            MavMessage::COMMAND_LONG(data)
                if data.command == MavCmd::MAV_CMD_DO_SET_MODE =>
            {
                Some(data.confirmation)
            }
            _ => None,
        })
        .collect();
    assert_eq!(confirmations, vec![0, 1]);

    harness.controller.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_command_surfaces_result() {
    let mut harness = Harness::start(test_config());
    let (_sim, drone) = harness
        .spawn_sim(SimDroneConfig {
            reject_commands: vec![MavCmd::MAV_CMD_NAV_TAKEOFF],
            ..Default::default()
        })
        .await;
    let cancel = CancellationToken::new();

    match drone.takeoff(&cancel, 3.0).await {
        Err(StationError::CommandResult(_)) => {}
        other => panic!("expected CommandResult error, got {other:?}"),
    }
    // The failed takeoff must not have promoted the status.
    assert_ne!(drone.status(), DroneStatus::TakenOff);

    harness.controller.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_same_command_is_gated() {
    let mut harness = Harness::start(test_config());
    // Never acked: the first arm stays in flight.
    let (_sim, drone) = harness
        .spawn_sim(SimDroneConfig {
            ignore_first: vec![(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, u32::MAX)],
            ..Default::default()
        })
        .await;

    let cancel = CancellationToken::new();
    let first = {
        let drone = drone.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { drone.arm(&cancel, false).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    match drone.arm(&cancel, false).await {
        Err(StationError::CommandPending(cmd)) => {
            assert_eq!(cmd, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM);
        }
        other => panic!("expected CommandPending, got {other:?}"),
    }

    cancel.cancel();
    match first.await.unwrap() {
        Err(StationError::Cancelled) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }

    // The slot is free again after cancellation; the retry times out on the
    // silent sim instead of failing fast.
    let cancel = CancellationToken::new();
    let retry =
        tokio::time::timeout(Duration::from_millis(300), drone.arm(&cancel, false)).await;
    match retry {
        Ok(Err(StationError::CommandPending(_))) => panic!("ack slot leaked"),
        _ => {}
    }

    harness.controller.shutdown();
}

// ---------------------------------------------------------------------------
// Scenario: RTCM fragmentation over the wire
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn rtcm_broadcast_fragments() {
    let mut harness = Harness::start(test_config());
    let (sim, _drone) = harness.spawn_sim(SimDroneConfig::default()).await;

    let frame: Vec<u8> = (0..400u32).map(|i| (i % 256) as u8).collect();
    harness.controller.broadcast_rtcm(&frame).await.unwrap();

    assert!(
        sim.wait_received(
            |msg| matches!(msg, MavMessage::GPS_RTCM_DATA(d) if d.len == 40),
            EVENT_TIMEOUT,
        )
        .await,
        "terminal fragment not seen"
    );

    let fragments: Vec<(u8, u8)> = sim
        .received()
        .iter()
        .filter_map(|msg| match msg {
            MavMessage::GPS_RTCM_DATA(data) => Some((data.flags, data.len)),
            _ => None,
        })
        .collect();
    let seq = fragments[0].0 >> 3;
    assert_eq!(
        fragments,
        vec![
            (0x01 | (seq << 3), 180),
            (0x01 | (1 << 1) | (seq << 3), 180),
            (0x01 | (2 << 1) | (seq << 3), 40),
        ]
    );

    // An oversized frame produces nothing.
    let count_before = sim.received_matching(|m| matches!(m, MavMessage::GPS_RTCM_DATA(_)));
    harness.controller.broadcast_rtcm(&[0u8; 721]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let count_after = sim.received_matching(|m| matches!(m, MavMessage::GPS_RTCM_DATA(_)));
    assert_eq!(count_before, count_after);

    harness.controller.shutdown();
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn silent_drone_disconnects_exactly_once() {
    let mut harness = Harness::start(test_config());
    let (sim, drone) = harness.spawn_sim(SimDroneConfig::default()).await;
    assert!(drone.is_alive());

    sim.stop();
    let id = drone.id();
    harness
        .wait_event(|event| match event {
            Event::DroneDisconnected { drone } if drone.id() == id => Some(()),
            _ => None,
        })
        .await;
    assert!(!drone.is_alive());
    assert_eq!(drone.status(), DroneStatus::None);

    // No second disconnect shows up.
    let extra = tokio::time::timeout(Duration::from_millis(800), async {
        loop {
            match harness.events.recv().await {
                Some(Event::DroneDisconnected { .. }) => return,
                Some(_) => {}
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(extra.is_err(), "saw a duplicate disconnect event");

    harness.controller.shutdown();
}

// ---------------------------------------------------------------------------
// Mission sequencing
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn mission_upload_start_and_arrival() {
    let mut harness = Harness::start(test_config());
    let (_sim, drone) = harness.spawn_sim(SimDroneConfig::default()).await;
    let cancel = CancellationToken::new();

    let base = drone_position(&drone).await;
    let path = vec![base.up(5.0), base.up(10.0), base.up(15.0)];
    drone.set_mission(&path).await.unwrap();
    drone.start_mission(&cancel, 0, 2).await.unwrap();
    drone.wait_until_arrived(&cancel, 2).await.unwrap();
    assert_eq!(drone.mission_reached(), 2);

    harness.controller.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_mission_is_rejected() {
    let mut harness = Harness::start(test_config());
    let (_sim, drone) = harness.spawn_sim(SimDroneConfig::default()).await;

    let path = vec![Gps::default(); 65_536];
    match drone.set_mission(&path).await {
        Err(StationError::MissionTooLong(len)) => assert_eq!(len, 65_536),
        other => panic!("expected MissionTooLong, got {other:?}"),
    }

    harness.controller.shutdown();
}

// ---------------------------------------------------------------------------
// Guided movement
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn move_until_reached_converges() {
    let mut harness = Harness::start(test_config());
    let (_sim, drone) = harness.spawn_sim(SimDroneConfig::default()).await;
    let cancel = CancellationToken::new();

    let base = drone_position(&drone).await;
    let target = Gps::new(base.lat + 0.0005, base.lon, base.alt + 10.0);
    drone
        .move_until_reached(&cancel, &target, 0.8)
        .await
        .unwrap();
    let arrived = drone.gps().expect("gps cached");
    assert!(arrived.distance_to(&target) <= 0.8);

    harness.controller.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_fills_boot_time_and_home() {
    let mut harness = Harness::start(test_config());
    let (_sim, drone) = harness.spawn_sim(SimDroneConfig::default()).await;
    let cancel = CancellationToken::new();

    drone.ping(&cancel).await.unwrap();
    assert!(drone.home_position().is_some());
    assert!(drone.boot_time_us().is_some());

    harness.controller.shutdown();
}

async fn drone_position(drone: &Arc<Drone>) -> Gps {
    let mut rx = drone.gps_watch();
    let guard = tokio::time::timeout(EVENT_TIMEOUT, rx.wait_for(|g| g.is_some()))
        .await
        .expect("gps timeout")
        .expect("gps watch open");
    (*guard).expect("gps present")
}
