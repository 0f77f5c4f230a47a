//! LED flash loops. Each loop is a cancellable background task; the director
//! cancels the previous loop before starting the next on every state
//! transition. LED write failures are logged and skipped, as lighting is
//! best-effort.

use std::sync::Arc;
use std::time::Duration;

use mavswarm::{Color, Drone};
use tokio_util::sync::CancellationToken;
use tracing::trace;

const RAINBOW: [Color; 7] = [
    Color::rgb(0xff, 0x00, 0x00),
    Color::rgb(0xff, 0x7f, 0x00),
    Color::rgb(0xff, 0xff, 0x00),
    Color::rgb(0x00, 0xff, 0x00),
    Color::rgb(0x00, 0xff, 0xff),
    Color::rgb(0x00, 0x00, 0xff),
    Color::rgb(0x8f, 0x00, 0xff),
];

const RED: Color = Color::rgb(0xff, 0x00, 0x00);
const YELLOW: Color = Color::rgb(0xff, 0xff, 0x00);

/// Timing of the warning flash: `slow_period` per color for
/// `escalate_after`, then `fast_period` indefinitely.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WarningTiming {
    pub slow_period: Duration,
    pub fast_period: Duration,
    pub escalate_after: Duration,
}

/// Cycle the rainbow palette until cancelled. Marks the drone currently
/// under pre-assignment.
pub(crate) fn spawn_rainbow(drone: Arc<Drone>, cancel: CancellationToken, period: Duration) {
    tokio::spawn(async move {
        for color in RAINBOW.iter().cycle() {
            if let Err(err) = drone.active_led(*color, period).await {
                trace!(id = drone.id(), "led write failed: {err}");
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
        }
    });
}

/// Alternate red/yellow, speeding up once `escalate_after` has elapsed.
/// Marks a drone in transfer.
pub(crate) fn spawn_warning(drone: Arc<Drone>, cancel: CancellationToken, timing: WarningTiming) {
    tokio::spawn(async move {
        let started = tokio::time::Instant::now();
        let mut colors = [RED, YELLOW].into_iter().cycle();
        loop {
            let period = if started.elapsed() < timing.escalate_after {
                timing.slow_period
            } else {
                timing.fast_period
            };
            let color = colors.next().expect("cycle never ends");
            if let Err(err) = drone.active_led(color, period).await {
                trace!(id = drone.id(), "led write failed: {err}");
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
        }
    });
}
