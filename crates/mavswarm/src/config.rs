use std::time::Duration;

/// Station-wide tunables. The defaults match real-link behavior; tests
/// compress the timings.
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Our MAVLink system id. `0xFE` by ground-station convention.
    pub system_id: u8,
    /// Our MAVLink component id (`MAV_COMP_ID_AUTOPILOT1`).
    pub component_id: u8,
    /// Period of the station heartbeat broadcast.
    pub heartbeat_interval: Duration,
    /// A drone with no traffic for this long is considered disconnected.
    pub inactive_timeout: Duration,
    /// Resend interval for long-form commands awaiting their ack.
    pub command_ping: Duration,
    /// Capacity of the controller event channel.
    pub event_buffer: usize,
    /// First retry delay after an endpoint fails to open.
    pub reopen_delay_min: Duration,
    /// Upper bound for the endpoint reopen backoff.
    pub reopen_delay_max: Duration,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            system_id: 0xFE,
            component_id: 1,
            heartbeat_interval: Duration::from_millis(500),
            inactive_timeout: Duration::from_secs(3),
            command_ping: Duration::from_millis(200),
            event_buffer: 8,
            reopen_delay_min: Duration::from_millis(250),
            reopen_delay_max: Duration::from_secs(3),
        }
    }
}
