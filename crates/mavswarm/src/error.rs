use mavlink::ardupilotmega::{MavCmd, MavMissionResult, MavResult};

#[derive(Debug, thiserror::Error)]
pub enum StationError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("station shut down")]
    Shutdown,
    #[error("operation cancelled")]
    Cancelled,
    #[error("command {0:?} already in flight")]
    CommandPending(MavCmd),
    #[error("command rejected: {0:?}")]
    CommandResult(MavResult),
    #[error("already requesting message {0}")]
    RequestPending(u32),
    #[error("mission rejected: {0:?}")]
    MissionResult(MavMissionResult),
    #[error("mission of {0} items exceeds the 65535-item limit")]
    MissionTooLong(usize),
    #[error("drone has no GPS fix yet")]
    GpsUnavailable,
    #[error("RTK port closed")]
    RtkClosed,
    #[error("malformed u-blox frame: {0}")]
    UbxCodec(String),
    #[error("{}", join_errors(.0))]
    Multiple(Vec<StationError>),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[StationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl StationError {
    pub(crate) fn transport<E: std::fmt::Display>(err: E) -> Self {
        StationError::Transport(err.to_string())
    }
}
