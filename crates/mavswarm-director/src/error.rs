use mavlink::ardupilotmega::GpsFixType;
use mavswarm::StationError;

#[derive(Debug, thiserror::Error)]
pub enum DirectorError {
    #[error("another drone is already being assigned")]
    Busy,
    #[error("all slots are filled")]
    SlotsFull,
    #[error("drone is already assigned to a slot")]
    AlreadyAssigned,
    #[error("no drone is being assigned")]
    NoAssignment,
    #[error("drone has no GPS position")]
    GpsUnavailable,
    #[error("inspection step {seq} failed: {source}")]
    Inspect {
        seq: usize,
        #[source]
        source: Box<DirectorError>,
    },
    #[error("GPS fix {got:?} is below RTK fixed")]
    GpsFixTooLow { got: GpsFixType },
    #[error("vibration {got:.2} exceeds limit {limit:.2}")]
    ExcessVibration { got: f32, limit: f32 },
    #[error("attitude unknown")]
    AttitudeUnavailable,
    #[error("tilt pitch {pitch:.1}°, roll {roll:.1}° exceeds {limit:.1}°")]
    TiltTooHigh { pitch: f32, roll: f32, limit: f32 },
    #[error("battery voltage {got:.2} V below {want:.2} V")]
    VoltageTooLow { got: f32, want: f32 },
    #[error("drone moved {distance:.2} m since inspection")]
    MovedSinceInspection { distance: f32 },
    #[error("expected flight mode {want}, drone is in {got}")]
    WrongMode { got: u32, want: u32 },
    #[error(transparent)]
    Station(#[from] StationError),
}
