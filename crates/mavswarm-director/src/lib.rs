//! Sequential slot-assignment director for a drone fleet: claims one drone
//! at a time, runs pluggable pre-flight inspections, and transfers it onto
//! the next geographic slot through a guided three-point trajectory.

pub mod director;
pub mod error;
mod flash;
pub mod inspect;

pub use director::{Director, DirectorConfig};
pub use error::DirectorError;
pub use inspect::{AttitudeInspector, BatteryInspector, GpsTypeInspector, Inspector};
