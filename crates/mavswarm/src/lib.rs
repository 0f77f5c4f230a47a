//! Coordination core of a multi-drone ground station: a MAVLink controller
//! that multiplexes a fleet of flight controllers over serial/UDP/TCP links,
//! plus a u-blox RTK base-station subsystem whose correction stream is
//! fragmented and broadcast to the fleet.

pub mod config;
pub mod controller;
pub mod drone;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod geo;
pub mod rtcm;
pub mod rtk;
pub mod sim;
pub mod status;

pub use config::StationConfig;
pub use controller::Controller;
pub use drone::{BatteryStat, Drone, Wind};
pub use endpoint::Endpoint;
pub use error::StationError;
pub use events::Event;
pub use geo::{angle_diff, Color, Gps, Rotate};
pub use rtk::{NavSvin, RtkBase, RtkConfig, RtkConn, SatelliteConfig, UbxMessage};
pub use status::DroneStatus;
