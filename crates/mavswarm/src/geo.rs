use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6.371e6;

/// Blend factor for the reference altitude used by the curved distance,
/// weighted toward the lower of the two endpoints.
const ALT_BLEND: f64 = 0.618_033_988_749_895;

/// A geodetic position: latitude/longitude in degrees, altitude in meters.
///
/// On the wire MAVLink carries latitude/longitude as `i32` degrees scaled by
/// 1e7 and altitude as `i32` millimeters; [`Gps::from_wgs84`] and
/// [`Gps::to_wgs84`] convert between the two representations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Gps {
    pub lat: f32,
    pub lon: f32,
    pub alt: f32,
}

impl Gps {
    pub fn new(lat: f32, lon: f32, alt: f32) -> Self {
        Self { lat, lon, alt }
    }

    pub fn from_wgs84(lat: i32, lon: i32, alt_mm: i32) -> Self {
        Self {
            lat: lat as f32 / 1e7,
            lon: lon as f32 / 1e7,
            alt: alt_mm as f32 / 1e3,
        }
    }

    /// Scaled integer latitude/longitude as carried by MAVLink messages.
    pub fn to_wgs84(&self) -> (i32, i32) {
        ((self.lat as f64 * 1e7) as i32, (self.lon as f64 * 1e7) as i32)
    }

    pub fn alt_mm(&self) -> i32 {
        (self.alt as f64 * 1e3) as i32
    }

    /// The same position lifted by `height` meters.
    pub fn up(&self, height: f32) -> Self {
        Self {
            lat: self.lat,
            lon: self.lon,
            alt: self.alt + height,
        }
    }

    /// Curved distance between two positions in meters, including the
    /// altitude difference.
    pub fn distance_to(&self, other: &Gps) -> f32 {
        let (min_alt, max_alt) = if self.alt <= other.alt {
            (self.alt as f64, other.alt as f64)
        } else {
            (other.alt as f64, self.alt as f64)
        };
        let mid_alt = min_alt * ALT_BLEND + max_alt * (1.0 - ALT_BLEND);
        let base = self.arc_angle(other) * (EARTH_RADIUS_M + mid_alt);
        let high = (self.alt - other.alt) as f64;
        (base * base + high * high).sqrt() as f32
    }

    /// Great-circle distance in meters ignoring altitude.
    pub fn distance_no_alt(&self, other: &Gps) -> f32 {
        (self.arc_angle(other) * EARTH_RADIUS_M) as f32
    }

    fn arc_angle(&self, other: &Gps) -> f64 {
        let lat_a = (self.lat as f64).to_radians();
        let lat_b = (other.lat as f64).to_radians();
        let dlon = ((self.lon - other.lon) as f64).to_radians();
        let cos_angle = lat_a.sin() * lat_b.sin() + lat_a.cos() * lat_b.cos() * dlon.cos();
        // Guard acos against float drift for near-identical positions.
        cos_angle.clamp(-1.0, 1.0).acos()
    }
}

/// Vehicle attitude in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rotate {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl Rotate {
    /// Convert from the radian attitude carried by MAVLink.
    pub fn from_radians(roll: f32, pitch: f32, yaw: f32) -> Self {
        Self {
            roll: roll.to_degrees(),
            pitch: pitch.to_degrees(),
            yaw: yaw.to_degrees(),
        }
    }
}

/// Shortest signed angular difference `a - b` in degrees, in `(-180, 180]`.
pub fn angle_diff(a: f32, b: f32) -> f32 {
    let mut d = (a - b) % 360.0;
    if d > 180.0 {
        d -= 360.0;
    } else if d <= -180.0 {
        d += 360.0;
    }
    d
}

/// An RGB LED color.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wgs84_roundtrip() {
        let g = Gps::new(47.397742, 8.545594, 12.5);
        let (lat, lon) = g.to_wgs84();
        let back = Gps::from_wgs84(lat, lon, g.alt_mm());
        assert!((back.lat - g.lat).abs() < 1e-5);
        assert!((back.lon - g.lon).abs() < 1e-5);
        assert!((back.alt - g.alt).abs() < 1e-2);
    }

    #[test]
    fn distance_to_self_is_zero() {
        let g = Gps::new(-33.8568, 151.2153, 40.0);
        assert_eq!(g.distance_to(&g), 0.0);
        assert_eq!(g.distance_no_alt(&g), 0.0);
    }

    #[test]
    fn vertical_distance_dominated_by_altitude() {
        let a = Gps::new(10.0, 10.0, 0.0);
        let b = a.up(30.0);
        let d = a.distance_to(&b);
        assert!((d - 30.0).abs() < 0.1, "got {d}");
        assert_eq!(a.distance_no_alt(&b), 0.0);
    }

    #[test]
    fn one_degree_longitude_at_equator() {
        let a = Gps::new(0.0, 0.0, 0.0);
        let b = Gps::new(0.0, 1.0, 0.0);
        let d = a.distance_no_alt(&b);
        // One degree of arc at the mean Earth radius is ~111.2 km.
        assert!((d - 111_194.0).abs() < 100.0, "got {d}");
    }

    #[test]
    fn up_only_changes_altitude() {
        let g = Gps::new(1.0, 2.0, 3.0);
        let lifted = g.up(4.0);
        assert_eq!(lifted.lat, 1.0);
        assert_eq!(lifted.lon, 2.0);
        assert_eq!(lifted.alt, 7.0);
    }

    #[test]
    fn angle_diff_wraps() {
        assert_eq!(angle_diff(10.0, 350.0), 20.0);
        assert_eq!(angle_diff(350.0, 10.0), -20.0);
        assert_eq!(angle_diff(180.0, 0.0), 180.0);
        assert_eq!(angle_diff(90.0, 90.0), 0.0);
    }

    #[test]
    fn rotate_from_radians() {
        let r = Rotate::from_radians(std::f32::consts::PI, 0.0, std::f32::consts::FRAC_PI_2);
        assert!((r.roll - 180.0).abs() < 1e-4);
        assert_eq!(r.pitch, 0.0);
        assert!((r.yaw - 90.0).abs() < 1e-4);
    }
}
