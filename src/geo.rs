// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Mean earth radius in meters.
pub const EARTH_RADIUS: f64 = 6_371_000.0;

/// A WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> GeoPoint {
        GeoPoint {
            latitude,
            longitude,
        }
    }

    /// Moves the point by `x` meters along the longitude and `y` meters along
    /// the latitude, using the flat earth approximation which holds over the
    /// sensor range.
    pub fn offset(&self, x: f64, y: f64) -> GeoPoint {
        let latitude = self.latitude + (y / EARTH_RADIUS).to_degrees();
        let longitude =
            self.longitude + (x / (EARTH_RADIUS * self.latitude.to_radians().cos())).to_degrees();
        GeoPoint {
            latitude,
            longitude,
        }
    }

    /// Position of a reflection seen at `range` meters and `azimuth`
    /// degrees from a sensor located at this point.
    pub fn target_position(&self, range: f64, azimuth: f64) -> GeoPoint {
        let azimuth = azimuth.rem_euclid(360.0).to_radians();
        self.offset(range * azimuth.cos(), range * azimuth.sin())
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:.8},\t{:.8}", self.latitude, self.longitude)
    }
}

/// Movement of a target relative to the sensor, from its radial velocity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Static,
    Incoming,
    Outgoing,
}

impl Direction {
    /// Positive radial velocities approach the sensor.
    pub fn from_velocity(velocity: f32) -> Direction {
        if velocity > 0.0 {
            Direction::Incoming
        } else if velocity < 0.0 {
            Direction::Outgoing
        } else {
            Direction::Static
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Static => write!(f, "Static"),
            Direction::Incoming => write!(f, "Incoming"),
            Direction::Outgoing => write!(f, "Outgoing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(point: GeoPoint, latitude: f64, longitude: f64) {
        assert!((point.latitude - latitude).abs() < 1e-8, "{:?}", point);
        assert!((point.longitude - longitude).abs() < 1e-8, "{:?}", point);
    }

    #[test]
    fn test_target_position() {
        let radar = GeoPoint::new(22.345678, 73.123456);
        assert_close(radar.target_position(100.0, 45.0), 22.34631392, 73.12414355);

        let equator = GeoPoint::default();
        assert_close(equator.target_position(200.0, 0.0), 0.0, 0.00179864);
    }

    #[test]
    fn test_negative_azimuth_wraps() {
        let radar = GeoPoint::new(48.137154, 11.576124);
        let point = radar.target_position(50.0, -90.0);
        assert_close(point, 48.13670434, 11.576124);
        assert_eq!(point, radar.target_position(50.0, 270.0));
    }

    #[test]
    fn test_zero_offset() {
        let radar = GeoPoint::new(-33.8688, 151.2093);
        assert_eq!(radar.offset(0.0, 0.0), radar);
        assert_eq!(radar.target_position(0.0, 123.0), radar);
    }

    #[test]
    fn test_direction() {
        assert_eq!(Direction::from_velocity(0.0), Direction::Static);
        assert_eq!(Direction::from_velocity(-0.0), Direction::Static);
        assert_eq!(Direction::from_velocity(1.5), Direction::Incoming);
        assert_eq!(Direction::from_velocity(-2.0), Direction::Outgoing);
        assert_eq!(Direction::Incoming.to_string(), "Incoming");
    }
}
