use derive_more::{Display, Error};
use geo::{GeodesicDistance, Point};
use serde::{Deserialize, Serialize};

/// WGS-84 coordinate in decimal degrees.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGeoPoint")]
pub struct GeoPoint {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
struct RawGeoPoint {
    lat: f64,
    lon: f64,
}

impl TryFrom<RawGeoPoint> for GeoPoint {
    type Error = GeoError;

    fn try_from(value: RawGeoPoint) -> Result<Self, Self::Error> {
        GeoPoint::new(value.lat, value.lon)
    }
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Result<Self, GeoError> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(GeoError::InvalidLatitude);
        }
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            return Err(GeoError::InvalidLongitude);
        }
        Ok(Self { lat, lon })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }

    /// Geodesic distance in meters on the WGS-84 ellipsoid.
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        Point::new(self.lon, self.lat).geodesic_distance(&Point::new(other.lon, other.lat))
    }
}

/// A geocoded place, optionally with the street address it was resolved from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub point: GeoPoint,
    pub address: Option<String>,
}

impl Location {
    pub fn new(point: GeoPoint, address: Option<String>) -> Self {
        Self { point, address }
    }
}

impl From<GeoPoint> for Location {
    fn from(point: GeoPoint) -> Self {
        Self {
            point,
            address: None,
        }
    }
}

#[derive(Error, Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoError {
    #[display(fmt = "Latitude must be within -90..=90")]
    InvalidLatitude,
    #[display(fmt = "Longitude must be within -180..=180")]
    InvalidLongitude,
    #[display(fmt = "Radius must be a positive number of meters")]
    InvalidRadius,
}

/// Validates a search radius in meters.
pub fn validate_radius(radius_meters: f64) -> Result<f64, GeoError> {
    if radius_meters.is_finite() && radius_meters > 0.0 {
        Ok(radius_meters)
    } else {
        Err(GeoError::InvalidRadius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_out_of_range_coordinates() {
        assert_eq!(GeoPoint::new(91.0, 0.0), Err(GeoError::InvalidLatitude));
        assert_eq!(GeoPoint::new(0.0, -180.5), Err(GeoError::InvalidLongitude));
        assert_eq!(GeoPoint::new(f64::NAN, 0.0), Err(GeoError::InvalidLatitude));
        assert!(GeoPoint::new(-90.0, 180.0).is_ok());
    }

    #[test]
    fn test_geodesic_distance() {
        // Paris to London is about 343.9 km on the ellipsoid.
        let paris = GeoPoint::new(48.8566, 2.3522).unwrap();
        let london = GeoPoint::new(51.5074, -0.1278).unwrap();
        let d = paris.distance_to(&london);
        assert!((d - 343_900.0).abs() < 1_500.0, "distance was {d}");
        assert_eq!(paris.distance_to(&paris), 0.0);
    }

    #[test]
    fn test_one_degree_of_latitude_differs_by_latitude() {
        let equator = GeoPoint::new(0.0, 0.0)
            .unwrap()
            .distance_to(&GeoPoint::new(1.0, 0.0).unwrap());
        let polar = GeoPoint::new(88.0, 0.0)
            .unwrap()
            .distance_to(&GeoPoint::new(89.0, 0.0).unwrap());
        assert!(equator < 110_700.0);
        assert!(polar > 111_600.0);
    }

    #[test]
    fn test_deserialize_validates() {
        assert!(serde_json::from_str::<GeoPoint>(r#"{"lat": 10.0, "lon": 20.0}"#).is_ok());
        assert!(serde_json::from_str::<GeoPoint>(r#"{"lat": 100.0, "lon": 20.0}"#).is_err());
    }

    #[test]
    fn test_radius() {
        assert!(validate_radius(0.0).is_err());
        assert!(validate_radius(-5.0).is_err());
        assert_eq!(validate_radius(1_000.0), Ok(1_000.0));
    }
}
