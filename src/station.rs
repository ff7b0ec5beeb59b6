//! Stations, the seismic source and station selection.

use crate::error::{AppResult, TsError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Latitude in degrees, within `[-90, 90]`.
pub fn is_lat_valid(lat: f64) -> bool {
    (-90.0..=90.0).contains(&lat)
}

/// Longitude in degrees, within `[-180, 180]`.
pub fn is_lon_valid(lon: f64) -> bool {
    (-180.0..=180.0).contains(&lon)
}

/// Depth in meters, positive toward the Earth's interior.
pub fn is_depth_valid(depth: f64) -> bool {
    depth.is_finite() && depth >= 0.0
}

fn validate_position(lat: f64, lon: f64, depth: f64) -> AppResult<()> {
    if !is_lat_valid(lat) {
        return Err(TsError::InvalidCoordinate(format!(
            "latitude {} outside [-90, 90]",
            lat
        )));
    }
    if !is_lon_valid(lon) {
        return Err(TsError::InvalidCoordinate(format!(
            "longitude {} outside [-180, 180]",
            lon
        )));
    }
    if !is_depth_valid(depth) {
        return Err(TsError::InvalidCoordinate(format!(
            "depth {} must be non-negative",
            depth
        )));
    }
    Ok(())
}

/// Great-circle distance in km between two points given in degrees.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// Earthquake hypocenter registered on the project.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hypocenter {
    /// Degrees north
    pub lat: f64,
    /// Degrees east
    pub lon: f64,
    /// Meters, positive down
    pub depth: f64,
}

impl Hypocenter {
    /// Validated hypocenter.
    pub fn new(lat: f64, lon: f64, depth: f64) -> AppResult<Self> {
        validate_position(lat, lon, depth)?;
        Ok(Self { lat, lon, depth })
    }
}

/// A recording station, shared read-only across incidents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    /// Project-wide identifier
    pub id: String,
    /// Degrees north
    pub lat: f64,
    /// Degrees east
    pub lon: f64,
    /// Meters, positive down
    pub depth: f64,
    /// Name of this station inside each incident (incident name -> station name)
    pub incident_names: BTreeMap<String, String>,
    /// Azimuths of the two horizontal sensor components, degrees from north
    pub orientation: (f64, f64),
    /// Free-form sensor description (network, instrument, ...)
    pub sensor: BTreeMap<String, String>,
}

impl Station {
    /// Validated station with default orientation `(0, 90)`.
    pub fn new(id: &str, lat: f64, lon: f64, depth: f64) -> AppResult<Self> {
        validate_position(lat, lon, depth)?;
        Ok(Self {
            id: id.to_string(),
            lat,
            lon,
            depth,
            incident_names: BTreeMap::new(),
            orientation: (0.0, 90.0),
            sensor: BTreeMap::new(),
        })
    }

    /// Name the station carries inside `incident`.
    pub fn with_incident_name(mut self, incident: &str, name: &str) -> Self {
        self.incident_names
            .insert(incident.to_string(), name.to_string());
        self
    }

    /// Azimuths of the horizontal components.
    pub fn with_orientation(mut self, h1: f64, h2: f64) -> Self {
        self.orientation = (h1, h2);
        self
    }

    /// Add a sensor description entry.
    pub fn with_sensor(mut self, key: &str, value: &str) -> Self {
        self.sensor.insert(key.to_string(), value.to_string());
        self
    }

    /// Name of the station inside `incident`, falling back to the station id.
    pub fn name_in(&self, incident: &str) -> &str {
        self.incident_names
            .get(incident)
            .map(String::as_str)
            .unwrap_or(&self.id)
    }

    /// Epicentral (surface) distance to the source in km.
    pub fn epicentral_distance_km(&self, source: &Hypocenter) -> f64 {
        haversine_km(self.lat, self.lon, source.lat, source.lon)
    }
}

/// Predicate selecting stations for a bulk request.
pub trait StationFilter: Send + Sync {
    /// Whether `station` belongs to the selection.
    fn accepts(&self, station: &Station, source: Option<&Hypocenter>) -> bool;
}

/// Keep stations whose epicentral distance falls in `[min_km, max_km]`.
///
/// Without a registered source no station passes.
#[derive(Debug, Clone, Copy)]
pub struct EpicentralDistanceFilter {
    /// Lower bound, inclusive
    pub min_km: f64,
    /// Upper bound, inclusive
    pub max_km: f64,
}

impl StationFilter for EpicentralDistanceFilter {
    fn accepts(&self, station: &Station, source: Option<&Hypocenter>) -> bool {
        source
            .map(|s| station.epicentral_distance_km(s))
            .is_some_and(|d| d >= self.min_km && d <= self.max_km)
    }
}

/// Keep stations inside a latitude/longitude box.
#[derive(Debug, Clone, Copy)]
pub struct RectangleFilter {
    /// Southern edge
    pub min_lat: f64,
    /// Northern edge
    pub max_lat: f64,
    /// Western edge
    pub min_lon: f64,
    /// Eastern edge
    pub max_lon: f64,
}

impl StationFilter for RectangleFilter {
    fn accepts(&self, station: &Station, _source: Option<&Hypocenter>) -> bool {
        (self.min_lat..=self.max_lat).contains(&station.lat)
            && (self.min_lon..=self.max_lon).contains(&station.lon)
    }
}
