//! Incidents: simulation runs or recorded events contributing raw signals.
//!
//! An incident is described by a `description.txt` file in its folder:
//!
//! ```text
//! incident_name = hercules_101
//! incident_type = hercules
//! # free-form metadata follows
//! simulation_duration = 60
//! ```
//!
//! Parsing of the instrument/simulation output itself belongs to the incident's
//! [`RawSignalProvider`]; this module only deals with identity and metadata.

use crate::error::{AppResult, TsError};
use crate::signal::RawSignal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Name of the description file inside an incident folder.
pub const DESCRIPTION_FILE: &str = "description.txt";

/// Supported incident formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    /// Hercules finite-element simulation output
    Hercules,
    /// AWP-ODC finite-difference simulation output
    Awp,
    /// RWG broadband simulation output
    Rwg,
    /// Recorded event in CESMD V2 format
    CesmdV2,
}

impl IncidentType {
    /// Every supported type.
    pub const ALL: [IncidentType; 4] = [
        IncidentType::Hercules,
        IncidentType::Awp,
        IncidentType::Rwg,
        IncidentType::CesmdV2,
    ];

    /// Name as written in `description.txt`.
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::Hercules => "hercules",
            IncidentType::Awp => "awp",
            IncidentType::Rwg => "rwg",
            IncidentType::CesmdV2 => "cesmd_v2",
        }
    }

    /// Inverse of [`as_str`](Self::as_str).
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed contents of an incident's description file.
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentDescription {
    /// Value of `incident_name`
    pub name: String,
    /// Value of `incident_type`
    pub incident_type: IncidentType,
    /// Every key/value in the file plus `incident_folder`
    pub entries: BTreeMap<String, String>,
}

impl IncidentDescription {
    /// Read `description.txt` from an incident folder.
    pub fn read<P: AsRef<Path>>(folder: P) -> AppResult<Self> {
        let folder = folder.as_ref();
        let text = std::fs::read_to_string(folder.join(DESCRIPTION_FILE))?;
        let mut description = Self::parse(&text)?;
        description.entries.insert(
            "incident_folder".to_string(),
            folder.display().to_string(),
        );
        Ok(description)
    }

    /// Parse `key = value` lines. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> AppResult<Self> {
        let mut entries = BTreeMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                TsError::Description(format!("line {}: expected 'key = value'", lineno + 1))
            })?;
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }

        let name = entries
            .get("incident_name")
            .filter(|n| !n.is_empty())
            .cloned()
            .ok_or_else(|| TsError::Description("incident_name is not provided".to_string()))?;
        let type_name = entries
            .get("incident_type")
            .ok_or_else(|| TsError::Description("incident_type is not provided".to_string()))?;
        let incident_type = IncidentType::parse(type_name).ok_or_else(|| {
            TsError::Description(format!(
                "incident type '{}' is not supported (valid incidents: {})",
                type_name,
                IncidentType::ALL
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;

        Ok(Self {
            name,
            incident_type,
            entries,
        })
    }
}

/// Storage layer of an incident: hands out raw signals per station.
pub trait RawSignalProvider: Send + Sync {
    /// The raw signal recorded at `station_id`, or `None` if this incident has no data there.
    fn get_raw_signal(&self, station_id: &str) -> AppResult<Option<RawSignal>>;
}

/// Provider backed by signals already held in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemorySignalProvider {
    signals: HashMap<String, RawSignal>,
}

impl InMemorySignalProvider {
    /// Empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_signal(mut self, station_id: &str, signal: RawSignal) -> Self {
        self.insert(station_id, signal);
        self
    }

    /// Store the signal recorded at `station_id`, replacing any previous one.
    pub fn insert(&mut self, station_id: &str, signal: RawSignal) {
        self.signals.insert(station_id.to_string(), signal);
    }
}

impl RawSignalProvider for InMemorySignalProvider {
    fn get_raw_signal(&self, station_id: &str) -> AppResult<Option<RawSignal>> {
        Ok(self.signals.get(station_id).cloned())
    }
}

/// A loaded incident.
#[derive(Clone)]
pub struct Incident {
    /// Unique name within a project
    pub name: String,
    /// Storage format
    pub incident_type: IncidentType,
    /// Free-form metadata from the description file
    pub metadata: BTreeMap<String, String>,
    provider: Arc<dyn RawSignalProvider>,
}

impl Incident {
    /// Incident named `name`, reading raw signals through `provider`.
    pub fn new(
        name: &str,
        incident_type: IncidentType,
        provider: Arc<dyn RawSignalProvider>,
    ) -> Self {
        Self {
            name: name.to_string(),
            incident_type,
            metadata: BTreeMap::new(),
            provider,
        }
    }

    /// Build an incident from its parsed description file.
    pub fn from_description(
        description: IncidentDescription,
        provider: Arc<dyn RawSignalProvider>,
    ) -> Self {
        Self {
            name: description.name,
            incident_type: description.incident_type,
            metadata: description.entries,
            provider,
        }
    }

    /// Attach one metadata entry.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Raw signal at `station_id`, as handed out by the provider.
    pub fn raw_signal(&self, station_id: &str) -> AppResult<Option<RawSignal>> {
        self.provider.get_raw_signal(station_id)
    }
}

impl fmt::Debug for Incident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incident")
            .field("name", &self.name)
            .field("incident_type", &self.incident_type)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
