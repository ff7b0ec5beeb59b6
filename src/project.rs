//! Analysis session: one project, one store, one tracker, one resolver.
//!
//! `Project` wires the cache components together by construction and owns their
//! lifecycle. The store is opened in [`Project::open`] and closed in
//! [`Project::close`] (or on drop), always after the tracker buffer has been flushed.

use crate::config::Settings;
use crate::error::{AppResult, TsError};
use crate::incident::Incident;
use crate::processing::kernels::{DefaultKernels, SignalKernels};
use crate::processing::labels::{LabelRegistry, LabelType, ProcessingLabel};
use crate::record::ProcessedRecord;
use crate::resolver::RecordResolver;
use crate::station::{Hypocenter, Station, StationFilter};
use crate::store::CacheStore;
use crate::tracker::IncidentTracker;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Records of one station, one slot per requested incident.
#[derive(Debug, Clone, PartialEq)]
pub struct StationRecords {
    /// Station the records belong to
    pub station_id: String,
    /// `None` where the incident has no data for the station or its request failed
    pub records: Vec<Option<ProcessedRecord>>,
}

/// Metadata side-by-side for several incidents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataTable {
    /// Column headers, in request order
    pub incidents: Vec<String>,
    /// `(parameter, value per incident)`, sorted by parameter
    pub rows: Vec<(String, Vec<String>)>,
}

impl fmt::Display for MetadataTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut widths = vec!["parameters".len()];
        widths.extend(self.incidents.iter().map(String::len));
        for (param, values) in &self.rows {
            widths[0] = widths[0].max(param.len());
            for (w, v) in widths[1..].iter_mut().zip(values) {
                *w = (*w).max(v.len());
            }
        }

        write!(f, "{:<w$}", "parameters", w = widths[0])?;
        for (name, w) in self.incidents.iter().zip(&widths[1..]) {
            write!(f, "  {:<w$}", name, w = *w)?;
        }
        writeln!(f)?;
        for (param, values) in &self.rows {
            write!(f, "{:<w$}", param, w = widths[0])?;
            for (value, w) in values.iter().zip(&widths[1..]) {
                write!(f, "  {:<w$}", value, w = *w)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// A processing session over one store file.
///
/// Owns the shared components and wires them together. Loaded incidents and stations
/// live only for the session; cached records and the index persist.
/// [`close`](Self::close) (or drop) flushes the index before closing the store.
pub struct Project {
    settings: Settings,
    store: Arc<CacheStore>,
    tracker: Arc<IncidentTracker>,
    labels: Arc<RwLock<LabelRegistry>>,
    resolver: RecordResolver,
    incidents: BTreeMap<String, Incident>,
    stations: Vec<Station>,
    closed: bool,
}

impl Project {
    /// Open a project with the built-in numeric kernels.
    pub fn open(settings: Settings) -> AppResult<Self> {
        Self::open_with_kernels(settings, Arc::new(DefaultKernels))
    }

    /// Open a project using `kernels` for every computation.
    pub fn open_with_kernels(settings: Settings, kernels: Arc<dyn SignalKernels>) -> AppResult<Self> {
        settings.validate()?;

        let store = Arc::new(CacheStore::open(settings.store_path(), settings.cache.capacity)?);
        let tracker = Arc::new(IncidentTracker::new(
            &settings.tracker_name(),
            Arc::clone(&store),
            settings.tracker.buffer_capacity,
        )?);
        let labels = Arc::new(RwLock::new(LabelRegistry::new()));
        let resolver = RecordResolver::new(
            Arc::clone(&store),
            Arc::clone(&tracker),
            Arc::clone(&labels),
            kernels,
        );

        let indexed = tracker.tracked_incidents()?.len();
        info!(project = %settings.project.name, indexed, "Opened project");

        Ok(Self {
            settings,
            store,
            tracker,
            labels,
            resolver,
            incidents: BTreeMap::new(),
            stations: Vec::new(),
            closed: false,
        })
    }

    /// Project name from the settings.
    pub fn name(&self) -> &str {
        &self.settings.project.name
    }

    /// Settings the project was opened with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Shared result store.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Shared incident index.
    pub fn tracker(&self) -> &Arc<IncidentTracker> {
        &self.tracker
    }

    /// Resolver used by the extraction calls.
    pub fn resolver(&self) -> &RecordResolver {
        &self.resolver
    }

    // ------------------------------------------------------------------
    // Incidents
    // ------------------------------------------------------------------

    /// Add a loaded incident and start tracking it.
    pub fn add_incident(&mut self, incident: Incident) -> AppResult<()> {
        if !self.store.is_connected() {
            return Err(TsError::StoreUnavailable(format!(
                "cannot add incident '{}': store is closed",
                incident.name
            )));
        }
        if self.incidents.contains_key(&incident.name) {
            return Err(TsError::DuplicateIncident(incident.name));
        }

        if self.tracker.is_tracking(&incident.name) {
            debug!(incident = %incident.name, "Resuming tracking from stored index");
        } else {
            self.tracker.start_tracking(&incident.name)?;
        }

        info!(incident = %incident.name, incident_type = %incident.incident_type, "Added incident");
        self.incidents.insert(incident.name.clone(), incident);
        Ok(())
    }

    /// Remove an incident and purge every cached record produced under it.
    ///
    /// Values are deleted first, then the index entry, then the file is compacted. An
    /// interrupted purge can leave an index entry whose values are gone; repeating the
    /// purge skips those. A failed compaction never leaves the index entry behind.
    /// Works for incidents only known from the stored index as well.
    pub fn remove_incident(&mut self, name: &str) -> AppResult<usize> {
        if !self.incidents.contains_key(name) && !self.tracker.is_tracking(name) {
            warn!(incident = %name, available = ?self.list_of_incidents(), "Unknown incident");
            return Err(TsError::UnknownIncident(name.to_string()));
        }

        let fingerprints = self.tracker.tracked_fingerprints(name)?;
        let mut removed = 0;
        for fp in &fingerprints {
            if self.store.delete(fp)? {
                removed += 1;
            } else {
                let inconsistency = TsError::IndexInconsistency {
                    incident: name.to_string(),
                    fingerprint: fp.to_hex(),
                };
                warn!(error = %inconsistency, "Skipping missing cache entry");
            }
        }
        self.tracker.remove_incident(name)?;
        self.incidents.remove(name);
        info!(incident = %name, removed, "Removed incident and its cached records");

        self.store.reclaim()?;
        Ok(removed)
    }

    /// Loaded incident names, sorted.
    pub fn list_of_incidents(&self) -> Vec<&str> {
        self.incidents.keys().map(String::as_str).collect()
    }

    /// A loaded incident by name.
    pub fn incident(&self, name: &str) -> Option<&Incident> {
        self.incidents.get(name)
    }

    /// Tabulate metadata of `names` side by side.
    ///
    /// Missing values are blank. With `only_differences`, rows whose values agree
    /// across all incidents are dropped.
    pub fn compare_incidents<S: AsRef<str>>(
        &self,
        names: &[S],
        only_differences: bool,
    ) -> AppResult<MetadataTable> {
        let incidents = names
            .iter()
            .map(|n| self.require_incident(n.as_ref()))
            .collect::<AppResult<Vec<_>>>()?;

        let params: BTreeSet<&String> = incidents
            .iter()
            .flat_map(|inc| inc.metadata.keys())
            .collect();

        let rows = params
            .into_iter()
            .map(|param| {
                let values: Vec<String> = incidents
                    .iter()
                    .map(|inc| inc.metadata.get(param).cloned().unwrap_or_default())
                    .collect();
                (param.clone(), values)
            })
            .filter(|(_, values)| {
                !only_differences || values.iter().collect::<BTreeSet<_>>().len() > 1
            })
            .collect();

        Ok(MetadataTable {
            incidents: incidents.iter().map(|inc| inc.name.clone()).collect(),
            rows,
        })
    }

    // ------------------------------------------------------------------
    // Stations, source, labels
    // ------------------------------------------------------------------

    /// Register the earthquake hypocenter (depth in meters).
    pub fn add_source_hypocenter(&mut self, lat: f64, lon: f64, depth: f64) -> AppResult<()> {
        let source = Hypocenter::new(lat, lon, depth)?;
        self.resolver.set_source(source);
        info!(lat, lon, depth, "Registered source hypocenter");
        Ok(())
    }

    /// Hypocenter registered with [`add_source_hypocenter`](Self::add_source_hypocenter).
    pub fn source_hypocenter(&self) -> Option<Hypocenter> {
        self.resolver.source()
    }

    /// Add a station, replacing any station with the same id.
    pub fn add_station(&mut self, station: Station) {
        match self.stations.iter_mut().find(|s| s.id == station.id) {
            Some(existing) => {
                warn!(station = %station.id, "Station redefined");
                *existing = station;
            }
            None => self.stations.push(station),
        }
    }

    /// Stations in insertion order.
    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    /// Register a processing label, replacing any label of the same name.
    ///
    /// Records cached under the old definition stay in the store; pipelines using the name
    /// resolve to the new definition from now on.
    pub fn add_processing_label<I, K>(
        &self,
        name: &str,
        label_type: LabelType,
        hyperparameters: I,
    ) -> AppResult<()>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        self.labels
            .write()
            .map_err(|_| TsError::Processing("label registry lock poisoned".to_string()))?
            .add(name, label_type, hyperparameters)
    }

    /// Registered labels, sorted by name.
    pub fn list_of_processing_labels(&self) -> Vec<ProcessingLabel> {
        self.labels
            .read()
            .map(|registry| registry.list_labels().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Supported label types with their hyperparameter names.
    pub fn valid_processing_labels(&self) -> Vec<(LabelType, &'static [&'static str])> {
        LabelRegistry::valid_label_types()
    }

    // ------------------------------------------------------------------
    // Extraction
    // ------------------------------------------------------------------

    /// Records for every station passing all `filters`, one slot per incident.
    ///
    /// `pipelines[i]` is applied to `incidents[i]`. Per-station failures are logged and
    /// leave `None` in the slot; store failures abort the whole request.
    pub fn extract_records<I, P, S>(
        &self,
        incidents: &[I],
        pipelines: &[P],
        filters: &[&dyn StationFilter],
    ) -> AppResult<Vec<StationRecords>>
    where
        I: AsRef<str>,
        P: AsRef<[S]>,
        S: AsRef<str>,
    {
        let request = self.prepare(incidents, pipelines)?;
        let stations = self.select_stations(filters);
        stations
            .into_iter()
            .map(|station| self.station_records(station, &request))
            .collect()
    }

    /// Same as [`extract_records`](Self::extract_records), spread over `workers` threads.
    ///
    /// Station order in the result matches the sequential version.
    pub fn extract_records_parallel<I, P, S>(
        &self,
        incidents: &[I],
        pipelines: &[P],
        filters: &[&dyn StationFilter],
        workers: usize,
    ) -> AppResult<Vec<StationRecords>>
    where
        I: AsRef<str>,
        P: AsRef<[S]>,
        S: AsRef<str>,
    {
        let request = self.prepare(incidents, pipelines)?;
        let stations = self.select_stations(filters);
        if stations.is_empty() {
            return Ok(Vec::new());
        }

        let chunk_size = stations.len().div_ceil(workers.max(1));
        let request = &request;
        let chunks: Vec<AppResult<Vec<StationRecords>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = stations
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|station| self.station_records(station, request))
                            .collect::<AppResult<Vec<_>>>()
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(TsError::Processing("extraction worker panicked".to_string()))
                    })
                })
                .collect()
        });

        let mut rows = Vec::with_capacity(stations.len());
        for chunk in chunks {
            rows.extend(chunk?);
        }
        Ok(rows)
    }

    fn prepare<I, P, S>(&self, incidents: &[I], pipelines: &[P]) -> AppResult<Vec<(&Incident, Vec<String>)>>
    where
        I: AsRef<str>,
        P: AsRef<[S]>,
        S: AsRef<str>,
    {
        if incidents.len() != pipelines.len() {
            return Err(TsError::InvalidRequest(format!(
                "{} incidents but {} pipelines; expected one pipeline per incident",
                incidents.len(),
                pipelines.len()
            )));
        }

        incidents
            .iter()
            .zip(pipelines)
            .map(|(name, pipeline)| {
                let incident = self.require_incident(name.as_ref())?;
                let pipeline: Vec<String> = pipeline
                    .as_ref()
                    .iter()
                    .map(|s| s.as_ref().to_string())
                    .collect();
                self.resolver.resolve_pipeline(pipeline.as_slice())?;
                Ok((incident, pipeline))
            })
            .collect()
    }

    fn select_stations(&self, filters: &[&dyn StationFilter]) -> Vec<&Station> {
        let source = self.resolver.source();
        self.stations
            .iter()
            .filter(|station| filters.iter().all(|f| f.accepts(station, source.as_ref())))
            .collect()
    }

    fn station_records(
        &self,
        station: &Station,
        request: &[(&Incident, Vec<String>)],
    ) -> AppResult<StationRecords> {
        let mut records = Vec::with_capacity(request.len());
        for (incident, pipeline) in request {
            match self.resolver.get_record(station, incident, pipeline.as_slice()) {
                Ok(record) => records.push(record),
                Err(e) if e.is_batch_fatal() => return Err(e),
                Err(e) => {
                    warn!(station = %station.id, incident = %incident.name, error = %e, "Record unavailable");
                    records.push(None);
                }
            }
        }
        Ok(StationRecords {
            station_id: station.id.clone(),
            records,
        })
    }

    fn require_incident(&self, name: &str) -> AppResult<&Incident> {
        self.incidents
            .get(name)
            .ok_or_else(|| TsError::UnknownIncident(name.to_string()))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Flush the incident index, then close the store.
    pub fn close(&mut self) -> AppResult<()> {
        if self.closed {
            return Ok(());
        }
        let flushed = self.tracker.flush()?;
        self.store.close()?;
        self.closed = true;
        info!(project = %self.settings.project.name, flushed, "Closed project");
        Ok(())
    }

    /// Whether [`close`](Self::close) has completed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Project {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(project = %self.settings.project.name, error = %e, "Failed to close project");
        }
    }
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.settings.project.name)
            .field("incidents", &self.list_of_incidents())
            .field("stations", &self.stations.len())
            .field("closed", &self.closed)
            .finish()
    }
}
