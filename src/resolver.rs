//! Record resolver: fingerprint, look up, compute on miss, persist, attribute.
//!
//! For each `(station, incident, pipeline)` request the resolver
//!
//! 1. asks the incident for the station's raw signal (`None` short-circuits to
//!    `Ok(None)` without touching the cache),
//! 2. resolves a private copy of the pipeline against the label registry,
//! 3. fingerprints the resolved pipeline,
//! 4. returns the stored record on a hit, or runs the kernels, stores the result and
//!    registers the fingerprint with the tracker on a miss.
//!
//! At most one computation per fingerprint is in flight at any time: concurrent
//! requests for the same fingerprint wait on a per-fingerprint lock and then read the
//! first caller's result from the store.

use crate::error::{AppResult, TsError};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::incident::Incident;
use crate::processing::kernels::SignalKernels;
use crate::processing::labels::{LabelRegistry, ProcessingLabel};
use crate::record::ProcessedRecord;
use crate::station::{Hypocenter, Station};
use crate::signal::RawSignal;
use crate::store::CacheStore;
use crate::tracker::IncidentTracker;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Running counters of resolver outcomes.
#[derive(Debug, Default)]
pub struct ResolverCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    absent: AtomicU64,
}

/// Snapshot of [`ResolverCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolverStats {
    /// Requests served from the store
    pub hits: u64,
    /// Requests that ran the pipeline
    pub misses: u64,
    /// Requests for a station the incident has no data for
    pub absent: u64,
}

/// Serves processed records from the store, computing them on a miss.
///
/// Identical concurrent requests compute once; the others wait and then read the
/// stored result.
pub struct RecordResolver {
    store: Arc<CacheStore>,
    tracker: Arc<IncidentTracker>,
    labels: Arc<RwLock<LabelRegistry>>,
    kernels: Arc<dyn SignalKernels>,
    source: RwLock<Option<Hypocenter>>,
    in_flight: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
    counters: ResolverCounters,
}

impl RecordResolver {
    /// Resolver over shared components; no source is set.
    pub fn new(
        store: Arc<CacheStore>,
        tracker: Arc<IncidentTracker>,
        labels: Arc<RwLock<LabelRegistry>>,
        kernels: Arc<dyn SignalKernels>,
    ) -> Self {
        Self {
            store,
            tracker,
            labels,
            kernels,
            source: RwLock::new(None),
            in_flight: Mutex::new(HashMap::new()),
            counters: ResolverCounters::default(),
        }
    }

    /// Register the hypocenter used for epicentral distances.
    pub fn set_source(&self, source: Hypocenter) {
        if let Ok(mut slot) = self.source.write() {
            *slot = Some(source);
        }
    }

    /// Hypocenter set by [`set_source`](Self::set_source).
    pub fn source(&self) -> Option<Hypocenter> {
        self.source.read().ok().and_then(|s| *s)
    }

    /// Resolve label names into a snapshot of their current definitions.
    pub fn resolve_pipeline<S: AsRef<str>>(&self, names: &[S]) -> AppResult<Vec<ProcessingLabel>> {
        self.labels
            .read()
            .map_err(|_| TsError::Processing("label registry lock poisoned".to_string()))?
            .resolve_pipeline(names)
    }

    /// Fingerprint a request without resolving it.
    pub fn fingerprint_for<S: AsRef<str>>(
        &self,
        station: &Station,
        incident: &Incident,
        pipeline: &[S],
    ) -> AppResult<Fingerprint> {
        let labels = self.resolve_pipeline(pipeline)?;
        Ok(fingerprint(&station.id, &incident.name, &labels))
    }

    /// The processed record of `station` under `incident` and `pipeline`.
    ///
    /// Returns `Ok(None)` when the incident holds no signal for the station.
    pub fn get_record<S: AsRef<str>>(
        &self,
        station: &Station,
        incident: &Incident,
        pipeline: &[S],
    ) -> AppResult<Option<ProcessedRecord>> {
        let Some(raw) = incident.raw_signal(&station.id)? else {
            debug!(station = %station.id, incident = %incident.name, "No data for station");
            self.counters.absent.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let pipeline: Vec<String> = pipeline.iter().map(|s| s.as_ref().to_string()).collect();
        let labels = self.resolve_pipeline(pipeline.as_slice())?;
        let key = fingerprint(&station.id, &incident.name, &labels);

        if let Some(record) = self.lookup(&key, station)? {
            return Ok(Some(record));
        }

        let slot = self.flight_slot(key)?;
        let result = {
            let _guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // another caller may have finished while we waited
            match self.lookup(&key, station) {
                Ok(Some(record)) => Ok(record),
                Ok(None) => self.compute_and_store(key, station, incident, labels, raw),
                Err(e) => Err(e),
            }
        };
        self.release_slot(key, &slot);

        result.map(Some)
    }

    /// Outcome counts since the resolver was created.
    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            absent: self.counters.absent.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, key: &Fingerprint, station: &Station) -> AppResult<Option<ProcessedRecord>> {
        let Some(bytes) = self.store.get(key)? else {
            return Ok(None);
        };
        let mut record = ProcessedRecord::from_bytes(&bytes)?;
        // the source is not part of the identity; distances follow the current one
        record.epicentral_distance_km = self
            .source()
            .map(|source| station.epicentral_distance_km(&source));
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = %key, station = %record.station_id, "Cache hit");
        Ok(Some(record))
    }

    fn compute_and_store(
        &self,
        key: Fingerprint,
        station: &Station,
        incident: &Incident,
        labels: Vec<ProcessingLabel>,
        raw: RawSignal,
    ) -> AppResult<ProcessedRecord> {
        debug!(fingerprint = %key, station = %station.id, incident = %incident.name, "Cache miss");
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let source = self.source();
        let record = ProcessedRecord::compute(
            self.kernels.as_ref(),
            station,
            &incident.name,
            labels,
            raw,
            source.as_ref(),
        )?;

        self.store.put(&key, record.to_bytes()?)?;
        self.tracker.register(&incident.name, key)?;
        Ok(record)
    }

    fn flight_slot(&self, key: Fingerprint) -> AppResult<Arc<Mutex<()>>> {
        let mut map = self
            .in_flight
            .lock()
            .map_err(|_| TsError::Processing("in-flight table lock poisoned".to_string()))?;
        Ok(Arc::clone(map.entry(key).or_default()))
    }

    fn release_slot(&self, key: Fingerprint, slot: &Arc<Mutex<()>>) {
        if let Ok(mut map) = self.in_flight.lock() {
            // the table and this caller hold the only references
            if Arc::strong_count(slot) == 2 {
                map.remove(&key);
            }
        }
    }
}
