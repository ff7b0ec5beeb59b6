//! Incident index: which cache entries belong to which incident.
//!
//! The flat store has no notion of incidents, so the tracker is the only way to find
//! every record produced under an incident when that incident is purged. New
//! associations are buffered in memory and written to the store's nested container in
//! batches.
//!
//! The buffer is a bounded FIFO over *incidents*: once `buffer_capacity` incidents have
//! pending fingerprints, registering under another incident first flushes the oldest
//! one. A whole incident's pending set is the unit of flushing.
//!
//! [`IncidentTracker::flush`] must run before the store is closed, otherwise buffered
//! attributions are lost (the records themselves are already durable).

use crate::error::{AppResult, TsError};
use crate::fingerprint::Fingerprint;
use crate::store::CacheStore;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Default number of incidents buffered before the oldest is flushed.
pub const DEFAULT_BUFFER_CAPACITY: usize = 3;

#[derive(Debug)]
struct PendingIncident {
    incident: String,
    fingerprints: BTreeSet<Fingerprint>,
}

#[derive(Debug, Default)]
struct TrackerState {
    tracked: BTreeSet<String>,
    buffer: VecDeque<PendingIncident>,
}

/// Buffered incident → fingerprint index backed by a [`CacheStore`].
#[derive(Debug)]
pub struct IncidentTracker {
    name: String,
    store: Arc<CacheStore>,
    capacity: usize,
    state: Mutex<TrackerState>,
}

impl IncidentTracker {
    /// Create a tracker writing to the nested container `name` of `store`.
    ///
    /// Incidents already present in the durable index are tracked from the start.
    pub fn new(name: &str, store: Arc<CacheStore>, buffer_capacity: usize) -> AppResult<Self> {
        let tracked: BTreeSet<String> = store.incident_names(name)?.into_iter().collect();
        if !tracked.is_empty() {
            debug!(tracker = %name, incidents = tracked.len(), "Loaded incident index");
        }

        Ok(Self {
            name: name.to_string(),
            store,
            capacity: buffer_capacity.max(1),
            state: Mutex::new(TrackerState {
                tracked,
                buffer: VecDeque::new(),
            }),
        })
    }

    /// Name of the nested container this tracker writes to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of incidents buffered before the oldest is flushed.
    pub fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    /// Begin accepting registrations for `incident`.
    ///
    /// Returns `false` (and warns) if the incident is already tracked.
    pub fn start_tracking(&self, incident: &str) -> AppResult<bool> {
        let mut state = self.lock()?;
        if state.tracked.contains(incident) {
            warn!(incident = %incident, "Incident is already being tracked");
            return Ok(false);
        }

        self.store
            .extend_nested(&self.name, incident, &BTreeSet::new())?;
        state.tracked.insert(incident.to_string());
        info!(incident = %incident, tracker = %self.name, "Started tracking incident");
        Ok(true)
    }

    /// Whether registrations for `incident` are expected.
    pub fn is_tracking(&self, incident: &str) -> bool {
        self.lock()
            .map(|state| state.tracked.contains(incident))
            .unwrap_or(false)
    }

    /// Incidents currently tracked, sorted by name.
    pub fn tracked_incidents(&self) -> AppResult<Vec<String>> {
        Ok(self.lock()?.tracked.iter().cloned().collect())
    }

    /// Incidents with pending (unflushed) registrations, oldest first.
    pub fn buffered_incidents(&self) -> AppResult<Vec<String>> {
        Ok(self
            .lock()?
            .buffer
            .iter()
            .map(|pending| pending.incident.clone())
            .collect())
    }

    /// Record that `fingerprint` was produced under `incident`.
    pub fn register(&self, incident: &str, fingerprint: Fingerprint) -> AppResult<()> {
        let mut state = self.lock()?;

        if !state.tracked.contains(incident) {
            warn!(incident = %incident, "Registering under an untracked incident; tracking it now");
            state.tracked.insert(incident.to_string());
        }

        if let Some(pending) = state.buffer.iter_mut().find(|p| p.incident == incident) {
            pending.fingerprints.insert(fingerprint);
            return Ok(());
        }

        if state.buffer.len() >= self.capacity {
            if let Some(oldest) = state.buffer.front() {
                debug!(
                    incident = %oldest.incident,
                    fingerprints = oldest.fingerprints.len(),
                    "Tracker buffer full; flushing oldest incident"
                );
                self.store
                    .extend_nested(&self.name, &oldest.incident, &oldest.fingerprints)?;
            }
            state.buffer.pop_front();
        }

        state.buffer.push_back(PendingIncident {
            incident: incident.to_string(),
            fingerprints: BTreeSet::from([fingerprint]),
        });
        Ok(())
    }

    /// Write every buffered association to the store and clear the buffer.
    ///
    /// Returns the number of fingerprints written. Flushing an empty buffer is a no-op.
    /// On failure the entries not yet written stay buffered.
    pub fn flush(&self) -> AppResult<usize> {
        let mut state = self.lock()?;
        let mut written = 0;
        while let Some(pending) = state.buffer.front() {
            self.store
                .extend_nested(&self.name, &pending.incident, &pending.fingerprints)?;
            written += pending.fingerprints.len();
            state.buffer.pop_front();
        }

        if written > 0 {
            debug!(tracker = %self.name, fingerprints = written, "Flushed incident index");
        }
        Ok(written)
    }

    /// Alias of [`flush`](Self::flush).
    pub fn add_to_database(&self) -> AppResult<usize> {
        self.flush()
    }

    /// Every fingerprint attributed to `incident`, durable and buffered.
    pub fn tracked_fingerprints(&self, incident: &str) -> AppResult<BTreeSet<Fingerprint>> {
        let state = self.lock()?;
        let mut fingerprints = self.store.nested_fingerprints(&self.name, incident)?;

        if let Some(pending) = state.buffer.iter().find(|p| p.incident == incident) {
            fingerprints.extend(pending.fingerprints.iter().copied());
        }
        Ok(fingerprints)
    }

    /// Forget `incident` in the durable index and the buffer.
    ///
    /// Cache values are not touched; callers delete them first.
    pub fn remove_incident(&self, incident: &str) -> AppResult<()> {
        let mut state = self.lock()?;
        self.store.remove_nested(&self.name, incident)?;
        state.buffer.retain(|p| p.incident != incident);
        state.tracked.remove(incident);
        info!(incident = %incident, tracker = %self.name, "Removed incident from index");
        Ok(())
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, TrackerState>> {
        self.state
            .lock()
            .map_err(|_| TsError::StoreUnavailable("tracker lock poisoned".to_string()))
    }
}
