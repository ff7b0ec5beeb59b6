//! Durable key-value store for processed records.
//!
//! The store is a single SQLite file per project holding two things:
//!
//! - a flat map `fingerprint -> serialized record` (the cache proper), and
//! - a nested container per tracker name mapping `incident -> {fingerprint}`, which is
//!   the durable form of the incident index maintained by
//!   [`IncidentTracker`](crate::tracker::IncidentTracker).
//!
//! # Recency window
//!
//! A bounded in-memory window (`moka`, least-recently-used eviction) sits in front of
//! the file. Reads populate it, writes go to both the window and the file
//! (write-through), so an abrupt termination never loses a result that `put` reported
//! as stored. A full window always admits the newest entry and evicts the one touched
//! longest ago.
//!
//! # Write-once
//!
//! Entries are never overwritten. A changed pipeline produces a new fingerprint, so a
//! second `put` under an existing key is ignored (and logged if the bytes differ).
//!
//! # Lifecycle
//!
//! `open` connects, `close` disconnects. Every operation on a closed store fails fast
//! with [`TsError::StoreUnavailable`]; there is no automatic reconnection.
//!
//! # Space reclamation
//!
//! `delete` is immediately observable but SQLite keeps freed pages allocated.
//! [`CacheStore::reclaim`] compacts the file and is deliberately a separate call so
//! callers can batch it after bulk deletions.

use crate::error::{AppResult, TsError};
use crate::fingerprint::Fingerprint;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Current on-disk schema version.
const SCHEMA_VERSION: i64 = 1;

/// Default number of entries kept in the recency window.
pub const DEFAULT_WINDOW_CAPACITY: u64 = 2000;

/// Serialized value shared between the window and callers.
pub type StoredValue = Arc<Vec<u8>>;

/// Nested container: incident name -> fingerprints recorded under it.
pub type NestedContainer = BTreeMap<String, BTreeSet<Fingerprint>>;

/// Size figures for diagnostics and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Stored values.
    pub entries: u64,
    /// Values currently held in the recency window.
    pub window_entries: u64,
    /// Pages in the database file.
    pub page_count: u64,
    /// Pages freed by deletions and not yet reclaimed.
    pub freelist_pages: u64,
}

/// Durable fingerprint-addressed store with an in-memory recency window.
pub struct CacheStore {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
    window: Cache<Fingerprint, StoredValue>,
}

impl CacheStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P, window_capacity: u64) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        init_schema(&conn)?;

        info!(path = %path.display(), window_capacity, "Opened result store");
        Ok(Self {
            path,
            conn: Mutex::new(Some(conn)),
            window: Cache::builder()
                .max_capacity(window_capacity)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
        })
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the store currently holds an open connection.
    pub fn is_connected(&self) -> bool {
        self.conn.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Close the connection. Closing an already closed store is a no-op.
    pub fn close(&self) -> AppResult<()> {
        let mut guard = self.lock()?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| TsError::Database(e))?;
            self.window.invalidate_all();
            info!(path = %self.path.display(), "Closed result store");
        }
        Ok(())
    }

    /// Whether a value is stored under `key`.
    pub fn has(&self, key: &Fingerprint) -> AppResult<bool> {
        self.with_conn(|conn| {
            if self.window.contains_key(key) {
                return Ok(true);
            }
            let found = conn
                .prepare_cached("SELECT 1 FROM cache_entries WHERE key = ?1")?
                .exists(params![key.to_hex()])?;
            Ok(found)
        })
    }

    /// The value stored under `key`, or `None` if absent.
    pub fn get(&self, key: &Fingerprint) -> AppResult<Option<StoredValue>> {
        self.with_conn(|conn| self.get_with(conn, key))
    }

    /// Store `value` under `key` unless the key already exists.
    ///
    /// Returns `true` if the value was inserted, `false` if the key was already present.
    pub fn put(&self, key: &Fingerprint, value: Vec<u8>) -> AppResult<bool> {
        self.with_conn(|conn| {
            let inserted = conn
                .prepare_cached("INSERT OR IGNORE INTO cache_entries (key, value) VALUES (?1, ?2)")?
                .execute(params![key.to_hex(), value])?
                > 0;

            if inserted {
                self.window.insert(*key, Arc::new(value));
                debug!(fingerprint = %key, "Stored cache entry");
            } else if self.get_with(conn, key)?.is_some_and(|existing| *existing != value) {
                warn!(fingerprint = %key, "Refusing to overwrite cache entry with different content");
            }
            Ok(inserted)
        })
    }

    /// Remove the value under `key`. Deleting a missing key is a no-op.
    ///
    /// Returns whether a value was removed.
    pub fn delete(&self, key: &Fingerprint) -> AppResult<bool> {
        self.with_conn(|conn| {
            let removed = conn
                .prepare_cached("DELETE FROM cache_entries WHERE key = ?1")?
                .execute(params![key.to_hex()])?
                > 0;
            self.window.invalidate(key);
            Ok(removed)
        })
    }

    /// Compact the file, releasing space left behind by deletions.
    pub fn reclaim(&self) -> AppResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch("VACUUM;")?;
            debug!(path = %self.path.display(), "Reclaimed free pages");
            Ok(())
        })
    }

    /// Existence check for several keys at once, in input order.
    pub fn has_many(&self, keys: &[Fingerprint]) -> AppResult<Vec<bool>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT 1 FROM cache_entries WHERE key = ?1")?;
            keys.iter()
                .map(|key| -> AppResult<bool> {
                    if self.window.contains_key(key) {
                        Ok(true)
                    } else {
                        Ok(stmt.exists(params![key.to_hex()])?)
                    }
                })
                .collect()
        })
    }

    /// Lookup of several keys at once, in input order.
    pub fn get_many(&self, keys: &[Fingerprint]) -> AppResult<Vec<Option<StoredValue>>> {
        self.with_conn(|conn| keys.iter().map(|key| self.get_with(conn, key)).collect())
    }

    /// Number of stored values.
    pub fn len(&self) -> AppResult<u64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    /// Whether no values are stored.
    pub fn is_empty(&self) -> AppResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Whether `key` is currently held in the recency window.
    pub fn is_in_window(&self, key: &Fingerprint) -> bool {
        self.window.contains_key(key)
    }

    /// Entry counts and page usage. Settles pending window maintenance first.
    pub fn stats(&self) -> AppResult<StoreStats> {
        let entries = self.len()?;
        self.window.run_pending_tasks();
        self.with_conn(|conn| {
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let freelist: i64 = conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
            Ok(StoreStats {
                entries,
                window_entries: self.window.entry_count(),
                page_count: page_count as u64,
                freelist_pages: freelist as u64,
            })
        })
    }

    // ------------------------------------------------------------------
    // Nested container (durable incident index)
    // ------------------------------------------------------------------

    /// Read the whole nested container stored under `tracker`.
    ///
    /// Incidents registered with no fingerprints appear with an empty set.
    pub fn get_nested_container(&self, tracker: &str) -> AppResult<NestedContainer> {
        self.with_conn(|conn| {
            let mut container = NestedContainer::new();

            let mut stmt =
                conn.prepare_cached("SELECT incident FROM tracker_incidents WHERE tracker = ?1")?;
            let incidents = stmt.query_map(params![tracker], |row| row.get::<_, String>(0))?;
            for incident in incidents {
                container.entry(incident?).or_default();
            }

            let mut stmt = conn.prepare_cached(
                "SELECT incident, key FROM tracker_entries WHERE tracker = ?1",
            )?;
            let rows = stmt.query_map(params![tracker], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (incident, hex) = row?;
                match hex.parse::<Fingerprint>() {
                    Ok(fp) => {
                        container.entry(incident).or_default().insert(fp);
                    }
                    Err(e) => warn!(tracker, incident = %incident, error = %e, "Skipping malformed index entry"),
                }
            }

            Ok(container)
        })
    }

    /// Fingerprints recorded under one incident of the nested container.
    ///
    /// An unknown incident yields an empty set.
    pub fn nested_fingerprints(
        &self,
        tracker: &str,
        incident: &str,
    ) -> AppResult<BTreeSet<Fingerprint>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT key FROM tracker_entries WHERE tracker = ?1 AND incident = ?2",
            )?;
            let rows = stmt.query_map(params![tracker, incident], |row| row.get::<_, String>(0))?;

            let mut fingerprints = BTreeSet::new();
            for hex in rows {
                let hex = hex?;
                match hex.parse::<Fingerprint>() {
                    Ok(fp) => {
                        fingerprints.insert(fp);
                    }
                    Err(e) => warn!(tracker, incident, error = %e, "Skipping malformed index entry"),
                }
            }
            Ok(fingerprints)
        })
    }

    /// Names of the incidents present in the nested container.
    pub fn incident_names(&self, tracker: &str) -> AppResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT incident FROM tracker_incidents WHERE tracker = ?1 ORDER BY incident",
            )?;
            let names = stmt
                .query_map(params![tracker], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
    }

    /// Add fingerprints to an incident's set, creating the incident entry if needed.
    ///
    /// Runs in one transaction: either the whole batch is durable or none of it is.
    pub fn extend_nested(
        &self,
        tracker: &str,
        incident: &str,
        fingerprints: &BTreeSet<Fingerprint>,
    ) -> AppResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO tracker_incidents (tracker, incident) VALUES (?1, ?2)",
                params![tracker, incident],
            )?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO tracker_entries (tracker, incident, key) VALUES (?1, ?2, ?3)",
                )?;
                for fp in fingerprints {
                    stmt.execute(params![tracker, incident, fp.to_hex()])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Drop an incident and its fingerprint set from the nested container.
    pub fn remove_nested(&self, tracker: &str, incident: &str) -> AppResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM tracker_entries WHERE tracker = ?1 AND incident = ?2",
                params![tracker, incident],
            )?;
            tx.execute(
                "DELETE FROM tracker_incidents WHERE tracker = ?1 AND incident = ?2",
                params![tracker, incident],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|_| TsError::StoreUnavailable("store lock poisoned".to_string()))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> AppResult<T>) -> AppResult<T> {
        let mut guard = self.lock()?;
        let conn = guard.as_mut().ok_or_else(|| {
            TsError::StoreUnavailable(format!("store {} is closed", self.path.display()))
        })?;
        f(conn)
    }

    fn get_with(&self, conn: &Connection, key: &Fingerprint) -> AppResult<Option<StoredValue>> {
        if let Some(value) = self.window.get(key) {
            return Ok(Some(value));
        }

        let value: Option<Vec<u8>> = conn
            .prepare_cached("SELECT value FROM cache_entries WHERE key = ?1")?
            .query_row(params![key.to_hex()], |row| row.get(0))
            .optional()?;

        Ok(value.map(|bytes| {
            let value = Arc::new(bytes);
            self.window.insert(*key, Arc::clone(&value));
            value
        }))
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("path", &self.path)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn init_schema(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Flat cache: fingerprint -> serialized record
        CREATE TABLE IF NOT EXISTS cache_entries (
            key TEXT PRIMARY KEY,
            value BLOB NOT NULL
        );

        -- Nested container: tracker -> incident -> {fingerprint}
        CREATE TABLE IF NOT EXISTS tracker_incidents (
            tracker TEXT NOT NULL,
            incident TEXT NOT NULL,
            PRIMARY KEY (tracker, incident)
        );
        CREATE TABLE IF NOT EXISTS tracker_entries (
            tracker TEXT NOT NULL,
            incident TEXT NOT NULL,
            key TEXT NOT NULL,
            PRIMARY KEY (tracker, incident, key)
        );
        "#,
    )?;

    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .optional()?
        .flatten();
    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(v) if v > SCHEMA_VERSION => {
            return Err(TsError::StoreUnavailable(format!(
                "store schema version {} is newer than supported version {}",
                v, SCHEMA_VERSION
            )));
        }
        Some(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;

    fn key(n: usize) -> Fingerprint {
        fingerprint(&format!("S{}", n), "I1", &[])
    }

    fn open_temp() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("test_db.sqlite"), 16).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_get_has() {
        let (_dir, store) = open_temp();
        assert!(!store.has(&key(1)).unwrap());
        assert!(store.get(&key(1)).unwrap().is_none());

        assert!(store.put(&key(1), vec![1, 2, 3]).unwrap());
        assert!(store.has(&key(1)).unwrap());
        assert_eq!(store.get(&key(1)).unwrap().as_deref(), Some(&vec![1, 2, 3]));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_put_is_write_once() {
        let (_dir, store) = open_temp();
        assert!(store.put(&key(1), vec![1]).unwrap());
        assert!(!store.put(&key(1), vec![2]).unwrap());
        assert_eq!(store.get(&key(1)).unwrap().as_deref(), Some(&vec![1]));
    }

    #[test]
    fn test_delete_is_immediate_and_idempotent() {
        let (_dir, store) = open_temp();
        store.put(&key(1), vec![9; 8]).unwrap();
        assert!(store.is_in_window(&key(1)));

        assert!(store.delete(&key(1)).unwrap());
        assert!(!store.has(&key(1)).unwrap());
        assert!(store.get(&key(1)).unwrap().is_none());
        assert!(!store.is_in_window(&key(1)));

        assert!(!store.delete(&key(1)).unwrap());
    }

    #[test]
    fn test_bulk_lookup() {
        let (_dir, store) = open_temp();
        store.put(&key(1), vec![1]).unwrap();
        store.put(&key(3), vec![3]).unwrap();

        let keys = [key(1), key(2), key(3)];
        assert_eq!(store.has_many(&keys).unwrap(), vec![true, false, true]);
        let values = store.get_many(&keys).unwrap();
        assert_eq!(values[0].as_deref(), Some(&vec![1]));
        assert!(values[1].is_none());
        assert_eq!(values[2].as_deref(), Some(&vec![3]));
    }

    #[test]
    fn test_closed_store_fails_fast() {
        let (_dir, store) = open_temp();
        store.put(&key(1), vec![1]).unwrap();
        assert!(store.is_connected());

        store.close().unwrap();
        assert!(!store.is_connected());
        assert!(matches!(store.get(&key(1)), Err(TsError::StoreUnavailable(_))));
        assert!(matches!(store.put(&key(2), vec![2]), Err(TsError::StoreUnavailable(_))));
        assert!(matches!(store.has(&key(1)), Err(TsError::StoreUnavailable(_))));
        // closing twice is fine
        store.close().unwrap();
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen_db.sqlite");
        {
            let store = CacheStore::open(&path, 16).unwrap();
            store.put(&key(7), vec![7, 7]).unwrap();
            store.close().unwrap();
        }
        let store = CacheStore::open(&path, 16).unwrap();
        assert!(!store.is_in_window(&key(7)));
        assert_eq!(store.get(&key(7)).unwrap().as_deref(), Some(&vec![7, 7]));
        assert!(store.is_in_window(&key(7)));
    }

    #[test]
    fn test_full_window_admits_newest_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("small_db.sqlite"), 2).unwrap();
        store.put(&key(1), vec![1]).unwrap();
        store.put(&key(2), vec![2]).unwrap();
        for _ in 0..5 {
            store.get(&key(1)).unwrap();
            store.get(&key(2)).unwrap();
        }

        store.put(&key(3), vec![3]).unwrap();
        assert_eq!(store.get(&key(3)).unwrap().as_deref(), Some(&vec![3]));

        let stats = store.stats().unwrap();
        assert!(store.is_in_window(&key(3)));
        assert!(stats.window_entries <= 2);
        assert_eq!(stats.entries, 3);
        assert_eq!(store.get(&key(1)).unwrap().as_deref(), Some(&vec![1]));
    }

    #[test]
    fn test_reclaim_releases_free_pages() {
        let (_dir, store) = open_temp();
        for n in 0..64 {
            store.put(&key(n), vec![n as u8; 8192]).unwrap();
        }
        for n in 0..64 {
            store.delete(&key(n)).unwrap();
        }
        let before = store.stats().unwrap();
        assert_eq!(before.entries, 0);
        assert!(before.freelist_pages > 0);

        store.reclaim().unwrap();
        let after = store.stats().unwrap();
        assert_eq!(after.freelist_pages, 0);
        assert!(after.page_count < before.page_count);
    }

    #[test]
    fn test_nested_container() {
        let (_dir, store) = open_temp();
        let tracker = "proj_dbtracker";

        store.extend_nested(tracker, "I1", &BTreeSet::from([key(1), key(2)])).unwrap();
        store.extend_nested(tracker, "I1", &BTreeSet::from([key(2), key(3)])).unwrap();
        store.extend_nested(tracker, "I2", &BTreeSet::new()).unwrap();
        store.extend_nested("other_tracker", "I9", &BTreeSet::from([key(9)])).unwrap();

        let container = store.get_nested_container(tracker).unwrap();
        assert_eq!(container.len(), 2);
        assert_eq!(container["I1"], BTreeSet::from([key(1), key(2), key(3)]));
        assert!(container["I2"].is_empty());
        assert_eq!(store.incident_names(tracker).unwrap(), vec!["I1", "I2"]);

        assert_eq!(
            store.nested_fingerprints(tracker, "I1").unwrap(),
            BTreeSet::from([key(1), key(2), key(3)])
        );
        assert!(store.nested_fingerprints(tracker, "I2").unwrap().is_empty());
        assert!(store.nested_fingerprints(tracker, "I9").unwrap().is_empty());

        store.remove_nested(tracker, "I1").unwrap();
        assert!(store.nested_fingerprints(tracker, "I1").unwrap().is_empty());
        let container = store.get_nested_container(tracker).unwrap();
        assert!(!container.contains_key("I1"));
        assert!(store.get_nested_container("other_tracker").unwrap().contains_key("I9"));
    }
}
