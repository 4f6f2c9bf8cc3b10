//! Persistent fingerprint cache.
//!
//! Remembers which certificate fingerprint was last trusted for each
//! `(host, port)`. A hit lets the validator skip the notary round trip.
//!
//! Durable state lives in a SQLite table keyed by `(host, port)`. Lookups
//! are served from an in-memory index so concurrent sessions never touch
//! the database on the read path. A stored fingerprint that differs from the
//! observed one is simply a miss: the site rotated its certificate and the
//! notaries get asked again.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, trace};

use super::certificate::normalize_fingerprint;
use super::error::CacheError;

/// One remembered `(host, port) -> fingerprint` association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    /// Host name, lowercased.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Trusted fingerprint.
    pub fingerprint: String,
    /// When the entry was written.
    pub cached_at: DateTime<Utc>,
}

type CacheKey = (String, u16);

/// SQLite-backed fingerprint cache with an in-memory read index.
pub struct CertificateCache {
    index: RwLock<HashMap<CacheKey, String>>,
    conn: Mutex<Connection>,
    enabled: bool,
    lookups: AtomicU64,
}

impl std::fmt::Debug for CertificateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateCache")
            .field("enabled", &self.enabled)
            .field("entries", &self.len())
            .finish()
    }
}

impl CertificateCache {
    /// Open or create the cache database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, enabled: bool) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::CreateDir {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        debug!("Opened fingerprint cache at {:?}", path);
        Self::from_connection(conn, enabled)
    }

    /// Open a cache that lives only in memory (for testing).
    pub fn open_in_memory(enabled: bool) -> Result<Self, CacheError> {
        Self::from_connection(Connection::open_in_memory()?, enabled)
    }

    fn from_connection(conn: Connection, enabled: bool) -> Result<Self, CacheError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS fingerprints (
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                cached_at INTEGER NOT NULL,
                PRIMARY KEY (host, port)
            );
            "#,
        )?;

        let mut index = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT host, port, fingerprint FROM fingerprints")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u16>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (host, port, fingerprint) = row?;
                index.insert((host, port), fingerprint);
            }
        }
        debug!("Loaded {} cached fingerprint(s)", index.len());

        Ok(Self {
            index: RwLock::new(index),
            conn: Mutex::new(conn),
            enabled,
            lookups: AtomicU64::new(0),
        })
    }

    /// Whether caching is enabled. A disabled cache never hits and never stores.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `fingerprint` is the one remembered for `(host, port)`.
    pub fn is_cached(&self, host: &str, port: u16, fingerprint: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.lookups.fetch_add(1, Ordering::Relaxed);

        let key = (host.to_ascii_lowercase(), port);
        let index = self.index.read().unwrap();
        let hit = index
            .get(&key)
            .is_some_and(|stored| *stored == normalize_fingerprint(fingerprint));
        trace!("Cache {} for {}:{}", if hit { "hit" } else { "miss" }, host, port);
        hit
    }

    /// Remember `fingerprint` as trusted for `(host, port)`.
    ///
    /// Replaces any previous fingerprint for the pair. Storing the same
    /// association twice is harmless.
    pub fn store(&self, host: &str, port: u16, fingerprint: &str) -> Result<(), CacheError> {
        if !self.enabled {
            return Ok(());
        }

        let host = host.to_ascii_lowercase();
        let fingerprint = normalize_fingerprint(fingerprint);
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR REPLACE INTO fingerprints (host, port, fingerprint, cached_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![host, port, fingerprint, Utc::now().timestamp()],
            )?;
        }

        debug!("Cached fingerprint for {}:{}", host, port);
        self.index
            .write()
            .unwrap()
            .insert((host, port), fingerprint);
        Ok(())
    }

    /// Every stored entry, ordered by host then port.
    pub fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT host, port, fingerprint, cached_at FROM fingerprints ORDER BY host, port",
        )?;
        let rows = stmt.query_map([], |row| {
            let cached_at: i64 = row.get(3)?;
            Ok(CacheEntry {
                host: row.get(0)?,
                port: row.get(1)?,
                fingerprint: row.get(2)?,
                cached_at: Utc
                    .timestamp_opt(cached_at, 0)
                    .single()
                    .unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Forget everything.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let removed = {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM fingerprints", [])?
        };
        self.index.write().unwrap().clear();
        debug!("Cleared {} cached fingerprint(s)", removed);
        Ok(removed)
    }

    /// Number of remembered pairs.
    pub fn len(&self) -> usize {
        self.index.read().unwrap().len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.index.read().unwrap().is_empty()
    }

    /// Number of lookups served since the cache was opened.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_store_then_hit() {
        let cache = CertificateCache::open_in_memory(true).unwrap();
        assert!(!cache.is_cached("example.com", 443, "aa:bb"));

        cache.store("example.com", 443, "aa:bb").unwrap();
        assert!(cache.is_cached("example.com", 443, "aa:bb"));
        assert!(cache.is_cached("EXAMPLE.com", 443, "AA:BB"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookups(), 3);
    }

    #[test]
    fn test_rotation_is_a_miss() {
        let cache = CertificateCache::open_in_memory(true).unwrap();
        cache.store("example.com", 443, "aa:bb").unwrap();

        assert!(!cache.is_cached("example.com", 443, "cc:dd"));
        assert!(!cache.is_cached("example.com", 8443, "aa:bb"));

        // A newly trusted fingerprint replaces the old one.
        cache.store("example.com", 443, "cc:dd").unwrap();
        assert!(cache.is_cached("example.com", 443, "cc:dd"));
        assert!(!cache.is_cached("example.com", 443, "aa:bb"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_store_is_idempotent() {
        let cache = CertificateCache::open_in_memory(true).unwrap();
        cache.store("example.com", 443, "aa:bb").unwrap();
        cache.store("example.com", 443, "aa:bb").unwrap();
        assert_eq!(cache.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let cache = CertificateCache::open_in_memory(false).unwrap();
        cache.store("example.com", 443, "aa:bb").unwrap();
        assert!(!cache.is_cached("example.com", 443, "aa:bb"));
        assert!(cache.is_empty());
        assert_eq!(cache.lookups(), 0);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.sqlite");

        {
            let cache = CertificateCache::open(&path, true).unwrap();
            cache.store("example.com", 443, "aa:bb").unwrap();
            cache.store("mail.example.com", 993, "cc:dd").unwrap();
        }

        let cache = CertificateCache::open(&path, true).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.is_cached("example.com", 443, "aa:bb"));
        assert!(cache.is_cached("mail.example.com", 993, "cc:dd"));

        let entries = cache.entries().unwrap();
        assert_eq!(entries[0].host, "example.com");
        assert_eq!(entries[1].port, 993);
    }

    #[test]
    fn test_clear() {
        let cache = CertificateCache::open_in_memory(true).unwrap();
        cache.store("a.example", 443, "aa").unwrap();
        cache.store("b.example", 443, "bb").unwrap();

        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.is_empty());
        assert!(cache.entries().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let cache = Arc::new(CertificateCache::open_in_memory(true).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let host = format!("host{}.example", i % 4);
                    cache.store(&host, 443, "aa:bb").unwrap();
                    assert!(cache.is_cached(&host, 443, "aa:bb"));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 4);
    }
}
