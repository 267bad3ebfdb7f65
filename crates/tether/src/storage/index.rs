//! SQLite index of cached entries
//!
//! The index is the single source of truth for which keys exist. All
//! access goes through one connection behind a mutex, so writers are
//! serialized and every multi-statement change runs in a transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use super::entry::{CacheEntry, DataKind};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            CREATE TABLE entries (
                key TEXT PRIMARY KEY,
                data_kind TEXT NOT NULL,
                file_name TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL,       -- unix millis
                last_accessed_at INTEGER NOT NULL, -- unix millis
                access_count INTEGER NOT NULL DEFAULT 0,
                access_seq INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER,                -- unix millis, NULL = no TTL
                metadata TEXT                      -- JSON object
            );

            CREATE INDEX idx_entries_lru
                ON entries(last_accessed_at ASC, access_seq ASC);

            CREATE INDEX idx_entries_expires_at
                ON entries(expires_at) WHERE expires_at IS NOT NULL;
            "#,
        ),
        // Migration 2: Write generation, so deletes can target the row
        // that was actually read
        M::up("ALTER TABLE entries ADD COLUMN revision INTEGER NOT NULL DEFAULT 0;"),
    ])
}

const ENTRY_COLUMNS: &str = "key, data_kind, file_name, size_bytes, created_at, \
     last_accessed_at, access_count, expires_at, metadata, revision";

fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Raw row as stored, before the kind and metadata are parsed
struct EntryRow {
    key: String,
    data_kind: String,
    file_name: String,
    size_bytes: i64,
    created_at: i64,
    last_accessed_at: i64,
    access_count: i64,
    expires_at: Option<i64>,
    metadata: Option<String>,
    revision: i64,
}

impl EntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            data_kind: row.get(1)?,
            file_name: row.get(2)?,
            size_bytes: row.get(3)?,
            created_at: row.get(4)?,
            last_accessed_at: row.get(5)?,
            access_count: row.get(6)?,
            expires_at: row.get(7)?,
            metadata: row.get(8)?,
            revision: row.get(9)?,
        })
    }

    fn into_entry(self) -> Result<CacheEntry> {
        let data_kind: DataKind = self.data_kind.parse()?;
        let metadata = self
            .metadata
            .map(|json| serde_json::from_str::<HashMap<String, String>>(&json))
            .transpose()
            .with_context(|| format!("Corrupt metadata for cache key {}", self.key))?;

        Ok(CacheEntry {
            key: self.key,
            data_kind,
            file_name: self.file_name,
            size_bytes: self.size_bytes.max(0) as u64,
            created_at: from_millis(self.created_at),
            last_accessed_at: from_millis(self.last_accessed_at),
            access_count: self.access_count.max(0) as u64,
            expires_at: self.expires_at.map(from_millis),
            metadata,
            revision: self.revision.max(0) as u64,
        })
    }
}

/// Durable index of cache entries
pub struct EntryIndex {
    conn: Mutex<Connection>,
}

impl EntryIndex {
    /// Open (or create) the index database at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open cache index at {:?}", db_path.as_ref()))?;

        // WAL lets readers proceed during writes and survives crashes
        // mid-transaction; NORMAL sync is safe in WAL mode.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run cache index migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or fully replace an entry.
    ///
    /// `before_commit` runs inside the transaction; if it fails the row
    /// change is rolled back, so the index never points at content that
    /// was not written.
    pub fn upsert_with(
        &self,
        entry: &CacheEntry,
        access_seq: u64,
        before_commit: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let metadata = entry
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO entries
             (key, data_kind, file_name, size_bytes, created_at, last_accessed_at,
              access_count, access_seq, expires_at, metadata, revision)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                data_kind = excluded.data_kind,
                file_name = excluded.file_name,
                size_bytes = excluded.size_bytes,
                created_at = excluded.created_at,
                last_accessed_at = excluded.last_accessed_at,
                access_count = excluded.access_count,
                access_seq = excluded.access_seq,
                expires_at = excluded.expires_at,
                metadata = excluded.metadata,
                revision = excluded.revision",
            params![
                entry.key,
                entry.data_kind.as_str(),
                entry.file_name,
                entry.size_bytes as i64,
                to_millis(entry.created_at),
                to_millis(entry.last_accessed_at),
                entry.access_count as i64,
                access_seq as i64,
                entry.expires_at.map(to_millis),
                metadata,
                entry.revision as i64,
            ],
        )?;

        before_commit()?;
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let conn = self.conn.lock().unwrap();

        let row = conn
            .query_row(
                &format!("SELECT {} FROM entries WHERE key = ?", ENTRY_COLUMNS),
                [key],
                EntryRow::from_row,
            )
            .optional()?;

        row.map(EntryRow::into_entry).transpose()
    }

    /// Record an access: bump the counter and move to the MRU end
    pub fn touch(&self, key: &str, at: DateTime<Utc>, access_seq: u64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE entries
             SET last_accessed_at = ?, access_seq = ?, access_count = access_count + 1
             WHERE key = ?",
            params![to_millis(at), access_seq as i64, key],
        )?;
        Ok(updated > 0)
    }

    /// Remove a row, returning it if it existed.
    ///
    /// With `revision` set, only that write of the key is removed; a row
    /// rewritten since it was read is left alone. `on_removed` receives the
    /// content file name while the index lock is still held, so a
    /// concurrent store of the key cannot slip in between.
    pub fn delete_with(
        &self,
        key: &str,
        revision: Option<u64>,
        on_removed: impl FnOnce(&str),
    ) -> Result<Option<CacheEntry>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let row = tx
            .query_row(
                &format!("SELECT {} FROM entries WHERE key = ?", ENTRY_COLUMNS),
                [key],
                EntryRow::from_row,
            )
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };
        if revision.is_some_and(|rev| rev as i64 != row.revision) {
            return Ok(None);
        }

        tx.execute("DELETE FROM entries WHERE key = ?", [key])?;
        tx.commit()?;
        on_removed(&row.file_name);

        row.into_entry().map(Some)
    }

    /// Remove every row, returning how many there were. `on_cleared` runs
    /// under the index lock before the rows are deleted.
    pub fn clear_with(&self, on_cleared: impl FnOnce() -> Result<()>) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM entries", [])?;
        on_cleared()?;
        tx.commit()?;
        Ok(removed)
    }

    /// Remove and return all entries expired as of `now`. `on_removed`
    /// runs for each content file under the index lock.
    pub fn take_expired(
        &self,
        now: DateTime<Utc>,
        mut on_removed: impl FnMut(&str),
    ) -> Result<Vec<CacheEntry>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let rows = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
                ENTRY_COLUMNS
            ))?;
            let rows = stmt
                .query_map([to_millis(now)], EntryRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        tx.execute(
            "DELETE FROM entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
            [to_millis(now)],
        )?;
        tx.commit()?;
        for row in &rows {
            on_removed(&row.file_name);
        }

        rows.into_iter().map(EntryRow::into_entry).collect()
    }

    pub fn count_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
            [to_millis(now)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete least recently accessed rows until the total size is at or
    /// below `target_bytes`. `keep_key` is never chosen as a victim.
    /// `on_removed` runs for each victim's content file under the index lock.
    pub fn evict_lru(
        &self,
        target_bytes: u64,
        keep_key: &str,
        mut on_removed: impl FnMut(&str),
    ) -> Result<Vec<CacheEntry>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let mut total: i64 =
            tx.query_row("SELECT COALESCE(SUM(size_bytes), 0) FROM entries", [], |row| {
                row.get(0)
            })?;

        if total <= target_bytes as i64 {
            return Ok(Vec::new());
        }

        let candidates = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM entries WHERE key != ?
                 ORDER BY last_accessed_at ASC, access_seq ASC",
                ENTRY_COLUMNS
            ))?;
            let rows = stmt
                .query_map([keep_key], EntryRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut victims = Vec::new();
        for row in candidates {
            if total <= target_bytes as i64 {
                break;
            }
            tx.execute("DELETE FROM entries WHERE key = ?", [&row.key])?;
            total -= row.size_bytes;
            victims.push(row);
        }

        tx.commit()?;
        for victim in &victims {
            on_removed(&victim.file_name);
        }

        victims.into_iter().map(EntryRow::into_entry).collect()
    }

    pub fn total_size(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let total: i64 =
            conn.query_row("SELECT COALESCE(SUM(size_bytes), 0) FROM entries", [], |row| {
                row.get(0)
            })?;
        Ok(total.max(0) as u64)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn counts_by_kind(&self) -> Result<HashMap<DataKind, usize>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data_kind, COUNT(*) FROM entries GROUP BY data_kind")?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = HashMap::new();
        for (kind, count) in rows {
            counts.insert(kind.parse::<DataKind>()?, count as usize);
        }
        Ok(counts)
    }

    pub fn oldest_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let oldest: Option<i64> =
            conn.query_row("SELECT MIN(created_at) FROM entries", [], |row| row.get(0))?;
        Ok(oldest.map(from_millis))
    }

    /// All keys, most recently accessed first
    pub fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT key FROM entries ORDER BY last_accessed_at DESC, access_seq DESC")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// Highest access sequence number in use
    pub fn max_access_seq(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let max: i64 =
            conn.query_row("SELECT COALESCE(MAX(access_seq), 0) FROM entries", [], |row| {
                row.get(0)
            })?;
        Ok(max.max(0) as u64)
    }
}
