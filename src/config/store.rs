//! Configuration persistence backends
//!
//! One logical document, two physical homes: global settings always live in
//! a local file, the dashboards section lives either in that same file or in
//! an embedded document store. Backends expose the same three-operation
//! contract: read the document, report a change token, write a replacement.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("config document not found: {0}")]
    NotFound(String),

    #[error("document store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Capability every config backend implements.
///
/// `write_config` accepts the caller's idea of the version it is replacing.
/// The hint is advisory: a mismatch is logged, never rejected, so two
/// concurrent writers can both succeed with the later one winning.
pub trait ConfigStore: Send + Sync {
    fn read_config(&self) -> Result<String, StoreError>;

    /// Opaque change token for the stored document.
    fn last_updated(&self) -> Result<String, StoreError>;

    fn write_config(&self, document: &str, prior_version: Option<&str>) -> Result<(), StoreError>;
}

// ============================================================================
// Local file backend
// ============================================================================

/// Reads the config file from disk. The change token is the file's
/// modification time; writes are not supported for this backend.
pub struct DiskConfigStore {
    path: PathBuf,
}

impl DiskConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for DiskConfigStore {
    fn read_config(&self) -> Result<String, StoreError> {
        info!(path = %self.path.display(), "Reading config file");
        Ok(std::fs::read_to_string(&self.path)?)
    }

    fn last_updated(&self) -> Result<String, StoreError> {
        let modified = std::fs::metadata(&self.path)?.modified()?;
        let millis = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        Ok(millis.to_string())
    }

    fn write_config(&self, _document: &str, _prior_version: Option<&str>) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("disk config cannot be updated"))
    }
}

// ============================================================================
// Embedded document store backend
// ============================================================================

/// Fixed primary key under which the live dashboards document is stored.
pub const DASHBOARDS_DOCUMENT_KEY: &str = "dashboards";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS config_documents (
    id         TEXT PRIMARY KEY,
    body       TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// Document store keyed by one fixed identifier. Every update first re-writes
/// the current document under a timestamp-suffixed backup key, retaining
/// history, then writes the replacement with a fresh `updated_at` token.
#[derive(Clone)]
pub struct DocumentConfigStore {
    conn: Arc<Mutex<Connection>>,
}

impl DocumentConfigStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn read_row(&self, conn: &Connection) -> Result<Option<(String, String)>, StoreError> {
        let row = conn
            .query_row(
                "SELECT body, updated_at FROM config_documents WHERE id = ?1",
                params![DASHBOARDS_DOCUMENT_KEY],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }
}

impl ConfigStore for DocumentConfigStore {
    fn read_config(&self) -> Result<String, StoreError> {
        let conn = self.conn.lock().unwrap();
        self.read_row(&conn)?
            .map(|(body, _)| body)
            .ok_or_else(|| StoreError::NotFound(DASHBOARDS_DOCUMENT_KEY.to_string()))
    }

    fn last_updated(&self) -> Result<String, StoreError> {
        let conn = self.conn.lock().unwrap();
        self.read_row(&conn)?
            .map(|(_, updated_at)| updated_at)
            .ok_or_else(|| StoreError::NotFound(DASHBOARDS_DOCUMENT_KEY.to_string()))
    }

    fn write_config(&self, document: &str, prior_version: Option<&str>) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();

        if let Some((body, updated_at)) = self.read_row(&conn)? {
            // Advisory only: a stale hint is worth a warning but does not
            // block the write, so the later of two concurrent writers wins.
            if let Some(prior) = prior_version {
                if prior != updated_at {
                    warn!(
                        expected = prior,
                        stored = %updated_at,
                        "Config version hint does not match stored version, overwriting anyway"
                    );
                }
            }

            let backup_key = format!("{DASHBOARDS_DOCUMENT_KEY}-{updated_at}");
            conn.execute(
                "INSERT OR REPLACE INTO config_documents (id, body, updated_at) VALUES (?1, ?2, ?3)",
                params![backup_key, body, updated_at],
            )?;
            info!(backup_key = %backup_key, "Backed up previous config version");
        }

        conn.execute(
            "INSERT OR REPLACE INTO config_documents (id, body, updated_at) VALUES (?1, ?2, ?3)",
            params![DASHBOARDS_DOCUMENT_KEY, document, now],
        )?;
        info!("Wrote config document");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn disk_store_reads_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"httpPort\": 8080}}").unwrap();
        let store = DiskConfigStore::new(file.path());
        assert_eq!(store.read_config().unwrap(), "{\"httpPort\": 8080}");
    }

    #[test]
    fn disk_store_token_is_stable_without_changes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = DiskConfigStore::new(file.path());
        assert_eq!(store.last_updated().unwrap(), store.last_updated().unwrap());
    }

    #[test]
    fn disk_store_rejects_writes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = DiskConfigStore::new(file.path());
        assert!(matches!(
            store.write_config("{}", None),
            Err(StoreError::Unsupported(_))
        ));
    }

    #[test]
    fn document_store_round_trips() {
        let store = DocumentConfigStore::open_in_memory().unwrap();
        store.write_config("{\"dashboards\": []}", None).unwrap();
        assert_eq!(store.read_config().unwrap(), "{\"dashboards\": []}");
        assert!(!store.last_updated().unwrap().is_empty());
    }

    #[test]
    fn document_store_missing_document_is_not_found() {
        let store = DocumentConfigStore::open_in_memory().unwrap();
        assert!(matches!(store.read_config(), Err(StoreError::NotFound(_))));
        assert!(matches!(store.last_updated(), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn document_store_keeps_backup_history() {
        let store = DocumentConfigStore::open_in_memory().unwrap();
        store.write_config("v1", None).unwrap();
        let v1_token = store.last_updated().unwrap();
        store.write_config("v2", None).unwrap();

        assert_eq!(store.read_config().unwrap(), "v2");

        let conn = store.conn.lock().unwrap();
        let backup_key = format!("{DASHBOARDS_DOCUMENT_KEY}-{v1_token}");
        let backup: String = conn
            .query_row(
                "SELECT body FROM config_documents WHERE id = ?1",
                params![backup_key],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(backup, "v1");
    }

    #[test]
    fn stale_version_hint_still_writes() {
        let store = DocumentConfigStore::open_in_memory().unwrap();
        store.write_config("v1", None).unwrap();
        // Hint does not match the stored token; the write wins regardless.
        store.write_config("v2", Some("not-the-stored-token")).unwrap();
        assert_eq!(store.read_config().unwrap(), "v2");
    }
}
