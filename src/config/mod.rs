//! Configuration subsystem
//!
//! Loads, validates, and parses the raw configuration document into one
//! immutable [`ConfigSnapshot`]. The snapshot is published behind an atomic
//! reference swap: readers always see a complete config, never a partially
//! reloaded one. Reload detection compares opaque change tokens from the
//! backing stores and is invoked opportunistically by callers before they
//! read config, so a check has a bounded synchronous re-parse cost on the
//! calling thread rather than a dedicated poller.

pub mod model;
pub mod store;

#[cfg(test)]
pub mod testing;

pub use model::{
    ConfigSnapshot, ConfigVersion, DashboardDefinition, GlobalSettings, GraphDefinition,
    GraphKind, PersistenceType, PluginDefinition,
};
pub use store::{ConfigStore, DiskConfigStore, DocumentConfigStore, StoreError};

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

/// Optional global key overriding where the embedded document store lives.
const DOCUMENT_STORE_PATH: &str = "dashboard.config.store.path";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config validation failed:\n{}", .0.join("\n"))]
    Validation(Vec<String>),

    #[error("malformed config: {0}")]
    Malformed(String),

    #[error("config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owns the configuration stores and the current snapshot.
///
/// Constructed once at boot and shared by reference; the first load failing
/// is fatal, later reload failures are logged and the prior snapshot stays
/// in place unchanged.
pub struct ConfigManager {
    global_store: Arc<dyn ConfigStore>,
    dashboards_store: Arc<dyn ConfigStore>,
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    /// Serializes reloads so concurrent `check_for_update` callers cannot
    /// interleave their load pipelines.
    reload: Mutex<()>,
}

impl ConfigManager {
    /// Boot-time constructor: read the config file, pick the dashboards
    /// backend from its persistence-type flag, and run the first load.
    pub fn open(config_path: &Path) -> Result<Self, ConfigError> {
        let global_store = Arc::new(DiskConfigStore::new(config_path));

        let raw: Value = serde_json::from_str(&global_store.read_config()?)?;
        let persistence = raw
            .get(model::PERSISTENCE_TYPE)
            .and_then(Value::as_str)
            .map(PersistenceType::parse)
            .unwrap_or(PersistenceType::Disk);

        let dashboards_store: Arc<dyn ConfigStore> = match persistence {
            PersistenceType::Disk => {
                info!("Using disk as persistence store for dashboard config");
                global_store.clone()
            }
            PersistenceType::DocumentStore => {
                let store_path = raw
                    .get(DOCUMENT_STORE_PATH)
                    .and_then(Value::as_str)
                    .map_or_else(|| config_path.with_extension("db"), Into::into);
                info!(path = %store_path.display(), "Using document store for dashboard config");
                Arc::new(DocumentConfigStore::open(store_path)?)
            }
        };

        Self::with_stores(global_store, dashboards_store)
    }

    /// Constructor over explicit store implementations. The first load runs
    /// here and its failure is fatal.
    pub fn with_stores(
        global_store: Arc<dyn ConfigStore>,
        dashboards_store: Arc<dyn ConfigStore>,
    ) -> Result<Self, ConfigError> {
        let snapshot = load_snapshot(global_store.as_ref(), dashboards_store.as_ref())?;
        info!(
            dashboards = snapshot.dashboards.len(),
            graphs = snapshot.total_graph_count(),
            "Config initialized"
        );

        Ok(Self {
            global_store,
            dashboards_store,
            snapshot: RwLock::new(Arc::new(snapshot)),
            reload: Mutex::new(()),
        })
    }

    /// The current snapshot. Cheap: clones one `Arc` under a read lock.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.read().unwrap().clone()
    }

    /// Compare the stores' change tokens against the last-applied version
    /// and re-run the full load pipeline on mismatch. Returns whether a new
    /// snapshot was published. A reload that fails validation keeps the
    /// previous snapshot and will be retried on the next check.
    pub fn check_for_update(&self) -> bool {
        let _guard = self.reload.lock().unwrap();

        let stored = match self.stored_version() {
            Ok(version) => version,
            Err(err) => {
                warn!(error = %err, "Could not read config change tokens, skipping check");
                return false;
            }
        };

        if stored == self.current().version {
            return false;
        }

        info!("Config change detected, reloading");
        match load_snapshot(self.global_store.as_ref(), self.dashboards_store.as_ref()) {
            Ok(snapshot) => {
                info!(
                    dashboards = snapshot.dashboards.len(),
                    graphs = snapshot.total_graph_count(),
                    version = %snapshot.version,
                    "Config reloaded"
                );
                *self.snapshot.write().unwrap() = Arc::new(snapshot);
                true
            }
            Err(err) => {
                error!(error = %err, "Config reload failed, keeping previous snapshot");
                false
            }
        }
    }

    /// Write a replacement dashboards document through the active backend
    /// and reload immediately so the in-memory config reflects it.
    pub fn update_dashboards(
        &self,
        document: &str,
        prior_version: Option<&str>,
    ) -> Result<(), ConfigError> {
        self.dashboards_store.write_config(document, prior_version)?;
        self.check_for_update();
        Ok(())
    }

    /// The raw dashboards document exactly as the backend stores it.
    pub fn dashboards_document(&self) -> Result<String, StoreError> {
        self.dashboards_store.read_config()
    }

    fn stored_version(&self) -> Result<ConfigVersion, StoreError> {
        Ok(ConfigVersion {
            global: self.global_store.last_updated()?,
            dashboards: self.dashboards_store.last_updated()?,
        })
    }
}

/// The full load pipeline: read global section, strip any embedded
/// dashboards sub-document from it, read the dashboards section from its
/// backend, validate, parse, resolve cross-references.
fn load_snapshot(
    global_store: &dyn ConfigStore,
    dashboards_store: &dyn ConfigStore,
) -> Result<ConfigSnapshot, ConfigError> {
    let mut global: Value = serde_json::from_str(&global_store.read_config()?)?;
    if let Some(obj) = global.as_object_mut() {
        // With disk persistence the dashboards live in the same file but
        // belong to the other section.
        obj.remove(model::DASHBOARDS);
    }

    let dashboards_doc: Value = serde_json::from_str(&dashboards_store.read_config()?)?;
    let dashboards_section = dashboards_doc
        .get(model::DASHBOARDS)
        .cloned()
        .unwrap_or(Value::Null);

    let errors = model::validate(&global, &dashboards_section);
    if !errors.is_empty() {
        return Err(ConfigError::Validation(errors));
    }

    let settings = model::parse_global(&global)?;
    let plugins = model::parse_plugins(&global)?;
    let mut dashboards = model::parse_dashboards(&dashboards_section, &settings.temp_path)?;
    model::resolve_disk_urls(&mut dashboards);

    let version = ConfigVersion {
        global: global_store.last_updated()?,
        dashboards: dashboards_store.last_updated()?,
    };

    Ok(ConfigSnapshot {
        settings,
        plugins,
        dashboards,
        version,
    })
}
