//! Screenshot plugins and their assignment to browser instance groups.
//!
//! A plugin worker owns the capture logic for one graph kind. Workers never
//! own a browser: the scheduler hands them a session reference for each
//! login and update pass.

mod capture;

pub use capture::PageCapturePlugin;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::browser::{BrowserError, BrowserSession};
use crate::config::{ConfigManager, GraphKind};

#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error("login for {kind} failed: {reason}")]
    Login { kind: GraphKind, reason: String },

    #[error("no {kind} graphs captured ({failures} failures)")]
    NothingCaptured { kind: GraphKind, failures: usize },

    #[error("graph '{id}' has no url to capture")]
    MissingUrl { id: String },

    #[error("failed to write image: {0}")]
    ImageWrite(#[from] std::io::Error),
}

/// One plugin bound to one graph kind, driven by a group scheduler.
///
/// Generic over the session type so scheduler tests can drive workers
/// against a mock session instead of a live Chrome.
#[async_trait]
pub trait PluginWorker<S>: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &str;

    /// Desired gap between update passes. Read live so a config reload
    /// changes pacing without a restart.
    fn update_interval(&self) -> Duration;

    /// Establish an authenticated state in the session. Called once after
    /// every session (re)start, before any update pass.
    async fn perform_login(&self, session: &S) -> Result<(), PluginError>;

    /// Refresh every graph image this plugin owns.
    async fn perform_update(&self, session: &S) -> Result<(), PluginError>;

    /// Final cleanup before the group stops.
    async fn shutdown(&self);
}

type Worker = Arc<dyn PluginWorker<BrowserSession>>;

/// Closed table mapping graph kinds to worker constructors.
///
/// Built once at boot. A kind absent from the table cannot gain a worker
/// at runtime; config validation already rejects unknown type tags.
pub struct PluginRegistry {
    factories: Vec<(GraphKind, fn(GraphKind, Arc<ConfigManager>) -> Worker)>,
}

impl PluginRegistry {
    /// Registry with every vendor kind backed by [`PageCapturePlugin`].
    /// Disk graphs are sentinels, not a plugin, so they get no entry.
    pub fn standard() -> Self {
        fn page_capture(kind: GraphKind, config: Arc<ConfigManager>) -> Worker {
            Arc::new(PageCapturePlugin::new(kind, config))
        }

        Self {
            factories: GraphKind::VENDORS
                .iter()
                .map(|&kind| (kind, page_capture as fn(GraphKind, Arc<ConfigManager>) -> Worker))
                .collect(),
        }
    }

    pub fn supports(&self, kind: GraphKind) -> bool {
        self.factories.iter().any(|(k, _)| *k == kind)
    }

    pub fn create(&self, kind: GraphKind, config: Arc<ConfigManager>) -> Option<Worker> {
        self.factories
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, make)| make(kind, config))
    }
}

/// Workers sharing one browser instance, scheduled together.
pub struct PluginGroup {
    pub instance: String,
    pub workers: Vec<Worker>,
}

/// Partition configured plugins into per-instance groups.
///
/// A plugin lands in a group when its declared browser instance matches,
/// and at least one graph of its kind exists. Instances that end up with
/// no workers are skipped entirely, so no browser is launched for them.
pub fn assign_groups(config: &Arc<ConfigManager>, registry: &PluginRegistry) -> Vec<PluginGroup> {
    let snapshot = config.current();
    let mut groups = Vec::new();

    for instance in &snapshot.settings.browser_instances {
        let mut workers: Vec<Worker> = Vec::new();

        for plugin in &snapshot.plugins {
            if plugin.browser_instance != *instance {
                continue;
            }
            let graphs = snapshot.graph_count_for(plugin.kind);
            if graphs == 0 {
                info!(
                    kind = %plugin.kind.as_str(),
                    instance = %instance,
                    "Plugin declared but no graphs reference it, not scheduling"
                );
                continue;
            }
            match registry.create(plugin.kind, Arc::clone(config)) {
                Some(worker) => {
                    info!(
                        kind = %plugin.kind.as_str(),
                        instance = %instance,
                        graphs,
                        "Assigned plugin to browser instance"
                    );
                    workers.push(worker);
                }
                None => {
                    warn!(kind = %plugin.kind.as_str(), "No worker registered for plugin kind");
                }
            }
        }

        if workers.is_empty() {
            warn!(instance = %instance, "Browser instance has no plugins, skipping");
        } else {
            groups.push(PluginGroup {
                instance: instance.clone(),
                workers,
            });
        }
    }

    groups
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::{dashboards_fixture, global_fixture, manager_with};

    #[test]
    fn registry_covers_every_vendor_kind() {
        let registry = PluginRegistry::standard();
        for kind in GraphKind::VENDORS {
            assert!(registry.supports(kind), "missing factory for {kind:?}");
        }
        assert!(!registry.supports(GraphKind::Disk));
    }

    #[test]
    fn plugin_with_graphs_joins_its_instance_group() {
        let config = manager_with(
            &global_fixture("/tmp/wb-test", "alpha", 300),
            &dashboards_fixture(&["cpu", "mem"]),
        );
        let groups = assign_groups(&config, &PluginRegistry::standard());

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].instance, "alpha");
        assert_eq!(groups[0].workers.len(), 1);
        assert_eq!(groups[0].workers[0].name(), "performr");
    }

    #[test]
    fn plugin_without_graphs_is_not_scheduled() {
        let config = manager_with(
            &global_fixture("/tmp/wb-test", "alpha", 300),
            r#"{"dashboards": [{"id": "d", "title": "D", "graphs": [
                {"id": "s", "type": "sonar", "url": "http://sonar.test/s",
                 "browserWidth": 800, "browserHeight": 600}
            ]}]}"#,
        );
        // The only declared plugin is performr, and no performr graphs exist.
        let groups = assign_groups(&config, &PluginRegistry::standard());
        assert!(groups.is_empty());
    }

    #[test]
    fn instance_name_mismatch_leaves_group_empty() {
        let global = global_fixture("/tmp/wb-test", "alpha", 300)
            .replace(r#""browserInstances": ["alpha"]"#, r#""browserInstances": ["beta"]"#);
        let config = manager_with(&global, &dashboards_fixture(&["cpu"]));

        let groups = assign_groups(&config, &PluginRegistry::standard());
        assert!(groups.is_empty());
    }
}
