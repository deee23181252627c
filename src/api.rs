//! Read and update surface consumed by the web front end.
//!
//! The front end polls the metadata document to learn which images exist
//! and when each was last refreshed. Every entry point runs an
//! opportunistic config check first, so a changed document is visible on
//! the very next read.

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::Serialize;

use crate::config::model::IMAGE_SUFFIX;
use crate::config::{ConfigError, ConfigManager, GraphDefinition, StoreError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetadata {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Web path of the captured image, relative to the context root.
    pub filename: String,
    /// Millisecond epoch mtime of the image file. Absent until the first
    /// capture lands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardMetadata {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_number_of_columns: Option<u32>,
    pub graphs: Vec<GraphMetadata>,
}

/// Stateless facade over the config manager for front-end handlers.
pub struct DashboardApi {
    config: Arc<ConfigManager>,
}

impl DashboardApi {
    pub fn new(config: Arc<ConfigManager>) -> Self {
        Self { config }
    }

    /// Metadata for every configured dashboard, in declaration order.
    pub fn dashboards(&self) -> Vec<DashboardMetadata> {
        self.config.check_for_update();
        let snapshot = self.config.current();
        let context_root = &snapshot.settings.context_root;

        snapshot
            .dashboards
            .iter()
            .map(|dashboard| DashboardMetadata {
                id: dashboard.id.clone(),
                title: dashboard.title.clone(),
                default_number_of_columns: dashboard.default_columns,
                graphs: dashboard
                    .graphs
                    .iter()
                    .map(|graph| graph_metadata(graph, context_root))
                    .collect(),
            })
            .collect()
    }

    /// The raw dashboards document for editing clients.
    pub fn dashboards_document(&self) -> Result<String, StoreError> {
        self.config.check_for_update();
        self.config.dashboards_document()
    }

    /// Persist a replacement dashboards document. `prior_version` is the
    /// version the editing client based its changes on; a mismatch is
    /// logged by the store but never rejected.
    pub fn update_dashboards(
        &self,
        document: &str,
        prior_version: Option<&str>,
    ) -> Result<(), ConfigError> {
        self.config.update_dashboards(document, prior_version)
    }
}

fn graph_metadata(graph: &GraphDefinition, context_root: &str) -> GraphMetadata {
    // context_root is normalized to end with '/'.
    let filename = format!("{context_root}images/{}{IMAGE_SUFFIX}", graph.id);
    GraphMetadata {
        id: graph.id.clone(),
        kind: graph.kind.as_str(),
        url: graph.url.clone(),
        filename,
        last_modified: image_mtime_millis(graph),
        components: graph.components.clone(),
    }
}

fn image_mtime_millis(graph: &GraphDefinition) -> Option<u64> {
    std::fs::metadata(&graph.image_path)
        .ok()?
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::{dashboards_fixture, global_fixture, manager_with};

    #[test]
    fn metadata_reports_filenames_under_context_root() {
        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().to_str().unwrap().to_string();
        std::fs::write(dir.path().join("cpu.png"), b"png-bytes").unwrap();

        let api = DashboardApi::new(manager_with(
            &global_fixture(&temp_path, "alpha", 300),
            &dashboards_fixture(&["cpu", "mem"]),
        ));

        let dashboards = api.dashboards();
        assert_eq!(dashboards.len(), 1);
        assert_eq!(dashboards[0].id, "main");

        let cpu = &dashboards[0].graphs[0];
        assert_eq!(cpu.filename, "/watchboard/images/cpu.png");
        assert_eq!(cpu.kind, "performr");
        assert!(cpu.last_modified.is_some());

        // mem.png was never captured.
        let mem = &dashboards[0].graphs[1];
        assert_eq!(mem.filename, "/watchboard/images/mem.png");
        assert!(mem.last_modified.is_none());
    }

    #[test]
    fn metadata_serializes_with_wire_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let api = DashboardApi::new(manager_with(
            &global_fixture(dir.path().to_str().unwrap(), "alpha", 300),
            &dashboards_fixture(&["cpu"]),
        ));

        let value = serde_json::to_value(api.dashboards()).unwrap();
        let graph = &value[0]["graphs"][0];
        assert_eq!(graph["type"], "performr");
        assert_eq!(graph["id"], "cpu");
        assert!(graph.get("lastModified").is_none());
        assert!(graph["url"].as_str().unwrap().starts_with("http://"));
    }

    #[test]
    fn raw_document_round_trips_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dashboards_fixture(&["cpu"]);
        let api = DashboardApi::new(manager_with(
            &global_fixture(dir.path().to_str().unwrap(), "alpha", 300),
            &doc,
        ));

        assert_eq!(api.dashboards_document().unwrap(), doc);
    }
}
