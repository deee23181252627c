//! Fixed-content stores and config fixtures shared by tests across modules.

use std::sync::Arc;

use super::store::{ConfigStore, StoreError};
use super::ConfigManager;

/// Store whose content and change token never move.
pub struct StaticStore {
    body: String,
}

impl StaticStore {
    pub fn new(body: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { body: body.into() })
    }
}

impl ConfigStore for StaticStore {
    fn read_config(&self) -> Result<String, StoreError> {
        Ok(self.body.clone())
    }

    fn last_updated(&self) -> Result<String, StoreError> {
        Ok("static".to_string())
    }

    fn write_config(&self, _document: &str, _prior_version: Option<&str>) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("static test store"))
    }
}

/// Build a manager over fixed global and dashboards documents.
///
/// Panics on invalid fixture config so test failures point at the fixture.
pub fn manager_with(global: &str, dashboards: &str) -> Arc<ConfigManager> {
    let manager = ConfigManager::with_stores(StaticStore::new(global), StaticStore::new(dashboards))
        .expect("test fixture config must load");
    Arc::new(manager)
}

/// A minimal valid global document with one performr plugin bound to the
/// given browser instance.
pub fn global_fixture(temp_path: &str, instance: &str, max_session_minutes: u64) -> String {
    format!(
        r#"{{
            "httpPort": 8080,
            "web.contextroot": "/watchboard/",
            "temp.path": "{temp_path}",
            "maxSessionDurationMinutes": {max_session_minutes},
            "dashboard.config.persistence.type": "disk",
            "browserInstances": ["{instance}"],
            "plugins": [
                {{
                    "type": "performr",
                    "loginUrl": "http://performr.test/login",
                    "username": "robot",
                    "password": "hunter2",
                    "backendUpdateIntervalSeconds": 60,
                    "browserInstance": "{instance}"
                }}
            ]
        }}"#
    )
}

/// A dashboards document with one performr graph per supplied id.
pub fn dashboards_fixture(graph_ids: &[&str]) -> String {
    let graphs: Vec<String> = graph_ids
        .iter()
        .map(|id| {
            format!(
                r#"{{"id": "{id}", "type": "performr", "url": "http://performr.test/{id}",
                     "browserWidth": 1600, "browserHeight": 1200}}"#
            )
        })
        .collect();
    format!(
        r#"{{"dashboards": [{{"id": "main", "title": "Main", "graphs": [{}]}}]}}"#,
        graphs.join(",")
    )
}
