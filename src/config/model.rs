//! Typed configuration entities
//!
//! The persisted configuration is one JSON document: global settings plus a
//! `dashboards` section that may live in a separate backend. This module
//! validates the raw document, parses it into typed entities, and resolves
//! cross-references between graphs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use super::ConfigError;

// Document keys. The global section mixes dotted and camelCase names; both
// are part of the on-disk format and must not be normalized.
pub(crate) const HTTP_PORT: &str = "httpPort";
pub(crate) const WEB_CONTEXTROOT: &str = "web.contextroot";
pub(crate) const TEMP_PATH: &str = "temp.path";
pub(crate) const MAX_SESSION_DURATION_MINUTES: &str = "maxSessionDurationMinutes";
pub(crate) const PLUGINS: &str = "plugins";
pub(crate) const PERSISTENCE_TYPE: &str = "dashboard.config.persistence.type";
pub(crate) const BROWSER_INSTANCES: &str = "browserInstances";
pub(crate) const DASHBOARDS: &str = "dashboards";

const REQUIRED_GLOBAL_KEYS: [&str; 7] = [
    HTTP_PORT,
    WEB_CONTEXTROOT,
    TEMP_PATH,
    MAX_SESSION_DURATION_MINUTES,
    PLUGINS,
    PERSISTENCE_TYPE,
    BROWSER_INSTANCES,
];

pub const IMAGE_SUFFIX: &str = ".png";

/// Closed set of graph kinds. `Disk` is a sentinel: such a graph has no
/// URL of its own and borrows one from a non-disk graph with the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphKind {
    CloudWatch,
    CloudWatchDashboard,
    Performr,
    Kibana,
    Kibana5,
    Sonar,
    Disk,
}

impl GraphKind {
    /// Kinds a vendor plugin may be declared for (everything but the sentinel).
    pub const VENDORS: [GraphKind; 6] = [
        GraphKind::CloudWatch,
        GraphKind::CloudWatchDashboard,
        GraphKind::Performr,
        GraphKind::Kibana,
        GraphKind::Kibana5,
        GraphKind::Sonar,
    ];

    /// Parse the document tag, case-insensitively. Unknown tags are `None`
    /// and surface as validation errors rather than a fallback kind.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "cloudwatch" => Some(GraphKind::CloudWatch),
            "cloudwatch-dashboard" => Some(GraphKind::CloudWatchDashboard),
            "performr" => Some(GraphKind::Performr),
            "kibana" => Some(GraphKind::Kibana),
            "kibana5" => Some(GraphKind::Kibana5),
            "sonar" => Some(GraphKind::Sonar),
            "disk" => Some(GraphKind::Disk),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GraphKind::CloudWatch => "cloudwatch",
            GraphKind::CloudWatchDashboard => "cloudwatch-dashboard",
            GraphKind::Performr => "performr",
            GraphKind::Kibana => "kibana",
            GraphKind::Kibana5 => "kibana5",
            GraphKind::Sonar => "sonar",
            GraphKind::Disk => "disk",
        }
    }

    pub fn is_disk(self) -> bool {
        matches!(self, GraphKind::Disk)
    }
}

impl std::fmt::Display for GraphKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One screenshot target belonging to a dashboard.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphDefinition {
    pub id: String,
    pub kind: GraphKind,
    pub url: Option<String>,
    pub browser_width: u32,
    pub browser_height: u32,
    pub time_range: Option<u32>,
    pub components: Option<Vec<String>>,
    /// Where the latest capture for this graph is written.
    pub image_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardDefinition {
    pub id: String,
    pub title: String,
    pub default_columns: Option<u32>,
    /// Declaration order is significant and preserved.
    pub graphs: Vec<GraphDefinition>,
}

/// One vendor plugin declaration from the global section.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginDefinition {
    pub kind: GraphKind,
    pub login_url: String,
    pub username: String,
    pub password: String,
    pub update_interval: Duration,
    /// Name of the browser-instance group this plugin is scheduled into.
    pub browser_instance: String,
}

/// Which backend holds the dashboards section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceType {
    Disk,
    DocumentStore,
}

impl PersistenceType {
    /// Anything that is not explicitly the document store falls back to
    /// disk, matching the permissive historical behavior.
    pub fn parse(tag: &str) -> Self {
        if tag.eq_ignore_ascii_case("document") {
            PersistenceType::DocumentStore
        } else {
            PersistenceType::Disk
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSettings {
    pub http_port: u16,
    /// Always carries a trailing slash.
    pub context_root: String,
    pub temp_path: PathBuf,
    pub max_session_duration: Duration,
    pub browser_instances: Vec<String>,
    pub persistence_type: PersistenceType,
}

/// Opaque comparable reload-detection token: the global section's change
/// marker combined with the dashboards section's change marker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigVersion {
    pub global: String,
    pub dashboards: String,
}

impl std::fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.global, self.dashboards)
    }
}

/// One immutable, fully parsed configuration. Replaced as a whole on
/// reload, never mutated in place.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub settings: GlobalSettings,
    pub plugins: Vec<PluginDefinition>,
    pub dashboards: Vec<DashboardDefinition>,
    pub version: ConfigVersion,
}

impl ConfigSnapshot {
    pub fn plugin_for(&self, kind: GraphKind) -> Option<&PluginDefinition> {
        self.plugins.iter().find(|p| p.kind == kind)
    }

    /// All graphs of a kind across every dashboard, in declaration order.
    pub fn graphs_for(&self, kind: GraphKind) -> Vec<&GraphDefinition> {
        self.dashboards
            .iter()
            .flat_map(|d| d.graphs.iter())
            .filter(|g| g.kind == kind)
            .collect()
    }

    pub fn graph_count_for(&self, kind: GraphKind) -> usize {
        self.graphs_for(kind).len()
    }

    pub fn total_graph_count(&self) -> usize {
        self.dashboards.iter().map(|d| d.graphs.len()).sum()
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Check the raw document before parsing. Returns one message per problem;
/// an empty list means the document is acceptable.
pub fn validate(global: &Value, dashboards_section: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    let Some(global_obj) = global.as_object() else {
        errors.push("global config is not a JSON object".to_string());
        return errors;
    };

    for key in REQUIRED_GLOBAL_KEYS {
        if !global_obj.contains_key(key) {
            errors.push(format!("required config key '{key}' is missing"));
        }
    }

    let Some(dashboards) = dashboards_section.as_array() else {
        errors.push(format!("'{DASHBOARDS}' section is missing or not an array"));
        return errors;
    };

    for (i, dashboard) in dashboards.iter().enumerate() {
        let label = dashboard
            .get("id")
            .and_then(Value::as_str)
            .map_or_else(|| format!("dashboard #{i}"), |id| format!("dashboard '{id}'"));

        for key in ["id", "title", "graphs"] {
            if dashboard.get(key).is_none() {
                errors.push(format!("{label}: required key '{key}' is missing"));
            }
        }

        let Some(graphs) = dashboard.get("graphs").and_then(Value::as_array) else {
            continue;
        };

        for (j, graph) in graphs.iter().enumerate() {
            validate_graph(&label, j, graph, &mut errors);
        }
    }

    errors
}

fn validate_graph(dashboard: &str, index: usize, graph: &Value, errors: &mut Vec<String>) {
    let label = graph
        .get("id")
        .and_then(Value::as_str)
        .map_or_else(|| format!("{dashboard} graph #{index}"), |id| format!("{dashboard} graph '{id}'"));

    if graph.get("id").and_then(Value::as_str).is_none() {
        errors.push(format!("{label}: required key 'id' is missing"));
    }

    let kind = match graph.get("type").and_then(Value::as_str) {
        Some(tag) => match GraphKind::parse(tag) {
            Some(kind) => kind,
            None => {
                errors.push(format!("{label}: unknown type '{tag}'"));
                return;
            }
        },
        None => {
            errors.push(format!("{label}: required key 'type' is missing"));
            return;
        }
    };

    // Disk graphs borrow their URL and viewport from the graph they shadow,
    // so width and height are not required for them.
    if kind.is_disk() {
        return;
    }

    for key in ["browserWidth", "browserHeight"] {
        if graph.get(key).and_then(Value::as_u64).is_none() {
            errors.push(format!("{label}: required key '{key}' is missing"));
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

fn read_str(obj: &Value, key: &str) -> Result<String, ConfigError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ConfigError::Malformed(format!("key '{key}' is missing or not a string")))
}

fn read_u64(obj: &Value, key: &str) -> Result<u64, ConfigError> {
    obj.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| ConfigError::Malformed(format!("key '{key}' is missing or not a number")))
}

pub fn parse_global(global: &Value) -> Result<GlobalSettings, ConfigError> {
    let http_port = u16::try_from(read_u64(global, HTTP_PORT)?)
        .map_err(|_| ConfigError::Malformed(format!("'{HTTP_PORT}' is out of range")))?;

    let mut context_root = read_str(global, WEB_CONTEXTROOT)?;
    if !context_root.ends_with('/') {
        context_root.push('/');
    }

    let minutes = read_u64(global, MAX_SESSION_DURATION_MINUTES)?;

    Ok(GlobalSettings {
        http_port,
        context_root,
        temp_path: PathBuf::from(read_str(global, TEMP_PATH)?),
        max_session_duration: Duration::from_secs(minutes * 60),
        browser_instances: global
            .get(BROWSER_INSTANCES)
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        persistence_type: PersistenceType::parse(&read_str(global, PERSISTENCE_TYPE)?),
    })
}

pub fn parse_plugins(global: &Value) -> Result<Vec<PluginDefinition>, ConfigError> {
    let Some(declared) = global.get(PLUGINS).and_then(Value::as_array) else {
        return Err(ConfigError::Malformed(format!(
            "'{PLUGINS}' is missing or not an array"
        )));
    };

    declared
        .iter()
        .map(|plugin| {
            let tag = read_str(plugin, "type")?;
            let kind = GraphKind::parse(&tag)
                .ok_or_else(|| ConfigError::Malformed(format!("unknown plugin type '{tag}'")))?;
            Ok(PluginDefinition {
                kind,
                login_url: read_str(plugin, "loginUrl")?,
                username: read_str(plugin, "username")?,
                password: read_str(plugin, "password")?,
                update_interval: Duration::from_secs(read_u64(
                    plugin,
                    "backendUpdateIntervalSeconds",
                )?),
                browser_instance: read_str(plugin, "browserInstance")?,
            })
        })
        .collect()
}

/// Parse the dashboards section in declaration order. Validation has
/// already run, so anything missing here is a hard `Malformed` error.
pub fn parse_dashboards(
    dashboards_section: &Value,
    temp_path: &Path,
) -> Result<Vec<DashboardDefinition>, ConfigError> {
    let Some(dashboards) = dashboards_section.as_array() else {
        return Err(ConfigError::Malformed(format!(
            "'{DASHBOARDS}' section is not an array"
        )));
    };

    dashboards
        .iter()
        .map(|dashboard| {
            let graphs = dashboard
                .get("graphs")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .map(|graph| parse_graph(graph, temp_path))
                .collect::<Result<Vec<_>, _>>()?;

            Ok(DashboardDefinition {
                id: read_str(dashboard, "id")?,
                title: read_str(dashboard, "title")?,
                default_columns: dashboard
                    .get("defaultNumberOfColumns")
                    .and_then(Value::as_u64)
                    .map(|n| n as u32),
                graphs,
            })
        })
        .collect()
}

fn parse_graph(graph: &Value, temp_path: &Path) -> Result<GraphDefinition, ConfigError> {
    let id = read_str(graph, "id")?;
    let tag = read_str(graph, "type")?;
    let kind = GraphKind::parse(&tag)
        .ok_or_else(|| ConfigError::Malformed(format!("graph '{id}': unknown type '{tag}'")))?;

    Ok(GraphDefinition {
        image_path: temp_path.join(format!("{id}{IMAGE_SUFFIX}")),
        url: graph.get("url").and_then(Value::as_str).map(str::to_string),
        browser_width: graph
            .get("browserWidth")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(0),
        browser_height: graph
            .get("browserHeight")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(0),
        time_range: graph
            .get("timeRange")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
        components: graph.get("components").and_then(Value::as_array).map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        }),
        id,
        kind,
    })
}

// ============================================================================
// Cross-reference resolution
// ============================================================================

/// Every disk-sentinel graph resolves its URL from the first non-disk graph
/// anywhere that shares its id, in declaration order. Unmatched disk graphs
/// keep no URL; their captures simply never refresh.
pub fn resolve_disk_urls(dashboards: &mut [DashboardDefinition]) {
    let sources: Vec<(String, Option<String>)> = dashboards
        .iter()
        .flat_map(|d| d.graphs.iter())
        .filter(|g| !g.kind.is_disk())
        .map(|g| (g.id.clone(), g.url.clone()))
        .collect();

    for dashboard in dashboards.iter_mut() {
        for graph in dashboard.graphs.iter_mut().filter(|g| g.kind.is_disk()) {
            if let Some((_, url)) = sources.iter().find(|(id, _)| *id == graph.id) {
                graph.url = url.clone();
            }
        }
    }
}
