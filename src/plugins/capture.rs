//! Navigate-and-screenshot worker shared by every vendor kind.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{PluginError, PluginWorker};
use crate::browser::BrowserSession;
use crate::config::{ConfigManager, GraphDefinition, GraphKind};

/// Pause after navigation so async dashboard widgets finish rendering
/// before the capture.
const RENDER_SETTLE: Duration = Duration::from_secs(2);

/// Pacing used when the plugin definition vanished mid-reload.
const FALLBACK_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

/// Captures every graph of one kind by loading its URL and writing a
/// full-page PNG next to the graph id under the temp path.
pub struct PageCapturePlugin {
    kind: GraphKind,
    config: Arc<ConfigManager>,
}

impl PageCapturePlugin {
    pub fn new(kind: GraphKind, config: Arc<ConfigManager>) -> Self {
        Self { kind, config }
    }

    async fn capture_graph(
        &self,
        session: &BrowserSession,
        graph: &GraphDefinition,
    ) -> Result<(), PluginError> {
        let url = graph.url.as_deref().ok_or_else(|| PluginError::MissingUrl {
            id: graph.id.clone(),
        })?;

        if graph.browser_width > 0 && graph.browser_height > 0 {
            session
                .set_viewport(graph.browser_width, graph.browser_height)
                .await?;
        }

        session.goto(url).await?;
        tokio::time::sleep(RENDER_SETTLE).await;

        let png = session.screenshot_png().await?;
        write_image_atomic(&graph.image_path, &png)?;

        debug!(
            graph = %graph.id,
            bytes = png.len(),
            path = %graph.image_path.display(),
            "Captured graph"
        );
        Ok(())
    }
}

#[async_trait]
impl PluginWorker<BrowserSession> for PageCapturePlugin {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn update_interval(&self) -> Duration {
        self.config
            .current()
            .plugin_for(self.kind)
            .map(|p| p.update_interval)
            .unwrap_or(FALLBACK_UPDATE_INTERVAL)
    }

    async fn perform_login(&self, session: &BrowserSession) -> Result<(), PluginError> {
        let snapshot = self.config.current();
        let Some(plugin) = snapshot.plugin_for(self.kind) else {
            return Err(PluginError::Login {
                kind: self.kind,
                reason: "plugin definition no longer present in config".to_string(),
            });
        };

        session
            .goto(&plugin.login_url)
            .await
            .map_err(|e| PluginError::Login {
                kind: self.kind,
                reason: e.to_string(),
            })?;
        tokio::time::sleep(RENDER_SETTLE).await;

        info!(kind = %self.kind.as_str(), "Login page loaded");
        Ok(())
    }

    async fn perform_update(&self, session: &BrowserSession) -> Result<(), PluginError> {
        let snapshot = self.config.current();
        let graphs = snapshot.graphs_for(self.kind);
        if graphs.is_empty() {
            debug!(kind = %self.kind.as_str(), "No graphs for kind, nothing to update");
            return Ok(());
        }

        let mut captured = 0usize;
        let mut failures = 0usize;
        for graph in &graphs {
            match self.capture_graph(session, graph).await {
                Ok(()) => captured += 1,
                Err(e) => {
                    warn!(kind = %self.kind.as_str(), graph = %graph.id, "Capture failed: {e}");
                    failures += 1;
                }
            }
        }

        info!(kind = %self.kind.as_str(), captured, failures, "Update pass finished");

        // A pass where every graph failed signals a broken session and
        // asks the scheduler for a restart. Partial failure does not.
        if captured == 0 {
            return Err(PluginError::NothingCaptured {
                kind: self.kind,
                failures,
            });
        }
        Ok(())
    }

    async fn shutdown(&self) {
        debug!(kind = %self.kind.as_str(), "Plugin shut down");
    }
}

/// Write image bytes via a temp file and rename, so readers of the image
/// directory never observe a half-written PNG.
fn write_image_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("png.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

// ============================================================================
// Tests
// ============================================================================
