//! Watchboard daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use watchboard::browser::{ChromiumSessions, RetryPolicy};
use watchboard::config::ConfigManager;
use watchboard::plugins::{assign_groups, PluginRegistry};
use watchboard::scheduler::{GroupScheduler, SchedulerSet};

/// How long shutdown waits for each group to finish its in-flight pass.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watchboard=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config_path = std::env::var("WATCHBOARD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./config.json"));

    // A config that fails to load at boot is fatal; after boot, reload
    // failures keep the last good snapshot instead.
    tracing::info!(path = %config_path.display(), "Loading configuration");
    let config = Arc::new(ConfigManager::open(&config_path)?);

    let snapshot = config.current();
    std::fs::create_dir_all(&snapshot.settings.temp_path)?;
    tracing::info!(
        version = %snapshot.version,
        dashboards = snapshot.dashboards.len(),
        graphs = snapshot.total_graph_count(),
        browser_instances = snapshot.settings.browser_instances.len(),
        "Watchboard starting"
    );

    let registry = PluginRegistry::standard();
    let groups = assign_groups(&config, &registry);
    if groups.is_empty() {
        tracing::warn!("No plugin groups to schedule, nothing will be captured");
    }

    let mut set = SchedulerSet::new();
    for group in groups {
        let provider = ChromiumSessions::new(group.instance.clone(), RetryPolicy::default());
        let scheduler = GroupScheduler::new(
            group.instance,
            provider,
            group.workers,
            Arc::clone(&config),
            set.cancel_token(),
        );
        set.spawn(scheduler);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping scheduler groups");
    set.shutdown(SHUTDOWN_GRACE).await;
    tracing::info!("Watchboard stopped");

    Ok(())
}
