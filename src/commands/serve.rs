use std::sync::Arc;

use tracing::info;

use crate::config::CoreConfig;
use crate::core_state::CoreState;
use crate::lifecycle::{self, ActivityTracker};
use crate::metrics;
use crate::web;

/// Start the HTTP surface and the background Lifecycle Manager. Runs until
/// the process receives a termination signal.
pub async fn handle_serve() -> anyhow::Result<()> {
    let config = CoreConfig::from_env()?;
    info!(bind_addr = %config.bind_addr, cache_dir = ?config.cache_dir, "starting stratocast core");

    metrics::initialize_core_metrics();

    let state = Arc::new(CoreState::new(config));
    let activity = ActivityTracker::new();

    let lifecycle_state = state.clone();
    let lifecycle_activity = activity.clone();
    tokio::spawn(async move {
        lifecycle::run(lifecycle_state, lifecycle_activity).await;
    });

    tokio::select! {
        result = web::start_web_server(state, activity) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            Ok(())
        }
    }
}
