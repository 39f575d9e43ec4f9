use crate::config::CoreConfig;
use crate::core_state::CoreState;

/// Print current on-disk and in-memory cache occupancy without starting the
/// server. Useful for a quick health check from a deploy hook or shell.
pub async fn handle_cache_status() -> anyhow::Result<()> {
    let config = CoreConfig::from_env()?;
    let cache_dir = config.cache_dir.clone();
    let state = CoreState::new(config);

    let cycle = state.simulator_cache.current_cycle().await.ok();
    let disk_entries = std::fs::read_dir(&cache_dir).map(|d| d.count()).unwrap_or(0);

    println!("cache directory: {}", cache_dir.display());
    println!("on-disk entries: {disk_entries}");
    println!("current cycle: {}", cycle.as_deref().unwrap_or("unknown"));
    println!(
        "simulator cache: {}/{} resident",
        state.simulator_cache.len(),
        state.simulator_cache.current_limit()
    );
    println!("prediction cache entries: {}", state.prediction_cache.entry_count());
    println!("elevation grid loaded: {}", state.elevation.is_loaded());

    Ok(())
}
