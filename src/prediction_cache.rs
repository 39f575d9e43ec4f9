use std::time::Duration;

use moka::future::Cache;

use crate::integrator::Trajectory;

const TTL_SECONDS: u64 = 3600;
const MAX_CAPACITY: u64 = 200;

/// Cache of computed single-flight trajectories, keyed by an MD5 fingerprint
/// of the request parameters. Backed by moka, whose segmented-LRU eviction
/// is approximate under concurrency by design: serializing hundreds of
/// concurrent ensemble writers behind one lock would dominate latency for a
/// cache whose whole point is to avoid recomputation.
#[derive(Clone)]
pub struct PredictionCache {
    cache: Cache<String, Trajectory>,
}

impl PredictionCache {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(MAX_CAPACITY)
                .time_to_live(Duration::from_secs(TTL_SECONDS))
                .build(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn key(
        timestamp: f64,
        lat: f64,
        lon: f64,
        rate: f64,
        step: u32,
        max_duration: f64,
        alt: f64,
        model: u32,
        coefficient: f64,
    ) -> String {
        let raw = format!(
            "{:.0}_{:.4}_{:.4}_{:.2}_{}_{:.1}_{:.1}_{}_{:.3}",
            timestamp, lat, lon, rate, step, max_duration, alt, model, coefficient
        );
        let digest = md5::compute(raw.as_bytes());
        format!("{digest:x}")
    }

    pub async fn get(&self, key: &str) -> Option<Trajectory> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: String, trajectory: Trajectory) {
        self.cache.insert(key, trajectory).await;
    }

    /// Clear wholesale. Called whenever the weather cycle rolls over, since
    /// every cached trajectory references a now-stale model.
    pub async fn clear(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for PredictionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format_matches_spec() {
        let k = PredictionCache::key(1_700_000_000.0, 37.0, -122.0, 5.0, 120, 2.0, 0.0, 1, 1.0);
        // 32 hex chars, deterministic for identical inputs.
        assert_eq!(k.len(), 32);
        let k2 = PredictionCache::key(1_700_000_000.0, 37.0, -122.0, 5.0, 120, 2.0, 0.0, 1, 1.0);
        assert_eq!(k, k2);
    }

    #[test]
    fn key_changes_with_inputs() {
        let a = PredictionCache::key(1.0, 1.0, 1.0, 1.0, 1, 1.0, 1.0, 1, 1.0);
        let b = PredictionCache::key(1.0, 1.0, 1.0, 1.0, 1, 1.0, 1.0, 1, 1.001);
        assert_ne!(a, b);
    }
}
