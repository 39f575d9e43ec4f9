//! Shared application state: one instance per worker process, held behind
//! an `Arc` by the HTTP surface and the Lifecycle Manager.

use std::sync::Arc;

use crate::blob_client::BlobClient;
use crate::config::CoreConfig;
use crate::elevation_field::ElevationField;
use crate::prediction_cache::PredictionCache;
use crate::progress::ProgressRegistry;
use crate::simulator_cache::SimulatorCache;
use crate::weather_store::WeatherArrayStore;

pub struct CoreState {
    pub config: CoreConfig,
    pub blob: BlobClient,
    pub weather_store: Arc<WeatherArrayStore>,
    pub simulator_cache: SimulatorCache,
    pub elevation: ElevationField,
    pub prediction_cache: PredictionCache,
    pub progress: ProgressRegistry,
}

impl CoreState {
    pub fn new(config: CoreConfig) -> Self {
        let blob = BlobClient::new(&config);
        let weather_store = Arc::new(WeatherArrayStore::new(config.cache_dir.clone(), blob.clone()));
        let simulator_cache = SimulatorCache::new(config.cache_dir.clone(), blob.clone(), weather_store.clone());
        let elevation = ElevationField::new(weather_store.clone());

        Self {
            config,
            blob,
            weather_store,
            simulator_cache,
            elevation,
            prediction_cache: PredictionCache::new(),
            progress: ProgressRegistry::new(),
        }
    }
}
