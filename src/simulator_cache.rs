//! Cache of per-model [`Simulator`]s (a loaded Wind Field plus its model
//! id). Two-mode sizing (NORMAL/ENSEMBLE) with a delayed-release queue so a
//! consumer that grabbed a reference just before an eviction still has a
//! grace window to finish using it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::blob_client::BlobClient;
use crate::errors::Result;
use crate::weather_store::WeatherArrayStore;
use crate::wind_field::{LoadMode, WindField};

pub const NORMAL_LIMIT: usize = 10;
pub const ENSEMBLE_LIMIT: usize = 30;
const DELAYED_RELEASE_GRACE: Duration = Duration::from_secs(2);
const ENSEMBLE_MAX_DURATION: Duration = Duration::from_secs(300);
const CYCLE_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct Simulator {
    pub model_id: u32,
    pub wind: RwLock<WindField>,
}

struct DelayedEntry {
    simulator: Arc<Simulator>,
    release_after: Instant,
}

struct Inner {
    cache_dir: PathBuf,
    blob: BlobClient,
    store: Arc<WeatherArrayStore>,

    simulators: DashMap<u32, Arc<Simulator>>,
    last_access: DashMap<u32, Instant>,
    in_use: DashMap<u32, usize>,
    delayed: Mutex<Vec<(u32, DelayedEntry)>>,

    limit: std::sync::atomic::AtomicUsize,
    ensemble_started: Mutex<Option<Instant>>,
    ensemble_deadline: Mutex<Option<Instant>>,

    cycle_pointer: Mutex<Option<(Instant, String)>>,
}

/// The in-memory simulator cache. One instance per worker process.
#[derive(Clone)]
pub struct SimulatorCache {
    inner: Arc<Inner>,
}

impl SimulatorCache {
    pub fn new(cache_dir: PathBuf, blob: BlobClient, store: Arc<WeatherArrayStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache_dir,
                blob,
                store,
                simulators: DashMap::new(),
                last_access: DashMap::new(),
                in_use: DashMap::new(),
                delayed: Mutex::new(Vec::new()),
                limit: std::sync::atomic::AtomicUsize::new(NORMAL_LIMIT),
                ensemble_started: Mutex::new(None),
                ensemble_deadline: Mutex::new(None),
                cycle_pointer: Mutex::new(None),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.simulators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.simulators.is_empty()
    }

    pub fn current_limit(&self) -> usize {
        self.inner.limit.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Extend or start ensemble mode for 300s, clamping extensions so the
    /// continuous duration never exceeds `ENSEMBLE_MAX_DURATION`.
    pub async fn activate_ensemble_mode(&self) {
        let now = Instant::now();
        let mut started = self.inner.ensemble_started.lock().await;
        let mut deadline = self.inner.ensemble_deadline.lock().await;

        if started.is_none() {
            *started = Some(now);
        }
        let max_deadline = started.unwrap() + ENSEMBLE_MAX_DURATION;
        let requested = now + ENSEMBLE_MAX_DURATION;
        *deadline = Some(requested.min(max_deadline));

        self.inner.limit.store(ENSEMBLE_LIMIT, std::sync::atomic::Ordering::SeqCst);
        if self.current_limit() != ENSEMBLE_LIMIT {
            warn!("cache limit did not expand when activating ensemble mode");
        }
    }

    async fn ensemble_mode_active(&self) -> bool {
        self.inner.ensemble_deadline.lock().await.is_some()
    }

    /// Fetch (or refresh, if stale by ≥5 minutes) the current cycle id.
    pub async fn current_cycle(&self) -> Result<String> {
        {
            let guard = self.inner.cycle_pointer.lock().await;
            if let Some((fetched_at, value)) = guard.as_ref() {
                if fetched_at.elapsed() < CYCLE_REFRESH_INTERVAL {
                    return Ok(value.clone());
                }
            }
        }
        let text = self.inner.blob.open_text("whichgefs").await?;
        let cycle = text.trim().to_string();
        *self.inner.cycle_pointer.lock().await = Some((Instant::now(), cycle.clone()));
        Ok(cycle)
    }

    pub fn mark_in_use(&self, model_id: u32) {
        *self.inner.in_use.entry(model_id).or_insert(0) += 1;
    }

    pub fn unmark_in_use(&self, model_id: u32) {
        if let Some(mut count) = self.inner.in_use.get_mut(&model_id) {
            if *count > 0 {
                *count -= 1;
            }
        }
    }

    fn is_in_use(&self, model_id: u32) -> bool {
        self.inner.in_use.get(&model_id).map(|c| *c > 0).unwrap_or(false)
    }

    /// Get (or build) the Simulator for `model_id`, refreshing the cycle
    /// pointer and trimming the cache first.
    pub async fn acquire(&self, model_id: u32) -> Result<Arc<Simulator>> {
        let _ = self.current_cycle().await;
        self.trim().await;

        if let Some(existing) = self.inner.simulators.get(&model_id) {
            if !existing.wind.read().await.is_released() {
                self.inner.last_access.insert(model_id, Instant::now());
                return Ok(existing.clone());
            }
        }
        self.inner.simulators.remove(&model_id);

        let cycle = self.current_cycle().await?;
        let name = format!("{cycle}_{model_id:02}.npz");
        let npz_path = self.inner.store.ensure_cached(&name).await?;
        // ensure_cached returns the sibling .data.npy path for .npz inputs.
        let raw_npz = self.inner.cache_dir.join(&name);
        let mode = if self.ensemble_mode_active().await { LoadMode::Preload } else { LoadMode::Memmap };
        let wind = WindField::load(&raw_npz, &npz_path, mode)?;

        let simulator = Arc::new(Simulator { model_id, wind: RwLock::new(wind) });

        if self.inner.simulators.len() >= self.current_limit() {
            self.evict_one(Some(model_id)).await;
        }
        self.inner.simulators.insert(model_id, simulator.clone());
        self.inner.last_access.insert(model_id, Instant::now());
        Ok(simulator)
    }

    /// Trim algorithm: process delayed releases, expire ensemble mode, and
    /// push over-limit entries into the delayed-release queue.
    pub async fn trim(&self) {
        self.process_delayed_releases().await;

        let ensemble_active = self.ensemble_mode_active().await;
        if ensemble_active {
            let expired = {
                let deadline = self.inner.ensemble_deadline.lock().await;
                deadline.map(|d| Instant::now() >= d).unwrap_or(false)
            };
            if expired {
                *self.inner.ensemble_started.lock().await = None;
                *self.inner.ensemble_deadline.lock().await = None;
                self.inner.limit.store(NORMAL_LIMIT, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let limit = self.current_limit();
        if self.inner.simulators.len() > limit {
            self.evict_one(None).await;
        }
    }

    async fn evict_one(&self, protect: Option<u32>) {
        let mut candidates: Vec<(u32, Instant)> = self
            .inner
            .last_access
            .iter()
            .filter(|e| !self.is_in_use(*e.key()) && Some(*e.key()) != protect)
            .map(|e| (*e.key(), *e.value()))
            .collect();
        candidates.sort_by_key(|(_, t)| *t);

        if let Some((model_id, _)) = candidates.into_iter().next() {
            if let Some((_, sim)) = self.inner.simulators.remove(&model_id) {
                self.inner.delayed.lock().await.push((
                    model_id,
                    DelayedEntry { simulator: sim, release_after: Instant::now() + DELAYED_RELEASE_GRACE },
                ));
            }
        }
    }

    async fn process_delayed_releases(&self) {
        let now = Instant::now();
        let mut delayed = self.inner.delayed.lock().await;
        let mut remaining = Vec::with_capacity(delayed.len());
        for (model_id, entry) in delayed.drain(..) {
            if now < entry.release_after {
                remaining.push((model_id, entry));
                continue;
            }
            if self.is_in_use(model_id) {
                remaining.push((model_id, entry));
                continue;
            }
            if self.inner.simulators.contains_key(&model_id) {
                info!(model_id, "simulator was reinstated before delayed release, skipping teardown");
                continue;
            }
            entry.simulator.wind.write().await.release();
        }
        *delayed = remaining;
    }

    /// Force the cache down to its single most-recently-used entry.
    pub async fn force_trim_to_mru(&self) {
        while self.inner.simulators.len() > 1 {
            let before = self.inner.simulators.len();
            self.evict_one(None).await;
            if self.inner.simulators.len() == before {
                break;
            }
        }
        self.process_delayed_releases().await;
    }

    /// Release every cached simulator not currently in-use. Used by the
    /// Lifecycle Manager's deep cleanup.
    pub async fn release_all(&self) {
        let ids: Vec<u32> = self.inner.simulators.iter().map(|e| *e.key()).collect();
        for id in ids {
            if self.is_in_use(id) {
                continue;
            }
            if let Some((_, sim)) = self.inner.simulators.remove(&id) {
                sim.wind.write().await.release();
            }
        }
        self.process_delayed_releases().await;
    }

    pub fn in_use_ids(&self) -> HashSet<u32> {
        self.inner
            .in_use
            .iter()
            .filter(|e| *e.value() > 0)
            .map(|e| *e.key())
            .collect()
    }
}
