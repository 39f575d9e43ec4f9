//! Background idle-cleanup task. One instance runs per worker process,
//! reclaiming simulator memory and trimming caches when the worker has been
//! idle for a while.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::core_state::CoreState;
use crate::simulator_cache::NORMAL_LIMIT;

const IDLE_THRESHOLD: Duration = Duration::from_secs(120);
const IDLE_CLEANUP_COOLDOWN: Duration = Duration::from_secs(120);
const EMERGENCY_IDLE_THRESHOLD: Duration = Duration::from_secs(10 * 60);
const POLL_IDLE: Duration = Duration::from_secs(20);
const POLL_UNDER_PRESSURE: Duration = Duration::from_secs(3);

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

/// Tracks the last time a non-diagnostic request was served. Cheap to clone
/// and share with the HTTP middleware that bumps it.
#[derive(Clone)]
pub struct ActivityTracker {
    last_request: Arc<AtomicI64>,
    last_cleanup: Arc<AtomicI64>,
    ever_cleaned: Arc<std::sync::atomic::AtomicBool>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last_request: Arc::new(AtomicI64::new(now_secs())),
            last_cleanup: Arc::new(AtomicI64::new(0)),
            ever_cleaned: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn record_request(&self) {
        self.last_request.store(now_secs(), Ordering::SeqCst);
    }

    fn idle_for(&self) -> Duration {
        let elapsed = now_secs() - self.last_request.load(Ordering::SeqCst);
        Duration::from_secs(elapsed.max(0) as u64)
    }

    fn cleaned_recently(&self) -> bool {
        let elapsed = now_secs() - self.last_cleanup.load(Ordering::SeqCst);
        Duration::from_secs(elapsed.max(0) as u64) < IDLE_CLEANUP_COOLDOWN
    }

    fn mark_cleaned(&self) {
        self.last_cleanup.store(now_secs(), Ordering::SeqCst);
        self.ever_cleaned.store(true, Ordering::SeqCst);
    }

    fn ever_cleaned(&self) -> bool {
        self.ever_cleaned.load(Ordering::SeqCst)
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the lifecycle loop until the process exits. Intended to be spawned
/// once at startup alongside the HTTP server.
pub async fn run(state: Arc<CoreState>, activity: ActivityTracker) {
    loop {
        let idle = activity.idle_for();

        if idle >= IDLE_THRESHOLD && !activity.cleaned_recently() {
            if state.simulator_cache.in_use_ids().is_empty() {
                deep_cleanup(&state).await;
                activity.mark_cleaned();
            }
            tokio::time::sleep(POLL_IDLE).await;
            continue;
        }

        state.simulator_cache.trim().await;
        if state.simulator_cache.len() > NORMAL_LIMIT && !deep_cleanup_pending(&activity, idle) {
            state.simulator_cache.force_trim_to_mru().await;
        }

        if idle > EMERGENCY_IDLE_THRESHOLD && !activity.ever_cleaned() {
            deep_cleanup(&state).await;
            activity.mark_cleaned();
        }

        let sleep = if state.simulator_cache.len() > NORMAL_LIMIT { POLL_UNDER_PRESSURE } else { POLL_IDLE };
        tokio::time::sleep(sleep).await;
    }
}

fn deep_cleanup_pending(_activity: &ActivityTracker, idle: Duration) -> bool {
    idle >= IDLE_THRESHOLD
}

async fn deep_cleanup(state: &Arc<CoreState>) {
    info!("idle cleanup: releasing simulators and caches");
    state.simulator_cache.release_all().await;
    state.prediction_cache.clear().await;
    state.simulator_cache.trim().await;

    trim_malloc();
}

/// Return free pages to the OS where supported. A no-op on platforms
/// without `malloc_trim` (anything but glibc Linux).
#[cfg(all(target_os = "linux", not(target_env = "musl")))]
fn trim_malloc() {
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(not(all(target_os = "linux", not(target_env = "musl"))))]
fn trim_malloc() {}
