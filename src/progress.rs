//! In-memory registry of ensemble job progress, polled or streamed by the
//! HTTP surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

const REMOVAL_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct JobCounters {
    pub ensemble_completed: AtomicU32,
    pub ensemble_total: u32,
    pub montecarlo_completed: AtomicU32,
    pub montecarlo_total: u32,
}

impl JobCounters {
    pub fn new(ensemble_total: u32, montecarlo_total: u32) -> Self {
        Self {
            ensemble_completed: AtomicU32::new(0),
            ensemble_total,
            montecarlo_completed: AtomicU32::new(0),
            montecarlo_total,
        }
    }

    pub fn completed(&self) -> u32 {
        self.ensemble_completed.load(Ordering::SeqCst) + self.montecarlo_completed.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u32 {
        self.ensemble_total + self.montecarlo_total
    }

    pub fn percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            100.0
        } else {
            (self.completed() as f64 / total as f64 * 100.0).min(100.0)
        }
    }

    pub fn is_done(&self) -> bool {
        self.completed() >= self.total()
    }
}

#[derive(Debug, serde::Serialize, Clone)]
pub struct ProgressSnapshot {
    pub completed: u32,
    pub total: u32,
    pub ensemble_completed: u32,
    pub ensemble_total: u32,
    pub montecarlo_completed: u32,
    pub montecarlo_total: u32,
    pub percentage: f64,
}

/// Tracks all in-flight (and recently completed) ensemble jobs, keyed by
/// request fingerprint.
#[derive(Clone, Default)]
pub struct ProgressRegistry {
    jobs: Arc<Mutex<HashMap<String, Arc<JobCounters>>>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, request_id: String, ensemble_total: u32, montecarlo_total: u32) -> Arc<JobCounters> {
        let counters = Arc::new(JobCounters::new(ensemble_total, montecarlo_total));
        self.jobs.lock().await.insert(request_id, counters.clone());
        counters
    }

    pub async fn snapshot(&self, request_id: &str) -> Option<ProgressSnapshot> {
        let jobs = self.jobs.lock().await;
        let counters = jobs.get(request_id)?;
        Some(ProgressSnapshot {
            completed: counters.completed(),
            total: counters.total(),
            ensemble_completed: counters.ensemble_completed.load(Ordering::SeqCst),
            ensemble_total: counters.ensemble_total,
            montecarlo_completed: counters.montecarlo_completed.load(Ordering::SeqCst),
            montecarlo_total: counters.montecarlo_total,
            percentage: counters.percentage(),
        })
    }

    /// Schedule removal of a job 30s after it completes, so a final poll or
    /// the tail of an SSE stream still observes the terminal state.
    pub fn schedule_removal(&self, request_id: String) {
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REMOVAL_DELAY).await;
            jobs.lock().await.remove(&request_id);
        });
    }

    pub async fn exists(&self, request_id: &str) -> bool {
        self.jobs.lock().await.contains_key(request_id)
    }
}
