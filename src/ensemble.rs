//! Bounded-concurrency ensemble + Monte-Carlo scheduler: for each configured
//! model, runs the base Flight Profile Driver once (an "ensemble" member)
//! and `num_perturbations` randomly jittered runs (Monte-Carlo members),
//! combining both into one weighted landing heatmap.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::core_state::CoreState;
use crate::errors::Result;
use crate::flight_profile;
use crate::integrator::{self, TrajectoryPoint};

const WORKER_POOL_SIZE: usize = 32;
const DEFAULT_NUM_PERTURBATIONS: u32 = 20;
const ENSEMBLE_WEIGHT: f64 = 2.0;
const MC_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct SpaceshotRequest {
    pub launch_time: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub burst_alt: f64,
    pub float_time: f64,
    pub ascent: f64,
    pub descent: f64,
    pub num_perturbations: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Landing {
    pub lat: f64,
    pub lon: f64,
    pub weight: f64,
    pub perturbation_id: i32,
    pub model: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PathResult {
    Trajectory {
        ascent: Vec<SerPoint>,
        float: Vec<SerPoint>,
        descent: Vec<SerPoint>,
    },
    Error(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SerPoint {
    pub t: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub u: f64,
    pub v: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpaceshotResponse {
    pub paths: Vec<PathResult>,
    pub heatmap_data: Vec<Landing>,
    pub request_id: String,
}

fn to_ser_points(t: &integrator::Trajectory) -> Vec<SerPoint> {
    t.points()
        .iter()
        .map(|p| SerPoint { t: p.time, lat: p.lat, lon: p.lon, alt: p.alt, u: p.u, v: p.v })
        .collect()
}

/// JS-`String.hashCode`-style rolling hash, formatted as a zero-padded
/// 16-char lowercase hex string, matching the front-end's fingerprint
/// algorithm so repeated requests with identical parameters are detected.
pub fn fingerprint(input: &str) -> String {
    let mut hash: i32 = 0;
    for c in input.chars() {
        hash = hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(c as i32);
    }
    format!("{:016x}", hash as u32)
}

#[derive(Debug, Clone)]
struct Perturbation {
    lat: f64,
    lon: f64,
    alt: f64,
    burst_alt: f64,
    float_time: f64,
    ascent: f64,
    descent: f64,
    coefficient: f64,
}

fn perturb(rng: &mut StdRng, base: &SpaceshotRequest) -> Perturbation {
    let lat = base.lat + rng.random_range(-0.001..=0.001);
    let mut lon = base.lon + rng.random_range(-0.001..=0.001);
    lon = lon.rem_euclid(360.0);

    let alt = (base.alt + rng.random_range(-50.0..=50.0)).max(0.0);
    let burst_alt = (base.burst_alt + rng.random_range(-200.0..=200.0)).max(alt);
    let float_time = (base.float_time + rng.random_range(-0.5..=0.5)).max(0.0);
    let ascent = (base.ascent + rng.random_range(-0.5..=0.5)).max(0.1);
    let descent = (base.descent + rng.random_range(-0.5..=0.5)).max(0.1);

    let coefficient = if rng.random_bool(0.9) {
        rng.random_range(0.95..=1.0)
    } else {
        rng.random_range(0.90..=0.95)
    };

    Perturbation { lat, lon, alt, burst_alt, float_time, ascent, descent, coefficient }
}

/// Run a full spaceshot: ensemble + Monte Carlo across all configured
/// models, with a single unified progress counter.
pub async fn spaceshot(state: Arc<CoreState>, req: SpaceshotRequest) -> Result<SpaceshotResponse> {
    let models = state.config.model_ids();
    let num_perturbations = req.num_perturbations.unwrap_or(DEFAULT_NUM_PERTURBATIONS);

    let fingerprint_input = format!(
        "{}_{}_{}_{}_{}_{}_{}_{}",
        req.launch_time, req.lat, req.lon, req.alt, req.burst_alt, req.float_time, req.ascent, req.descent
    );
    let request_id = fingerprint(&fingerprint_input);

    let ensemble_total = models.len() as u32;
    let mc_total = num_perturbations * models.len() as u32;
    let counters = state.progress.register(request_id.clone(), ensemble_total, mc_total).await;

    state.simulator_cache.activate_ensemble_mode().await;

    let seed = u64::from(fingerprint_input.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32)));
    let mut rng = StdRng::seed_from_u64(seed);
    let perturbations: Vec<Perturbation> = (0..num_perturbations).map(|_| perturb(&mut rng, &req)).collect();

    let semaphore = Arc::new(Semaphore::new(WORKER_POOL_SIZE));
    let heatmap: Arc<tokio::sync::Mutex<Vec<Landing>>> = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let mut path_tasks = Vec::new();

    for &model_id in &models {
        let state = state.clone();
        let req = req.clone();
        let semaphore = semaphore.clone();
        let counters = counters.clone();
        let heatmap = heatmap.clone();

        path_tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.unwrap();
            let result = run_ensemble_member(&state, model_id, &req).await;
            counters.ensemble_completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            match &result {
                Ok(profile) => {
                    let landing = profile.descent.last();
                    heatmap.lock().await.push(Landing {
                        lat: landing.lat,
                        lon: landing.lon,
                        weight: ENSEMBLE_WEIGHT,
                        perturbation_id: -1,
                        model: model_id,
                    });
                }
                Err(e) => tracing::warn!(model_id, error = %e, "ensemble member failed"),
            }
            (model_id, result)
        }));
    }

    for &model_id in &models {
        for (idx, perturbation) in perturbations.iter().enumerate() {
            let state = state.clone();
            let perturbation = perturbation.clone();
            let semaphore = semaphore.clone();
            let counters = counters.clone();
            let heatmap = heatmap.clone();

            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.unwrap();
                let result = run_mc_member(&state, model_id, &perturbation).await;
                counters.montecarlo_completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if let Ok(point) = result {
                    heatmap.lock().await.push(Landing {
                        lat: point.lat,
                        lon: point.lon,
                        weight: MC_WEIGHT,
                        perturbation_id: idx as i32,
                        model: model_id,
                    });
                }
            });
        }
    }

    let mut ordered_paths: Vec<Option<PathResult>> = vec![None; models.len()];
    for task in path_tasks {
        let (model_id, result) = task.await.map_err(|e| crate::errors::CoreError::other(format!("ensemble task panicked: {e}")))?;
        let idx = models.iter().position(|&m| m == model_id).unwrap_or(0);
        ordered_paths[idx] = Some(match result {
            Ok(profile) => PathResult::Trajectory {
                ascent: to_ser_points(&profile.ascent),
                float: to_ser_points(&profile.float),
                descent: to_ser_points(&profile.descent),
            },
            Err(_) => PathResult::Error("error".to_string()),
        });
    }

    // Monte-Carlo tasks run detached; wait for the counter to report done
    // rather than holding join handles for hundreds of tasks.
    while !counters.is_done() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    state.progress.schedule_removal(request_id.clone());
    state.simulator_cache.trim().await;

    Ok(SpaceshotResponse {
        paths: ordered_paths.into_iter().map(|p| p.unwrap_or(PathResult::Error("error".to_string()))).collect(),
        heatmap_data: Arc::try_unwrap(heatmap).map(|m| m.into_inner()).unwrap_or_default(),
        request_id,
    })
}

async fn run_ensemble_member(state: &CoreState, model_id: u32, req: &SpaceshotRequest) -> Result<flight_profile::FlightProfile> {
    let simulator = state.simulator_cache.acquire(model_id).await?;
    state.simulator_cache.mark_in_use(model_id);
    let launch = integrator::launch_point(req.launch_time, req.lat, req.lon, req.alt);
    let result = flight_profile::run(
        &simulator,
        &state.elevation,
        launch,
        req.burst_alt,
        req.float_time,
        req.ascent,
        req.descent,
    )
    .await;
    state.simulator_cache.unmark_in_use(model_id);
    result
}

async fn run_mc_member(state: &CoreState, model_id: u32, p: &Perturbation) -> Result<TrajectoryPoint> {
    let simulator = state.simulator_cache.acquire(model_id).await?;
    state.simulator_cache.mark_in_use(model_id);
    let result = run_mc_phases(state, &simulator, p).await;
    state.simulator_cache.unmark_in_use(model_id);
    result
}

async fn run_mc_phases(state: &CoreState, simulator: &crate::simulator_cache::Simulator, p: &Perturbation) -> Result<TrajectoryPoint> {
    let launch = integrator::launch_point(0.0, p.lat, p.lon, p.alt);
    let wind = simulator.wind.read().await;
    let ascent = integrator::simulate(
        &wind,
        &state.elevation,
        launch,
        120.0,
        p.coefficient,
        p.ascent,
        false,
        integrator::Target::Altitude(p.burst_alt),
    )
    .await?;

    let float_launch = *ascent.last();
    let float = integrator::simulate(
        &wind,
        &state.elevation,
        float_launch,
        120.0,
        p.coefficient,
        0.0,
        true,
        integrator::Target::Duration(p.float_time),
    )
    .await?;

    let descent_launch = *float.last();
    let descent_duration = descent_launch.alt / p.descent / 3600.0;
    let descent = integrator::simulate(
        &wind,
        &state.elevation,
        descent_launch,
        120.0,
        p.coefficient,
        -p.descent,
        true,
        integrator::Target::Duration(descent_duration),
    )
    .await?;

    Ok(*descent.last())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_and_16_chars() {
        let a = fingerprint("1700000000_37_-122_0_30000_1_5_5");
        let b = fingerprint("1700000000_37_-122_0_30000_1_5_5");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn fingerprint_changes_with_input() {
        let a = fingerprint("a");
        let b = fingerprint("b");
        assert_ne!(a, b);
    }
}
