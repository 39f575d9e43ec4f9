use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response, Sse};
use axum::response::sse::{Event, KeepAlive};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::core_state::CoreState;
use crate::ensemble::{self, SpaceshotRequest};
use crate::errors::CoreError;
use crate::flight_profile;
use crate::integrator::{self, Target};
use crate::lifecycle::ActivityTracker;
use crate::prediction_cache::PredictionCache;

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<CoreState>,
    pub activity: ActivityTracker,
}

async fn request_logging_middleware(request: Request<axum::body::Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().to_string()[..8].to_string();
    let start = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed = start.elapsed();

    info!(
        request_id,
        method = %method,
        path,
        status = status.as_u16(),
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        "handled request"
    );
    response
}

fn error_response(err: CoreError) -> Response {
    match &err {
        CoreError::OutOfRange(_) => (StatusCode::OK, "error").into_response(),
        CoreError::WeatherUnavailable { .. } => {
            (StatusCode::NOT_FOUND, format!("model file not available: {err}")).into_response()
        }
        CoreError::RaceWithCleanup(_) => (StatusCode::OK, "error").into_response(),
        CoreError::CorruptedArchive(_) => (StatusCode::NOT_FOUND, err.to_string()).into_response(),
        _ => {
            error!(error = %err, "unexpected core error");
            (StatusCode::INTERNAL_SERVER_ERROR, "error").into_response()
        }
    }
}

#[derive(Deserialize)]
struct SinglePredictQuery {
    timestamp: f64,
    lat: f64,
    lon: f64,
    rate: f64,
    dur: f64,
    step: u32,
    alt: f64,
    model: u32,
    coeff: f64,
}

async fn singlepredict(State(state): State<AppState>, Query(q): Query<SinglePredictQuery>) -> Response {
    state.activity.record_request();
    let core = state.core;

    let key = PredictionCache::key(q.timestamp, q.lat, q.lon, q.rate, q.step, q.dur, q.alt, q.model, q.coeff);
    if let Some(cached) = core.prediction_cache.get(&key).await {
        return Json(serialize_trajectory(&cached)).into_response();
    }

    let result: Result<_, CoreError> = async {
        let simulator = core.simulator_cache.acquire(q.model).await?;
        core.simulator_cache.mark_in_use(q.model);
        let wind = simulator.wind.read().await;
        let launch = integrator::launch_point(q.timestamp, q.lat, q.lon, q.alt);
        let trajectory = integrator::simulate(
            &wind,
            &core.elevation,
            launch,
            q.step as f64,
            q.coeff,
            q.rate,
            true,
            Target::Duration(q.dur),
        )
        .await;
        drop(wind);
        core.simulator_cache.unmark_in_use(q.model);
        trajectory
    }
    .await;

    match result {
        Ok(trajectory) => {
            core.prediction_cache.insert(key, trajectory.clone()).await;
            Json(serialize_trajectory(&trajectory)).into_response()
        }
        Err(e) => error_response(e),
    }
}

fn serialize_trajectory(t: &integrator::Trajectory) -> Vec<serde_json::Value> {
    t.points()
        .iter()
        .map(|p| json!([p.time, p.lat, p.lon, p.alt, p.u, p.v, 0, 0]))
        .collect()
}

#[derive(Deserialize)]
struct SingleZpbQuery {
    timestamp: f64,
    lat: f64,
    lon: f64,
    alt: f64,
    equil: f64,
    eqtime: f64,
    asc: f64,
    desc: f64,
    model: u32,
}

async fn singlezpb(State(state): State<AppState>, Query(q): Query<SingleZpbQuery>) -> Response {
    state.activity.record_request();
    let core = state.core;

    let result: Result<_, CoreError> = async {
        let simulator = core.simulator_cache.acquire(q.model).await?;
        core.simulator_cache.mark_in_use(q.model);
        let launch = integrator::launch_point(q.timestamp, q.lat, q.lon, q.alt);
        let profile = flight_profile::run(&simulator, &core.elevation, launch, q.equil, q.eqtime, q.asc, q.desc).await;
        core.simulator_cache.unmark_in_use(q.model);
        profile
    }
    .await;

    match result {
        Ok(profile) => Json(json!([
            serialize_trajectory(&profile.ascent),
            serialize_trajectory(&profile.float),
            serialize_trajectory(&profile.descent),
        ]))
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct SpaceshotQuery {
    timestamp: f64,
    lat: f64,
    lon: f64,
    alt: f64,
    equil: f64,
    eqtime: f64,
    asc: f64,
    desc: f64,
    num_perturbations: Option<u32>,
}

async fn spaceshot(State(state): State<AppState>, Query(q): Query<SpaceshotQuery>) -> Response {
    state.activity.record_request();
    let req = SpaceshotRequest {
        launch_time: q.timestamp,
        lat: q.lat,
        lon: q.lon,
        alt: q.alt,
        burst_alt: q.equil,
        float_time: q.eqtime,
        ascent: q.asc,
        descent: q.desc,
        num_perturbations: q.num_perturbations,
    };
    match ensemble::spaceshot(state.core, req).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ProgressQuery {
    request_id: String,
}

async fn progress(State(state): State<AppState>, Query(q): Query<ProgressQuery>) -> Response {
    match state.core.progress.snapshot(&q.request_id).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

struct StreamState {
    core: Arc<CoreState>,
    request_id: String,
    last_pct: Option<f64>,
    finished: bool,
}

async fn progress_stream(
    State(state): State<AppState>,
    Query(q): Query<ProgressQuery>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let initial = StreamState { core: state.core, request_id: q.request_id, last_pct: None, finished: false };

    let stream = stream::unfold(initial, |mut st| async move {
        if st.finished {
            return None;
        }
        loop {
            let snapshot = st.core.progress.snapshot(&st.request_id).await;
            let s = match snapshot {
                Some(s) => s,
                None => return None,
            };
            if Some(s.percentage) == st.last_pct {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                continue;
            }
            st.last_pct = Some(s.percentage);
            st.finished = s.completed >= s.total;
            let event = Event::default().data(serde_json::to_string(&s).unwrap_or_default());
            return Some((Ok(event), st));
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct ElevQuery {
    lat: f64,
    lon: f64,
}

async fn elev(State(state): State<AppState>, Query(q): Query<ElevQuery>) -> Response {
    state.activity.record_request();
    match state.core.elevation.get(q.lat, q.lon).await {
        Ok(v) => v.to_string().into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct WindQuery {
    lat: f64,
    lon: f64,
    alt: f64,
    timestamp: f64,
    model: u32,
}

async fn wind(State(state): State<AppState>, Query(q): Query<WindQuery>) -> Response {
    state.activity.record_request();
    let core = state.core;
    let result: Result<_, CoreError> = async {
        let simulator = core.simulator_cache.acquire(q.model).await?;
        let wind = simulator.wind.read().await;
        wind.get(q.lat, q.lon, q.alt, q.timestamp)
    }
    .await;
    match result {
        Ok((u, v)) => Json(json!({ "u": u, "v": v })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn windensemble(State(state): State<AppState>, Query(q): Query<WindQuery>) -> Response {
    state.activity.record_request();
    let core = state.core;
    let mut out = Vec::new();
    for model in core.config.model_ids() {
        let value = async {
            let simulator = core.simulator_cache.acquire(model).await?;
            let wind = simulator.wind.read().await;
            wind.get(q.lat, q.lon, q.alt, q.timestamp)
        }
        .await;
        out.push(match value {
            Ok((u, v)) => json!({ "model": model, "u": u, "v": v }),
            Err(_) => json!({ "model": model, "error": "error" }),
        });
    }
    Json(out).into_response()
}

async fn models(State(state): State<AppState>) -> Response {
    Json(state.core.config.model_ids()).into_response()
}

async fn which(State(state): State<AppState>) -> Response {
    match state.core.simulator_cache.current_cycle().await {
        Ok(cycle) => cycle.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Serialize)]
struct StatusResponse {
    simulator_count: usize,
    simulator_limit: usize,
    prediction_cache_entries: u64,
    elevation_loaded: bool,
}

async fn status(State(state): State<AppState>) -> Response {
    Json(StatusResponse {
        simulator_count: state.core.simulator_cache.len(),
        simulator_limit: state.core.simulator_cache.current_limit(),
        prediction_cache_entries: state.core.prediction_cache.entry_count(),
        elevation_loaded: state.core.elevation.is_loaded(),
    })
    .into_response()
}

pub fn sim_router(core: Arc<CoreState>, activity: ActivityTracker) -> Router {
    let state = AppState { core, activity };

    Router::new()
        .route("/singlepredict", get(singlepredict))
        .route("/singlezpb", get(singlezpb))
        .route("/spaceshot", get(spaceshot))
        .route("/progress", get(progress))
        .route("/progress-stream", get(progress_stream))
        .route("/elev", get(elev))
        .route("/wind", get(wind))
        .route("/windensemble", get(windensemble))
        .route("/models", get(models))
        .route("/which", get(which))
        .route("/status", get(status))
        .route("/cache-status", get(status))
        .with_state(state)
}

pub async fn start_web_server(core: Arc<CoreState>, activity: ActivityTracker) -> anyhow::Result<()> {
    let bind_addr = core.config.bind_addr.clone();
    let app = Router::new()
        .nest("/sim", sim_router(core, activity))
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(CorsLayer::permissive());

    info!(bind_addr, "starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
