//! Three-phase zero-pressure-balloon flight profile: ascent, float, descent.
//! Each phase's final state seeds the next.

use crate::elevation_field::ElevationField;
use crate::errors::Result;
use crate::integrator::{self, Target, Trajectory, TrajectoryPoint};
use crate::simulator_cache::Simulator;

const PHASE_STEP_SECONDS: f64 = 120.0;

pub struct FlightProfile {
    pub ascent: Trajectory,
    pub float: Trajectory,
    pub descent: Trajectory,
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    simulator: &Simulator,
    elevation: &ElevationField,
    launch: TrajectoryPoint,
    burst_alt: f64,
    equilibrium_hours: f64,
    ascent_rate: f64,
    descent_rate: f64,
) -> Result<FlightProfile> {
    let wind = simulator.wind.read().await;

    let ascent = integrator::simulate(
        &wind,
        elevation,
        launch,
        PHASE_STEP_SECONDS,
        1.0,
        ascent_rate,
        false,
        Target::Altitude(burst_alt),
    )
    .await?;

    let float_launch = *ascent.last();
    let float = integrator::simulate(
        &wind,
        elevation,
        float_launch,
        PHASE_STEP_SECONDS,
        1.0,
        0.0,
        true,
        Target::Duration(equilibrium_hours),
    )
    .await?;

    let descent_launch = *float.last();
    let descent_duration = descent_launch.alt / descent_rate / 3600.0;
    let descent = integrator::simulate(
        &wind,
        elevation,
        descent_launch,
        PHASE_STEP_SECONDS,
        1.0,
        -descent_rate,
        true,
        Target::Duration(descent_duration),
    )
    .await?;

    Ok(FlightProfile { ascent, float, descent })
}
