//! Midpoint (RK2) trajectory integrator: advances balloon state one step at
//! a time against a Wind Field and an Elevation Field, without dynamic
//! attribute interception — state is an ordered sequence of immutable
//! [`TrajectoryPoint`] records, and "current state" is just the last one.

use crate::elevation_field::ElevationField;
use crate::errors::{CoreError, Result};
use crate::wind_field::WindField;

/// One recorded instant of a trajectory: `(unix_ts, lat, lon, alt, u, v, 0, 0)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryPoint {
    pub time: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub u: f64,
    pub v: f64,
}

impl TrajectoryPoint {
    fn new(time: f64, lat: f64, lon: f64, alt: f64, u: f64, v: f64) -> Self {
        Self { time, lat, lon, alt, u, v }
    }
}

/// History of a single simulated flight, plus the coefficient and ascent
/// rate that produced it.
#[derive(Debug, Clone)]
pub struct Trajectory {
    points: Vec<TrajectoryPoint>,
}

impl Trajectory {
    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }

    pub fn first(&self) -> &TrajectoryPoint {
        self.points.first().expect("trajectory is never empty")
    }

    pub fn last(&self) -> &TrajectoryPoint {
        self.points.last().expect("trajectory is never empty")
    }
}

/// Either an altitude ceiling or a wall-clock duration; exactly one drives a
/// call to [`simulate`].
pub enum Target {
    Altitude(f64),
    Duration(f64),
}

struct Rates {
    dlat: f64,
    dlon: f64,
    dalt: f64,
    u: f64,
    v: f64,
}

fn rates(wind: &WindField, lat: f64, lon: f64, alt: f64, time: f64, coefficient: f64, ascent_rate: f64) -> Result<Rates> {
    let (u, v) = wind.get(lat, lon, alt, time)?;
    let (dlat, dlon) = wind.to_angular_rates(lat, u, v);
    Ok(Rates {
        dlat: dlat * coefficient,
        dlon: dlon * coefficient,
        dalt: ascent_rate,
        u,
        v,
    })
}

async fn ground_elevation(elevation: &ElevationField, lat: f64, lon: f64) -> f64 {
    elevation.get(lat, lon).await.unwrap_or(0.0)
}

/// Advance `current` by `h` seconds using a midpoint (RK2) step.
async fn step(
    wind: &WindField,
    elevation: &ElevationField,
    current: TrajectoryPoint,
    h: f64,
    coefficient: f64,
    ascent_rate: f64,
    elevation_aware: bool,
) -> Result<TrajectoryPoint> {
    let mut lat = current.lat;
    let lon = current.lon;
    let mut alt = current.alt;

    if elevation_aware {
        let ground = ground_elevation(elevation, lat, lon).await;
        if alt < ground {
            alt = ground;
        }
    }

    let k1 = rates(wind, lat, lon, alt, current.time, coefficient, ascent_rate)?;

    let mid_lat = lat + h * k1.dlat / 2.0;
    let mid_lon = lon + h * k1.dlon / 2.0;
    let mid_alt = alt + h * k1.dalt / 2.0;
    let mid_time = current.time + h / 2.0;
    let k2 = rates(wind, mid_lat, mid_lon, mid_alt, mid_time, coefficient, ascent_rate)?;

    lat += h * k2.dlat;
    let mut lon_next = lon + h * k2.dlon;
    alt += h * k2.dalt;
    let time_next = current.time + h;

    if lon_next >= 360.0 {
        lon_next -= 360.0;
    } else if lon_next < 0.0 {
        lon_next += 360.0;
    }

    Ok(TrajectoryPoint::new(time_next, lat, lon_next, alt, k2.u, k2.v))
}

/// Run a full simulation. `elevation_aware` enables ground-contact
/// termination and pre-step ground clamping; `target` is mutually exclusive
/// between a ceiling altitude and a wall-clock duration.
#[allow(clippy::too_many_arguments)]
pub async fn simulate(
    wind: &WindField,
    elevation: &ElevationField,
    launch: TrajectoryPoint,
    step_seconds: f64,
    coefficient: f64,
    ascent_rate: f64,
    elevation_aware: bool,
    target: Target,
) -> Result<Trajectory> {
    let duration = match target {
        Target::Duration(d) => d,
        Target::Altitude(target_alt) => {
            if ascent_rate == 0.0 {
                return Err(CoreError::other("cannot derive duration with zero ascent rate"));
            }
            (target_alt - launch.alt) / ascent_rate / 3600.0
        }
    };
    let total_seconds = duration * 3600.0;

    let mut points = vec![launch];
    let mut elapsed = 0.0_f64;

    while elapsed < total_seconds {
        let current = *points.last().unwrap();
        if !(-90.0..=90.0).contains(&current.lat) {
            break;
        }

        let mut h = step_seconds.min(total_seconds - elapsed);

        if elevation_aware && ascent_rate < 0.0 {
            let ground = ground_elevation(elevation, current.lat, current.lon).await;
            let projected_alt = current.alt + ascent_rate * h;
            if projected_alt < ground && ascent_rate != 0.0 {
                let intercept = ((current.alt - ground) / -ascent_rate).max(0.1);
                h = intercept.min(h);
            }
        }

        let next = step(wind, elevation, current, h, coefficient, ascent_rate, elevation_aware).await?;
        let hit_ground = elevation_aware && ascent_rate < 0.0 && {
            let ground = ground_elevation(elevation, next.lat, next.lon).await;
            next.alt <= ground
        };

        points.push(next);
        elapsed += h;

        if hit_ground {
            break;
        }
        if !(-90.0..=90.0).contains(&next.lat) {
            break;
        }
    }

    Ok(Trajectory { points })
}

pub fn launch_point(time: f64, lat: f64, lon: f64, alt: f64) -> TrajectoryPoint {
    TrajectoryPoint::new(time, lat, lon, alt, 0.0, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trajectory_exposes_first_and_last() {
        let t = Trajectory {
            points: vec![
                TrajectoryPoint::new(0.0, 37.0, 238.0, 0.0, 0.0, 0.0),
                TrajectoryPoint::new(120.0, 37.01, 238.01, 100.0, 1.0, 1.0),
            ],
        };
        assert_eq!(t.first().time, 0.0);
        assert_eq!(t.last().alt, 100.0);
    }
}
