//! Per-event hypocenter refinement against the current velocity model.

use faer::{Col, Mat};
use log::{debug, warn};

use crate::{
    datatypes::Hypocenter,
    grid::Grid3d,
    lstsq::gauss_newton_step,
    raytrace::{RaySource, Raytracer, departure},
    solver::InvParams,
};

/// Picks of one phase of one event, bundled with the slowness model the
/// phase travels through.
pub(crate) struct PhasePicks<'a> {
    pub slowness: &'a [f64],
    pub times: Vec<f64>,
    pub stations: Vec<[f64; 3]>,
}

enum StepKind {
    /// Refine `(x, y)` only, origin time and depth fixed.
    Horizontal,
    /// Refine all of `(t0, x, y, z)`.
    Full,
}

enum StepOutcome {
    Converged,
    MaxIterations,
    Abandoned,
}

/// Refine one event by damped Gauss-Newton with raytraced sensitivities.
///
/// The hypocenter row is updated in place. Failures are non-fatal: the event
/// is left where it was when the step went wrong, with a logged diagnostic.
pub(crate) fn relocate_event<R: Raytracer>(
    grid: &Grid3d,
    tracer: &R,
    par: &InvParams,
    groups: &[PhasePicks<'_>],
    hyp: &mut Hypocenter,
) {
    if par.hypo_2step {
        debug!("event {}: refining x and y", hyp.event);
        if let StepOutcome::Abandoned = step(grid, tracer, par, groups, hyp, StepKind::Horizontal)
        {
            return;
        }
    }
    debug!("event {}: refining all hypocenter parameters", hyp.event);
    let _ = step(grid, tracer, par, groups, hyp, StepKind::Full);
}

fn step<R: Raytracer>(
    grid: &Grid3d,
    tracer: &R,
    par: &InvParams,
    groups: &[PhasePicks<'_>],
    hyp: &mut Hypocenter,
    kind: StepKind,
) -> StepOutcome {
    let nst: usize = groups.iter().map(|g| g.times.len()).sum();
    let ncols = match kind {
        StepKind::Horizontal => 2,
        StepKind::Full => 4,
    };

    for it in 0..par.maxit_hypo {
        let mut h = Mat::zeros(nst, ncols);
        let mut r = Col::zeros(nst);
        let mut row = 0;
        for group in groups {
            let sources = vec![
                RaySource {
                    t0: hyp.t0,
                    pos: hyp.position(),
                };
                group.times.len()
            ];
            let traced = tracer.trace_rays(grid, group.slowness, &sources, &group.stations);
            let (tcalc, paths, v0) = match traced {
                Ok(t) => t,
                Err(e) => {
                    warn!("event {}: raytracing failed ({e}), skipping", hyp.event);
                    return StepOutcome::Abandoned;
                }
            };
            for ns in 0..group.times.len() {
                let Some((d, ds)) = departure(&paths[ns], hyp.position()) else {
                    warn!("event {}: degenerate raypath, skipping", hyp.event);
                    return StepOutcome::Abandoned;
                };
                let scale = -1.0 / (v0[ns] * ds);
                match kind {
                    StepKind::Horizontal => {
                        h[(row, 0)] = scale * d.x;
                        h[(row, 1)] = scale * d.y;
                    }
                    StepKind::Full => {
                        h[(row, 0)] = 1.0;
                        h[(row, 1)] = scale * d.x;
                        h[(row, 2)] = scale * d.y;
                        h[(row, 3)] = scale * d.z;
                    }
                }
                r[row] = group.times[ns] - tcalc[ns];
                row += 1;
            }
        }

        let Some(mut dh) = gauss_newton_step(&h, &r) else {
            warn!("event {}: could not be relocated, skipping", hyp.event);
            return StepOutcome::Abandoned;
        };

        if par.clamp_reloc {
            match kind {
                StepKind::Horizontal => {
                    for i in 0..2 {
                        if dh[i].abs() > par.caps.dx {
                            dh[i] = par.caps.dx * dh[i].signum();
                        }
                    }
                }
                StepKind::Full => {
                    if dh[0].abs() > par.caps.dt {
                        dh[0] = par.caps.dt * dh[0].signum();
                    }
                    for i in 1..4 {
                        if dh[i].abs() > par.caps.dx {
                            dh[i] = par.caps.dx * dh[i].signum();
                        }
                    }
                }
            }
        }

        let trial = match kind {
            StepKind::Horizontal => [hyp.x + dh[0], hyp.y + dh[1], hyp.z],
            StepKind::Full => [hyp.x + dh[1], hyp.y + dh[2], hyp.z + dh[3]],
        };
        if grid.is_outside(trial) {
            warn!(
                "event {}: could not be relocated inside the grid, skipping",
                hyp.event
            );
            return StepOutcome::Abandoned;
        }

        let converged = match kind {
            StepKind::Horizontal => {
                hyp.x += dh[0];
                hyp.y += dh[1];
                dh[0].abs() < par.conv_hypo && dh[1].abs() < par.conv_hypo
            }
            StepKind::Full => {
                hyp.t0 += dh[0];
                hyp.x += dh[1];
                hyp.y += dh[2];
                hyp.z += dh[3];
                dh[1].abs() < par.conv_hypo
                    && dh[2].abs() < par.conv_hypo
                    && dh[3].abs() < par.conv_hypo
            }
        };
        if converged {
            debug!("event {}: converged at iteration {}", hyp.event, it + 1);
            return StepOutcome::Converged;
        }
    }
    debug!("event {}: reached max number of iterations", hyp.event);
    StepOutcome::MaxIterations
}
