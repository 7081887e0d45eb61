//! The joint hypocenter-velocity inverter.
//!
//! Each outer iteration raytraces every event and calibration shot, projects
//! the hypocenter unknowns out of the event rows through a complete-mode QR
//! of the per-event hypocenter Jacobian, stacks the projected rows with
//! calibration rows, regularizes with smoothing, bound penalties, tie points
//! and a zero-sum constraint on the P static corrections, solves the normal
//! equations with LSQR, applies a clamped model update and finally relocates
//! every event against the updated model.

use std::collections::BTreeMap;

use faer::{
    Mat,
    sparse::{SparseColMat, SparseRowMat, Triplet},
};
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::{
    Error,
    datatypes::{
        Arrival, CalibrationShot, Hypocenter, InitialVelocity, Phase, PhasedArrival,
        VelocityPoint,
    },
    grid::Grid3d,
    raytrace::{RayField, RaySource, Raytracer, departure},
    solver::relocate::{PhasePicks, relocate_event},
};

pub(crate) mod lsqr;
pub(crate) mod relocate;

pub use lsqr::{LsqrResult, LsqrStop, lsqr as solve_lsqr};

/// Collocation tolerance for matching S tie points to P tie points.
const TIE_COLLOCATION_TOL: f64 = 1e-5;

/// Minimum number of observations an event needs to survive the null-space
/// projection (which removes four degrees of freedom).
const MIN_OBS_FOR_PROJECTION: usize = 5;

/// Velocity bounds and the slopes of the penalty applied outside them.
#[derive(Clone, Copy, Debug)]
pub struct VelocityBounds {
    /// Lower admissible P velocity.
    pub vp_min: f64,
    /// Upper admissible P velocity.
    pub vp_max: f64,
    /// Slope of the P penalty outside the bounds.
    pub slope_p: f64,
    /// Lower admissible S velocity (two-phase only).
    pub vs_min: f64,
    /// Upper admissible S velocity (two-phase only).
    pub vs_max: f64,
    /// Slope of the S penalty outside the bounds.
    pub slope_s: f64,
}

impl Default for VelocityBounds {
    fn default() -> Self {
        Self {
            vp_min: 0.0,
            vp_max: f64::INFINITY,
            slope_p: 1.0,
            vs_min: 0.0,
            vs_max: f64::INFINITY,
            slope_s: 1.0,
        }
    }
}

/// Per-iteration caps on model and hypocenter updates.
#[derive(Clone, Copy, Debug)]
pub struct StepCaps {
    /// Largest admissible P velocity change per node and iteration.
    pub dv_p: f64,
    /// Largest admissible hypocenter move per coordinate and iteration.
    pub dx: f64,
    /// Largest admissible origin-time change per iteration.
    pub dt: f64,
    /// Largest admissible S velocity change per node and iteration.
    pub dv_s: f64,
}

impl Default for StepCaps {
    fn default() -> Self {
        Self {
            dv_p: f64::INFINITY,
            dx: f64::INFINITY,
            dt: f64::INFINITY,
            dv_s: f64::INFINITY,
        }
    }
}

/// Regularization weights, before renormalization against problem scale.
#[derive(Clone, Copy, Debug)]
pub struct Weights {
    /// Weight of the smoothing constraint.
    pub smoothing: f64,
    /// Weight of the velocity bound penalty.
    pub penalty: f64,
    /// Weight of the velocity tie-point constraint.
    pub tie_points: f64,
    /// Weight of vertical smoothing relative to horizontal smoothing.
    pub vertical_ratio: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            smoothing: 1.0,
            penalty: 1.0,
            tie_points: 1.0,
            vertical_ratio: 1.0,
        }
    }
}

/// Configuration of the joint inversion.
#[derive(Clone, Copy, Debug)]
pub struct InvParams {
    /// Number of outer iterations.
    pub maxit: usize,
    /// Iteration cap of the per-event relocation.
    pub maxit_hypo: usize,
    /// Position convergence threshold of the relocation, in distance units.
    pub conv_hypo: f64,
    /// Velocity bound penalties.
    pub bounds: VelocityBounds,
    /// Update caps.
    pub caps: StepCaps,
    /// Regularization weights.
    pub weights: Weights,
    /// Solve for velocity. When false only relocation runs.
    pub invert_vel: bool,
    /// Solve for the Vs/Vp ratio instead of Vs (two-phase only).
    pub invert_vs_vp: bool,
    /// Refine `(x, y)` with fixed depth and origin time before the full
    /// relocation step.
    pub hypo_2step: bool,
    /// Solve for per-receiver static corrections.
    pub use_sc: bool,
    /// Clamp relocation steps by [`StepCaps::dx`] and [`StepCaps::dt`].
    pub clamp_reloc: bool,
    /// Emit progress messages through the `log` facade.
    pub verbose: bool,
}

impl Default for InvParams {
    fn default() -> Self {
        Self {
            maxit: 5,
            maxit_hypo: 10,
            conv_hypo: 1e-3,
            bounds: VelocityBounds::default(),
            caps: StepCaps::default(),
            weights: Weights::default(),
            invert_vel: true,
            invert_vs_vp: true,
            hypo_2step: false,
            use_sc: true,
            clamp_reloc: true,
            verbose: false,
        }
    }
}

/// Result of a single-phase joint inversion.
#[derive(Debug)]
pub struct Inversion {
    /// Refined hypocenter table, in the order of the initial table.
    pub hypocenters: Vec<Hypocenter>,
    /// P velocity per grid node.
    pub velocity: Vec<f64>,
    /// P static correction per receiver (empty if disabled).
    pub statics: Vec<f64>,
    /// Data residual norm per outer iteration, plus a final entry.
    pub res_v: Vec<f64>,
    /// LSQR iteration count per outer iteration.
    pub res_lsqr: Vec<f64>,
}

/// Result of a two-phase joint inversion.
#[derive(Debug)]
pub struct InversionPs {
    /// Refined hypocenter table, in the order of the initial table.
    pub hypocenters: Vec<Hypocenter>,
    /// P velocity per grid node.
    pub vp: Vec<f64>,
    /// S velocity per grid node.
    pub vs: Vec<f64>,
    /// P static correction per receiver (empty if disabled).
    pub sc_p: Vec<f64>,
    /// S static correction per receiver (empty if disabled).
    pub sc_s: Vec<f64>,
    /// Data residual norm per outer iteration, plus a final entry.
    pub res_v: Vec<f64>,
    /// LSQR iteration count per outer iteration.
    pub res_lsqr: Vec<f64>,
}

/// One observation row of the (reordered) data table.
#[derive(Clone, Copy)]
struct ObsRow {
    time: f64,
    receiver: usize,
    station: [f64; 3],
    phase: Phase,
}

/// All rows of one event, as indices into the reordered row table.
struct EventGroup {
    event: u32,
    hyp_index: usize,
    /// P rows, contiguous within the P block, caller order preserved.
    rows_p: Vec<usize>,
    /// S rows, contiguous within the S block, caller order preserved.
    rows_s: Vec<usize>,
}

impl EventGroup {
    fn n_obs(&self) -> usize {
        self.rows_p.len() + self.rows_s.len()
    }
}

/// Calibration rows, flattened and validated.
struct CalPlan {
    sources: Vec<RaySource>,
    stations: Vec<[f64; 3]>,
    times: Vec<f64>,
    receivers: Vec<usize>,
}

impl CalPlan {
    fn build(caldata: &[CalibrationShot], receivers: &[[f64; 3]]) -> Result<Self, Error> {
        let mut plan = Self {
            sources: Vec::with_capacity(caldata.len()),
            stations: Vec::with_capacity(caldata.len()),
            times: Vec::with_capacity(caldata.len()),
            receivers: Vec::with_capacity(caldata.len()),
        };
        for (i, shot) in caldata.iter().enumerate() {
            if shot.receiver >= receivers.len() {
                return Err(Error::ShapeMismatch {
                    what: "calibration receiver index",
                    expected: receivers.len(),
                    actual: shot.receiver,
                });
            }
            if i > 0 {
                let prev = &caldata[i - 1];
                if shot.shot < prev.shot {
                    return Err(Error::ShapeMismatch {
                        what: "calibration data sorted by shot id",
                        expected: i - 1,
                        actual: i,
                    });
                }
                if shot.shot == prev.shot && shot.receiver <= prev.receiver {
                    return Err(Error::ShapeMismatch {
                        what: "calibration data sorted by receiver within a shot",
                        expected: i - 1,
                        actual: i,
                    });
                }
            }
            plan.sources.push(RaySource {
                t0: 0.0,
                pos: [shot.x, shot.y, shot.z],
            });
            plan.stations.push(receivers[shot.receiver]);
            plan.times.push(shot.time);
            plan.receivers.push(shot.receiver);
        }
        Ok(plan)
    }

    fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Tie-point system: interpolation rows over the full unknown vector and
/// their target values.
struct TiePlan {
    d: SparseColMat<usize, f64>,
    dtd: SparseColMat<usize, f64>,
    targets: Vec<f64>,
    n_d: f64,
}

/// Joint hypocenter-velocity inversion with single-phase data.
///
/// `arrivals` are P picks, `receivers` the receiver table, `v_init` the
/// initial velocity model, `hinit` the seeded hypocenter table (one row per
/// event, all with distinct coordinates). `caldata` and `tie_points` may be
/// empty. Returns the refined hypocenters, the velocity model, the static
/// corrections and the residual traces.
#[allow(clippy::too_many_arguments)]
pub fn joint_hypo_vel<R: Raytracer + Sync>(
    par: &InvParams,
    grid: &Grid3d,
    tracer: &R,
    arrivals: &[Arrival],
    receivers: &[[f64; 3]],
    v_init: impl Into<InitialVelocity>,
    hinit: &[Hypocenter],
    caldata: &[CalibrationShot],
    tie_points: &[VelocityPoint],
) -> Result<Inversion, Error> {
    for tie in tie_points {
        if tie.phase == Phase::S {
            return Err(Error::ShapeMismatch {
                what: "single-phase tie points must be P",
                expected: 0,
                actual: 1,
            });
        }
    }
    let phased: Vec<PhasedArrival> = arrivals
        .iter()
        .map(|a| PhasedArrival {
            event: a.event,
            time: a.time,
            receiver: a.receiver,
            phase: Phase::P,
        })
        .collect();
    let state = run_joint(
        par,
        grid,
        tracer,
        &phased,
        receivers,
        &[v_init.into()],
        hinit,
        caldata,
        tie_points,
        false,
    )?;
    Ok(Inversion {
        hypocenters: state.hypocenters,
        velocity: state.vp,
        statics: state.sc_p,
        res_v: state.res_v,
        res_lsqr: state.res_lsqr,
    })
}

/// Joint hypocenter-velocity inversion with P and S data.
///
/// Observations are reordered so P rows precede S rows; within a phase the
/// caller's order is preserved. In Vs/Vp mode (`par.invert_vs_vp`) the second
/// model block is the ratio, and every S tie point must be collocated with a
/// P tie point. Calibration shots are used through the P model only.
#[allow(clippy::too_many_arguments)]
pub fn joint_hypo_vel_ps<R: Raytracer + Sync>(
    par: &InvParams,
    grid: &Grid3d,
    tracer: &R,
    arrivals: &[PhasedArrival],
    receivers: &[[f64; 3]],
    v_init: (InitialVelocity, InitialVelocity),
    hinit: &[Hypocenter],
    caldata: &[CalibrationShot],
    tie_points: &[VelocityPoint],
) -> Result<InversionPs, Error> {
    let state = run_joint(
        par,
        grid,
        tracer,
        arrivals,
        receivers,
        &[v_init.0, v_init.1],
        hinit,
        caldata,
        tie_points,
        true,
    )?;
    Ok(InversionPs {
        hypocenters: state.hypocenters,
        vp: state.vp,
        vs: state.vs,
        sc_p: state.sc_p,
        sc_s: state.sc_s,
        res_v: state.res_v,
        res_lsqr: state.res_lsqr,
    })
}

/// Mutable model state threaded through the outer iterations.
struct JointState {
    hypocenters: Vec<Hypocenter>,
    vp: Vec<f64>,
    vs: Vec<f64>,
    /// Second model block: `vs`, or the Vs/Vp ratio in ratio mode.
    second: Vec<f64>,
    s_p: Vec<f64>,
    s_s: Vec<f64>,
    sc_p: Vec<f64>,
    sc_s: Vec<f64>,
    res_v: Vec<f64>,
    res_lsqr: Vec<f64>,
}

/// Phase-independent core of the joint inversion.
#[allow(clippy::too_many_arguments)]
fn run_joint<R: Raytracer + Sync>(
    par: &InvParams,
    grid: &Grid3d,
    tracer: &R,
    arrivals: &[PhasedArrival],
    receivers: &[[f64; 3]],
    v_init: &[InitialVelocity],
    hinit: &[Hypocenter],
    caldata: &[CalibrationShot],
    tie_points: &[VelocityPoint],
    two_phase: bool,
) -> Result<JointState, Error> {
    let nnodes = grid.n_nodes();
    let nsta = if par.use_sc { receivers.len() } else { 0 };
    let ratio_mode = two_phase && par.invert_vs_vp;

    // Reorder rows: P block first, S block second, events sorted by id
    // within each block, caller order within an event.
    let (rows, groups) = prepare_rows(arrivals, receivers, hinit)?;
    check_distinct_coordinates(hinit)?;
    let cal = CalPlan::build(caldata, receivers)?;

    let n_blocks = if two_phase { 2 } else { 1 };
    let ncols = n_blocks * nnodes + n_blocks * nsta;
    let sc_p_base = n_blocks * nnodes;
    let sc_s_base = sc_p_base + nsta;

    let mut state = JointState {
        hypocenters: hinit.to_vec(),
        vp: v_init[0].expand(nnodes)?,
        vs: if two_phase {
            v_init[1].expand(nnodes)?
        } else {
            Vec::new()
        },
        second: Vec::new(),
        s_p: Vec::new(),
        s_s: Vec::new(),
        sc_p: vec![0.0; nsta],
        sc_s: vec![0.0; if two_phase { nsta } else { 0 }],
        res_v: Vec::new(),
        res_lsqr: Vec::new(),
    };
    state.s_p = state.vp.iter().map(|v| 1.0 / v).collect();
    if two_phase {
        state.s_s = state.vs.iter().map(|v| 1.0 / v).collect();
        state.second = if ratio_mode {
            state
                .vs
                .iter()
                .zip(state.vp.iter())
                .map(|(vs, vp)| vs / vp)
                .collect()
        } else {
            state.vs.clone()
        };
    }

    // Regularization operators are geometry-only, so they are built once.
    let smoothing = if par.invert_vel {
        let (kx, ky, kz) = grid.smoothing_matrices()?;
        let ktkx = gram(&kx)?;
        let ktky = gram(&ky)?;
        let ktkz = gram(&kz)?;
        // The smoothing operator acts block-diagonally over both velocity
        // blocks in two-phase mode, which scales its Frobenius norm.
        let n_k = frob(&ktkx) * if two_phase { 2.0f64.sqrt() } else { 1.0 };
        Some((ktkx, ktky, ktkz, n_k))
    } else {
        None
    };
    let ties = if par.invert_vel && !tie_points.is_empty() {
        Some(build_ties(
            grid, tie_points, nnodes, ncols, two_phase, ratio_mode,
        )?)
    } else {
        None
    };

    if par.verbose {
        info!(
            "joint hypocenter-velocity inversion: {} events, {} calibration rows, {} tie points",
            groups.len(),
            caldata.len(),
            tie_points.len()
        );
    }

    for it in 0..par.maxit {
        if par.invert_vel {
            if par.verbose {
                info!("iteration {}: updating velocity model", it + 1);
            }
            let (ktkx, ktky, ktkz, n_k) = smoothing.as_ref().unwrap();
            velocity_update(
                par, grid, tracer, &rows, &groups, &cal, ties.as_ref(), ktkx, ktky, ktkz, *n_k,
                nnodes, nsta, ncols, sc_p_base, sc_s_base, two_phase, ratio_mode, &mut state,
            )?;
        }

        if !groups.is_empty() {
            if par.verbose {
                info!("iteration {}: relocating events", it + 1);
            }
            relocation_pass(par, grid, tracer, &rows, &groups, &mut state, two_phase);
        }
    }

    if par.invert_vel {
        // One last residual evaluation against the final model.
        let r = all_residuals(grid, tracer, &rows, &groups, &cal, &state, two_phase, false)?
            .1;
        state.res_v.push(r);
    }

    if par.verbose {
        info!("inversion complete");
    }
    Ok(state)
}

/// Validate inputs and reorder observation rows: P before S, events in
/// sorted-id order within each phase block, caller order within an event.
fn prepare_rows(
    arrivals: &[PhasedArrival],
    receivers: &[[f64; 3]],
    hinit: &[Hypocenter],
) -> Result<(Vec<ObsRow>, Vec<EventGroup>), Error> {
    for a in arrivals {
        if a.receiver >= receivers.len() {
            return Err(Error::ShapeMismatch {
                what: "receiver index",
                expected: receivers.len(),
                actual: a.receiver,
            });
        }
    }
    let hyp_index: BTreeMap<u32, usize> =
        hinit.iter().enumerate().map(|(i, h)| (h.event, i)).collect();

    let mut by_event: BTreeMap<u32, (Vec<usize>, Vec<usize>)> = BTreeMap::new();
    for (i, a) in arrivals.iter().enumerate() {
        let entry = by_event.entry(a.event).or_default();
        match a.phase {
            Phase::P => entry.0.push(i),
            Phase::S => entry.1.push(i),
        }
    }

    let mut rows = Vec::with_capacity(arrivals.len());
    let mut groups = Vec::with_capacity(by_event.len());
    for (&event, (p_ids, _)) in &by_event {
        let Some(&hyp_i) = hyp_index.get(&event) else {
            return Err(Error::ShapeMismatch {
                what: "initial hypocenter table",
                expected: by_event.len(),
                actual: hinit.len(),
            });
        };
        let rows_p = p_ids
            .iter()
            .map(|&i| {
                rows.push(ObsRow {
                    time: arrivals[i].time,
                    receiver: arrivals[i].receiver,
                    station: receivers[arrivals[i].receiver],
                    phase: Phase::P,
                });
                rows.len() - 1
            })
            .collect();
        groups.push(EventGroup {
            event,
            hyp_index: hyp_i,
            rows_p,
            rows_s: Vec::new(),
        });
    }
    // S rows go after every P row, in the same sorted-event order.
    for (group, (_, s_ids)) in groups.iter_mut().zip(by_event.values()) {
        group.rows_s = s_ids
            .iter()
            .map(|&i| {
                rows.push(ObsRow {
                    time: arrivals[i].time,
                    receiver: arrivals[i].receiver,
                    station: receivers[arrivals[i].receiver],
                    phase: Phase::S,
                });
                rows.len() - 1
            })
            .collect();
    }
    Ok((rows, groups))
}

/// The null-space projection groups observations by source coordinates, so
/// two events starting at the same point would collapse into one block.
fn check_distinct_coordinates(hinit: &[Hypocenter]) -> Result<(), Error> {
    for (i, a) in hinit.iter().enumerate() {
        for b in &hinit[i + 1..] {
            #[allow(clippy::float_cmp)]
            if a.x == b.x && a.y == b.y && a.z == b.z {
                return Err(Error::ShapeMismatch {
                    what: "distinct initial hypocenter coordinates",
                    expected: hinit.len(),
                    actual: i,
                });
            }
        }
    }
    Ok(())
}

/// Build the tie-point interpolation rows over the full unknown vector.
///
/// P rows come first. In ratio mode S rows constrain the ratio block and
/// their targets become `vs / vp` of the collocated pair.
fn build_ties(
    grid: &Grid3d,
    tie_points: &[VelocityPoint],
    nnodes: usize,
    ncols: usize,
    two_phase: bool,
    ratio_mode: bool,
) -> Result<TiePlan, Error> {
    let p_ties: Vec<&VelocityPoint> = tie_points.iter().filter(|t| t.phase == Phase::P).collect();
    let s_ties: Vec<&VelocityPoint> = tie_points.iter().filter(|t| t.phase == Phase::S).collect();

    let mut triplets = Vec::with_capacity(8 * tie_points.len());
    let mut targets = Vec::with_capacity(tie_points.len());
    let mut row = 0;
    for tie in &p_ties {
        grid.check_inside(&[tie.position()])?;
        let (nodes, weights) = grid.cell_weights(tie.position());
        for c in 0..8 {
            triplets.push(Triplet {
                row,
                col: nodes[c],
                val: weights[c],
            });
        }
        targets.push(tie.v);
        row += 1;
    }
    for tie in &s_ties {
        grid.check_inside(&[tie.position()])?;
        let (nodes, weights) = grid.cell_weights(tie.position());
        let (col_base, target) = if ratio_mode {
            let collocated = p_ties.iter().find(|p| {
                let dx = p.x - tie.x;
                let dy = p.y - tie.y;
                let dz = p.z - tie.z;
                (dx * dx + dy * dy + dz * dz).sqrt() < TIE_COLLOCATION_TOL
            });
            let Some(p_tie) = collocated else {
                return Err(Error::InvalidTiePoint {
                    x: tie.x,
                    y: tie.y,
                    z: tie.z,
                });
            };
            (nnodes, tie.v / p_tie.v)
        } else {
            debug_assert!(two_phase, "S tie points are rejected upstream for single phase");
            (nnodes, tie.v)
        };
        for c in 0..8 {
            triplets.push(Triplet {
                row,
                col: col_base + nodes[c],
                val: weights[c],
            });
        }
        targets.push(target);
        row += 1;
    }

    let d = SparseColMat::try_new_from_triplets(row, ncols, &triplets)?;
    let dtd = gram(&d)?;
    let n_d = frob(&dtd);
    Ok(TiePlan { d, dtd, targets, n_d })
}

/// Raytrace the current model over all events and calibration shots.
///
/// Returns per-row event residuals and the norm of the stacked event and
/// calibration residuals. With `full` set, also returns the ray fields
/// needed for assembly.
#[allow(clippy::type_complexity)]
fn all_residuals<R: Raytracer + Sync>(
    grid: &Grid3d,
    tracer: &R,
    rows: &[ObsRow],
    groups: &[EventGroup],
    cal: &CalPlan,
    state: &JointState,
    two_phase: bool,
    full: bool,
) -> Result<(ResidualData, f64), Error> {
    let mut sources = vec![
        RaySource {
            t0: 0.0,
            pos: [0.0; 3]
        };
        rows.len()
    ];
    let mut stations = vec![[0.0; 3]; rows.len()];
    for group in groups {
        let hyp = &state.hypocenters[group.hyp_index];
        for &r in group.rows_p.iter().chain(group.rows_s.iter()) {
            sources[r] = RaySource {
                t0: hyp.t0,
                pos: hyp.position(),
            };
        }
    }
    for (i, row) in rows.iter().enumerate() {
        stations[i] = row.station;
    }

    let n_p_rows = rows.iter().filter(|r| r.phase == Phase::P).count();
    let (p_field, s_field) = if rows.is_empty() {
        (None, None)
    } else if full {
        let p = tracer.trace(
            grid,
            &state.s_p,
            &sources[..n_p_rows],
            &stations[..n_p_rows],
        )?;
        let s = if two_phase && n_p_rows < rows.len() {
            Some(tracer.trace(
                grid,
                &state.s_s,
                &sources[n_p_rows..],
                &stations[n_p_rows..],
            )?)
        } else {
            None
        };
        (Some(p), s)
    } else {
        let p_times = tracer.travel_times(
            grid,
            &state.s_p,
            &sources[..n_p_rows],
            &stations[..n_p_rows],
        )?;
        let s_times = if two_phase && n_p_rows < rows.len() {
            tracer.travel_times(
                grid,
                &state.s_s,
                &sources[n_p_rows..],
                &stations[n_p_rows..],
            )?
        } else {
            Vec::new()
        };
        (
            Some(RayField {
                times: p_times,
                paths: Vec::new(),
                v0: Vec::new(),
                kernels: Vec::new(),
            }),
            if two_phase && n_p_rows < rows.len() {
                Some(RayField {
                    times: s_times,
                    paths: Vec::new(),
                    v0: Vec::new(),
                    kernels: Vec::new(),
                })
            } else {
                None
            },
        )
    };

    let mut r_event = vec![0.0; rows.len()];
    for (i, row) in rows.iter().enumerate() {
        let tcalc = if i < n_p_rows {
            p_field.as_ref().map(|f| f.times[i])
        } else {
            s_field.as_ref().map(|f| f.times[i - n_p_rows])
        };
        if let Some(tcalc) = tcalc {
            r_event[i] = row.time - tcalc;
        }
    }

    let (r_cal, cal_field) = if cal.is_empty() {
        (Vec::new(), None)
    } else if full {
        let field = tracer.trace(grid, &state.s_p, &cal.sources, &cal.stations)?;
        let r: Vec<f64> = cal
            .times
            .iter()
            .zip(field.times.iter())
            .map(|(obs, calc)| obs - calc)
            .collect();
        (r, Some(field))
    } else {
        let times = tracer.travel_times(grid, &state.s_p, &cal.sources, &cal.stations)?;
        let r = cal
            .times
            .iter()
            .zip(times.iter())
            .map(|(obs, calc)| obs - calc)
            .collect();
        (r, None)
    };

    let norm = r_event
        .iter()
        .chain(r_cal.iter())
        .map(|r| r * r)
        .sum::<f64>()
        .sqrt();

    Ok((
        ResidualData {
            r_event,
            r_cal,
            p_field,
            s_field,
            cal_field,
            n_p_rows,
        },
        norm,
    ))
}

/// Raytracing products of one outer iteration.
struct ResidualData {
    r_event: Vec<f64>,
    r_cal: Vec<f64>,
    p_field: Option<RayField>,
    s_field: Option<RayField>,
    cal_field: Option<RayField>,
    n_p_rows: usize,
}

/// One velocity-model update: steps 1 through 11 of the outer iteration.
#[allow(clippy::too_many_arguments)]
fn velocity_update<R: Raytracer + Sync>(
    par: &InvParams,
    grid: &Grid3d,
    tracer: &R,
    rows: &[ObsRow],
    groups: &[EventGroup],
    cal: &CalPlan,
    ties: Option<&TiePlan>,
    ktkx: &SparseColMat<usize, f64>,
    ktky: &SparseColMat<usize, f64>,
    ktkz: &SparseColMat<usize, f64>,
    n_k: f64,
    nnodes: usize,
    nsta: usize,
    ncols: usize,
    sc_p_base: usize,
    sc_s_base: usize,
    two_phase: bool,
    ratio_mode: bool,
    state: &mut JointState,
) -> Result<(), Error> {
    // Bound penalties.
    let n_pen = if two_phase { 2 * nnodes } else { nnodes };
    let mut pen = vec![0.0; n_pen];
    let mut dpen = vec![0.0; n_pen];
    penalty(
        &state.vp,
        par.bounds.vp_min,
        par.bounds.vp_max,
        par.bounds.slope_p,
        &mut pen[..nnodes],
        &mut dpen[..nnodes],
    );
    if two_phase {
        // The S penalty tracks the S velocity itself, also in ratio mode.
        penalty(
            &state.vs,
            par.bounds.vs_min,
            par.bounds.vs_max,
            par.bounds.slope_s,
            &mut pen[nnodes..],
            &mut dpen[nnodes..],
        );
    }
    if par.verbose {
        let active = pen.iter().filter(|p| **p != 0.0).count();
        if active > 0 {
            info!("penalties applied at {active} nodes");
        }
    }

    if par.verbose {
        info!("raytracing {} observation rows", rows.len());
    }
    let (data, res_norm) =
        all_residuals(grid, tracer, rows, groups, cal, state, two_phase, true)?;
    state.res_v.push(res_norm);

    // Map sensitivity groups back to events through their first row.
    let mut p_kernel_of = vec![None; groups.len()];
    let mut s_kernel_of = vec![None; groups.len()];
    let row_group: BTreeMap<usize, usize> = groups
        .iter()
        .enumerate()
        .flat_map(|(g, group)| {
            group
                .rows_p
                .iter()
                .chain(group.rows_s.iter())
                .map(move |&r| (r, g))
        })
        .collect();
    if let Some(field) = &data.p_field {
        for (k, kernel) in field.kernels.iter().enumerate() {
            let g = row_group[&kernel.rows[0]];
            if kernel.rows.iter().any(|r| row_group[r] != g) {
                return Err(Error::ShapeMismatch {
                    what: "distinct event source coordinates",
                    expected: groups.len(),
                    actual: field.kernels.len(),
                });
            }
            p_kernel_of[g] = Some(k);
        }
    }
    if let Some(field) = &data.s_field {
        for (k, kernel) in field.kernels.iter().enumerate() {
            let g = row_group[&(kernel.rows[0] + data.n_p_rows)];
            s_kernel_of[g] = Some(k);
        }
    }

    // Projected event rows and calibration rows, assembled as triplets.
    let mut m_trips: Vec<Triplet<usize, usize, f64>> = Vec::new();
    let mut rhs_rows: Vec<f64> = Vec::new();
    for (g, group) in groups.iter().enumerate() {
        let nst = group.n_obs();
        if nst < MIN_OBS_FOR_PROJECTION {
            warn!(
                "event {}: only {nst} observations, excluded from the velocity update",
                group.event
            );
            continue;
        }
        let hyp = &state.hypocenters[group.hyp_index];
        let mut h = Mat::zeros(nst, 4);
        let mut local_cols: Vec<Vec<(usize, f64)>> = vec![Vec::new(); nst];
        let mut local_resid = vec![0.0; nst];
        let mut degenerate = false;

        // P rows first, then S rows, mirroring the row ordering.
        for (local, &r) in group.rows_p.iter().enumerate() {
            let field = data.p_field.as_ref().unwrap();
            if !fill_hypo_row(&mut h, local, &field.paths[r], field.v0[r], hyp) {
                degenerate = true;
                break;
            }
            local_resid[local] = data.r_event[r];
        }
        if !degenerate {
            for (off, &r) in group.rows_s.iter().enumerate() {
                let local = group.rows_p.len() + off;
                let field = data.s_field.as_ref().unwrap();
                let sr = r - data.n_p_rows;
                if !fill_hypo_row(&mut h, local, &field.paths[sr], field.v0[sr], hyp) {
                    degenerate = true;
                    break;
                }
                local_resid[local] = data.r_event[r];
            }
        }
        if degenerate {
            warn!(
                "event {}: degenerate raypath, excluded from the velocity update",
                group.event
            );
            continue;
        }

        // Model-derivative entries of each local row.
        if let Some(k) = p_kernel_of[g] {
            let field = data.p_field.as_ref().unwrap();
            let kernel = &field.kernels[k];
            for (local_k, &r) in kernel.rows.iter().enumerate() {
                let local = group.rows_p.iter().position(|&rr| rr == r).unwrap();
                emit_kernel_row(
                    &kernel.block,
                    local_k,
                    Phase::P,
                    ratio_mode,
                    nnodes,
                    state,
                    &mut local_cols[local],
                );
                if nsta > 0 {
                    local_cols[local].push((sc_p_base + rows[r].receiver, 1.0));
                }
            }
        }
        if let Some(k) = s_kernel_of[g] {
            let field = data.s_field.as_ref().unwrap();
            let kernel = &field.kernels[k];
            for (local_k, &sr) in kernel.rows.iter().enumerate() {
                let r = sr + data.n_p_rows;
                let Some(off) = group.rows_s.iter().position(|&rr| rr == r) else {
                    return Err(Error::ShapeMismatch {
                        what: "distinct event source coordinates",
                        expected: groups.len(),
                        actual: field.kernels.len(),
                    });
                };
                let local = group.rows_p.len() + off;
                emit_kernel_row(
                    &kernel.block,
                    local_k,
                    Phase::S,
                    ratio_mode,
                    nnodes,
                    state,
                    &mut local_cols[local],
                );
                if nsta > 0 {
                    local_cols[local].push((sc_s_base + rows[r].receiver, 1.0));
                }
            }
        }

        // Complete-mode QR of the hypocenter Jacobian; the trailing columns
        // of Q span the left null space and eliminate the four hypocenter
        // unknowns from this block.
        let q = h.qr().compute_Q();
        let row_base = rhs_rows.len();
        for k2 in 0..nst - 4 {
            let mut projected_resid = 0.0;
            for local in 0..nst {
                let t = q[(local, 4 + k2)];
                projected_resid += t * local_resid[local];
                for &(col, val) in &local_cols[local] {
                    m_trips.push(Triplet {
                        row: row_base + k2,
                        col,
                        val: t * val,
                    });
                }
            }
            rhs_rows.push(projected_resid);
        }
    }

    // Calibration rows go in unprojected: the source is known.
    if let Some(field) = &data.cal_field {
        for kernel in &field.kernels {
            for (local_k, &c) in kernel.rows.iter().enumerate() {
                let row = rhs_rows.len();
                let mut cols = Vec::new();
                emit_kernel_row(
                    &kernel.block,
                    local_k,
                    Phase::P,
                    false,
                    nnodes,
                    state,
                    &mut cols,
                );
                for (col, val) in cols {
                    m_trips.push(Triplet { row, col, val });
                }
                if nsta > 0 {
                    m_trips.push(Triplet {
                        row,
                        col: sc_p_base + cal.receivers[c],
                        val: 1.0,
                    });
                }
                rhs_rows.push(data.r_cal[c]);
            }
        }
    }

    let nrows = rhs_rows.len();
    let m1 = SparseColMat::try_new_from_triplets(nrows, ncols, &m_trips)?;
    let gm = gram(&m1)?;
    let n_m = frob(&gm);
    let n_p: f64 = dpen.iter().map(|d| d * d * d * d).sum::<f64>().sqrt();

    let lmbda = par.weights.smoothing * n_m / n_k;
    let gamma = if n_p != 0.0 {
        par.weights.penalty * n_m / n_p
    } else {
        par.weights.penalty
    };

    if par.verbose {
        info!("assembling {nrows} projected rows, {ncols} unknowns");
    }

    // Normal matrix.
    let mut a_trips: Vec<Triplet<usize, usize, f64>> = Vec::new();
    append_scaled(&gm, 1.0, 0, 0, &mut a_trips);
    let n_blocks = if two_phase { 2 } else { 1 };
    for block in 0..n_blocks {
        let off = block * nnodes;
        append_scaled(ktkx, lmbda, off, off, &mut a_trips);
        append_scaled(ktky, lmbda, off, off, &mut a_trips);
        append_scaled(ktkz, lmbda * par.weights.vertical_ratio, off, off, &mut a_trips);
    }
    for (n, d) in dpen.iter().enumerate() {
        if *d != 0.0 {
            a_trips.push(Triplet {
                row: n,
                col: n,
                val: gamma * d * d,
            });
        }
    }
    if nsta > 0 {
        // Soft zero-sum coupling of the P static corrections.
        for i in 0..nsta {
            for j in 0..nsta {
                a_trips.push(Triplet {
                    row: sc_p_base + i,
                    col: sc_p_base + j,
                    val: 1.0,
                });
            }
        }
    }
    let alpha = if let Some(tie) = ties {
        let alpha = par.weights.tie_points * n_m / tie.n_d;
        append_scaled(&tie.dtd, alpha, 0, 0, &mut a_trips);
        alpha
    } else {
        0.0
    };

    // Right-hand side.
    let mut b = vec![0.0; ncols];
    csc_transpose_accumulate(&m1, &rhs_rows, 1.0, &mut b);

    // Stacked model vector the smoothing acts on.
    let model: Vec<&[f64]> = if two_phase {
        vec![state.vp.as_slice(), state.second.as_slice()]
    } else {
        vec![state.vp.as_slice()]
    };
    for (block, v_block) in model.iter().enumerate() {
        let off = block * nnodes;
        for (ktk, w) in [
            (ktkx, lmbda),
            (ktky, lmbda),
            (ktkz, lmbda * par.weights.vertical_ratio),
        ] {
            let smoothed = csc_matvec(ktk, v_block);
            for (n, val) in smoothed.iter().enumerate() {
                b[off + n] -= w * val;
            }
        }
    }
    for (n, (d, p)) in dpen.iter().zip(pen.iter()).enumerate() {
        b[n] -= gamma * d * p;
    }
    if nsta > 0 {
        let sc_sum: f64 = state.sc_p.iter().sum();
        for i in 0..nsta {
            b[sc_p_base + i] -= sc_sum;
        }
    }
    if let Some(tie) = ties {
        // Residual of the tie points against the interpolated current model.
        let mut stacked = Vec::with_capacity(ncols);
        stacked.extend_from_slice(&state.vp);
        if two_phase {
            stacked.extend_from_slice(&state.second);
        }
        stacked.resize(ncols, 0.0);
        let interpolated = csc_matvec_full(&tie.d, &stacked);
        let tie_resid: Vec<f64> = tie
            .targets
            .iter()
            .zip(interpolated.iter())
            .map(|(t, i)| t - i)
            .collect();
        csc_transpose_accumulate(&tie.d, &tie_resid, alpha, &mut b);
    }

    let a = SparseColMat::try_new_from_triplets(ncols, ncols, &a_trips)?;
    let out = lsqr::lsqr(a.as_ref(), &b);
    state.res_lsqr.push(out.iterations as f64);
    debug!(
        "lsqr stopped after {} iterations ({:?})",
        out.iterations, out.stop
    );

    // Clamp and apply.
    for n in 0..nnodes {
        let mut dv = out.x[n];
        if dv.abs() > par.caps.dv_p {
            dv = par.caps.dv_p * dv.signum();
        }
        state.vp[n] += dv;
    }
    if two_phase {
        for n in 0..nnodes {
            let mut dv = out.x[nnodes + n];
            if dv.abs() > par.caps.dv_s {
                dv = par.caps.dv_s * dv.signum();
            }
            state.second[n] += dv;
        }
        if ratio_mode {
            for n in 0..nnodes {
                state.vs[n] = state.second[n] * state.vp[n];
            }
        } else {
            state.vs.copy_from_slice(&state.second);
        }
        state.s_s = state.vs.iter().map(|v| 1.0 / v).collect();
    }
    state.s_p = state.vp.iter().map(|v| 1.0 / v).collect();
    for i in 0..nsta {
        state.sc_p[i] += out.x[sc_p_base + i];
    }
    if two_phase {
        for i in 0..nsta {
            state.sc_s[i] += out.x[sc_s_base + i];
        }
    }
    Ok(())
}

/// Bound-penalty vector and its diagonal derivative for one velocity block.
fn penalty(v: &[f64], vmin: f64, vmax: f64, slope: f64, pen: &mut [f64], dpen: &mut [f64]) {
    for (n, &vn) in v.iter().enumerate() {
        if vn < vmin {
            pen[n] = slope * (vmin - vn);
            dpen[n] = -slope;
        } else if vn > vmax {
            pen[n] = slope * (vn - vmax);
            dpen[n] = slope;
        } else {
            pen[n] = 0.0;
            dpen[n] = 0.0;
        }
    }
}

/// Fill row `local` of the hypocenter Jacobian from a traced ray.
fn fill_hypo_row(
    h: &mut Mat<f64>,
    local: usize,
    path: &[[f64; 3]],
    v0: f64,
    hyp: &Hypocenter,
) -> bool {
    let Some((d, ds)) = departure(path, hyp.position()) else {
        return false;
    };
    let scale = -1.0 / (v0 * ds);
    h[(local, 0)] = 1.0;
    h[(local, 1)] = scale * d.x;
    h[(local, 2)] = scale * d.y;
    h[(local, 3)] = scale * d.z;
    true
}

/// Append one kernel row's model-derivative entries, converted from slowness
/// to velocity sensitivities by the chain rule.
fn emit_kernel_row(
    block: &SparseRowMat<usize, f64>,
    local_row: usize,
    phase: Phase,
    ratio_mode: bool,
    nnodes: usize,
    state: &JointState,
    out: &mut Vec<(usize, f64)>,
) {
    let sym = block.symbolic();
    let row_ptr = sym.row_ptr();
    let col_idx = sym.col_idx();
    let vals = block.val();
    for e in row_ptr[local_row]..row_ptr[local_row + 1] {
        let j = col_idx[e];
        let dt_ds = vals[e];
        match phase {
            Phase::P => {
                let dt_dvp = -state.s_p[j] * state.s_p[j] * dt_ds;
                out.push((j, dt_dvp));
            }
            Phase::S => {
                let dt_dvs = -state.s_s[j] * state.s_s[j] * dt_ds;
                if ratio_mode {
                    // Vs = ratio * Vp splits the sensitivity over both blocks.
                    out.push((j, dt_dvs * state.second[j]));
                    out.push((nnodes + j, dt_dvs * state.vp[j]));
                } else {
                    out.push((nnodes + j, dt_dvs));
                }
            }
        }
    }
}

/// Relocate every event against the current model, events in parallel.
/// Updates are buffered and committed at the barrier.
fn relocation_pass<R: Raytracer + Sync>(
    par: &InvParams,
    grid: &Grid3d,
    tracer: &R,
    rows: &[ObsRow],
    groups: &[EventGroup],
    state: &mut JointState,
    two_phase: bool,
) {
    let hypocenters = &state.hypocenters;
    let updated: Vec<(usize, Hypocenter)> = groups
        .par_iter()
        .map(|group| {
            let mut hyp = hypocenters[group.hyp_index];
            let mut picks = Vec::new();
            if !group.rows_p.is_empty() {
                picks.push(PhasePicks {
                    slowness: &state.s_p,
                    times: group.rows_p.iter().map(|&r| rows[r].time).collect(),
                    stations: group.rows_p.iter().map(|&r| rows[r].station).collect(),
                });
            }
            if two_phase && !group.rows_s.is_empty() {
                picks.push(PhasePicks {
                    slowness: &state.s_s,
                    times: group.rows_s.iter().map(|&r| rows[r].time).collect(),
                    stations: group.rows_s.iter().map(|&r| rows[r].station).collect(),
                });
            }
            relocate_event(grid, tracer, par, &picks, &mut hyp);
            (group.hyp_index, hyp)
        })
        .collect();
    for (i, hyp) in updated {
        state.hypocenters[i] = hyp;
    }
}

/// Transpose of a sparse matrix, rebuilt from swapped triplets.
fn transposed(m: &SparseColMat<usize, f64>) -> Result<SparseColMat<usize, f64>, Error> {
    let sym = m.symbolic();
    let col_ptr = sym.col_ptr();
    let row_idx = sym.row_idx();
    let vals = m.val();
    let mut triplets = Vec::with_capacity(vals.len());
    for j in 0..m.ncols() {
        for e in col_ptr[j]..col_ptr[j + 1] {
            triplets.push(Triplet {
                row: j,
                col: row_idx[e],
                val: vals[e],
            });
        }
    }
    Ok(SparseColMat::try_new_from_triplets(
        m.ncols(),
        m.nrows(),
        &triplets,
    )?)
}

/// `M^T M`.
fn gram(m: &SparseColMat<usize, f64>) -> Result<SparseColMat<usize, f64>, Error> {
    let mt = transposed(m)?;
    Ok(&mt * m)
}

/// Frobenius norm of a sparse matrix.
fn frob(m: &SparseColMat<usize, f64>) -> f64 {
    m.val().iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Push every entry of `m`, scaled and offset, onto a triplet buffer.
fn append_scaled(
    m: &SparseColMat<usize, f64>,
    scale: f64,
    row_off: usize,
    col_off: usize,
    out: &mut Vec<Triplet<usize, usize, f64>>,
) {
    let sym = m.symbolic();
    let col_ptr = sym.col_ptr();
    let row_idx = sym.row_idx();
    let vals = m.val();
    for j in 0..m.ncols() {
        for e in col_ptr[j]..col_ptr[j + 1] {
            out.push(Triplet {
                row: row_off + row_idx[e],
                col: col_off + j,
                val: scale * vals[e],
            });
        }
    }
}

/// `y = M x` where `x` covers the leading `ncols` entries used by `M`.
fn csc_matvec(m: &SparseColMat<usize, f64>, x: &[f64]) -> Vec<f64> {
    let sym = m.symbolic();
    let col_ptr = sym.col_ptr();
    let row_idx = sym.row_idx();
    let vals = m.val();
    let mut y = vec![0.0; m.nrows()];
    for (j, &xj) in x.iter().enumerate().take(m.ncols()) {
        if xj == 0.0 {
            continue;
        }
        for e in col_ptr[j]..col_ptr[j + 1] {
            y[row_idx[e]] += vals[e] * xj;
        }
    }
    y
}

/// `y = M x` over the full column range of `M`.
fn csc_matvec_full(m: &SparseColMat<usize, f64>, x: &[f64]) -> Vec<f64> {
    debug_assert_eq!(x.len(), m.ncols());
    csc_matvec(m, x)
}

/// `out += scale * M^T y`, walking the compressed columns directly.
fn csc_transpose_accumulate(
    m: &SparseColMat<usize, f64>,
    y: &[f64],
    scale: f64,
    out: &mut [f64],
) {
    let sym = m.symbolic();
    let col_ptr = sym.col_ptr();
    let row_idx = sym.row_idx();
    let vals = m.val();
    for j in 0..m.ncols() {
        let mut acc = 0.0;
        for e in col_ptr[j]..col_ptr[j + 1] {
            acc += vals[e] * y[row_idx[e]];
        }
        out[j] += scale * acc;
    }
}
