//! Standalone constant-velocity hypocenter locators.
//!
//! These seed the joint inversion: they assume a homogeneous velocity (one
//! value per phase) so travel times are straight-line distances over
//! velocity, and refine each event by Gauss-Newton on `(t0, x, y, z)`.

use std::collections::BTreeMap;

use faer::{Col, Mat};
use log::{info, warn};

use crate::{
    Error,
    datatypes::{Arrival, Hypocenter, Phase, PhasedArrival},
    lstsq::gauss_newton_step,
};

/// Output of [`hypoloc`] and [`hypoloc_ps`].
#[derive(Debug)]
pub struct LocatedEvents {
    /// The refined hypocenter table, in the same order as the initial table.
    pub hypocenters: Vec<Hypocenter>,
    /// Residual norm per event and iteration, `nev x maxit`, rows in sorted
    /// event-id order, zero past convergence.
    pub residuals: Mat<f64>,
}

/// Locate hypocenters in a constant-velocity model.
///
/// `arrivals` are single-phase picks, `receivers` the receiver coordinate
/// table, `v` the wave velocity. `hinit` supplies one starting row per event;
/// iteration stops when every position component moves less than `convh`, or
/// after `maxit` iterations.
pub fn hypoloc(
    arrivals: &[Arrival],
    receivers: &[[f64; 3]],
    v: f64,
    hinit: &[Hypocenter],
    maxit: usize,
    convh: f64,
) -> Result<LocatedEvents, Error> {
    let picks: Vec<(u32, f64, usize)> = arrivals
        .iter()
        .map(|a| (a.event, a.time, a.receiver))
        .collect();
    locate(&picks, receivers, |_| v, hinit, maxit, convh)
}

/// Locate hypocenters in a constant-velocity model with P and S picks.
///
/// Like [`hypoloc`], but each observation uses the velocity of its phase:
/// `v.0` for P, `v.1` for S.
pub fn hypoloc_ps(
    arrivals: &[PhasedArrival],
    receivers: &[[f64; 3]],
    v: (f64, f64),
    hinit: &[Hypocenter],
    maxit: usize,
    convh: f64,
) -> Result<LocatedEvents, Error> {
    let picks: Vec<(u32, f64, usize)> = arrivals
        .iter()
        .map(|a| (a.event, a.time, a.receiver))
        .collect();
    let vel = move |i: usize| match arrivals[i].phase {
        Phase::P => v.0,
        Phase::S => v.1,
    };
    locate(&picks, receivers, vel, hinit, maxit, convh)
}

/// Shared locator core. `velocity_of` maps a pick index to its velocity.
fn locate(
    picks: &[(u32, f64, usize)],
    receivers: &[[f64; 3]],
    velocity_of: impl Fn(usize) -> f64,
    hinit: &[Hypocenter],
    maxit: usize,
    convh: f64,
) -> Result<LocatedEvents, Error> {
    for &(_, _, rcv) in picks {
        if rcv >= receivers.len() {
            return Err(Error::ShapeMismatch {
                what: "receiver index",
                expected: receivers.len(),
                actual: rcv,
            });
        }
    }
    let hyp_index: BTreeMap<u32, usize> =
        hinit.iter().enumerate().map(|(i, h)| (h.event, i)).collect();

    // Picks per event, keyed by sorted event id.
    let mut by_event: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (i, &(event, _, _)) in picks.iter().enumerate() {
        by_event.entry(event).or_default().push(i);
    }
    for &event in by_event.keys() {
        if !hyp_index.contains_key(&event) {
            return Err(Error::ShapeMismatch {
                what: "initial hypocenter table",
                expected: by_event.len(),
                actual: hyp_index.len(),
            });
        }
    }

    let mut hypocenters = hinit.to_vec();
    let mut residuals = Mat::zeros(by_event.len(), maxit);

    for (row, (&event, pick_ids)) in by_event.iter().enumerate() {
        let hyp = &mut hypocenters[hyp_index[&event]];
        let times: Vec<f64> = pick_ids.iter().map(|&i| picks[i].1).collect();
        let stations: Vec<[f64; 3]> = pick_ids.iter().map(|&i| receivers[picks[i].2]).collect();
        let velocities: Vec<f64> = pick_ids.iter().map(|&i| velocity_of(i)).collect();

        info!("locating event {event}");
        locate_event(&times, &stations, &velocities, hyp, maxit, convh, &mut residuals, row);
    }

    Ok(LocatedEvents {
        hypocenters,
        residuals,
    })
}

/// Gauss-Newton refinement of one event against straight-line travel times.
#[allow(clippy::too_many_arguments)]
fn locate_event(
    times: &[f64],
    stations: &[[f64; 3]],
    velocities: &[f64],
    hyp: &mut Hypocenter,
    maxit: usize,
    convh: f64,
    residuals: &mut Mat<f64>,
    row: usize,
) {
    let nst = times.len();
    for it in 0..maxit {
        let mut h = Mat::zeros(nst, 4);
        let mut r = Col::zeros(nst);
        for ns in 0..nst {
            let dx = stations[ns][0] - hyp.x;
            let dy = stations[ns][1] - hyp.y;
            let dz = stations[ns][2] - hyp.z;
            let ds = (dx * dx + dy * dy + dz * dz).sqrt();
            if ds == 0.0 {
                warn!("event {}: receiver coincides with hypocenter, skipping", hyp.event);
                return;
            }
            let v = velocities[ns];
            h[(ns, 0)] = 1.0;
            h[(ns, 1)] = -dx / (v * ds);
            h[(ns, 2)] = -dy / (v * ds);
            h[(ns, 3)] = -dz / (v * ds);
            r[ns] = times[ns] - (hyp.t0 + ds / v);
        }
        residuals[(row, it)] = r.norm_l2();

        let Some(dh) = gauss_newton_step(&h, &r) else {
            warn!(
                "event {}: could not be located (iteration {it}), skipping",
                hyp.event
            );
            return;
        };

        hyp.t0 += dh[0];
        hyp.x += dh[1];
        hyp.y += dh[2];
        hyp.z += dh[3];

        if dh[1].abs() < convh && dh[2].abs() < convh && dh[3].abs() < convh {
            info!("event {}: converged at iteration {}", hyp.event, it + 1);
            return;
        }
    }
    info!("event {}: reached max number of iterations", hyp.event);
}
