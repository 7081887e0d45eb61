use faer::ColRef;
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};

use crate::*;


fn assert_nearly(actual: f64, expected: f64, tol: f64) {
    assert!(
        (actual - expected).abs() < tol,
        "expected {expected}, got {actual} (tolerance {tol})"
    );
}

/// The unit cube with half-unit cells.
fn cube_grid() -> Grid3d {
    let axis = vec![0.0, 0.5, 1.0];
    Grid3d::new(axis.clone(), axis.clone(), axis, 1).unwrap()
}

/// Receivers on the eight corners of the unit cube.
fn cube_receivers() -> Vec<[f64; 3]> {
    let mut rcv = Vec::new();
    for x in [0.0, 1.0] {
        for y in [0.0, 1.0] {
            for z in [0.0, 1.0] {
                rcv.push([x, y, z]);
            }
        }
    }
    rcv
}

fn dist(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

fn rms_position_error(hyps: &[Hypocenter], truth: &[Hypocenter]) -> f64 {
    let sum: f64 = hyps
        .iter()
        .zip(truth.iter())
        .map(|(h, t)| {
            let d = dist(h.position(), t.position());
            d * d
        })
        .sum();
    (sum / hyps.len() as f64).sqrt()
}

#[test]
fn cubic_grid_constructs() {
    cube_grid();
}

#[test]
fn non_cubic_grid_fails() {
    let xy = vec![0.0, 0.5, 1.0];
    let z = vec![0.0, 0.6, 1.2];
    let err = Grid3d::new(xy.clone(), xy, z, 1).unwrap_err();
    assert!(matches!(err, Error::GridGeometry { .. }));
}

#[test]
fn uneven_axis_fails() {
    let xy = vec![0.0, 0.5, 1.0];
    let z = vec![0.0, 0.5, 1.2];
    let err = Grid3d::new(xy.clone(), xy, z, 1).unwrap_err();
    assert!(matches!(err, Error::GridGeometry { .. }));
}

#[test]
fn grid_indexing_is_row_major_in_z() {
    let grid = cube_grid();
    assert_eq!(grid.n_nodes(), 27);
    assert_eq!(grid.ind(0, 0, 0), 0);
    assert_eq!(grid.ind(0, 0, 1), 1);
    assert_eq!(grid.ind(0, 1, 0), 3);
    assert_eq!(grid.ind(1, 0, 0), 9);
    assert_eq!(grid.ind(2, 2, 2), 26);
}

#[test]
fn interp_matrix_weights_sum_to_one() {
    let grid = cube_grid();
    let pts = [[0.3, 0.4, 0.7], [0.1, 0.9, 0.2], [0.5, 0.5, 0.5]];
    let d = grid.interp_matrix(&pts).unwrap();
    let ones = vec![1.0; grid.n_nodes()];
    let row_sums = d.as_ref() * ColRef::from_slice(&ones);
    for i in 0..pts.len() {
        assert_nearly(row_sums[i], 1.0, 1e-12);
    }
    // 8 entries per row.
    assert_eq!(d.val().len(), 8 * pts.len());
}

#[test]
fn interp_matrix_rejects_outside_points() {
    let grid = cube_grid();
    let err = grid.interp_matrix(&[[0.5, 0.5, 1.5]]).unwrap_err();
    assert!(matches!(err, Error::PointOutsideGrid { .. }));
}

#[test]
fn any_outside_scans_the_whole_batch() {
    let grid = cube_grid();
    assert!(!grid.any_outside(&[[0.2, 0.2, 0.2], [1.0, 1.0, 1.0]]));
    assert!(grid.any_outside(&[[0.2, 0.2, 0.2], [0.5, -0.1, 0.5]]));
    assert!(!grid.any_outside(&[]));
}

#[test]
fn interp_matrix_accepts_boundary_points() {
    let grid = cube_grid();
    let d = grid.interp_matrix(&[[1.0, 1.0, 1.0]]).unwrap();
    let ones = vec![1.0; grid.n_nodes()];
    let row_sums = d.as_ref() * ColRef::from_slice(&ones);
    assert_nearly(row_sums[0], 1.0, 1e-12);
}

/// A 5x5x5 grid with unit cells.
fn unit_grid5() -> Grid3d {
    let axis: Vec<f64> = (0..5).map(f64::from).collect();
    Grid3d::new(axis.clone(), axis.clone(), axis, 1).unwrap()
}

#[test]
fn smoothing_annihilates_fields_linear_in_x() {
    let grid = unit_grid5();
    let (kx, ky, kz) = grid.smoothing_matrices().unwrap();
    let (nx, ny, nz) = grid.shape();
    let mut v = vec![0.0; grid.n_nodes()];
    for i in 0..nx {
        for j in 0..ny {
            for k in 0..nz {
                v[grid.ind(i, j, k)] = i as f64;
            }
        }
    }
    for m in [&kx, &ky, &kz] {
        let out = m.as_ref() * ColRef::from_slice(&v);
        for i in 0..grid.n_nodes() {
            assert_nearly(out[i], 0.0, 1e-10);
        }
    }
}

#[test]
fn smoothing_recovers_constant_curvature() {
    let grid = unit_grid5();
    let (kx, ky, kz) = grid.smoothing_matrices().unwrap();
    let (nx, ny, nz) = grid.shape();
    let mut v = vec![0.0; grid.n_nodes()];
    for i in 0..nx {
        for j in 0..ny {
            for k in 0..nz {
                v[grid.ind(i, j, k)] = (i * i) as f64;
            }
        }
    }
    // The quadratic has second derivative 2 along x everywhere; the shifted
    // boundary stencils are exact for quadratics too.
    let out = kx.as_ref() * ColRef::from_slice(&v);
    for i in 0..grid.n_nodes() {
        assert_nearly(out[i], 2.0, 1e-10);
    }
    for m in [&ky, &kz] {
        let out = m.as_ref() * ColRef::from_slice(&v);
        for i in 0..grid.n_nodes() {
            assert_nearly(out[i], 0.0, 1e-10);
        }
    }
}

#[test]
fn smoothing_has_three_entries_per_row() {
    let grid = unit_grid5();
    let (kx, _, _) = grid.smoothing_matrices().unwrap();
    assert_eq!(kx.val().len(), 3 * grid.n_nodes());
}

#[test]
fn straight_ray_times_in_uniform_model() {
    let grid = cube_grid();
    let tracer = StraightRay::default();
    let slowness = vec![0.5; grid.n_nodes()];
    let sources = [RaySource {
        t0: 0.25,
        pos: [0.1, 0.2, 0.3],
    }];
    let receivers = [[0.9, 0.8, 0.7]];
    let field = tracer.trace(&grid, &slowness, &sources, &receivers).unwrap();
    let d = dist(sources[0].pos, receivers[0]);
    // Time is distance over velocity 2, plus the origin time.
    assert_nearly(field.times[0], 0.25 + d * 0.5, 1e-9);
    assert_nearly(field.v0[0], 2.0, 1e-9);
    // The sensitivity row sums to the path length.
    assert_eq!(field.kernels.len(), 1);
    let total: f64 = field.kernels[0].block.val().iter().sum();
    assert_nearly(total, d, 1e-9);
    // The second raypath point leaves the source toward the receiver.
    let p1 = field.paths[0][1];
    assert!(dist(p1, sources[0].pos) < dist(receivers[0], sources[0].pos));
}

#[test]
fn straight_ray_groups_shared_sources() {
    let grid = cube_grid();
    let tracer = StraightRay::default();
    let slowness = vec![1.0; grid.n_nodes()];
    let src = RaySource {
        t0: 0.0,
        pos: [0.5, 0.5, 0.5],
    };
    let other = RaySource {
        t0: 0.1,
        pos: [0.25, 0.25, 0.25],
    };
    let sources = [src, src, other, src];
    let receivers = [[0.0; 3], [1.0, 0.0, 0.0], [1.0, 1.0, 1.0], [0.0, 1.0, 0.0]];
    let field = tracer.trace(&grid, &slowness, &sources, &receivers).unwrap();
    assert_eq!(field.kernels.len(), 2);
    assert_eq!(field.kernels[0].rows, vec![0, 1, 3]);
    assert_eq!(field.kernels[1].rows, vec![2]);
}

#[test]
fn straight_ray_rejects_outside_source() {
    let grid = cube_grid();
    let tracer = StraightRay::default();
    let slowness = vec![1.0; grid.n_nodes()];
    let err = tracer
        .travel_times(
            &grid,
            &slowness,
            &[RaySource {
                t0: 0.0,
                pos: [2.0, 0.5, 0.5],
            }],
            &[[0.5, 0.5, 0.5]],
        )
        .unwrap_err();
    assert!(matches!(err, Error::PointOutsideGrid { .. }));
}

#[test]
fn constant_velocity_locator_converges_on_cube() {
    let receivers = cube_receivers();
    let truth = [0.5, 0.5, 0.5];
    let arrivals: Vec<Arrival> = receivers
        .iter()
        .enumerate()
        .map(|(r, rcv)| Arrival {
            event: 0,
            time: dist(*rcv, truth),
            receiver: r,
        })
        .collect();
    let hinit = [Hypocenter::new(0, 0.0, 0.4, 0.4, 0.4)];
    let located = hypoloc(&arrivals, &receivers, 1.0, &hinit, 10, 1e-4).unwrap();
    let h = located.hypocenters[0];
    assert_nearly(h.x, 0.5, 1e-3);
    assert_nearly(h.y, 0.5, 1e-3);
    assert_nearly(h.z, 0.5, 1e-3);
    assert_nearly(h.t0, 0.0, 1e-4);
    // Converged within six iterations: later residual slots stay zero.
    assert_eq!(located.residuals[(0, 6)], 0.0);
    assert!(located.residuals[(0, 0)] > 0.0);
}

#[test]
fn two_phase_locator_recovers_position_and_origin_time() {
    let receivers = cube_receivers();
    let truth = [0.5, 0.5, 0.5];
    let t0 = 0.3;
    let (vp, vs) = (2.0, 1.0);
    let mut arrivals = Vec::new();
    for (r, rcv) in receivers.iter().enumerate() {
        arrivals.push(PhasedArrival {
            event: 3,
            time: t0 + dist(*rcv, truth) / vp,
            receiver: r,
            phase: Phase::P,
        });
        arrivals.push(PhasedArrival {
            event: 3,
            time: t0 + dist(*rcv, truth) / vs,
            receiver: r,
            phase: Phase::S,
        });
    }
    let hinit = [Hypocenter::new(3, 0.0, 0.4, 0.4, 0.4)];
    let located = hypoloc_ps(&arrivals, &receivers, (vp, vs), &hinit, 10, 1e-4).unwrap();
    let h = located.hypocenters[0];
    assert_nearly(h.x, 0.5, 1e-3);
    assert_nearly(h.y, 0.5, 1e-3);
    assert_nearly(h.z, 0.5, 1e-3);
    assert_nearly(h.t0, t0, 1e-4);
}

#[test]
fn locator_rejects_unknown_event() {
    let receivers = cube_receivers();
    let arrivals = [Arrival {
        event: 9,
        time: 1.0,
        receiver: 0,
    }];
    let hinit = [Hypocenter::new(0, 0.0, 0.4, 0.4, 0.4)];
    let err = hypoloc(&arrivals, &receivers, 1.0, &hinit, 5, 1e-4).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}

// The depth-linear model of the joint scenarios.
fn vz(z: f64) -> f64 {
    4000.0 + 10.0 * (z - 50.0)
}

fn vz_init(z: f64) -> f64 {
    4000.0 + 7.5 * (z - 50.0)
}

fn demo_receivers() -> Vec<[f64; 3]> {
    vec![
        [112.0, 115.0, 13.0],
        [111.0, 116.0, 40.0],
        [111.0, 113.0, 90.0],
        [151.0, 117.0, 17.0],
        [180.0, 115.0, 16.0],
        [113.0, 145.0, 11.0],
        [160.0, 150.0, 17.0],
        [185.0, 149.0, 15.0],
        [117.0, 184.0, 11.0],
        [155.0, 192.0, 9.0],
        [198.0, 198.0, 10.0],
        [198.0, 196.0, 40.0],
        [198.0, 193.0, 90.0],
    ]
}

fn demo_grid() -> Grid3d {
    let x: Vec<f64> = (0..13).map(|i| 90.0 + 10.0 * f64::from(i)).collect();
    let y: Vec<f64> = (0..14).map(|i| 80.0 + 10.0 * f64::from(i)).collect();
    let z: Vec<f64> = (0..11).map(|i| 10.0 * f64::from(i)).collect();
    Grid3d::new(x, y, z, 1).unwrap()
}

fn depth_field(grid: &Grid3d, v_of_z: impl Fn(f64) -> f64) -> Vec<f64> {
    let (nx, ny, nz) = grid.shape();
    let mut v = vec![0.0; grid.n_nodes()];
    for i in 0..nx {
        for j in 0..ny {
            for k in 0..nz {
                v[grid.ind(i, j, k)] = v_of_z(grid.node(i, j, k)[2]);
            }
        }
    }
    v
}

fn demo_tie_points() -> Vec<VelocityPoint> {
    [
        [100.0, 100.0, 1.0],
        [100.0, 200.0, 1.0],
        [200.0, 100.0, 1.0],
        [200.0, 200.0, 1.0],
        [112.0, 148.0, 11.0],
        [152.0, 108.0, 5.0],
        [152.0, 108.0, 75.0],
        [192.0, 148.0, 11.0],
    ]
    .iter()
    .map(|p| VelocityPoint {
        v: vz(p[2]),
        x: p[0],
        y: p[1],
        z: p[2],
        phase: Phase::P,
    })
    .collect()
}

/// Synthetic single-phase dataset: 15 events, 13 receivers, 5 calibration
/// shots, Gaussian pick noise, all generated through the straight-ray tracer
/// in the depth-linear true model.
struct Scenario {
    grid: Grid3d,
    receivers: Vec<[f64; 3]>,
    truth: Vec<Hypocenter>,
    hinit: Vec<Hypocenter>,
    arrivals: Vec<Arrival>,
    caldata: Vec<CalibrationShot>,
    ties: Vec<VelocityPoint>,
}

fn build_scenario() -> Scenario {
    let grid = demo_grid();
    let receivers = demo_receivers();
    let tracer = StraightRay::default();
    let v_true = depth_field(&grid, vz);
    let s_true: Vec<f64> = v_true.iter().map(|v| 1.0 / v).collect();

    let mut rng = StdRng::seed_from_u64(20161102);
    let unit: Normal<f64> = Normal::new(0.0, 1.0).unwrap();
    let pick_noise = Normal::new(0.0, 1.0e-3).unwrap();

    let nev = 15;
    let mut truth = Vec::with_capacity(nev);
    let mut hinit = Vec::with_capacity(nev);
    for e in 0..nev {
        let t0 = 50.0 * e as f64 / (nev - 1) as f64;
        // Clamped into the grid so no draw can fall outside.
        let x = (160.0 + 5.0 * unit.sample(&mut rng)).clamp(100.0, 200.0);
        let y = (140.0 + 5.0 * unit.sample(&mut rng)).clamp(90.0, 200.0);
        let z = (60.0 + 10.0 * unit.sample(&mut rng)).clamp(10.0, 90.0);
        truth.push(Hypocenter::new(e as u32, t0 + unit.sample(&mut rng), x, y, z));
        hinit.push(Hypocenter::new(
            e as u32,
            t0,
            150.0 + 0.1 * unit.sample(&mut rng),
            150.0 + 0.1 * unit.sample(&mut rng),
            50.0 + 0.1 * unit.sample(&mut rng),
        ));
    }

    // Event arrival times through the true model.
    let mut sources = Vec::new();
    let mut stations = Vec::new();
    for h in &truth {
        for rcv in &receivers {
            sources.push(RaySource {
                t0: h.t0,
                pos: h.position(),
            });
            stations.push(*rcv);
        }
    }
    let tt = tracer
        .travel_times(&grid, &s_true, &sources, &stations)
        .unwrap();
    let mut arrivals = Vec::with_capacity(tt.len());
    for (row, t) in tt.iter().enumerate() {
        arrivals.push(Arrival {
            event: (row / receivers.len()) as u32,
            time: t + pick_noise.sample(&mut rng),
            receiver: row % receivers.len(),
        });
    }

    // Calibration shots of known position and zero origin time, with a few
    // picks knocked out so shots carry unequal row counts.
    let ncal = 5;
    let mut cal_sources = Vec::new();
    let mut cal_stations = Vec::new();
    let mut cal_meta = Vec::new();
    for c in 0..ncal {
        let pos = [
            (160.0 + 5.0 * unit.sample(&mut rng)).clamp(100.0, 200.0),
            (130.0 + 5.0 * unit.sample(&mut rng)).clamp(90.0, 200.0),
            (45.0 + unit.sample(&mut rng)).clamp(10.0, 90.0),
        ];
        for r in 0..receivers.len() {
            let flat = c * receivers.len() + r;
            if flat == 3 || flat == 13 || flat == 15 {
                continue;
            }
            cal_sources.push(RaySource { t0: 0.0, pos });
            cal_stations.push(receivers[r]);
            cal_meta.push((c as u32, r, pos));
        }
    }
    let tcal = tracer
        .travel_times(&grid, &s_true, &cal_sources, &cal_stations)
        .unwrap();
    let caldata: Vec<CalibrationShot> = tcal
        .iter()
        .zip(cal_meta.iter())
        .map(|(t, (shot, r, pos))| CalibrationShot {
            shot: *shot,
            time: t + pick_noise.sample(&mut rng),
            receiver: *r,
            x: pos[0],
            y: pos[1],
            z: pos[2],
            phase: Phase::P,
        })
        .collect();

    Scenario {
        grid,
        receivers,
        truth,
        hinit,
        arrivals,
        caldata,
        ties: demo_tie_points(),
    }
}

fn demo_params() -> InvParams {
    InvParams {
        maxit: 3,
        maxit_hypo: 10,
        conv_hypo: 1.0,
        bounds: VelocityBounds {
            vp_min: 3500.0,
            vp_max: 4500.0,
            slope_p: 1.0,
            vs_min: 1500.0,
            vs_max: 2500.0,
            slope_s: 1.0,
        },
        caps: StepCaps {
            dv_p: 50.0,
            dx: 5.0,
            dt: 1e-2,
            dv_s: 25.0,
        },
        weights: Weights {
            smoothing: 2.0,
            penalty: 1.0,
            tie_points: 1.0,
            vertical_ratio: 0.1,
        },
        ..InvParams::default()
    }
}

#[test]
fn joint_inversion_improves_on_the_seed_locator() {
    let sc = build_scenario();
    let v_mean = sc.ties.iter().map(|t| t.v).sum::<f64>() / sc.ties.len() as f64;
    let seeded = hypoloc(&sc.arrivals, &sc.receivers, v_mean, &sc.hinit, 10, 1.0).unwrap();
    let seed_rms = rms_position_error(&seeded.hypocenters, &sc.truth);

    let tracer = StraightRay::default();
    let par = demo_params();
    let v_init = depth_field(&sc.grid, vz_init);
    let out = joint_hypo_vel(
        &par,
        &sc.grid,
        &tracer,
        &sc.arrivals,
        &sc.receivers,
        v_init,
        &seeded.hypocenters,
        &sc.caldata,
        &sc.ties,
    )
    .unwrap();

    let joint_rms = rms_position_error(&out.hypocenters, &sc.truth);
    assert!(
        joint_rms < seed_rms,
        "joint rms {joint_rms} should beat seed rms {seed_rms}"
    );

    // Residual traces: one entry per iteration plus the final pass.
    assert_eq!(out.res_v.len(), par.maxit + 1);
    assert_eq!(out.res_lsqr.len(), par.maxit);
    assert!(out.res_v.iter().all(|r| r.is_finite()));

    // Every hypocenter stays inside the grid.
    for h in &out.hypocenters {
        assert!(!sc.grid.is_outside(h.position()));
    }

    // Static corrections: one per receiver, finite.
    assert_eq!(out.statics.len(), sc.receivers.len());
    assert!(out.statics.iter().all(|s| s.is_finite()));
    assert!(out.velocity.iter().all(|v| *v > 0.0));
}

#[test]
fn velocity_update_is_clamped_per_iteration() {
    let sc = build_scenario();
    let tracer = StraightRay::default();
    let mut par = demo_params();
    par.maxit = 1;
    let v_init = depth_field(&sc.grid, vz_init);
    let out = joint_hypo_vel(
        &par,
        &sc.grid,
        &tracer,
        &sc.arrivals,
        &sc.receivers,
        v_init.clone(),
        &sc.hinit,
        &sc.caldata,
        &sc.ties,
    )
    .unwrap();
    for (v_new, v_old) in out.velocity.iter().zip(v_init.iter()) {
        assert!((v_new - v_old).abs() <= par.caps.dv_p + 1e-9);
    }
}

#[test]
fn pure_relocation_reaches_the_locator_fixed_point() {
    // Noise-free picks in a uniform model: the seeded locator is already at
    // the optimum, and a relocation-only run must stay there.
    let axis: Vec<f64> = (0..5).map(|i| 100.0 * f64::from(i)).collect();
    let grid = Grid3d::new(axis.clone(), axis.clone(), axis, 1).unwrap();
    let receivers = vec![
        [50.0, 50.0, 20.0],
        [350.0, 60.0, 30.0],
        [60.0, 350.0, 10.0],
        [340.0, 340.0, 40.0],
        [200.0, 60.0, 350.0],
        [60.0, 200.0, 300.0],
    ];
    let v = 3000.0;
    let truth = [
        Hypocenter::new(0, 0.1, 180.0, 190.0, 210.0),
        Hypocenter::new(1, 0.4, 230.0, 160.0, 150.0),
    ];
    let mut arrivals = Vec::new();
    for h in &truth {
        for (r, rcv) in receivers.iter().enumerate() {
            arrivals.push(Arrival {
                event: h.event,
                time: h.t0 + dist(h.position(), *rcv) / v,
                receiver: r,
            });
        }
    }
    let hinit = [
        Hypocenter::new(0, 0.0, 200.0, 200.0, 200.0),
        Hypocenter::new(1, 0.0, 210.0, 190.0, 180.0),
    ];
    let seeded = hypoloc(&arrivals, &receivers, v, &hinit, 20, 1e-5).unwrap();

    let tracer = StraightRay::default();
    let par = InvParams {
        maxit: 1,
        maxit_hypo: 10,
        conv_hypo: 1e-3,
        invert_vel: false,
        ..InvParams::default()
    };
    let out = joint_hypo_vel(
        &par,
        &grid,
        &tracer,
        &arrivals,
        &receivers,
        v,
        &seeded.hypocenters,
        &[],
        &[],
    )
    .unwrap();

    assert!(out.res_v.is_empty());
    assert!(out.res_lsqr.is_empty());
    for (h, s) in out.hypocenters.iter().zip(seeded.hypocenters.iter()) {
        assert_nearly(h.x, s.x, 2e-3);
        assert_nearly(h.y, s.y, 2e-3);
        assert_nearly(h.z, s.z, 2e-3);
    }
    // Both sit on the true hypocenters.
    for (h, t) in out.hypocenters.iter().zip(truth.iter()) {
        assert!(dist(h.position(), t.position()) < 1e-2);
        assert_nearly(h.t0, t.t0, 1e-4);
    }
}

/// Coarse grid for the two-phase scenarios.
fn coarse_grid() -> Grid3d {
    let x: Vec<f64> = (0..7).map(|i| 90.0 + 20.0 * f64::from(i)).collect();
    let y: Vec<f64> = (0..7).map(|i| 80.0 + 20.0 * f64::from(i)).collect();
    let z: Vec<f64> = (0..6).map(|i| 20.0 * f64::from(i)).collect();
    Grid3d::new(x, y, z, 1).unwrap()
}

/// Two-phase dataset on the coarse grid: P through the depth-linear model,
/// S through a uniform 2100 model, with a few picks dropped.
fn build_ps_scenario() -> (Grid3d, Vec<[f64; 3]>, Vec<Hypocenter>, Vec<Hypocenter>, Vec<PhasedArrival>, Vec<VelocityPoint>) {
    let grid = coarse_grid();
    let receivers = demo_receivers();
    let tracer = StraightRay::default();
    let v_true = depth_field(&grid, vz);
    let s_p: Vec<f64> = v_true.iter().map(|v| 1.0 / v).collect();
    let vs = 2100.0;
    let s_s = vec![1.0 / vs; grid.n_nodes()];

    let mut rng = StdRng::seed_from_u64(19910405);
    let unit: Normal<f64> = Normal::new(0.0, 1.0).unwrap();
    let pick_noise = Normal::new(0.0, 1.0e-3).unwrap();

    let nev = 8;
    let mut truth = Vec::new();
    let mut hinit = Vec::new();
    for e in 0..nev {
        let t0 = 30.0 * e as f64 / (nev - 1) as f64;
        let x = (160.0 + 5.0 * unit.sample(&mut rng)).clamp(100.0, 200.0);
        let y = (140.0 + 5.0 * unit.sample(&mut rng)).clamp(90.0, 190.0);
        let z = (60.0 + 10.0 * unit.sample(&mut rng)).clamp(20.0, 90.0);
        truth.push(Hypocenter::new(e as u32, t0, x, y, z));
        hinit.push(Hypocenter::new(
            e as u32,
            t0,
            150.0 + 0.1 * unit.sample(&mut rng),
            150.0 + 0.1 * unit.sample(&mut rng),
            50.0 + 0.1 * unit.sample(&mut rng),
        ));
    }

    let mut arrivals = Vec::new();
    for h in &truth {
        let sources: Vec<RaySource> = receivers
            .iter()
            .map(|_| RaySource {
                t0: h.t0,
                pos: h.position(),
            })
            .collect();
        let ttp = tracer
            .travel_times(&grid, &s_p, &sources, &receivers)
            .unwrap();
        let tts = tracer
            .travel_times(&grid, &s_s, &sources, &receivers)
            .unwrap();
        for (r, (tp, ts)) in ttp.iter().zip(tts.iter()).enumerate() {
            // Drop one P pick and one S pick per event at rotating stations.
            if r != (h.event as usize) % receivers.len() {
                arrivals.push(PhasedArrival {
                    event: h.event,
                    time: tp + pick_noise.sample(&mut rng),
                    receiver: r,
                    phase: Phase::P,
                });
            }
            if r != (h.event as usize + 5) % receivers.len() {
                arrivals.push(PhasedArrival {
                    event: h.event,
                    time: ts + pick_noise.sample(&mut rng),
                    receiver: r,
                    phase: Phase::S,
                });
            }
        }
    }

    let mut ties = demo_tie_points();
    let s_ties: Vec<VelocityPoint> = ties
        .iter()
        .map(|p| VelocityPoint {
            v: vs,
            x: p.x,
            y: p.y,
            z: p.z,
            phase: Phase::S,
        })
        .collect();
    ties.extend(s_ties);
    (grid, receivers, truth, hinit, arrivals, ties)
}

#[test]
fn two_phase_ratio_mode_completes() {
    let (grid, receivers, _truth, hinit, arrivals, ties) = build_ps_scenario();
    let tracer = StraightRay::default();
    let mut par = demo_params();
    par.maxit = 2;
    par.invert_vs_vp = true;

    let seeded = hypoloc_ps(&arrivals, &receivers, (4000.0, 2100.0), &hinit, 10, 1.0).unwrap();
    let v_init = (
        InitialVelocity::Field(depth_field(&grid, vz_init)),
        InitialVelocity::Uniform(2000.0),
    );
    let out = joint_hypo_vel_ps(
        &par,
        &grid,
        &tracer,
        &arrivals,
        &receivers,
        v_init,
        &seeded.hypocenters,
        &[],
        &ties,
    )
    .unwrap();

    assert_eq!(out.res_v.len(), par.maxit + 1);
    assert_eq!(out.res_lsqr.len(), par.maxit);
    assert_eq!(out.vp.len(), grid.n_nodes());
    assert_eq!(out.vs.len(), grid.n_nodes());
    assert!(out.vp.iter().all(|v| v.is_finite() && *v > 0.0));
    assert!(out.vs.iter().all(|v| v.is_finite() && *v > 0.0));
    assert_eq!(out.sc_p.len(), receivers.len());
    assert_eq!(out.sc_s.len(), receivers.len());
    for h in &out.hypocenters {
        assert!(!grid.is_outside(h.position()));
    }
}

#[test]
fn two_phase_vs_mode_completes() {
    let (grid, receivers, _, hinit, arrivals, ties) = build_ps_scenario();
    let tracer = StraightRay::default();
    let mut par = demo_params();
    par.maxit = 2;
    par.invert_vs_vp = false;

    let seeded = hypoloc_ps(&arrivals, &receivers, (4000.0, 2100.0), &hinit, 10, 1.0).unwrap();
    let v_init = (
        InitialVelocity::Field(depth_field(&grid, vz_init)),
        InitialVelocity::Uniform(2000.0),
    );
    let out = joint_hypo_vel_ps(
        &par,
        &grid,
        &tracer,
        &arrivals,
        &receivers,
        v_init,
        &seeded.hypocenters,
        &[],
        &ties,
    )
    .unwrap();
    assert!(out.vs.iter().all(|v| v.is_finite() && *v > 0.0));
}

#[test]
fn ratio_mode_rejects_uncollocated_s_tie_point() {
    let (grid, receivers, _, hinit, arrivals, mut ties) = build_ps_scenario();
    ties.push(VelocityPoint {
        v: 2100.0,
        x: 101.0,
        y: 101.0,
        z: 50.0,
        phase: Phase::S,
    });
    let tracer = StraightRay::default();
    let mut par = demo_params();
    par.maxit = 1;
    par.invert_vs_vp = true;
    let v_init = (
        InitialVelocity::Uniform(4000.0),
        InitialVelocity::Uniform(2000.0),
    );
    let err = joint_hypo_vel_ps(
        &par,
        &grid,
        &tracer,
        &arrivals,
        &receivers,
        v_init,
        &hinit,
        &[],
        &ties,
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidTiePoint { .. }));
}

#[test]
fn single_phase_rejects_s_tie_points() {
    let grid = cube_grid();
    let tracer = StraightRay::default();
    let par = InvParams::default();
    let ties = [VelocityPoint {
        v: 1.0,
        x: 0.5,
        y: 0.5,
        z: 0.5,
        phase: Phase::S,
    }];
    let err = joint_hypo_vel(
        &par, &grid, &tracer, &[], &[], 1.0, &[], &[], &ties,
    )
    .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}

#[test]
fn joint_rejects_coincident_initial_hypocenters() {
    let grid = cube_grid();
    let tracer = StraightRay::default();
    let par = InvParams {
        maxit: 1,
        ..InvParams::default()
    };
    let receivers = cube_receivers();
    let hinit = [
        Hypocenter::new(0, 0.0, 0.5, 0.5, 0.5),
        Hypocenter::new(1, 0.0, 0.5, 0.5, 0.5),
    ];
    let arrivals: Vec<Arrival> = (0..2)
        .flat_map(|e| {
            (0..receivers.len()).map(move |r| Arrival {
                event: e,
                time: 1.0,
                receiver: r,
            })
        })
        .collect();
    let err = joint_hypo_vel(
        &par,
        &grid,
        &tracer,
        &arrivals,
        &receivers,
        1.0,
        &hinit,
        &[],
        &[],
    )
    .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}

#[test]
fn joint_rejects_unsorted_calibration_data() {
    let grid = cube_grid();
    let tracer = StraightRay::default();
    let par = InvParams {
        maxit: 1,
        ..InvParams::default()
    };
    let receivers = cube_receivers();
    let caldata = [
        CalibrationShot {
            shot: 2,
            time: 0.5,
            receiver: 0,
            x: 0.5,
            y: 0.5,
            z: 0.5,
            phase: Phase::P,
        },
        CalibrationShot {
            shot: 1,
            time: 0.5,
            receiver: 1,
            x: 0.4,
            y: 0.4,
            z: 0.4,
            phase: Phase::P,
        },
    ];
    let err = joint_hypo_vel(
        &par, &grid, &tracer, &[], &receivers, 1.0, &[], &caldata, &[],
    )
    .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}

#[test]
fn joint_rejects_unsorted_receivers_within_a_shot() {
    let grid = cube_grid();
    let tracer = StraightRay::default();
    let par = InvParams {
        maxit: 1,
        ..InvParams::default()
    };
    let receivers = cube_receivers();
    let caldata = [
        CalibrationShot {
            shot: 1,
            time: 0.5,
            receiver: 2,
            x: 0.5,
            y: 0.5,
            z: 0.5,
            phase: Phase::P,
        },
        CalibrationShot {
            shot: 1,
            time: 0.5,
            receiver: 1,
            x: 0.5,
            y: 0.5,
            z: 0.5,
            phase: Phase::P,
        },
    ];
    let err = joint_hypo_vel(
        &par, &grid, &tracer, &[], &receivers, 1.0, &[], &caldata, &[],
    )
    .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}
