//! Adapter onto raytracing engines, plus a straight-ray reference tracer.
//!
//! The joint inverter only talks to raytracers through the [`Raytracer`]
//! trait. Production deployments are expected to wrap an eikonal solver; the
//! built-in [`StraightRay`] tracer integrates the trilinearly interpolated
//! slowness along straight source-receiver segments, which is exact for
//! homogeneous models and a serviceable approximation for mild gradients.

use indexmap::IndexMap;
use rayon::prelude::*;

use faer::sparse::{SparseRowMat, Triplet};

use crate::{Error, grid::Grid3d, vector::V3};

/// One source of a raytracing batch, paired elementwise with a receiver.
#[derive(Clone, Copy, Debug)]
pub struct RaySource {
    /// Origin time, added to the propagation time.
    pub t0: f64,
    /// Source coordinates.
    pub pos: [f64; 3],
}

/// Sensitivities of one event or shot.
///
/// Sources sharing identical coordinates are grouped into one entry; `rows`
/// lists the batch indices of the group in input order and `block` holds
/// `d t / d s` at every grid node, one row per batch index.
pub struct SensitivityGroup {
    /// Batch indices covered by this group, in first-appearance order.
    pub rows: Vec<usize>,
    /// Travel-time derivatives with respect to slowness, `rows.len() x N`.
    pub block: SparseRowMat<usize, f64>,
}

/// Everything a full raytracing call returns.
pub struct RayField {
    /// Predicted arrival time per batch row, origin time included.
    pub times: Vec<f64>,
    /// Raypath polyline per batch row, from source to receiver. The second
    /// point estimates the departure direction at the source.
    pub paths: Vec<Vec<[f64; 3]>>,
    /// Velocity along the initial ray segment, per batch row.
    pub v0: Vec<f64>,
    /// Per-source sensitivity blocks.
    pub kernels: Vec<SensitivityGroup>,
}

/// Uniform interface onto raytracing engines.
///
/// `sources` and `receivers` are paired elementwise; all observations of one
/// event must carry identical source coordinates, which is the grouping key
/// for the sensitivity blocks.
pub trait Raytracer {
    /// Trace the batch and return times, raypaths, initial-segment velocities
    /// and sensitivity blocks.
    fn trace(
        &self,
        grid: &Grid3d,
        slowness: &[f64],
        sources: &[RaySource],
        receivers: &[[f64; 3]],
    ) -> Result<RayField, Error>;

    /// Trace the batch and return times, raypaths and initial-segment
    /// velocities, skipping the sensitivity blocks.
    fn trace_rays(
        &self,
        grid: &Grid3d,
        slowness: &[f64],
        sources: &[RaySource],
        receivers: &[[f64; 3]],
    ) -> Result<(Vec<f64>, Vec<Vec<[f64; 3]>>, Vec<f64>), Error> {
        let field = self.trace(grid, slowness, sources, receivers)?;
        Ok((field.times, field.paths, field.v0))
    }

    /// Trace the batch and return predicted arrival times only.
    fn travel_times(
        &self,
        grid: &Grid3d,
        slowness: &[f64],
        sources: &[RaySource],
        receivers: &[[f64; 3]],
    ) -> Result<Vec<f64>, Error> {
        Ok(self.trace(grid, slowness, sources, receivers)?.times)
    }
}

/// Straight-ray tracer over the trilinearly interpolated slowness field.
#[derive(Clone, Copy, Debug)]
pub struct StraightRay {
    /// Integration step as a fraction of the grid cell size.
    pub step_fraction: f64,
}

impl Default for StraightRay {
    fn default() -> Self {
        Self { step_fraction: 0.5 }
    }
}

/// Per-row result of the straight-ray integration.
struct RowTrace {
    time: f64,
    path: Vec<[f64; 3]>,
    v0: f64,
    /// Node contributions to `d t / d s`, unmerged.
    contribs: Vec<(usize, f64)>,
}

impl StraightRay {
    fn validate(
        &self,
        grid: &Grid3d,
        slowness: &[f64],
        sources: &[RaySource],
        receivers: &[[f64; 3]],
    ) -> Result<(), Error> {
        if slowness.len() != grid.n_nodes() {
            return Err(Error::ShapeMismatch {
                what: "slowness vector",
                expected: grid.n_nodes(),
                actual: slowness.len(),
            });
        }
        if sources.len() != receivers.len() {
            return Err(Error::ShapeMismatch {
                what: "raytracing batch",
                expected: sources.len(),
                actual: receivers.len(),
            });
        }
        for s in sources {
            if grid.is_outside(s.pos) {
                return Err(Error::PointOutsideGrid {
                    x: s.pos[0],
                    y: s.pos[1],
                    z: s.pos[2],
                });
            }
        }
        grid.check_inside(receivers)
    }

    /// Integrate one straight ray. Midpoint rule per segment; the segment
    /// count scales with the source-receiver distance.
    fn trace_row(
        &self,
        grid: &Grid3d,
        slowness: &[f64],
        src: &RaySource,
        rcv: [f64; 3],
        want_kernel: bool,
    ) -> RowTrace {
        let a = V3::from_array(src.pos);
        let b = V3::from_array(rcv);
        let dist = a.euclidean_distance(b);
        let step = self.step_fraction * grid.cell_size();
        let nseg = libm::fmax(1.0, (dist / step).ceil()) as usize;

        let mut path = Vec::with_capacity(nseg + 1);
        for p in 0..=nseg {
            let t = p as f64 / nseg as f64;
            path.push([
                src.pos[0] + t * (rcv[0] - src.pos[0]),
                src.pos[1] + t * (rcv[1] - src.pos[1]),
                src.pos[2] + t * (rcv[2] - src.pos[2]),
            ]);
        }

        let seg_len = dist / nseg as f64;
        let mut time = 0.0;
        let mut v0 = 0.0;
        let mut contribs = Vec::new();
        if want_kernel {
            contribs.reserve(8 * nseg);
        }
        for p in 0..nseg {
            let mid = [
                0.5 * (path[p][0] + path[p + 1][0]),
                0.5 * (path[p][1] + path[p + 1][1]),
                0.5 * (path[p][2] + path[p + 1][2]),
            ];
            let (nodes, weights) = grid.cell_weights(mid);
            let mut s_mid = 0.0;
            for c in 0..8 {
                s_mid += weights[c] * slowness[nodes[c]];
            }
            if p == 0 {
                v0 = 1.0 / s_mid;
            }
            time += seg_len * s_mid;
            if want_kernel && seg_len > 0.0 {
                for c in 0..8 {
                    contribs.push((nodes[c], seg_len * weights[c]));
                }
            }
        }
        if dist == 0.0 {
            // Degenerate ray; report the local velocity and leave the
            // kernel row empty.
            let (nodes, weights) = grid.cell_weights(src.pos);
            let mut s_here = 0.0;
            for c in 0..8 {
                s_here += weights[c] * slowness[nodes[c]];
            }
            v0 = 1.0 / s_here;
        }
        RowTrace {
            time: time + src.t0,
            path,
            v0,
            contribs,
        }
    }

    fn trace_batch(
        &self,
        grid: &Grid3d,
        slowness: &[f64],
        sources: &[RaySource],
        receivers: &[[f64; 3]],
        want_kernel: bool,
    ) -> Result<Vec<RowTrace>, Error> {
        self.validate(grid, slowness, sources, receivers)?;
        let rows: Vec<RowTrace> = if grid.nthreads() > 1 {
            sources
                .par_iter()
                .zip(receivers.par_iter())
                .map(|(s, r)| self.trace_row(grid, slowness, s, *r, want_kernel))
                .collect()
        } else {
            sources
                .iter()
                .zip(receivers.iter())
                .map(|(s, r)| self.trace_row(grid, slowness, s, *r, want_kernel))
                .collect()
        };
        Ok(rows)
    }
}

impl Raytracer for StraightRay {
    fn trace(
        &self,
        grid: &Grid3d,
        slowness: &[f64],
        sources: &[RaySource],
        receivers: &[[f64; 3]],
    ) -> Result<RayField, Error> {
        let rows = self.trace_batch(grid, slowness, sources, receivers, true)?;

        // Group batch indices by exact source coordinates, keeping
        // first-appearance order.
        let mut groups: IndexMap<[u64; 3], Vec<usize>> = IndexMap::new();
        for (i, s) in sources.iter().enumerate() {
            let key = [
                s.pos[0].to_bits(),
                s.pos[1].to_bits(),
                s.pos[2].to_bits(),
            ];
            groups.entry(key).or_default().push(i);
        }

        let mut kernels = Vec::with_capacity(groups.len());
        for (_, batch_rows) in groups {
            let mut triplets = Vec::new();
            for (local, &i) in batch_rows.iter().enumerate() {
                for &(col, val) in &rows[i].contribs {
                    triplets.push(Triplet {
                        row: local,
                        col,
                        val,
                    });
                }
            }
            let block = SparseRowMat::try_new_from_triplets(
                batch_rows.len(),
                grid.n_nodes(),
                &triplets,
            )?;
            kernels.push(SensitivityGroup {
                rows: batch_rows,
                block,
            });
        }

        let mut times = Vec::with_capacity(rows.len());
        let mut paths = Vec::with_capacity(rows.len());
        let mut v0 = Vec::with_capacity(rows.len());
        for row in rows {
            times.push(row.time);
            paths.push(row.path);
            v0.push(row.v0);
        }
        Ok(RayField {
            times,
            paths,
            v0,
            kernels,
        })
    }

    fn trace_rays(
        &self,
        grid: &Grid3d,
        slowness: &[f64],
        sources: &[RaySource],
        receivers: &[[f64; 3]],
    ) -> Result<(Vec<f64>, Vec<Vec<[f64; 3]>>, Vec<f64>), Error> {
        let rows = self.trace_batch(grid, slowness, sources, receivers, false)?;
        let mut times = Vec::with_capacity(rows.len());
        let mut paths = Vec::with_capacity(rows.len());
        let mut v0 = Vec::with_capacity(rows.len());
        for row in rows {
            times.push(row.time);
            paths.push(row.path);
            v0.push(row.v0);
        }
        Ok((times, paths, v0))
    }

    fn travel_times(
        &self,
        grid: &Grid3d,
        slowness: &[f64],
        sources: &[RaySource],
        receivers: &[[f64; 3]],
    ) -> Result<Vec<f64>, Error> {
        let rows = self.trace_batch(grid, slowness, sources, receivers, false)?;
        Ok(rows.into_iter().map(|r| r.time).collect())
    }
}

/// Unit departure data of a traced ray: direction from the source toward the
/// second raypath point, and its length. `None` when the ray is degenerate.
pub(crate) fn departure(path: &[[f64; 3]], origin: [f64; 3]) -> Option<(V3, f64)> {
    if path.len() < 2 {
        return None;
    }
    let d = V3::from_array(path[1]) - V3::from_array(origin);
    let ds = d.magnitude();
    if ds > 0.0 { Some((d, ds)) } else { None }
}
