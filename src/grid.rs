//! Regular 3-D grids with cubic cells and their sparse operators.

use faer::sparse::{SparseColMat, Triplet};

use crate::Error;

/// Tolerance used when checking that grid steps are uniform and cubic.
const STEP_TOL: f64 = 1e-9;

/// A regular 3-D lattice with cubic cells.
///
/// Nodes are indexed by `(i, j, k)` along the x, y and z axes, linearized as
/// `(i * ny + j) * nz + k`.
#[derive(Debug)]
pub struct Grid3d {
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
    h: f64,
    nthreads: usize,
}

impl Grid3d {
    /// Build a grid from sorted node coordinates along each axis.
    ///
    /// All three axes must share the same uniform step (cubic cells), and each
    /// axis needs at least two nodes. `nthreads` is handed through to the
    /// raytracer untouched.
    pub fn new(x: Vec<f64>, y: Vec<f64>, z: Vec<f64>, nthreads: usize) -> Result<Self, Error> {
        let hx = axis_step(&x);
        let hy = axis_step(&y);
        let hz = axis_step(&z);
        let (Some(hx), Some(hy), Some(hz)) = (hx, hy, hz) else {
            return Err(Error::GridGeometry {
                hx: hx.unwrap_or(f64::NAN),
                hy: hy.unwrap_or(f64::NAN),
                hz: hz.unwrap_or(f64::NAN),
            });
        };
        let tol = STEP_TOL * libm::fmax(1.0, hx.abs());
        if (hx - hy).abs() > tol || (hx - hz).abs() > tol || hx <= 0.0 {
            return Err(Error::GridGeometry { hx, hy, hz });
        }
        Ok(Self {
            x,
            y,
            z,
            h: hx,
            nthreads: nthreads.max(1),
        })
    }

    /// Total number of grid nodes.
    pub fn n_nodes(&self) -> usize {
        self.x.len() * self.y.len() * self.z.len()
    }

    /// Node counts along x, y and z.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.x.len(), self.y.len(), self.z.len())
    }

    /// Cell size, identical along all axes.
    pub fn cell_size(&self) -> f64 {
        self.h
    }

    /// Thread count forwarded to the raytracer.
    #[mutants::skip]
    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    /// Linear index of node `(i, j, k)`.
    #[inline(always)]
    pub fn ind(&self, i: usize, j: usize, k: usize) -> usize {
        (i * self.y.len() + j) * self.z.len() + k
    }

    /// Coordinates of node `(i, j, k)`.
    pub fn node(&self, i: usize, j: usize, k: usize) -> [f64; 3] {
        [self.x[i], self.y[j], self.z[k]]
    }

    /// Is the point outside the grid bounds?
    pub fn is_outside(&self, p: [f64; 3]) -> bool {
        p[0] < self.x[0]
            || p[0] > *self.x.last().unwrap()
            || p[1] < self.y[0]
            || p[1] > *self.y.last().unwrap()
            || p[2] < self.z[0]
            || p[2] > *self.z.last().unwrap()
    }

    /// Is at least one point of the batch outside the grid bounds?
    pub fn any_outside(&self, points: &[[f64; 3]]) -> bool {
        points.iter().any(|p| self.is_outside(*p))
    }

    /// First point of the batch outside the grid, if any.
    pub(crate) fn check_inside(&self, pts: &[[f64; 3]]) -> Result<(), Error> {
        for p in pts {
            if self.is_outside(*p) {
                return Err(Error::PointOutsideGrid {
                    x: p[0],
                    y: p[1],
                    z: p[2],
                });
            }
        }
        Ok(())
    }

    /// Corner node indices and trilinear weights of the cell enclosing `p`.
    ///
    /// Assumes `p` is inside the grid. Points on the upper boundary fall into
    /// the last cell along that axis.
    pub(crate) fn cell_weights(&self, p: [f64; 3]) -> ([usize; 8], [f64; 8]) {
        let i1 = lower_cell_index(p[0], self.x[0], self.h, self.x.len());
        let j1 = lower_cell_index(p[1], self.y[0], self.h, self.y.len());
        let k1 = lower_cell_index(p[2], self.z[0], self.h, self.z.len());

        let mut nodes = [0usize; 8];
        let mut weights = [0.0f64; 8];
        let mut c = 0;
        for i in [i1, i1 + 1] {
            for j in [j1, j1 + 1] {
                for k in [k1, k1 + 1] {
                    nodes[c] = self.ind(i, j, k);
                    weights[c] = (1.0 - (p[0] - self.x[i]).abs() / self.h)
                        * (1.0 - (p[1] - self.y[j]).abs() / self.h)
                        * (1.0 - (p[2] - self.z[k]).abs() / self.h);
                    c += 1;
                }
            }
        }
        (nodes, weights)
    }

    /// Trilinear interpolation matrix for a batch of query points.
    ///
    /// The result has one row per point with exactly 8 entries, the weights of
    /// the corners of the enclosing cell. Fails with [`Error::PointOutsideGrid`]
    /// if any point is out of bounds.
    pub fn interp_matrix(&self, pts: &[[f64; 3]]) -> Result<SparseColMat<usize, f64>, Error> {
        self.check_inside(pts)?;
        let mut triplets = Vec::with_capacity(8 * pts.len());
        for (row, p) in pts.iter().enumerate() {
            let (nodes, weights) = self.cell_weights(*p);
            for c in 0..8 {
                triplets.push(Triplet {
                    row,
                    col: nodes[c],
                    val: weights[c],
                });
            }
        }
        Ok(SparseColMat::try_new_from_triplets(
            pts.len(),
            self.n_nodes(),
            &triplets,
        )?)
    }

    /// Second-derivative smoothing matrices along x, y and z.
    ///
    /// Each is `N x N` with 3 entries per row holding the `[1, -2, 1] / h^2`
    /// stencil, forward at the first plane, backward at the last plane and
    /// centered in between. Needs at least 3 nodes per axis.
    pub fn smoothing_matrices(
        &self,
    ) -> Result<
        (
            SparseColMat<usize, f64>,
            SparseColMat<usize, f64>,
            SparseColMat<usize, f64>,
        ),
        Error,
    > {
        let (nx, ny, nz) = self.shape();
        if nx < 3 || ny < 3 || nz < 3 {
            return Err(Error::GridGeometry {
                hx: self.h,
                hy: self.h,
                hz: self.h,
            });
        }
        let kx = self.second_derivative(Axis::X)?;
        let ky = self.second_derivative(Axis::Y)?;
        let kz = self.second_derivative(Axis::Z)?;
        Ok((kx, ky, kz))
    }

    fn second_derivative(&self, axis: Axis) -> Result<SparseColMat<usize, f64>, Error> {
        let (nx, ny, nz) = self.shape();
        let n = self.n_nodes();
        let n_axis = match axis {
            Axis::X => nx,
            Axis::Y => ny,
            Axis::Z => nz,
        };
        let inv_h2 = 1.0 / (self.h * self.h);
        let mut triplets = Vec::with_capacity(3 * n);
        for i in 0..nx {
            for j in 0..ny {
                for k in 0..nz {
                    let row = self.ind(i, j, k);
                    let c = match axis {
                        Axis::X => i,
                        Axis::Y => j,
                        Axis::Z => k,
                    };
                    // Forward stencil at the lower edge, backward at the
                    // upper edge, centered otherwise.
                    let base = if c == 0 {
                        0
                    } else if c == n_axis - 1 {
                        n_axis - 3
                    } else {
                        c - 1
                    };
                    for (s, w) in [(base, 1.0), (base + 1, -2.0), (base + 2, 1.0)] {
                        let col = match axis {
                            Axis::X => self.ind(s, j, k),
                            Axis::Y => self.ind(i, s, k),
                            Axis::Z => self.ind(i, j, s),
                        };
                        triplets.push(Triplet {
                            row,
                            col,
                            val: w * inv_h2,
                        });
                    }
                }
            }
        }
        Ok(SparseColMat::try_new_from_triplets(n, n, &triplets)?)
    }
}

#[derive(Clone, Copy)]
enum Axis {
    X,
    Y,
    Z,
}

/// Uniform step of a sorted coordinate axis, or `None` if the axis is too
/// short or unevenly spaced.
fn axis_step(axis: &[f64]) -> Option<f64> {
    if axis.len() < 2 {
        return None;
    }
    let h = axis[1] - axis[0];
    let tol = STEP_TOL * libm::fmax(1.0, h.abs());
    for w in axis.windows(2) {
        if ((w[1] - w[0]) - h).abs() > tol {
            return None;
        }
    }
    Some(h)
}

/// Index of the lower corner of the cell containing coordinate `v`, clamped
/// so the upper grid boundary maps to the last cell.
#[inline(always)]
fn lower_cell_index(v: f64, origin: f64, h: f64, n: usize) -> usize {
    let i = ((v - origin) / h + 1e-6).floor() as usize;
    i.min(n - 2)
}
