//! LSQR, the Paige-Saunders iterative solver for sparse least squares.

use faer::{Col, sparse::SparseColMatRef};

/// Why LSQR stopped.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LsqrStop {
    /// The right-hand side is zero; the solution is zero.
    ZeroRhs,
    /// `Ax = b` is satisfied to within `atol`/`btol`.
    Residual,
    /// The least-squares optimality condition holds to within `atol`.
    LeastSquares,
    /// The condition number estimate exceeded `conlim`.
    ConditionLimit,
    /// Machine precision was reached before the tolerances.
    MachinePrecision,
    /// The iteration limit was reached.
    IterLimit,
}

/// Solution report of one LSQR run.
pub struct LsqrResult {
    /// The approximate solution.
    pub x: Col<f64>,
    /// Stopping condition.
    pub stop: LsqrStop,
    /// Number of iterations performed.
    pub iterations: usize,
}

/// Relative tolerance on the residual and right-hand side.
const ATOL: f64 = 1e-6;
/// Relative tolerance on the residual norm.
const BTOL: f64 = 1e-6;
/// Condition number limit.
const CONLIM: f64 = 1e8;

/// Solve `A x ~= b` by Golub-Kahan bidiagonalization.
///
/// Tolerances follow the reference implementation defaults, with the
/// iteration limit at twice the column count. Deterministic for identical
/// inputs.
pub fn lsqr(a: SparseColMatRef<'_, usize, f64>, b: &[f64]) -> LsqrResult {
    let n = a.ncols();
    let iter_lim = 2 * n;
    let ctol = 1.0 / CONLIM;

    let mut x = Col::<f64>::zeros(n);

    let mut u = Col::from_fn(b.len(), |i| b[i]);
    let bnorm = u.norm_l2();
    if bnorm == 0.0 {
        return LsqrResult {
            x,
            stop: LsqrStop::ZeroRhs,
            iterations: 0,
        };
    }
    scale(&mut u, 1.0 / bnorm);
    let mut beta = bnorm;

    let mut v: Col<f64> = a.transpose() * u.as_ref();
    let mut alfa = v.norm_l2();
    if alfa > 0.0 {
        scale(&mut v, 1.0 / alfa);
    }
    let mut w = v.to_owned();

    if alfa * beta == 0.0 {
        return LsqrResult {
            x,
            stop: LsqrStop::ZeroRhs,
            iterations: 0,
        };
    }

    let mut rhobar = alfa;
    let mut phibar = beta;
    let mut anorm = 0.0f64;
    let mut ddnorm = 0.0f64;
    let mut xxnorm = 0.0f64;
    let mut z = 0.0f64;
    let mut cs2 = -1.0f64;
    let mut sn2 = 0.0f64;

    let mut itn = 0usize;
    let mut stop = LsqrStop::IterLimit;

    while itn < iter_lim {
        itn += 1;

        // Continue the bidiagonalization: u = A v - alfa u, v = A' u - beta v.
        let av: Col<f64> = a * v.as_ref();
        for (ui, avi) in u.iter_mut().zip(av.iter()) {
            *ui = avi - alfa * *ui;
        }
        beta = u.norm_l2();
        if beta > 0.0 {
            scale(&mut u, 1.0 / beta);
            anorm = (anorm * anorm + alfa * alfa + beta * beta).sqrt();
            let atu: Col<f64> = a.transpose() * u.as_ref();
            for (vi, atui) in v.iter_mut().zip(atu.iter()) {
                *vi = atui - beta * *vi;
            }
            alfa = v.norm_l2();
            if alfa > 0.0 {
                scale(&mut v, 1.0 / alfa);
            }
        }

        // Plane rotation to eliminate the subdiagonal element.
        let rho = (rhobar * rhobar + beta * beta).sqrt();
        let cs = rhobar / rho;
        let sn = beta / rho;
        let theta = sn * alfa;
        rhobar = -cs * alfa;
        let phi = cs * phibar;
        phibar *= sn;
        let tau = sn * phi;

        // Update x and the search direction.
        let t1 = phi / rho;
        let t2 = -theta / rho;
        for i in 0..n {
            let wi = w[i];
            x[i] += t1 * wi;
            w[i] = v[i] + t2 * wi;
            ddnorm += (wi / rho) * (wi / rho);
        }

        // Norm estimates.
        let delta = sn2 * rho;
        let gambar = -cs2 * rho;
        let rhs = phi - delta * z;
        let zbar = rhs / gambar;
        let xnorm = (xxnorm + zbar * zbar).sqrt();
        let gamma = (gambar * gambar + theta * theta).sqrt();
        cs2 = gambar / gamma;
        sn2 = theta / gamma;
        z = rhs / gamma;
        xxnorm += z * z;

        let acond = anorm * ddnorm.sqrt();
        let rnorm = phibar;
        let arnorm = alfa * tau.abs();

        let test1 = rnorm / bnorm;
        let test2 = if anorm * rnorm > 0.0 {
            arnorm / (anorm * rnorm)
        } else {
            f64::INFINITY
        };
        let test3 = 1.0 / acond;
        let t1b = test1 / (1.0 + anorm * xnorm / bnorm);
        let rtol = BTOL + ATOL * anorm * xnorm / bnorm;

        if itn >= iter_lim {
            stop = LsqrStop::IterLimit;
            break;
        }
        if 1.0 + test3 <= 1.0 {
            stop = LsqrStop::MachinePrecision;
            break;
        }
        if 1.0 + test2 <= 1.0 {
            stop = LsqrStop::MachinePrecision;
            break;
        }
        if 1.0 + t1b <= 1.0 {
            stop = LsqrStop::MachinePrecision;
            break;
        }
        if test3 <= ctol {
            stop = LsqrStop::ConditionLimit;
            break;
        }
        if test2 <= ATOL {
            stop = LsqrStop::LeastSquares;
            break;
        }
        if test1 <= rtol {
            stop = LsqrStop::Residual;
            break;
        }
    }

    LsqrResult {
        x,
        stop,
        iterations: itn,
    }
}

fn scale(c: &mut Col<f64>, s: f64) {
    for v in c.iter_mut() {
        *v *= s;
    }
}
