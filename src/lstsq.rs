//! Small dense Gauss-Newton steps shared by the locators and the relocator.

use faer::{Col, Mat, prelude::Solve};

/// Tikhonov ridge added before the pseudo-inverse fallback.
const RIDGE: f64 = 1e-9;

/// Solve the normal equations `(H^T H) dh = H^T r`.
///
/// Falls back to an SVD pseudo-inverse of the ridged normal matrix when the
/// direct solve produces non-finite values. `None` means the step is
/// degenerate and the caller should give up on this event.
pub(crate) fn gauss_newton_step(h: &Mat<f64>, r: &Col<f64>) -> Option<Col<f64>> {
    let ht = h.transpose().to_owned();
    let hth = &ht * h;
    let htr = &ht * r;
    let dh = hth.full_piv_lu().solve(&htr);
    if dh.iter().all(|v| v.is_finite()) {
        return Some(dh);
    }
    pseudo_inverse_step(&hth, &htr)
}

fn pseudo_inverse_step(hth: &Mat<f64>, htr: &Col<f64>) -> Option<Col<f64>> {
    let n = hth.nrows();
    let ridged = Mat::from_fn(n, n, |i, j| hth[(i, j)] + if i == j { RIDGE } else { 0.0 });
    let svd = ridged.svd().ok()?;
    let u = svd.U().to_owned();
    let s = svd.S().column_vector().to_owned();
    let v = svd.V().to_owned();
    let ut = u.transpose().to_owned();
    let uty = &ut * htr;
    let mut y = Col::zeros(n);
    for i in 0..n {
        y[i] = uty[i] / s[i];
    }
    let dh = &v * &y;
    let all_finite = dh.iter().all(|x| x.is_finite());
    all_finite.then_some(dh)
}
