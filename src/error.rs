use faer::{linalg::svd::SvdError, sparse::CreationError};

/// All errors that could occur when building a grid or running an inversion.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Grid axes do not form cubic cells.
    #[error(
        "grid cells must be cubic: step is {hx} along x, {hy} along y, {hz} along z"
    )]
    GridGeometry {
        /// Step along the x axis.
        hx: f64,
        /// Step along the y axis.
        hy: f64,
        /// Step along the z axis.
        hz: f64,
    },
    /// A source, receiver, tie point or trial hypocenter lies outside the grid.
    #[error("point ({x}, {y}, {z}) is outside the grid")]
    PointOutsideGrid {
        /// Easting of the offending point.
        x: f64,
        /// Northing of the offending point.
        y: f64,
        /// Elevation of the offending point.
        z: f64,
    },
    /// Input arrays have incompatible dimensions or refer to missing entries.
    #[error("shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Which input failed validation.
        what: &'static str,
        /// The size or index bound that was expected.
        expected: usize,
        /// The size or index that was provided.
        actual: usize,
    },
    /// In Vs/Vp mode every S tie point needs a collocated P tie point.
    #[error("S tie point at ({x}, {y}, {z}) has no collocated P tie point")]
    InvalidTiePoint {
        /// Easting of the S tie point.
        x: f64,
        /// Northing of the S tie point.
        y: f64,
        /// Elevation of the S tie point.
        z: f64,
    },
    /// Faer could not create a sparse matrix.
    #[error("could not create sparse matrix: {0}")]
    Matrix(#[from] CreationError),
    /// Faer could not compute a singular value decomposition.
    #[error("singular value decomposition failed")]
    Svd(SvdError),
}
