//! Input and output records for the locators and the joint inverter.

/// Seismic wave phase of an observation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    /// Compressional (first-arriving) wave.
    P,
    /// Shear wave.
    S,
}

/// A single-phase arrival-time observation.
#[derive(Clone, Copy, Debug)]
pub struct Arrival {
    /// Identifier of the event this pick belongs to.
    pub event: u32,
    /// Observed arrival time.
    pub time: f64,
    /// Zero-based index into the receiver table.
    pub receiver: usize,
}

/// A two-phase arrival-time observation.
#[derive(Clone, Copy, Debug)]
pub struct PhasedArrival {
    /// Identifier of the event this pick belongs to.
    pub event: u32,
    /// Observed arrival time.
    pub time: f64,
    /// Zero-based index into the receiver table.
    pub receiver: usize,
    /// Wave phase of the pick.
    pub phase: Phase,
}

/// Origin time and location of one seismic event.
///
/// Rows of the hypocenter table are updated in place across iterations.
/// No two events may share identical initial coordinates.
#[derive(Clone, Copy, Debug)]
pub struct Hypocenter {
    /// Event identifier, unique across the table.
    pub event: u32,
    /// Origin time.
    pub t0: f64,
    /// Easting.
    pub x: f64,
    /// Northing.
    pub y: f64,
    /// Elevation.
    pub z: f64,
}

impl Hypocenter {
    /// Create a hypocenter row.
    pub fn new(event: u32, t0: f64, x: f64, y: f64, z: f64) -> Self {
        Self { event, t0, x, y, z }
    }

    /// Spatial coordinates of the hypocenter.
    #[mutants::skip]
    pub fn position(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

/// An arrival from a source of known position and zero origin time.
///
/// Calibration data must be sorted by shot identifier first, then by
/// receiver index. The two-phase inverter only uses P-wave shots.
#[derive(Clone, Copy, Debug)]
pub struct CalibrationShot {
    /// Shot identifier.
    pub shot: u32,
    /// Observed arrival time.
    pub time: f64,
    /// Zero-based index into the receiver table.
    pub receiver: usize,
    /// Source easting.
    pub x: f64,
    /// Source northing.
    pub y: f64,
    /// Source elevation.
    pub z: f64,
    /// Wave phase of the pick.
    pub phase: Phase,
}

/// A known velocity value at a known location, used as a soft constraint.
#[derive(Clone, Copy, Debug)]
pub struct VelocityPoint {
    /// Velocity value at the point.
    pub v: f64,
    /// Easting.
    pub x: f64,
    /// Northing.
    pub y: f64,
    /// Elevation.
    pub z: f64,
    /// Which velocity model the point constrains.
    pub phase: Phase,
}

impl VelocityPoint {
    /// Spatial coordinates of the tie point.
    #[mutants::skip]
    pub fn position(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

/// Initial velocity model, either uniform or given node by node.
#[derive(Clone, Debug)]
pub enum InitialVelocity {
    /// The same velocity at every node.
    Uniform(f64),
    /// One velocity per grid node, in node-index order.
    Field(Vec<f64>),
}

impl InitialVelocity {
    /// Expand to one value per node, checking field length.
    pub(crate) fn expand(&self, nnodes: usize) -> Result<Vec<f64>, crate::Error> {
        match self {
            Self::Uniform(v) => Ok(vec![*v; nnodes]),
            Self::Field(v) => {
                if v.len() != nnodes {
                    return Err(crate::Error::ShapeMismatch {
                        what: "initial velocity field",
                        expected: nnodes,
                        actual: v.len(),
                    });
                }
                Ok(v.clone())
            }
        }
    }
}

impl From<f64> for InitialVelocity {
    fn from(v: f64) -> Self {
        Self::Uniform(v)
    }
}

impl From<Vec<f64>> for InitialVelocity {
    fn from(v: Vec<f64>) -> Self {
        Self::Field(v)
    }
}
