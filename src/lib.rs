#![doc = include_str!("../README.md")]

pub use crate::datatypes::{
    Arrival, CalibrationShot, Hypocenter, InitialVelocity, Phase, PhasedArrival, VelocityPoint,
};
pub use crate::error::Error;
pub use crate::grid::Grid3d;
pub use crate::locate::{LocatedEvents, hypoloc, hypoloc_ps};
pub use crate::raytrace::{RayField, RaySource, Raytracer, SensitivityGroup, StraightRay};
pub use crate::solver::{
    InvParams, Inversion, InversionPs, LsqrResult, LsqrStop, StepCaps, VelocityBounds, Weights,
    joint_hypo_vel, joint_hypo_vel_ps, solve_lsqr,
};

/// Input and output records.
pub mod datatypes;
mod error;
/// Grids with cubic cells and their sparse operators.
pub mod grid;
/// Constant-velocity locators used to seed the joint inversion.
mod locate;
/// Small dense least-squares steps.
mod lstsq;
/// The raytracer interface and the straight-ray reference tracer.
pub mod raytrace;
/// The joint inverter and its helpers.
mod solver;
/// Unit and scenario tests.
#[cfg(test)]
mod tests;
mod vector;
