//! Geometry primitives and the per-tick position solver.

mod geometry;
mod solver;

pub use geometry::{circle_circle_intersection, intersect_three_spheres};
pub use solver::{DualSolution, PositionSolver, SolverSettings, ALERT_2D, ALERT_3D};
