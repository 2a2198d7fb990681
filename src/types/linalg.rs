//! Fixed-size linear algebra aliases shared across the estimator.

use nalgebra::{SMatrix, SVector};

/// Dimension of the IMU preintegration error state (δφ, δv, δp, δb_g, δb_a).
pub const STATE_DIM_15: usize = 15;

pub type StateVec15 = SVector<f64, STATE_DIM_15>;
pub type StateMat15 = SMatrix<f64, STATE_DIM_15, STATE_DIM_15>;

/// Bias Jacobian block: 9 rows (rotation, velocity, position) x 6
/// columns (b_g, b_a), as named in spec.md §9.
pub type BiasJacobian9x6 = SMatrix<f64, 9, 6>;
