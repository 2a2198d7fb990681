//! The atomic unit handed from any producer (front-end, initializer,
//! loop-closure engine) to the estimator (spec.md §3, §9).

use nalgebra::{Isometry3, Matrix6, Point3, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::imu::PreintegratedDelta;

/// Variable kind, keyed by (type, stamp) as spec.md §3 requires for
/// `FactorGraph` variables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableKind {
    Pose,
    Velocity,
    Bias,
    Landmark,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariableId {
    pub kind: VariableKind,
    /// For `Pose`/`Velocity`/`Bias`: the keyframe stamp, bit-cast to an
    /// integer key so it can be hashed. For `Landmark`: the landmark id.
    pub key: u64,
}

impl VariableId {
    pub fn pose(stamp: f64) -> Self {
        Self {
            kind: VariableKind::Pose,
            key: stamp.to_bits(),
        }
    }
    pub fn velocity(stamp: f64) -> Self {
        Self {
            kind: VariableKind::Velocity,
            key: stamp.to_bits(),
        }
    }
    pub fn bias(stamp: f64) -> Self {
        Self {
            kind: VariableKind::Bias,
            key: stamp.to_bits(),
        }
    }
    pub fn landmark(id: u64) -> Self {
        Self {
            kind: VariableKind::Landmark,
            key: id,
        }
    }

    pub fn stamp(&self) -> f64 {
        f64::from_bits(self.key)
    }
}

/// Value carried by a freshly-added variable; the estimator owns the
/// authoritative value after `apply`.
#[derive(Clone, Debug)]
pub enum VariableValue {
    Pose(Isometry3<f64>),
    Velocity(Vector3<f64>),
    Bias(Vector6<f64>),
    Landmark(Point3<f64>),
}

/// Where a constraint came from, for diagnostics and weighting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceTag {
    ImuPreintegration,
    Reprojection,
    LidarRelative,
    SubmapRelative,
    LoopClosure,
    Prior,
}

#[derive(Clone, Debug)]
pub enum Constraint {
    /// Links (q_i,p_i,v_i,b_g,b_a) to (q_j,p_j,v_j,b_g,b_a).
    Preintegrated {
        pose_i: VariableId,
        vel_i: VariableId,
        bias_i: VariableId,
        pose_j: VariableId,
        vel_j: VariableId,
        bias_j: VariableId,
        delta: PreintegratedDelta,
    },
    /// Reprojection of a landmark observed from a keyframe.
    Reprojection {
        pose: VariableId,
        landmark: VariableId,
        pixel: nalgebra::Point2<f64>,
        information_weight: f64,
    },
    /// A relative pose measurement between two pose variables (lidar
    /// registration, submap anchors, loop closure).
    RelativePose {
        from: VariableId,
        to: VariableId,
        relative: Isometry3<f64>,
        covariance: Matrix6<f64>,
        source: SourceTag,
    },
    /// A prior (absolute) constraint on a single variable.
    Prior {
        variable: VariableId,
        value: VariableValue,
        covariance_diag: [f64; 6],
    },
}

/// An atomic batch submitted to the estimator. Empty transactions are
/// equivalent to a no-op (spec.md §3).
#[derive(Clone, Debug, Default)]
pub struct Transaction {
    pub variables: Vec<(VariableId, VariableValue)>,
    pub constraints: Vec<Constraint>,
    pub tombstones: Vec<VariableId>,
    /// When true, applying this transaction replaces prior constraints
    /// referring to identical endpoints/source instead of duplicating
    /// them.
    pub override_constraints: bool,
    /// When true, applying this transaction replaces prior variable
    /// values for identical ids instead of erroring on a duplicate add.
    pub override_variables: bool,
}

impl Transaction {
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() && self.constraints.is_empty() && self.tombstones.is_empty()
    }

    pub fn merge(&mut self, other: Transaction) {
        self.variables.extend(other.variables);
        self.constraints.extend(other.constraints);
        self.tombstones.extend(other.tombstones);
        self.override_constraints |= other.override_constraints;
        self.override_variables |= other.override_variables;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_transaction_is_noop() {
        assert!(Transaction::default().is_empty());
    }

    #[test]
    fn variable_id_round_trips_stamp() {
        let v = VariableId::pose(3.14159);
        assert!((v.stamp() - 3.14159).abs() < 1e-12);
    }

    #[test]
    fn merge_accumulates_and_or_flags() {
        let mut a = Transaction::default();
        let mut b = Transaction::default();
        b.override_variables = true;
        b.tombstones.push(VariableId::pose(1.0));
        a.merge(b);
        assert!(a.override_variables);
        assert_eq!(a.tombstones.len(), 1);
    }
}
