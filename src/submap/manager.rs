//! Submap creation and measurement routing (spec.md §4.5).

use nalgebra::{Matrix6, Point3};

use crate::transaction::{Constraint, SourceTag, Transaction, VariableId, VariableValue};
use crate::types::{Pose3, Submap};

pub struct SubmapManagerConfig {
    pub submap_size: f64,
    pub local_mapper_covariance_diag: [f64; 6],
}

/// Owns every submap ever created (online) and routes incoming
/// trajectory updates and sensor measurements into the right one.
pub struct SubmapManager {
    cfg: SubmapManagerConfig,
    submaps: Vec<Submap>,
}

impl SubmapManager {
    pub fn new(cfg: SubmapManagerConfig) -> Self {
        Self { cfg, submaps: Vec::new() }
    }

    pub fn submaps(&self) -> &[Submap] {
        &self.submaps
    }

    pub fn submap(&self, index: usize) -> Option<&Submap> {
        self.submaps.get(index)
    }

    fn local_mapper_covariance(&self) -> Matrix6<f64> {
        Matrix6::from_diagonal(&nalgebra::Vector6::from_row_slice(&self.cfg.local_mapper_covariance_diag))
    }

    /// Consults the current trajectory position; creates a new submap
    /// when it exceeds `submap_size` from both the previous and
    /// current anchor (spec.md §4.5).
    pub fn on_trajectory_update(&mut self, stamp: f64, pose: Pose3) -> Transaction {
        let mut txn = Transaction::default();
        let position = Point3::from(pose.translation.vector);

        let exceeds_current = self.submaps.last().map(|s| s.distance_to(&position) > self.cfg.submap_size).unwrap_or(true);
        let exceeds_previous = if self.submaps.len() >= 2 {
            self.submaps[self.submaps.len() - 2].distance_to(&position) > self.cfg.submap_size
        } else {
            true
        };

        if !exceeds_current {
            return txn;
        }
        if !self.submaps.is_empty() && !exceeds_previous {
            return txn;
        }

        let index = self.submaps.len();
        let submap = Submap::new(index, stamp, pose);
        txn.variables
            .push((VariableId::pose(stamp), VariableValue::Pose(pose)));

        if let Some(prev) = self.submaps.last() {
            txn.constraints.push(Constraint::RelativePose {
                from: VariableId::pose(prev.anchor_keyframe_stamp),
                to: VariableId::pose(stamp),
                relative: prev.anchor_current.inverse() * pose,
                covariance: self.local_mapper_covariance(),
                source: SourceTag::SubmapRelative,
            });
        } else {
            txn.constraints.push(Constraint::Prior {
                variable: VariableId::pose(stamp),
                value: VariableValue::Pose(pose),
                covariance_diag: self.cfg.local_mapper_covariance_diag,
            });
        }

        self.submaps.push(submap);
        txn
    }

    /// Picks the submap a measurement at `position` belongs to,
    /// preferring the previous submap when both the previous and
    /// current anchor are within range (spec.md §8 "Submap
    /// assignment").
    pub fn assign(&self, position: &Point3<f64>) -> Option<usize> {
        if self.submaps.is_empty() {
            return None;
        }
        let last = self.submaps.len() - 1;
        if self.submaps.len() >= 2 {
            let prev = last - 1;
            if self.submaps[prev].distance_to(position) <= self.cfg.submap_size {
                return Some(prev);
            }
        }
        if self.submaps[last].distance_to(position) <= self.cfg.submap_size {
            return Some(last);
        }
        None
    }

    pub fn append_keyframe(&mut self, index: usize, keyframe: crate::types::Keyframe) {
        if let Some(s) = self.submaps.get_mut(index) {
            s.keyframes.push(keyframe);
        }
    }

    pub fn append_lidar_points(&mut self, index: usize, points: &[Point3<f64>]) {
        if let Some(s) = self.submaps.get_mut(index) {
            s.lidar_points.extend_from_slice(points);
        }
    }

    pub fn update_anchor(&mut self, index: usize, pose: Pose3) {
        if let Some(s) = self.submaps.get_mut(index) {
            s.anchor_current = pose;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Isometry3, Translation3, UnitQuaternion};

    fn cfg() -> SubmapManagerConfig {
        SubmapManagerConfig {
            submap_size: 10.0,
            local_mapper_covariance_diag: [0.05; 6],
        }
    }

    fn pose_at(x: f64) -> Pose3 {
        Isometry3::from_parts(Translation3::new(x, 0.0, 0.0), UnitQuaternion::identity())
    }

    #[test]
    fn first_update_creates_submap_with_prior() {
        let mut mgr = SubmapManager::new(cfg());
        let txn = mgr.on_trajectory_update(0.0, pose_at(0.0));
        assert_eq!(mgr.submaps().len(), 1);
        assert!(txn.constraints.iter().any(|c| matches!(c, Constraint::Prior { .. })));
    }

    #[test]
    fn straight_line_50m_yields_five_submaps() {
        let mut mgr = SubmapManager::new(cfg());
        for i in 0..=50 {
            mgr.on_trajectory_update(i as f64, pose_at(i as f64));
        }
        assert_eq!(mgr.submaps().len(), 5);
    }

    #[test]
    fn assignment_prefers_previous_submap_in_overlap() {
        let mut mgr = SubmapManager::new(cfg());
        for i in 0..=20 {
            mgr.on_trajectory_update(i as f64, pose_at(i as f64));
        }
        let overlap_point = Point3::new(9.0, 0.0, 0.0);
        let assigned = mgr.assign(&overlap_point).unwrap();
        assert_eq!(assigned, mgr.submaps().len() - 2);
    }
}
