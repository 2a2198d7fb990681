//! Multi-scan (window) registration (spec.md §4.3.1): keeps the last N
//! `ScanPose`s, registers each incoming scan against its nearest
//! neighbors, and drops scans older than `lag_duration`.

use nalgebra::{Isometry3, Matrix6};

use crate::transaction::{Constraint, SourceTag, Transaction, VariableId, VariableValue};
use crate::types::ScanPose;

use super::matcher::{Matcher, MatcherOutcome};
use super::LidarFrontEnd;

pub struct MultiScanConfig {
    pub num_neighbors: usize,
    pub outlier_threshold_t: f64,
    pub outlier_threshold_r: f64,
    pub min_motion_trans_m: f64,
    pub min_motion_rot_rad: f64,
    pub lag_duration: f64,
    pub fix_first_scan: bool,
    pub lidar_information_weight: f64,
}

pub struct MultiScanRegistration<M: Matcher> {
    cfg: MultiScanConfig,
    matcher: M,
    window: Vec<ScanPose>,
    seeded_prior: bool,
}

impl<M: Matcher> MultiScanRegistration<M> {
    pub fn new(cfg: MultiScanConfig, matcher: M) -> Self {
        Self {
            cfg,
            matcher,
            window: Vec::new(),
            seeded_prior: false,
        }
    }

    fn relative_pose_delta(a: &Isometry3<f64>, b: &Isometry3<f64>) -> (f64, f64) {
        let rel = a.inverse() * b;
        let trans = rel.translation.vector.norm();
        let rot = rel.rotation.angle();
        (trans, rot)
    }
}

impl<M: Matcher> LidarFrontEnd for MultiScanRegistration<M> {
    fn register(&mut self, scan: ScanPose) -> Transaction {
        let mut txn = Transaction::default();

        if scan.points.is_empty() {
            return txn;
        }
        if let Some(prev) = self.window.last() {
            let (trans, rot) = Self::relative_pose_delta(&prev.pose, &scan.pose);
            if trans < self.cfg.min_motion_trans_m && rot < self.cfg.min_motion_rot_rad {
                return txn;
            }
        }

        txn.variables
            .push((VariableId::pose(scan.stamp), VariableValue::Pose(scan.pose)));

        if self.window.is_empty() {
            // No neighbors are available to register against, whether
            // this is truly the first scan or `lag_duration` just
            // evicted the whole window — either way the scan needs a
            // prior or it never enters the graph at all. `seeded_prior`
            // (not the transient `window.is_empty()`) decides whether
            // this is the one genuine gauge-fixing prior or a looser
            // re-anchor after a window gap.
            let covariance_diag = if self.cfg.fix_first_scan && !self.seeded_prior {
                [1e-6; 6]
            } else {
                [1e-2; 6]
            };
            txn.constraints.push(Constraint::Prior {
                variable: VariableId::pose(scan.stamp),
                value: VariableValue::Pose(scan.pose),
                covariance_diag,
            });
            self.seeded_prior = true;
        } else {
            let neighbors: Vec<&ScanPose> = self
                .window
                .iter()
                .rev()
                .take(self.cfg.num_neighbors)
                .collect();
            let mut accepted_any = false;
            for neighbor in neighbors {
                let initial_guess = neighbor.pose.inverse() * scan.pose;
                self.matcher.set_ref(&neighbor.points);
                self.matcher.set_target(&scan.points);
                if self.matcher.run_match(initial_guess) != MatcherOutcome::Converged {
                    continue;
                }
                let relative = self.matcher.result();
                let rel_to_guess = initial_guess.inverse() * relative;
                if rel_to_guess.translation.vector.norm() > self.cfg.outlier_threshold_t
                    || rel_to_guess.rotation.angle() > self.cfg.outlier_threshold_r
                {
                    continue;
                }
                accepted_any = true;
                let covariance = Matrix6::identity() / self.cfg.lidar_information_weight.max(1e-9);
                txn.constraints.push(Constraint::RelativePose {
                    from: VariableId::pose(neighbor.stamp),
                    to: VariableId::pose(scan.stamp),
                    relative,
                    covariance,
                    source: SourceTag::LidarRelative,
                });
            }
            if !accepted_any {
                return Transaction::default();
            }
        }

        self.window.push(scan);
        if self.cfg.lag_duration > 0.0 {
            let newest = self.window.last().unwrap().stamp;
            self.window.retain(|s| newest - s.stamp <= self.cfg.lag_duration);
        }
        txn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lidar::IcpMatcher;
    use nalgebra::{Point3, Translation3, UnitQuaternion};

    /// A fixed set of world-frame landmarks, expressed in the local
    /// frame of `pose` (as a real scan's points would be).
    fn cloud(pose: &Isometry3<f64>) -> Vec<Point3<f64>> {
        (0..40)
            .map(|i| pose.inverse() * Point3::new(i as f64 * 0.1, (i as f64 * 0.2).sin(), 0.0))
            .collect()
    }

    fn cfg() -> MultiScanConfig {
        MultiScanConfig {
            num_neighbors: 3,
            outlier_threshold_t: 0.3,
            outlier_threshold_r: 0.3,
            min_motion_trans_m: 0.01,
            min_motion_rot_rad: 0.01,
            lag_duration: 0.0,
            fix_first_scan: true,
            lidar_information_weight: 100.0,
        }
    }

    #[test]
    fn first_scan_gets_a_prior() {
        let mut reg = MultiScanRegistration::new(cfg(), IcpMatcher::new(0.5));
        let scan = ScanPose::new(0.0, Isometry3::identity(), cloud(&Isometry3::identity()));
        let txn = reg.register(scan);
        assert!(txn
            .constraints
            .iter()
            .any(|c| matches!(c, Constraint::Prior { .. })));
    }

    #[test]
    fn empty_cloud_is_refused() {
        let mut reg = MultiScanRegistration::new(cfg(), IcpMatcher::new(0.5));
        let scan = ScanPose::new(0.0, Isometry3::identity(), vec![]);
        assert!(reg.register(scan).is_empty());
    }

    #[test]
    fn three_scans_with_three_neighbors_produce_expected_constraint_count() {
        let mut reg = MultiScanRegistration::new(cfg(), IcpMatcher::new(0.5));
        let poses = [
            Isometry3::identity(),
            Isometry3::from_parts(Translation3::new(0.5, 0.0, 0.0), UnitQuaternion::identity()),
            Isometry3::from_parts(Translation3::new(1.0, 0.0, 0.0), UnitQuaternion::identity()),
        ];
        let mut total_relative = 0usize;
        for (i, pose) in poses.iter().enumerate() {
            let scan = ScanPose::new(i as f64, *pose, cloud(pose));
            let txn = reg.register(scan);
            total_relative += txn
                .constraints
                .iter()
                .filter(|c| matches!(c, Constraint::RelativePose { .. }))
                .count();
        }
        // scan 0: 0 neighbors, scan 1: 1 neighbor, scan 2: 2 neighbors
        assert_eq!(total_relative, 0 + 1 + 2);
    }

    #[test]
    fn scan_after_window_eviction_still_gets_a_constraint() {
        // Simulates the state a `lag_duration` eviction leaves behind:
        // a prior has already been seeded once, but the window is
        // momentarily empty with no neighbors to register against.
        let mut reg = MultiScanRegistration::new(cfg(), IcpMatcher::new(0.5));
        reg.seeded_prior = true;
        assert!(reg.window.is_empty());

        let pose = Isometry3::from_parts(Translation3::new(20.0, 0.0, 0.0), UnitQuaternion::identity());
        let txn = reg.register(ScanPose::new(20.0, pose, cloud(&pose)));
        assert!(!txn.variables.is_empty());
        assert!(txn
            .constraints
            .iter()
            .any(|c| matches!(c, Constraint::Prior { .. })));
    }
}
