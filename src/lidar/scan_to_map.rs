//! Scan-to-map registration (spec.md §4.3.2): a rolling point-cloud map
//! built from the most recent `map_size` scans, each incoming scan
//! registered against the whole map rather than individual neighbors.

use nalgebra::{Isometry3, Matrix6, Point3};

use crate::transaction::{Constraint, SourceTag, Transaction, VariableId, VariableValue};
use crate::types::ScanPose;

use super::matcher::{Matcher, MatcherOutcome};
use super::LidarFrontEnd;

pub struct ScanToMapConfig {
    pub map_size: usize,
    pub outlier_threshold_t: f64,
    pub outlier_threshold_r: f64,
    pub lidar_information_weight: f64,
}

struct MapEntry {
    stamp: f64,
    pose: Isometry3<f64>,
    points_map_frame: Vec<Point3<f64>>,
}

pub struct ScanToMapRegistration<M: Matcher> {
    cfg: ScanToMapConfig,
    matcher: M,
    entries: Vec<MapEntry>,
}

impl<M: Matcher> ScanToMapRegistration<M> {
    pub fn new(cfg: ScanToMapConfig, matcher: M) -> Self {
        Self {
            cfg,
            matcher,
            entries: Vec::new(),
        }
    }

    fn map_points(&self) -> Vec<Point3<f64>> {
        self.entries.iter().flat_map(|e| e.points_map_frame.iter().copied()).collect()
    }
}

impl<M: Matcher> LidarFrontEnd for ScanToMapRegistration<M> {
    fn register(&mut self, scan: ScanPose) -> Transaction {
        let mut txn = Transaction::default();
        if scan.points.is_empty() {
            return txn;
        }

        txn.variables
            .push((VariableId::pose(scan.stamp), VariableValue::Pose(scan.pose)));

        if self.entries.is_empty() {
            txn.constraints.push(Constraint::Prior {
                variable: VariableId::pose(scan.stamp),
                value: VariableValue::Pose(scan.pose),
                covariance_diag: [1e-6; 6],
            });
            self.entries.push(MapEntry {
                stamp: scan.stamp,
                pose: scan.pose,
                points_map_frame: scan.points.iter().map(|p| scan.pose * p).collect(),
            });
            return txn;
        }

        let map_points = self.map_points();
        let prev = self.entries.last().unwrap();
        let initial_guess = prev.pose.inverse() * scan.pose;

        // `set_ref` points are already expressed in the map frame, so
        // the matcher recovers T_map_scan directly.
        self.matcher.set_ref(&map_points);
        self.matcher.set_target(&scan.points);
        if self.matcher.run_match(scan.pose) != MatcherOutcome::Converged {
            return Transaction::default();
        }
        let t_map_scan = self.matcher.result();
        let relative = prev.pose.inverse() * t_map_scan;
        let guess_diff = initial_guess.inverse() * relative;
        if guess_diff.translation.vector.norm() > self.cfg.outlier_threshold_t
            || guess_diff.rotation.angle() > self.cfg.outlier_threshold_r
        {
            return Transaction::default();
        }

        let covariance = Matrix6::identity() / self.cfg.lidar_information_weight.max(1e-9);
        txn.constraints.push(Constraint::RelativePose {
            from: VariableId::pose(prev.stamp),
            to: VariableId::pose(scan.stamp),
            relative,
            covariance,
            source: SourceTag::LidarRelative,
        });

        self.entries.push(MapEntry {
            stamp: scan.stamp,
            pose: t_map_scan,
            points_map_frame: scan.points.iter().map(|p| t_map_scan * p).collect(),
        });
        if self.entries.len() > self.cfg.map_size {
            let drop_count = self.entries.len() - self.cfg.map_size;
            self.entries.drain(0..drop_count);
        }
        txn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lidar::IcpMatcher;
    use nalgebra::Translation3;

    fn cloud(offset: f64) -> Vec<Point3<f64>> {
        (0..60)
            .map(|i| Point3::new(i as f64 * 0.1 + offset, (i as f64 * 0.15).cos(), 0.0))
            .collect()
    }

    fn cfg() -> ScanToMapConfig {
        ScanToMapConfig {
            map_size: 5,
            outlier_threshold_t: 0.5,
            outlier_threshold_r: 0.5,
            lidar_information_weight: 100.0,
        }
    }

    #[test]
    fn first_scan_seeds_prior_and_map() {
        let mut reg = ScanToMapRegistration::new(cfg(), IcpMatcher::new(0.5));
        let scan = ScanPose::new(0.0, Isometry3::identity(), cloud(0.0));
        let txn = reg.register(scan);
        assert!(txn
            .constraints
            .iter()
            .any(|c| matches!(c, Constraint::Prior { .. })));
        assert_eq!(reg.entries.len(), 1);
    }

    #[test]
    fn map_is_trimmed_to_configured_size() {
        let mut reg = ScanToMapRegistration::new(cfg(), IcpMatcher::new(1.0));
        for i in 0..8 {
            let pose = Isometry3::from_parts(
                Translation3::new(i as f64 * 0.2, 0.0, 0.0),
                nalgebra::UnitQuaternion::identity(),
            );
            let scan = ScanPose::new(i as f64, pose, cloud(i as f64 * 0.2));
            reg.register(scan);
        }
        assert!(reg.entries.len() <= cfg().map_size);
    }
}
