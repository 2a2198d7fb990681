//! Trajectory initializer (spec.md §4.4): bootstraps metric state
//! either from an externally supplied path (preferred) or from a
//! pure-visual structure-from-motion chain, then solves for gravity,
//! metric scale, and initial biases against IMU preintegration before
//! handing a seeding `Transaction` to the main estimator.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Isometry3, Matrix3, Point2, Point3, Translation3, UnitQuaternion, Vector3};

use crate::config::InitMode;
use crate::error::{SlamError, SlamResult};
use crate::imu::PreintegratedDelta;
use crate::transaction::{Constraint, Transaction, VariableId, VariableValue};
use crate::types::{ImuState, LandmarkId};
use crate::vision::{triangulate_dlt, Intrinsics};

#[derive(Clone, Copy, Debug)]
pub struct InitializerConfig {
    pub init_mode: InitMode,
    /// Minimum spacing between accumulated candidate frames (spec.md
    /// §4.4 step 1 names a fixed 1 s gate; generalized here to a
    /// configured value so deployments can tune it — see DESIGN.md).
    pub candidate_frame_gate_s: f64,
    pub min_trajectory_length_m: f64,
    pub min_visual_parallax: f64,
    pub max_optimization_s: f64,
    pub sigma_prior: f64,
}

#[derive(Clone, Debug)]
pub struct PathPose {
    pub stamp: f64,
    pub pose: Isometry3<f64>,
}

#[derive(Clone, Copy, Debug)]
pub struct VisualObservation {
    pub stamp: f64,
    pub pixel: Point2<f64>,
}

#[derive(Clone, Debug)]
pub struct InitResult {
    pub success: bool,
    pub gravity: Vector3<f64>,
    pub keyframe_states: Vec<(f64, ImuState)>,
    pub landmark_positions: Vec<(LandmarkId, Point3<f64>)>,
    pub transaction: Transaction,
}

impl InitResult {
    fn failure() -> Self {
        Self {
            success: false,
            gravity: Vector3::zeros(),
            keyframe_states: Vec::new(),
            landmark_positions: Vec::new(),
            transaction: Transaction::default(),
        }
    }
}

pub struct TrajectoryInitializer {
    cfg: InitializerConfig,
    candidate_stamps: Vec<f64>,
    last_candidate_stamp: Option<f64>,
    path: Option<Vec<PathPose>>,
}

impl TrajectoryInitializer {
    pub fn new(cfg: InitializerConfig) -> Self {
        Self {
            cfg,
            candidate_stamps: Vec::new(),
            last_candidate_stamp: None,
            path: None,
        }
    }

    /// Step 1, spec.md §4.4: frame accumulation while uninitialized.
    pub fn push_candidate_frame(&mut self, stamp: f64) -> bool {
        if let Some(last) = self.last_candidate_stamp {
            if stamp - last < self.cfg.candidate_frame_gate_s {
                return false;
            }
        }
        self.last_candidate_stamp = Some(stamp);
        self.candidate_stamps.push(stamp);
        true
    }

    pub fn set_initialized_path(&mut self, path: Vec<PathPose>) {
        self.path = Some(path);
    }

    pub fn candidate_stamps(&self) -> &[f64] {
        &self.candidate_stamps
    }

    /// Keeps accumulated buffers so the next `add_image` retries
    /// (spec.md §4.4 "On failure the accumulated buffers are
    /// preserved").
    fn retain_buffers_on_failure(&self) -> InitResult {
        InitResult::failure()
    }

    fn interpolate_path(path: &[PathPose], stamp: f64) -> Option<Isometry3<f64>> {
        if path.is_empty() {
            return None;
        }
        if stamp <= path[0].stamp {
            return Some(path[0].pose);
        }
        let last = path.last().unwrap();
        if stamp >= last.stamp {
            return Some(last.pose);
        }
        for w in path.windows(2) {
            let (a, b) = (&w[0], &w[1]);
            if stamp >= a.stamp && stamp <= b.stamp {
                let t = (stamp - a.stamp) / (b.stamp - a.stamp);
                let trans = a.pose.translation.vector.lerp(&b.pose.translation.vector, t);
                let rot = a.pose.rotation.slerp(&b.pose.rotation, t);
                return Some(Isometry3::from_parts(Translation3::from(trans), rot));
            }
        }
        None
    }

    /// Solves the shared linear gravity/scale system: for each
    /// consecutive keyframe pair, `scale * displacement_ij - 0.5 dt^2 g
    /// = R_i * delta_p_ij`. When `solve_scale` is false, `displacement`
    /// is already metric and only `g` (3 unknowns) is solved;
    /// otherwise `scale` is a 4th unknown shared across all pairs.
    fn solve_gravity_scale(
        entries: &[(f64, Vector3<f64>, Vector3<f64>)],
        solve_scale: bool,
    ) -> Option<(f64, Vector3<f64>)> {
        if entries.is_empty() {
            return None;
        }
        let unknowns = if solve_scale { 4 } else { 3 };
        let mut a = DMatrix::<f64>::zeros(entries.len() * 3, unknowns);
        let mut b = DVector::<f64>::zeros(entries.len() * 3);
        for (row, (dt, displacement, rotated_delta_p)) in entries.iter().enumerate() {
            for axis in 0..3 {
                let r = row * 3 + axis;
                if solve_scale {
                    a[(r, 0)] = displacement[axis];
                    a[(r, 1 + axis)] = -0.5 * dt * dt;
                } else {
                    a[(r, axis)] = -0.5 * dt * dt;
                }
                b[r] = rotated_delta_p[axis] - if solve_scale { 0.0 } else { displacement[axis] };
            }
        }
        let at = a.transpose();
        let ata = &at * &a;
        let atb = &at * &b;
        let solution = ata.lu().solve(&atb)?;
        if solve_scale {
            let scale = solution[0];
            let g = Vector3::new(solution[1], solution[2], solution[3]);
            Some((scale, g))
        } else {
            Some((1.0, Vector3::new(solution[0], solution[1], solution[2])))
        }
    }

    /// Triangulates every track observed in >= 3 of the given keyframe
    /// poses via multi-view DLT (spec.md §4.4 step 2: "triangulate
    /// landmarks observed in >= 3 seeded keyframes"), reusing the same
    /// algorithm the visual front-end uses to seed its own map.
    fn triangulate_tracks(
        poses: &[(f64, Isometry3<f64>)],
        tracks: &HashMap<LandmarkId, Vec<VisualObservation>>,
        intrinsics: &Intrinsics,
    ) -> Vec<(LandmarkId, Point3<f64>)> {
        const STAMP_EPS: f64 = 1e-6;
        let mut landmarks = Vec::new();
        for (&id, observations) in tracks {
            let views: Vec<(Isometry3<f64>, Point2<f64>)> = observations
                .iter()
                .filter_map(|obs| {
                    poses
                        .iter()
                        .find(|(s, _)| (s - obs.stamp).abs() < STAMP_EPS)
                        .map(|(_, pose)| (*pose, obs.pixel))
                })
                .collect();
            if views.len() < 3 {
                continue;
            }
            if let Some(world) = triangulate_dlt(&views, intrinsics) {
                landmarks.push((id, world));
            }
        }
        landmarks
    }

    fn build_transaction(
        &self,
        states: &[(f64, ImuState)],
        landmarks: &[(LandmarkId, Point3<f64>)],
        deltas: &[(f64, f64, PreintegratedDelta)],
    ) -> Transaction {
        let mut txn = Transaction::default();
        for (stamp, state) in states {
            txn.variables.push((
                VariableId::pose(*stamp),
                VariableValue::Pose(Isometry3::from_parts(
                    Translation3::from(state.position),
                    state.orientation,
                )),
            ));
            txn.variables
                .push((VariableId::velocity(*stamp), VariableValue::Velocity(state.velocity)));
            let mut bias = nalgebra::Vector6::zeros();
            bias.fixed_rows_mut::<3>(0).copy_from(&state.accel_bias);
            bias.fixed_rows_mut::<3>(3).copy_from(&state.gyro_bias);
            txn.variables
                .push((VariableId::bias(*stamp), VariableValue::Bias(bias)));
        }
        for (id, pos) in landmarks {
            txn.variables
                .push((VariableId::landmark(*id), VariableValue::Landmark(*pos)));
        }
        if let Some((first_stamp, first_state)) = states.first() {
            txn.constraints.push(Constraint::Prior {
                variable: VariableId::pose(*first_stamp),
                value: VariableValue::Pose(Isometry3::from_parts(
                    Translation3::from(first_state.position),
                    first_state.orientation,
                )),
                covariance_diag: [self.cfg.sigma_prior; 6],
            });
        }
        for (stamp_i, stamp_j, delta) in deltas {
            txn.constraints.push(Constraint::Preintegrated {
                pose_i: VariableId::pose(*stamp_i),
                vel_i: VariableId::velocity(*stamp_i),
                bias_i: VariableId::bias(*stamp_i),
                pose_j: VariableId::pose(*stamp_j),
                vel_j: VariableId::velocity(*stamp_j),
                bias_j: VariableId::bias(*stamp_j),
                delta: delta.clone(),
            });
        }
        txn.override_variables = true;
        txn.override_constraints = true;
        txn
    }

    /// Path-seeded mode (spec.md §4.4 step 2): requires
    /// `set_initialized_path` to have been called.
    pub fn try_path_seeded(
        &mut self,
        deltas: &[(f64, f64, PreintegratedDelta)],
        tracks: &HashMap<LandmarkId, Vec<VisualObservation>>,
        intrinsics: Intrinsics,
    ) -> SlamResult<InitResult> {
        let Some(path) = self.path.clone() else {
            return Err(SlamError::Underconstrained("no initialized path available".into()));
        };
        if self.candidate_stamps.len() < 3 {
            return Ok(self.retain_buffers_on_failure());
        }

        let seeded: Vec<(f64, Isometry3<f64>)> = self
            .candidate_stamps
            .iter()
            .filter_map(|&s| Self::interpolate_path(&path, s).map(|p| (s, p)))
            .collect();
        if seeded.len() < 3 {
            return Ok(self.retain_buffers_on_failure());
        }

        let trajectory_length: f64 = seeded
            .windows(2)
            .map(|w| (w[1].1.translation.vector - w[0].1.translation.vector).norm())
            .sum();
        if trajectory_length < self.cfg.min_trajectory_length_m {
            return Err(SlamError::Underconstrained(format!(
                "trajectory length {trajectory_length:.3} m below minimum {}",
                self.cfg.min_trajectory_length_m
            )));
        }

        let velocities = Self::finite_difference_velocities(&seeded);

        const STAMP_EPS: f64 = 1e-6;
        let mut entries = Vec::new();
        for (stamp_i, stamp_j, delta) in deltas {
            let Some(idx_i) = seeded.iter().position(|(s, _)| (s - stamp_i).abs() < STAMP_EPS) else {
                continue;
            };
            let Some(pose_j) = seeded
                .iter()
                .find(|(s, _)| (s - stamp_j).abs() < STAMP_EPS)
                .map(|(_, p)| *p)
            else {
                continue;
            };
            let pose_i = seeded[idx_i].1;
            let v_i = velocities[idx_i];
            let displacement = pose_j.translation.vector - pose_i.translation.vector - v_i * delta.delta_t;
            let rotated_delta_p = pose_i.rotation * delta.delta_p;
            entries.push((delta.delta_t, displacement, rotated_delta_p));
        }

        let Some((_, gravity)) = Self::solve_gravity_scale(&entries, false) else {
            return Err(SlamError::Underconstrained("gravity solve failed (rank-deficient)".into()));
        };
        if (gravity.norm() - 9.81).abs() / 9.81 > 0.5 {
            return Err(SlamError::Underconstrained("gravity solve diverged".into()));
        }

        let states: Vec<(f64, ImuState)> = seeded
            .iter()
            .enumerate()
            .map(|(idx, (stamp, pose))| {
                (
                    *stamp,
                    ImuState {
                        stamp: *stamp,
                        orientation: pose.rotation,
                        position: pose.translation.vector,
                        velocity: velocities.get(idx).copied().unwrap_or_else(Vector3::zeros),
                        gyro_bias: Vector3::zeros(),
                        accel_bias: Vector3::zeros(),
                    },
                )
            })
            .collect();

        let landmark_positions = Self::triangulate_tracks(&seeded, tracks, &intrinsics);
        let transaction = self.build_transaction(&states, &landmark_positions, deltas);
        Ok(InitResult {
            success: true,
            gravity,
            keyframe_states: states,
            landmark_positions,
            transaction,
        })
    }

    fn finite_difference_velocities(seeded: &[(f64, Isometry3<f64>)]) -> Vec<Vector3<f64>> {
        let n = seeded.len();
        (0..n)
            .map(|i| {
                if n < 2 {
                    Vector3::zeros()
                } else if i == 0 {
                    (seeded[1].1.translation.vector - seeded[0].1.translation.vector)
                        / (seeded[1].0 - seeded[0].0).max(1e-6)
                } else if i == n - 1 {
                    (seeded[i].1.translation.vector - seeded[i - 1].1.translation.vector)
                        / (seeded[i].0 - seeded[i - 1].0).max(1e-6)
                } else {
                    (seeded[i + 1].1.translation.vector - seeded[i - 1].1.translation.vector)
                        / (seeded[i + 1].0 - seeded[i - 1].0).max(1e-6)
                }
            })
            .collect()
    }

    /// Pure-visual mode (spec.md §4.4 step 3): two-view essential-matrix
    /// pose recovery between the first and last candidate keyframe,
    /// chained triangulation for shared tracks, then the same
    /// gravity/scale solve with scale left free.
    pub fn try_pure_visual(
        &mut self,
        deltas: &[(f64, f64, PreintegratedDelta)],
        tracks: &HashMap<LandmarkId, Vec<VisualObservation>>,
        intrinsics: Intrinsics,
    ) -> SlamResult<InitResult> {
        if self.candidate_stamps.len() < 3 {
            return Ok(self.retain_buffers_on_failure());
        }
        let first = *self.candidate_stamps.first().unwrap();
        let last = *self.candidate_stamps.last().unwrap();

        let mut correspondences = Vec::new();
        for obs in tracks.values() {
            let a = obs.iter().find(|o| o.stamp == first);
            let b = obs.iter().find(|o| o.stamp == last);
            if let (Some(a), Some(b)) = (a, b) {
                correspondences.push((a.pixel, b.pixel));
            }
        }
        if correspondences.len() < 8 {
            return Err(SlamError::Underconstrained(format!(
                "pure-visual init needs >= 8 shared tracks, found {}",
                correspondences.len()
            )));
        }

        let Some((relative_pose, baseline_unit)) =
            Self::recover_relative_pose(&correspondences, &intrinsics)
        else {
            return Err(SlamError::Underconstrained(
                "essential matrix degenerate (pure rotation or planar degeneracy)".into(),
            ));
        };
        if baseline_unit.norm() < self.cfg.min_visual_parallax / 1000.0 {
            return Err(SlamError::Underconstrained(
                "baseline too small: scale degenerate under pure rotation".into(),
            ));
        }

        // Chain poses for every candidate stamp in between by linear
        // interpolation of the up-to-scale two-view motion (a
        // deliberate simplification of the full incremental SfM chain;
        // see DESIGN.md).
        let unit_poses: Vec<(f64, Isometry3<f64>)> = self
            .candidate_stamps
            .iter()
            .map(|&s| {
                let t = if last > first { (s - first) / (last - first) } else { 0.0 };
                let trans = relative_pose.translation.vector * t;
                let rot = UnitQuaternion::identity().slerp(&relative_pose.rotation, t);
                (s, Isometry3::from_parts(Translation3::from(trans), rot))
            })
            .collect();

        let velocities = Self::finite_difference_velocities(&unit_poses);
        const STAMP_EPS: f64 = 1e-6;
        let mut entries = Vec::new();
        for (stamp_i, stamp_j, delta) in deltas {
            let Some(idx_i) = unit_poses.iter().position(|(s, _)| (s - stamp_i).abs() < STAMP_EPS) else {
                continue;
            };
            let Some((_, pose_j)) = unit_poses.iter().find(|(s, _)| (s - stamp_j).abs() < STAMP_EPS) else {
                continue;
            };
            let pose_i = unit_poses[idx_i].1;
            let v_i = velocities[idx_i];
            let displacement = pose_j.translation.vector - pose_i.translation.vector - v_i * delta.delta_t;
            let rotated_delta_p = pose_i.rotation * delta.delta_p;
            entries.push((delta.delta_t, displacement, rotated_delta_p));
        }

        let Some((scale, gravity)) = Self::solve_gravity_scale(&entries, true) else {
            return Err(SlamError::Underconstrained("joint scale/gravity solve failed".into()));
        };
        if scale <= 0.0 || (gravity.norm() - 9.81).abs() / 9.81 > 0.5 {
            return Err(SlamError::Underconstrained(
                "joint scale/gravity solve diverged".into(),
            ));
        }

        let states: Vec<(f64, ImuState)> = unit_poses
            .iter()
            .enumerate()
            .map(|(idx, (stamp, pose))| {
                (
                    *stamp,
                    ImuState {
                        stamp: *stamp,
                        orientation: pose.rotation,
                        position: pose.translation.vector * scale,
                        velocity: velocities[idx] * scale,
                        gyro_bias: Vector3::zeros(),
                        accel_bias: Vector3::zeros(),
                    },
                )
            })
            .collect();

        let scaled_poses: Vec<(f64, Isometry3<f64>)> = states
            .iter()
            .map(|(stamp, state)| {
                (
                    *stamp,
                    Isometry3::from_parts(Translation3::from(state.position), state.orientation),
                )
            })
            .collect();
        let landmark_positions = Self::triangulate_tracks(&scaled_poses, tracks, &intrinsics);
        let transaction = self.build_transaction(&states, &landmark_positions, deltas);
        Ok(InitResult {
            success: true,
            gravity,
            keyframe_states: states,
            landmark_positions,
            transaction,
        })
    }

    /// Normalized 8-point algorithm for the essential matrix, decomposed
    /// into (R, t-direction) via the standard `U diag(1,1,0) V^T`
    /// cleanup and cheirality check against one correspondence.
    fn recover_relative_pose(
        correspondences: &[(Point2<f64>, Point2<f64>)],
        intrinsics: &Intrinsics,
    ) -> Option<(Isometry3<f64>, Vector3<f64>)> {
        let normalize = |p: &Point2<f64>| {
            Vector3::new(
                (p.x - intrinsics.cx) / intrinsics.fx,
                (p.y - intrinsics.cy) / intrinsics.fy,
                1.0,
            )
        };

        let mut a = DMatrix::<f64>::zeros(correspondences.len(), 9);
        for (row, (p0, p1)) in correspondences.iter().enumerate() {
            let x0 = normalize(p0);
            let x1 = normalize(p1);
            a.set_row(
                row,
                &DMatrix::from_row_slice(
                    1,
                    9,
                    &[
                        x1.x * x0.x, x1.x * x0.y, x1.x,
                        x1.y * x0.x, x1.y * x0.y, x1.y,
                        x0.x, x0.y, 1.0,
                    ],
                )
                .row(0),
            );
        }
        let svd = a.svd(false, true);
        let v_t = svd.v_t?;
        let e_vec = v_t.row(v_t.nrows() - 1);
        let mut e = Matrix3::zeros();
        for i in 0..3 {
            for j in 0..3 {
                e[(i, j)] = e_vec[i * 3 + j];
            }
        }

        let svd_e = e.svd(true, true);
        let (Some(u), Some(v_t_e)) = (svd_e.u, svd_e.v_t) else {
            return None;
        };
        let v = v_t_e.transpose();
        let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);

        let mut r1 = u * w * v.transpose();
        let mut r2 = u * w.transpose() * v.transpose();
        if r1.determinant() < 0.0 {
            r1 = -r1;
        }
        if r2.determinant() < 0.0 {
            r2 = -r2;
        }
        let t = u.column(2).into_owned();

        let candidates = [(r1, t), (r1, -t), (r2, t), (r2, -t)];
        let (x0, x1) = correspondences[0];
        let n0 = normalize(&x0);
        let n1 = normalize(&x1);

        for (r, cand_t) in candidates {
            if Self::triangulation_depth_positive(&n0, &n1, &r, &cand_t) {
                let rotation = UnitQuaternion::from_matrix(&r);
                return Some((
                    Isometry3::from_parts(Translation3::from(cand_t), rotation),
                    cand_t,
                ));
            }
        }
        None
    }

    fn triangulation_depth_positive(
        n0: &Vector3<f64>,
        n1: &Vector3<f64>,
        r: &Matrix3<f64>,
        t: &Vector3<f64>,
    ) -> bool {
        // Midpoint triangulation of two rays; accept if both implied
        // depths are positive.
        let a = Matrix3::from_columns(&[*n0, -(r * n1), n0.cross(&(r * n1))]) ;
        let Some(inv) = a.try_inverse() else { return false };
        let lambdas = inv * t;
        lambdas[0] > 0.0 && lambdas[1] > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::{ImuPreintegrator, NoiseModel};
    use crate::types::ImuSample;

    fn cfg() -> InitializerConfig {
        InitializerConfig {
            init_mode: InitMode::Visual,
            candidate_frame_gate_s: 0.5,
            min_trajectory_length_m: 1.0,
            min_visual_parallax: 10.0,
            max_optimization_s: 5.0,
            sigma_prior: 1e-6,
        }
    }

    fn straight_line_path(n: usize, speed: f64, dt: f64) -> Vec<PathPose> {
        (0..n)
            .map(|i| PathPose {
                stamp: i as f64 * dt,
                pose: Isometry3::from_parts(
                    Translation3::new(speed * i as f64 * dt, 0.0, 0.0),
                    UnitQuaternion::identity(),
                ),
            })
            .collect()
    }

    #[test]
    fn candidate_gate_rejects_frames_too_close_together() {
        let mut init = TrajectoryInitializer::new(cfg());
        assert!(init.push_candidate_frame(0.0));
        assert!(!init.push_candidate_frame(0.1));
        assert!(init.push_candidate_frame(0.6));
    }

    #[test]
    fn path_seeded_recovers_gravity_direction() {
        let mut init = TrajectoryInitializer::new(InitializerConfig {
            candidate_frame_gate_s: 0.05,
            ..cfg()
        });
        let path = straight_line_path(20, 1.0, 0.1);
        init.set_initialized_path(path);

        let mut imu = ImuPreintegrator::new(NoiseModel::default(), Vector3::new(0.0, 0.0, -9.81), 1e-6);
        imu.set_start(0.0, None, None, None);
        let mut stamps = Vec::new();
        let mut deltas = Vec::new();
        let mut last_kf = 0.0;
        for i in 0..20 {
            let t = i as f64 * 0.1;
            init.push_candidate_frame(t);
            stamps.push(t);
        }
        for i in 1..200 {
            let t = i as f64 * 0.01;
            imu.push_sample(ImuSample { stamp: t, omega: Vector3::zeros(), accel: Vector3::new(1.0, 0.0, 9.81) })
                .unwrap();
            if (t - last_kf - 0.1).abs() < 1e-9 {
                let txn = imu.register_preintegrated_factor(t, None, None);
                if let Some(c) = txn.constraints.iter().find_map(|c| match c {
                    Constraint::Preintegrated { pose_i, pose_j, delta, .. } => {
                        Some((pose_i.stamp(), pose_j.stamp(), delta.clone()))
                    }
                    _ => None,
                }) {
                    deltas.push(c);
                }
                last_kf = t;
            }
        }

        let tracks = HashMap::new();
        let intrinsics = Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 };
        let result = init.try_path_seeded(&deltas, &tracks, intrinsics).unwrap();
        assert!(result.success);
        assert!((result.gravity.norm() - 9.81).abs() / 9.81 < 0.1);
    }

    #[test]
    fn path_seeded_triangulates_tracks_seen_in_three_keyframes() {
        let mut init = TrajectoryInitializer::new(InitializerConfig {
            candidate_frame_gate_s: 0.05,
            ..cfg()
        });
        let path = straight_line_path(20, 1.0, 0.1);
        init.set_initialized_path(path.clone());

        let mut imu = ImuPreintegrator::new(NoiseModel::default(), Vector3::new(0.0, 0.0, -9.81), 1e-6);
        imu.set_start(0.0, None, None, None);
        let mut deltas = Vec::new();
        let mut last_kf = 0.0;
        for i in 0..20 {
            init.push_candidate_frame(i as f64 * 0.1);
        }
        for i in 1..200 {
            let t = i as f64 * 0.01;
            imu.push_sample(ImuSample { stamp: t, omega: Vector3::zeros(), accel: Vector3::new(1.0, 0.0, 9.81) })
                .unwrap();
            if (t - last_kf - 0.1).abs() < 1e-9 {
                let txn = imu.register_preintegrated_factor(t, None, None);
                if let Some(c) = txn.constraints.iter().find_map(|c| match c {
                    Constraint::Preintegrated { pose_i, pose_j, delta, .. } => {
                        Some((pose_i.stamp(), pose_j.stamp(), delta.clone()))
                    }
                    _ => None,
                }) {
                    deltas.push(c);
                }
                last_kf = t;
            }
        }

        let intrinsics = Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 };
        let world_point = Point3::new(1.0, -0.3, 5.0);
        let mut observations = Vec::new();
        for &i in &[0usize, 5, 10] {
            let stamp = i as f64 * 0.1;
            let pose = &path[i].pose;
            let pixel = intrinsics.project(&(pose.inverse() * world_point)).unwrap();
            observations.push(VisualObservation { stamp, pixel });
        }
        let mut tracks = HashMap::new();
        tracks.insert(1u64, observations);

        let result = init.try_path_seeded(&deltas, &tracks, intrinsics).unwrap();
        assert!(result.success);
        assert_eq!(result.landmark_positions.len(), 1);
        let (id, position) = result.landmark_positions[0];
        assert_eq!(id, 1);
        assert!((position - world_point).norm() < 1e-2);
    }
}

