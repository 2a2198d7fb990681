//! Visual front-end (spec.md §4.2): feature-track bookkeeping, keyframe
//! policy, landmark triangulation, and reprojection-constraint
//! generation. Per-pixel feature detection/tracking itself is an
//! external collaborator (spec.md §1); this module consumes
//! already-associated track observations and owns everything from
//! there: PnP localization, the keyframe decision, multi-view
//! triangulation, and constraint emission.

use std::collections::HashMap;

use nalgebra::{DMatrix, Isometry3, Point2, Point3, Vector6};

use crate::error::{SlamError, SlamResult};
use crate::estimator::GraphEstimator;
use crate::geometry::perturb_pose;
use crate::transaction::{Constraint, Transaction, VariableId, VariableValue};
use crate::types::{Landmark, LandmarkId, Observation};

use super::landmarks::LandmarkTable;

/// Multi-view DLT triangulation (spec.md §4.2: finite DLT condition,
/// positive depth in every observing frame) from a list of
/// (world-from-camera pose, observed pixel) views. Shared by
/// `VisualFrontEnd::triangulate_multi_view` and the trajectory
/// initializer's landmark seeding, both of which only differ in where
/// the views come from.
pub(crate) fn triangulate_dlt(views: &[(Isometry3<f64>, Point2<f64>)], intrinsics: &Intrinsics) -> Option<Point3<f64>> {
    if views.len() < 3 {
        return None;
    }

    let mut a = DMatrix::<f64>::zeros(views.len() * 2, 4);
    for (row, (pose, pixel)) in views.iter().enumerate() {
        let cam_to_world = pose.inverse();
        let r = cam_to_world.rotation.to_rotation_matrix();
        let t = cam_to_world.translation.vector;
        let normalized_x = (pixel.x - intrinsics.cx) / intrinsics.fx;
        let normalized_y = (pixel.y - intrinsics.cy) / intrinsics.fy;

        let p0 = r.matrix().row(0).into_owned().transpose();
        let p1 = r.matrix().row(1).into_owned().transpose();
        let p2 = r.matrix().row(2).into_owned().transpose();
        let t0 = t.x;
        let t1 = t.y;
        let t2 = t.z;

        for col in 0..3 {
            a[(row * 2, col)] = normalized_x * p2[col] - p0[col];
            a[(row * 2 + 1, col)] = normalized_y * p2[col] - p1[col];
        }
        a[(row * 2, 3)] = normalized_x * t2 - t0;
        a[(row * 2 + 1, 3)] = normalized_y * t2 - t1;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let last_row = v_t.nrows() - 1;
    let h = v_t.row(last_row);
    if h[3].abs() < 1e-9 {
        return None;
    }
    let world = Point3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]);

    for (pose, _) in views {
        let cam_point = pose.inverse() * world;
        if cam_point.z <= 0.0 {
            return None;
        }
    }
    Some(world)
}

#[derive(Clone, Copy, Debug)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    pub fn project(&self, point_cam: &Point3<f64>) -> Option<Point2<f64>> {
        if point_cam.z <= 1e-6 {
            return None;
        }
        Some(Point2::new(
            self.fx * point_cam.x / point_cam.z + self.cx,
            self.fy * point_cam.y / point_cam.z + self.cy,
        ))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TrackObservation {
    pub track_id: LandmarkId,
    pub pixel: Point2<f64>,
}

#[derive(Clone, Debug)]
pub struct FrameInput {
    pub stamp: f64,
    pub observations: Vec<TrackObservation>,
}

#[derive(Clone, Copy, Debug)]
pub struct VisualFrontEndConfig {
    pub keyframe_min_time_in_seconds: f64,
    pub keyframe_parallax: f64,
    pub keyframe_tracks_drop: usize,
    pub window_size: usize,
    pub max_triangulation_distance: f64,
    pub reprojection_information_weight: f64,
    pub max_localization_iterations: usize,
}

struct TrackedFrame {
    stamp: f64,
    observations: HashMap<LandmarkId, Point2<f64>>,
    pose: Isometry3<f64>,
}

pub struct VisualFrontEnd {
    cfg: VisualFrontEndConfig,
    intrinsics: Intrinsics,
    landmarks: LandmarkTable,
    frames: Vec<TrackedFrame>,
    last_kf_stamp: Option<f64>,
    added_since_kf: usize,
}

impl VisualFrontEnd {
    pub fn new(cfg: VisualFrontEndConfig, intrinsics: Intrinsics) -> Self {
        Self {
            cfg,
            intrinsics,
            landmarks: LandmarkTable::new(),
            frames: Vec::new(),
            last_kf_stamp: None,
            added_since_kf: 0,
        }
    }

    pub fn landmarks(&self) -> &LandmarkTable {
        &self.landmarks
    }

    /// Advances the tracker with a new frame of track observations.
    /// Fails with `DuplicateStamp` if `stamp` already has a frame.
    pub fn add_image(&mut self, input: FrameInput) -> SlamResult<()> {
        if self.frames.iter().any(|f| f.stamp == input.stamp) {
            return Err(SlamError::DuplicateStamp(input.stamp));
        }
        let observations: HashMap<LandmarkId, Point2<f64>> = input
            .observations
            .iter()
            .map(|o| (o.track_id, o.pixel))
            .collect();
        let seed_pose = self.frames.last().map(|f| f.pose).unwrap_or_else(Isometry3::identity);
        self.frames.push(TrackedFrame {
            stamp: input.stamp,
            observations,
            pose: seed_pose,
        });
        Ok(())
    }

    fn frame(&self, stamp: f64) -> Option<&TrackedFrame> {
        self.frames.iter().find(|f| f.stamp == stamp)
    }

    fn frame_mut(&mut self, stamp: f64) -> Option<&mut TrackedFrame> {
        self.frames.iter_mut().find(|f| f.stamp == stamp)
    }

    /// Splits the frame's observations into triangulated / untriangulated
    /// sets and runs PnP + motion-only refinement against the
    /// triangulated correspondences. Requires >= 3 correspondences.
    pub fn localize(
        &mut self,
        stamp: f64,
    ) -> SlamResult<(Isometry3<f64>, Vec<LandmarkId>, Vec<LandmarkId>)> {
        let frame = self
            .frame(stamp)
            .ok_or_else(|| SlamError::NotReady { requested: stamp, front: stamp })?;

        let mut triangulated_ids = Vec::new();
        let mut untriangulated_ids = Vec::new();
        let mut correspondences: Vec<(Point3<f64>, Point2<f64>)> = Vec::new();
        for (&id, &pixel) in &frame.observations {
            if let Some(lm) = self.landmarks.get(id) {
                if let Some(world) = lm.world_position {
                    triangulated_ids.push(id);
                    correspondences.push((world, pixel));
                    continue;
                }
            }
            untriangulated_ids.push(id);
        }

        if correspondences.len() < 3 {
            return Err(SlamError::Underconstrained(format!(
                "localize at {stamp}: only {} correspondences (need >= 3)",
                correspondences.len()
            )));
        }

        let seed = frame.pose;
        let (ransac_pose, inliers) = self.ransac_pnp(seed, &correspondences);
        let inlier_correspondences: Vec<(Point3<f64>, Point2<f64>)> =
            inliers.iter().map(|&i| correspondences[i]).collect();
        let refine_set = if inlier_correspondences.len() >= 3 { &inlier_correspondences } else { &correspondences };
        let refined = self.refine_pose_gauss_newton(ransac_pose, refine_set);

        if let Some(f) = self.frame_mut(stamp) {
            f.pose = refined;
        }
        triangulated_ids.sort_unstable();
        untriangulated_ids.sort_unstable();
        Ok((refined, triangulated_ids, untriangulated_ids))
    }

    /// RANSAC PnP (spec.md §4.2): repeatedly solves a pose hypothesis
    /// from a minimal sample of correspondences, scores it against the
    /// full set by reprojection error, and keeps the hypothesis with
    /// the most inliers. Returns the winning pose and the indices (into
    /// `correspondences`) it classified as inliers, so a single
    /// mismatched correspondence never reaches the caller's refinement
    /// step.
    fn ransac_pnp(
        &self,
        seed: Isometry3<f64>,
        correspondences: &[(Point3<f64>, Point2<f64>)],
    ) -> (Isometry3<f64>, Vec<usize>) {
        const ITERATIONS: usize = 32;
        const MIN_SAMPLE: usize = 6;
        const INLIER_THRESHOLD_PX: f64 = 4.0;

        let n = correspondences.len();
        let sample_size = MIN_SAMPLE.min(n);
        let mut rng = 0x9E3779B9u32 ^ (n as u32);

        let mut best_pose = seed;
        let mut best_inliers: Vec<usize> = Vec::new();

        for _ in 0..ITERATIONS {
            let mut indices: Vec<usize> = Vec::with_capacity(sample_size);
            while indices.len() < sample_size {
                rng ^= rng << 13;
                rng ^= rng >> 17;
                rng ^= rng << 5;
                let idx = (rng as usize) % n;
                if !indices.contains(&idx) {
                    indices.push(idx);
                }
            }
            let sample: Vec<(Point3<f64>, Point2<f64>)> = indices.iter().map(|&i| correspondences[i]).collect();
            let hypothesis = self.refine_pose_gauss_newton(seed, &sample);

            let inliers: Vec<usize> = (0..n)
                .filter(|&i| {
                    let (world, pixel) = &correspondences[i];
                    self.intrinsics
                        .project(&(hypothesis.inverse() * world))
                        .map(|p| (p - pixel).norm() < INLIER_THRESHOLD_PX)
                        .unwrap_or(false)
                })
                .collect();

            if inliers.len() > best_inliers.len() {
                best_pose = hypothesis;
                best_inliers = inliers;
            }
        }

        if best_inliers.is_empty() {
            best_inliers = (0..n).collect();
        }
        (best_pose, best_inliers)
    }

    /// Motion-only bundle adjustment: minimizes reprojection error of a
    /// single camera pose against fixed 3D points (spec.md §4.2
    /// "motion-only bundle-adjustment refinement").
    fn refine_pose_gauss_newton(
        &self,
        seed: Isometry3<f64>,
        correspondences: &[(Point3<f64>, Point2<f64>)],
    ) -> Isometry3<f64> {
        let mut pose = seed;
        for _ in 0..self.cfg.max_localization_iterations {
            let n = correspondences.len() * 2;
            let mut jac = DMatrix::<f64>::zeros(n, 6);
            let mut residual = nalgebra::DVector::<f64>::zeros(n);
            let mut any_valid = false;

            for (row, (world, pixel)) in correspondences.iter().enumerate() {
                let Some(predicted) = self.intrinsics.project(&(pose.inverse() * world)) else {
                    continue;
                };
                any_valid = true;
                residual[row * 2] = predicted.x - pixel.x;
                residual[row * 2 + 1] = predicted.y - pixel.y;

                for k in 0..6 {
                    let mut d = Vector6::zeros();
                    d[k] = 1e-6;
                    let perturbed = perturb_pose(&pose, &d);
                    let Some(p_plus) = self.intrinsics.project(&(perturbed.inverse() * world)) else {
                        continue;
                    };
                    jac[(row * 2, k)] = (p_plus.x - predicted.x) / 1e-6;
                    jac[(row * 2 + 1, k)] = (p_plus.y - predicted.y) / 1e-6;
                }
            }
            if !any_valid {
                break;
            }

            let jt = jac.transpose();
            let h = &jt * &jac + DMatrix::<f64>::identity(6, 6) * 1e-6;
            let g = &jt * &residual;
            let Some(step) = h.clone().lu().solve(&(-g)) else {
                break;
            };
            let step6 = Vector6::from_iterator(step.iter().copied());
            if step6.norm() < 1e-10 {
                pose = perturb_pose(&pose, &step6);
                break;
            }
            pose = perturb_pose(&pose, &step6);
        }
        pose
    }

    /// Keyframe policy exactly per spec.md §4.2.
    pub fn is_keyframe(
        &self,
        stamp: f64,
        triangulated_ids: &[LandmarkId],
        untriangulated_ids: &[LandmarkId],
        _pose: &Isometry3<f64>,
    ) -> bool {
        let Some(last_kf) = self.last_kf_stamp else {
            return true;
        };
        if stamp - last_kf < self.cfg.keyframe_min_time_in_seconds {
            return false;
        }
        let mean_parallax = self.mean_parallax(last_kf, stamp, triangulated_ids, untriangulated_ids);
        mean_parallax > self.cfg.keyframe_parallax
            || triangulated_ids.len() < self.cfg.keyframe_tracks_drop
            || self.added_since_kf >= self.cfg.window_size - 1
    }

    fn mean_parallax(
        &self,
        last_kf_stamp: f64,
        stamp: f64,
        triangulated_ids: &[LandmarkId],
        untriangulated_ids: &[LandmarkId],
    ) -> f64 {
        let Some(last) = self.frame(last_kf_stamp) else {
            return f64::MAX;
        };
        let Some(current) = self.frame(stamp) else {
            return 0.0;
        };
        let mut total = 0.0;
        let mut count = 0usize;
        for id in triangulated_ids.iter().chain(untriangulated_ids.iter()) {
            if let (Some(p0), Some(p1)) = (last.observations.get(id), current.observations.get(id)) {
                total += (p1 - p0).norm();
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }

    /// Adds reprojection constraints for triangulated tracks, attempts
    /// multi-view triangulation for untriangulated tracks with >= 3
    /// keyframe observations, and commits `stamp` as a keyframe.
    pub fn extend_map(
        &mut self,
        stamp: f64,
        pose: Isometry3<f64>,
        triangulated_ids: &[LandmarkId],
        untriangulated_ids: &[LandmarkId],
    ) -> Transaction {
        let mut txn = Transaction::default();
        txn.variables
            .push((VariableId::pose(stamp), VariableValue::Pose(pose)));

        let Some(frame) = self.frame(stamp) else {
            return txn;
        };
        let triangulated_pixels: Vec<(LandmarkId, Point2<f64>)> = triangulated_ids
            .iter()
            .filter_map(|&id| frame.observations.get(&id).map(|&pixel| (id, pixel)))
            .collect();
        let untriangulated_pixels: Vec<(LandmarkId, Point2<f64>)> = untriangulated_ids
            .iter()
            .filter_map(|&id| frame.observations.get(&id).map(|&pixel| (id, pixel)))
            .collect();

        for (id, pixel) in triangulated_pixels {
            self.landmarks.record_observation(id, Observation { keyframe_stamp: stamp, pixel });
            txn.constraints.push(Constraint::Reprojection {
                pose: VariableId::pose(stamp),
                landmark: VariableId::landmark(id),
                pixel,
                information_weight: self.cfg.reprojection_information_weight,
            });
        }

        for (id, pixel) in untriangulated_pixels {
            self.landmarks.record_observation(id, Observation { keyframe_stamp: stamp, pixel });
            let lm = self.landmarks.get(id).cloned().unwrap_or_else(|| Landmark::new(id));
            if lm.observations.len() < 3 {
                continue;
            }
            if let Some(world) = self.triangulate_multi_view(&lm) {
                self.landmarks.set_world_position(id, world);
                txn.variables
                    .push((VariableId::landmark(id), VariableValue::Landmark(world)));
                for obs in &lm.observations {
                    txn.constraints.push(Constraint::Reprojection {
                        pose: VariableId::pose(obs.keyframe_stamp),
                        landmark: VariableId::landmark(id),
                        pixel: obs.pixel,
                        information_weight: self.cfg.reprojection_information_weight,
                    });
                }
            }
        }

        self.last_kf_stamp = Some(stamp);
        self.added_since_kf = 0;
        txn
    }

    pub fn note_non_keyframe(&mut self) {
        self.added_since_kf += 1;
    }

    /// Multi-view DLT triangulation from every observing keyframe's
    /// pose (spec.md §4.2: finite DLT condition, positive depth in
    /// every observing frame).
    fn triangulate_multi_view(&self, landmark: &Landmark) -> Option<Point3<f64>> {
        let views: Vec<(Isometry3<f64>, Point2<f64>)> = landmark
            .observations
            .iter()
            .filter_map(|obs| self.frame(obs.keyframe_stamp).map(|f| (f.pose, obs.pixel)))
            .collect();
        let world = triangulate_dlt(&views, &self.intrinsics)?;
        if (world.coords - views[0].0.translation.vector).norm() > self.cfg.max_triangulation_distance {
            return None;
        }
        Some(world)
    }

    /// Pulls post-optimization landmark positions and keyframe poses
    /// from the estimator (spec.md §4.2 `update_from_graph`).
    pub fn update_from_graph(&mut self, graph: &dyn GraphEstimator) {
        let snapshot = graph.snapshot();
        for (var_id, value) in &snapshot.values {
            match (var_id.kind, value) {
                (crate::transaction::VariableKind::Landmark, VariableValue::Landmark(p)) => {
                    self.landmarks.set_world_position(var_id.key, *p);
                }
                (crate::transaction::VariableKind::Pose, VariableValue::Pose(pose)) => {
                    let stamp = var_id.stamp();
                    if let Some(frame) = self.frame_mut(stamp) {
                        frame.pose = *pose;
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Translation3, UnitQuaternion};

    fn intrinsics() -> Intrinsics {
        Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 }
    }

    fn cfg() -> VisualFrontEndConfig {
        VisualFrontEndConfig {
            keyframe_min_time_in_seconds: 0.1,
            keyframe_parallax: 20.0,
            keyframe_tracks_drop: 40,
            window_size: 10,
            max_triangulation_distance: 50.0,
            reprojection_information_weight: 1.0,
            max_localization_iterations: 20,
        }
    }

    #[test]
    fn duplicate_stamp_is_rejected() {
        let mut front = VisualFrontEnd::new(cfg(), intrinsics());
        front.add_image(FrameInput { stamp: 1.0, observations: vec![] }).unwrap();
        let err = front
            .add_image(FrameInput { stamp: 1.0, observations: vec![] })
            .unwrap_err();
        assert!(matches!(err, SlamError::DuplicateStamp(_)));
    }

    #[test]
    fn localize_with_too_few_correspondences_is_underconstrained() {
        let mut front = VisualFrontEnd::new(cfg(), intrinsics());
        front
            .add_image(FrameInput {
                stamp: 0.0,
                observations: vec![TrackObservation { track_id: 1, pixel: Point2::new(320.0, 240.0) }],
            })
            .unwrap();
        let err = front.localize(0.0).unwrap_err();
        assert_eq!(err.kind(), "UNDERCONSTRAINED");
    }

    #[test]
    fn first_frame_is_always_a_keyframe() {
        let front = VisualFrontEnd::new(cfg(), intrinsics());
        assert!(front.is_keyframe(0.0, &[], &[], &Isometry3::identity()));
    }

    #[test]
    fn triangulate_and_localize_round_trip() {
        let mut front = VisualFrontEnd::new(cfg(), intrinsics());
        let world_point = Point3::new(0.2, -0.1, 5.0);
        let poses = [
            Isometry3::from_parts(Translation3::new(0.0, 0.0, 0.0), UnitQuaternion::identity()),
            Isometry3::from_parts(Translation3::new(0.3, 0.0, 0.0), UnitQuaternion::identity()),
            Isometry3::from_parts(Translation3::new(0.6, 0.1, 0.0), UnitQuaternion::identity()),
        ];

        for (i, pose) in poses.iter().enumerate() {
            let cam_point = pose.inverse() * world_point;
            let pixel = front.intrinsics.project(&cam_point).unwrap();
            front
                .add_image(FrameInput {
                    stamp: i as f64,
                    observations: vec![TrackObservation { track_id: 1, pixel }],
                })
                .unwrap();
            if let Some(f) = front.frame_mut(i as f64) {
                f.pose = *pose;
            }
            front.landmarks.record_observation(1, Observation { keyframe_stamp: i as f64, pixel });
        }

        let lm = front.landmarks.get(1).cloned().unwrap();
        let triangulated = front.triangulate_multi_view(&lm).unwrap();
        assert!((triangulated - world_point).norm() < 1e-3);
    }

    #[test]
    fn localize_rejects_a_single_outlier_correspondence() {
        let mut front = VisualFrontEnd::new(cfg(), intrinsics());
        let true_pose = Isometry3::from_parts(
            Translation3::new(0.15, -0.05, 0.05),
            UnitQuaternion::from_euler_angles(0.02, -0.03, 0.01),
        );

        let world_points = [
            Point3::new(0.3, 0.2, 4.0),
            Point3::new(-0.4, 0.1, 5.0),
            Point3::new(0.1, -0.3, 3.5),
            Point3::new(-0.2, -0.2, 4.5),
            Point3::new(0.4, -0.1, 6.0),
            Point3::new(-0.3, 0.3, 5.5),
        ];

        let mut observations = Vec::new();
        for (i, world) in world_points.iter().enumerate() {
            let id = (i + 1) as LandmarkId;
            front.landmarks.set_world_position(id, *world);
            let pixel = front.intrinsics.project(&(true_pose.inverse() * world)).unwrap();
            observations.push(TrackObservation { track_id: id, pixel });
        }
        // A real landmark with a pixel nowhere near its true projection.
        let outlier_id: LandmarkId = 7;
        front.landmarks.set_world_position(outlier_id, Point3::new(0.0, 0.0, 5.0));
        observations.push(TrackObservation { track_id: outlier_id, pixel: Point2::new(10.0, 10.0) });

        front.add_image(FrameInput { stamp: 0.0, observations }).unwrap();
        let (pose, _, _) = front.localize(0.0).unwrap();

        assert!((pose.translation.vector - true_pose.translation.vector).norm() < 0.05);
    }
}
