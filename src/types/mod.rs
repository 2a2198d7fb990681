//! Core data-model entities (spec.md §3).

pub mod linalg;

pub use linalg::*;

use nalgebra::{Isometry3, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// A unique, monotonically assigned landmark identifier.
pub type LandmarkId = u64;

/// Rigid-body pose type used throughout: `T_world_baselink`,
/// `T_world_imu`, submap anchors, etc.
pub type Pose3 = Isometry3<f64>;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ImuSample {
    pub stamp: f64,
    pub omega: Vector3<f64>,
    pub accel: Vector3<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImuState {
    pub stamp: f64,
    pub orientation: nalgebra::UnitQuaternion<f64>,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub gyro_bias: Vector3<f64>,
    pub accel_bias: Vector3<f64>,
}

impl ImuState {
    pub fn identity_at(stamp: f64) -> Self {
        Self {
            stamp,
            orientation: nalgebra::UnitQuaternion::identity(),
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
        }
    }
}

/// A single pixel observation of a landmark from a keyframe.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Observation {
    pub keyframe_stamp: f64,
    pub pixel: nalgebra::Point2<f64>,
}

/// A triangulated (or not-yet-triangulated) 3D landmark.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Landmark {
    pub id: LandmarkId,
    pub world_position: Option<Point3<f64>>,
    pub observations: Vec<Observation>,
}

impl Landmark {
    pub fn new(id: LandmarkId) -> Self {
        Self {
            id,
            world_position: None,
            observations: Vec::new(),
        }
    }

    pub fn is_triangulated(&self) -> bool {
        self.world_position.is_some()
    }
}

/// A keyframe: exactly one per stamp, stamps strictly increasing
/// within a `Keyframe` owner (visual tracker or lidar window).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Keyframe {
    pub stamp: f64,
    pub pose: Pose3,
    pub observed_landmarks: Vec<LandmarkId>,
}

/// A lidar scan pose: world-frame pose estimate plus its point cloud,
/// mutated in place as the estimator publishes updates.
#[derive(Clone, Debug)]
pub struct ScanPose {
    pub stamp: f64,
    pub pose: Pose3,
    pub points: Vec<Point3<f64>>,
    pub update_counter: u64,
}

impl ScanPose {
    pub fn new(stamp: f64, pose: Pose3, points: Vec<Point3<f64>>) -> Self {
        Self {
            stamp,
            pose,
            points,
            update_counter: 0,
        }
    }

    pub fn apply_update(&mut self, pose: Pose3) {
        self.pose = pose;
        self.update_counter += 1;
    }
}

/// A LOAM-style feature cloud split into four categories, used by
/// feature-based lidar matchers (spec.md GLOSSARY).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LoamCloud {
    pub edges_strong: Vec<Point3<f64>>,
    pub edges_weak: Vec<Point3<f64>>,
    pub surfaces_strong: Vec<Point3<f64>>,
    pub surfaces_weak: Vec<Point3<f64>>,
}

/// A spatially bounded chunk of the trajectory; the unit of loop
/// closure. The anchor's `initial` value is set once and never
/// mutated; `current` tracks post-optimization refinement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Submap {
    pub index: usize,
    pub anchor_initial: Pose3,
    pub anchor_current: Pose3,
    pub anchor_keyframe_stamp: f64,
    pub keyframes: Vec<Keyframe>,
    pub lidar_points: Vec<Point3<f64>>,
    pub loam: Option<LoamCloud>,
    pub visual_keypoints: Vec<Point3<f64>>,
    pub descriptor_words: Option<Vec<u64>>,
}

impl Submap {
    pub fn new(index: usize, anchor_keyframe_stamp: f64, anchor: Pose3) -> Self {
        Self {
            index,
            anchor_initial: anchor,
            anchor_current: anchor,
            anchor_keyframe_stamp,
            keyframes: Vec::new(),
            lidar_points: Vec::new(),
            loam: None,
            visual_keypoints: Vec::new(),
            descriptor_words: None,
        }
    }

    /// Distance gate used for submap assignment (spec.md §4.5, §8
    /// "Submap assignment" invariant).
    pub fn distance_to(&self, position: &Point3<f64>) -> f64 {
        (self.anchor_current.translation.vector - position.coords).norm()
    }
}
