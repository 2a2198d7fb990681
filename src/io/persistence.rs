//! On-disk layout (spec.md §6 "Persisted layout"): `params.json`,
//! `camera_model.json`, `extrinsics.json`, `frame_ids.json`, one
//! `submap_<k>/` directory per submap, and the two
//! `global_map_trajectory_*` artifacts, all via `serde_json`.
//!
//! `serde_json`'s default `Map` is a `BTreeMap` (the `preserve_order`
//! feature is not enabled), so every object serializes with sorted
//! keys already — the "canonical JSON" round-trip property (spec.md
//! §8) falls out of the crate's default behavior rather than any
//! custom formatting here.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{SlamError, SlamResult};
use crate::types::{Pose3, Submap};
use crate::vision::Intrinsics;

use super::pcd;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl From<Intrinsics> for CameraModel {
    fn from(i: Intrinsics) -> Self {
        Self { fx: i.fx, fy: i.fy, cx: i.cx, cy: i.cy }
    }
}

impl From<CameraModel> for Intrinsics {
    fn from(c: CameraModel) -> Self {
        Intrinsics { fx: c.fx, fy: c.fy, cx: c.cx, cy: c.cy }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtrinsicEntry {
    pub from: String,
    pub to: String,
    pub transform: Pose3,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrajectoryEntry {
    pub stamp: f64,
    pub pose: Pose3,
}

fn to_json_error(e: serde_json::Error, context: &str) -> SlamError {
    SlamError::ConfigInvalid(format!("{context}: {e}"))
}

fn io_error(e: std::io::Error, context: &str) -> SlamError {
    SlamError::ConfigInvalid(format!("{context}: {e}"))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> SlamResult<()> {
    let text = serde_json::to_string_pretty(value).map_err(|e| to_json_error(e, "serialize"))?;
    fs::write(path, text).map_err(|e| io_error(e, &format!("write {path:?}")))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> SlamResult<T> {
    let text = fs::read_to_string(path).map_err(|e| io_error(e, &format!("read {path:?}")))?;
    serde_json::from_str(&text).map_err(|e| to_json_error(e, "deserialize"))
}

pub fn save_config(root: &Path, cfg: &Config) -> SlamResult<()> {
    write_json(&root.join("params.json"), cfg)
}

pub fn load_config(root: &Path) -> SlamResult<Config> {
    read_json(&root.join("params.json"))
}

pub fn save_camera_model(root: &Path, model: &CameraModel) -> SlamResult<()> {
    write_json(&root.join("camera_model.json"), model)
}

pub fn load_camera_model(root: &Path) -> SlamResult<CameraModel> {
    read_json(&root.join("camera_model.json"))
}

pub fn save_extrinsics(root: &Path, entries: &[ExtrinsicEntry]) -> SlamResult<()> {
    write_json(&root.join("extrinsics.json"), &entries.to_vec())
}

pub fn load_extrinsics(root: &Path) -> SlamResult<Vec<ExtrinsicEntry>> {
    read_json(&root.join("extrinsics.json"))
}

pub fn save_frame_ids(root: &Path, frame_ids: &[String]) -> SlamResult<()> {
    write_json(&root.join("frame_ids.json"), &frame_ids.to_vec())
}

pub fn load_frame_ids(root: &Path) -> SlamResult<Vec<String>> {
    read_json(&root.join("frame_ids.json"))
}

fn submap_dir(root: &Path, index: usize) -> PathBuf {
    root.join(format!("submap_{index}"))
}

pub fn save_submap(root: &Path, submap: &Submap) -> SlamResult<()> {
    let dir = submap_dir(root, submap.index);
    fs::create_dir_all(&dir).map_err(|e| io_error(e, &format!("create {dir:?}")))?;

    write_json(&dir.join("anchor.json"), submap)?;

    let write_cloud = |name: &str, points: &[nalgebra::Point3<f64>]| -> SlamResult<()> {
        let file = fs::File::create(dir.join(name)).map_err(|e| io_error(e, name))?;
        pcd::write_pcd(file, points).map_err(|e| io_error(e, name))
    };
    write_cloud("lidar.pcd", &submap.lidar_points)?;
    if let Some(loam) = &submap.loam {
        write_cloud("edges_strong.pcd", &loam.edges_strong)?;
        write_cloud("edges_weak.pcd", &loam.edges_weak)?;
        write_cloud("surfaces_strong.pcd", &loam.surfaces_strong)?;
        write_cloud("surfaces_weak.pcd", &loam.surfaces_weak)?;
    }
    write_cloud("keypoints.pcd", &submap.visual_keypoints)?;

    let trajectory: Vec<TrajectoryEntry> = submap
        .keyframes
        .iter()
        .map(|kf| TrajectoryEntry { stamp: kf.stamp, pose: kf.pose })
        .collect();
    write_json(&dir.join("trajectory.json"), &trajectory)
}

pub fn load_submap(root: &Path, index: usize) -> SlamResult<Submap> {
    let dir = submap_dir(root, index);
    read_json(&dir.join("anchor.json"))
}

pub fn save_global_map(
    root: &Path,
    submaps: &[Submap],
    trajectory_optimized: &[TrajectoryEntry],
    trajectory_initial: Option<&[TrajectoryEntry]>,
) -> SlamResult<()> {
    fs::create_dir_all(root).map_err(|e| io_error(e, &format!("create {root:?}")))?;
    for submap in submaps {
        save_submap(root, submap)?;
    }
    write_json(&root.join("global_map_trajectory_optimized.json"), &trajectory_optimized.to_vec())?;
    let optimized_points: Vec<nalgebra::Point3<f64>> =
        trajectory_optimized.iter().map(|e| nalgebra::Point3::from(e.pose.translation.vector)).collect();
    let file = fs::File::create(root.join("global_map_trajectory_optimized.pcd"))
        .map_err(|e| io_error(e, "global_map_trajectory_optimized.pcd"))?;
    pcd::write_pcd(file, &optimized_points).map_err(|e| io_error(e, "global_map_trajectory_optimized.pcd"))?;

    if let Some(initial) = trajectory_initial {
        write_json(&root.join("global_map_trajectory_initial.json"), &initial.to_vec())?;
        let initial_points: Vec<nalgebra::Point3<f64>> =
            initial.iter().map(|e| nalgebra::Point3::from(e.pose.translation.vector)).collect();
        let file = fs::File::create(root.join("global_map_trajectory_initial.pcd"))
            .map_err(|e| io_error(e, "global_map_trajectory_initial.pcd"))?;
        pcd::write_pcd(file, &initial_points).map_err(|e| io_error(e, "global_map_trajectory_initial.pcd"))?;
    }
    Ok(())
}

pub fn load_global_map(root: &Path, submap_count: usize) -> SlamResult<(Vec<Submap>, Vec<TrajectoryEntry>)> {
    let submaps = (0..submap_count)
        .map(|k| load_submap(root, k))
        .collect::<SlamResult<Vec<_>>>()?;
    let trajectory = read_json(&root.join("global_map_trajectory_optimized.json"))?;
    Ok((submaps, trajectory))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Isometry3, Translation3, UnitQuaternion};

    #[test]
    fn config_round_trips_through_disk() {
        let dir = tempdir();
        let cfg = Config::default();
        save_config(&dir, &cfg).unwrap();
        let loaded = load_config(&dir).unwrap();
        assert_eq!(loaded.submap_size, cfg.submap_size);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn global_map_save_then_load_is_identical_on_second_save() {
        let dir = tempdir();
        let mut submap = Submap::new(0, 0.0, Isometry3::identity());
        submap.lidar_points = vec![nalgebra::Point3::new(1.0, 2.0, 3.0)];
        let trajectory = vec![TrajectoryEntry {
            stamp: 0.0,
            pose: Isometry3::from_parts(Translation3::new(1.0, 0.0, 0.0), UnitQuaternion::identity()),
        }];

        save_global_map(&dir, &[submap.clone()], &trajectory, None).unwrap();
        let first = fs::read_to_string(dir.join("global_map_trajectory_optimized.json")).unwrap();

        let (loaded_submaps, loaded_trajectory) = load_global_map(&dir, 1).unwrap();
        save_global_map(&dir, &loaded_submaps, &loaded_trajectory, None).unwrap();
        let second = fs::read_to_string(dir.join("global_map_trajectory_optimized.json")).unwrap();

        assert_eq!(first, second);
        fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("slam_core_test_{:?}", std::thread::current().id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }
}
