//! Persisted run layout (spec.md §6): `params.json`, `camera_model.json`,
//! `extrinsics.json`, `frame_ids.json`, per-submap directories, and the
//! global-map trajectory artifacts.

pub mod pcd;
pub mod persistence;

pub use persistence::{CameraModel, ExtrinsicEntry, TrajectoryEntry};
