//! The global landmark table (spec.md §2 "visual front-end... maintains
//! a mapping from landmark id -> world position"). Landmarks are
//! shared by id, never by reference, so the table can be indexed from
//! both the tracker and the estimator snapshot without aliasing.

use std::collections::HashMap;

use nalgebra::Point3;

use crate::types::{Landmark, LandmarkId, Observation};

#[derive(Default)]
pub struct LandmarkTable {
    landmarks: HashMap<LandmarkId, Landmark>,
}

impl LandmarkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, id: LandmarkId) -> &mut Landmark {
        self.landmarks.entry(id).or_insert_with(|| Landmark::new(id))
    }

    pub fn get(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    pub fn is_triangulated(&self, id: LandmarkId) -> bool {
        self.landmarks.get(&id).is_some_and(Landmark::is_triangulated)
    }

    pub fn record_observation(&mut self, id: LandmarkId, obs: Observation) {
        self.get_or_create(id).observations.push(obs);
    }

    pub fn set_world_position(&mut self, id: LandmarkId, position: Point3<f64>) {
        self.get_or_create(id).world_position = Some(position);
    }

    pub fn update_from_graph(&mut self, positions: impl Iterator<Item = (LandmarkId, Point3<f64>)>) {
        for (id, pos) in positions {
            self.set_world_position(id, pos);
        }
    }

    /// Removes a landmark no longer referenced by any live keyframe
    /// observation (spec.md §3 `Landmark` lifecycle).
    pub fn remove_if_unreferenced(&mut self, id: LandmarkId, live_stamps: &[f64]) {
        if let Some(lm) = self.landmarks.get(&id) {
            let still_referenced = lm
                .observations
                .iter()
                .any(|o| live_stamps.contains(&o.keyframe_stamp));
            if !still_referenced {
                self.landmarks.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }
}
