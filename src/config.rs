//! Configuration recognized by the core (spec.md §6), loaded from
//! `params.json` via `serde_json`.

use serde::{Deserialize, Serialize};

use crate::error::{SlamError, SlamResult};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum InitMode {
    Visual,
    Lidar,
    Frameinit,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelocCandidateSearchType {
    Eucdist,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelocRefinementType {
    Icp,
    Gicp,
    Ndt,
    Loam,
}

/// Selects between the two lidar registration flavors described in
/// spec.md §4.3. Not individually named in spec.md §6's table, but
/// implied by "selected by configuration" (Open Question #3 in
/// SPEC_FULL.md).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LidarRegistrationMode {
    MultiScan,
    ScanToMap,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub submap_size: f64,
    pub lag_duration: f64,
    pub num_neighbors: usize,
    pub outlier_threshold_t: f64,
    pub outlier_threshold_r: f64,
    pub min_motion_trans_m: f64,
    pub min_motion_rot_rad: f64,
    pub fix_first_scan: bool,
    pub downsample_size: f64,
    pub map_size: usize,
    pub store_full_cloud: bool,
    pub keyframe_min_time_in_seconds: f64,
    pub keyframe_parallax: f64,
    pub keyframe_tracks_drop: usize,
    pub window_size: usize,
    pub num_features_to_track: usize,
    pub descriptor: String,
    pub matcher_params_path: Option<String>,
    pub matcher_noise_diagonal: [f64; 6],
    pub local_mapper_covariance_diag: [f64; 6],
    pub reloc_covariance_diag: [f64; 6],
    pub reloc_candidate_search_type: RelocCandidateSearchType,
    pub reloc_refinement_type: RelocRefinementType,
    pub init_mode: InitMode,
    pub max_optimization_s: f64,
    pub min_trajectory_length_m: f64,
    pub min_visual_parallax: f64,
    pub initialization_window_s: f64,
    pub inertial_info_weight: f64,
    pub reprojection_information_weight: f64,
    pub lidar_information_weight: f64,
    pub max_triangulation_distance: f64,
    pub lidar_registration_mode: LidarRegistrationMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            submap_size: 10.0,
            lag_duration: 0.0,
            num_neighbors: 3,
            outlier_threshold_t: 0.3,
            outlier_threshold_r: 0.3,
            min_motion_trans_m: 0.1,
            min_motion_rot_rad: 0.05,
            fix_first_scan: true,
            downsample_size: 0.05,
            map_size: 10,
            store_full_cloud: true,
            keyframe_min_time_in_seconds: 0.1,
            keyframe_parallax: 20.0,
            keyframe_tracks_drop: 40,
            window_size: 10,
            num_features_to_track: 150,
            descriptor: "ORB".to_string(),
            matcher_params_path: None,
            matcher_noise_diagonal: [0.01, 0.01, 0.01, 0.001, 0.001, 0.001],
            local_mapper_covariance_diag: [0.05, 0.05, 0.05, 0.01, 0.01, 0.01],
            reloc_covariance_diag: [0.1, 0.1, 0.1, 0.02, 0.02, 0.02],
            reloc_candidate_search_type: RelocCandidateSearchType::Eucdist,
            reloc_refinement_type: RelocRefinementType::Icp,
            init_mode: InitMode::Visual,
            max_optimization_s: 5.0,
            min_trajectory_length_m: 2.0,
            min_visual_parallax: 10.0,
            initialization_window_s: 1.0,
            inertial_info_weight: 1.0,
            reprojection_information_weight: 1.0,
            lidar_information_weight: 1.0,
            max_triangulation_distance: 50.0,
            lidar_registration_mode: LidarRegistrationMode::MultiScan,
        }
    }
}

impl Config {
    pub fn from_json_str(text: &str) -> SlamResult<Self> {
        let cfg: Config = serde_json::from_str(text)
            .map_err(|e| SlamError::ConfigInvalid(format!("params.json parse error: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: &std::path::Path) -> SlamResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SlamError::ConfigInvalid(format!("cannot read {path:?}: {e}")))?;
        Self::from_json_str(&text)
    }

    /// Rejects structurally nonsensical configuration at startup
    /// (fatal per spec.md §7: `CONFIG_INVALID` is the only aborting
    /// error kind).
    pub fn validate(&self) -> SlamResult<()> {
        if self.submap_size <= 0.0 {
            return Err(SlamError::ConfigInvalid(
                "submap_size must be positive".into(),
            ));
        }
        if self.window_size == 0 {
            return Err(SlamError::ConfigInvalid(
                "window_size must be positive".into(),
            ));
        }
        if self.num_neighbors == 0 {
            return Err(SlamError::ConfigInvalid(
                "num_neighbors must be positive".into(),
            ));
        }
        if self.map_size == 0 {
            return Err(SlamError::ConfigInvalid("map_size must be positive".into()));
        }
        if self.max_optimization_s <= 0.0 {
            return Err(SlamError::ConfigInvalid(
                "max_optimization_s must be positive".into(),
            ));
        }
        for (name, diag) in [
            ("matcher_noise_diagonal", &self.matcher_noise_diagonal),
            (
                "local_mapper_covariance_diag",
                &self.local_mapper_covariance_diag,
            ),
            ("reloc_covariance_diag", &self.reloc_covariance_diag),
        ] {
            if diag.iter().any(|v| *v <= 0.0) {
                return Err(SlamError::ConfigInvalid(format!(
                    "{name} entries must be positive"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_submap_size_is_config_invalid() {
        let mut cfg = Config::default();
        cfg.submap_size = 0.0;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), "CONFIG_INVALID");
        assert!(err.is_fatal());
    }

    #[test]
    fn negative_covariance_diag_rejected() {
        let mut cfg = Config::default();
        cfg.reloc_covariance_diag[2] = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = Config::default();
        let text = serde_json::to_string(&cfg).unwrap();
        let parsed = Config::from_json_str(&text).unwrap();
        assert_eq!(parsed.submap_size, cfg.submap_size);
    }
}
