//! `slam_node`: the CLI entry point for the crate (SPEC_FULL.md §10
//! "ambient stack"). Replays a recorded sensor log (IMU samples, image
//! track observations, lidar scans, and an optional ground-truth
//! "initialized path") through the trajectory initializer, the three
//! front-ends, the reference estimator, and the submap/loop-closure
//! pipeline, then persists the resulting global map.
//!
//! There is no message transport in this crate (spec.md §1 lists it as
//! an external collaborator), so `slam_node` reads a single JSON log
//! file up front and replays it in timestamp order on one thread: a
//! single-threaded cooperative run loop is one valid realization of
//! the "cooperative task bound to its own single-threaded callback
//! queue" model in spec.md §5, and it avoids racing a channel-based
//! scheduler against the ordering guarantee in spec.md §5 ("every IMU
//! sample in (i, j] MUST be observable before the transaction for
//! stamp j is emitted").

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use nalgebra::{Point2, Point3, Translation3, UnitQuaternion, Vector3};
use serde::Deserialize;

use slam_core::config::{Config, LidarRegistrationMode};
use slam_core::error::RateLimitedLogger;
use slam_core::estimator::reference::ReferenceGraph;
use slam_core::estimator::GraphEstimator;
use slam_core::extrinsics::ExtrinsicsRegistry;
use slam_core::imu::{ImuPreintegrator, NoiseModel};
use slam_core::init::{InitializerConfig, PathPose, TrajectoryInitializer, VisualObservation};
use slam_core::io::persistence::{self, CameraModel, ExtrinsicEntry, TrajectoryEntry};
use slam_core::lidar::matcher::IcpMatcher;
use slam_core::lidar::multi_scan::MultiScanConfig;
use slam_core::lidar::scan_to_map::ScanToMapConfig;
use slam_core::lidar::{LidarFrontEnd, MultiScanRegistration, ScanToMapRegistration};
use slam_core::submap::{
    EuclideanCandidateSearcher, LoopClosureConfig, LoopClosureEngine, SubmapManager,
    SubmapManagerConfig,
};
use slam_core::transaction::{Constraint, Transaction, VariableId, VariableKind, VariableValue};
use slam_core::types::{ImuSample, Keyframe, Pose3, ScanPose};
use slam_core::vision::{FrameInput, Intrinsics, TrackObservation, VisualFrontEnd, VisualFrontEndConfig};

#[derive(Parser, Debug)]
#[command(name = "slam_node", about = "Replay a sensor log through the SLAM back-end core")]
struct Args {
    /// `params.json`-shaped configuration. Falls back to `Config::default()`.
    #[arg(long)]
    params: Option<PathBuf>,

    /// Recorded sensor log (see `SensorLog` for the JSON shape).
    #[arg(long)]
    log: PathBuf,

    /// `camera_model.json`-shaped intrinsics. Falls back to a
    /// placeholder 640x480 pinhole model.
    #[arg(long)]
    camera: Option<PathBuf>,

    /// `extrinsics.json`-shaped transform list. Falls back to identity
    /// transforms for camera/lidar/imu -> baselink.
    #[arg(long)]
    extrinsics: Option<PathBuf>,

    /// Directory the persisted run layout (spec.md §6) is written to.
    #[arg(long, default_value = "slam_output")]
    out: PathBuf,
}

#[derive(Deserialize)]
struct LogImuSample {
    stamp: f64,
    omega: [f64; 3],
    accel: [f64; 3],
}

#[derive(Deserialize)]
struct LogTrackObservation {
    track_id: u64,
    pixel: [f64; 2],
}

#[derive(Deserialize)]
struct LogImageFrame {
    stamp: f64,
    observations: Vec<LogTrackObservation>,
}

#[derive(Deserialize)]
struct LogLidarScan {
    stamp: f64,
    points: Vec<[f64; 3]>,
}

#[derive(Deserialize)]
struct LogPathPose {
    stamp: f64,
    /// (x, y, z)
    position: [f64; 3],
    /// (x, y, z, w)
    quaternion: [f64; 4],
}

#[derive(Deserialize, Default)]
struct SensorLog {
    #[serde(default)]
    imu: Vec<LogImuSample>,
    #[serde(default)]
    images: Vec<LogImageFrame>,
    #[serde(default)]
    lidar: Vec<LogLidarScan>,
    #[serde(default)]
    initialized_path: Option<Vec<LogPathPose>>,
}

enum Event {
    Imu(ImuSample),
    Image(FrameInput),
    Lidar(f64, Vec<Point3<f64>>),
}

impl Event {
    fn stamp(&self) -> f64 {
        match self {
            Event::Imu(s) => s.stamp,
            Event::Image(f) => f.stamp,
            Event::Lidar(stamp, _) => *stamp,
        }
    }

    /// Tie-break for identical stamps: IMU before image before lidar,
    /// so the IMU-before-keyframe ordering guarantee always holds.
    fn rank(&self) -> u8 {
        match self {
            Event::Imu(_) => 0,
            Event::Image(_) => 1,
            Event::Lidar(..) => 2,
        }
    }
}

fn load_log(path: &PathBuf) -> Result<(Vec<Event>, Option<Vec<PathPose>>)> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading log {path:?}"))?;
    let log: SensorLog = serde_json::from_str(&text).with_context(|| "parsing sensor log JSON")?;

    let path_poses = log.initialized_path.map(|poses| {
        poses
            .into_iter()
            .map(|p| PathPose {
                stamp: p.stamp,
                pose: Pose3::from_parts(
                    Translation3::new(p.position[0], p.position[1], p.position[2]),
                    UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                        p.quaternion[3],
                        p.quaternion[0],
                        p.quaternion[1],
                        p.quaternion[2],
                    )),
                ),
            })
            .collect()
    });

    let mut events: Vec<Event> = Vec::new();
    for s in log.imu {
        events.push(Event::Imu(ImuSample {
            stamp: s.stamp,
            omega: Vector3::new(s.omega[0], s.omega[1], s.omega[2]),
            accel: Vector3::new(s.accel[0], s.accel[1], s.accel[2]),
        }));
    }
    for f in log.images {
        events.push(Event::Image(FrameInput {
            stamp: f.stamp,
            observations: f
                .observations
                .into_iter()
                .map(|o| TrackObservation {
                    track_id: o.track_id,
                    pixel: Point2::new(o.pixel[0], o.pixel[1]),
                })
                .collect(),
        }));
    }
    for s in log.lidar {
        let points = s.points.iter().map(|p| Point3::new(p[0], p[1], p[2])).collect();
        events.push(Event::Lidar(s.stamp, points));
    }
    events.sort_by(|a, b| a.stamp().partial_cmp(&b.stamp()).unwrap().then(a.rank().cmp(&b.rank())));

    Ok((events, path_poses))
}

fn classify_observations(front: &VisualFrontEnd, observations: &[TrackObservation]) -> (Vec<u64>, Vec<u64>) {
    let mut triangulated = Vec::new();
    let mut untriangulated = Vec::new();
    for obs in observations {
        if front.landmarks().is_triangulated(obs.track_id) {
            triangulated.push(obs.track_id);
        } else {
            untriangulated.push(obs.track_id);
        }
    }
    triangulated.sort_unstable();
    untriangulated.sort_unstable();
    (triangulated, untriangulated)
}

fn build_lidar_front_end(cfg: &Config) -> Box<dyn LidarFrontEnd> {
    let correspondence_distance = (cfg.outlier_threshold_t * 3.0).max(0.3);
    match cfg.lidar_registration_mode {
        LidarRegistrationMode::MultiScan => Box::new(MultiScanRegistration::new(
            MultiScanConfig {
                num_neighbors: cfg.num_neighbors,
                outlier_threshold_t: cfg.outlier_threshold_t,
                outlier_threshold_r: cfg.outlier_threshold_r,
                min_motion_trans_m: cfg.min_motion_trans_m,
                min_motion_rot_rad: cfg.min_motion_rot_rad,
                lag_duration: cfg.lag_duration,
                fix_first_scan: cfg.fix_first_scan,
                lidar_information_weight: cfg.lidar_information_weight,
            },
            IcpMatcher::new(correspondence_distance),
        )),
        LidarRegistrationMode::ScanToMap => Box::new(ScanToMapRegistration::new(
            ScanToMapConfig {
                map_size: cfg.map_size,
                outlier_threshold_t: cfg.outlier_threshold_t,
                outlier_threshold_r: cfg.outlier_threshold_r,
                lidar_information_weight: cfg.lidar_information_weight,
            },
            IcpMatcher::new(correspondence_distance),
        )),
    }
}

fn optimized_trajectory(graph: &ReferenceGraph) -> Vec<TrajectoryEntry> {
    let snapshot = graph.snapshot();
    let mut entries: Vec<TrajectoryEntry> = snapshot
        .values
        .iter()
        .filter(|(id, _)| id.kind == VariableKind::Pose)
        .filter_map(|(id, value)| match value {
            VariableValue::Pose(pose) => Some(TrajectoryEntry { stamp: id.stamp(), pose: *pose }),
            _ => None,
        })
        .collect();
    entries.sort_by(|a, b| a.stamp.partial_cmp(&b.stamp).unwrap());
    entries
}

/// Pulls the optimized anchor pose for `index` from the graph and
/// updates the submap, if that variable has been solved yet.
fn refresh_submap_anchor(submaps: &mut SubmapManager, graph: &ReferenceGraph, index: usize) {
    let Some(anchor_stamp) = submaps.submap(index).map(|s| s.anchor_keyframe_stamp) else {
        return;
    };
    if let Some(VariableValue::Pose(p)) = graph.variable(&VariableId::pose(anchor_stamp)) {
        submaps.update_anchor(index, p);
    }
}

fn run(args: Args) -> Result<()> {
    let cfg = match &args.params {
        Some(path) => Config::from_json_file(path).map_err(anyhow::Error::from)?,
        None => Config::default(),
    };
    info!(
        "slam_node starting at {} (init_mode={:?}, lidar_mode={:?})",
        chrono::Utc::now().to_rfc3339(),
        cfg.init_mode,
        cfg.lidar_registration_mode
    );

    let intrinsics = match &args.camera {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {path:?}"))?;
            let model: CameraModel = serde_json::from_str(&text)?;
            Intrinsics::from(model)
        }
        None => Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 },
    };

    let extrinsics_registry = ExtrinsicsRegistry::new_static();
    match &args.extrinsics {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {path:?}"))?;
            let entries: Vec<ExtrinsicEntry> = serde_json::from_str(&text)?;
            for e in entries {
                extrinsics_registry.set(&e.from, &e.to, e.transform);
            }
        }
        None => {
            for frame in ["camera", "lidar", "imu"] {
                extrinsics_registry.set(frame, "baselink", Pose3::identity());
            }
        }
    }

    let (events, path) = load_log(&args.log)?;

    let mut imu = ImuPreintegrator::new(NoiseModel::default(), Vector3::new(0.0, 0.0, -9.81), 1e-6);
    imu.set_start(0.0, None, None, None);

    let mut visual = VisualFrontEnd::new(
        VisualFrontEndConfig {
            keyframe_min_time_in_seconds: cfg.keyframe_min_time_in_seconds,
            keyframe_parallax: cfg.keyframe_parallax,
            keyframe_tracks_drop: cfg.keyframe_tracks_drop,
            window_size: cfg.window_size,
            max_triangulation_distance: cfg.max_triangulation_distance,
            reprojection_information_weight: cfg.reprojection_information_weight,
            max_localization_iterations: 20,
        },
        intrinsics,
    );
    let mut lidar_front_end = build_lidar_front_end(&cfg);
    let mut initializer = TrajectoryInitializer::new(InitializerConfig {
        init_mode: cfg.init_mode,
        candidate_frame_gate_s: cfg.initialization_window_s,
        min_trajectory_length_m: cfg.min_trajectory_length_m,
        min_visual_parallax: cfg.min_visual_parallax,
        max_optimization_s: cfg.max_optimization_s,
        sigma_prior: 1e-6,
    });
    if let Some(path) = path {
        initializer.set_initialized_path(path);
    }

    let mut graph = ReferenceGraph::new();
    let mut submaps = SubmapManager::new(SubmapManagerConfig {
        submap_size: cfg.submap_size,
        local_mapper_covariance_diag: cfg.local_mapper_covariance_diag,
    });
    // `candidate_search_radius`/`transform_change_limit` have no direct
    // params.json counterpart; derived from submap_size/outlier
    // thresholds the way the loop-closure tests in this crate do.
    let mut loop_closure = LoopClosureEngine::new(
        LoopClosureConfig {
            candidate_search_radius: cfg.submap_size * 1.5,
            transform_change_limit: cfg.outlier_threshold_t.max(0.2),
            reloc_covariance_diag: cfg.reloc_covariance_diag,
        },
        EuclideanCandidateSearcher { max_distance: cfg.submap_size * 1.5 },
        IcpMatcher::new((cfg.outlier_threshold_t * 3.0).max(0.3)),
    );
    let mut rate_limited = RateLimitedLogger::default();

    let mut initialized = false;
    let mut deltas: Vec<(f64, f64, slam_core::imu::PreintegratedDelta)> = Vec::new();
    let mut track_history: HashMap<u64, Vec<VisualObservation>> = HashMap::new();
    let mut last_lidar_pose = Pose3::identity();
    let mut keyframe_count = 0usize;
    let mut trajectory_initial: Vec<TrajectoryEntry> = Vec::new();

    for event in events {
        match event {
            Event::Imu(sample) => {
                if let Err(e) = imu.push_sample(sample) {
                    rate_limited.report(&e);
                }
            }
            Event::Image(frame) => {
                let stamp = frame.stamp;
                for obs in &frame.observations {
                    track_history
                        .entry(obs.track_id)
                        .or_default()
                        .push(VisualObservation { stamp, pixel: obs.pixel });
                }

                if !initialized {
                    if initializer.push_candidate_frame(stamp) {
                        let txn = imu.register_preintegrated_factor(stamp, None, None);
                        if let Some((stamp_i, stamp_j, delta)) = txn.constraints.iter().find_map(|c| match c {
                            Constraint::Preintegrated { pose_i, pose_j, delta, .. } => {
                                Some((pose_i.stamp(), pose_j.stamp(), delta.clone()))
                            }
                            _ => None,
                        }) {
                            deltas.push((stamp_i, stamp_j, delta));
                        }
                    }

                    if initializer.candidate_stamps().len() >= 3 {
                        let result = match initializer.try_path_seeded(&deltas, &track_history, intrinsics) {
                            Ok(r) if r.success => Ok(r),
                            _ => initializer.try_pure_visual(&deltas, &track_history, intrinsics),
                        };
                        match result {
                            Ok(result) if result.success => {
                                info!(
                                    "initialization succeeded: gravity |g|={:.4}, {} keyframes",
                                    result.gravity.norm(),
                                    result.keyframe_states.len()
                                );
                                graph.apply(result.transaction);
                                graph.optimize(Some(cfg.max_optimization_s));
                                trajectory_initial = optimized_trajectory(&graph);
                                if let Some((last_stamp, last_state)) = result.keyframe_states.last() {
                                    imu.set_start(
                                        *last_stamp,
                                        Some(last_state.orientation),
                                        Some(last_state.position),
                                        Some(last_state.velocity),
                                    );
                                }
                                initialized = true;
                            }
                            Ok(_) => {}
                            Err(e) => rate_limited.report(&e),
                        }
                    }
                    continue;
                }

                if let Err(e) = visual.add_image(frame.clone()) {
                    rate_limited.report(&e);
                    continue;
                }

                let (pose, triangulated_ids, untriangulated_ids) = match visual.localize(stamp) {
                    Ok(r) => r,
                    Err(e) => {
                        rate_limited.report(&e);
                        let predicted = imu.predict_pose(stamp).unwrap_or_else(|_| {
                            Pose3::from_parts(Translation3::from(imu.anchor().position), imu.anchor().orientation)
                        });
                        let (t, u) = classify_observations(&visual, &frame.observations);
                        (predicted, t, u)
                    }
                };

                if !visual.is_keyframe(stamp, &triangulated_ids, &untriangulated_ids, &pose) {
                    visual.note_non_keyframe();
                    continue;
                }

                let mut txn = Transaction::default();
                txn.merge(imu.register_preintegrated_factor(
                    stamp,
                    Some(pose.rotation),
                    Some(pose.translation.vector),
                ));
                txn.merge(visual.extend_map(stamp, pose, &triangulated_ids, &untriangulated_ids));
                txn.merge(submaps.on_trajectory_update(stamp, pose));
                graph.apply(txn);
                graph.optimize(None);

                imu.update_from_graph(&graph);
                visual.update_from_graph(&graph);

                let position = Point3::from(pose.translation.vector);
                if let Some(index) = submaps.assign(&position) {
                    submaps.append_keyframe(
                        index,
                        Keyframe { stamp, pose, observed_landmarks: triangulated_ids.clone() },
                    );
                    refresh_submap_anchor(&mut submaps, &graph, index);
                }

                if submaps.submaps().len() >= 2 {
                    let (archive, query) = submaps.submaps().split_at(submaps.submaps().len() - 1);
                    let loop_txn = loop_closure.try_close(&query[0], archive);
                    if !loop_txn.is_empty() {
                        info!("loop closure constraint emitted against submap archive");
                        graph.apply(loop_txn);
                        graph.optimize(None);
                    }
                }

                keyframe_count += 1;
            }
            Event::Lidar(stamp, points) => {
                let scan = ScanPose::new(stamp, last_lidar_pose, points.clone());
                let txn = lidar_front_end.register(scan);
                if txn.is_empty() {
                    continue;
                }
                graph.apply(txn);
                graph.optimize(None);
                if let Some(VariableValue::Pose(p)) = graph.variable(&VariableId::pose(stamp)) {
                    last_lidar_pose = p;
                    let position = Point3::from(p.translation.vector);
                    if let Some(index) = submaps.assign(&position) {
                        submaps.append_lidar_points(index, &points);
                    }
                }
            }
        }
    }

    graph.optimize(Some(cfg.max_optimization_s));
    let trajectory_optimized = optimized_trajectory(&graph);
    info!(
        "replay complete: {} keyframes, {} submaps, {} variables, {} constraints",
        keyframe_count,
        submaps.submaps().len(),
        graph.num_variables(),
        graph.num_constraints()
    );

    std::fs::create_dir_all(&args.out).with_context(|| format!("creating {:?}", args.out))?;
    persistence::save_config(&args.out, &cfg).map_err(anyhow::Error::from)?;
    persistence::save_camera_model(&args.out, &CameraModel::from(intrinsics)).map_err(anyhow::Error::from)?;
    let extrinsic_entries: Vec<ExtrinsicEntry> = extrinsics_registry
        .snapshot_static()
        .into_iter()
        .map(|(from, to, transform)| ExtrinsicEntry { from, to, transform })
        .collect();
    persistence::save_extrinsics(&args.out, &extrinsic_entries).map_err(anyhow::Error::from)?;
    persistence::save_frame_ids(&args.out, &["baselink".into(), "camera".into(), "lidar".into(), "imu".into()])
        .map_err(anyhow::Error::from)?;
    persistence::save_global_map(
        &args.out,
        submaps.submaps(),
        &trajectory_optimized,
        if trajectory_initial.is_empty() { None } else { Some(&trajectory_initial) },
    )
    .map_err(anyhow::Error::from)?;

    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        warn!("slam_node aborting: {e:#}");
        return Err(e);
    }
    Ok(())
}
