pub mod initializer;

pub use initializer::{
    InitResult, InitializerConfig, PathPose, TrajectoryInitializer, VisualObservation,
};
