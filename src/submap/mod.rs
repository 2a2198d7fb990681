//! Submap manager, loop closure, and relocalization (spec.md §4.5-4.7).

pub mod loop_closure;
pub mod manager;
pub mod reloc;

pub use loop_closure::{CandidateSearcher, EuclideanCandidateSearcher, LoopClosureConfig, LoopClosureEngine};
pub use manager::{SubmapManager, SubmapManagerConfig};
pub use reloc::{RelocOutcome, RelocRequest, Relocalizer};
