//! Lidar front-end (spec.md §4.3): two registration flavors behind a
//! common trait, selected by `Config::lidar_registration_mode`.

pub mod matcher;
pub mod multi_scan;
pub mod scan_to_map;

use crate::transaction::Transaction;
use crate::types::ScanPose;

/// Common contract for both registration flavors. `register` never
/// fails outright — rejected scans and outlier matches simply produce
/// an emptier `Transaction` (spec.md §4.3 gating, §7 propagation
/// policy: per-scan errors are local and never abort the stream).
pub trait LidarFrontEnd {
    fn register(&mut self, scan: ScanPose) -> Transaction;
}

pub use matcher::{IcpMatcher, Matcher, MatcherOutcome};
pub use multi_scan::MultiScanRegistration;
pub use scan_to_map::ScanToMapRegistration;
