//! Loop-closure candidate search and refinement (spec.md §4.6).

use std::collections::HashSet;

use nalgebra::{Isometry3, Matrix6, Point3};

use crate::lidar::{Matcher, MatcherOutcome};
use crate::transaction::{Constraint, SourceTag, Transaction, VariableId};
use crate::types::Submap;

/// Pluggable candidate search (spec.md §4.6 step 1). Default is
/// Euclidean distance between anchor positions below a threshold.
pub trait CandidateSearcher {
    fn search(&self, query: &Submap, archive: &[Submap]) -> Vec<(usize, Isometry3<f64>)>;
}

pub struct EuclideanCandidateSearcher {
    pub max_distance: f64,
}

impl CandidateSearcher for EuclideanCandidateSearcher {
    fn search(&self, query: &Submap, archive: &[Submap]) -> Vec<(usize, Isometry3<f64>)> {
        let mut hits: Vec<(usize, f64, Isometry3<f64>)> = archive
            .iter()
            .filter(|m| m.index != query.index)
            .filter_map(|m| {
                let d = m.distance_to(&Point3::from(query.anchor_current.translation.vector));
                if d <= self.max_distance {
                    Some((m.index, d, m.anchor_current.inverse() * query.anchor_current))
                } else {
                    None
                }
            })
            .collect();
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        hits.into_iter().map(|(idx, _, estimate)| (idx, estimate)).collect()
    }
}

pub struct LoopClosureConfig {
    pub candidate_search_radius: f64,
    pub transform_change_limit: f64,
    pub reloc_covariance_diag: [f64; 6],
}

/// Remembers which (match, query) pairs have already produced a
/// constraint, so at most one is ever emitted per pair (spec.md §4.6
/// policy).
pub struct LoopClosureEngine<S: CandidateSearcher, M: Matcher> {
    cfg: LoopClosureConfig,
    searcher: S,
    matcher: M,
    closed_pairs: HashSet<(usize, usize)>,
}

impl<S: CandidateSearcher, M: Matcher> LoopClosureEngine<S, M> {
    pub fn new(cfg: LoopClosureConfig, searcher: S, matcher: M) -> Self {
        Self {
            cfg,
            searcher,
            matcher,
            closed_pairs: HashSet::new(),
        }
    }

    fn reloc_covariance(&self) -> Matrix6<f64> {
        Matrix6::from_diagonal(&nalgebra::Vector6::from_row_slice(&self.cfg.reloc_covariance_diag))
    }

    /// Runs the full pipeline for a newly completed submap `query`
    /// against every previously archived submap.
    pub fn try_close(&mut self, query: &Submap, archive: &[Submap]) -> Transaction {
        let mut txn = Transaction::default();
        let candidates = self.searcher.search(query, archive);

        for (match_index, estimate) in candidates {
            if match_index + 1 == query.index || match_index == query.index + 1 {
                continue;
            }
            let pair = (match_index, query.index);
            if self.closed_pairs.contains(&pair) {
                continue;
            }
            let Some(matched) = archive.iter().find(|m| m.index == match_index) else {
                continue;
            };

            self.matcher.set_ref(&matched.lidar_points);
            self.matcher.set_target(&query.lidar_points);
            if self.matcher.run_match(estimate) != MatcherOutcome::Converged {
                continue;
            }
            let refined = self.matcher.result();
            let change = (estimate.inverse() * refined).translation.vector.norm();
            if change > self.cfg.transform_change_limit {
                continue;
            }

            txn.constraints.push(Constraint::RelativePose {
                from: VariableId::pose(matched.anchor_keyframe_stamp),
                to: VariableId::pose(query.anchor_keyframe_stamp),
                relative: refined,
                covariance: self.reloc_covariance(),
                source: SourceTag::LoopClosure,
            });
            self.closed_pairs.insert(pair);
        }
        txn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lidar::IcpMatcher;
    use nalgebra::Translation3;

    fn cloud(offset: f64) -> Vec<Point3<f64>> {
        (0..50).map(|i| Point3::new(i as f64 * 0.1 + offset, (i as f64 * 0.1).sin(), 0.0)).collect()
    }

    fn make_submap(index: usize, x: f64, points: Vec<Point3<f64>>) -> Submap {
        let pose = Isometry3::from_parts(Translation3::new(x, 0.0, 0.0), nalgebra::UnitQuaternion::identity());
        let mut s = Submap::new(index, index as f64, pose);
        s.lidar_points = points;
        s
    }

    #[test]
    fn adjacent_submaps_are_filtered_out() {
        let mut engine = LoopClosureEngine::new(
            LoopClosureConfig { candidate_search_radius: 5.0, transform_change_limit: 0.2, reloc_covariance_diag: [0.1; 6] },
            EuclideanCandidateSearcher { max_distance: 5.0 },
            IcpMatcher::new(0.5),
        );
        let query = make_submap(3, 0.05, cloud(0.0));
        let archive = vec![make_submap(2, 0.0, cloud(0.0))];
        let txn = engine.try_close(&query, &archive);
        assert!(txn.is_empty());
    }

    #[test]
    fn revisited_submap_closes_a_loop_once() {
        let mut engine = LoopClosureEngine::new(
            LoopClosureConfig { candidate_search_radius: 5.0, transform_change_limit: 0.5, reloc_covariance_diag: [0.1; 6] },
            EuclideanCandidateSearcher { max_distance: 5.0 },
            IcpMatcher::new(0.5),
        );
        let query = make_submap(5, 0.0, cloud(0.0));
        let archive = vec![make_submap(0, 0.0, cloud(0.0))];
        let txn = engine.try_close(&query, &archive);
        assert_eq!(txn.constraints.len(), 1);
        let txn2 = engine.try_close(&query, &archive);
        assert!(txn2.is_empty());
    }
}
