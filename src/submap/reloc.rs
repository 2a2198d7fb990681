//! Relocalization against offline and online submaps (spec.md §4.7).

use nalgebra::{Isometry3, Point3};

use crate::lidar::{Matcher, MatcherOutcome};
use crate::types::Submap;

#[derive(Clone, Debug)]
pub struct RelocRequest {
    pub stamp: f64,
    pub t_worldlm_baselink: Isometry3<f64>,
    pub query_cloud: Option<Vec<Point3<f64>>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RelocOutcome {
    Matched { submap_index: usize, t_worldlm_query: Isometry3<f64> },
    NoUpdate,
    NotFound,
}

/// Searches offline submaps first, then online, returning the first
/// submap for which refinement succeeds. Caches the offline-to-online
/// world alignment on first success (spec.md §4.7).
pub struct Relocalizer<M: Matcher> {
    matcher: M,
    offline_to_online: Option<Isometry3<f64>>,
    active_submap: Option<usize>,
}

impl<M: Matcher> Relocalizer<M> {
    pub fn new(matcher: M) -> Self {
        Self {
            matcher,
            offline_to_online: None,
            active_submap: None,
        }
    }

    pub fn active_submap(&self) -> Option<usize> {
        self.active_submap
    }

    pub fn resolve(
        &mut self,
        request: &RelocRequest,
        offline: &[Submap],
        online: &[Submap],
    ) -> RelocOutcome {
        let Some(cloud) = &request.query_cloud else {
            return RelocOutcome::NotFound;
        };

        for (submap, is_offline) in offline.iter().map(|s| (s, true)).chain(online.iter().map(|s| (s, false))) {
            self.matcher.set_ref(&submap.lidar_points);
            self.matcher.set_target(cloud);
            if self.matcher.run_match(request.t_worldlm_baselink) != MatcherOutcome::Converged {
                continue;
            }
            let refined = self.matcher.result();

            if !is_offline && Some(submap.index) == self.active_submap {
                return RelocOutcome::NoUpdate;
            }
            if is_offline && self.offline_to_online.is_none() {
                self.offline_to_online = Some(refined);
            }

            self.active_submap = Some(submap.index);
            return RelocOutcome::Matched {
                submap_index: submap.index,
                t_worldlm_query: refined,
            };
        }
        RelocOutcome::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lidar::IcpMatcher;
    use nalgebra::Translation3;

    fn cloud(offset: f64) -> Vec<Point3<f64>> {
        (0..40).map(|i| Point3::new(i as f64 * 0.1 + offset, (i as f64 * 0.1).cos(), 0.0)).collect()
    }

    fn make_submap(index: usize, x: f64) -> Submap {
        let pose = Isometry3::from_parts(Translation3::new(x, 0.0, 0.0), nalgebra::UnitQuaternion::identity());
        let mut s = Submap::new(index, index as f64, pose);
        s.lidar_points = cloud(x);
        s
    }

    #[test]
    fn matches_first_successful_submap() {
        let mut reloc = Relocalizer::new(IcpMatcher::new(0.5));
        let online = vec![make_submap(0, 0.0)];
        let request = RelocRequest {
            stamp: 0.0,
            t_worldlm_baselink: Isometry3::identity(),
            query_cloud: Some(cloud(0.0)),
        };
        let outcome = reloc.resolve(&request, &[], &online);
        assert!(matches!(outcome, RelocOutcome::Matched { submap_index: 0, .. }));
    }

    #[test]
    fn no_cloud_means_not_found() {
        let mut reloc = Relocalizer::new(IcpMatcher::new(0.5));
        let request = RelocRequest {
            stamp: 0.0,
            t_worldlm_baselink: Isometry3::identity(),
            query_cloud: None,
        };
        let outcome = reloc.resolve(&request, &[], &[]);
        assert_eq!(outcome, RelocOutcome::NotFound);
    }
}
