//! The point-cloud matcher capability set (spec.md §9: `Matcher` =
//! {`set_ref`, `set_target`, `match`, `result`, `info`}). `IcpMatcher`
//! is the in-crate reference implementation — point-to-point ICP with
//! nearest-neighbor correspondence via an `rstar` R-tree, grounded in
//! the spatial-index pattern this corpus already uses for nearest-road
//! lookups.

use nalgebra::{Isometry3, Matrix3, Matrix6, Point3, Translation3, UnitQuaternion};
use rstar::{PointDistance, RTree, RTreeObject, AABB};

const MAX_ICP_ITERATIONS: usize = 20;
const CONVERGENCE_DELTA: f64 = 1e-7;

#[derive(Clone, Copy, Debug)]
struct IndexedPoint {
    point: Point3<f64>,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 3]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.point.x, self.point.y, self.point.z])
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, other: &[f64; 3]) -> f64 {
        (self.point.x - other[0]).powi(2)
            + (self.point.y - other[1]).powi(2)
            + (self.point.z - other[2]).powi(2)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatcherOutcome {
    Converged,
    Diverged,
}

/// The capability set named in spec.md §9, modeled as a trait so the
/// lidar front-ends don't depend on a concrete matcher.
pub trait Matcher {
    fn set_ref(&mut self, points: &[Point3<f64>]);
    fn set_target(&mut self, points: &[Point3<f64>]);
    /// Runs the match from `initial_guess` (`T_ref_target`).
    fn run_match(&mut self, initial_guess: Isometry3<f64>) -> MatcherOutcome;
    fn result(&self) -> Isometry3<f64>;
    /// Reported information (inverse covariance) of the last result.
    fn info(&self) -> Matrix6<f64>;
}

/// Point-to-point ICP (Kabsch/SVD rigid-alignment step per iteration).
pub struct IcpMatcher {
    reference: Vec<Point3<f64>>,
    target: Vec<Point3<f64>>,
    tree: Option<RTree<IndexedPoint>>,
    result: Isometry3<f64>,
    info: Matrix6<f64>,
    max_correspondence_distance: f64,
}

impl IcpMatcher {
    pub fn new(max_correspondence_distance: f64) -> Self {
        Self {
            reference: Vec::new(),
            target: Vec::new(),
            tree: None,
            result: Isometry3::identity(),
            info: Matrix6::identity(),
            max_correspondence_distance,
        }
    }

    fn nearest(&self, query: &Point3<f64>) -> Option<Point3<f64>> {
        self.tree
            .as_ref()?
            .nearest_neighbor(&[query.x, query.y, query.z])
            .map(|p| p.point)
    }

    /// Kabsch algorithm: optimal rigid transform aligning `src` onto
    /// `dst` in the least-squares sense.
    fn kabsch(src: &[Point3<f64>], dst: &[Point3<f64>]) -> Isometry3<f64> {
        let n = src.len() as f64;
        let centroid_src: Point3<f64> = Point3::from(
            src.iter().map(|p| p.coords).sum::<nalgebra::Vector3<f64>>() / n,
        );
        let centroid_dst: Point3<f64> = Point3::from(
            dst.iter().map(|p| p.coords).sum::<nalgebra::Vector3<f64>>() / n,
        );

        let mut h = Matrix3::zeros();
        for (s, d) in src.iter().zip(dst.iter()) {
            let ds = s - centroid_src;
            let dd = d - centroid_dst;
            h += ds * dd.transpose();
        }

        let svd = h.svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            return Isometry3::identity();
        };
        let mut d = Matrix3::identity();
        if (v_t.transpose() * u.transpose()).determinant() < 0.0 {
            d[(2, 2)] = -1.0;
        }
        let r = v_t.transpose() * d * u.transpose();
        let rotation = UnitQuaternion::from_matrix(&r);
        let translation = centroid_dst.coords - rotation * centroid_src.coords;
        Isometry3::from_parts(Translation3::from(translation), rotation)
    }
}

impl Matcher for IcpMatcher {
    fn set_ref(&mut self, points: &[Point3<f64>]) {
        self.reference = points.to_vec();
        self.tree = Some(RTree::bulk_load(
            points.iter().map(|p| IndexedPoint { point: *p }).collect(),
        ));
    }

    fn set_target(&mut self, points: &[Point3<f64>]) {
        self.target = points.to_vec();
    }

    fn run_match(&mut self, initial_guess: Isometry3<f64>) -> MatcherOutcome {
        if self.reference.is_empty() || self.target.is_empty() {
            return MatcherOutcome::Diverged;
        }
        let mut estimate = initial_guess;
        let mut last_correspondences = 0usize;

        for _ in 0..MAX_ICP_ITERATIONS {
            let mut src = Vec::with_capacity(self.target.len());
            let mut dst = Vec::with_capacity(self.target.len());
            for p in &self.target {
                let transformed = estimate * p;
                if let Some(nearest) = self.nearest(&transformed) {
                    if (nearest - transformed).norm() <= self.max_correspondence_distance {
                        src.push(*p);
                        dst.push(nearest);
                    }
                }
            }
            if src.len() < 3 {
                return MatcherOutcome::Diverged;
            }
            last_correspondences = src.len();
            let step = Self::kabsch(&src, &dst);
            let delta = (step.translation.vector - estimate.translation.vector).norm();
            estimate = step;
            if delta < CONVERGENCE_DELTA {
                break;
            }
        }

        self.result = estimate;
        let scale = 1.0 / (last_correspondences as f64).max(1.0);
        self.info = Matrix6::identity() * (1.0 / scale.max(1e-6));
        MatcherOutcome::Converged
    }

    fn result(&self) -> Isometry3<f64> {
        self.result
    }

    fn info(&self) -> Matrix6<f64> {
        self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn icp_recovers_known_translation() {
        let reference: Vec<Point3<f64>> = (0..50)
            .map(|i| Point3::new(i as f64 * 0.1, (i as f64 * 0.3).sin(), 0.0))
            .collect();
        let translation = Translation3::new(0.3, -0.1, 0.0);
        let target: Vec<Point3<f64>> = reference.iter().map(|p| translation.inverse() * p).collect();

        let mut matcher = IcpMatcher::new(1.0);
        matcher.set_ref(&reference);
        matcher.set_target(&target);
        let outcome = matcher.run_match(Isometry3::identity());
        assert_eq!(outcome, MatcherOutcome::Converged);

        let recovered = matcher.result();
        assert_relative_eq!(
            recovered.translation.vector,
            translation.vector,
            epsilon = 1e-2
        );
    }

    #[test]
    fn empty_clouds_diverge() {
        let mut matcher = IcpMatcher::new(1.0);
        matcher.set_ref(&[]);
        matcher.set_target(&[]);
        assert_eq!(matcher.run_match(Isometry3::identity()), MatcherOutcome::Diverged);
    }
}
