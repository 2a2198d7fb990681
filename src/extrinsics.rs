//! Process-wide lookup of rigid transforms between sensor frames and
//! the baselink frame (spec.md §2, §5).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use nalgebra::Isometry3;

use crate::error::{SlamError, SlamResult};

/// A source that can refresh a transform at runtime (dynamic mode).
/// Static-extrinsics deployments never call this; it exists so the
/// registry can be backed by a live transform broadcaster without
/// changing call sites.
pub trait TransformSource: Send + Sync {
    fn lookup(&self, from: &str, to: &str) -> Option<Isometry3<f64>>;
}

/// Extrinsics registry. Callers always receive an owned copy, never a
/// reference, so front-ends never hold a lock across a suspension
/// point (spec.md §5).
pub struct ExtrinsicsRegistry {
    static_transforms: RwLock<HashMap<(String, String), Isometry3<f64>>>,
    dynamic_source: Option<Arc<dyn TransformSource>>,
}

impl ExtrinsicsRegistry {
    pub fn new_static() -> Self {
        Self {
            static_transforms: RwLock::new(HashMap::new()),
            dynamic_source: None,
        }
    }

    pub fn new_dynamic(source: Arc<dyn TransformSource>) -> Self {
        Self {
            static_transforms: RwLock::new(HashMap::new()),
            dynamic_source: Some(source),
        }
    }

    /// Register (or overwrite) a static transform `from -> to`.
    pub fn set(&self, from: &str, to: &str, transform: Isometry3<f64>) {
        self.static_transforms
            .write()
            .unwrap()
            .insert((from.to_string(), to.to_string()), transform);
    }

    /// Look up `from -> to`. Under dynamic mode, tries the live source
    /// first and falls back to whatever static value was last cached;
    /// under static mode only the registered table is consulted.
    pub fn get(&self, from: &str, to: &str) -> SlamResult<Isometry3<f64>> {
        if from == to {
            return Ok(Isometry3::identity());
        }
        if let Some(source) = &self.dynamic_source {
            if let Some(t) = source.lookup(from, to) {
                self.set(from, to, t);
                return Ok(t);
            }
        }
        self.static_transforms
            .read()
            .unwrap()
            .get(&(from.to_string(), to.to_string()))
            .copied()
            .ok_or_else(|| SlamError::ExtrinsicsMissing {
                from: from.to_string(),
                to: to.to_string(),
            })
    }

    /// Dumps every statically registered (or dynamically cached)
    /// transform, for persistence into `extrinsics.json`.
    pub fn snapshot_static(&self) -> Vec<(String, String, Isometry3<f64>)> {
        self.static_transforms
            .read()
            .unwrap()
            .iter()
            .map(|((from, to), t)| (from.clone(), to.clone(), *t))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Translation3, UnitQuaternion};

    #[test]
    fn identity_for_same_frame() {
        let reg = ExtrinsicsRegistry::new_static();
        assert_eq!(reg.get("baselink", "baselink").unwrap(), Isometry3::identity());
    }

    #[test]
    fn missing_transform_is_reported() {
        let reg = ExtrinsicsRegistry::new_static();
        let err = reg.get("camera", "baselink").unwrap_err();
        assert_eq!(err.kind(), "EXTRINSICS_MISSING");
    }

    #[test]
    fn registered_transform_round_trips() {
        let reg = ExtrinsicsRegistry::new_static();
        let t = Isometry3::from_parts(
            Translation3::new(1.0, 2.0, 3.0),
            UnitQuaternion::identity(),
        );
        reg.set("lidar", "baselink", t);
        assert_eq!(reg.get("lidar", "baselink").unwrap(), t);
    }
}
