//! Pipeline Reflection Cache
//!
//! Descriptor-set and binding metadata is produced by the offline shader
//! tool; the runtime only caches it. The cache is the one piece of state
//! shared process-wide per graph: a lazily populated, write-once-per-key
//! concurrent map. Executors consult it to derive the stage and access sets
//! for resources bound through argument buffers.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::graph::pass::{AccessFlags, StageFlags};

/// Reflection data for one binding slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingReflection {
    pub slot: u32,
    pub stages: StageFlags,
    pub access: AccessFlags,
}

/// Reflection for one pipeline, keyed by the shader tool's pipeline hash.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PipelineReflection {
    pub bindings: Vec<BindingReflection>,
}

impl PipelineReflection {
    /// Looks up the binding at `slot`.
    #[must_use]
    pub fn binding(&self, slot: u32) -> Option<&BindingReflection> {
        self.bindings.iter().find(|b| b.slot == slot)
    }
}

/// Write-once concurrent reflection cache.
#[derive(Default)]
pub struct ReflectionCache {
    map: RwLock<FxHashMap<u64, Arc<PipelineReflection>>>,
}

impl ReflectionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached reflection for `pipeline_key`, if present.
    #[must_use]
    pub fn get(&self, pipeline_key: u64) -> Option<Arc<PipelineReflection>> {
        self.map.read().get(&pipeline_key).cloned()
    }

    /// Returns the cached entry or inserts the one `produce` builds.
    ///
    /// Write-once: when two threads race, the first insertion wins and the
    /// loser's value is dropped. This may block on the shader-tool
    /// collaborator behind `produce`.
    pub fn get_or_insert_with(
        &self,
        pipeline_key: u64,
        produce: impl FnOnce() -> PipelineReflection,
    ) -> Arc<PipelineReflection> {
        if let Some(existing) = self.get(pipeline_key) {
            return existing;
        }
        let fresh = Arc::new(produce());
        let mut map = self.map.write();
        map.entry(pipeline_key).or_insert(fresh).clone()
    }

    /// Number of cached pipelines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_is_write_once() {
        let cache = ReflectionCache::new();
        let first = cache.get_or_insert_with(7, || PipelineReflection {
            bindings: vec![BindingReflection {
                slot: 0,
                stages: StageFlags::FRAGMENT,
                access: AccessFlags::READ,
            }],
        });
        let second = cache.get_or_insert_with(7, PipelineReflection::default);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn binding_lookup_by_slot() {
        let reflection = PipelineReflection {
            bindings: vec![
                BindingReflection {
                    slot: 0,
                    stages: StageFlags::VERTEX,
                    access: AccessFlags::READ,
                },
                BindingReflection {
                    slot: 3,
                    stages: StageFlags::COMPUTE,
                    access: AccessFlags::WRITE,
                },
            ],
        };
        assert_eq!(reflection.binding(3).unwrap().access, AccessFlags::WRITE);
        assert!(reflection.binding(1).is_none());
    }
}
