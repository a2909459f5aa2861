//! Heap snapshot strategy and its per-registry cache.
//!
//! When an execution context first touches a heap object that lives in an ancestor
//! frame, it takes a snapshot into its own frame. The [`CloneStrategy`] decides how:
//! instances of immutable classes are shared, everything else is copied.
//!
//! Deriving a strategy walks the configured immutable classes and resolves each one, so
//! strategies are cached process-wide, keyed by the identity of the [`ClassManager`] they
//! were derived from. Graphs of the same virtual machine share one strategy, a virtual
//! machine with a different registry never sees another registry's strategy. An entry
//! holds only a weak handle to its registry and is evicted when the registry is dropped.

use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use rustc_hash::FxHashSet;

use crate::emulation::{
    classes::{ClassManager, RegistryId},
    value::HeapObject,
    VmConfig,
};

/// Classes the runtime library guarantees to be immutable.
const BUILTIN_IMMUTABLE: &[&str] = &[
    "Ljava/lang/String;",
    "Ljava/lang/Boolean;",
    "Ljava/lang/Byte;",
    "Ljava/lang/Character;",
    "Ljava/lang/Short;",
    "Ljava/lang/Integer;",
    "Ljava/lang/Long;",
    "Ljava/lang/Float;",
    "Ljava/lang/Double;",
    "Ljava/lang/Class;",
    "Ljava/math/BigInteger;",
];

struct CacheEntry {
    registry: Weak<ClassManager>,
    strategy: Arc<CloneStrategy>,
}

fn cache() -> &'static DashMap<RegistryId, CacheEntry> {
    static CACHE: OnceLock<DashMap<RegistryId, CacheEntry>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// Removes the cached strategy of `registry`.
pub(crate) fn evict(registry: RegistryId) {
    cache().remove(&registry);
}

/// Decides whether a heap object is shared or copied into a new frame.
#[derive(Debug)]
pub struct CloneStrategy {
    registry: RegistryId,
    shared: FxHashSet<Arc<str>>,
}

impl CloneStrategy {
    /// Returns the strategy for `registry`, building and caching it on first use.
    #[must_use]
    pub fn for_registry(registry: &Arc<ClassManager>, config: &VmConfig) -> Arc<CloneStrategy> {
        let id = registry.id();
        let cached = cache()
            .get(&id)
            .map(|entry| (entry.registry.clone(), Arc::clone(&entry.strategy)));
        if let Some((owner, strategy)) = cached {
            if owner.upgrade().is_some() {
                return strategy;
            }
        }

        let strategy = Arc::new(Self::build(registry, config));
        cache().insert(
            id,
            CacheEntry {
                registry: Arc::downgrade(registry),
                strategy: Arc::clone(&strategy),
            },
        );
        strategy
    }

    /// Returns `true` if a strategy for `registry` is currently cached.
    #[must_use]
    pub fn is_cached(registry: RegistryId) -> bool {
        cache().contains_key(&registry)
    }

    fn build(registry: &ClassManager, config: &VmConfig) -> CloneStrategy {
        let mut shared: FxHashSet<Arc<str>> =
            BUILTIN_IMMUTABLE.iter().map(|class| Arc::from(*class)).collect();

        for class in &config.immutable_classes {
            // Primitives, inner classes and runtime library classes are not resolved.
            if class.len() <= 1 || class.contains('$') || class.starts_with("Ljava/") {
                continue;
            }
            if !registry.contains(class) {
                log::error!("Unable to resolve immutable class (not found): {}", class);
                continue;
            }
            shared.insert(class.as_str().into());
        }

        CloneStrategy {
            registry: registry.id(),
            shared,
        }
    }

    /// Returns the registry this strategy was derived from.
    #[must_use]
    pub fn registry(&self) -> RegistryId {
        self.registry
    }

    /// Returns `true` if instances of `class` are shared between frames.
    #[must_use]
    pub fn shares(&self, class: &str) -> bool {
        self.shared.contains(class)
    }

    /// Takes a snapshot of `object` for a new frame.
    #[must_use]
    pub fn snapshot(&self, object: &Arc<HeapObject>) -> Arc<HeapObject> {
        if self.shares(&object.class) {
            Arc::clone(object)
        } else {
            Arc::new(HeapObject::clone(object))
        }
    }
}
