//! Class metadata registry.
//!
//! A [`ClassManager`] holds the classes the virtual machine knows the implementation of
//! ("local" classes). Each registry has a process-unique [`RegistryId`] that keys the
//! clone strategy cache, and dropping the registry evicts its cache entry.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use rustc_hash::FxHashMap;

use crate::emulation::cloner;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`ClassManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistryId(u64);

impl fmt::Display for RegistryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registry#{}", self.0)
    }
}

/// Metadata of one local class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    /// Class descriptor, e.g. `Lcom/example/Foo;`.
    pub descriptor: Arc<str>,
    /// Super class descriptor.
    pub super_class: Option<Arc<str>>,
    /// Field references declared by the class.
    pub fields: Vec<Arc<str>>,
    /// Method references declared by the class.
    pub methods: Vec<Arc<str>>,
}

impl ClassDef {
    /// Creates a class extending `java.lang.Object` with no members.
    #[must_use]
    pub fn new(descriptor: &str) -> Self {
        ClassDef {
            descriptor: descriptor.into(),
            super_class: Some("Ljava/lang/Object;".into()),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Adds a declared field.
    #[must_use]
    pub fn with_field(mut self, field: &str) -> Self {
        self.fields.push(field.into());
        self
    }

    /// Adds a declared method.
    #[must_use]
    pub fn with_method(mut self, method: &str) -> Self {
        self.methods.push(method.into());
        self
    }
}

/// Registry of local classes.
///
/// Not `Clone`: a copy would share the identity and evict the cache entry of the
/// original when dropped.
#[derive(Debug)]
pub struct ClassManager {
    id: RegistryId,
    classes: FxHashMap<Arc<str>, ClassDef>,
}

impl ClassManager {
    /// Creates an empty registry with a fresh identity.
    #[must_use]
    pub fn new() -> Self {
        ClassManager {
            id: RegistryId(NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed)),
            classes: FxHashMap::default(),
        }
    }

    /// Creates a registry containing `classes`.
    #[must_use]
    pub fn with_classes(classes: impl IntoIterator<Item = ClassDef>) -> Self {
        let mut manager = Self::new();
        for class in classes {
            manager.add_class(class);
        }
        manager
    }

    /// Registers a class, replacing an earlier definition with the same descriptor.
    pub fn add_class(&mut self, class: ClassDef) {
        self.classes.insert(Arc::clone(&class.descriptor), class);
    }

    /// Returns the identity of this registry.
    #[must_use]
    pub fn id(&self) -> RegistryId {
        self.id
    }

    /// Returns the class with the given descriptor.
    #[must_use]
    pub fn get(&self, descriptor: &str) -> Option<&ClassDef> {
        self.classes.get(descriptor)
    }

    /// Returns `true` if `descriptor` names a local class.
    #[must_use]
    pub fn contains(&self, descriptor: &str) -> bool {
        self.classes.contains_key(descriptor)
    }

    /// Returns `true` if `method` is declared by a local class.
    #[must_use]
    pub fn is_local_method(&self, method: &str) -> bool {
        method
            .split_once("->")
            .and_then(|(class, _)| self.classes.get(class))
            .is_some_and(|class| class.methods.iter().any(|m| &**m == method))
    }

    /// Returns the number of registered classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns `true` if no class is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl Default for ClassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ClassManager {
    fn drop(&mut self) {
        cloner::evict(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_identity() {
        let first = ClassManager::new();
        let second = ClassManager::new();
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_local_methods() {
        let manager = ClassManager::with_classes([ClassDef::new("Lcom/example/Foo;")
            .with_field("Lcom/example/Foo;->x:I")
            .with_method("Lcom/example/Foo;->bar()V")]);
        assert!(manager.contains("Lcom/example/Foo;"));
        assert!(manager.is_local_method("Lcom/example/Foo;->bar()V"));
        assert!(!manager.is_local_method("Lcom/example/Foo;->baz()V"));
        assert!(!manager.is_local_method("Lcom/example/Bar;->bar()V"));
        assert_eq!(manager.len(), 1);
    }
}
