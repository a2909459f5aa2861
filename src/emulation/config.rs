//! Configuration for the symbolic virtual machine.

use rustc_hash::FxHashSet;

/// Configuration for the symbolic virtual machine.
///
/// Controls execution limits and which classes and methods may be treated as free of
/// side effects.
///
/// # Examples
///
/// ```rust
/// use dexscope::emulation::VmConfig;
///
/// let config = VmConfig::new()
///     .with_max_address_visits(50)
///     .with_immutable_class("Lcom/example/Key;")
///     .with_pure_method("Lcom/example/Util;->decode(I)I");
/// assert_eq!(config.max_address_visits, 50);
/// assert!(config.is_pure("Lcom/example/Util;->decode(I)I"));
/// ```
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum times a single address may be executed per method (default: 500).
    pub max_address_visits: usize,

    /// Maximum number of executed nodes per method (default: 1,000,000).
    pub max_method_visits: usize,

    /// Class descriptors whose instances are never mutated after construction.
    ///
    /// Instances of these classes are shared between execution contexts instead of being
    /// copied when a context first touches them.
    pub immutable_classes: FxHashSet<String>,

    /// Method references known to have no side effects.
    pub pure_methods: FxHashSet<String>,
}

impl Default for VmConfig {
    fn default() -> Self {
        let immutable_classes = [
            "Ljava/lang/String;",
            "Ljava/lang/Integer;",
            "Ljava/lang/Long;",
            "Ljava/lang/Boolean;",
            "Ljava/lang/Character;",
            "Ljava/lang/Class;",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let pure_methods = [
            "Ljava/lang/String;->length()I",
            "Ljava/lang/String;->charAt(I)C",
            "Ljava/lang/Integer;->valueOf(I)Ljava/lang/Integer;",
            "Ljava/lang/Integer;->intValue()I",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        Self {
            max_address_visits: 500,
            max_method_visits: 1_000_000,
            immutable_classes,
            pure_methods,
        }
    }
}

impl VmConfig {
    /// Creates a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-address visit limit.
    #[must_use]
    pub fn with_max_address_visits(mut self, limit: usize) -> Self {
        self.max_address_visits = limit;
        self
    }

    /// Sets the per-method node limit.
    #[must_use]
    pub fn with_max_method_visits(mut self, limit: usize) -> Self {
        self.max_method_visits = limit;
        self
    }

    /// Marks a class as immutable.
    #[must_use]
    pub fn with_immutable_class(mut self, descriptor: &str) -> Self {
        self.immutable_classes.insert(descriptor.to_string());
        self
    }

    /// Marks a method as free of side effects.
    #[must_use]
    pub fn with_pure_method(mut self, descriptor: &str) -> Self {
        self.pure_methods.insert(descriptor.to_string());
        self
    }

    /// Returns `true` if `descriptor` names a method without side effects.
    #[must_use]
    pub fn is_pure(&self, descriptor: &str) -> bool {
        self.pure_methods.contains(descriptor)
    }

    /// Returns `true` if instances of `descriptor` are never mutated.
    #[must_use]
    pub fn is_immutable(&self, descriptor: &str) -> bool {
        self.immutable_classes.contains(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.max_address_visits, 500);
        assert_eq!(config.max_method_visits, 1_000_000);
        assert!(config.is_immutable("Ljava/lang/String;"));
        assert!(!config.is_pure("Lcom/example/Foo;->bar()V"));
    }

    #[test]
    fn test_builder() {
        let config = VmConfig::new()
            .with_max_method_visits(10)
            .with_immutable_class("LKey;");
        assert_eq!(config.max_method_visits, 10);
        assert!(config.is_immutable("LKey;"));
    }
}
