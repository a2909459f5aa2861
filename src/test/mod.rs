//! Shared fixtures for unit tests.

use std::sync::{atomic::AtomicU64, Arc};

use crate::{
    assembly::parse_smali,
    emulation::{ClassManager, CloneStrategy, ExecutionContext, VirtualMachine, VmConfig},
    graph::ExecutionGraphManipulator,
    method::LocalMethod,
};

/// A branch on an unknown parameter, both edges are executed.
pub const FORKING_METHOD: &str = "
    .registers 3
    const/4 v0, 0x1
    if-eqz v2, :else
    const/4 v0, 0x2
    :else
    add-int/lit8 v1, v0, 0x3
    return v1
";

/// Descriptor of [`FORKING_METHOD`], `v2` holds the parameter.
pub const FORKING_DESCRIPTOR: &str = "Lcom/example/Fork;->pick(I)I";

/// A packed switch on the parameter `v1`, its payload is padded to 0x8.
pub const SWITCH_METHOD: &str = "
    .registers 2
    packed-switch v1, :table
    const/4 v0, 0x0
    return v0
    :one
    const/4 v0, 0x1
    return v0
    :table
    packed-switch-payload 0x1 :one
";

/// Descriptor of [`SWITCH_METHOD`].
pub const SWITCH_DESCRIPTOR: &str = "Lcom/example/Switch;->pick(I)I";

/// Creates a root context of a static method described by `descriptor`.
pub fn root_context(descriptor: &str, registers: u16) -> ExecutionContext {
    let registry = Arc::new(ClassManager::new());
    let strategy = CloneStrategy::for_registry(&registry, &VmConfig::default());
    let method = LocalMethod::new(descriptor, registers, true).unwrap();
    ExecutionContext::root(Arc::new(method), strategy, Arc::new(AtomicU64::new(1)))
}

/// Creates a virtual machine without local classes.
pub fn virtual_machine() -> Arc<VirtualMachine> {
    Arc::new(VirtualMachine::new(
        Arc::new(ClassManager::new()),
        VmConfig::default(),
    ))
}

/// Parses and executes `smali` as the static method `descriptor`.
pub fn manipulator(smali: &str, descriptor: &str) -> ExecutionGraphManipulator {
    let implementation = parse_smali(smali).unwrap();
    let method =
        LocalMethod::new(descriptor, implementation.register_count(), true).unwrap();
    ExecutionGraphManipulator::build(virtual_machine(), Arc::new(method), implementation)
        .unwrap()
}
