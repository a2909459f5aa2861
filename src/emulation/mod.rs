//! Symbolic execution of Dalvik methods.
//!
//! This module provides the collaborators the execution graph is built from and rewired
//! with:
//!
//! - [`VirtualMachine`] - shared state of an analysis run; builds the initial
//!   [`crate::graph::ExecutionGraph`] of a method and spawns root contexts
//! - [`ExecutionContext`] - per-path register and heap state, chained to the state of the
//!   parent node
//! - [`Op`] / [`OpFactory`] - the semantics of one instruction at one location
//! - [`ClassManager`] - the registry of classes whose implementation is known
//! - [`CloneStrategy`] - how heap objects are snapshot between paths, cached per registry
//! - [`VmConfig`] - execution limits and side effect configuration
//!
//! Values are symbolic: a register holds either a concrete [`Value`] or an unknown value
//! of a known type. Branches on unknown values follow every edge.

mod classes;
mod cloner;
mod config;
mod context;
mod ops;
mod value;
mod vm;

pub use classes::{ClassDef, ClassManager, RegistryId};
pub use cloner::CloneStrategy;
pub use config::VmConfig;
pub use context::{ExecutionContext, UNASSIGNED_TYPE};
pub use ops::{
    BinaryMathOp, ConstOp, DefaultOpFactory, FieldOp, GotoOp, IfOp, InvokeOp, MoveOp,
    MoveResultOp, NewInstanceOp, NopOp, Op, OpBase, OpFactory, PayloadOp, ReturnOp,
    SideEffectLevel, SwitchOp, ThrowOp,
};
pub use value::{HeapObject, HeapRef, Value};
pub use vm::VirtualMachine;
