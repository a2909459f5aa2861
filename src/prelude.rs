//! # dexscope Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the dexscope library. Import this module to get quick access to everything needed
//! to parse a method, execute it and edit it.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dexscope operations
pub use crate::Error;

/// The result type used throughout dexscope
pub use crate::Result;

// ================================================================================================
// Instructions and Methods
// ================================================================================================

/// Opcodes, instructions and the smali parser
pub use crate::assembly::{parse_smali, Instruction, Opcode, OpcodeFlags, Operand};

/// The editable instruction stream and method identity
pub use crate::method::{
    LabelId, LocalMethod, LocationId, MethodImplementation, MethodSignature, TryBlock,
};

// ================================================================================================
// Symbolic Execution
// ================================================================================================

/// Virtual machine and its collaborators
pub use crate::emulation::{
    ClassDef, ClassManager, DefaultOpFactory, ExecutionContext, Op, OpFactory, SideEffectLevel,
    Value, VirtualMachine, VmConfig,
};

// ================================================================================================
// Execution Graphs
// ================================================================================================

/// Graphs, nodes and the manipulator
pub use crate::graph::{
    ExecutionGraph, ExecutionGraphManipulator, ExecutionNode, ManipulatorStats, NodeId,
};
