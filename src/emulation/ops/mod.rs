//! Executable operations, one per instruction location.
//!
//! An [`Op`] is the semantic object behind an instruction at one location: it knows the
//! locations execution may continue at and how the instruction changes the symbolic state
//! of an [`ExecutionContext`]. Ops are built by an [`OpFactory`] from the current layout
//! of a [`crate::method::MethodImplementation`], so any edit that moves labels or
//! neighbours requires the affected ops to be created again.
//!
//! All nodes of one location share a single op; per-path state lives in the contexts.
//!
//! # Side effects
//!
//! Ops that allocate objects or call other methods track a [`SideEffectLevel`]. It starts
//! at [`SideEffectLevel::Strong`] and is lowered to what execution observed. When such an
//! op is recreated, the previously observed level is carried over to the new op instead
//! of being derived again.

mod basic;
mod branch;
mod factory;
mod object;

use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use strum::{Display, EnumIter};

use crate::{
    assembly::{Instruction, OpcodeFlags},
    emulation::ExecutionContext,
    method::{LocationId, MethodImplementation},
    Error, Result,
};

pub use basic::{BinaryMathOp, ConstOp, MoveOp, MoveResultOp, NopOp, ReturnOp, ThrowOp};
pub use branch::{GotoOp, IfOp, PayloadOp, SwitchOp};
pub use factory::{DefaultOpFactory, OpFactory};
pub use object::{FieldOp, InvokeOp, NewInstanceOp};

/// How much an op can affect state outside of the analysed method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
pub enum SideEffectLevel {
    /// No observable effect, the op may be removed if its result is unused.
    #[strum(serialize = "none")]
    None = 0,
    /// Only affects classes whose implementation is known.
    #[strum(serialize = "weak")]
    Weak = 1,
    /// May affect anything.
    #[strum(serialize = "strong")]
    Strong = 2,
}

impl SideEffectLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SideEffectLevel::None,
            1 => SideEffectLevel::Weak,
            _ => SideEffectLevel::Strong,
        }
    }
}

/// Atomic storage for a [`SideEffectLevel`] shared by all nodes of one op.
#[derive(Debug)]
pub(crate) struct SideEffectCell(AtomicU8);

impl SideEffectCell {
    pub(crate) fn new(level: SideEffectLevel) -> Self {
        SideEffectCell(AtomicU8::new(level as u8))
    }

    pub(crate) fn get(&self) -> SideEffectLevel {
        SideEffectLevel::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, level: SideEffectLevel) {
        self.0.store(level as u8, Ordering::Release);
    }
}

/// State every op carries: where it is, what it executes and where it may go next.
#[derive(Debug, Clone)]
pub struct OpBase {
    location: LocationId,
    instruction: Instruction,
    children: Vec<LocationId>,
}

impl OpBase {
    /// Creates the base of an op at `location`.
    #[must_use]
    pub fn new(location: LocationId, instruction: Instruction, children: Vec<LocationId>) -> Self {
        OpBase {
            location,
            instruction,
            children,
        }
    }
}

/// The semantics of one instruction at one location.
pub trait Op: Send + Sync + fmt::Debug {
    /// Returns the common op state.
    fn base(&self) -> &OpBase;

    /// Runs the instruction against `context` and returns the locations execution
    /// continues at on this path.
    ///
    /// The returned locations are always a subset of [`Op::children`]. Known branch
    /// conditions prune the untaken edges.
    ///
    /// # Errors
    ///
    /// Returns an error if the context rejects a register or heap access.
    fn execute(&self, context: &ExecutionContext) -> Result<Vec<LocationId>>;

    /// Returns the location of this op.
    fn location(&self) -> LocationId {
        self.base().location
    }

    /// Returns the instruction this op executes.
    fn instruction(&self) -> &Instruction {
        &self.base().instruction
    }

    /// Returns every location execution may continue at, in a stable order.
    fn children(&self) -> &[LocationId] {
        &self.base().children
    }

    /// Returns the smali mnemonic of the instruction.
    fn name(&self) -> &'static str {
        self.instruction().opcode().mnemonic()
    }

    /// Returns the opcode flags of the instruction.
    fn flags(&self) -> OpcodeFlags {
        self.instruction().opcode().flags()
    }

    /// Returns the side effect level observed for this op.
    ///
    /// Ops without a tracked level are free of side effects.
    fn side_effect_level(&self) -> SideEffectLevel {
        SideEffectLevel::None
    }

    /// Overrides the tracked side effect level. Ignored by ops without one.
    fn set_side_effect_level(&self, _level: SideEffectLevel) {}
}

/// Returns the fall-through successor of `location`.
pub(crate) fn fall_through(
    implementation: &MethodImplementation,
    location: LocationId,
) -> Result<LocationId> {
    implementation
        .next_location(location)
        .ok_or_else(|| Error::OpCreation {
            location,
            reason: "execution falls off the end of the method".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_effect_cell() {
        let cell = SideEffectCell::new(SideEffectLevel::Strong);
        assert_eq!(cell.get(), SideEffectLevel::Strong);
        cell.set(SideEffectLevel::None);
        assert_eq!(cell.get(), SideEffectLevel::None);
        assert!(SideEffectLevel::Weak < SideEffectLevel::Strong);
        assert_eq!(SideEffectLevel::Weak.to_string(), "weak");
    }
}
