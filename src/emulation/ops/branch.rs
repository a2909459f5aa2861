//! Control flow ops: jumps, conditional branches, switches and payloads.

use crate::{
    assembly::{Instruction, Opcode},
    emulation::{
        ops::{Op, OpBase},
        ExecutionContext, Value,
    },
    method::LocationId,
    Result,
};

/// The `goto` family.
#[derive(Debug)]
pub struct GotoOp {
    base: OpBase,
}

impl GotoOp {
    /// Creates the op, `base` must have the branch target as its only child.
    #[must_use]
    pub fn new(base: OpBase) -> Self {
        GotoOp { base }
    }
}

impl Op for GotoOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn execute(&self, _context: &ExecutionContext) -> Result<Vec<LocationId>> {
        Ok(self.base.children.clone())
    }
}

/// The `if-test` and `if-testz` families.
///
/// When both operands are known the untaken edge is pruned, otherwise both edges are
/// followed.
#[derive(Debug)]
pub struct IfOp {
    base: OpBase,
    fall_through: LocationId,
    target: LocationId,
}

impl IfOp {
    /// Creates the op.
    #[must_use]
    pub fn new(
        location: LocationId,
        instruction: Instruction,
        fall_through: LocationId,
        target: LocationId,
    ) -> Self {
        let mut children = vec![fall_through];
        if target != fall_through {
            children.push(target);
        }
        IfOp {
            base: OpBase::new(location, instruction, children),
            fall_through,
            target,
        }
    }

    /// Returns the location jumped to when the condition holds.
    #[must_use]
    pub fn target(&self) -> LocationId {
        self.target
    }

    fn operand(value: &Value, zero_test: bool) -> Option<i32> {
        match value {
            Value::Int(value) => Some(*value),
            // Strings and allocated objects are never null.
            Value::Str(_) | Value::Ref(_) if zero_test => Some(1),
            _ => None,
        }
    }

    fn holds(&self, left: i32, right: i32) -> bool {
        match self.base.instruction.opcode() {
            Opcode::IfEq | Opcode::IfEqz => left == right,
            Opcode::IfNe | Opcode::IfNez => left != right,
            Opcode::IfLt | Opcode::IfLtz => left < right,
            Opcode::IfGe | Opcode::IfGez => left >= right,
            Opcode::IfGt | Opcode::IfGtz => left > right,
            _ => left <= right,
        }
    }
}

impl Op for IfOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn execute(&self, context: &ExecutionContext) -> Result<Vec<LocationId>> {
        let instruction = &self.base.instruction;
        let zero_test = instruction.register(1).is_none();
        let left = match instruction.register(0) {
            Some(register) => context.read_register(register)?,
            None => return Ok(self.base.children.clone()),
        };
        let right = match instruction.register(1) {
            Some(register) => context.read_register(register)?,
            None => Value::Int(0),
        };

        match (
            Self::operand(&left, zero_test),
            Self::operand(&right, zero_test),
        ) {
            (Some(left), Some(right)) if self.holds(left, right) => Ok(vec![self.target]),
            (Some(_), Some(_)) => Ok(vec![self.fall_through]),
            _ => Ok(self.base.children.clone()),
        }
    }
}

/// `packed-switch`, `sparse-switch` and `fill-array-data`.
///
/// Execution continues at the payload. Switches hand the key over to the payload
/// through the result register.
#[derive(Debug)]
pub struct SwitchOp {
    base: OpBase,
}

impl SwitchOp {
    /// Creates the op, `base` must have the payload as its only child.
    #[must_use]
    pub fn new(base: OpBase) -> Self {
        SwitchOp { base }
    }
}

impl Op for SwitchOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn execute(&self, context: &ExecutionContext) -> Result<Vec<LocationId>> {
        if let Some(register) = self.base.instruction.register(0) {
            let value = context.read_register(register)?;
            if self.base.instruction.opcode() != Opcode::FillArrayData {
                context.assign_result(value)?;
            }
        }
        Ok(self.base.children.clone())
    }
}

/// Switch tables and array data.
///
/// A payload is only reached from the instruction referring to it. A switch payload
/// selects the case target for a known key and otherwise continues at every case and the
/// fall-through. Array data always continues after the referring instruction.
#[derive(Debug)]
pub struct PayloadOp {
    base: OpBase,
    cases: Vec<(i32, LocationId)>,
    fall_through: Vec<LocationId>,
}

impl PayloadOp {
    /// Creates the op.
    ///
    /// `fall_through` holds the locations following each referring instruction.
    #[must_use]
    pub fn new(
        location: LocationId,
        instruction: Instruction,
        cases: Vec<(i32, LocationId)>,
        fall_through: Vec<LocationId>,
    ) -> Self {
        let mut children: Vec<LocationId> = Vec::with_capacity(cases.len() + fall_through.len());
        for location in fall_through
            .iter()
            .copied()
            .chain(cases.iter().map(|(_, target)| *target))
        {
            if !children.contains(&location) {
                children.push(location);
            }
        }
        PayloadOp {
            base: OpBase::new(location, instruction, children),
            cases,
            fall_through,
        }
    }

    /// Returns the `(key, target)` pairs of a switch payload.
    #[must_use]
    pub fn cases(&self) -> &[(i32, LocationId)] {
        &self.cases
    }
}

impl Op for PayloadOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn execute(&self, context: &ExecutionContext) -> Result<Vec<LocationId>> {
        if !self.base.instruction.opcode().is_switch_payload() {
            return Ok(self.fall_through.clone());
        }

        let key = context.read_result()?.and_then(|value| value.as_int());
        match key {
            Some(key) => Ok(self
                .cases
                .iter()
                .find(|(case, _)| *case == key)
                .map_or_else(|| self.fall_through.clone(), |(_, target)| vec![*target])),
            None => Ok(self.base.children.clone()),
        }
    }
}
