//! Straight-line ops: moves, constants, arithmetic and method exits.

use crate::{
    assembly::{Opcode, Operand},
    emulation::{
        context::UNASSIGNED_TYPE,
        ops::{Op, OpBase},
        ExecutionContext, Value,
    },
    method::LocationId,
    Error, Result,
};

fn operand_register(base: &OpBase, index: usize) -> Result<u16> {
    base.instruction.register(index).ok_or_else(|| Error::OpCreation {
        location: base.location,
        reason: format!("{} has no register operand {}", base.instruction.opcode(), index),
    })
}

/// `nop`, also used for payload alignment.
#[derive(Debug)]
pub struct NopOp {
    base: OpBase,
}

impl NopOp {
    /// Creates the op.
    #[must_use]
    pub fn new(base: OpBase) -> Self {
        NopOp { base }
    }
}

impl Op for NopOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn execute(&self, _context: &ExecutionContext) -> Result<Vec<LocationId>> {
        Ok(self.base.children.clone())
    }
}

/// `move` and `move-object`.
#[derive(Debug)]
pub struct MoveOp {
    base: OpBase,
}

impl MoveOp {
    /// Creates the op.
    #[must_use]
    pub fn new(base: OpBase) -> Self {
        MoveOp { base }
    }
}

impl Op for MoveOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn execute(&self, context: &ExecutionContext) -> Result<Vec<LocationId>> {
        let destination = operand_register(&self.base, 0)?;
        let value = context.read_register(operand_register(&self.base, 1)?)?;
        context.assign_register(destination, value)?;
        Ok(self.base.children.clone())
    }
}

/// `move-result` and `move-result-object`.
///
/// Copies the result register of the parent node. It does not count as a read of any
/// general purpose register.
#[derive(Debug)]
pub struct MoveResultOp {
    base: OpBase,
}

impl MoveResultOp {
    /// Creates the op.
    #[must_use]
    pub fn new(base: OpBase) -> Self {
        MoveResultOp { base }
    }
}

impl Op for MoveResultOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn execute(&self, context: &ExecutionContext) -> Result<Vec<LocationId>> {
        let destination = operand_register(&self.base, 0)?;
        let value = context.read_result()?.unwrap_or_else(|| {
            log::warn!(
                "{} at {}: no result to move",
                self.name(),
                self.base.location
            );
            Value::unknown(UNASSIGNED_TYPE)
        });
        context.assign_register(destination, value)?;
        Ok(self.base.children.clone())
    }
}

/// The `const` family and `const-string`.
#[derive(Debug)]
pub struct ConstOp {
    base: OpBase,
}

impl ConstOp {
    /// Creates the op.
    #[must_use]
    pub fn new(base: OpBase) -> Self {
        ConstOp { base }
    }

    /// Returns the value this op loads.
    #[must_use]
    pub fn value(&self) -> Value {
        match self.base.instruction.operands().get(1) {
            // Literals were range checked against the opcode format.
            Some(Operand::Literal(literal)) => Value::Int(*literal as i32),
            Some(Operand::String(string)) => Value::Str(string.clone()),
            _ => Value::unknown(UNASSIGNED_TYPE),
        }
    }
}

impl Op for ConstOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn execute(&self, context: &ExecutionContext) -> Result<Vec<LocationId>> {
        context.assign_register(operand_register(&self.base, 0)?, self.value())?;
        Ok(self.base.children.clone())
    }
}

/// The `return` family.
#[derive(Debug)]
pub struct ReturnOp {
    base: OpBase,
}

impl ReturnOp {
    /// Creates the op.
    #[must_use]
    pub fn new(base: OpBase) -> Self {
        ReturnOp { base }
    }
}

impl Op for ReturnOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn execute(&self, context: &ExecutionContext) -> Result<Vec<LocationId>> {
        if let Some(register) = self.base.instruction.register(0) {
            context.read_register(register)?;
        }
        Ok(Vec::new())
    }
}

/// `throw`. Exception edges are not followed, the path ends here.
#[derive(Debug)]
pub struct ThrowOp {
    base: OpBase,
}

impl ThrowOp {
    /// Creates the op.
    #[must_use]
    pub fn new(base: OpBase) -> Self {
        ThrowOp { base }
    }
}

impl Op for ThrowOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn execute(&self, context: &ExecutionContext) -> Result<Vec<LocationId>> {
        context.read_register(operand_register(&self.base, 0)?)?;
        Ok(Vec::new())
    }
}

/// Integer arithmetic in register (`23x`) and literal (`22b`) form.
#[derive(Debug)]
pub struct BinaryMathOp {
    base: OpBase,
}

impl BinaryMathOp {
    /// Creates the op.
    #[must_use]
    pub fn new(base: OpBase) -> Self {
        BinaryMathOp { base }
    }

    fn apply(&self, left: i32, right: i32) -> i32 {
        match self.base.instruction.opcode() {
            Opcode::AddInt | Opcode::AddIntLit8 => left.wrapping_add(right),
            Opcode::SubInt => left.wrapping_sub(right),
            Opcode::MulInt | Opcode::MulIntLit8 => left.wrapping_mul(right),
            Opcode::AndInt => left & right,
            Opcode::OrInt => left | right,
            Opcode::XorInt | Opcode::XorIntLit8 => left ^ right,
            _ => 0,
        }
    }
}

impl Op for BinaryMathOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn execute(&self, context: &ExecutionContext) -> Result<Vec<LocationId>> {
        let destination = operand_register(&self.base, 0)?;
        let left = context.read_register(operand_register(&self.base, 1)?)?;
        let right = match self.base.instruction.register(2) {
            Some(register) => context.read_register(register)?,
            None => Value::Int(self.base.instruction.literal().unwrap_or_default() as i32),
        };

        let value = match (left.as_int(), right.as_int()) {
            (Some(left), Some(right)) => Value::Int(self.apply(left, right)),
            _ => Value::unknown("I"),
        };
        context.assign_register(destination, value)?;
        Ok(self.base.children.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assembly::Instruction, test::root_context};

    fn base(opcode: Opcode, operands: Vec<Operand>) -> OpBase {
        let instruction = Instruction::new(opcode, operands).unwrap();
        OpBase::new(LocationId::new(0), instruction, vec![LocationId::new(1)])
    }

    #[test]
    fn test_const_and_move() {
        let context = root_context("LFoo;->bar()V", 3);
        let constant = ConstOp::new(OpBase::new(
            LocationId::new(0),
            Instruction::constant(0, 42),
            vec![LocationId::new(1)],
        ));
        assert_eq!(constant.execute(&context).unwrap(), vec![LocationId::new(1)]);

        let child = context.spawn_child();
        let mov = MoveOp::new(base(
            Opcode::Move,
            vec![Operand::Register(1), Operand::Register(0)],
        ));
        mov.execute(&child).unwrap();
        assert_eq!(child.peek_register(1).unwrap(), Some(Value::Int(42)));
        assert!(child.was_register_read(0).unwrap());
        assert!(child.was_register_assigned(1).unwrap());
    }

    #[test]
    fn test_binary_math() {
        let context = root_context("LFoo;->bar(I)V", 3);
        context.assign_register(0, Value::Int(i32::MAX)).unwrap();
        let child = context.spawn_child();

        let add = BinaryMathOp::new(base(
            Opcode::AddIntLit8,
            vec![Operand::Register(1), Operand::Register(0), Operand::Literal(1)],
        ));
        add.execute(&child).unwrap();
        assert_eq!(child.peek_register(1).unwrap(), Some(Value::Int(i32::MIN)));

        let unknown = BinaryMathOp::new(base(
            Opcode::XorInt,
            vec![Operand::Register(1), Operand::Register(0), Operand::Register(2)],
        ));
        let grandchild = child.spawn_child();
        unknown.execute(&grandchild).unwrap();
        assert_eq!(grandchild.peek_register(1).unwrap(), Some(Value::unknown("I")));
    }

    #[test]
    fn test_move_result_reads_parent_result() {
        let context = root_context("LFoo;->bar()V", 1);
        context.assign_result(Value::Int(9)).unwrap();
        let child = context.spawn_child();
        let op = MoveResultOp::new(base(Opcode::MoveResult, vec![Operand::Register(0)]));
        op.execute(&child).unwrap();
        assert_eq!(child.peek_register(0).unwrap(), Some(Value::Int(9)));
        assert!(!child.was_register_read(0).unwrap());
    }

    #[test]
    fn test_return_ends_path() {
        let context = root_context("LFoo;->bar()I", 1);
        context.assign_register(0, Value::Int(1)).unwrap();
        let op = ReturnOp::new(base(Opcode::Return, vec![Operand::Register(0)]));
        let child = context.spawn_child();
        assert!(op.execute(&child).unwrap().is_empty());
        assert!(child.was_register_read(0).unwrap());
    }
}
