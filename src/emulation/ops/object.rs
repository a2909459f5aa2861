//! Object ops: allocation, instance fields and method calls.

use std::sync::Arc;

use crate::{
    assembly::Opcode,
    emulation::{
        ops::{Op, OpBase, SideEffectCell, SideEffectLevel},
        ExecutionContext, Value,
    },
    method::LocationId,
    Error, Result,
};

/// `new-instance`.
#[derive(Debug)]
pub struct NewInstanceOp {
    base: OpBase,
    class: Arc<str>,
    observed: SideEffectLevel,
    level: SideEffectCell,
}

impl NewInstanceOp {
    /// Creates the op.
    ///
    /// `observed` is the level execution reports: allocating a class with a known
    /// implementation may run its static initialiser, an unknown class may do anything.
    #[must_use]
    pub fn new(base: OpBase, class: Arc<str>, observed: SideEffectLevel) -> Self {
        NewInstanceOp {
            base,
            class,
            observed,
            level: SideEffectCell::new(SideEffectLevel::Strong),
        }
    }

    /// Returns the allocated class.
    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }
}

impl Op for NewInstanceOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn execute(&self, context: &ExecutionContext) -> Result<Vec<LocationId>> {
        let destination = self
            .base
            .instruction
            .register(0)
            .ok_or_else(|| Error::OpCreation {
                location: self.base.location,
                reason: "new-instance without destination register".to_string(),
            })?;
        let object = context.allocate(&self.class)?;
        context.assign_register(destination, Value::Ref(object))?;
        self.level.set(self.observed);
        Ok(self.base.children.clone())
    }

    fn side_effect_level(&self) -> SideEffectLevel {
        self.level.get()
    }

    fn set_side_effect_level(&self, level: SideEffectLevel) {
        self.level.set(level);
    }
}

/// `iget`, `iget-object`, `iput` and `iput-object`.
///
/// Fields of objects allocated on the current path are tracked. Anything else reads as
/// an unknown value of the field's type.
#[derive(Debug)]
pub struct FieldOp {
    base: OpBase,
    field: Arc<str>,
}

impl FieldOp {
    /// Creates the op for `field`, a reference like `Lcom/example/Foo;->x:I`.
    #[must_use]
    pub fn new(base: OpBase, field: Arc<str>) -> Self {
        FieldOp { base, field }
    }

    /// Returns the type descriptor of the field.
    #[must_use]
    pub fn field_type(&self) -> &str {
        self.field
            .rsplit_once(':')
            .map_or("Ljava/lang/Object;", |(_, descriptor)| descriptor)
    }

    fn registers(&self) -> Result<(u16, u16)> {
        let instruction = &self.base.instruction;
        match (instruction.register(0), instruction.register(1)) {
            (Some(value), Some(object)) => Ok((value, object)),
            _ => Err(Error::OpCreation {
                location: self.base.location,
                reason: format!("{} needs two registers", instruction.opcode()),
            }),
        }
    }
}

impl Op for FieldOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn execute(&self, context: &ExecutionContext) -> Result<Vec<LocationId>> {
        let (value_register, object_register) = self.registers()?;
        let object = context.read_register(object_register)?.as_heap_ref();

        match self.base.instruction.opcode() {
            Opcode::Iget | Opcode::IgetObject => {
                let value = match object {
                    Some(object) => context.touch_object(object)?.fields.get(&self.field).cloned(),
                    None => None,
                };
                let value = value.unwrap_or_else(|| Value::unknown(self.field_type()));
                context.assign_register(value_register, value)?;
            }
            _ => {
                let value = context.read_register(value_register)?;
                if let Some(object) = object {
                    context.with_object_mut(object, |instance| {
                        instance.fields.insert(Arc::clone(&self.field), value);
                    })?;
                }
            }
        }
        Ok(self.base.children.clone())
    }
}

/// The `invoke` family.
///
/// Calls are not followed. Every argument register counts as read and a non-void call
/// leaves an unknown value of its return type in the result register.
#[derive(Debug)]
pub struct InvokeOp {
    base: OpBase,
    method: Arc<str>,
    return_type: Option<Arc<str>>,
    observed: SideEffectLevel,
    level: SideEffectCell,
}

impl InvokeOp {
    /// Creates the op for `method`.
    ///
    /// `return_type` is `None` for void methods. `observed` is the level execution
    /// reports for this call.
    #[must_use]
    pub fn new(
        base: OpBase,
        method: Arc<str>,
        return_type: Option<Arc<str>>,
        observed: SideEffectLevel,
    ) -> Self {
        InvokeOp {
            base,
            method,
            return_type,
            observed,
            level: SideEffectCell::new(SideEffectLevel::Strong),
        }
    }

    /// Returns the called method reference.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Op for InvokeOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn execute(&self, context: &ExecutionContext) -> Result<Vec<LocationId>> {
        for register in self.base.instruction.register_list() {
            context.read_register(*register)?;
        }
        if let Some(return_type) = &self.return_type {
            context.assign_result(Value::Unknown(Arc::clone(return_type)))?;
        }
        self.level.set(self.observed);
        Ok(self.base.children.clone())
    }

    fn side_effect_level(&self) -> SideEffectLevel {
        self.level.get()
    }

    fn set_side_effect_level(&self, level: SideEffectLevel) {
        self.level.set(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{Instruction, Operand},
        test::root_context,
    };

    fn base(opcode: Opcode, operands: Vec<Operand>) -> OpBase {
        let instruction = Instruction::new(opcode, operands).unwrap();
        OpBase::new(LocationId::new(0), instruction, vec![LocationId::new(1)])
    }

    #[test]
    fn test_field_roundtrip_on_allocated_object() {
        let context = root_context("LFoo;->bar()V", 3);
        let new_instance = NewInstanceOp::new(
            base(
                Opcode::NewInstance,
                vec![Operand::Register(0), Operand::Type("LBox;".into())],
            ),
            "LBox;".into(),
            SideEffectLevel::None,
        );
        assert_eq!(new_instance.side_effect_level(), SideEffectLevel::Strong);
        new_instance.execute(&context).unwrap();
        assert_eq!(new_instance.side_effect_level(), SideEffectLevel::None);

        context.assign_register(1, Value::Int(5)).unwrap();
        let put = FieldOp::new(
            base(
                Opcode::Iput,
                vec![
                    Operand::Register(1),
                    Operand::Register(0),
                    Operand::Field("LBox;->x:I".into()),
                ],
            ),
            "LBox;->x:I".into(),
        );
        let put_context = context.spawn_child();
        put.execute(&put_context).unwrap();

        let get = FieldOp::new(
            base(
                Opcode::Iget,
                vec![
                    Operand::Register(2),
                    Operand::Register(0),
                    Operand::Field("LBox;->x:I".into()),
                ],
            ),
            "LBox;->x:I".into(),
        );
        let get_context = put_context.spawn_child();
        get.execute(&get_context).unwrap();
        assert_eq!(get_context.peek_register(2).unwrap(), Some(Value::Int(5)));

        let sibling = context.spawn_child();
        get.execute(&sibling).unwrap();
        assert_eq!(sibling.peek_register(2).unwrap(), Some(Value::unknown("I")));
    }

    #[test]
    fn test_invoke_reads_arguments_and_sets_result() {
        let context = root_context("LFoo;->bar(II)V", 2);
        let invoke = InvokeOp::new(
            base(
                Opcode::InvokeStatic,
                vec![
                    Operand::RegisterList(vec![0, 1]),
                    Operand::Method("LFoo;->sum(II)I".into()),
                ],
            ),
            "LFoo;->sum(II)I".into(),
            Some("I".into()),
            SideEffectLevel::Weak,
        );
        let child = context.spawn_child();
        invoke.execute(&child).unwrap();
        assert!(child.was_register_read(0).unwrap());
        assert!(child.was_register_read(1).unwrap());
        assert_eq!(invoke.side_effect_level(), SideEffectLevel::Weak);

        let result = child.spawn_child();
        assert_eq!(result.read_result().unwrap(), Some(Value::unknown("I")));
    }
}
