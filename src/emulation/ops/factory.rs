//! Creation of ops from the current layout of a method implementation.

use std::{fmt, sync::Arc};

use crate::{
    assembly::{Instruction, Opcode, Operand},
    emulation::{
        classes::ClassManager,
        ops::{
            fall_through, BinaryMathOp, ConstOp, FieldOp, GotoOp, IfOp, InvokeOp, MoveOp,
            MoveResultOp, NewInstanceOp, NopOp, Op, OpBase, PayloadOp, ReturnOp,
            SideEffectLevel, SwitchOp, ThrowOp,
        },
        VmConfig,
    },
    method::{LabelId, LocationId, MethodImplementation, MethodSignature},
    Error, Result,
};

/// Builds the op for a location.
///
/// Implementations must reflect the layout `implementation` has at the time of the call:
/// the same location yields a different op after an edit moved its branch targets or
/// neighbours.
pub trait OpFactory: Send + Sync + fmt::Debug {
    /// Creates the op for the instruction at `location`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OpCreation`] if the location holds no instruction or the
    /// instruction cannot be turned into an op.
    fn create(
        &self,
        location: LocationId,
        implementation: &MethodImplementation,
    ) -> Result<Arc<dyn Op>>;
}

/// The op factory of the default virtual machine.
///
/// Side effect levels of allocations and calls are classified with the class registry
/// (local classes) and the configuration (immutable classes, pure methods).
#[derive(Debug, Clone)]
pub struct DefaultOpFactory {
    class_manager: Arc<ClassManager>,
    config: Arc<VmConfig>,
}

impl DefaultOpFactory {
    /// Creates a factory classifying side effects with `class_manager` and `config`.
    #[must_use]
    pub fn new(class_manager: Arc<ClassManager>, config: Arc<VmConfig>) -> Self {
        DefaultOpFactory {
            class_manager,
            config,
        }
    }

    fn allocation_level(&self, class: &str) -> SideEffectLevel {
        if self.config.is_immutable(class) || class == "Ljava/lang/Object;" {
            SideEffectLevel::None
        } else if self.class_manager.contains(class) {
            SideEffectLevel::Weak
        } else {
            SideEffectLevel::Strong
        }
    }

    fn call_level(&self, method: &str) -> SideEffectLevel {
        if self.config.is_pure(method) {
            SideEffectLevel::None
        } else if self.class_manager.is_local_method(method) {
            SideEffectLevel::Weak
        } else {
            SideEffectLevel::Strong
        }
    }
}

fn creation_error(location: LocationId, reason: impl Into<String>) -> Error {
    Error::OpCreation {
        location,
        reason: reason.into(),
    }
}

fn resolve(
    implementation: &MethodImplementation,
    location: LocationId,
    label: LabelId,
) -> Result<LocationId> {
    implementation
        .label_target(label)
        .ok_or_else(|| creation_error(location, format!("{label} does not resolve to an instruction")))
}

fn reference(instruction: &Instruction, location: LocationId) -> Result<Arc<str>> {
    instruction
        .reference()
        .cloned()
        .ok_or_else(|| creation_error(location, format!("{} without reference", instruction.opcode())))
}

impl OpFactory for DefaultOpFactory {
    fn create(
        &self,
        location: LocationId,
        implementation: &MethodImplementation,
    ) -> Result<Arc<dyn Op>> {
        let instruction = implementation
            .instruction(location)
            .cloned()
            .ok_or_else(|| creation_error(location, "no instruction at location"))?;
        let opcode = instruction.opcode();

        let op: Arc<dyn Op> = match opcode {
            Opcode::Nop => {
                let children = implementation.next_location(location).into_iter().collect();
                Arc::new(NopOp::new(OpBase::new(location, instruction, children)))
            }
            Opcode::Move | Opcode::MoveObject => {
                let next = fall_through(implementation, location)?;
                Arc::new(MoveOp::new(OpBase::new(location, instruction, vec![next])))
            }
            Opcode::MoveResult | Opcode::MoveResultObject => {
                let next = fall_through(implementation, location)?;
                Arc::new(MoveResultOp::new(OpBase::new(location, instruction, vec![next])))
            }
            Opcode::Const4 | Opcode::Const16 | Opcode::Const | Opcode::ConstString => {
                let next = fall_through(implementation, location)?;
                Arc::new(ConstOp::new(OpBase::new(location, instruction, vec![next])))
            }
            Opcode::ReturnVoid | Opcode::Return | Opcode::ReturnObject => {
                Arc::new(ReturnOp::new(OpBase::new(location, instruction, Vec::new())))
            }
            Opcode::Throw => Arc::new(ThrowOp::new(OpBase::new(location, instruction, Vec::new()))),
            Opcode::Goto | Opcode::Goto16 | Opcode::Goto32 => {
                let label = instruction
                    .target()
                    .ok_or_else(|| creation_error(location, "goto without target"))?;
                let target = resolve(implementation, location, label)?;
                Arc::new(GotoOp::new(OpBase::new(location, instruction, vec![target])))
            }
            Opcode::IfEq
            | Opcode::IfNe
            | Opcode::IfLt
            | Opcode::IfGe
            | Opcode::IfGt
            | Opcode::IfLe
            | Opcode::IfEqz
            | Opcode::IfNez
            | Opcode::IfLtz
            | Opcode::IfGez
            | Opcode::IfGtz
            | Opcode::IfLez => {
                let label = instruction
                    .target()
                    .ok_or_else(|| creation_error(location, "branch without target"))?;
                let target = resolve(implementation, location, label)?;
                let next = fall_through(implementation, location)?;
                Arc::new(IfOp::new(location, instruction, next, target))
            }
            Opcode::PackedSwitch | Opcode::SparseSwitch | Opcode::FillArrayData => {
                let label = instruction
                    .target()
                    .ok_or_else(|| creation_error(location, "missing payload label"))?;
                let payload = resolve(implementation, location, label)?;
                if !implementation
                    .instruction(payload)
                    .is_some_and(|target| target.opcode().is_payload())
                {
                    return Err(creation_error(location, format!("{label} is not a payload")));
                }
                Arc::new(SwitchOp::new(OpBase::new(location, instruction, vec![payload])))
            }
            Opcode::PackedSwitchPayload | Opcode::SparseSwitchPayload | Opcode::ArrayPayload => {
                let cases = match instruction.operands().first() {
                    Some(Operand::PackedTargets { first_key, targets }) => targets
                        .iter()
                        .zip(*first_key..)
                        .map(|(label, key)| Ok((key, resolve(implementation, location, *label)?)))
                        .collect::<Result<Vec<_>>>()?,
                    Some(Operand::SparseTargets(entries)) => entries
                        .iter()
                        .map(|(key, label)| Ok((*key, resolve(implementation, location, *label)?)))
                        .collect::<Result<Vec<_>>>()?,
                    _ => Vec::new(),
                };
                let exits = implementation
                    .referrers(location)
                    .into_iter()
                    .map(|referrer| fall_through(implementation, referrer))
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(PayloadOp::new(location, instruction, cases, exits))
            }
            Opcode::NewInstance => {
                let class = reference(&instruction, location)?;
                let level = self.allocation_level(&class);
                let next = fall_through(implementation, location)?;
                Arc::new(NewInstanceOp::new(
                    OpBase::new(location, instruction, vec![next]),
                    class,
                    level,
                ))
            }
            Opcode::Iget | Opcode::IgetObject | Opcode::Iput | Opcode::IputObject => {
                let field = reference(&instruction, location)?;
                let next = fall_through(implementation, location)?;
                Arc::new(FieldOp::new(OpBase::new(location, instruction, vec![next]), field))
            }
            Opcode::InvokeVirtual | Opcode::InvokeDirect | Opcode::InvokeStatic => {
                let method = reference(&instruction, location)?;
                let signature = MethodSignature::parse(&method)
                    .map_err(|error| creation_error(location, error.to_string()))?;
                let return_type = (!signature.returns_void()).then(|| signature.return_type);
                let level = self.call_level(&method);
                let next = fall_through(implementation, location)?;
                Arc::new(InvokeOp::new(
                    OpBase::new(location, instruction, vec![next]),
                    method,
                    return_type,
                    level,
                ))
            }
            Opcode::AddInt
            | Opcode::SubInt
            | Opcode::MulInt
            | Opcode::AndInt
            | Opcode::OrInt
            | Opcode::XorInt
            | Opcode::AddIntLit8
            | Opcode::MulIntLit8
            | Opcode::XorIntLit8 => {
                let next = fall_through(implementation, location)?;
                Arc::new(BinaryMathOp::new(OpBase::new(location, instruction, vec![next])))
            }
        };
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assembly::parse_smali, emulation::classes::ClassDef};

    fn factory() -> DefaultOpFactory {
        let classes = ClassManager::with_classes([
            ClassDef::new("Lcom/example/Local;").with_method("Lcom/example/Local;->run()V")
        ]);
        DefaultOpFactory::new(Arc::new(classes), Arc::new(VmConfig::default()))
    }

    #[test]
    fn test_children_follow_layout() {
        let implementation = parse_smali(
            "
            .registers 1
            if-eqz v0, :end
            nop
            :end
            return-void
            ",
        )
        .unwrap();
        let factory = factory();
        let locations = implementation.locations().to_vec();

        let branch = factory.create(locations[0], &implementation).unwrap();
        assert_eq!(branch.children(), &[locations[1], locations[2]]);
        assert_eq!(branch.name(), "if-eqz");
        assert!(factory
            .create(locations[2], &implementation)
            .unwrap()
            .children()
            .is_empty());
    }

    #[test]
    fn test_switch_payload_children() {
        let implementation = parse_smali(
            "
            .registers 1
            sparse-switch v0, :table
            :case
            return-void
            :table
            sparse-switch-payload 0x7 -> :case
            ",
        )
        .unwrap();
        let factory = factory();
        let locations = implementation.locations().to_vec();
        let payload = *locations.last().unwrap();

        let switch = factory.create(locations[0], &implementation).unwrap();
        assert_eq!(switch.children(), &[payload]);
        let table = factory.create(payload, &implementation).unwrap();
        assert_eq!(table.children(), &[locations[1]]);
    }

    #[test]
    fn test_side_effect_classification() {
        let factory = factory();
        assert_eq!(factory.allocation_level("Ljava/lang/String;"), SideEffectLevel::None);
        assert_eq!(factory.allocation_level("Lcom/example/Local;"), SideEffectLevel::Weak);
        assert_eq!(factory.allocation_level("Landroid/Foo;"), SideEffectLevel::Strong);
        assert_eq!(
            factory.call_level("Ljava/lang/String;->length()I"),
            SideEffectLevel::None
        );
        assert_eq!(factory.call_level("Lcom/example/Local;->run()V"), SideEffectLevel::Weak);
    }

    #[test]
    fn test_falling_off_the_end_fails() {
        let mut implementation = MethodImplementation::new(1);
        let location = implementation.push(Instruction::constant(0, 1));
        let error = factory().create(location, &implementation).unwrap_err();
        assert!(matches!(error, Error::OpCreation { .. }));
    }
}
