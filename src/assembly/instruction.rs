//! Dalvik instruction representation and text rendering.
//!
//! An [`Instruction`] is an [`Opcode`] plus a list of typed [`Operand`]s whose shape is
//! checked against the opcode's [`Format`] on construction. Branch targets are
//! [`LabelId`]s owned by the method implementation rather than raw offsets, so an
//! instruction stays valid while the instructions around it are inserted and removed.
//!
//! # Rendering
//!
//! [`Instruction::render`] produces smali-style text. Branch targets are printed as
//! `:addr_<hex>` using the current code address of the label's location, a form the
//! [`crate::assembly::parse_smali`] parser reads back.

use std::{fmt::Write, sync::Arc};

use crate::{
    assembly::{Format, Opcode},
    method::LabelId,
    Result,
};

/// A single instruction operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// A register number (`vN`).
    Register(u16),
    /// An integer literal.
    Literal(i64),
    /// A branch or payload target.
    Label(LabelId),
    /// A string constant.
    String(Arc<str>),
    /// A type descriptor, e.g. `Lcom/example/Foo;`.
    Type(Arc<str>),
    /// A field reference, e.g. `Lcom/example/Foo;->bar:I`.
    Field(Arc<str>),
    /// A method reference, e.g. `Lcom/example/Foo;->bar(I)V`.
    Method(Arc<str>),
    /// The argument registers of an invoke instruction.
    RegisterList(Vec<u16>),
    /// Targets of a packed switch: consecutive keys starting at `first_key`.
    PackedTargets {
        /// Key of the first target.
        first_key: i32,
        /// One target per key.
        targets: Vec<LabelId>,
    },
    /// Key/target pairs of a sparse switch.
    SparseTargets(Vec<(i32, LabelId)>),
    /// Array initialisation data.
    ArrayData {
        /// Width of one element in bytes (1, 2, 4 or 8).
        element_width: u16,
        /// The element values.
        elements: Vec<i64>,
    },
}

/// Expected operand kinds per format, checked by [`Instruction::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Register,
    Literal,
    Label,
    Reference,
    RegisterList,
    Packed,
    Sparse,
    Array,
}

impl Slot {
    fn accepts(self, operand: &Operand) -> bool {
        matches!(
            (self, operand),
            (Slot::Register, Operand::Register(_))
                | (Slot::Literal, Operand::Literal(_))
                | (Slot::Label, Operand::Label(_))
                | (
                    Slot::Reference,
                    Operand::String(_) | Operand::Type(_) | Operand::Field(_) | Operand::Method(_)
                )
                | (Slot::RegisterList, Operand::RegisterList(_))
                | (Slot::Packed, Operand::PackedTargets { .. })
                | (Slot::Sparse, Operand::SparseTargets(_))
                | (Slot::Array, Operand::ArrayData { .. })
        )
    }
}

fn slots(format: Format) -> &'static [Slot] {
    use Slot::*;
    match format {
        Format::F10x => &[],
        Format::F12x => &[Register, Register],
        Format::F23x => &[Register, Register, Register],
        Format::F11x => &[Register],
        Format::F11n | Format::F21s | Format::F31i => &[Register, Literal],
        Format::F10t | Format::F20t | Format::F30t => &[Label],
        Format::F21c => &[Register, Reference],
        Format::F21t | Format::F31t => &[Register, Label],
        Format::F22t => &[Register, Register, Label],
        Format::F22b => &[Register, Register, Literal],
        Format::F22c => &[Register, Register, Reference],
        Format::F35c => &[RegisterList, Reference],
        Format::PackedSwitchPayload => &[Packed],
        Format::SparseSwitchPayload => &[Sparse],
        Format::ArrayPayload => &[Array],
    }
}

/// Literal range accepted by the literal operand of an opcode.
fn literal_range(opcode: Opcode) -> Option<(i64, i64)> {
    match opcode.format() {
        Format::F11n => Some((-8, 7)),
        Format::F21s => Some((i16::MIN.into(), i16::MAX.into())),
        Format::F22b => Some((i8::MIN.into(), i8::MAX.into())),
        Format::F31i => Some((i32::MIN.into(), i32::MAX.into())),
        _ => None,
    }
}

/// A decoded Dalvik instruction.
///
/// # Examples
///
/// ```rust
/// use dexscope::assembly::{Instruction, Opcode, Operand};
///
/// let instruction = Instruction::new(
///     Opcode::Const4,
///     vec![Operand::Register(0), Operand::Literal(5)],
/// )?;
/// assert_eq!(instruction.code_units(), 1);
/// assert!(Instruction::new(Opcode::Const4, vec![Operand::Register(0)]).is_err());
/// # Ok::<(), dexscope::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    opcode: Opcode,
    operands: Vec<Operand>,
}

impl Instruction {
    /// Creates a new instruction, validating the operands against the opcode's format.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the operand count or kinds do not match the
    /// format, or a literal does not fit its encoding.
    pub fn new(opcode: Opcode, operands: Vec<Operand>) -> Result<Self> {
        let expected = slots(opcode.format());
        if expected.len() != operands.len() {
            return Err(malformed_error!(
                "{} expects {} operands, got {}",
                opcode,
                expected.len(),
                operands.len()
            ));
        }

        for (slot, operand) in expected.iter().zip(&operands) {
            if !slot.accepts(operand) {
                return Err(malformed_error!("{} does not accept operand {:?}", opcode, operand));
            }
            if let (Operand::Literal(value), Some((min, max))) = (operand, literal_range(opcode)) {
                if *value < min || *value > max {
                    return Err(malformed_error!(
                        "Literal {} out of range for {}",
                        value,
                        opcode
                    ));
                }
            }
        }

        if let Some(Operand::RegisterList(registers)) = operands.first() {
            if registers.len() > 5 {
                return Err(malformed_error!("{} takes at most 5 registers", opcode));
            }
        }

        if let Some(Operand::ArrayData { element_width, .. }) = operands.first() {
            if !matches!(element_width, 1 | 2 | 4 | 8) {
                return Err(malformed_error!("Invalid array element width {}", element_width));
            }
        }

        Ok(Instruction { opcode, operands })
    }

    /// Creates a `nop`.
    #[must_use]
    pub fn nop() -> Self {
        Instruction {
            opcode: Opcode::Nop,
            operands: Vec::new(),
        }
    }

    /// Creates a `const/4` (or `const/16` / `const` if the value needs more room).
    #[must_use]
    pub fn constant(register: u16, value: i32) -> Self {
        let opcode = match value {
            -8..=7 => Opcode::Const4,
            v if i16::try_from(v).is_ok() => Opcode::Const16,
            _ => Opcode::Const,
        };
        Instruction {
            opcode,
            operands: vec![Operand::Register(register), Operand::Literal(value.into())],
        }
    }

    /// Creates a `goto` to `target`.
    #[must_use]
    pub fn goto(target: LabelId) -> Self {
        Instruction {
            opcode: Opcode::Goto,
            operands: vec![Operand::Label(target)],
        }
    }

    /// Creates a `return-void`.
    #[must_use]
    pub fn return_void() -> Self {
        Instruction {
            opcode: Opcode::ReturnVoid,
            operands: Vec::new(),
        }
    }

    /// Returns the opcode.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Returns all operands.
    #[must_use]
    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    /// Returns the register operand at position `index`, if there is one.
    #[must_use]
    pub fn register(&self, index: usize) -> Option<u16> {
        match self.operands.get(index) {
            Some(Operand::Register(register)) => Some(*register),
            _ => None,
        }
    }

    /// Returns the literal operand, if any.
    #[must_use]
    pub fn literal(&self) -> Option<i64> {
        self.operands.iter().find_map(|operand| match operand {
            Operand::Literal(value) => Some(*value),
            _ => None,
        })
    }

    /// Returns the string, type, field or method reference, if any.
    #[must_use]
    pub fn reference(&self) -> Option<&Arc<str>> {
        self.operands.iter().find_map(|operand| match operand {
            Operand::String(r) | Operand::Type(r) | Operand::Field(r) | Operand::Method(r) => {
                Some(r)
            }
            _ => None,
        })
    }

    /// Returns the argument registers of an invoke.
    #[must_use]
    pub fn register_list(&self) -> &[u16] {
        self.operands
            .iter()
            .find_map(|operand| match operand {
                Operand::RegisterList(registers) => Some(registers.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    /// Returns every label this instruction refers to, in operand order.
    #[must_use]
    pub fn labels(&self) -> Vec<LabelId> {
        let mut labels = Vec::new();
        for operand in &self.operands {
            match operand {
                Operand::Label(label) => labels.push(*label),
                Operand::PackedTargets { targets, .. } => labels.extend(targets.iter().copied()),
                Operand::SparseTargets(entries) => {
                    labels.extend(entries.iter().map(|(_, label)| *label));
                }
                _ => {}
            }
        }
        labels
    }

    /// Returns the branch or payload label of a `10t`/`20t`/`30t`/`21t`/`22t`/`31t`
    /// instruction.
    #[must_use]
    pub fn target(&self) -> Option<LabelId> {
        self.operands.iter().find_map(|operand| match operand {
            Operand::Label(label) => Some(*label),
            _ => None,
        })
    }

    /// Returns the size of this instruction in 16-bit code units.
    #[must_use]
    pub fn code_units(&self) -> u32 {
        if let Some(size) = self.opcode.format().fixed_size() {
            return size;
        }

        match self.operands.first() {
            Some(Operand::PackedTargets { targets, .. }) => 4 + targets.len() as u32 * 2,
            Some(Operand::SparseTargets(entries)) => 2 + entries.len() as u32 * 4,
            Some(Operand::ArrayData {
                element_width,
                elements,
            }) => 4 + (u32::from(*element_width) * elements.len() as u32).div_ceil(2),
            _ => 1,
        }
    }

    /// Replaces the opcode while keeping the operands.
    ///
    /// Only used to widen branches, where operand shapes are identical.
    pub(crate) fn set_opcode(&mut self, opcode: Opcode) {
        self.opcode = opcode;
    }

    /// Renders this instruction as smali text.
    ///
    /// `resolve` maps a label to the code address of the location it is attached to.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if a label can not be resolved.
    pub fn render<F>(&self, resolve: F) -> Result<String>
    where
        F: Fn(LabelId) -> Option<u32>,
    {
        let target = |label: LabelId| -> Result<String> {
            resolve(label)
                .map(|address| format!(":addr_{address:x}"))
                .ok_or_else(|| malformed_error!("Unresolved label {} in {}", label, self.opcode))
        };

        let mut out = String::from(self.opcode.mnemonic());
        let mut parts = Vec::with_capacity(self.operands.len());
        for operand in &self.operands {
            let part = match operand {
                Operand::Register(register) => format!("v{register}"),
                Operand::Literal(value) => format_literal(*value),
                Operand::Label(label) => target(*label)?,
                Operand::String(value) => format!("\"{}\"", escape(value)),
                Operand::Type(r) | Operand::Field(r) | Operand::Method(r) => r.to_string(),
                Operand::RegisterList(registers) => {
                    let list: Vec<String> = registers.iter().map(|r| format!("v{r}")).collect();
                    format!("{{{}}}", list.join(", "))
                }
                Operand::PackedTargets { first_key, targets } => {
                    let mut text = format_literal((*first_key).into());
                    let rendered = targets
                        .iter()
                        .map(|label| target(*label))
                        .collect::<Result<Vec<_>>>()?;
                    if !rendered.is_empty() {
                        let _ = write!(text, " {}", rendered.join(", "));
                    }
                    text
                }
                Operand::SparseTargets(entries) => entries
                    .iter()
                    .map(|(key, label)| {
                        Ok(format!("{} -> {}", format_literal((*key).into()), target(*label)?))
                    })
                    .collect::<Result<Vec<_>>>()?
                    .join(", "),
                Operand::ArrayData {
                    element_width,
                    elements,
                } => {
                    let mut text = element_width.to_string();
                    if !elements.is_empty() {
                        let values: Vec<String> =
                            elements.iter().map(|v| format_literal(*v)).collect();
                        let _ = write!(text, " {}", values.join(", "));
                    }
                    text
                }
            };
            parts.push(part);
        }

        if !parts.is_empty() {
            out.push(' ');
            out.push_str(&parts.join(", "));
        }
        Ok(out)
    }
}

/// Formats a literal the way smali prints it (`0x1`, `-0x1`).
pub(crate) fn format_literal(value: i64) -> String {
    if value < 0 {
        format!("-0x{:x}", value.unsigned_abs())
    } else {
        format!("0x{value:x}")
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(label: LabelId) -> Option<u32> {
        Some(label.0 * 2)
    }

    #[test]
    fn test_operand_validation() {
        assert!(Instruction::new(Opcode::Const4, vec![Operand::Register(1), Operand::Literal(7)])
            .is_ok());
        assert!(Instruction::new(Opcode::Const4, vec![Operand::Register(1), Operand::Literal(8)])
            .is_err());
        assert!(Instruction::new(Opcode::Goto, vec![Operand::Register(1)]).is_err());
        assert!(Instruction::new(
            Opcode::InvokeStatic,
            vec![
                Operand::RegisterList(vec![0, 1, 2, 3, 4, 5]),
                Operand::Method("LFoo;->bar()V".into())
            ]
        )
        .is_err());
    }

    #[test]
    fn test_code_units() {
        let packed = Instruction::new(
            Opcode::PackedSwitchPayload,
            vec![Operand::PackedTargets {
                first_key: 0,
                targets: vec![LabelId(1), LabelId(2)],
            }],
        )
        .unwrap();
        assert_eq!(packed.code_units(), 8);

        let sparse = Instruction::new(
            Opcode::SparseSwitchPayload,
            vec![Operand::SparseTargets(vec![(1, LabelId(1)), (9, LabelId(2))])],
        )
        .unwrap();
        assert_eq!(sparse.code_units(), 10);

        let array = Instruction::new(
            Opcode::ArrayPayload,
            vec![Operand::ArrayData {
                element_width: 1,
                elements: vec![1, 2, 3],
            }],
        )
        .unwrap();
        assert_eq!(array.code_units(), 6);
        assert_eq!(Instruction::constant(0, 100_000).code_units(), 3);
    }

    #[test]
    fn test_render() {
        let branch = Instruction::new(
            Opcode::IfEqz,
            vec![Operand::Register(3), Operand::Label(LabelId(5))],
        )
        .unwrap();
        assert_eq!(branch.render(resolve).unwrap(), "if-eqz v3, :addr_a");

        let invoke = Instruction::new(
            Opcode::InvokeStatic,
            vec![
                Operand::RegisterList(vec![0, 1]),
                Operand::Method("LFoo;->bar(II)I".into()),
            ],
        )
        .unwrap();
        assert_eq!(
            invoke.render(resolve).unwrap(),
            "invoke-static {v0, v1}, LFoo;->bar(II)I"
        );

        let string = Instruction::new(
            Opcode::ConstString,
            vec![Operand::Register(0), Operand::String("a \"b\"".into())],
        )
        .unwrap();
        assert_eq!(string.render(resolve).unwrap(), "const-string v0, \"a \\\"b\\\"\"");
        assert_eq!(Instruction::constant(1, -3).render(resolve).unwrap(), "const/4 v1, -0x3");
    }

    #[test]
    fn test_render_unresolved_label() {
        let goto = Instruction::goto(LabelId(1));
        assert!(goto.render(|_| None).is_err());
    }
}
