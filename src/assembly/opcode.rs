//! Dalvik opcode table, instruction formats and opcode properties.
//!
//! Only the subset of the Dalvik instruction set that the symbolic execution layer
//! understands is modelled here. Every opcode knows its mnemonic (as used in smali
//! text), its encoding [`Format`] and a set of [`OpcodeFlags`] describing how it
//! affects control flow and registers.
//!
//! # Example
//!
//! ```rust
//! use dexscope::assembly::{Format, Opcode, OpcodeFlags};
//!
//! let opcode: Opcode = "if-eqz".parse().unwrap();
//! assert_eq!(opcode.format(), Format::F21t);
//! assert!(opcode.flags().contains(OpcodeFlags::BRANCH));
//! assert_eq!(opcode.to_string(), "if-eqz");
//! ```

use bitflags::bitflags;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

bitflags! {
    /// Properties of an opcode relevant to graph construction and liveness.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpcodeFlags: u32 {
        /// Execution may continue with the next instruction.
        const CAN_CONTINUE = 0x1;
        /// Has a label operand that is a branch target.
        const BRANCH = 0x2;
        /// Refers to a switch payload.
        const SWITCH = 0x4;
        /// Is a data payload, never reached by fall-through.
        const PAYLOAD = 0x8;
        /// Writes the register in its first operand.
        const SETS_REGISTER = 0x10;
        /// Writes the pseudo result register.
        const SETS_RESULT = 0x20;
        /// Reads the pseudo result register.
        const READS_RESULT = 0x40;
        /// Calls another method.
        const INVOKE = 0x80;
        /// Allocates a heap object.
        const ALLOCATES = 0x100;
        /// Leaves the method normally.
        const RETURN = 0x200;
        /// Leaves the method by throwing.
        const THROW = 0x400;
    }
}

/// Encoding formats, named like the Dalvik bytecode specification.
///
/// The first digit of a fixed format is its size in 16-bit code units. Payload formats
/// are variable sized, see [`crate::assembly::Instruction::code_units`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// `op`
    F10x,
    /// `op vA, vB`
    F12x,
    /// `op vA, #+B` (4 bit literal)
    F11n,
    /// `op vAA`
    F11x,
    /// `op +AA` (8 bit branch offset)
    F10t,
    /// `op +AAAA` (16 bit branch offset)
    F20t,
    /// `op +AAAAAAAA` (32 bit branch offset)
    F30t,
    /// `op vAA, #+BBBB`
    F21s,
    /// `op vAA, kind@BBBB`
    F21c,
    /// `op vAA, +BBBB`
    F21t,
    /// `op vA, vB, +CCCC`
    F22t,
    /// `op vAA, vBB, #+CC`
    F22b,
    /// `op vA, vB, kind@CCCC`
    F22c,
    /// `op vAA, vBB, vCC`
    F23x,
    /// `op vAA, #+BBBBBBBB`
    F31i,
    /// `op vAA, +BBBBBBBB`
    F31t,
    /// `op {vC, vD, vE, vF, vG}, kind@BBBB`
    F35c,
    /// Packed switch table.
    PackedSwitchPayload,
    /// Sparse switch table.
    SparseSwitchPayload,
    /// Array initialisation data.
    ArrayPayload,
}

impl Format {
    /// Returns the size in code units for fixed-size formats, `None` for payloads.
    #[must_use]
    pub const fn fixed_size(self) -> Option<u32> {
        match self {
            Format::F10x | Format::F12x | Format::F11n | Format::F11x | Format::F10t => Some(1),
            Format::F20t
            | Format::F21s
            | Format::F21c
            | Format::F21t
            | Format::F22t
            | Format::F22b
            | Format::F22c
            | Format::F23x => Some(2),
            Format::F30t | Format::F31i | Format::F31t | Format::F35c => Some(3),
            Format::PackedSwitchPayload | Format::SparseSwitchPayload | Format::ArrayPayload => {
                None
            }
        }
    }

    /// Returns `true` for the three payload formats.
    #[must_use]
    pub const fn is_payload(self) -> bool {
        self.fixed_size().is_none()
    }
}

/// The supported Dalvik opcodes.
///
/// The `strum` serialisation is the smali mnemonic, so opcodes can be parsed from and
/// rendered to text directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr,
)]
pub enum Opcode {
    /// `nop`
    #[strum(serialize = "nop")]
    Nop,
    /// `move vA, vB`
    #[strum(serialize = "move")]
    Move,
    /// `move-object vA, vB`
    #[strum(serialize = "move-object")]
    MoveObject,
    /// `move-result vAA`
    #[strum(serialize = "move-result")]
    MoveResult,
    /// `move-result-object vAA`
    #[strum(serialize = "move-result-object")]
    MoveResultObject,
    /// `return-void`
    #[strum(serialize = "return-void")]
    ReturnVoid,
    /// `return vAA`
    #[strum(serialize = "return")]
    Return,
    /// `return-object vAA`
    #[strum(serialize = "return-object")]
    ReturnObject,
    /// `const/4 vA, #+B`
    #[strum(serialize = "const/4")]
    Const4,
    /// `const/16 vAA, #+BBBB`
    #[strum(serialize = "const/16")]
    Const16,
    /// `const vAA, #+BBBBBBBB`
    #[strum(serialize = "const")]
    Const,
    /// `const-string vAA, string@BBBB`
    #[strum(serialize = "const-string")]
    ConstString,
    /// `new-instance vAA, type@BBBB`
    #[strum(serialize = "new-instance")]
    NewInstance,
    /// `throw vAA`
    #[strum(serialize = "throw")]
    Throw,
    /// `goto +AA`
    #[strum(serialize = "goto")]
    Goto,
    /// `goto/16 +AAAA`
    #[strum(serialize = "goto/16")]
    Goto16,
    /// `goto/32 +AAAAAAAA`
    #[strum(serialize = "goto/32")]
    Goto32,
    /// `packed-switch vAA, +BBBBBBBB`
    #[strum(serialize = "packed-switch")]
    PackedSwitch,
    /// `sparse-switch vAA, +BBBBBBBB`
    #[strum(serialize = "sparse-switch")]
    SparseSwitch,
    /// `fill-array-data vAA, +BBBBBBBB`
    #[strum(serialize = "fill-array-data")]
    FillArrayData,
    /// `if-eq vA, vB, +CCCC`
    #[strum(serialize = "if-eq")]
    IfEq,
    /// `if-ne vA, vB, +CCCC`
    #[strum(serialize = "if-ne")]
    IfNe,
    /// `if-lt vA, vB, +CCCC`
    #[strum(serialize = "if-lt")]
    IfLt,
    /// `if-ge vA, vB, +CCCC`
    #[strum(serialize = "if-ge")]
    IfGe,
    /// `if-gt vA, vB, +CCCC`
    #[strum(serialize = "if-gt")]
    IfGt,
    /// `if-le vA, vB, +CCCC`
    #[strum(serialize = "if-le")]
    IfLe,
    /// `if-eqz vAA, +BBBB`
    #[strum(serialize = "if-eqz")]
    IfEqz,
    /// `if-nez vAA, +BBBB`
    #[strum(serialize = "if-nez")]
    IfNez,
    /// `if-ltz vAA, +BBBB`
    #[strum(serialize = "if-ltz")]
    IfLtz,
    /// `if-gez vAA, +BBBB`
    #[strum(serialize = "if-gez")]
    IfGez,
    /// `if-gtz vAA, +BBBB`
    #[strum(serialize = "if-gtz")]
    IfGtz,
    /// `if-lez vAA, +BBBB`
    #[strum(serialize = "if-lez")]
    IfLez,
    /// `iget vA, vB, field@CCCC`
    #[strum(serialize = "iget")]
    Iget,
    /// `iget-object vA, vB, field@CCCC`
    #[strum(serialize = "iget-object")]
    IgetObject,
    /// `iput vA, vB, field@CCCC`
    #[strum(serialize = "iput")]
    Iput,
    /// `iput-object vA, vB, field@CCCC`
    #[strum(serialize = "iput-object")]
    IputObject,
    /// `invoke-virtual {...}, meth@BBBB`
    #[strum(serialize = "invoke-virtual")]
    InvokeVirtual,
    /// `invoke-direct {...}, meth@BBBB`
    #[strum(serialize = "invoke-direct")]
    InvokeDirect,
    /// `invoke-static {...}, meth@BBBB`
    #[strum(serialize = "invoke-static")]
    InvokeStatic,
    /// `add-int vAA, vBB, vCC`
    #[strum(serialize = "add-int")]
    AddInt,
    /// `sub-int vAA, vBB, vCC`
    #[strum(serialize = "sub-int")]
    SubInt,
    /// `mul-int vAA, vBB, vCC`
    #[strum(serialize = "mul-int")]
    MulInt,
    /// `and-int vAA, vBB, vCC`
    #[strum(serialize = "and-int")]
    AndInt,
    /// `or-int vAA, vBB, vCC`
    #[strum(serialize = "or-int")]
    OrInt,
    /// `xor-int vAA, vBB, vCC`
    #[strum(serialize = "xor-int")]
    XorInt,
    /// `add-int/lit8 vAA, vBB, #+CC`
    #[strum(serialize = "add-int/lit8")]
    AddIntLit8,
    /// `mul-int/lit8 vAA, vBB, #+CC`
    #[strum(serialize = "mul-int/lit8")]
    MulIntLit8,
    /// `xor-int/lit8 vAA, vBB, #+CC`
    #[strum(serialize = "xor-int/lit8")]
    XorIntLit8,
    /// Packed switch table
    #[strum(serialize = "packed-switch-payload")]
    PackedSwitchPayload,
    /// Sparse switch table
    #[strum(serialize = "sparse-switch-payload")]
    SparseSwitchPayload,
    /// Array data table
    #[strum(serialize = "array-payload")]
    ArrayPayload,
}

impl Opcode {
    /// Returns the smali mnemonic of this opcode.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }

    /// Returns the encoding format of this opcode.
    #[must_use]
    pub const fn format(self) -> Format {
        match self {
            Opcode::Nop | Opcode::ReturnVoid => Format::F10x,
            Opcode::Move | Opcode::MoveObject => Format::F12x,
            Opcode::MoveResult
            | Opcode::MoveResultObject
            | Opcode::Return
            | Opcode::ReturnObject
            | Opcode::Throw => Format::F11x,
            Opcode::Const4 => Format::F11n,
            Opcode::Const16 => Format::F21s,
            Opcode::Const => Format::F31i,
            Opcode::ConstString | Opcode::NewInstance => Format::F21c,
            Opcode::Goto => Format::F10t,
            Opcode::Goto16 => Format::F20t,
            Opcode::Goto32 => Format::F30t,
            Opcode::PackedSwitch | Opcode::SparseSwitch | Opcode::FillArrayData => Format::F31t,
            Opcode::IfEq
            | Opcode::IfNe
            | Opcode::IfLt
            | Opcode::IfGe
            | Opcode::IfGt
            | Opcode::IfLe => Format::F22t,
            Opcode::IfEqz
            | Opcode::IfNez
            | Opcode::IfLtz
            | Opcode::IfGez
            | Opcode::IfGtz
            | Opcode::IfLez => Format::F21t,
            Opcode::Iget | Opcode::IgetObject | Opcode::Iput | Opcode::IputObject => Format::F22c,
            Opcode::InvokeVirtual | Opcode::InvokeDirect | Opcode::InvokeStatic => Format::F35c,
            Opcode::AddInt
            | Opcode::SubInt
            | Opcode::MulInt
            | Opcode::AndInt
            | Opcode::OrInt
            | Opcode::XorInt => Format::F23x,
            Opcode::AddIntLit8 | Opcode::MulIntLit8 | Opcode::XorIntLit8 => Format::F22b,
            Opcode::PackedSwitchPayload => Format::PackedSwitchPayload,
            Opcode::SparseSwitchPayload => Format::SparseSwitchPayload,
            Opcode::ArrayPayload => Format::ArrayPayload,
        }
    }

    /// Returns the property flags of this opcode.
    #[must_use]
    pub const fn flags(self) -> OpcodeFlags {
        const CONT: u32 = OpcodeFlags::CAN_CONTINUE.bits();
        const REG: u32 = OpcodeFlags::SETS_REGISTER.bits();
        let bits = match self {
            Opcode::Nop | Opcode::Iput | Opcode::IputObject => CONT,
            Opcode::Move
            | Opcode::MoveObject
            | Opcode::Const4
            | Opcode::Const16
            | Opcode::Const
            | Opcode::ConstString
            | Opcode::Iget
            | Opcode::IgetObject
            | Opcode::AddInt
            | Opcode::SubInt
            | Opcode::MulInt
            | Opcode::AndInt
            | Opcode::OrInt
            | Opcode::XorInt
            | Opcode::AddIntLit8
            | Opcode::MulIntLit8
            | Opcode::XorIntLit8 => CONT | REG,
            Opcode::MoveResult | Opcode::MoveResultObject => {
                CONT | REG | OpcodeFlags::READS_RESULT.bits()
            }
            Opcode::ReturnVoid | Opcode::Return | Opcode::ReturnObject => {
                OpcodeFlags::RETURN.bits()
            }
            Opcode::Throw => OpcodeFlags::THROW.bits(),
            Opcode::NewInstance => CONT | REG | OpcodeFlags::ALLOCATES.bits(),
            Opcode::Goto | Opcode::Goto16 | Opcode::Goto32 => OpcodeFlags::BRANCH.bits(),
            Opcode::PackedSwitch | Opcode::SparseSwitch => {
                CONT | OpcodeFlags::SWITCH.bits() | OpcodeFlags::SETS_RESULT.bits()
            }
            Opcode::FillArrayData => CONT,
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
            | Opcode::IfLez => CONT | OpcodeFlags::BRANCH.bits(),
            Opcode::InvokeVirtual | Opcode::InvokeDirect | Opcode::InvokeStatic => {
                CONT | OpcodeFlags::INVOKE.bits() | OpcodeFlags::SETS_RESULT.bits()
            }
            Opcode::PackedSwitchPayload | Opcode::SparseSwitchPayload | Opcode::ArrayPayload => {
                OpcodeFlags::PAYLOAD.bits()
            }
        };
        OpcodeFlags::from_bits_truncate(bits)
    }

    /// Returns `true` for switch and array payloads.
    #[must_use]
    pub const fn is_payload(self) -> bool {
        self.format().is_payload()
    }

    /// Returns `true` for switch payloads (not array payloads).
    #[must_use]
    pub const fn is_switch_payload(self) -> bool {
        matches!(self, Opcode::PackedSwitchPayload | Opcode::SparseSwitchPayload)
    }

    /// Returns the range of branch offsets (in code units) this opcode can encode.
    ///
    /// Returns `None` for opcodes without a branch offset.
    #[must_use]
    pub const fn offset_range(self) -> Option<(i64, i64)> {
        match self.format() {
            Format::F10t => Some((i8::MIN as i64, i8::MAX as i64)),
            Format::F20t | Format::F21t | Format::F22t => Some((i16::MIN as i64, i16::MAX as i64)),
            Format::F30t | Format::F31t => Some((i32::MIN as i64, i32::MAX as i64)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_mnemonic_roundtrip() {
        for opcode in Opcode::iter() {
            let parsed: Opcode = opcode.mnemonic().parse().unwrap();
            assert_eq!(parsed, opcode);
        }
    }

    #[test]
    fn test_payloads() {
        let payloads: Vec<Opcode> = Opcode::iter().filter(|op| op.is_payload()).collect();
        assert_eq!(
            payloads,
            vec![
                Opcode::PackedSwitchPayload,
                Opcode::SparseSwitchPayload,
                Opcode::ArrayPayload
            ]
        );
        assert!(payloads
            .iter()
            .all(|op| op.flags().contains(OpcodeFlags::PAYLOAD)));
        assert!(!Opcode::ArrayPayload.is_switch_payload());
    }

    #[test]
    fn test_control_flow_flags() {
        assert!(!Opcode::Goto.flags().contains(OpcodeFlags::CAN_CONTINUE));
        assert!(Opcode::IfNez.flags().contains(OpcodeFlags::CAN_CONTINUE));
        assert!(Opcode::ReturnVoid.flags().contains(OpcodeFlags::RETURN));
        assert!(Opcode::MoveResult.flags().contains(OpcodeFlags::READS_RESULT));
        assert!(Opcode::InvokeStatic.flags().contains(OpcodeFlags::SETS_RESULT));
    }

    #[test]
    fn test_offset_ranges() {
        assert_eq!(Opcode::Goto.offset_range(), Some((-128, 127)));
        assert_eq!(Opcode::Goto16.offset_range(), Some((-32768, 32767)));
        assert_eq!(Opcode::Const4.offset_range(), None);
        assert_eq!(Opcode::Goto32.format().fixed_size(), Some(3));
    }
}
