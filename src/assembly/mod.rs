//! Dalvik instruction model, smali parsing and rendering.
//!
//! # Key Components
//!
//! - [`Opcode`] / [`Format`] / [`OpcodeFlags`] - The supported opcodes and their properties
//! - [`Instruction`] / [`Operand`] - Validated instructions with label-based branch targets
//! - [`parse_smali`] - Builds a [`crate::method::MethodImplementation`] from smali text
//!
//! # Usage Examples
//!
//! ```rust
//! use dexscope::assembly::{parse_smali, Opcode};
//!
//! let implementation = parse_smali(".registers 1\nconst/4 v0, 0x1\nreturn v0")?;
//! let first = implementation.location_at(0).unwrap();
//! assert_eq!(implementation.instruction(first).unwrap().opcode(), Opcode::Const4);
//! assert_eq!(implementation.render_instruction(first)?, "const/4 v0, 0x1");
//! # Ok::<(), dexscope::Error>(())
//! ```

mod instruction;
mod opcode;
mod parser;

pub use instruction::{Instruction, Operand};
pub use opcode::{Format, Opcode, OpcodeFlags};
pub use parser::parse_smali;
