// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0


#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # dexscope
//!
//! An execution-graph mutation engine for simplifying obfuscated Dalvik bytecode.
//!
//! `dexscope` symbolically executes a method's instructions, recording one execution node
//! per symbolic path at every instruction, and keeps that graph consistent while the
//! instruction stream is edited. A simplifier can insert, remove and replace instructions
//! and immediately ask the graph what executes where, which registers are still needed,
//! and what the method looks like now, without executing the whole method again.
//!
//! ## Features
//!
//! - **Incremental rebuilds** - edits grow and shrink only the affected node piles and
//!   re-execute only the nodes whose inputs changed, in address order
//! - **Batched replacement** - replacing one instruction by many costs a single pass
//! - **Path-sensitive liveness** - registers no later path reads before assigning them
//! - **Self-normalising instruction stream** - payload alignment, orphaned payloads and
//!   branch widening are handled after every edit
//! - **Exception range hygiene** - try blocks collapsed by removals are dropped
//! - **Parallel method processing** - independent graphs built with `rayon`
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use dexscope::prelude::*;
//!
//! let implementation = parse_smali(
//!     "
//!     .registers 2
//!     const/4 v0, 0x0
//!     if-eqz v0, :skip
//!     const/4 v1, 0x5
//!     :skip
//!     return-void
//!     ",
//! )?;
//! let method = Arc::new(LocalMethod::new("Lcom/example/Foo;->bar()V", 2, true)?);
//! let vm = Arc::new(VirtualMachine::new(Arc::new(ClassManager::new()), VmConfig::default()));
//! let mut manipulator = ExecutionGraphManipulator::build(vm, method, implementation)?;
//!
//! // The branch is always taken, the constant at 0x3 is never reached.
//! assert_eq!(manipulator.children(1)?, vec![4]);
//! manipulator.remove_at(3)?;
//! assert_eq!(manipulator.children(1)?, vec![3]);
//! # Ok::<(), dexscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`assembly`] - opcodes, instructions and smali text
//! - [`method`] - the mutable instruction stream with stable locations and labels
//! - [`emulation`] - the symbolic virtual machine: contexts, ops, op factory, clone cache
//! - [`graph`] - execution graphs, the manipulator, liveness and try range cleanup
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`] with the crate-wide [`Error`]. An edit
//! that fails half way poisons its manipulator, see [`graph::ExecutionGraphManipulator`].

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use dexscope::prelude::*;
///
/// let implementation = parse_smali(".registers 1\nreturn-void")?;
/// assert_eq!(implementation.len(), 1);
/// # Ok::<(), dexscope::Error>(())
/// ```
pub mod prelude;

/// Dalvik opcodes, instructions and smali text.
///
/// # Key Types
///
/// - [`assembly::Opcode`] - the supported opcodes with formats and flags
/// - [`assembly::Instruction`] - an opcode with validated operands
/// - [`assembly::parse_smali`] - builds a method implementation from smali text
pub mod assembly;

/// Method signatures and the editable instruction stream.
///
/// # Key Types
///
/// - [`method::MethodImplementation`] - instructions addressed by stable locations
/// - [`method::LocationId`] / [`method::LabelId`] - stream positions and branch labels
/// - [`method::TryBlock`] - exception handler ranges
/// - [`method::LocalMethod`] - the method being simplified
pub mod method;

/// Symbolic execution: virtual machine, contexts, ops and the clone strategy cache.
pub mod emulation;

/// Execution graphs and their incremental maintenance.
pub mod graph;

/// `dexscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
/// This is used consistently throughout the crate for all fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `dexscope` Error type
///
/// The main error type for all operations in this crate.
///
/// # Examples
///
/// ```rust
/// use dexscope::{assembly::parse_smali, Error};
///
/// match parse_smali(".registers 1") {
///     Err(Error::Empty) => println!("no instructions"),
///     Err(Error::Malformed { message, .. }) => println!("Malformed: {}", message),
///     Err(e) => println!("Error: {}", e),
///     Ok(_) => unreachable!(),
/// }
/// ```
pub use error::Error;
