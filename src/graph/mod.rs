//! Execution graphs and their incremental maintenance.
//!
//! An [`ExecutionGraph`] records, for every location of a method, one
//! [`ExecutionNode`] per symbolic path that reached it. The
//! [`ExecutionGraphManipulator`] edits the instruction stream of the method and keeps the
//! graph consistent by growing and shrinking node piles, rewiring paths and re-executing
//! only the nodes whose inputs changed.
//!
//! # Key Components
//!
//! - [`ExecutionGraph`] - node arena, piles per location and the address index
//! - [`ExecutionNode`] / [`NodeId`] - one execution along one path
//! - [`ExecutionGraphManipulator`] - insert, remove and replace with the rebuild protocol
//! - [`ExecutionGraph::available_registers`] - register liveness below an address
//! - [`remove_empty_try_blocks`] - drops exception ranges collapsed by removals

mod execution;
mod liveness;
mod manipulator;
mod node;
mod sanitize;

pub use execution::{ExecutionGraph, TEMPLATE_NODE_INDEX};
pub use manipulator::{ExecutionGraphManipulator, ManipulatorStats};
pub use node::{ExecutionNode, NodeId};
pub use sanitize::{is_empty_try_block, remove_empty_try_blocks};
