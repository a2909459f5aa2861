//! Method bodies: the editable instruction stream and its identity handles.
//!
//! This module holds the data structure the execution graph mirrors. A
//! [`MethodImplementation`] is an ordered list of instructions addressed through
//! identity-stable [`LocationId`]s, with branch [`LabelId`]s attached to locations and
//! exception [`TryBlock`]s expressed as label ranges.
//!
//! # Key Components
//!
//! - [`MethodImplementation`] - The mutable instruction stream with automatic normalisation
//! - [`LocationId`] / [`LabelId`] - Handles that stay valid across edits
//! - [`TryBlock`] - Exception handler ranges
//! - [`LocalMethod`] / [`MethodSignature`] - The method being simplified and method references

mod descriptor;
mod implementation;
mod location;
mod tryblock;

pub use descriptor::{is_wide, LocalMethod, MethodSignature};
pub use implementation::MethodImplementation;
pub use location::{LabelId, LocationId};
pub use tryblock::TryBlock;
