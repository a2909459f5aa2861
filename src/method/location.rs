//! Identity handles for instruction slots and branch labels.
//!
//! A [`LocationId`] names one slot of a [`crate::method::MethodImplementation`] for as long
//! as that slot exists. Its index and code address change with every edit, the handle
//! does not. A [`LabelId`] names a branch target; labels are attached to locations and
//! move between them when instructions are inserted or removed.

use std::fmt;

/// Identity-stable handle to one instruction slot of a method.
///
/// Handles are never reused within one [`crate::method::MethodImplementation`], so a
/// handle whose slot has been removed simply stops resolving.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocationId(pub(crate) u32);

impl LocationId {
    /// Creates a location handle from its raw arena index.
    #[must_use]
    #[inline]
    pub const fn new(index: u32) -> Self {
        LocationId(index)
    }

    /// Returns the raw arena index.
    #[must_use]
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocationId({})", self.0)
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loc{}", self.0)
    }
}

/// Handle to a branch or try-range label.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LabelId(pub(crate) u32);

impl LabelId {
    /// Creates a label handle from its raw index.
    #[must_use]
    #[inline]
    pub const fn new(index: u32) -> Self {
        LabelId(index)
    }

    /// Returns the raw index.
    #[must_use]
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LabelId({})", self.0)
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label{}", self.0)
    }
}
