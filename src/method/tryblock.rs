//! Exception handler ranges.

use std::sync::Arc;

use crate::method::LabelId;

/// A protected range `[start, end)` with its handler.
///
/// All three bounds are labels, so the range follows its instructions through edits. A
/// range whose `start` and `end` end up on the same code address covers no instructions
/// and must be dropped before the method is written out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryBlock {
    /// First covered instruction.
    pub start: LabelId,
    /// First instruction after the covered range.
    pub end: LabelId,
    /// Handler entry point.
    pub handler: LabelId,
    /// Caught exception type, `None` for a catch-all handler.
    pub exception_type: Option<Arc<str>>,
}

impl TryBlock {
    /// Creates a typed handler range.
    #[must_use]
    pub fn new(start: LabelId, end: LabelId, handler: LabelId, exception_type: &str) -> Self {
        TryBlock {
            start,
            end,
            handler,
            exception_type: Some(exception_type.into()),
        }
    }

    /// Creates a catch-all handler range.
    #[must_use]
    pub fn catch_all(start: LabelId, end: LabelId, handler: LabelId) -> Self {
        TryBlock {
            start,
            end,
            handler,
            exception_type: None,
        }
    }

    /// Returns `true` if this handler catches every exception type.
    #[must_use]
    pub fn is_catch_all(&self) -> bool {
        self.exception_type.is_none()
    }
}
