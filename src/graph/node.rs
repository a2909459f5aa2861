//! Execution nodes and their arena identifiers.

use std::{fmt, sync::Arc};

use crate::{
    emulation::{ExecutionContext, Op},
    method::LocationId,
};

/// A strongly-typed identifier for nodes within an execution graph.
///
/// `NodeId` wraps an arena index. Indices are handed out sequentially and never reused,
/// so an id of a removed node stays invalid instead of silently resolving to a newer
/// node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Creates a new `NodeId` from a raw index value.
    ///
    /// Mostly useful for tests, ids are normally obtained from an
    /// [`crate::graph::ExecutionGraph`].
    #[must_use]
    #[inline]
    pub const fn new(index: usize) -> Self {
        NodeId(index)
    }

    /// Returns the raw index value of this node identifier.
    #[must_use]
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// One execution of the op at a location along one symbolic path.
///
/// The first node of every pile is the template: it carries the op of the location but
/// no context, has no parent and no children, and is never executed.
#[derive(Debug)]
pub struct ExecutionNode {
    pub(crate) op: Arc<dyn Op>,
    pub(crate) location: LocationId,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) context: Option<ExecutionContext>,
    pub(crate) executions: u32,
}

impl ExecutionNode {
    pub(crate) fn new(
        op: Arc<dyn Op>,
        location: LocationId,
        context: Option<ExecutionContext>,
    ) -> Self {
        ExecutionNode {
            op,
            location,
            parent: None,
            children: Vec::new(),
            context,
            executions: 0,
        }
    }

    /// Returns the op of this node.
    #[must_use]
    pub fn op(&self) -> &Arc<dyn Op> {
        &self.op
    }

    /// Returns the location this node executes.
    #[must_use]
    pub fn location(&self) -> LocationId {
        self.location
    }

    /// Returns the parent node, `None` for the method entry and for templates.
    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Returns the nodes executed after this one on its path.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Returns the path state of this node, `None` for templates.
    #[must_use]
    pub fn context(&self) -> Option<&ExecutionContext> {
        self.context.as_ref()
    }

    /// Returns `true` for the template node of a pile.
    #[must_use]
    pub fn is_template(&self) -> bool {
        self.context.is_none()
    }

    /// Returns how often this node was executed.
    #[must_use]
    pub fn executions(&self) -> u32 {
        self.executions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display() {
        let id = NodeId::new(7);
        assert_eq!(id.index(), 7);
        assert_eq!(id.to_string(), "n7");
        assert_eq!(format!("{id:?}"), "NodeId(7)");
    }
}
