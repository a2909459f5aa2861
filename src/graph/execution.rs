//! The execution graph of one method.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Every location of the
//! instruction stream owns a pile of nodes: the template at
//! [`TEMPLATE_NODE_INDEX`] followed by one node per symbolic path that reached the
//! location. Parent/child links between nodes describe the paths themselves.
//!
//! ```text
//!   location    pile
//!   loc0        [template] [n1]
//!   loc1        [template] [n2]
//!   loc2        [template] [n3] [n4]     n3 and n4 reached loc2 along different paths
//! ```

use std::{collections::BTreeMap, sync::Arc};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    assembly::Instruction,
    emulation::{ExecutionContext, Op},
    graph::{ExecutionNode, NodeId},
    method::{LocalMethod, LocationId, MethodImplementation},
    Error, Result,
};

/// Index of the template node in every pile.
pub const TEMPLATE_NODE_INDEX: usize = 0;

/// Per-path symbolic execution state of a method, grouped by instruction location.
#[derive(Debug)]
pub struct ExecutionGraph {
    method: Arc<LocalMethod>,
    nodes: Vec<Option<ExecutionNode>>,
    piles: FxHashMap<LocationId, Vec<NodeId>>,
    address_to_location: BTreeMap<u32, LocationId>,
    location_to_address: FxHashMap<LocationId, u32>,
}

impl ExecutionGraph {
    pub(crate) fn new(method: Arc<LocalMethod>) -> Self {
        ExecutionGraph {
            method,
            nodes: Vec::new(),
            piles: FxHashMap::default(),
            address_to_location: BTreeMap::new(),
            location_to_address: FxHashMap::default(),
        }
    }

    /// Returns the method this graph executes.
    #[must_use]
    pub fn method(&self) -> &Arc<LocalMethod> {
        &self.method
    }

    fn inconsistency(location: LocationId, reason: impl Into<String>) -> Error {
        Error::GraphInconsistency {
            location,
            reason: reason.into(),
        }
    }

    /// Creates the pile of `location` holding only a template node with `op`.
    pub(crate) fn add_pile(&mut self, location: LocationId, op: Arc<dyn Op>) -> Result<NodeId> {
        if self.piles.contains_key(&location) {
            return Err(Self::inconsistency(location, "location already has a node pile"));
        }
        let id = self.allocate(ExecutionNode::new(op, location, None));
        self.piles.insert(location, vec![id]);
        Ok(id)
    }

    /// Appends an executable node to the pile of `location`.
    pub(crate) fn add_node(
        &mut self,
        location: LocationId,
        op: Arc<dyn Op>,
        context: ExecutionContext,
    ) -> Result<NodeId> {
        if !self.piles.contains_key(&location) {
            return Err(Self::inconsistency(location, "no node pile for location"));
        }
        let id = self.allocate(ExecutionNode::new(op, location, Some(context)));
        if let Some(pile) = self.piles.get_mut(&location) {
            pile.push(id);
        }
        Ok(id)
    }

    fn allocate(&mut self, node: ExecutionNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(node));
        id
    }

    /// Returns the node behind `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DanglingNode`] if the node was removed.
    pub fn node(&self, id: NodeId) -> Result<&ExecutionNode> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(Error::DanglingNode(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut ExecutionNode> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(Error::DanglingNode(id))
    }

    /// Returns the context of an executable node.
    pub(crate) fn context(&self, id: NodeId) -> Result<&ExecutionContext> {
        let node = self.node(id)?;
        node.context
            .as_ref()
            .ok_or_else(|| Self::inconsistency(node.location, format!("{id} is a template")))
    }

    /// Makes `child` a child of `parent`.
    pub(crate) fn attach(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.node(child)?;
        let node = self.node_mut(parent)?;
        if !node.children.contains(&child) {
            node.children.push(child);
        }
        self.node_mut(child)?.parent = Some(parent);
        Ok(())
    }

    /// Detaches `child` from its parent and returns the former parent.
    pub(crate) fn detach(&mut self, child: NodeId) -> Result<Option<NodeId>> {
        let parent = self.node_mut(child)?.parent.take();
        if let Some(parent) = parent {
            self.node_mut(parent)?.children.retain(|id| *id != child);
        }
        Ok(parent)
    }

    /// Puts `replacement` into the place of `child` below `child`'s parent.
    ///
    /// `child` ends up without a parent. The position in the parent's child list is kept.
    pub(crate) fn splice(&mut self, child: NodeId, replacement: NodeId) -> Result<Option<NodeId>> {
        let parent = self.node_mut(child)?.parent.take();
        if let Some(parent) = parent {
            let children = &mut self.node_mut(parent)?.children;
            match children.iter().position(|id| *id == child) {
                Some(position) => children[position] = replacement,
                None => children.push(replacement),
            }
            self.node_mut(replacement)?.parent = Some(parent);
        }
        Ok(parent)
    }

    /// Removes a node from the arena and its pile, detaching it from its parent.
    ///
    /// Children of the node are left without a parent.
    pub(crate) fn remove_node(&mut self, id: NodeId) -> Result<ExecutionNode> {
        self.detach(id)?;
        let node = self
            .nodes
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(Error::DanglingNode(id))?;
        for child in &node.children {
            if let Some(Some(child)) = self.nodes.get_mut(child.0) {
                child.parent = None;
            }
        }
        if let Some(pile) = self.piles.get_mut(&node.location) {
            pile.retain(|member| *member != id);
        }
        Ok(node)
    }

    /// Removes the pile of `location` together with all of its nodes.
    pub(crate) fn remove_pile(&mut self, location: LocationId) -> Result<()> {
        let pile = self
            .piles
            .remove(&location)
            .ok_or_else(|| Self::inconsistency(location, "no node pile to remove"))?;
        for id in pile {
            self.remove_node(id)?;
        }
        Ok(())
    }

    /// Assigns `op` to every node of the pile of `location`.
    pub(crate) fn set_op(&mut self, location: LocationId, op: &Arc<dyn Op>) -> Result<()> {
        let pile = self
            .piles
            .get(&location)
            .cloned()
            .ok_or_else(|| Self::inconsistency(location, "no node pile for location"))?;
        for id in pile {
            self.node_mut(id)?.op = Arc::clone(op);
        }
        Ok(())
    }

    /// Runs the op of `id` against its context, discarding what a previous execution
    /// wrote, and returns the locations the path continues at.
    pub(crate) fn execute_node(&mut self, id: NodeId) -> Result<Vec<LocationId>> {
        let next = {
            let node = self.node(id)?;
            let context = node.context.as_ref().ok_or_else(|| {
                Self::inconsistency(node.location, format!("template {id} cannot be executed"))
            })?;
            context.reset()?;
            node.op.execute(context)?
        };
        self.node_mut(id)?.executions += 1;
        Ok(next)
    }

    /// Replaces both address indexes with the current layout of `implementation`.
    pub(crate) fn set_addresses(&mut self, implementation: &MethodImplementation) {
        self.address_to_location.clear();
        self.location_to_address.clear();
        for location in implementation.locations() {
            if let Some(address) = implementation.code_address(*location) {
                self.address_to_location.insert(address, *location);
                self.location_to_address.insert(*location, address);
            }
        }
    }

    /// Returns `true` if `location` has a node pile.
    #[must_use]
    pub fn has_pile(&self, location: LocationId) -> bool {
        self.piles.contains_key(&location)
    }

    /// Returns the nodes of `location`, template first.
    #[must_use]
    pub fn pile(&self, location: LocationId) -> Option<&[NodeId]> {
        self.piles.get(&location).map(Vec::as_slice)
    }

    /// Returns the executable nodes of `location`, skipping the template.
    #[must_use]
    pub fn path_nodes(&self, location: LocationId) -> &[NodeId] {
        self.piles
            .get(&location)
            .and_then(|pile| pile.get(TEMPLATE_NODE_INDEX + 1..))
            .unwrap_or_default()
    }

    /// Returns every location with a node pile, in no particular order.
    pub fn pile_locations(&self) -> impl Iterator<Item = LocationId> + '_ {
        self.piles.keys().copied()
    }

    /// Returns the template node of `location`.
    #[must_use]
    pub fn template(&self, location: LocationId) -> Option<&ExecutionNode> {
        let id = *self.piles.get(&location)?.get(TEMPLATE_NODE_INDEX)?;
        self.node(id).ok()
    }

    /// Returns the op currently assigned to `location`.
    #[must_use]
    pub fn template_op(&self, location: LocationId) -> Option<Arc<dyn Op>> {
        self.template(location).map(|node| Arc::clone(&node.op))
    }

    /// Returns all locations in address order.
    #[must_use]
    pub fn locations(&self) -> Vec<LocationId> {
        self.address_to_location.values().copied().collect()
    }

    /// Returns all instruction addresses in ascending order.
    #[must_use]
    pub fn addresses(&self) -> Vec<u32> {
        self.address_to_location.keys().copied().collect()
    }

    /// Returns the location of the instruction starting at `address`.
    #[must_use]
    pub fn location_at(&self, address: u32) -> Option<LocationId> {
        self.address_to_location.get(&address).copied()
    }

    /// Returns the current code address of `location`.
    #[must_use]
    pub fn address_of(&self, location: LocationId) -> Option<u32> {
        self.location_to_address.get(&location).copied()
    }

    fn location_or_error(&self, address: u32) -> Result<LocationId> {
        self.location_at(address)
            .ok_or(Error::InvalidAddress(address))
    }

    /// Returns the instruction starting at `address`.
    #[must_use]
    pub fn instruction_at(&self, address: u32) -> Option<&Instruction> {
        let location = self.location_at(address)?;
        self.template(location).map(|node| node.op.instruction())
    }

    /// Returns the number of paths that reached `location`.
    #[must_use]
    pub fn path_count(&self, location: LocationId) -> usize {
        self.path_nodes(location).len()
    }

    /// Returns the number of executable nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.piles.values().map(|pile| pile.len().saturating_sub(1)).sum()
    }

    /// Returns the addresses executed directly after `address` on any path, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if no instruction starts at `address`.
    pub fn children(&self, address: u32) -> Result<Vec<u32>> {
        let location = self.location_or_error(address)?;
        let mut addresses = Vec::new();
        for id in self.path_nodes(location) {
            for child in &self.node(*id)?.children {
                let child_location = self.node(*child)?.location;
                if let Some(child_address) = self.address_of(child_location) {
                    addresses.push(child_address);
                }
            }
        }
        addresses.sort_unstable();
        addresses.dedup();
        Ok(addresses)
    }

    /// Returns the child nodes of every path node at `address`.
    pub(crate) fn child_nodes(&self, address: u32) -> Result<Vec<NodeId>> {
        let location = self.location_or_error(address)?;
        let mut children = Vec::new();
        for id in self.path_nodes(location) {
            children.extend_from_slice(&self.node(*id)?.children);
        }
        Ok(children)
    }

    /// Returns the addresses executed directly before `address` on any path, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if no instruction starts at `address`.
    pub fn parent_addresses(&self, address: u32) -> Result<Vec<u32>> {
        let location = self.location_or_error(address)?;
        let mut addresses = Vec::new();
        for id in self.path_nodes(location) {
            if let Some(parent) = self.node(*id)?.parent {
                let parent_location = self.node(parent)?.location;
                if let Some(parent_address) = self.address_of(parent_location) {
                    addresses.push(parent_address);
                }
            }
        }
        addresses.sort_unstable();
        addresses.dedup();
        Ok(addresses)
    }

    /// Checks that parent and child links agree and point into live piles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GraphInconsistency`] for the first broken link found.
    pub fn verify(&self) -> Result<()> {
        let mut seen = FxHashSet::default();
        for (location, pile) in &self.piles {
            for (index, id) in pile.iter().enumerate() {
                let node = self.node(*id)?;
                if node.location != *location {
                    return Err(Self::inconsistency(*location, format!("{id} is in a foreign pile")));
                }
                if index == TEMPLATE_NODE_INDEX {
                    if !node.is_template() || node.parent.is_some() || !node.children.is_empty() {
                        return Err(Self::inconsistency(*location, "template carries path state"));
                    }
                    continue;
                }
                if node.is_template() {
                    return Err(Self::inconsistency(*location, format!("{id} has no context")));
                }
                if let Some(parent) = node.parent {
                    if !self.node(parent)?.children.contains(id) {
                        return Err(Self::inconsistency(
                            *location,
                            format!("{id} is not listed by its parent {parent}"),
                        ));
                    }
                }
                for child in &node.children {
                    if self.node(*child)?.parent != Some(*id) {
                        return Err(Self::inconsistency(
                            *location,
                            format!("child {child} of {id} has a different parent"),
                        ));
                    }
                }
                seen.insert(*id);
            }
        }
        let live = self.nodes.iter().flatten().filter(|node| !node.is_template()).count();
        if live != seen.len() {
            return Err(Error::Error(format!(
                "{} executable nodes are not part of any pile",
                live - seen.len().min(live)
            )));
        }
        Ok(())
    }
}
