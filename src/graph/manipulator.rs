//! Structural edits of a method while keeping its execution graph consistent.
//!
//! [`ExecutionGraphManipulator`] owns a method implementation together with its
//! [`ExecutionGraph`]. Every edit changes the instruction stream first and then runs the
//! rebuild protocol, which brings the graph back in line with the stream:
//!
//! 1. Diff the locations of the stream against the locations with node piles. Locations
//!    without a pile were *added*, piles without a location are *stale*. Normalisation of
//!    the stream (payload padding, orphaned payloads) may add or remove more locations
//!    than the one edited.
//! 2. Grow a pile for every added location, splicing a new node in front of every path
//!    node of the location that was pushed one index up (the donor).
//! 3. Shrink every stale pile, handing the children of its nodes to their grandparents.
//! 4. Replace the address index with the new layout.
//! 5. Recreate the ops whose neighbours changed and re-execute the affected nodes in
//!    ascending address order.
//!
//! Step 5 is skipped between the sub-edits of [`ExecutionGraphManipulator::replace`] so a
//! replacement costs a single recreate and re-execute pass.
//!
//! # Failure
//!
//! An edit that fails after the stream was touched leaves the graph in an unknown state.
//! The manipulator is poisoned and rejects every later edit and query with
//! [`Error::GraphPoisoned`]; the caller is expected to give up on the method.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use dexscope::prelude::*;
//!
//! let implementation = parse_smali(
//!     "
//!     .registers 2
//!     const/4 v0, 0x1
//!     const/4 v1, 0x2
//!     return v0
//!     ",
//! )?;
//! let method = Arc::new(LocalMethod::new("Lcom/example/Foo;->one()I", 2, true)?);
//! let vm = Arc::new(VirtualMachine::new(Arc::new(ClassManager::new()), VmConfig::default()));
//! let mut manipulator = ExecutionGraphManipulator::build(vm, method, implementation)?;
//!
//! // v1 is never read again after the first instruction
//! assert_eq!(manipulator.available_registers(0)?, vec![1]);
//! manipulator.remove_at(1)?;
//! assert_eq!(manipulator.to_smali()?, "const/4 v0, 0x1\nreturn v0");
//! # Ok::<(), dexscope::Error>(())
//! ```

use std::{cmp::Reverse, fmt, sync::Arc};

use rustc_hash::FxHashSet;

use crate::{
    assembly::{Instruction, Opcode, OpcodeFlags},
    emulation::{ExecutionContext, Op, VirtualMachine},
    graph::{sanitize, ExecutionGraph, NodeId},
    method::{LocalMethod, LocationId, MethodImplementation, TryBlock},
    Error, Result,
};

/// Counters of the work done by a manipulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManipulatorStats {
    /// Rebuild protocol runs, one per stream mutation.
    pub rebuilds: usize,
    /// Recreate and re-execute passes.
    pub recreate_passes: usize,
    /// Ops created again because their neighbourhood changed.
    pub ops_recreated: usize,
    /// Node executions during re-execution.
    pub nodes_executed: usize,
}

impl fmt::Display for ManipulatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rebuilds, {} passes, {} ops recreated, {} nodes executed",
            self.rebuilds, self.recreate_passes, self.ops_recreated, self.nodes_executed
        )
    }
}

/// Applies instruction edits to a method and keeps its execution graph consistent.
///
/// Edits are not reentrant; one manipulator serves one method on one thread.
#[derive(Debug)]
pub struct ExecutionGraphManipulator {
    graph: ExecutionGraph,
    implementation: MethodImplementation,
    vm: Arc<VirtualMachine>,
    recreate: FxHashSet<LocationId>,
    reexecute: Vec<LocationId>,
    recreate_or_reexecute: bool,
    poisoned: bool,
    stats: ManipulatorStats,
}

impl ExecutionGraphManipulator {
    /// Wraps an already executed graph of `implementation`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GraphInconsistency`] if the graph has no pile for a location of
    /// the stream.
    pub fn new(
        graph: ExecutionGraph,
        implementation: MethodImplementation,
        vm: Arc<VirtualMachine>,
    ) -> Result<Self> {
        if let Some(location) = implementation
            .locations()
            .iter()
            .find(|location| !graph.has_pile(**location))
        {
            return Err(Error::GraphInconsistency {
                location: *location,
                reason: "graph was not built from this implementation".to_string(),
            });
        }
        Ok(ExecutionGraphManipulator {
            graph,
            implementation,
            vm,
            recreate: FxHashSet::default(),
            reexecute: Vec::new(),
            recreate_or_reexecute: true,
            poisoned: false,
            stats: ManipulatorStats::default(),
        })
    }

    /// Executes `implementation` on `vm` and wraps the resulting graph.
    ///
    /// # Errors
    ///
    /// Returns any error of [`VirtualMachine::execute`].
    pub fn build(
        vm: Arc<VirtualMachine>,
        method: Arc<LocalMethod>,
        implementation: MethodImplementation,
    ) -> Result<Self> {
        let graph = vm.execute(&method, &implementation)?;
        Self::new(graph, implementation, vm)
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::GraphPoisoned);
        }
        Ok(())
    }

    /// Runs a mutation, poisoning the manipulator if it fails.
    fn guarded<T>(&mut self, edit: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = edit(self);
        if let Err(error) = &result {
            log::error!("{}: edit failed, abandoning graph: {}", self.graph.method(), error);
            self.poisoned = true;
        }
        result
    }

    fn location_or_error(&self, address: u32) -> Result<LocationId> {
        self.implementation
            .location_at(address)
            .ok_or(Error::InvalidAddress(address))
    }

    /// Inserts `instruction` before `location` and returns the new location.
    ///
    /// Labels of `location` move to the new instruction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLocation`] if `location` holds no instruction, and any
    /// error of the rebuild protocol.
    pub fn insert(&mut self, location: LocationId, instruction: Instruction) -> Result<LocationId> {
        self.check_usable()?;
        if !self.implementation.contains(location) {
            return Err(Error::InvalidLocation(location));
        }
        self.guarded(|this| {
            let inserted = this.implementation.insert_before(location, instruction)?;
            this.rebuild()?;
            Ok(inserted)
        })
    }

    /// Inserts `instruction` before the instruction at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if no instruction starts at `address`.
    pub fn insert_at(&mut self, address: u32, instruction: Instruction) -> Result<LocationId> {
        self.check_usable()?;
        let location = self.location_or_error(address)?;
        self.insert(location, instruction)
    }

    /// Removes the instruction at `location`.
    ///
    /// Its labels move to the following instruction and try blocks left empty are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLocation`] if `location` holds no instruction, and any
    /// error of the rebuild protocol.
    pub fn remove(&mut self, location: LocationId) -> Result<()> {
        self.check_usable()?;
        if !self.implementation.contains(location) {
            return Err(Error::InvalidLocation(location));
        }
        self.guarded(|this| this.remove_unchecked(location))
    }

    fn remove_unchecked(&mut self, location: LocationId) -> Result<()> {
        self.implementation.remove(location)?;
        sanitize::remove_empty_try_blocks(&mut self.implementation);
        self.rebuild()
    }

    /// Removes the instruction at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if no instruction starts at `address`.
    pub fn remove_at(&mut self, address: u32) -> Result<()> {
        self.check_usable()?;
        let location = self.location_or_error(address)?;
        self.remove(location)
    }

    /// Removes the instructions at all `addresses`, highest address first.
    ///
    /// Instructions that normalisation already dropped as a consequence of an earlier
    /// removal of the batch are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] before touching anything if one of the addresses
    /// does not start an instruction.
    pub fn remove_all(&mut self, addresses: &[u32]) -> Result<()> {
        self.check_usable()?;
        let mut addresses = addresses.to_vec();
        addresses.sort_unstable_by_key(|address| Reverse(*address));
        addresses.dedup();
        let locations = addresses
            .iter()
            .map(|address| self.location_or_error(*address))
            .collect::<Result<Vec<_>>>()?;
        log::debug!(
            "{}: removing {} instructions at {:x?}",
            self.graph.method(),
            locations.len(),
            addresses
        );

        self.guarded(|this| {
            for location in locations {
                if !this.implementation.contains(location) {
                    log::debug!("{} already removed by normalisation", location);
                    continue;
                }
                this.remove_unchecked(location)?;
            }
            Ok(())
        })
    }

    /// Replaces the instruction at `address` with `instructions`, in order.
    ///
    /// The whole replacement is reflected in the graph with a single recreate and
    /// re-execute pass. Labels of the replaced instruction move to the first replacement.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if no instruction starts at `address`, and any
    /// error of the rebuild protocol.
    pub fn replace(&mut self, address: u32, instructions: Vec<Instruction>) -> Result<()> {
        self.check_usable()?;
        let location = self.location_or_error(address)?;

        self.guarded(|this| {
            let batching = this.recreate_or_reexecute;
            this.recreate_or_reexecute = false;
            for instruction in instructions {
                this.implementation.insert_before(location, instruction)?;
                this.rebuild()?;
            }
            this.recreate_or_reexecute = batching;
            if this.implementation.contains(location) {
                this.remove_unchecked(location)
            } else {
                // Normalisation already dropped the replaced padding.
                this.rebuild()
            }
        })
    }

    /// Brings the graph in line with the instruction stream.
    fn rebuild(&mut self) -> Result<()> {
        let current: FxHashSet<LocationId> =
            self.implementation.locations().iter().copied().collect();

        let mut added: Vec<LocationId> = self
            .implementation
            .locations()
            .iter()
            .copied()
            .filter(|location| !self.graph.has_pile(*location))
            .collect();
        added.reverse();

        let mut stale: Vec<LocationId> = self
            .graph
            .pile_locations()
            .filter(|location| !current.contains(location))
            .collect();
        stale.sort_unstable();

        log::debug!(
            "{}: rebuild, added {:?}, stale {:?}",
            self.graph.method(),
            added,
            stale
        );

        self.mark_neighbours(&added, &stale);
        for location in added {
            self.grow(location)?;
        }
        for location in stale {
            self.shrink(location)?;
        }
        for location in self.implementation.take_rewritten() {
            self.recreate.insert(location);
        }

        self.graph.set_addresses(&self.implementation);
        self.stats.rebuilds += 1;

        if self.recreate_or_reexecute {
            self.recreate_and_execute()?;
        }
        Ok(())
    }

    /// Marks the ops whose successors moved: the predecessor of every added location and
    /// every op with a successor that was removed or gained a new predecessor.
    fn mark_neighbours(&mut self, added: &[LocationId], stale: &[LocationId]) {
        let mut moved: FxHashSet<LocationId> = stale.iter().copied().collect();
        for location in added {
            let Some(index) = self.implementation.index_of(*location) else {
                continue;
            };
            if let Some(donor) = self.implementation.location_at_index(index + 1) {
                moved.insert(donor);
            }
            if let Some(previous) = index
                .checked_sub(1)
                .and_then(|previous| self.implementation.location_at_index(previous))
            {
                self.recreate.insert(previous);
            }
        }
        if moved.is_empty() {
            return;
        }

        for location in self.graph.pile_locations().collect::<Vec<_>>() {
            let Some(op) = self.graph.template_op(location) else {
                continue;
            };
            if op.children().iter().any(|child| moved.contains(child)) {
                self.recreate.insert(location);
            }
        }
    }

    fn queue_reexecute(&mut self, location: LocationId) {
        self.reexecute.push(location);
    }

    fn recreate_parent(&mut self, parent: NodeId) -> Result<()> {
        let location = self.graph.node(parent)?.location();
        self.recreate.insert(location);
        Ok(())
    }

    /// Creates the pile of a new location and splices its nodes into the paths of the
    /// donor, the location directly after it.
    fn grow(&mut self, location: LocationId) -> Result<()> {
        let op = self
            .vm
            .op_factory()
            .create(location, &self.implementation)?;
        self.graph.add_pile(location, Arc::clone(&op))?;
        self.recreate.insert(location);
        self.queue_reexecute(location);

        let index = self
            .implementation
            .index_of(location)
            .ok_or(Error::InvalidLocation(location))?;
        let donor = self
            .implementation
            .location_at_index(index + 1)
            .filter(|donor| self.graph.has_pile(*donor))
            .ok_or(Error::MissingDonor {
                location,
                index: index + 1,
            })?;
        let donor_op = self
            .graph
            .template_op(donor)
            .ok_or(Error::MissingDonor {
                location,
                index: index + 1,
            })?;

        // Padding in front of a payload is never reached.
        if is_padding(op.as_ref(), donor_op.as_ref()) {
            return Ok(());
        }

        for donor_node in self.graph.path_nodes(donor).to_vec() {
            let former_parent = self.graph.node(donor_node)?.parent();
            let context = match former_parent {
                Some(parent) => self.graph.context(parent)?.spawn_child(),
                None => self.vm.spawn_root_context(self.graph.method()),
            };
            let node = self.graph.add_node(location, Arc::clone(&op), context)?;
            if let Some(parent) = self.graph.splice(donor_node, node)? {
                self.recreate_parent(parent)?;
            }
            self.reparent(donor_node, node)?;
        }
        Ok(())
    }

    /// Removes the pile of a location that left the stream, handing the children of its
    /// nodes to their grandparents.
    fn shrink(&mut self, location: LocationId) -> Result<()> {
        let mut payloads = Vec::new();

        for node in self.graph.path_nodes(location).to_vec() {
            let parent = self.graph.detach(node)?;
            if let Some(parent) = parent {
                self.recreate_parent(parent)?;
            }

            for child in self.graph.node(node)?.children().to_vec() {
                self.graph.detach(child)?;
                if self.graph.node(child)?.op().instruction().opcode().is_payload() {
                    for grandchild in self.graph.node(child)?.children().to_vec() {
                        self.graph.detach(grandchild)?;
                        self.adopt(grandchild, parent)?;
                    }
                    payloads.push(child);
                } else {
                    self.adopt(child, parent)?;
                }
            }
        }

        self.graph.remove_pile(location)?;
        for payload in payloads {
            // The payload pile may be stale itself and already gone.
            if self.graph.node(payload).is_ok() {
                self.graph.remove_node(payload)?;
            }
        }
        Ok(())
    }

    /// Attaches an orphaned node to `parent`, or turns it into a new path root.
    fn adopt(&mut self, node: NodeId, parent: Option<NodeId>) -> Result<()> {
        match parent {
            Some(parent) => self.reparent(node, parent),
            None => {
                let context = self.vm.spawn_root_context(self.graph.method());
                self.install_context(node, context)
            }
        }
    }

    /// Moves `node` below `parent` with a context derived from the parent's.
    fn reparent(&mut self, node: NodeId, parent: NodeId) -> Result<()> {
        let context = self.graph.context(parent)?.spawn_child();
        self.graph.attach(parent, node)?;
        self.install_context(node, context)
    }

    /// Gives `node` a new context, relinks its children onto it and queues the node for
    /// re-execution.
    fn install_context(&mut self, node: NodeId, context: ExecutionContext) -> Result<()> {
        let current = self.graph.node(node)?;
        if let Some(previous) = &current.context {
            context.inherit_allocation(previous)?;
        }
        for child in current.children().to_vec() {
            self.graph.context(child)?.relink_ancestor(&context)?;
        }
        let entry = self.graph.node_mut(node)?;
        entry.context = Some(context);
        let location = entry.location();
        self.queue_reexecute(location);
        Ok(())
    }

    /// Recreates the ops of the recreate set and re-executes the nodes of the re-execute
    /// set in ascending address order.
    fn recreate_and_execute(&mut self) -> Result<()> {
        let live: FxHashSet<LocationId> =
            self.implementation.locations().iter().copied().collect();
        self.recreate.retain(|location| live.contains(location));
        self.reexecute.retain(|location| live.contains(location));

        let mut recreate: Vec<LocationId> = self.recreate.drain().collect();
        recreate.sort_unstable();
        for location in recreate {
            let op = self
                .vm
                .op_factory()
                .create(location, &self.implementation)?;
            if let Some(previous) = self.graph.template_op(location) {
                let tracked = OpcodeFlags::ALLOCATES | OpcodeFlags::INVOKE;
                if op.flags().intersects(tracked) && previous.flags().intersects(tracked) {
                    op.set_side_effect_level(previous.side_effect_level());
                }
            }
            self.graph.set_op(location, &op)?;
            self.stats.ops_recreated += 1;
        }

        let mut seen = FxHashSet::default();
        let mut order: Vec<LocationId> = std::mem::take(&mut self.reexecute)
            .into_iter()
            .filter(|location| seen.insert(*location))
            .collect();
        order.sort_by_key(|location| self.graph.address_of(*location).unwrap_or(u32::MAX));

        for location in order {
            for node in self.graph.path_nodes(location).to_vec() {
                self.graph.execute_node(node)?;
                self.stats.nodes_executed += 1;
            }
        }

        self.stats.recreate_passes += 1;
        Ok(())
    }

    /// Returns the addresses executed directly after `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GraphPoisoned`] after a failed edit and
    /// [`Error::InvalidAddress`] for an unknown address.
    pub fn children(&self, address: u32) -> Result<Vec<u32>> {
        self.check_usable()?;
        self.graph.children(address)
    }

    /// Returns the addresses executed directly before `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GraphPoisoned`] after a failed edit and
    /// [`Error::InvalidAddress`] for an unknown address.
    pub fn parent_addresses(&self, address: u32) -> Result<Vec<u32>> {
        self.check_usable()?;
        self.graph.parent_addresses(address)
    }

    /// Returns the instruction starting at `address`.
    #[must_use]
    pub fn instruction_at(&self, address: u32) -> Option<&Instruction> {
        self.implementation
            .location_at(address)
            .and_then(|location| self.implementation.instruction(location))
    }

    /// Returns the location of the instruction starting at `address`.
    #[must_use]
    pub fn location_at(&self, address: u32) -> Option<LocationId> {
        self.implementation.location_at(address)
    }

    /// Returns the current address of `location`.
    #[must_use]
    pub fn address_of(&self, location: LocationId) -> Option<u32> {
        self.implementation.code_address(location)
    }

    /// Returns the registers no path after `address` reads before assigning them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GraphPoisoned`] after a failed edit and
    /// [`Error::InvalidAddress`] for an unknown address.
    pub fn available_registers(&self, address: u32) -> Result<Vec<u16>> {
        self.check_usable()?;
        self.graph.available_registers(address)
    }

    /// Renders the instruction stream as smali text, one instruction per line in address
    /// order, followed by the try blocks.
    ///
    /// Branch targets are written as `:addr_<hex>` references.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if a label does not resolve.
    pub fn to_smali(&self) -> Result<String> {
        let mut lines = self
            .implementation
            .locations()
            .iter()
            .map(|location| self.implementation.render_instruction(*location))
            .collect::<Result<Vec<_>>>()?;

        for block in self.implementation.try_blocks() {
            let address = |label| {
                self.implementation
                    .label_address(label)
                    .ok_or_else(|| malformed_error!("Unresolved try block label {}", label))
            };
            let range = format!(
                "{{:addr_{:x} .. :addr_{:x}}} :addr_{:x}",
                address(block.start)?,
                address(block.end)?,
                address(block.handler)?
            );
            lines.push(match &block.exception_type {
                Some(exception_type) => format!(".catch {exception_type} {range}"),
                None => format!(".catchall {range}"),
            });
        }
        Ok(lines.join("\n"))
    }

    /// Returns the execution graph.
    #[must_use]
    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    /// Returns the instruction stream.
    #[must_use]
    pub fn implementation(&self) -> &MethodImplementation {
        &self.implementation
    }

    /// Returns the current try blocks.
    #[must_use]
    pub fn try_blocks(&self) -> &[TryBlock] {
        self.implementation.try_blocks()
    }

    /// Returns the method being edited.
    #[must_use]
    pub fn method(&self) -> &Arc<LocalMethod> {
        self.graph.method()
    }

    /// Returns the work counters.
    #[must_use]
    pub fn stats(&self) -> ManipulatorStats {
        self.stats
    }

    /// Returns `true` once an edit failed.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Gives the method implementation back, e.g. for writing it out.
    #[must_use]
    pub fn into_implementation(self) -> MethodImplementation {
        self.implementation
    }
}

/// Returns `true` if `op` is a `nop` aligning the payload of `donor`.
fn is_padding(op: &dyn Op, donor: &dyn Op) -> bool {
    op.instruction().opcode() == Opcode::Nop
        && donor.instruction().opcode().is_payload()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        emulation::Value,
        test::{
            manipulator, FORKING_DESCRIPTOR, FORKING_METHOD, SWITCH_DESCRIPTOR, SWITCH_METHOD,
        },
    };

    fn path_count(manipulator: &ExecutionGraphManipulator, address: u32) -> usize {
        let location = manipulator.location_at(address).unwrap();
        manipulator.graph().path_count(location)
    }

    #[test]
    fn test_insert_splices_into_every_path() {
        let mut manipulator = manipulator(FORKING_METHOD, FORKING_DESCRIPTOR);
        assert_eq!(path_count(&manipulator, 4), 2);

        manipulator.insert_at(4, Instruction::nop()).unwrap();

        // The branch label moved to the nop, both paths run through it.
        assert_eq!(manipulator.instruction_at(4).unwrap().opcode(), Opcode::Nop);
        assert_eq!(path_count(&manipulator, 4), 2);
        assert_eq!(manipulator.children(1).unwrap(), vec![3, 4]);
        assert_eq!(manipulator.children(4).unwrap(), vec![5]);
        assert_eq!(manipulator.parent_addresses(5).unwrap(), vec![4]);
        manipulator.graph().verify().unwrap();
    }

    #[test]
    fn test_insert_before_unlabelled_instruction() {
        let mut manipulator = manipulator(FORKING_METHOD, FORKING_DESCRIPTOR);
        let inserted = manipulator.insert_at(3, Instruction::nop()).unwrap();

        assert_eq!(manipulator.address_of(inserted), Some(3));
        assert_eq!(manipulator.graph().path_count(inserted), 1);
        assert_eq!(manipulator.children(1).unwrap(), vec![3, 5]);
        assert_eq!(manipulator.children(3).unwrap(), vec![4]);
        manipulator.graph().verify().unwrap();
    }

    #[test]
    fn test_remove_hands_children_to_parent() {
        let mut manipulator = manipulator(FORKING_METHOD, FORKING_DESCRIPTOR);
        manipulator.remove_at(3).unwrap();

        assert_eq!(manipulator.children(1).unwrap(), vec![3]);
        assert_eq!(path_count(&manipulator, 3), 2);
        assert_eq!(manipulator.parent_addresses(3).unwrap(), vec![1]);
        manipulator.graph().verify().unwrap();
    }

    #[test]
    fn test_remove_switch_case_realigns_payload() {
        let mut manipulator = manipulator(SWITCH_METHOD, SWITCH_DESCRIPTOR);
        assert_eq!(manipulator.children(0).unwrap(), vec![8]);
        assert_eq!(manipulator.children(8).unwrap(), vec![3, 5]);

        manipulator.remove_at(3).unwrap();

        // The padding nop went away with the misalignment.
        assert_eq!(
            manipulator.instruction_at(6).unwrap().opcode(),
            Opcode::PackedSwitchPayload
        );
        assert_eq!(manipulator.children(0).unwrap(), vec![6]);
        assert_eq!(manipulator.children(6).unwrap(), vec![3, 4]);
        manipulator.graph().verify().unwrap();
    }

    #[test]
    fn test_remove_switch_roots_cases() {
        let mut manipulator = manipulator(SWITCH_METHOD, SWITCH_DESCRIPTOR);
        let payload = manipulator.location_at(8).unwrap();
        let padding = manipulator.location_at(7).unwrap();

        manipulator.remove_at(0).unwrap();

        // Payload and padding are gone, both cases start a path of their own.
        assert!(!manipulator.graph().has_pile(payload));
        assert!(!manipulator.graph().has_pile(padding));
        assert_eq!(manipulator.implementation().len(), 4);
        assert_eq!(manipulator.children(0).unwrap(), vec![1]);
        assert_eq!(manipulator.children(2).unwrap(), vec![3]);
        assert!(manipulator.parent_addresses(0).unwrap().is_empty());
        assert!(manipulator.parent_addresses(2).unwrap().is_empty());
        assert_eq!(path_count(&manipulator, 0), 1);
        assert_eq!(path_count(&manipulator, 2), 1);
        assert_eq!(
            manipulator.to_smali().unwrap(),
            "const/4 v0, 0x0\nreturn v0\nconst/4 v0, 0x1\nreturn v0"
        );
        manipulator.graph().verify().unwrap();
    }

    #[test]
    fn test_remove_fill_array_data_skips_payload() {
        let mut manipulator = manipulator(
            "
            .registers 1
            const/4 v0, 0x0
            fill-array-data v0, :data
            return-void
            :data
            array-payload 4 0x1, 0x2
            ",
            "LFoo;->bar()V",
        );
        assert_eq!(manipulator.children(1).unwrap(), vec![6]);
        assert_eq!(manipulator.children(6).unwrap(), vec![4]);

        manipulator.remove_at(1).unwrap();

        // The data stays in the stream but no path runs through it.
        assert_eq!(
            manipulator.instruction_at(2).unwrap().opcode(),
            Opcode::ArrayPayload
        );
        assert_eq!(path_count(&manipulator, 2), 0);
        assert_eq!(manipulator.children(0).unwrap(), vec![1]);
        assert_eq!(manipulator.parent_addresses(1).unwrap(), vec![0]);
        assert_eq!(path_count(&manipulator, 1), 1);
        manipulator.graph().verify().unwrap();
    }

    #[test]
    fn test_replace_is_one_pass() {
        let mut manipulator = manipulator(FORKING_METHOD, FORKING_DESCRIPTOR);
        let before = manipulator.stats();

        manipulator
            .replace(0, vec![Instruction::constant(0, 1), Instruction::nop()])
            .unwrap();

        let after = manipulator.stats();
        assert_eq!(after.recreate_passes, before.recreate_passes + 1);
        assert_eq!(after.rebuilds, before.rebuilds + 3);
        assert_eq!(manipulator.instruction_at(1).unwrap().opcode(), Opcode::Nop);
        assert_eq!(manipulator.children(0).unwrap(), vec![1]);
        assert_eq!(manipulator.children(1).unwrap(), vec![2]);
        manipulator.graph().verify().unwrap();
    }

    #[test]
    fn test_remove_all_highest_first() {
        let mut manipulator = manipulator(
            "
            .registers 2
            const/4 v0, 0x1
            const/4 v1, 0x2
            nop
            nop
            return v0
            ",
            "LFoo;->bar()I",
        );
        manipulator.remove_all(&[1, 3, 2, 3]).unwrap();

        assert_eq!(manipulator.stats().rebuilds, 3);
        assert_eq!(manipulator.to_smali().unwrap(), "const/4 v0, 0x1\nreturn v0");
        assert_eq!(manipulator.children(0).unwrap(), vec![1]);
    }

    #[test]
    fn test_remove_all_validates_first() {
        let mut manipulator = manipulator(FORKING_METHOD, FORKING_DESCRIPTOR);
        let error = manipulator.remove_all(&[0, 2]).unwrap_err();

        assert!(matches!(error, Error::InvalidAddress(2)));
        assert!(!manipulator.is_poisoned());
        assert_eq!(manipulator.implementation().len(), 5);
    }

    #[test]
    fn test_reexecution_sees_new_values() {
        let mut manipulator = manipulator(
            "
            .registers 1
            const/4 v0, 0x0
            if-eqz v0, :zero
            return v0
            :zero
            return-void
            ",
            "LFoo;->bar()V",
        );
        assert_eq!(manipulator.children(1).unwrap(), vec![4]);

        // The branch node reads the replaced constant.
        manipulator
            .replace(0, vec![Instruction::constant(0, 1)])
            .unwrap();
        let branch = manipulator.graph().path_nodes(manipulator.location_at(1).unwrap())[0];
        let context = manipulator.graph().context(branch).unwrap();
        assert_eq!(context.peek_register(0).unwrap(), Some(Value::Int(1)));
    }

    #[test]
    fn test_reexecuted_allocation_keeps_fields() {
        let mut manipulator = manipulator(
            "
            .registers 3
            const/4 v1, 0x5
            new-instance v0, Lcom/example/Box;
            iput v1, v0, Lcom/example/Box;->x:I
            iget v2, v0, Lcom/example/Box;->x:I
            return v2
            ",
            "LFoo;->bar()I",
        );
        let field = |manipulator: &ExecutionGraphManipulator, address: u32| {
            let location = manipulator.location_at(address).unwrap();
            let node = manipulator.graph().path_nodes(location)[0];
            manipulator.graph().context(node).unwrap().peek_register(2).unwrap()
        };
        assert_eq!(field(&manipulator, 5), Some(Value::Int(5)));

        // Re-executes new-instance, then the iget below the untouched iput.
        manipulator.insert_at(1, Instruction::nop()).unwrap();
        manipulator.insert_at(6, Instruction::nop()).unwrap();

        assert_eq!(manipulator.instruction_at(7).unwrap().opcode(), Opcode::Iget);
        assert_eq!(field(&manipulator, 7), Some(Value::Int(5)));
        manipulator.graph().verify().unwrap();
    }

    #[test]
    fn test_failed_edit_poisons() {
        let mut manipulator = manipulator(
            "
            .registers 1
            const/4 v0, 0x1
            return v0
            ",
            "LFoo;->one()I",
        );
        let error = manipulator.remove_at(1).unwrap_err();
        assert!(matches!(error, Error::OpCreation { .. }));
        assert!(manipulator.is_poisoned());
        assert!(matches!(manipulator.children(0), Err(Error::GraphPoisoned)));
        assert!(matches!(
            manipulator.insert_at(0, Instruction::nop()),
            Err(Error::GraphPoisoned)
        ));
    }

    #[test]
    fn test_remove_drops_empty_try_block() {
        let mut manipulator = manipulator(
            "
            .registers 1
            :start
            const/4 v0, 0x1
            :end
            return v0
            :handler
            return-void
            .catch Ljava/lang/Exception; {:start .. :end} :handler
            ",
            "LFoo;->bar()V",
        );
        assert_eq!(manipulator.try_blocks().len(), 1);
        manipulator.remove_at(0).unwrap();
        assert!(manipulator.try_blocks().is_empty());
        assert_eq!(manipulator.to_smali().unwrap(), "return v0\nreturn-void");
    }

    #[test]
    fn test_to_smali_renders_try_blocks() {
        let manipulator = manipulator(
            "
            .registers 1
            :start
            const/4 v0, 0x1
            :end
            return v0
            :handler
            return-void
            .catchall {:start .. :end} :handler
            ",
            "LFoo;->bar()V",
        );
        assert_eq!(
            manipulator.to_smali().unwrap(),
            "const/4 v0, 0x1\nreturn v0\nreturn-void\n.catchall {:addr_0 .. :addr_1} :addr_2"
        );
    }

    #[test]
    fn test_invalid_location() {
        let mut manipulator = manipulator(FORKING_METHOD, FORKING_DESCRIPTOR);
        let location = manipulator.location_at(3).unwrap();
        manipulator.remove(location).unwrap();
        assert!(matches!(
            manipulator.remove(location),
            Err(Error::InvalidLocation(_))
        ));
        assert!(!manipulator.is_poisoned());
    }

    #[test]
    fn test_stats_display() {
        let stats = ManipulatorStats {
            rebuilds: 2,
            recreate_passes: 1,
            ops_recreated: 4,
            nodes_executed: 3,
        };
        assert_eq!(
            stats.to_string(),
            "2 rebuilds, 1 passes, 4 ops recreated, 3 nodes executed"
        );
    }
}
