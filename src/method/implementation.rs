//! Mutable, label-aware instruction container for one method body.
//!
//! [`MethodImplementation`] owns the instruction stream the execution graph mirrors. Every
//! instruction lives in a slot named by a [`LocationId`] that survives all edits, while its
//! index and code address are recomputed after each change. Branch targets and try ranges
//! refer to [`LabelId`]s, and labels are attached to locations, so control flow follows
//! instructions around instead of pointing at stale offsets.
//!
//! # Normalisation
//!
//! After every edit the container restores the invariants of a writable Dalvik method:
//!
//! - switch payloads that no switch instruction refers to are removed,
//! - payloads sitting on an odd code address are aligned, either by removing an unlabeled
//!   `nop` right before them or by inserting a `nop` padding,
//! - `goto` and `goto/16` whose target moved out of range are widened.
//!
//! A single edit can therefore add or remove more than the one location that was edited.
//! Consumers that mirror the stream (such as the graph manipulator) must diff the full set
//! of locations after every edit.
//!
//! # Examples
//!
//! ```rust
//! use dexscope::assembly::Instruction;
//! use dexscope::method::MethodImplementation;
//!
//! let mut implementation = MethodImplementation::new(2);
//! let first = implementation.push(Instruction::constant(0, 1));
//! let last = implementation.push(Instruction::return_void());
//!
//! let inserted = implementation.insert_before(last, Instruction::nop())?;
//! assert_eq!(implementation.code_address(inserted), Some(1));
//! assert_eq!(implementation.code_address(last), Some(2));
//!
//! implementation.remove(first)?;
//! assert_eq!(implementation.code_address(inserted), Some(0));
//! # Ok::<(), dexscope::Error>(())
//! ```

use rustc_hash::FxHashSet;

use crate::{
    assembly::{Instruction, Opcode},
    method::{LabelId, LocationId, TryBlock},
    Error, Result,
};

#[derive(Debug, Clone)]
struct Slot {
    instruction: Option<Instruction>,
    index: usize,
    code_address: u32,
    labels: Vec<LabelId>,
    removed: bool,
}

impl Slot {
    fn new(instruction: Option<Instruction>) -> Self {
        Slot {
            instruction,
            index: 0,
            code_address: 0,
            labels: Vec::new(),
            removed: false,
        }
    }
}

/// The instruction stream of one method, with labels and try blocks.
#[derive(Debug, Clone)]
pub struct MethodImplementation {
    register_count: u16,
    slots: Vec<Slot>,
    order: Vec<LocationId>,
    end: LocationId,
    labels: Vec<Option<LocationId>>,
    try_blocks: Vec<TryBlock>,
    rewritten: Vec<LocationId>,
}

impl MethodImplementation {
    /// Creates an empty method body using `register_count` registers.
    #[must_use]
    pub fn new(register_count: u16) -> Self {
        MethodImplementation {
            register_count,
            slots: vec![Slot::new(None)],
            order: Vec::new(),
            end: LocationId::new(0),
            labels: Vec::new(),
            try_blocks: Vec::new(),
            rewritten: Vec::new(),
        }
    }

    /// Returns the number of registers of the method.
    #[must_use]
    pub fn register_count(&self) -> u16 {
        self.register_count
    }

    /// Returns the number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if the method has no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns all instruction locations in stream order.
    #[must_use]
    pub fn locations(&self) -> &[LocationId] {
        &self.order
    }

    /// Returns the sentinel location after the last instruction.
    ///
    /// Labels that point past the end of the method (e.g. the end of a try range covering
    /// the last instruction) are attached here.
    #[must_use]
    pub fn end_location(&self) -> LocationId {
        self.end
    }

    /// Returns the total size of the method in code units.
    #[must_use]
    pub fn end_address(&self) -> u32 {
        self.slots[self.end.index()].code_address
    }

    /// Returns `true` if `location` currently holds an instruction.
    #[must_use]
    pub fn contains(&self, location: LocationId) -> bool {
        self.slots
            .get(location.index())
            .is_some_and(|slot| !slot.removed && slot.instruction.is_some())
    }

    fn slot(&self, location: LocationId) -> Option<&Slot> {
        self.slots.get(location.index()).filter(|slot| !slot.removed)
    }

    /// Returns the instruction at `location`.
    #[must_use]
    pub fn instruction(&self, location: LocationId) -> Option<&Instruction> {
        self.slot(location).and_then(|slot| slot.instruction.as_ref())
    }

    /// Returns the current index of `location`. The end sentinel has index `len()`.
    #[must_use]
    pub fn index_of(&self, location: LocationId) -> Option<usize> {
        self.slot(location).map(|slot| slot.index)
    }

    /// Returns the current code address of `location`.
    #[must_use]
    pub fn code_address(&self, location: LocationId) -> Option<u32> {
        self.slot(location).map(|slot| slot.code_address)
    }

    /// Returns the instruction location starting at `address`.
    #[must_use]
    pub fn location_at(&self, address: u32) -> Option<LocationId> {
        self.order
            .binary_search_by_key(&address, |location| {
                self.slots[location.index()].code_address
            })
            .ok()
            .map(|position| self.order[position])
    }

    /// Returns the instruction location at stream position `index`.
    #[must_use]
    pub fn location_at_index(&self, index: usize) -> Option<LocationId> {
        self.order.get(index).copied()
    }

    /// Returns the instruction location directly after `location`.
    #[must_use]
    pub fn next_location(&self, location: LocationId) -> Option<LocationId> {
        let index = self.index_of(location)?;
        self.order.get(index + 1).copied()
    }

    /// Returns the labels attached to `location`.
    #[must_use]
    pub fn labels_at(&self, location: LocationId) -> &[LabelId] {
        self.slot(location)
            .map(|slot| slot.labels.as_slice())
            .unwrap_or_default()
    }

    /// Returns the location `label` is attached to, if it is placed.
    #[must_use]
    pub fn label_location(&self, label: LabelId) -> Option<LocationId> {
        let location = (*self.labels.get(label.index())?)?;
        self.slot(location).map(|_| location)
    }

    /// Returns the code address `label` currently resolves to.
    #[must_use]
    pub fn label_address(&self, label: LabelId) -> Option<u32> {
        self.label_location(label)
            .and_then(|location| self.code_address(location))
    }

    /// Returns the instruction location a branch or payload label points at.
    ///
    /// Unlike [`MethodImplementation::label_location`] this never returns the end sentinel.
    #[must_use]
    pub fn label_target(&self, label: LabelId) -> Option<LocationId> {
        self.label_location(label)
            .filter(|location| self.contains(*location))
    }

    /// Returns the `packed-switch`, `sparse-switch` and `fill-array-data` instructions
    /// that refer to the payload at `payload`.
    #[must_use]
    pub fn referrers(&self, payload: LocationId) -> Vec<LocationId> {
        self.order
            .iter()
            .copied()
            .filter(|location| {
                self.instruction(*location).is_some_and(|instruction| {
                    matches!(
                        instruction.opcode(),
                        Opcode::PackedSwitch | Opcode::SparseSwitch | Opcode::FillArrayData
                    ) && instruction
                        .target()
                        .and_then(|label| self.label_target(label))
                        == Some(payload)
                })
            })
            .collect()
    }

    /// Creates a label that is not attached to any location yet.
    pub fn new_label(&mut self) -> LabelId {
        let label = LabelId::new(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    /// Attaches `label` to `location`, detaching it from wherever it was before.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLocation`] if `location` is neither an instruction nor the
    /// end sentinel, and [`crate::Error::Malformed`] for an unknown label.
    pub fn place_label(&mut self, label: LabelId, location: LocationId) -> Result<()> {
        if self.slot(location).is_none() {
            return Err(Error::InvalidLocation(location));
        }
        let Some(entry) = self.labels.get_mut(label.index()) else {
            return Err(malformed_error!("Unknown label {}", label));
        };

        if let Some(previous) = entry.replace(location) {
            self.slots[previous.index()].labels.retain(|l| *l != label);
        }
        self.slots[location.index()].labels.push(label);
        Ok(())
    }

    /// Returns a label attached to `location`, creating one if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLocation`] if `location` is not part of the stream.
    pub fn label_for(&mut self, location: LocationId) -> Result<LabelId> {
        if let Some(label) = self.labels_at(location).first() {
            return Ok(*label);
        }
        let label = self.new_label();
        self.place_label(label, location)?;
        Ok(label)
    }

    /// Returns the try blocks in declaration order.
    #[must_use]
    pub fn try_blocks(&self) -> &[TryBlock] {
        &self.try_blocks
    }

    /// Appends a try block.
    pub fn add_try_block(&mut self, try_block: TryBlock) {
        self.try_blocks.push(try_block);
    }

    /// Removes the try block at `index`.
    pub fn remove_try_block(&mut self, index: usize) -> Option<TryBlock> {
        if index < self.try_blocks.len() {
            Some(self.try_blocks.remove(index))
        } else {
            None
        }
    }

    /// Appends an instruction to the end of the stream without normalising.
    ///
    /// Intended for building a method body; call [`MethodImplementation::normalize`] once
    /// all instructions and labels are in place.
    pub fn push(&mut self, instruction: Instruction) -> LocationId {
        let location = self.allocate(instruction);
        let end_address = self.end_address();
        let slot = &mut self.slots[location.index()];
        slot.index = self.order.len();
        slot.code_address = end_address;

        let units = self.slots[location.index()].code_units();
        self.order.push(location);
        let end = &mut self.slots[self.end.index()];
        end.index = self.order.len();
        end.code_address = end_address + units;
        location
    }

    /// Inserts `instruction` directly before `location`.
    ///
    /// The labels of `location` move to the new instruction, so branches and try ranges that
    /// targeted `location` now reach the inserted instruction first. Passing the end sentinel
    /// appends to the method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLocation`] if `location` is not part of the stream, or an
    /// error from normalisation if a branch can no longer be encoded.
    pub fn insert_before(
        &mut self,
        location: LocationId,
        instruction: Instruction,
    ) -> Result<LocationId> {
        let index = self
            .index_of(location)
            .ok_or(Error::InvalidLocation(location))?;

        let inserted = self.insert_at(index, instruction);
        self.merge_labels(location, inserted);
        self.normalize()?;
        Ok(inserted)
    }

    /// Removes the instruction at `location`.
    ///
    /// Its labels move to the following instruction (or the end sentinel).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLocation`] if `location` does not hold an instruction.
    pub fn remove(&mut self, location: LocationId) -> Result<Instruction> {
        let instruction = self.remove_raw(location)?;
        self.normalize()?;
        Ok(instruction)
    }

    /// Restores payload alignment, drops orphaned switch payloads and widens branches.
    ///
    /// Called automatically by [`MethodImplementation::insert_before`] and
    /// [`MethodImplementation::remove`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::BranchOutOfRange`] if a conditional branch or switch can not reach
    /// its target, and [`crate::Error::Malformed`] for unresolved labels.
    pub fn normalize(&mut self) -> Result<()> {
        loop {
            self.recompute();
            if self.remove_orphaned_payload()? {
                continue;
            }
            if self.align_payload()? {
                continue;
            }
            if self.widen_branch()? {
                continue;
            }
            return Ok(());
        }
    }

    /// Renders the instruction at `location` as smali text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLocation`] if `location` does not hold an instruction, or
    /// [`crate::Error::Malformed`] if one of its labels is unresolved.
    pub fn render_instruction(&self, location: LocationId) -> Result<String> {
        let instruction = self
            .instruction(location)
            .ok_or(Error::InvalidLocation(location))?;
        instruction.render(|label| self.label_address(label))
    }

    /// Drains the locations whose instruction was rewritten in place by normalisation.
    pub(crate) fn take_rewritten(&mut self) -> Vec<LocationId> {
        std::mem::take(&mut self.rewritten)
    }

    fn allocate(&mut self, instruction: Instruction) -> LocationId {
        let location = LocationId::new(self.slots.len() as u32);
        self.slots.push(Slot::new(Some(instruction)));
        location
    }

    fn insert_at(&mut self, index: usize, instruction: Instruction) -> LocationId {
        let location = self.allocate(instruction);
        self.order.insert(index, location);
        self.recompute();
        location
    }

    fn remove_raw(&mut self, location: LocationId) -> Result<Instruction> {
        if !self.contains(location) {
            return Err(Error::InvalidLocation(location));
        }
        let next = self.next_location(location).unwrap_or(self.end);
        let index = self.slots[location.index()].index;

        self.merge_labels(location, next);
        self.order.remove(index);
        let slot = &mut self.slots[location.index()];
        slot.removed = true;
        let instruction = slot
            .instruction
            .take()
            .ok_or(Error::InvalidLocation(location))?;
        self.recompute();
        Ok(instruction)
    }

    fn merge_labels(&mut self, from: LocationId, into: LocationId) {
        let labels = std::mem::take(&mut self.slots[from.index()].labels);
        for label in &labels {
            self.labels[label.index()] = Some(into);
        }
        self.slots[into.index()].labels.extend(labels);
    }

    fn recompute(&mut self) {
        let mut address = 0;
        for (index, location) in self.order.iter().enumerate() {
            let slot = &mut self.slots[location.index()];
            slot.index = index;
            slot.code_address = address;
            address += slot.code_units();
        }
        let end = &mut self.slots[self.end.index()];
        end.index = self.order.len();
        end.code_address = address;
    }

    fn remove_orphaned_payload(&mut self) -> Result<bool> {
        let referenced: FxHashSet<LocationId> = self
            .order
            .iter()
            .filter_map(|location| self.instruction(*location))
            .filter(|instruction| {
                matches!(
                    instruction.opcode(),
                    Opcode::PackedSwitch | Opcode::SparseSwitch
                )
            })
            .filter_map(|instruction| instruction.target())
            .filter_map(|label| self.label_target(label))
            .collect();

        let orphan = self.order.iter().copied().enumerate().find(|(_, location)| {
            self.instruction(*location)
                .is_some_and(|instruction| instruction.opcode().is_switch_payload())
                && !referenced.contains(location)
        });
        let Some((index, location)) = orphan else {
            return Ok(false);
        };

        // the nop that aligned the payload goes with it
        let padding = self.padding_before(index);
        self.remove_raw(location)?;
        if let Some(padding) = padding {
            self.remove_raw(padding)?;
        }
        Ok(true)
    }

    /// Returns the unlabelled `nop` directly before the instruction at `index`.
    fn padding_before(&self, index: usize) -> Option<LocationId> {
        index
            .checked_sub(1)
            .map(|previous| self.order[previous])
            .filter(|previous| {
                let slot = &self.slots[previous.index()];
                slot.labels.is_empty()
                    && slot
                        .instruction
                        .as_ref()
                        .is_some_and(|instruction| instruction.opcode() == Opcode::Nop)
            })
    }

    fn align_payload(&mut self) -> Result<bool> {
        let misaligned = self.order.iter().copied().enumerate().find(|(_, location)| {
            let slot = &self.slots[location.index()];
            slot.code_address % 2 == 1
                && slot
                    .instruction
                    .as_ref()
                    .is_some_and(|instruction| instruction.opcode().is_payload())
        });
        let Some((index, _)) = misaligned else {
            return Ok(false);
        };

        match self.padding_before(index) {
            Some(padding) => {
                self.remove_raw(padding)?;
            }
            None => {
                self.insert_at(index, Instruction::nop());
            }
        }
        Ok(true)
    }

    fn widen_branch(&mut self) -> Result<bool> {
        for location in self.order.clone() {
            let slot = &self.slots[location.index()];
            let Some(instruction) = slot.instruction.as_ref() else {
                continue;
            };
            let opcode = instruction.opcode();
            let Some((min, max)) = opcode.offset_range() else {
                continue;
            };
            let Some(label) = instruction.target() else {
                continue;
            };
            let target = self.label_address(label).ok_or_else(|| {
                malformed_error!("Unresolved label {} at {:#x}", label, slot.code_address)
            })?;

            let offset = i64::from(target) - i64::from(slot.code_address);
            let fits = offset >= min && offset <= max;
            let widened = match opcode {
                Opcode::Goto if !fits || offset == 0 => Some(Opcode::Goto16),
                Opcode::Goto16 if !fits || offset == 0 => Some(Opcode::Goto32),
                _ if !fits => {
                    return Err(Error::BranchOutOfRange {
                        address: slot.code_address,
                        offset,
                    })
                }
                _ => None,
            };

            if let Some(widened) = widened {
                if let Some(instruction) = self.slots[location.index()].instruction.as_mut() {
                    instruction.set_opcode(widened);
                }
                self.rewritten.push(location);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Slot {
    fn code_units(&self) -> u32 {
        self.instruction
            .as_ref()
            .map_or(0, Instruction::code_units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::Operand;

    fn switch_method() -> (MethodImplementation, LocationId, LocationId) {
        // 0: const/4 v0, 0x1
        // 1: packed-switch v0, payload
        // 4: return-void
        // 5: packed-switch-payload (needs padding)
        let mut implementation = MethodImplementation::new(1);
        implementation.push(Instruction::constant(0, 1));
        let payload_label = implementation.new_label();
        let case = implementation.new_label();
        let switch = implementation.push(
            Instruction::new(
                Opcode::PackedSwitch,
                vec![Operand::Register(0), Operand::Label(payload_label)],
            )
            .unwrap(),
        );
        let ret = implementation.push(Instruction::return_void());
        let payload = implementation.push(
            Instruction::new(
                Opcode::PackedSwitchPayload,
                vec![Operand::PackedTargets {
                    first_key: 0,
                    targets: vec![case],
                }],
            )
            .unwrap(),
        );
        implementation.place_label(payload_label, payload).unwrap();
        implementation.place_label(case, ret).unwrap();
        implementation.normalize().unwrap();
        (implementation, switch, payload)
    }

    #[test]
    fn test_addresses_follow_sizes() {
        let mut implementation = MethodImplementation::new(2);
        let a = implementation.push(Instruction::constant(0, 1000));
        let b = implementation.push(Instruction::constant(1, 1));
        let c = implementation.push(Instruction::return_void());

        assert_eq!(implementation.code_address(a), Some(0));
        assert_eq!(implementation.code_address(b), Some(2));
        assert_eq!(implementation.code_address(c), Some(3));
        assert_eq!(implementation.end_address(), 4);
        assert_eq!(implementation.location_at(2), Some(b));
        assert_eq!(implementation.location_at(1), None);
    }

    #[test]
    fn test_insert_moves_labels() {
        let mut implementation = MethodImplementation::new(1);
        let label = implementation.new_label();
        implementation.push(Instruction::goto(label));
        let target = implementation.push(Instruction::return_void());
        implementation.place_label(label, target).unwrap();

        let inserted = implementation
            .insert_before(target, Instruction::nop())
            .unwrap();
        assert_eq!(implementation.label_location(label), Some(inserted));
        assert!(implementation.labels_at(target).is_empty());
        assert_eq!(implementation.index_of(target), Some(2));
    }

    #[test]
    fn test_remove_moves_labels_forward() {
        let mut implementation = MethodImplementation::new(1);
        let label = implementation.new_label();
        let first = implementation.push(Instruction::nop());
        let last = implementation.push(Instruction::return_void());
        implementation.place_label(label, last).unwrap();

        implementation.remove(last).unwrap();
        assert_eq!(
            implementation.label_location(label),
            Some(implementation.end_location())
        );
        assert_eq!(implementation.label_target(label), None);
        assert!(!implementation.contains(last));
        assert!(implementation.remove(last).is_err());
        assert_eq!(implementation.locations(), &[first]);
    }

    #[test]
    fn test_payload_padding() {
        let (implementation, switch, payload) = switch_method();
        // payload was at 5, a nop is inserted at 5
        assert_eq!(implementation.len(), 5);
        assert_eq!(implementation.code_address(payload), Some(6));
        let padding = implementation.location_at(5).unwrap();
        assert_eq!(
            implementation.instruction(padding).unwrap().opcode(),
            Opcode::Nop
        );
        assert_eq!(implementation.referrers(payload), vec![switch]);
    }

    #[test]
    fn test_padding_removed_when_realigned() {
        let (mut implementation, _, payload) = switch_method();
        let first = implementation.location_at(0).unwrap();
        implementation.remove(first).unwrap();
        // everything shifted by one, the padding nop is dropped again
        assert_eq!(implementation.len(), 3);
        assert_eq!(implementation.code_address(payload), Some(4));
    }

    #[test]
    fn test_orphaned_switch_payload_removed() {
        let (mut implementation, switch, payload) = switch_method();
        implementation.remove(switch).unwrap();
        assert!(!implementation.contains(payload));
        assert!(implementation
            .locations()
            .iter()
            .all(|l| !implementation.instruction(*l).unwrap().opcode().is_payload()));
    }

    #[test]
    fn test_orphaned_payload_takes_padding() {
        let (mut implementation, switch, _) = switch_method();
        let padding = implementation.location_at(5).unwrap();
        implementation.remove(switch).unwrap();

        assert!(!implementation.contains(padding));
        let opcodes: Vec<Opcode> = implementation
            .locations()
            .iter()
            .map(|l| implementation.instruction(*l).unwrap().opcode())
            .collect();
        assert_eq!(opcodes, vec![Opcode::Const4, Opcode::ReturnVoid]);
        assert_eq!(implementation.end_address(), 2);
    }

    #[test]
    fn test_goto_widening() {
        let mut implementation = MethodImplementation::new(1);
        let label = implementation.new_label();
        let goto = implementation.push(Instruction::goto(label));
        for _ in 0..126 {
            implementation.push(Instruction::nop());
        }
        let target = implementation.push(Instruction::return_void());
        implementation.place_label(label, target).unwrap();
        implementation.normalize().unwrap();
        assert_eq!(
            implementation.instruction(goto).unwrap().opcode(),
            Opcode::Goto
        );

        let next = implementation.next_location(goto).unwrap();
        implementation
            .insert_before(next, Instruction::nop())
            .unwrap();
        assert_eq!(
            implementation.instruction(goto).unwrap().opcode(),
            Opcode::Goto16
        );
        assert_eq!(implementation.take_rewritten(), vec![goto]);
        assert!(implementation.take_rewritten().is_empty());
    }

    #[test]
    fn test_try_blocks_append_remove() {
        let mut implementation = MethodImplementation::new(1);
        let start = implementation.new_label();
        let end = implementation.new_label();
        let handler = implementation.new_label();
        implementation.add_try_block(TryBlock::catch_all(start, end, handler));
        implementation.add_try_block(TryBlock::new(start, end, handler, "Ljava/lang/Exception;"));
        assert_eq!(implementation.try_blocks().len(), 2);
        assert!(implementation.remove_try_block(0).unwrap().is_catch_all());
        assert!(implementation.remove_try_block(4).is_none());
        assert_eq!(implementation.try_blocks().len(), 1);
    }
}
