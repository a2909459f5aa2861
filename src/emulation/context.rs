//! Per-path symbolic execution state.
//!
//! Every executed node of an execution graph owns an [`ExecutionContext`]. A context
//! stores only what its own instruction produced (register writes, the result register,
//! read/assign records and the heap objects it touched) in a frame, and links to the
//! frame of its parent node for everything else.
//!
//! # Ancestor chain
//!
//! ```text
//!   root frame  <-  frame of node 1  <-  frame of node 2  <-  ...
//! ```
//!
//! Register reads walk the chain until a frame that assigned the register is found. Heap
//! objects found in an ancestor are snapshot into the reading frame on first touch, using
//! the virtual machine's [`CloneStrategy`], so writes never leak into sibling paths.
//!
//! When the graph is rewired, [`ExecutionContext::spawn_child`] derives a fresh context
//! for a reparented node and [`ExecutionContext::relink_ancestor`] re-points the frames of
//! that node's children at it. Relinking does not copy anything: the children keep their
//! own registers and heap objects, only the chain behind them changes.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    emulation::{
        cloner::CloneStrategy,
        value::{HeapObject, HeapRef, Value},
    },
    method::{is_wide, LocalMethod},
    Error, Result,
};

/// Type descriptor used for registers read before any assignment.
pub const UNASSIGNED_TYPE: &str = "?";

/// The state written by a single node.
#[derive(Debug, Default)]
struct Frame {
    registers: FxHashMap<u16, Value>,
    result: Option<Value>,
    reads: FxHashSet<u16>,
    assigned: FxHashSet<u16>,
    heap: FxHashMap<HeapRef, Arc<HeapObject>>,
    allocation: Option<HeapRef>,
    ancestor: Option<Arc<RwLock<Frame>>>,
}

/// Symbolic state of one execution path at one node.
#[derive(Debug)]
pub struct ExecutionContext {
    frame: Arc<RwLock<Frame>>,
    method: Arc<LocalMethod>,
    strategy: Arc<CloneStrategy>,
    heap_ids: Arc<AtomicU64>,
    call_depth: usize,
}

impl ExecutionContext {
    /// Creates the entry context of `method`.
    ///
    /// Parameter registers live in a frame of their own behind the context's frame, so
    /// the entry node reads them like any other inherited register. Heap references are
    /// drawn from `heap_ids`, which all roots of one virtual machine share.
    pub(crate) fn root(
        method: Arc<LocalMethod>,
        strategy: Arc<CloneStrategy>,
        heap_ids: Arc<AtomicU64>,
    ) -> Self {
        let mut entry = Frame::default();
        for (register, descriptor) in method.parameter_registers() {
            let value = Value::Unknown(Arc::clone(&descriptor));
            if is_wide(&descriptor) {
                entry.registers.insert(register + 1, value.clone());
                entry.assigned.insert(register + 1);
            }
            entry.registers.insert(register, value);
            entry.assigned.insert(register);
        }
        let frame = Frame {
            ancestor: Some(Arc::new(RwLock::new(entry))),
            ..Frame::default()
        };

        ExecutionContext {
            frame: Arc::new(RwLock::new(frame)),
            method,
            strategy,
            heap_ids,
            call_depth: 0,
        }
    }

    /// Derives the context of a child node.
    ///
    /// The child starts empty and sees everything of this context through its ancestor
    /// link.
    #[must_use]
    pub fn spawn_child(&self) -> ExecutionContext {
        let frame = Frame {
            ancestor: Some(Arc::clone(&self.frame)),
            ..Frame::default()
        };
        ExecutionContext {
            frame: Arc::new(RwLock::new(frame)),
            method: Arc::clone(&self.method),
            strategy: Arc::clone(&self.strategy),
            heap_ids: Arc::clone(&self.heap_ids),
            call_depth: self.call_depth,
        }
    }

    /// Makes `ancestor` the parent frame of this context without copying any state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the frame lock is poisoned.
    pub fn relink_ancestor(&self, ancestor: &ExecutionContext) -> Result<()> {
        let mut frame = write_lock!(self.frame);
        frame.ancestor = Some(Arc::clone(&ancestor.frame));
        Ok(())
    }

    /// Detaches this context from its ancestors, as for a method entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the frame lock is poisoned.
    pub fn unlink_ancestor(&self) -> Result<()> {
        with_write!(self.frame, |frame: &mut Frame| frame.ancestor = None);
        Ok(())
    }

    /// Forgets what the node wrote on a previous execution.
    ///
    /// Registers, the result register, the read/assign records and heap snapshots are
    /// cleared. The reference of the node's own allocation is kept, so allocating again
    /// hands out the reference descendants already use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the frame lock is poisoned.
    pub(crate) fn reset(&self) -> Result<()> {
        let mut frame = write_lock!(self.frame);
        frame.registers.clear();
        frame.result = None;
        frame.reads.clear();
        frame.assigned.clear();
        frame.heap.clear();
        Ok(())
    }

    /// Takes over the allocation reference of `previous`, the context this one replaces.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if a frame lock is poisoned.
    pub(crate) fn inherit_allocation(&self, previous: &ExecutionContext) -> Result<()> {
        if Arc::ptr_eq(&self.frame, &previous.frame) {
            return Ok(());
        }
        let allocation = read_lock!(previous.frame).allocation;
        if allocation.is_some() {
            with_write!(self.frame, |frame: &mut Frame| frame.allocation = allocation);
        }
        Ok(())
    }

    /// Returns `true` if `other` is the direct ancestor of this context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the frame lock is poisoned.
    pub fn is_child_of(&self, other: &ExecutionContext) -> Result<bool> {
        let frame = read_lock!(self.frame);
        Ok(frame
            .ancestor
            .as_ref()
            .is_some_and(|ancestor| Arc::ptr_eq(ancestor, &other.frame)))
    }

    /// Returns the method this context executes.
    #[must_use]
    pub fn method(&self) -> &Arc<LocalMethod> {
        &self.method
    }

    /// Returns the number of registers of the frame.
    #[must_use]
    pub fn register_count(&self) -> u16 {
        self.method.register_count()
    }

    /// Returns the call-stack depth of this context (0 for the analysed method).
    #[must_use]
    pub fn call_depth(&self) -> usize {
        self.call_depth
    }

    fn check_register(&self, register: u16) -> Result<()> {
        if register >= self.register_count() {
            return Err(Error::RegisterOutOfBounds {
                register,
                count: self.register_count(),
            });
        }
        Ok(())
    }

    /// Looks up `register` along the ancestor chain without recording a read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegisterOutOfBounds`] or [`Error::LockError`].
    pub fn peek_register(&self, register: u16) -> Result<Option<Value>> {
        self.check_register(register)?;
        let mut current = Some(Arc::clone(&self.frame));
        while let Some(frame) = current {
            let guard = read_lock!(frame);
            if let Some(value) = guard.registers.get(&register) {
                return Ok(Some(value.clone()));
            }
            current = guard.ancestor.clone();
        }
        Ok(None)
    }

    /// Reads `register` and records the read in this frame.
    ///
    /// A register that was never assigned on this path reads as an unknown value of type
    /// [`UNASSIGNED_TYPE`] and logs a warning; this usually means nodes were executed out
    /// of address order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegisterOutOfBounds`] or [`Error::LockError`].
    pub fn read_register(&self, register: u16) -> Result<Value> {
        let value = self.peek_register(register)?;
        with_write!(self.frame, |frame: &mut Frame| frame.reads.insert(register));

        Ok(value.unwrap_or_else(|| {
            log::warn!(
                "{}: reading register v{} which was never assigned",
                self.method,
                register
            );
            Value::unknown(UNASSIGNED_TYPE)
        }))
    }

    /// Assigns `value` to `register` in this frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegisterOutOfBounds`] or [`Error::LockError`].
    pub fn assign_register(&self, register: u16, value: Value) -> Result<()> {
        self.check_register(register)?;
        let mut frame = write_lock!(self.frame);
        frame.registers.insert(register, value);
        frame.assigned.insert(register);
        Ok(())
    }

    /// Sets the pseudo result register of this frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the frame lock is poisoned.
    pub fn assign_result(&self, value: Value) -> Result<()> {
        with_write!(self.frame, |frame: &mut Frame| frame.result = Some(value));
        Ok(())
    }

    /// Reads the result register left by the parent node.
    ///
    /// Only the direct ancestor is consulted: a result is consumed by the instruction
    /// directly following the one that produced it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if a frame lock is poisoned.
    pub fn read_result(&self) -> Result<Option<Value>> {
        let ancestor = read_lock!(self.frame).ancestor.clone();
        match ancestor {
            Some(ancestor) => Ok(read_lock!(ancestor).result.clone()),
            None => Ok(None),
        }
    }

    /// Returns `true` if this node read `register`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the frame lock is poisoned.
    pub fn was_register_read(&self, register: u16) -> Result<bool> {
        Ok(read_lock!(self.frame).reads.contains(&register))
    }

    /// Returns `true` if this node assigned `register`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the frame lock is poisoned.
    pub fn was_register_assigned(&self, register: u16) -> Result<bool> {
        Ok(read_lock!(self.frame).assigned.contains(&register))
    }

    /// Allocates a new instance of `class` in this frame.
    ///
    /// A frame allocates under one reference: executing the node again replaces the
    /// object but keeps the reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the frame lock is poisoned.
    pub fn allocate(&self, class: &str) -> Result<HeapRef> {
        let mut frame = write_lock!(self.frame);
        let reference = *frame
            .allocation
            .get_or_insert_with(|| HeapRef::new(self.heap_ids.fetch_add(1, Ordering::Relaxed)));
        frame
            .heap
            .insert(reference, Arc::new(HeapObject::new(class)));
        Ok(reference)
    }

    /// Returns the object behind `reference`, taking a snapshot into this frame if it
    /// lives in an ancestor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHeapReference`] if no frame on the chain holds the object.
    pub fn touch_object(&self, reference: HeapRef) -> Result<Arc<HeapObject>> {
        let ancestor = {
            let frame = read_lock!(self.frame);
            if let Some(object) = frame.heap.get(&reference) {
                return Ok(Arc::clone(object));
            }
            frame.ancestor.clone()
        };

        let mut current = ancestor;
        while let Some(frame) = current {
            let guard = read_lock!(frame);
            if let Some(object) = guard.heap.get(&reference) {
                let snapshot = self.strategy.snapshot(object);
                drop(guard);
                write_lock!(self.frame)
                    .heap
                    .insert(reference, Arc::clone(&snapshot));
                return Ok(snapshot);
            }
            current = guard.ancestor.clone();
        }
        Err(Error::InvalidHeapReference(reference.id()))
    }

    /// Runs `f` on a mutable version of the object behind `reference`.
    ///
    /// Shared snapshots are copied before the first write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHeapReference`] if no frame on the chain holds the object.
    pub fn with_object_mut<F, R>(&self, reference: HeapRef, f: F) -> Result<R>
    where
        F: FnOnce(&mut HeapObject) -> R,
    {
        self.touch_object(reference)?;
        let mut frame = write_lock!(self.frame);
        let object = frame
            .heap
            .get_mut(&reference)
            .ok_or(Error::InvalidHeapReference(reference.id()))?;
        Ok(f(Arc::make_mut(object)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulation::classes::ClassManager;
    use crate::emulation::VmConfig;

    fn root(descriptor: &str, registers: u16) -> ExecutionContext {
        let registry = Arc::new(ClassManager::new());
        let strategy = CloneStrategy::for_registry(&registry, &VmConfig::default());
        let method = LocalMethod::new(descriptor, registers, true).unwrap();
        ExecutionContext::root(Arc::new(method), strategy, Arc::new(AtomicU64::new(1)))
    }

    #[test]
    fn test_root_parameters() {
        let context = root("LFoo;->bar(JI)V", 4);
        assert_eq!(context.peek_register(0).unwrap(), None);
        assert_eq!(context.peek_register(1).unwrap(), Some(Value::unknown("J")));
        assert_eq!(context.peek_register(2).unwrap(), Some(Value::unknown("J")));
        assert_eq!(context.peek_register(3).unwrap(), Some(Value::unknown("I")));
        assert!(!context.was_register_assigned(3).unwrap());
        assert!(context.peek_register(4).is_err());
    }

    #[test]
    fn test_child_reads_through_chain() {
        let parent = root("LFoo;->bar()V", 2);
        parent.assign_register(0, Value::Int(7)).unwrap();
        let child = parent.spawn_child();

        assert_eq!(child.read_register(0).unwrap(), Value::Int(7));
        assert!(child.was_register_read(0).unwrap());
        assert!(!parent.was_register_read(0).unwrap());
        assert!(!child.was_register_assigned(0).unwrap());

        child.assign_register(0, Value::Int(8)).unwrap();
        assert_eq!(parent.peek_register(0).unwrap(), Some(Value::Int(7)));
        assert_eq!(
            child.read_register(1).unwrap(),
            Value::unknown(UNASSIGNED_TYPE)
        );
    }

    #[test]
    fn test_result_only_from_direct_ancestor() {
        let parent = root("LFoo;->bar()V", 1);
        parent.assign_result(Value::Int(1)).unwrap();
        let child = parent.spawn_child();
        let grandchild = child.spawn_child();
        assert_eq!(child.read_result().unwrap(), Some(Value::Int(1)));
        assert_eq!(grandchild.read_result().unwrap(), None);
    }

    #[test]
    fn test_relink_ancestor_keeps_own_state() {
        let first = root("LFoo;->bar()V", 2);
        first.assign_register(0, Value::Int(1)).unwrap();
        let second = root("LFoo;->bar()V", 2);
        second.assign_register(0, Value::Int(2)).unwrap();

        let child = first.spawn_child();
        child.assign_register(1, Value::Int(5)).unwrap();
        child.relink_ancestor(&second).unwrap();

        assert!(child.is_child_of(&second).unwrap());
        assert!(!child.is_child_of(&first).unwrap());
        assert_eq!(child.peek_register(0).unwrap(), Some(Value::Int(2)));
        assert_eq!(child.peek_register(1).unwrap(), Some(Value::Int(5)));
    }

    #[test]
    fn test_heap_snapshot_isolated_between_paths() {
        let parent = root("LFoo;->bar()V", 1);
        let object = parent.allocate("Lcom/example/Box;").unwrap();
        parent
            .with_object_mut(object, |o| o.fields.insert("x".into(), Value::Int(1)))
            .unwrap();

        let left = parent.spawn_child();
        let right = parent.spawn_child();
        left.with_object_mut(object, |o| o.fields.insert("x".into(), Value::Int(2)))
            .unwrap();

        let field = |context: &ExecutionContext| {
            context.touch_object(object).unwrap().fields.get("x").cloned()
        };
        assert_eq!(field(&left), Some(Value::Int(2)));
        assert_eq!(field(&right), Some(Value::Int(1)));
        assert_eq!(field(&parent), Some(Value::Int(1)));
        assert!(parent.touch_object(HeapRef::new(999)).is_err());
    }

    #[test]
    fn test_reallocation_keeps_reference() {
        let parent = root("LFoo;->bar()V", 1);
        let node = parent.spawn_child();
        let object = node.allocate("Lcom/example/Box;").unwrap();
        node.with_object_mut(object, |o| o.fields.insert("x".into(), Value::Int(1)))
            .unwrap();

        node.reset().unwrap();
        assert!(node.touch_object(object).is_err());
        assert_eq!(node.allocate("Lcom/example/Box;").unwrap(), object);
        assert!(node.touch_object(object).unwrap().fields.is_empty());

        let replacement = parent.spawn_child();
        replacement.inherit_allocation(&node).unwrap();
        assert_eq!(replacement.allocate("Lcom/example/Box;").unwrap(), object);
        assert_ne!(parent.allocate("Lcom/example/Box;").unwrap(), object);
    }

    #[test]
    fn test_roots_share_heap_ids() {
        let registry = Arc::new(ClassManager::new());
        let strategy = CloneStrategy::for_registry(&registry, &VmConfig::default());
        let method = Arc::new(LocalMethod::new("LFoo;->bar()V", 1, true).unwrap());
        let heap_ids = Arc::new(AtomicU64::new(1));
        let first = ExecutionContext::root(
            Arc::clone(&method),
            Arc::clone(&strategy),
            Arc::clone(&heap_ids),
        );
        let second = ExecutionContext::root(method, strategy, heap_ids);

        let left = first.allocate("Lcom/example/Box;").unwrap();
        let right = second.allocate("Lcom/example/Box;").unwrap();
        assert_ne!(left, right);
    }
}
