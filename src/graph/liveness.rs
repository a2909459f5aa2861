//! Register availability below an address.
//!
//! A register is available at an address if no path continuing from that address reads
//! it before assigning it. Such a register may be reused or its value discarded.
//!
//! Every path is walked separately, carrying the registers the path has assigned so far,
//! so an assignment on one path never hides a read on another. `move-result` nodes are
//! skipped: they only consume the result register of their parent.

use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use crate::{
    assembly::OpcodeFlags,
    graph::{ExecutionGraph, NodeId},
    Result,
};

impl ExecutionGraph {
    /// Returns the registers that no path continuing after `address` reads before
    /// assigning them, in ascending order.
    ///
    /// If nothing executes after `address` every register is available.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidAddress`] if no instruction starts at `address`.
    pub fn available_registers(&self, address: u32) -> Result<Vec<u16>> {
        let register_count = self.method().register_count();
        let mut read: FxHashSet<u16> = FxHashSet::default();

        let mut queue: VecDeque<(NodeId, FxHashSet<u16>)> = self
            .child_nodes(address)?
            .into_iter()
            .map(|child| (child, FxHashSet::default()))
            .collect();

        while let Some((id, mut assigned)) = queue.pop_front() {
            let node = self.node(id)?;
            if !node.op().flags().contains(OpcodeFlags::READS_RESULT) {
                if let Some(context) = node.context() {
                    for register in 0..register_count {
                        if read.contains(&register) || assigned.contains(&register) {
                            continue;
                        }
                        if context.was_register_read(register)? {
                            read.insert(register);
                        } else if context.was_register_assigned(register)? {
                            assigned.insert(register);
                        }
                    }
                }
            }

            // Nothing left to learn on this path.
            if (0..register_count).all(|r| read.contains(&r) || assigned.contains(&r)) {
                continue;
            }
            match node.children() {
                [] => {}
                [only] => queue.push_back((*only, assigned)),
                children => {
                    for child in children {
                        queue.push_back((*child, assigned.clone()));
                    }
                }
            }
        }

        Ok((0..register_count)
            .filter(|register| !read.contains(register))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        assembly::parse_smali,
        emulation::{ClassManager, VirtualMachine, VmConfig},
        method::LocalMethod,
    };

    fn graph(smali: &str, descriptor: &str, registers: u16) -> crate::graph::ExecutionGraph {
        let implementation = parse_smali(smali).unwrap();
        let method = Arc::new(LocalMethod::new(descriptor, registers, true).unwrap());
        VirtualMachine::new(Arc::new(ClassManager::new()), VmConfig::default())
            .execute(&method, &implementation)
            .unwrap()
    }

    #[test]
    fn test_read_before_assign_is_not_available() {
        let graph = graph(
            "
            .registers 6
            const/4 v3, 0x1
            nop
            add-int/lit8 v3, v3, 0x1
            const/4 v4, 0x0
            return v3
            ",
            "LFoo;->bar()I",
            6,
        );
        // after the nop: v3 is read then assigned, v4 assigned only
        assert_eq!(graph.available_registers(1).unwrap(), vec![0, 1, 2, 4, 5]);
    }

    #[test]
    fn test_read_on_any_path_counts() {
        let graph = graph(
            "
            .registers 3
            if-eqz v2, :other
            const/4 v0, 0x0
            return v0
            :other
            return v0
            ",
            "LFoo;->bar(I)I",
            3,
        );
        assert_eq!(graph.available_registers(0).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_method_end_frees_everything() {
        let graph = graph(
            "
            .registers 2
            const/4 v0, 0x1
            return-void
            ",
            "LFoo;->bar()V",
            2,
        );
        assert_eq!(graph.available_registers(1).unwrap(), vec![0, 1]);
        assert!(graph.available_registers(7).is_err());
    }

    #[test]
    fn test_move_result_is_not_a_read() {
        let graph = graph(
            "
            .registers 2
            invoke-static {v0}, LFoo;->make(I)I
            move-result v1
            return v1
            ",
            "LFoo;->bar()I",
            2,
        );
        // move-result does not mark v1 assigned, so the return reads it
        assert_eq!(graph.available_registers(0).unwrap(), vec![0]);
    }
}
