//! Removal of exception handler ranges that no longer cover any instruction.
//!
//! Removing instructions can collapse a try range: both of its labels end up on the same
//! location. Such ranges are invalid in a dex file and are dropped right after every
//! removal.

use crate::method::{MethodImplementation, TryBlock};

/// Returns `true` if `block` covers no instruction of `implementation`.
///
/// A block is empty when one of its bounds no longer resolves, or when start and end
/// resolve to the same code address.
#[must_use]
pub fn is_empty_try_block(implementation: &MethodImplementation, block: &TryBlock) -> bool {
    match (
        implementation.label_address(block.start),
        implementation.label_address(block.end),
    ) {
        (Some(start), Some(end)) => start == end,
        _ => true,
    }
}

/// Removes every empty try block and returns the removed blocks in declaration order.
pub fn remove_empty_try_blocks(implementation: &mut MethodImplementation) -> Vec<TryBlock> {
    let empty: Vec<usize> = implementation
        .try_blocks()
        .iter()
        .enumerate()
        .filter(|(_, block)| is_empty_try_block(implementation, block))
        .map(|(index, _)| index)
        .collect();

    let mut removed = Vec::with_capacity(empty.len());
    for index in empty.into_iter().rev() {
        if let Some(block) = implementation.remove_try_block(index) {
            log::debug!(
                "Removing empty try block {}..{} (handler {})",
                block.start,
                block.end,
                block.handler
            );
            removed.push(block);
        }
    }
    removed.reverse();
    removed
}
