use thiserror::Error;

use crate::{graph::NodeId, method::LocationId};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every failure that leaves the execution graph in an unknown state (structural
/// inconsistencies, opcode recreation failures) is fatal for the edit that caused it. The
/// manipulator refuses further edits afterwards and callers are expected to abandon the
/// simplification of the current method.
///
/// # Error Categories
///
/// ## Input Errors
/// - [`Error::Malformed`] - Smali text or instruction operands that cannot be understood
/// - [`Error::Empty`] - A method without instructions
/// - [`Error::BranchOutOfRange`] - A branch offset that cannot be encoded
///
/// ## Graph Errors
/// - [`Error::InvalidAddress`] - No instruction starts at the requested code address
/// - [`Error::InvalidLocation`] - The location is no longer part of the instruction stream
/// - [`Error::MissingDonor`] - Pile growth could not find the shifted pile it splices into
/// - [`Error::GraphInconsistency`] - Parent/child wiring does not match the node piles
/// - [`Error::DanglingNode`] - A node index that no longer resolves in the arena
/// - [`Error::OpCreation`] - The opcode factory could not build an op for a location
/// - [`Error::GraphPoisoned`] - A previous edit failed and the graph can't be trusted
///
/// ## Execution Errors
/// - [`Error::RegisterOutOfBounds`] - Register number beyond the method's register count
/// - [`Error::InvalidHeapReference`] - Heap reference not visible from the current frame
/// - [`Error::AddressVisitLimit`] / [`Error::MethodVisitLimit`] - Runaway execution
/// - [`Error::LockError`] - A context frame lock was poisoned
///
/// # Examples
///
/// ```rust,ignore
/// use dexscope::Error;
///
/// match manipulator.remove_address(0x4) {
///     Ok(()) => {}
///     Err(Error::InvalidAddress(address)) => eprintln!("nothing at {address:#x}"),
///     Err(e) => eprintln!("giving up on this method: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The input is damaged and could not be parsed.
    ///
    /// Used for smali text that does not follow the expected syntax and for instructions
    /// whose operands do not match their opcode format. The error includes the source
    /// location where the malformation was detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Provided input was empty.
    ///
    /// A method implementation needs at least one instruction before it can be executed.
    #[error("Provided input was empty")]
    Empty,

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// No instruction starts at the given code address.
    #[error("No instruction at address {0:#x}")]
    InvalidAddress(u32),

    /// The location is not (or no longer) part of the instruction stream.
    #[error("Location {0} is not part of the instruction stream")]
    InvalidLocation(LocationId),

    /// Pile growth could not find the pile that was shifted by a new location.
    ///
    /// A newly inserted location always pushes an existing location one index up. If no
    /// location with a node pile sits at `index`, the stream and the graph disagree.
    #[error("No node pile to grow from for new location {location} (expected donor index {index})")]
    MissingDonor {
        /// The location that was added to the stream.
        location: LocationId,
        /// The index the donor location was expected at.
        index: usize,
    },

    /// The parent/child wiring of the execution graph is inconsistent.
    #[error("Execution graph inconsistent at {location}: {reason}")]
    GraphInconsistency {
        /// The location where the inconsistency was detected.
        location: LocationId,
        /// Description of the inconsistency.
        reason: String,
    },

    /// A node index does not resolve to a live node.
    #[error("Dangling execution node {0}")]
    DanglingNode(NodeId),

    /// The opcode factory could not build an op for a location.
    ///
    /// There is no degraded mode for this: execution cannot continue without an op.
    #[error("Unable to create op for {location}: {reason}")]
    OpCreation {
        /// The location the op was requested for.
        location: LocationId,
        /// Why the factory failed.
        reason: String,
    },

    /// A previous edit failed, the graph may be partially rewired.
    #[error("Execution graph was left inconsistent by a previous failed edit")]
    GraphPoisoned,

    /// A branch offset does not fit into the instruction's encoding.
    #[error("Branch at {address:#x} has offset {offset} which does not fit its format")]
    BranchOutOfRange {
        /// Address of the branch instruction.
        address: u32,
        /// The offset in code units.
        offset: i64,
    },

    /// A register number beyond the method's register count was accessed.
    #[error("Register v{register} out of bounds (method has {count} registers)")]
    RegisterOutOfBounds {
        /// The accessed register.
        register: u16,
        /// Number of registers of the method.
        count: u16,
    },

    /// A heap reference was not visible from the executing frame.
    #[error("Invalid heap reference #{0}")]
    InvalidHeapReference(u64),

    /// An address was visited more often than the configuration allows.
    #[error("Address {address:#x} visited more than {limit} times")]
    AddressVisitLimit {
        /// The address that exceeded its limit.
        address: u32,
        /// The configured limit.
        limit: usize,
    },

    /// The method executed more nodes than the configuration allows.
    #[error("Method exceeded {0} node visits")]
    MethodVisitLimit(usize),

    /// Failed to lock target.
    ///
    /// Context frames are shared between a node and its descendants through
    /// reference-counted locks. This error occurs when such a lock was poisoned.
    #[error("Failed to lock target")]
    LockError,
}
