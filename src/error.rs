use core::fmt;

/// Error taxonomy of the VM core.
///
/// `AccessFault` is the only kind meant to terminate the faulting
/// operation; callers typically escalate it into process termination.
/// `InternalInconsistency` marks a violated invariant and is not
/// recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Malformed call: unknown fault type, missing address space,
    /// overlapping or out-of-range region definition.
    InvalidArgument,
    /// The frame allocator is exhausted, or the hashed page table has no
    /// free slot left.
    OutOfMemory,
    /// Permission or containment violation.
    AccessFault,
    /// An invariant did not hold, e.g. a freshly created page table entry
    /// could not be looked up again.
    InternalInconsistency,
}

pub type Result<T> = core::result::Result<T, VmError>;

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::InvalidArgument => "invalid argument",
            VmError::OutOfMemory => "out of memory",
            VmError::AccessFault => "access fault",
            VmError::InternalInconsistency => "internal inconsistency",
        };
        f.write_str(msg)
    }
}
