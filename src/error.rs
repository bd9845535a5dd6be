//! Error and warning taxonomy for the JIT backend.
//!
//! Transient OS failures (allocation, protection change, i-cache flush,
//! release) are reported as a single warning category and never propagate
//! past [`crate::compiler::compile`]'s documented `-1`-equivalent `Err`
//! return. Programming errors (unknown relocation kind, unknown instruction
//! format, bitfield bounds violations) are not representable here — they are
//! `debug_assert!`/`unreachable!` at the call site, since they indicate a
//! stencil-table/runtime mismatch rather than an environmental condition.

use std::fmt;

/// An OS-level error code, formatted for the "JIT <op> (<os-code>)" warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsCode(pub i32);

impl fmt::Display for OsCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "os error {}", self.0)
    }
}

/// Page-allocator failures (§4.1, §7).
#[derive(Debug, thiserror::Error)]
pub enum PageError {
    /// The OS refused to provide anonymous RW pages.
    #[error("JIT unable to allocate memory ({0})")]
    AllocationFailed(OsCode),

    /// The region was allocated but the RW->RX transition failed.
    #[error("JIT unable to set executable permission ({0})")]
    ProtectionFailed(OsCode),

    /// The instruction-cache flush that must precede execution failed.
    #[error("JIT unable to flush instruction cache ({0})")]
    IcacheFlushFailed(OsCode),

    /// A prior allocation could not be released.
    #[error("JIT unable to release memory ({0})")]
    ReleaseFailed(OsCode),

    /// No page-allocator backend is implemented for this OS.
    #[error("JIT has no page allocator for this platform")]
    UnsupportedPlatform,
}

/// Failures from [`crate::compiler::compile`] (§7).
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The page allocator could not provide or finalize the compiled region.
    #[error(transparent)]
    Page(#[from] PageError),

    /// A uop referenced an out-of-range branch/exit target.
    #[error("uop {index} targets out-of-range {what} {target}")]
    TargetOutOfRange {
        /// Index of the offending uop within the trace.
        index: usize,
        /// Which field was out of range (`"jump_target"`, `"error_target"`, `"exit_index"`).
        what: &'static str,
        /// The offending value.
        target: u32,
    },

    /// The trace was empty, or its first uop was not a recognized entry tag.
    #[error("trace must start with START_EXECUTOR or COLD_EXIT")]
    InvalidEntry,
}
