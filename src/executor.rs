//! The executor handle: an opaque object owned by the host runtime (§3, §6).
//!
//! This crate reads only `exit_count` and writes only the three JIT fields.
//! Everything else about the executor's lifetime — reference counting, GC,
//! thread-state — is the host's concern and is not modeled here (§1).

/// The host-owned object a compiled trace is attached to.
///
/// Field semantics mirror the teacher's `ExecutableCode` (`backend/traits.rs`):
/// a raw pointer plus size, documented `Send`/`Sync` because the pointed-to
/// memory is immutable and RX for its entire visible lifetime.
#[derive(Debug)]
pub struct ExecutorHandle {
    /// Entry pointer into the compiled region, or null if not compiled.
    jit_code: *mut u8,
    /// Post-trampoline entry point.
    jit_side_entry: *mut u8,
    /// Total size of the region backing `jit_code`, for later release.
    jit_size: usize,
    /// Number of side-exit slots this executor has reserved; read-only from
    /// the compiler's perspective, used only to bounds-check `EXIT_INDEX`.
    exit_count: u32,
}

// SAFETY: once published, `jit_code` points at an RX region that is never
// again written to by this crate; the host is responsible for not calling
// into it concurrently with a `free`.
unsafe impl Send for ExecutorHandle {}
unsafe impl Sync for ExecutorHandle {}

impl ExecutorHandle {
    /// A fresh, uncompiled handle with the given exit-slot budget.
    pub fn new(exit_count: u32) -> Self {
        ExecutorHandle {
            jit_code: std::ptr::null_mut(),
            jit_side_entry: std::ptr::null_mut(),
            jit_size: 0,
            exit_count,
        }
    }

    pub fn exit_count(&self) -> u32 {
        self.exit_count
    }

    pub fn jit_code(&self) -> *mut u8 {
        self.jit_code
    }

    pub fn jit_side_entry(&self) -> *mut u8 {
        self.jit_side_entry
    }

    pub fn jit_size(&self) -> usize {
        self.jit_size
    }

    pub fn is_compiled(&self) -> bool {
        !self.jit_code.is_null()
    }

    /// Publish a freshly compiled region. Called only after `mark_executable`
    /// has succeeded (§4.5's "Publish" step).
    pub(crate) fn publish(&mut self, jit_code: *mut u8, jit_side_entry: *mut u8, jit_size: usize) {
        self.jit_code = jit_code;
        self.jit_side_entry = jit_side_entry;
        self.jit_size = jit_size;
    }

    /// Clear all three JIT fields, returning the previous `(jit_code, jit_size)`
    /// so the caller can release the pages afterward (§4.6: clear before
    /// release, so a failed release still leaves the handle in a safe state).
    pub(crate) fn take(&mut self) -> Option<(*mut u8, usize)> {
        if self.jit_code.is_null() {
            return None;
        }
        let snapshot = (self.jit_code, self.jit_size);
        self.jit_code = std::ptr::null_mut();
        self.jit_side_entry = std::ptr::null_mut();
        self.jit_size = 0;
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_handle_is_not_compiled() {
        let handle = ExecutorHandle::new(4);
        assert!(!handle.is_compiled());
        assert_eq!(handle.exit_count(), 4);
    }

    #[test]
    fn publish_then_take_round_trips_and_clears() {
        let mut handle = ExecutorHandle::new(0);
        let fake_code = 0x1000 as *mut u8;
        let fake_entry = 0x1010 as *mut u8;
        handle.publish(fake_code, fake_entry, 4096);
        assert!(handle.is_compiled());
        assert_eq!(handle.jit_code(), fake_code);
        assert_eq!(handle.jit_side_entry(), fake_entry);
        assert_eq!(handle.jit_size(), 4096);

        let snapshot = handle.take().expect("take on compiled handle");
        assert_eq!(snapshot, (fake_code, 4096));
        assert!(!handle.is_compiled());
        assert_eq!(handle.jit_code(), std::ptr::null_mut());
    }

    #[test]
    fn take_on_uncompiled_handle_is_none() {
        let mut handle = ExecutorHandle::new(0);
        assert!(handle.take().is_none());
    }
}
