//! Page allocator: anonymous executable-capable memory, and the W->X
//! permission transition (§4.1).
//!
//! Grounded on the teacher's own `raya-runtime` AOT bundle loader, which
//! mmaps an RW region, copies code into it, then `mprotect`s it to RX. The
//! page allocator here generalizes that one-shot load sequence into
//! allocate/mark_executable/free, since the stencil linker writes into the
//! region incrementally across many stencils before flipping it once.

use crate::error::{OsCode, PageError};

/// A page-granular memory region, either RW (during emission) or RX
/// (published). Frees itself on `Drop` only via an explicit [`free`] call —
/// the executor handle, not this type, owns the lifetime (§5).
#[derive(Debug)]
pub struct PageRegion {
    base: *mut u8,
    size: usize,
}

// Safety: `base` points at a region that is either exclusively owned by the
// emitting thread (RW phase) or immutable and read/execute-only (published
// phase); nothing about crossing threads changes its meaning.
unsafe impl Send for PageRegion {}
unsafe impl Sync for PageRegion {}

impl PageRegion {
    /// Base address of the region.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Size in bytes, as allocated (already rounded to a page multiple).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Reconstruct a `PageRegion` from a base/size pair previously handed
    /// off (e.g. published onto an [`crate::executor::ExecutorHandle`] and
    /// later reclaimed via [`crate::executor::ExecutorHandle::take`]).
    ///
    /// # Safety
    ///
    /// `base`/`size` must describe a region that was allocated by
    /// [`allocate`] and not already freed.
    pub unsafe fn from_raw(base: *mut u8, size: usize) -> Self {
        PageRegion { base, size }
    }
}

/// The OS page size, queried once. Cached behind a `OnceLock` would add a
/// dependency surface this crate doesn't need elsewhere; `sysconf` is cheap
/// enough to call per compile.
#[cfg(unix)]
pub fn page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    debug_assert!(size > 0, "sysconf(_SC_PAGESIZE) returned {size}");
    size as usize
}

#[cfg(not(unix))]
pub fn page_size() -> usize {
    4096
}

/// Round `size` up to the next multiple of the page size. `size` must be
/// positive.
pub fn round_up_to_page(size: usize) -> usize {
    debug_assert!(size > 0, "round_up_to_page: size must be positive");
    let page = page_size();
    (size + page - 1) / page * page
}

/// Reserve and commit `size` bytes (a positive multiple of the page size)
/// as readable+writable anonymous memory.
#[cfg(unix)]
pub fn allocate(size: usize) -> Result<PageRegion, PageError> {
    debug_assert!(size > 0 && size % page_size() == 0);

    // SAFETY: mmap with MAP_ANON and fd -1 has no aliasing preconditions.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        let code = OsCode(errno());
        log::warn!("JIT unable to allocate memory ({code})");
        return Err(PageError::AllocationFailed(code));
    }

    Ok(PageRegion {
        base: ptr as *mut u8,
        size,
    })
}

#[cfg(not(unix))]
pub fn allocate(_size: usize) -> Result<PageRegion, PageError> {
    log::warn!("JIT has no page allocator for this platform");
    Err(PageError::UnsupportedPlatform)
}

/// Transition the region to read+execute (no write) and flush the
/// instruction cache over its whole extent. Must be called before any
/// control transfer into the region.
#[cfg(unix)]
pub fn mark_executable(region: &PageRegion) -> Result<(), PageError> {
    // SAFETY: region.base/size describe a live mapping owned by this region.
    let result = unsafe {
        libc::mprotect(
            region.base as *mut libc::c_void,
            region.size,
            libc::PROT_READ | libc::PROT_EXEC,
        )
    };

    if result != 0 {
        let code = OsCode(errno());
        log::warn!("JIT unable to set executable permission ({code})");
        return Err(PageError::ProtectionFailed(code));
    }

    flush_icache(region.base, region.size)
}

#[cfg(not(unix))]
pub fn mark_executable(_region: &PageRegion) -> Result<(), PageError> {
    Err(PageError::UnsupportedPlatform)
}

/// Release a prior allocation. `region`'s base/size must match an
/// allocation exactly — the page allocator does not support partial frees.
#[cfg(unix)]
pub fn free(region: PageRegion) -> Result<(), PageError> {
    // SAFETY: region owns a live mapping of exactly `region.size` bytes.
    let result = unsafe { libc::munmap(region.base as *mut libc::c_void, region.size) };
    if result != 0 {
        let code = OsCode(errno());
        log::warn!("JIT unable to release memory ({code})");
        return Err(PageError::ReleaseFailed(code));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn free(_region: PageRegion) -> Result<(), PageError> {
    Err(PageError::UnsupportedPlatform)
}

#[cfg(unix)]
fn errno() -> i32 {
    // SAFETY: __errno_location (glibc) / __error (bsd/mac) just return a
    // pointer to TLS storage; reading it is always sound.
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

/// Flush the instruction cache over `[base, base+size)` so that cores other
/// than the one that wrote the bytes observe them before executing. Mandatory
/// on AArch64; a full fence stands in for x86-64's implicit coherence.
#[cfg(all(unix, target_arch = "aarch64"))]
fn flush_icache(base: *mut u8, size: usize) -> Result<(), PageError> {
    use std::arch::asm;

    // Conservative: assume a 64-byte cache line, the common case, and walk
    // it even if the real line size is larger (redundant, never unsafe).
    const LINE: usize = 64;
    let start = base as usize;
    let end = start + size;

    let mut addr = start - (start % LINE);
    while addr < end {
        // SAFETY: addr falls within [base, base+size), a region this
        // process just mapped and fully owns.
        unsafe {
            asm!("dc cvau, {0}", in(reg) addr);
        }
        addr += LINE;
    }
    // SAFETY: dsb/isb take no memory operands.
    unsafe {
        asm!("dsb ish");
    }

    let mut addr = start - (start % LINE);
    while addr < end {
        unsafe {
            asm!("ic ivau, {0}", in(reg) addr);
        }
        addr += LINE;
    }
    unsafe {
        asm!("dsb ish");
        asm!("isb");
    }

    Ok(())
}

#[cfg(all(unix, not(target_arch = "aarch64")))]
fn flush_icache(_base: *mut u8, _size: usize) -> Result<(), PageError> {
    // x86-64 has coherent instruction/data caches; the mandated flush call
    // degrades to a full fence, keeping the interface uniform across archs.
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_plausible() {
        let size = page_size();
        assert!(size >= 4096);
        assert_eq!(size % 4096, 0);
    }

    #[test]
    fn round_up_to_page_is_idempotent_on_multiples() {
        let page = page_size();
        assert_eq!(round_up_to_page(page), page);
        assert_eq!(round_up_to_page(2 * page), 2 * page);
    }

    #[test]
    fn round_up_to_page_rounds_non_multiples() {
        let page = page_size();
        assert_eq!(round_up_to_page(1), page);
        assert_eq!(round_up_to_page(page + 1), 2 * page);
    }

    #[cfg(unix)]
    #[test]
    fn allocate_mark_executable_free_round_trip() {
        let size = round_up_to_page(1);
        let region = allocate(size).expect("allocate");
        assert_eq!(region.size(), size);
        assert!(!region.base().is_null());

        // RET on every architecture-neutral encoding we care about isn't a
        // thing, but writing *some* byte and reading it back exercises the
        // RW phase before the RX transition.
        unsafe {
            region.base().write(0xC3);
        }

        mark_executable(&region).expect("mark_executable");

        // The byte must survive the W->X transition unchanged.
        let byte = unsafe { region.base().read() };
        assert_eq!(byte, 0xC3);

        free(region).expect("free");
    }

    #[cfg(unix)]
    #[test]
    fn allocate_requires_page_multiple_size() {
        let size = page_size();
        let region = allocate(size).expect("allocate");
        assert_eq!(region.size() % page_size(), 0);
        free(region).expect("free");
    }
}
