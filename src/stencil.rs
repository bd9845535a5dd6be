//! Stencil and stencil-group data model (§3), plus the stencil emitter (§4.4).

use crate::hole::{Hole, HoleValue, PatchVector};
use crate::reloc;

/// A position-independent byte template with symbolic holes. Immutable
/// after construction — in the real system this is baked in by the offline
/// stencil builder (§9 Design Notes); here it is built once by
/// [`crate::stencil_table`] and never mutated.
#[derive(Debug, Clone)]
pub struct Stencil {
    /// Position-independent template bytes.
    pub body: Box<[u8]>,
    /// Unresolved references into `body`.
    pub holes: Box<[Hole]>,
}

impl Stencil {
    pub fn new(body: impl Into<Box<[u8]>>, holes: impl Into<Box<[Hole]>>) -> Self {
        Stencil {
            body: body.into(),
            holes: holes.into(),
        }
    }

    pub fn body_size(&self) -> usize {
        self.body.len()
    }
}

/// A `{code, data}` pair. Every uop opcode maps to exactly one group; the
/// trampoline and fatal-error groups are not tied to any opcode.
#[derive(Debug, Clone)]
pub struct StencilGroup {
    /// The code-half stencil.
    pub code: Stencil,
    /// The data-half stencil.
    pub data: Stencil,
}

/// Copy `group.data.body` to `patches[DATA]` and `group.code.body` to
/// `patches[CODE]`, then run the relocation engine over each (§4.4).
///
/// Data is emitted first because code-stencil holes may target data-stencil
/// addresses; both are written before execution permission is granted, so
/// the order is purely conventional within the writable window.
///
/// # Safety
///
/// `code_base` and `data_base` must be valid, writable pointers with at
/// least `group.code.body_size()` / `group.data.body_size()` bytes available,
/// non-overlapping with each other and with `group`'s own storage.
pub unsafe fn emit(
    group: &StencilGroup,
    patches: &PatchVector,
    code_base: *mut u8,
    data_base: *mut u8,
    enable_relaxations: bool,
) {
    std::ptr::copy_nonoverlapping(group.data.body.as_ptr(), data_base, group.data.body_size());
    reloc::relocate_stencil_with(&group.data, data_base, patches, enable_relaxations);

    std::ptr::copy_nonoverlapping(group.code.body.as_ptr(), code_base, group.code.body_size());
    reloc::relocate_stencil_with(&group.code, code_base, patches, enable_relaxations);
}

/// Start a patch vector with the entries every stencil emission shares:
/// `CODE`, `DATA`, `CONTINUE`, `EXECUTOR`, `ZERO`. Format- and uop-specific
/// entries are added by the caller afterward.
pub fn base_patches(code_base: u64, data_base: u64, continue_addr: u64, executor: u64) -> PatchVector {
    let mut patches = PatchVector::zeroed();
    patches.set(HoleValue::Code, code_base);
    patches.set(HoleValue::Data, data_base);
    patches.set(HoleValue::Continue, continue_addr);
    patches.set(HoleValue::Executor, executor);
    patches.set(HoleValue::Zero, 0);
    patches
}
