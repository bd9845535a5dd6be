//! Hole and patch-vector data model (§3, §6).

/// Dictionary keys of the per-emit patch vector. `#[repr(usize)]` so the
/// patch vector can be a flat array indexed by `value as usize` rather than
/// a hash map (Design Note 9.2) — the same instinct behind the teacher's use
/// of `rustc_hash::FxHashMap` only for cold keyed lookups, never on the
/// per-emission hot path.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HoleValue {
    /// Base address where this stencil's code body is being placed.
    Code = 0,
    /// Base address where this stencil's data body is being placed.
    Data,
    /// Address immediately after this stencil's code body.
    Continue,
    /// Address of the first real uop's code.
    Top,
    /// The opaque executor handle pointer.
    Executor,
    /// The uop's immediate argument.
    Oparg,
    /// The uop's wide operand (64-bit hosts).
    Operand,
    /// High half of the uop's wide operand (32-bit hosts).
    OperandHi,
    /// Low half of the uop's wide operand (32-bit hosts).
    OperandLo,
    /// `FORMAT_TARGET`'s branch metadata.
    Target,
    /// `FORMAT_EXIT`'s exit index.
    ExitIndex,
    /// `FORMAT_EXIT`/`FORMAT_JUMP`'s shared error-target field.
    ErrorTarget,
    /// `FORMAT_JUMP`'s branch target.
    JumpTarget,
    /// Always zero.
    Zero,
}

impl HoleValue {
    /// Number of variants; the patch vector's fixed length.
    pub const COUNT: usize = 14;
}

/// A flat, array-backed patch vector indexed by [`HoleValue`]. Entries a
/// stencil's holes never reference are simply left zero — the relocation
/// engine never queries an absent entry because a stencil only contains
/// holes for the values it actually needs (Design Note 9.2).
#[derive(Debug, Clone, Copy)]
pub struct PatchVector([u64; HoleValue::COUNT]);

impl PatchVector {
    /// A fresh, pre-zeroed patch vector (`GET_PATCHES()` in §6).
    pub fn zeroed() -> Self {
        PatchVector([0; HoleValue::COUNT])
    }

    pub fn get(&self, value: HoleValue) -> u64 {
        self.0[value as usize]
    }

    pub fn set(&mut self, value: HoleValue, patch: u64) {
        self.0[value as usize] = patch;
    }
}

/// Relocation kind: selects encoding and arithmetic policy for a hole
/// (§4.3, §6). Grouped by semantic family; conventional identifiers drawn
/// from Mach-O `ARM64_RELOC_*`/`X86_64_RELOC_*`, COFF `IMAGE_REL_*`, and ELF
/// `R_AARCH64_*`/`R_X86_64_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoleKind {
    /// 32-bit absolute.
    Dir32,
    /// 64-bit absolute.
    Unsigned,
    /// 32-bit PC-relative.
    Rel32,
    /// AArch64 26-bit branch (B/BL).
    Branch26,
    /// AArch64 MOVZ/MOVK chain, hw index 0 (bits [0..16)).
    MovwUabsG0,
    /// AArch64 MOVZ/MOVK chain, hw index 1 (bits [16..32)).
    MovwUabsG1,
    /// AArch64 MOVZ/MOVK chain, hw index 2 (bits [32..48)).
    MovwUabsG2,
    /// AArch64 MOVZ/MOVK chain, hw index 3 (bits [48..64)).
    MovwUabsG3,
    /// AArch64 ADRP (page-of), non-GOT.
    Page21,
    /// AArch64 12-bit low-page-offset, non-GOT (ADD).
    PageOff12,
    /// x86-64 GOT-PC-relative load, relaxation-eligible (MOV form).
    GotPcRelX,
    /// x86-64 GOT-PC-relative load, relaxation-eligible (REX-prefixed MOV
    /// or CALL/JMP-indirect form).
    RexGotPcRelX,
    /// AArch64 ADRP GOT-page, relaxation-eligible.
    AdrGotPage,
    /// AArch64 12-bit low-page-offset GOT load, relaxation-eligible (LDR).
    Ld64GotLo12Nc,
}

impl HoleKind {
    /// Whether this kind participates in the x86-64 GOT-load relaxation.
    pub fn is_x86_got_relaxable(self) -> bool {
        matches!(self, HoleKind::GotPcRelX | HoleKind::RexGotPcRelX)
    }

    /// Whether this kind is the ADRP half of the AArch64 GOT relaxation.
    pub fn is_aarch64_adrp_got(self) -> bool {
        matches!(self, HoleKind::AdrGotPage)
    }

    /// Whether this kind is the low-12 LDR half of the AArch64 GOT relaxation.
    pub fn is_aarch64_ld_got(self) -> bool {
        matches!(self, HoleKind::Ld64GotLo12Nc)
    }
}

/// A symbolic reference embedded in a stencil template (§3).
///
/// Invariant: `patches[value] + symbol + addend` is the logical target
/// address or immediate this hole refers to. Splitting the fixed portion
/// across `symbol`/`addend` is purely a build-time packing convenience.
#[derive(Debug, Clone, Copy)]
pub struct Hole {
    /// Byte offset within the stencil's code (or data) body.
    pub offset: usize,
    /// Encoding/arithmetic policy.
    pub kind: HoleKind,
    /// Index into the runtime patch vector.
    pub value: HoleValue,
    /// A constant pointer resolved at build time; contributes additively.
    pub symbol: i64,
    /// A signed constant contribution.
    pub addend: i64,
}

impl Hole {
    /// `patches[value] + symbol + addend`, per the hole's invariant.
    pub fn resolve(&self, patches: &PatchVector) -> i64 {
        patches.get(self.value) as i64 + self.symbol + self.addend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_vector_defaults_to_zero() {
        let patches = PatchVector::zeroed();
        assert_eq!(patches.get(HoleValue::Code), 0);
        assert_eq!(patches.get(HoleValue::Zero), 0);
    }

    #[test]
    fn patch_vector_set_get_round_trips() {
        let mut patches = PatchVector::zeroed();
        patches.set(HoleValue::Executor, 0xDEAD_BEEF);
        assert_eq!(patches.get(HoleValue::Executor), 0xDEAD_BEEF);
        assert_eq!(patches.get(HoleValue::Code), 0);
    }

    #[test]
    fn hole_resolve_sums_all_three_contributions() {
        let mut patches = PatchVector::zeroed();
        patches.set(HoleValue::Target, 100);
        let hole = Hole {
            offset: 0,
            kind: HoleKind::Rel32,
            value: HoleValue::Target,
            symbol: 10,
            addend: -5,
        };
        assert_eq!(hole.resolve(&patches), 105);
    }
}
