//! Relocation engine: per-hole dispatch over the closed set of relocation
//! kinds, including the two optional peephole relaxations (§4.3).

use crate::bits::{get_bits, set_bits};
use crate::hole::{Hole, HoleKind, PatchVector};
use crate::stencil::Stencil;

/// Apply every hole in `stencil` against memory starting at `base`, using
/// `patches` to resolve each hole's symbolic value.
///
/// # Safety
///
/// `base` must be a valid, writable pointer to at least `stencil.body_size()`
/// bytes, and every hole's `offset` must fall within that range.
pub unsafe fn relocate_stencil(stencil: &Stencil, base: *mut u8, patches: &PatchVector) {
    relocate_stencil_with(stencil, base, patches, true)
}

/// As [`relocate_stencil`], with the relaxation peepholes gated explicitly
/// (used by [`crate::compiler::compile`] via `CompileOptions::enable_relaxations`).
///
/// # Safety
///
/// Same preconditions as [`relocate_stencil`].
pub unsafe fn relocate_stencil_with(
    stencil: &Stencil,
    base: *mut u8,
    patches: &PatchVector,
    enable_relaxations: bool,
) {
    let holes = &stencil.holes;
    let mut i = 0;
    while i < holes.len() {
        let consumed_pair = relocate_one(holes, i, base, patches, enable_relaxations);
        i += if consumed_pair { 2 } else { 1 };
    }
}

/// Relocate `holes[i]`. Returns `true` if an AArch64 ADRP+LDR relaxation
/// consumed `holes[i + 1]` as well.
unsafe fn relocate_one(
    holes: &[Hole],
    i: usize,
    base: *mut u8,
    patches: &PatchVector,
    enable_relaxations: bool,
) -> bool {
    let hole = holes[i];
    let value = hole.resolve(patches);
    let location = (base as usize + hole.offset) as u64;

    match hole.kind {
        HoleKind::Dir32 => {
            debug_assert!((0..(1i64 << 32)).contains(&value), "DIR32 value out of range");
            write_u32(location, value as u32);
            false
        }

        HoleKind::Unsigned => {
            write_u64(location, value as u64);
            false
        }

        HoleKind::Rel32 => {
            relocate_rel32(location, value, None);
            false
        }

        HoleKind::GotPcRelX | HoleKind::RexGotPcRelX => {
            let relaxed = if enable_relaxations {
                x86_got_relax(location, value as u64)
            } else {
                None
            };
            relocate_rel32(location, value, relaxed);
            false
        }

        HoleKind::Branch26 => {
            let v = value - location as i64;
            debug_assert_eq!(v % 4, 0, "BRANCH26 target not 4-aligned");
            debug_assert!(
                (-(1i64 << 27)..(1i64 << 27)).contains(&v),
                "BRANCH26 displacement out of range"
            );
            let imm26 = get_bits(v as u64, 2, 26);
            splice_instr(location, 0, imm26 as u64, 0, 26);
            false
        }

        HoleKind::MovwUabsG0 | HoleKind::MovwUabsG1 | HoleKind::MovwUabsG2 | HoleKind::MovwUabsG3 => {
            let k = movw_chain_index(hole.kind);
            let instr = read_u32(location);
            debug_assert_eq!(
                get_bits(instr as u64, 21, 2),
                k,
                "MOVW_UABS_G{k} hw field mismatch"
            );
            splice_instr(location, 5, value as u64, 16 * k, 16);
            false
        }

        HoleKind::Page21 => {
            relocate_page21(location, value as u64);
            false
        }

        HoleKind::AdrGotPage => {
            if enable_relaxations && i + 1 < holes.len() {
                let next = holes[i + 1];
                if next.kind == HoleKind::Ld64GotLo12Nc
                    && next.offset == hole.offset + 4
                    && next.value == hole.value
                    && next.symbol == hole.symbol
                    && next.addend == hole.addend
                {
                    if aarch64_adrp_ldr_relax(location, value as u64) {
                        return true;
                    }
                }
            }
            relocate_page21(location, value as u64);
            false
        }

        HoleKind::PageOff12 | HoleKind::Ld64GotLo12Nc => {
            // Reached directly (not consumed by a preceding ADRP-GOT
            // relaxation, or relaxations disabled): fall through to the
            // standard low-12 encoding.
            relocate_pageoff12(location, value as u64, hole.kind);
            false
        }
    }
}

fn movw_chain_index(kind: HoleKind) -> u32 {
    match kind {
        HoleKind::MovwUabsG0 => 0,
        HoleKind::MovwUabsG1 => 1,
        HoleKind::MovwUabsG2 => 2,
        HoleKind::MovwUabsG3 => 3,
        _ => unreachable!("movw_chain_index called on non-MOVW kind"),
    }
}

/// `v = value - location`; assert `v` fits in 32 signed bits; write it.
/// If `relaxed` is `Some`, it has already rewritten the two bytes preceding
/// `location` and supplies the adjusted target in place of `value`.
fn relocate_rel32(location: u64, value: i64, relaxed: Option<i64>) {
    let target = relaxed.unwrap_or(value);
    let v = target - location as i64;
    debug_assert!(
        (-(1i64 << 31)..(1i64 << 31)).contains(&v),
        "REL32 displacement out of range"
    );
    write_u32(location, v as u32);
}

/// AArch64 ADRP-family page relocation: `v = (value >> 12) - (location >> 12)`;
/// splice `v[0..2]` into bits `[29..31]` and `v[2..21]` into bits `[5..24]`.
fn relocate_page21(location: u64, value: u64) {
    let v = (value as i64 >> 12) - (location as i64 >> 12);
    debug_assert!(
        (-(1i64 << 20)..(1i64 << 20)).contains(&v),
        "PAGE21 displacement out of range"
    );
    let v = v as u64;
    splice_instr(location, 29, v, 0, 2);
    splice_instr(location, 5, v, 2, 19);
}

/// AArch64 low-page-offset relocation. `kind` distinguishes the two
/// instruction shapes this family covers, since they disagree on where the
/// implicit shift comes from:
/// - `PageOff12` is `ADD_ABS_LO12_NC` — always shift 0 (bits `[30..32]` there
///   are ADD's `sf`/`op` fields, not a size field, and must not be read as one).
/// - `Ld64GotLo12Nc` (and any other LDR/STR-shaped low-12 hole) reads the
///   shift from the LDR/STR size field at bits `[30..32]`.
fn relocate_pageoff12(location: u64, value: u64, kind: HoleKind) {
    let shift = match kind {
        HoleKind::PageOff12 => 0,
        _ => {
            let instr = read_u32(location);
            get_bits(instr as u64, 30, 2)
        }
    };
    let imm12 = value & 0xFFF;
    debug_assert_eq!(
        imm12 & ((1u64 << shift) - 1),
        0,
        "PAGEOFF12 low bits below shift must be zero"
    );
    splice_instr(location, 10, imm12, shift, 12);
}

/// x86-64 GOT-load relaxation. `value` is the address of a GOT slot holding
/// the real target as an 8-byte pointer, 4 bytes past the hole's resolved
/// value (the ELF `GOTPCRELX` addend convention). Returns the relaxed target
/// if the relaxation applies, having already rewritten the two opcode bytes
/// preceding `location`.
fn x86_got_relax(location: u64, value: u64) -> Option<i64> {
    // SAFETY-adjacent: dereferencing an externally supplied GOT-slot address
    // is the documented contract of this relaxation; in test builds `value`
    // is a pointer into a local buffer constructed by the test itself.
    let relaxed = unsafe { ((value + 4) as *const u64).read_unaligned() } as i64 - 4;

    let v = relaxed - location as i64;
    if !(-(1i64 << 31)..(1i64 << 31)).contains(&v) {
        return None;
    }

    let prefix = unsafe { std::slice::from_raw_parts((location as usize - 2) as *const u8, 2) };
    let rewrite: Option<[u8; 2]> = match prefix {
        [0x8B, modrm] => Some([0x8D, *modrm]),
        [0xFF, 0x15] => Some([0x90, 0xE8]),
        [0xFF, 0x25] => Some([0x90, 0xE9]),
        _ => None,
    };

    let bytes = rewrite?;
    unsafe {
        std::ptr::write_unaligned((location as usize - 2) as *mut u8, bytes[0]);
        std::ptr::write_unaligned((location as usize - 1) as *mut u8, bytes[1]);
    }
    Some(relaxed)
}

/// AArch64 ADRP+LDR GOT relaxation. Returns `true` if the pair of
/// instructions at `location`/`location+4` was rewritten (caller must skip
/// the paired hole).
fn aarch64_adrp_ldr_relax(location: u64, value: u64) -> bool {
    let adrp = read_u32(location);
    let ldr = read_u32(location + 4);
    let reg = get_bits(adrp as u64, 0, 5);

    // Require the LDR/STR's base and destination registers both equal the
    // ADRP's destination (the `x0, [x0, ...]` shape the relaxation assumes).
    if get_bits(ldr as u64, 0, 5) != reg || get_bits(ldr as u64, 5, 5) != reg {
        return false;
    }

    // SAFETY-adjacent: same contract as x86_got_relax — `value` is the GOT
    // slot's own address, read as its 8-byte contents.
    let relaxed = unsafe { (value as *const u64).read_unaligned() };

    if relaxed < (1 << 16) {
        let movz = 0xD280_0000u32 | ((relaxed as u32 & 0xFFFF) << 5) | reg as u32;
        write_u32(location, movz);
        write_u32(location + 4, 0xD503_201F); // NOP
        true
    } else if relaxed < (1u64 << 32) {
        let lo = relaxed & 0xFFFF;
        let hi = (relaxed >> 16) & 0xFFFF;
        let movz = 0xD280_0000u32 | ((lo as u32) << 5) | reg as u32;
        let movk = 0xF2A0_0000u32 | ((hi as u32) << 5) | reg as u32;
        write_u32(location, movz);
        write_u32(location + 4, movk);
        true
    } else {
        let disp = relaxed as i64 - location as i64;
        if disp % 4 == 0 && (-(1i64 << 21)..(1i64 << 21)).contains(&disp) {
            let imm19 = get_bits((disp >> 2) as u64, 0, 19);
            let ldr_lit = 0x5800_0000u32 | (imm19 << 5) | reg as u32;
            write_u32(location, ldr_lit);
            write_u32(location + 4, 0xD503_201F); // NOP
            true
        } else {
            false
        }
    }
}

/// Splice `value[value_start..value_start+width]` into the 32-bit
/// instruction word at `location`, at bit offset `loc_start`.
fn splice_instr(location: u64, loc_start: u32, value: u64, value_start: u32, width: u32) {
    // SAFETY: `location` is the base+offset of a hole within a stencil body
    // the caller has already validated as writable (relocate_stencil's
    // contract); instruction words are 4-byte aligned by construction of
    // every stencil in `stencil_table`.
    unsafe {
        set_bits(
            location as *mut u32,
            loc_start,
            get_bits(value, value_start, width) as u64,
            0,
            width,
        );
    }
}

fn read_u32(location: u64) -> u32 {
    unsafe { (location as *const u32).read_unaligned() }
}

fn write_u32(location: u64, value: u32) {
    unsafe { (location as *mut u32).write_unaligned(value) }
}

fn write_u64(location: u64, value: u64) {
    unsafe { (location as *mut u64).write_unaligned(value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hole::HoleValue;
    use crate::stencil::Stencil;

    fn patches_with(value: HoleValue, v: u64) -> PatchVector {
        let mut patches = PatchVector::zeroed();
        patches.set(value, v);
        patches
    }

    #[test]
    fn dir32_writes_absolute_32_bits() {
        let mut buf = [0u8; 4];
        let stencil = Stencil::new(
            buf.to_vec(),
            vec![Hole {
                offset: 0,
                kind: HoleKind::Dir32,
                value: HoleValue::Target,
                symbol: 0,
                addend: 0,
            }],
        );
        let patches = patches_with(HoleValue::Target, 0xCAFEBABE);
        unsafe { relocate_stencil(&stencil, buf.as_mut_ptr(), &patches) };
        assert_eq!(u32::from_ne_bytes(buf), 0xCAFEBABEu32);
    }

    #[test]
    fn unsigned_writes_absolute_64_bits() {
        let mut buf = [0u8; 8];
        let stencil = Stencil::new(
            buf.to_vec(),
            vec![Hole {
                offset: 0,
                kind: HoleKind::Unsigned,
                value: HoleValue::Target,
                symbol: 0,
                addend: 0,
            }],
        );
        let patches = patches_with(HoleValue::Target, 0x1122_3344_5566_7788);
        unsafe { relocate_stencil(&stencil, buf.as_mut_ptr(), &patches) };
        assert_eq!(u64::from_ne_bytes(buf), 0x1122_3344_5566_7788);
    }

    #[test]
    fn rel32_computes_value_minus_location() {
        let mut buf = [0u8; 8];
        let base = buf.as_mut_ptr() as u64;
        let stencil = Stencil::new(
            buf.to_vec(),
            vec![Hole {
                offset: 4,
                kind: HoleKind::Rel32,
                value: HoleValue::Target,
                symbol: 0,
                addend: 0,
            }],
        );
        let target = base + 100;
        let patches = patches_with(HoleValue::Target, target);
        unsafe { relocate_stencil(&stencil, base as *mut u8, &patches) };
        let written = i32::from_ne_bytes(buf[4..8].try_into().unwrap());
        assert_eq!(written as i64, target as i64 - (base as i64 + 4));
    }

    #[test]
    fn branch26_splices_shifted_displacement() {
        let mut word = 0u32.to_ne_bytes();
        let base = word.as_mut_ptr() as u64;
        let stencil = Stencil::new(
            word.to_vec(),
            vec![Hole {
                offset: 0,
                kind: HoleKind::Branch26,
                value: HoleValue::Target,
                symbol: 0,
                addend: 0,
            }],
        );
        let v: i64 = 4 * 1000; // 4-aligned displacement
        let target = (base as i64 + v) as u64;
        let patches = patches_with(HoleValue::Target, target);
        unsafe { relocate_stencil(&stencil, base as *mut u8, &patches) };
        let instr = u32::from_ne_bytes(word);
        assert_eq!(get_bits(instr as u64, 0, 26), 1000);
    }

    #[test]
    fn movw_chain_reconstructs_64_bit_value() {
        // Four MOVZ/MOVK-shaped words, hw fields 0..3 pre-set, reg field 0.
        let mut words = [0u32; 4];
        for (k, word) in words.iter_mut().enumerate() {
            *word = (k as u32) << 21;
        }
        let base = words.as_mut_ptr() as u64;
        let value: u64 = 0x1234_5678_9ABC_DEF0;
        let kinds = [
            HoleKind::MovwUabsG0,
            HoleKind::MovwUabsG1,
            HoleKind::MovwUabsG2,
            HoleKind::MovwUabsG3,
        ];
        let holes: Vec<Hole> = kinds
            .iter()
            .enumerate()
            .map(|(k, kind)| Hole {
                offset: k * 4,
                kind: *kind,
                value: HoleValue::Target,
                symbol: 0,
                addend: 0,
            })
            .collect();
        let stencil = Stencil::new(
            words.iter().flat_map(|w| w.to_ne_bytes()).collect::<Vec<u8>>(),
            holes,
        );
        let patches = patches_with(HoleValue::Target, value);
        unsafe { relocate_stencil(&stencil, base as *mut u8, &patches) };

        let mut reconstructed: u64 = 0;
        for k in 0..4 {
            let instr = unsafe { ((base as *const u32).add(k)).read_unaligned() };
            let chunk = get_bits(instr as u64, 5, 16) as u64;
            reconstructed |= chunk << (16 * k);
        }
        assert_eq!(reconstructed, value);
    }

    #[test]
    fn page21_and_pageoff12_together_reach_the_target() {
        // ADRP word (shift fields zeroed) followed by a real 64-bit
        // `ADD Xd, Xn, #imm12` encoding (sf=1, op=0, S=0, 10001 opcode,
        // immediate shift=0, imm12=0, Rn=0, Rd=0) — its `sf`/`op` fields at
        // bits [30..32] read back as 2, not 0, which is exactly the
        // encoding that would silently corrupt the low-12 immediate if the
        // ADD shift were (incorrectly) read from those bits instead of
        // being hardcoded to 0 for PAGEOFF12.
        let mut words = [0u32, 0x9100_0000];
        let base = words.as_mut_ptr() as u64;
        let target: u64 = base + 0x1234_5000 + 0x678;
        let holes = vec![
            Hole {
                offset: 0,
                kind: HoleKind::Page21,
                value: HoleValue::Target,
                symbol: 0,
                addend: 0,
            },
            Hole {
                offset: 4,
                kind: HoleKind::PageOff12,
                value: HoleValue::Target,
                symbol: 0,
                addend: 0,
            },
        ];
        let stencil = Stencil::new(
            words.iter().flat_map(|w| w.to_ne_bytes()).collect::<Vec<u8>>(),
            holes,
        );
        let patches = patches_with(HoleValue::Target, target);
        unsafe { relocate_stencil(&stencil, base as *mut u8, &patches) };

        let adrp = unsafe { (base as *const u32).read_unaligned() };
        let page_lo = get_bits(adrp as u64, 29, 2);
        let page_hi = get_bits(adrp as u64, 5, 19);
        let page = (page_hi as u64) << 2 | page_lo as u64;
        let expected_page =
            ((target as i64 >> 12) - (base as i64 >> 12)) as u64 & ((1 << 21) - 1);
        assert_eq!(page, expected_page);

        let add = unsafe { ((base as *const u32).add(1)).read_unaligned() };
        let imm12 = get_bits(add as u64, 10, 12);
        assert_eq!(imm12 as u64, target & 0xFFF);
    }

    #[test]
    fn ld64_pageoff12_reads_shift_from_ldr_size_field() {
        // A real `LDR X0, [X0, #imm12]` 64-bit-load encoding (size=11 at
        // bits [30..32], giving shift=3), reached directly rather than via
        // a successful ADRP+LDR relaxation — exercises the LDR/STR branch
        // of `relocate_pageoff12`, as distinct from the ADD branch above.
        let mut word = 0xF940_0000u32;
        let base = &mut word as *mut u32 as u64;
        let target: u64 = 0x18; // 8-aligned, encodes to imm12 field 3
        let stencil = Stencil::new(
            word.to_ne_bytes().to_vec(),
            vec![Hole {
                offset: 0,
                kind: HoleKind::Ld64GotLo12Nc,
                value: HoleValue::Target,
                symbol: 0,
                addend: 0,
            }],
        );
        let patches = patches_with(HoleValue::Target, target);
        unsafe { relocate_stencil_with(&stencil, base as *mut u8, &patches, false) };

        let instr = unsafe { (base as *const u32).read_unaligned() };
        let imm12 = get_bits(instr as u64, 10, 12);
        assert_eq!(imm12 as u64, target >> 3);
    }

    #[test]
    fn x86_got_relaxation_rewrites_mov_to_lea() {
        // `mov rax, [rip+0]` = 48 8B 05 <disp32>; preceded/at a writable buffer.
        let mut buf = vec![0x48u8, 0x8B, 0x05, 0, 0, 0, 0];
        let disp_offset = 3;
        let got_slot_container_offset = buf.len();
        // Append an 8-byte GOT slot holding the real target, preceded by 4
        // padding bytes so `value + 4` lands on the slot per the x86 formula.
        buf.extend_from_slice(&[0u8; 4]);
        let real_target_slot_offset = buf.len();
        buf.extend_from_slice(&0u64.to_ne_bytes());

        let base = buf.as_mut_ptr() as u64;
        let disp_loc = base + disp_offset as u64;
        let got_value_addr = base + got_slot_container_offset as u64;
        let real_target = disp_loc + 4 + 16; // comfortably in range
        unsafe {
            ((base as usize + real_target_slot_offset) as *mut u64)
                .write_unaligned(real_target);
        }

        let stencil = Stencil::new(
            buf.clone(),
            vec![Hole {
                offset: disp_offset,
                kind: HoleKind::GotPcRelX,
                value: HoleValue::Target,
                symbol: 0,
                addend: 0,
            }],
        );
        let patches = patches_with(HoleValue::Target, got_value_addr);
        unsafe { relocate_stencil(&stencil, base as *mut u8, &patches) };

        let rewritten = unsafe { std::slice::from_raw_parts(base as *const u8, buf.len()) };
        assert_eq!(&rewritten[1..3], &[0x8D, 0x05]);
    }

    #[test]
    fn aarch64_adrp_ldr_relaxation_collapses_to_movz() {
        // `adrp x0, :got:S` ; `ldr x0, [x0, #:got_lo12:S]`, reg field (bits
        // [0..5]) and LDR's Rn/Rt fields (bits [5..10], [0..5]) all zero.
        let mut words: [u32; 2] = [0x9000_0000, 0xF940_0000];
        let base = words.as_mut_ptr() as u64;

        // GOT slot: an 8-byte value the relaxation reads directly from
        // `value` (not `value + 4`, unlike the x86-64 relaxation).
        let mut got_slot: u64 = 0x1234;
        let value = &mut got_slot as *mut u64 as u64;

        let stencil = Stencil::new(
            words.iter().flat_map(|w| w.to_ne_bytes()).collect::<Vec<u8>>(),
            vec![
                Hole {
                    offset: 0,
                    kind: HoleKind::AdrGotPage,
                    value: HoleValue::Target,
                    symbol: 0,
                    addend: 0,
                },
                Hole {
                    offset: 4,
                    kind: HoleKind::Ld64GotLo12Nc,
                    value: HoleValue::Target,
                    symbol: 0,
                    addend: 0,
                },
            ],
        );
        let patches = patches_with(HoleValue::Target, value);
        unsafe { relocate_stencil(&stencil, base as *mut u8, &patches) };

        let movz = unsafe { (base as *const u32).read_unaligned() };
        let nop = unsafe { ((base as *const u32).add(1)).read_unaligned() };
        assert_eq!(movz, 0xD280_0000 | (0x1234 << 5));
        assert_eq!(nop, 0xD503_201F);

        // Keep `got_slot` alive until after the unsafe reads above.
        std::hint::black_box(&got_slot);
    }
}
