//! A representative stencil table, standing in for the offline stencil
//! builder's output (§9 Design Notes: "may keep this as a statically
//! linked constant array"). Hand-assembled here instead of generated,
//! since this crate does not include the offline tool — it is scaffolding
//! to exercise the relocation engine end-to-end, not the uop set of any
//! particular interpreter (§1 scopes the stencil builder as external).

use crate::hole::{Hole, HoleKind, HoleValue};
use crate::stencil::{Stencil, StencilGroup};
use crate::trace::Format;

/// Opcode tags for the small closed uop set this table knows about.
pub mod opcode {
    pub const NOP: u16 = 0;
    pub const LOAD_CONST: u16 = 1;
    pub const BINARY_ADD: u16 = 2;
    pub const COMPARE_LT: u16 = 3;
    pub const GUARD_IS_TRUTHY: u16 = 4;
    pub const JUMP_BACKWARD: u16 = 5;
    pub const RETURN: u16 = 6;
    pub const CALL_HELPER: u16 = 7;
    pub const COUNT: usize = 8;
}

/// Per-opcode format, matching the shape each stencil group below expects.
/// Not consulted by the compiler — `UopInstruction::format` (§3) is the
/// documented source of truth there, since a caller is free to drive a uop
/// through a differently shaped stencil group than this table's own
/// default opcode mapping would pick. This exists purely as a convenience
/// for building a correctly tagged `UopInstruction` for one of this
/// table's own opcodes.
pub fn format_for(opcode: u16) -> Format {
    match opcode {
        self::opcode::GUARD_IS_TRUTHY => Format::Exit,
        self::opcode::JUMP_BACKWARD => Format::Jump,
        _ => Format::Target,
    }
}

/// Human-readable opcode names, built once and consulted only on the cold
/// diagnostic-logging path (never per-uop) — the same `rustc_hash` instinct
/// noted on [`crate::hole::HoleValue`].
fn opcode_names() -> &'static rustc_hash::FxHashMap<u16, &'static str> {
    use std::sync::OnceLock;
    static NAMES: OnceLock<rustc_hash::FxHashMap<u16, &'static str>> = OnceLock::new();
    NAMES.get_or_init(|| {
        let mut map = rustc_hash::FxHashMap::default();
        map.insert(self::opcode::NOP, "NOP");
        map.insert(self::opcode::LOAD_CONST, "LOAD_CONST");
        map.insert(self::opcode::BINARY_ADD, "BINARY_ADD");
        map.insert(self::opcode::COMPARE_LT, "COMPARE_LT");
        map.insert(self::opcode::GUARD_IS_TRUTHY, "GUARD_IS_TRUTHY");
        map.insert(self::opcode::JUMP_BACKWARD, "JUMP_BACKWARD");
        map.insert(self::opcode::RETURN, "RETURN");
        map.insert(self::opcode::CALL_HELPER, "CALL_HELPER");
        map.insert(crate::trace::opcode::START_EXECUTOR, "START_EXECUTOR");
        map.insert(crate::trace::opcode::COLD_EXIT, "COLD_EXIT");
        map
    })
}

/// Name an opcode for a log line; unrecognized tags fall back to `"?"`.
pub fn opcode_name(opcode: u16) -> &'static str {
    opcode_names().get(&opcode).copied().unwrap_or("?")
}

/// The flat, opcode-indexed table plus the two distinguished groups not
/// tied to any opcode.
pub struct StencilTable {
    groups: Box<[StencilGroup]>,
    pub trampoline: StencilGroup,
    pub fatal_error: StencilGroup,
    /// The group for `trace[0]` when it is a normal entry; carries no code
    /// of its own (zero-size, no holes) — the first *real* uop is whatever
    /// follows it, which is exactly what makes `instruction_starts[1]` the
    /// right "first real uop" offset regardless of trace length (§9).
    start_executor: StencilGroup,
    /// As `start_executor`, for the cold-exit entry tag.
    cold_exit: StencilGroup,
}

impl StencilTable {
    /// Look up the group for `opcode`, including the two auxiliary entry
    /// tags (§6) that only ever appear at `trace[0]`.
    pub fn group_for(&self, opcode: u16) -> &StencilGroup {
        use crate::trace::opcode as tag;
        match opcode {
            tag::START_EXECUTOR => &self.start_executor,
            tag::COLD_EXIT => &self.cold_exit,
            _ => &self.groups[opcode as usize],
        }
    }
}

fn entry_marker_group() -> StencilGroup {
    StencilGroup {
        code: Stencil::new(Vec::new(), Vec::new()),
        data: empty_data(),
    }
}

/// Build the table for the host's target architecture.
pub fn build() -> StencilTable {
    #[cfg(target_arch = "aarch64")]
    {
        aarch64::build()
    }
    #[cfg(all(target_arch = "x86_64", not(target_arch = "aarch64")))]
    {
        x86_64::build()
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        fallback::build()
    }
}

fn empty_data() -> Stencil {
    Stencil::new(Vec::new(), Vec::new())
}

mod x86_64 {
    use super::*;

    pub fn build() -> StencilTable {
        let mut groups = Vec::with_capacity(opcode::COUNT);
        groups.push(nop());
        groups.push(load_const());
        groups.push(binary_add());
        groups.push(compare_lt());
        groups.push(guard_is_truthy());
        groups.push(jump_backward());
        groups.push(ret());
        groups.push(call_helper());

        StencilTable {
            groups: groups.into_boxed_slice(),
            trampoline: trampoline(),
            fatal_error: fatal_error(),
            start_executor: entry_marker_group(),
            cold_exit: entry_marker_group(),
        }
    }

    /// The native and JIT calling conventions coincide on this target, so
    /// the trampoline's body is empty (§4.5).
    fn trampoline() -> StencilGroup {
        StencilGroup {
            code: Stencil::new(Vec::new(), Vec::new()),
            data: empty_data(),
        }
    }

    fn nop() -> StencilGroup {
        StencilGroup {
            code: Stencil::new(vec![0x90], Vec::new()), // nop
            data: empty_data(),
        }
    }

    fn ret() -> StencilGroup {
        StencilGroup {
            code: Stencil::new(vec![0xC3], Vec::new()), // ret
            data: empty_data(),
        }
    }

    /// `movabs rax, OPERAND` ; `jmp rel32 CONTINUE`.
    fn load_const() -> StencilGroup {
        let code = vec![
            0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0, // movabs rax, imm64
            0xE9, 0, 0, 0, 0, // jmp rel32
        ];
        let holes = vec![
            Hole {
                offset: 2,
                kind: HoleKind::Unsigned,
                value: HoleValue::Operand,
                symbol: 0,
                addend: 0,
            },
            Hole {
                offset: 11,
                kind: HoleKind::Rel32,
                value: HoleValue::Continue,
                symbol: 0,
                addend: 0,
            },
        ];
        StencilGroup {
            code: Stencil::new(code, holes),
            data: empty_data(),
        }
    }

    /// `add rax, rbx` ; `jmp rel32 CONTINUE`.
    fn binary_add() -> StencilGroup {
        let code = vec![0x48, 0x01, 0xD8, 0xE9, 0, 0, 0, 0];
        let holes = vec![Hole {
            offset: 4,
            kind: HoleKind::Rel32,
            value: HoleValue::Continue,
            symbol: 0,
            addend: 0,
        }];
        StencilGroup {
            code: Stencil::new(code, holes),
            data: empty_data(),
        }
    }

    /// `cmp rax, rbx` ; `setl al` ; `jmp rel32 CONTINUE`.
    fn compare_lt() -> StencilGroup {
        let code = vec![0x48, 0x39, 0xD8, 0x0F, 0x9C, 0xC0, 0xE9, 0, 0, 0, 0];
        let holes = vec![Hole {
            offset: 7,
            kind: HoleKind::Rel32,
            value: HoleValue::Continue,
            symbol: 0,
            addend: 0,
        }];
        StencilGroup {
            code: Stencil::new(code, holes),
            data: empty_data(),
        }
    }

    /// `test rax, rax` ; `jnz rel32 CONTINUE` ; `jmp rel32 ERROR_TARGET`.
    /// Data half records the exit index for the executor's side-exit table.
    fn guard_is_truthy() -> StencilGroup {
        let code = vec![
            0x48, 0x85, 0xC0, // test rax, rax
            0x0F, 0x85, 0, 0, 0, 0, // jnz rel32 CONTINUE
            0xE9, 0, 0, 0, 0, // jmp rel32 ERROR_TARGET
        ];
        let holes = vec![
            Hole {
                offset: 5,
                kind: HoleKind::Rel32,
                value: HoleValue::Continue,
                symbol: 0,
                addend: 0,
            },
            Hole {
                offset: 10,
                kind: HoleKind::Rel32,
                value: HoleValue::ErrorTarget,
                symbol: 0,
                addend: 0,
            },
        ];
        let data = vec![0u8; 4];
        let data_holes = vec![Hole {
            offset: 0,
            kind: HoleKind::Dir32,
            value: HoleValue::ExitIndex,
            symbol: 0,
            addend: 0,
        }];
        StencilGroup {
            code: Stencil::new(code, holes),
            data: Stencil::new(data, data_holes),
        }
    }

    /// `jmp rel32 JUMP_TARGET`.
    fn jump_backward() -> StencilGroup {
        let code = vec![0xE9, 0, 0, 0, 0];
        let holes = vec![Hole {
            offset: 1,
            kind: HoleKind::Rel32,
            value: HoleValue::JumpTarget,
            symbol: 0,
            addend: 0,
        }];
        StencilGroup {
            code: Stencil::new(code, holes),
            data: empty_data(),
        }
    }

    /// `mov rdi, EXECUTOR` ; `call [rip+0]` (GOT-indirect, relaxation-eligible)
    /// ; `jmp rel32 CONTINUE`.
    ///
    /// There being no real runtime helper table in this illustrative crate
    /// (§1: the stencil builder that would normally bake in such symbols is
    /// external), the "GOT slot" is instead a 12-byte data-half pointer cell
    /// that this crate fills in with `CONTINUE` — a real, nearby address
    /// always reachable from the call site. That keeps the slot's contents
    /// non-trivial (not just a zeroed, never-fired stand-in) and, because
    /// `CONTINUE` sits inside the same freshly mapped region, the resulting
    /// displacement is always in range, so the relaxation actually fires.
    fn call_helper() -> StencilGroup {
        let code = vec![
            0x48, 0xBF, 0, 0, 0, 0, 0, 0, 0, 0, // movabs rdi, EXECUTOR
            0xFF, 0x15, 0, 0, 0, 0, // call [rip+disp32]
            0xE9, 0, 0, 0, 0, // jmp rel32 CONTINUE
        ];
        let holes = vec![
            Hole {
                offset: 2,
                kind: HoleKind::Unsigned,
                value: HoleValue::Executor,
                symbol: 0,
                addend: 0,
            },
            Hole {
                offset: 12,
                kind: HoleKind::RexGotPcRelX,
                value: HoleValue::Data,
                symbol: 0,
                addend: 0,
            },
            Hole {
                offset: 17,
                kind: HoleKind::Rel32,
                value: HoleValue::Continue,
                symbol: 0,
                addend: 0,
            },
        ];
        // 4 bytes of padding (the x86-64 GOTPCRELX addend convention: the
        // pointer cell sits 4 bytes past the hole's resolved `value`)
        // followed by the 8-byte pointer cell itself, filled with `CONTINUE`.
        let data = vec![0u8; 12];
        let data_holes = vec![Hole {
            offset: 4,
            kind: HoleKind::Unsigned,
            value: HoleValue::Continue,
            symbol: 0,
            addend: 0,
        }];
        StencilGroup {
            code: Stencil::new(code, holes),
            data: Stencil::new(data, data_holes),
        }
    }

    /// `ud2` — traps any accidental fall-through past the last uop.
    fn fatal_error() -> StencilGroup {
        StencilGroup {
            code: Stencil::new(vec![0x0F, 0x0B], Vec::new()),
            data: empty_data(),
        }
    }
}

mod aarch64 {
    use super::*;

    pub fn build() -> StencilTable {
        let mut groups = Vec::with_capacity(opcode::COUNT);
        groups.push(nop());
        groups.push(load_const());
        groups.push(binary_add());
        groups.push(compare_lt());
        groups.push(guard_is_truthy());
        groups.push(jump_backward());
        groups.push(ret());
        groups.push(call_helper());

        StencilTable {
            groups: groups.into_boxed_slice(),
            trampoline: trampoline(),
            fatal_error: fatal_error(),
            start_executor: entry_marker_group(),
            cold_exit: entry_marker_group(),
        }
    }

    fn trampoline() -> StencilGroup {
        StencilGroup {
            code: Stencil::new(Vec::new(), Vec::new()),
            data: empty_data(),
        }
    }

    fn word(bytes: u32) -> [u8; 4] {
        bytes.to_le_bytes()
    }

    fn nop() -> StencilGroup {
        StencilGroup {
            code: Stencil::new(word(0xD503201F).to_vec(), Vec::new()), // nop
            data: empty_data(),
        }
    }

    fn ret() -> StencilGroup {
        StencilGroup {
            code: Stencil::new(word(0xD65F03C0).to_vec(), Vec::new()), // ret
            data: empty_data(),
        }
    }

    /// `movz x0, OPERAND[0:16]` ; `movk x0, OPERAND[16:32], lsl 16` ;
    /// `movk x0, OPERAND[32:48], lsl 32` ; `movk x0, OPERAND[48:64], lsl 48` ;
    /// `b CONTINUE`.
    fn load_const() -> StencilGroup {
        let mut code = Vec::new();
        code.extend_from_slice(&word(0xD2800000)); // movz x0, #0, hw=0
        code.extend_from_slice(&word(0xF2A00000)); // movk x0, #0, hw=1
        code.extend_from_slice(&word(0xF2C00000)); // movk x0, #0, hw=2
        code.extend_from_slice(&word(0xF2E00000)); // movk x0, #0, hw=3
        code.extend_from_slice(&word(0x14000000)); // b #0

        let holes = vec![
            Hole { offset: 0, kind: HoleKind::MovwUabsG0, value: HoleValue::Operand, symbol: 0, addend: 0 },
            Hole { offset: 4, kind: HoleKind::MovwUabsG1, value: HoleValue::Operand, symbol: 0, addend: 0 },
            Hole { offset: 8, kind: HoleKind::MovwUabsG2, value: HoleValue::Operand, symbol: 0, addend: 0 },
            Hole { offset: 12, kind: HoleKind::MovwUabsG3, value: HoleValue::Operand, symbol: 0, addend: 0 },
            Hole { offset: 16, kind: HoleKind::Branch26, value: HoleValue::Continue, symbol: 0, addend: 0 },
        ];
        StencilGroup {
            code: Stencil::new(code, holes),
            data: empty_data(),
        }
    }

    /// `add x0, x0, x1` ; `b CONTINUE`.
    fn binary_add() -> StencilGroup {
        let mut code = Vec::new();
        code.extend_from_slice(&word(0x8B010000)); // add x0, x0, x1
        code.extend_from_slice(&word(0x14000000)); // b #0
        let holes = vec![Hole {
            offset: 4,
            kind: HoleKind::Branch26,
            value: HoleValue::Continue,
            symbol: 0,
            addend: 0,
        }];
        StencilGroup {
            code: Stencil::new(code, holes),
            data: empty_data(),
        }
    }

    /// `cmp x0, x1` ; `cset x0, lt` ; `b CONTINUE`.
    fn compare_lt() -> StencilGroup {
        let mut code = Vec::new();
        code.extend_from_slice(&word(0xEB01001F)); // cmp x0, x1
        code.extend_from_slice(&word(0x9A9FA7E0)); // cset x0, lt
        code.extend_from_slice(&word(0x14000000)); // b #0
        let holes = vec![Hole {
            offset: 8,
            kind: HoleKind::Branch26,
            value: HoleValue::Continue,
            symbol: 0,
            addend: 0,
        }];
        StencilGroup {
            code: Stencil::new(code, holes),
            data: empty_data(),
        }
    }

    /// `cbnz x0, CONTINUE` ; `b ERROR_TARGET`.
    fn guard_is_truthy() -> StencilGroup {
        let mut code = Vec::new();
        code.extend_from_slice(&word(0xB5000000)); // cbnz x0, #0
        code.extend_from_slice(&word(0x14000000)); // b #0
        let holes = vec![
            Hole { offset: 0, kind: HoleKind::Branch26, value: HoleValue::Continue, symbol: 0, addend: 0 },
            Hole { offset: 4, kind: HoleKind::Branch26, value: HoleValue::ErrorTarget, symbol: 0, addend: 0 },
        ];
        let data = vec![0u8; 4];
        let data_holes = vec![Hole {
            offset: 0,
            kind: HoleKind::Dir32,
            value: HoleValue::ExitIndex,
            symbol: 0,
            addend: 0,
        }];
        StencilGroup {
            code: Stencil::new(code, holes),
            data: Stencil::new(data, data_holes),
        }
    }

    /// `b JUMP_TARGET`.
    fn jump_backward() -> StencilGroup {
        let code = word(0x14000000).to_vec();
        let holes = vec![Hole {
            offset: 0,
            kind: HoleKind::Branch26,
            value: HoleValue::JumpTarget,
            symbol: 0,
            addend: 0,
        }];
        StencilGroup {
            code: Stencil::new(code, holes),
            data: empty_data(),
        }
    }

    /// `adrp x0, :got:helper` ; `ldr x0, [x0, :got_lo12:helper]` (relaxation-
    /// eligible pair) ; `blr x0` ; `b CONTINUE`.
    ///
    /// As the x86-64 table's `call_helper`, the data half stands in for a
    /// GOT slot (see its comment for why) and is filled with `CONTINUE` — a
    /// real, nearby address, so the slot is non-trivial and the relaxation's
    /// displacement is always in range.
    fn call_helper() -> StencilGroup {
        let mut code = Vec::new();
        code.extend_from_slice(&word(0x90000000)); // adrp x0, #0
        code.extend_from_slice(&word(0xF9400000)); // ldr x0, [x0, #0]
        code.extend_from_slice(&word(0xD63F0000)); // blr x0
        code.extend_from_slice(&word(0x14000000)); // b #0
        let holes = vec![
            Hole { offset: 0, kind: HoleKind::AdrGotPage, value: HoleValue::Data, symbol: 0, addend: 0 },
            Hole { offset: 4, kind: HoleKind::Ld64GotLo12Nc, value: HoleValue::Data, symbol: 0, addend: 0 },
            Hole { offset: 12, kind: HoleKind::Branch26, value: HoleValue::Continue, symbol: 0, addend: 0 },
        ];
        // The AArch64 GOT convention reads the pointer directly at `value`
        // (no +4 offset, unlike x86-64's GOTPCRELX).
        let data = vec![0u8; 8];
        let data_holes = vec![Hole {
            offset: 0,
            kind: HoleKind::Unsigned,
            value: HoleValue::Continue,
            symbol: 0,
            addend: 0,
        }];
        StencilGroup {
            code: Stencil::new(code, holes),
            data: Stencil::new(data, data_holes),
        }
    }

    /// `brk #0` — traps any accidental fall-through.
    fn fatal_error() -> StencilGroup {
        StencilGroup {
            code: Stencil::new(word(0xD4200000).to_vec(), Vec::new()),
            data: empty_data(),
        }
    }
}

/// Minimal, non-functional bodies for hosts that are neither x86-64 nor
/// AArch64. `compile` on such a host still runs the size/allocate/emit
/// pipeline; `page::allocate` itself errors with `UnsupportedPlatform` on
/// non-Unix targets, which is where this crate actually declines to run.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod fallback {
    use super::*;

    pub fn build() -> StencilTable {
        let trivial = || StencilGroup {
            code: Stencil::new(Vec::new(), Vec::new()),
            data: empty_data(),
        };
        let groups: Vec<StencilGroup> = (0..opcode::COUNT).map(|_| trivial()).collect();
        StencilTable {
            groups: groups.into_boxed_slice(),
            trampoline: trivial(),
            fatal_error: trivial(),
            start_executor: trivial(),
            cold_exit: trivial(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_every_opcode() {
        let table = build();
        for op in 0..opcode::COUNT as u16 {
            let _ = table.group_for(op);
        }
    }

    #[test]
    fn format_for_matches_the_groups_that_use_branch_metadata() {
        assert_eq!(format_for(opcode::GUARD_IS_TRUTHY), Format::Exit);
        assert_eq!(format_for(opcode::JUMP_BACKWARD), Format::Jump);
        assert_eq!(format_for(opcode::NOP), Format::Target);
    }
}
