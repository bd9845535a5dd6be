//! The trace compiler (§4.5) and release (§4.6) — the top-level driver that
//! walks a trace, allocates one region, emits every stencil into it, flips
//! it executable, and publishes the result onto the executor handle.

use crate::config::CompileOptions;
use crate::error::CompileError;
use crate::executor::ExecutorHandle;
use crate::hole::HoleValue;
use crate::page::{self, PageRegion};
use crate::stencil;
use crate::stencil_table::{self, StencilTable};
use crate::trace::{opcode, Format, UopInstruction};

/// Compile `trace` against `table` and publish the result onto `executor`.
///
/// On success, `executor.jit_code`/`jit_side_entry`/`jit_size` are set and
/// this returns `Ok(())` (the crate's equivalent of the documented `0`
/// return). On failure, `executor` is left unchanged and a warning has
/// already been logged by the page allocator, if that's where the failure
/// originated (the crate's equivalent of `-1`).
pub fn compile(
    options: &CompileOptions,
    table: &StencilTable,
    executor: &mut ExecutorHandle,
    trace: &[UopInstruction],
) -> Result<(), CompileError> {
    if trace.is_empty()
        || !matches!(trace[0].opcode, opcode::START_EXECUTOR | opcode::COLD_EXIT)
    {
        return Err(CompileError::InvalidEntry);
    }

    log::debug!(
        "JIT compiling trace of {} uops, entry {}",
        trace.len(),
        stencil_table::opcode_name(trace[0].opcode)
    );

    let (instruction_starts, code_size, data_size) = size_pass(table, trace);

    let total_unpadded = code_size + data_size;
    let total_size = page::round_up_to_page(total_unpadded.max(1) as usize);

    let region = page::allocate(total_size)?;

    // SAFETY: `region` is a fresh RW allocation of at least `total_size`
    // bytes that nothing else can observe yet.
    let result = unsafe {
        emit_all(
            options,
            table,
            executor,
            trace,
            &instruction_starts,
            &region,
            code_size,
            data_size,
        )
    };

    match result {
        Ok(()) => {
            if let Err(err) = page::mark_executable(&region) {
                let _ = page::free(region);
                return Err(err.into());
            }
            let code_base = region.base();
            // SAFETY: trampoline body size was included in the size pass;
            // code_base + that offset is within the region.
            let side_entry = unsafe { code_base.add(table.trampoline.code.body_size()) };
            // `PageRegion` has no `Drop` impl — ownership of the raw pages
            // now lives on `executor`, reclaimed later via `free`.
            executor.publish(code_base, side_entry, region.size());
            Ok(())
        }
        Err(err) => {
            let _ = page::free(region);
            Err(err)
        }
    }
}

/// Size pass: compute each uop's code offset and the total code/data sizes,
/// including the trampoline (prepended) and fatal-error group (appended).
///
/// `instruction_starts` is sized `trace.len() + 2` so that
/// `instruction_starts[1]` is always defined, resolving the open question in
/// §9: index 1 is the offset of the first uop *after* the mandatory
/// `START_EXECUTOR`/`COLD_EXIT` entry at index 0; for a trace with no such
/// uop (`trace.len() == 1`), it aliases the fatal-error group's start.
fn size_pass(table: &StencilTable, trace: &[UopInstruction]) -> (Vec<u32>, u64, u64) {
    let mut instruction_starts = vec![0u32; trace.len() + 2];
    let mut code_size: u64 = table.trampoline.code.body_size() as u64;
    let mut data_size: u64 = table.trampoline.data.body_size() as u64;

    for (i, uop) in trace.iter().enumerate() {
        instruction_starts[i] = code_size as u32;
        let group = table.group_for(uop.opcode);
        code_size += group.code.body_size() as u64;
        data_size += group.data.body_size() as u64;
    }

    // One-past-the-end sentinel: the fatal-error group's start. Also serves
    // as instruction_starts[1] for single-entry traces.
    instruction_starts[trace.len()] = code_size as u32;
    if trace.len() + 1 < instruction_starts.len() {
        instruction_starts[trace.len() + 1] = code_size as u32;
    }

    code_size += table.fatal_error.code.body_size() as u64;
    data_size += table.fatal_error.data.body_size() as u64;

    (instruction_starts, code_size, data_size)
}

/// Emit the trampoline, every uop's stencil group, and the fatal-error tail
/// guard into `region`.
///
/// # Safety
///
/// `region` must be a freshly allocated, exclusively owned RW region of at
/// least `code_size + data_size` (rounded up to a page) bytes.
unsafe fn emit_all(
    options: &CompileOptions,
    table: &StencilTable,
    executor: &ExecutorHandle,
    trace: &[UopInstruction],
    instruction_starts: &[u32],
    region: &PageRegion,
    code_size: u64,
    data_size: u64,
) -> Result<(), CompileError> {
    let code_base = region.base() as u64;
    let data_base = code_base + code_size;
    let executor_ptr = executor as *const ExecutorHandle as u64;

    let mut code_cursor = code_base;
    let mut data_cursor = data_base;

    // Emit trampoline.
    let trampoline_size = table.trampoline.code.body_size() as u64;
    let top = code_base + trampoline_size;
    let mut patches = stencil::base_patches(code_base, data_base, code_base + trampoline_size, executor_ptr);
    patches.set(HoleValue::Top, top);
    stencil::emit(
        &table.trampoline,
        &patches,
        code_cursor as *mut u8,
        data_cursor as *mut u8,
        options.enable_relaxations,
    );
    code_cursor += trampoline_size;
    data_cursor += table.trampoline.data.body_size() as u64;

    // Emit body.
    for (i, uop) in trace.iter().enumerate() {
        let group = table.group_for(uop.opcode);
        let continue_addr = code_cursor + group.code.body_size() as u64;

        let mut patches =
            stencil::base_patches(code_cursor, data_cursor, continue_addr, executor_ptr);
        patches.set(HoleValue::Top, code_base + instruction_starts[1] as u64);
        patches.set(HoleValue::Oparg, uop.oparg as u64);

        #[cfg(target_pointer_width = "32")]
        {
            patches.set(HoleValue::OperandHi, uop.operand >> 32);
            patches.set(HoleValue::OperandLo, uop.operand & 0xFFFF_FFFF);
        }
        #[cfg(not(target_pointer_width = "32"))]
        {
            patches.set(HoleValue::Operand, uop.operand);
        }

        // `uop.format` is the documented source of truth for which
        // branch-related patches to populate — it is not re-derived from
        // the opcode here, so a caller can drive a uop through a
        // differently shaped stencil group than `stencil_table`'s own
        // default mapping would pick.
        match uop.format {
            Format::Target => {
                patches.set(HoleValue::Target, uop.target as u64);
            }
            Format::Exit => {
                if uop.exit_index >= executor.exit_count() {
                    return Err(CompileError::TargetOutOfRange {
                        index: i,
                        what: "exit_index",
                        target: uop.exit_index,
                    });
                }
                patches.set(HoleValue::ExitIndex, uop.exit_index as u64);
                if uop.has_error_target(trace.len()) {
                    let target = uop.error_target as usize;
                    if target >= instruction_starts.len() {
                        return Err(CompileError::TargetOutOfRange {
                            index: i,
                            what: "error_target",
                            target: uop.error_target,
                        });
                    }
                    patches.set(HoleValue::ErrorTarget, code_base + instruction_starts[target] as u64);
                }
            }
            Format::Jump => {
                let target = uop.jump_target as usize;
                if target >= trace.len() {
                    return Err(CompileError::TargetOutOfRange {
                        index: i,
                        what: "jump_target",
                        target: uop.jump_target,
                    });
                }
                patches.set(HoleValue::JumpTarget, code_base + instruction_starts[target] as u64);
                if uop.has_error_target(trace.len()) {
                    let target = uop.error_target as usize;
                    if target >= instruction_starts.len() {
                        return Err(CompileError::TargetOutOfRange {
                            index: i,
                            what: "error_target",
                            target: uop.error_target,
                        });
                    }
                    patches.set(HoleValue::ErrorTarget, code_base + instruction_starts[target] as u64);
                }
            }
        }

        stencil::emit(
            group,
            &patches,
            code_cursor as *mut u8,
            data_cursor as *mut u8,
            options.enable_relaxations,
        );
        code_cursor += group.code.body_size() as u64;
        data_cursor += group.data.body_size() as u64;
    }

    // Emit tail guard: CODE = CONTINUE = TOP = code_cursor, DATA = data_cursor.
    let mut patches = stencil::base_patches(code_cursor, data_cursor, code_cursor, executor_ptr);
    patches.set(HoleValue::Top, code_cursor);
    stencil::emit(
        &table.fatal_error,
        &patches,
        code_cursor as *mut u8,
        data_cursor as *mut u8,
        options.enable_relaxations,
    );
    code_cursor += table.fatal_error.code.body_size() as u64;
    data_cursor += table.fatal_error.data.body_size() as u64;

    debug_assert_eq!(code_cursor, data_base, "code cursor must reach data_base exactly");
    debug_assert_eq!(
        data_cursor,
        data_base + data_size,
        "data cursor must reach the end of the data half exactly"
    );

    Ok(())
}

/// `free(executor)`: release the compiled region and clear the handle.
/// Idempotent — calling this on an already-cleared handle is a no-op.
pub fn free(executor: &mut ExecutorHandle) {
    let Some((jit_code, jit_size)) = executor.take() else {
        return;
    };

    // SAFETY: `jit_code`/`jit_size` were published by a prior successful
    // `compile`, which took ownership of exactly that many bytes from the
    // page allocator.
    let region = unsafe { PageRegion::from_raw(jit_code, jit_size) };
    if let Err(err) = page::free(region) {
        log::warn!("JIT free failed after clearing executor state: {err}");
    }
}
