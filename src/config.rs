//! Compile-time configuration for the trace compiler.
//!
//! Mirrors the teacher crate's `JitConfig` / `PrewarmConfig` shape: a plain
//! struct with a `Default` impl, threaded through the top-level entry point
//! rather than pulled from global state.

/// Options controlling the trace compiler and relocation engine.
#[derive(Debug, Clone, Copy)]
pub struct CompileOptions {
    /// Enable the x86-64 GOT-load and AArch64 ADRP+LDR relaxations (§4.3).
    ///
    /// Disabling this is useful when debugging a suspected relaxation bug:
    /// every hole then takes its non-relaxed encoding path.
    pub enable_relaxations: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            enable_relaxations: true,
        }
    }
}
