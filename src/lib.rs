//! Copy-and-patch JIT backend
//!
//! This crate implements the stencil linker and trace compiler of a
//! bytecode-interpreter runtime: it splices precompiled machine-code
//! templates ("stencils") into a freshly allocated page, performs
//! architecture-specific relocation math to fill in their symbolic holes,
//! and flips the page executable.
//!
//! What this crate does *not* do, by design:
//! - produce the uop trace (an upstream tracing tier's job)
//! - compile each uop's stencil from source (an offline build-time tool's
//!   job — [`stencil_table`] ships a representative table in its place)
//! - own the executor object's reference counting, GC, or thread state
//!   (the host runtime's job — see [`executor::ExecutorHandle`])
//!
//! # Example
//!
//! ```rust,ignore
//! use patchjit::{compiler, config::CompileOptions, executor::ExecutorHandle, stencil_table};
//!
//! let options = CompileOptions::default();
//! let table = stencil_table::build();
//! let mut executor = ExecutorHandle::new(0);
//!
//! compiler::compile(&options, &table, &mut executor, &trace)?;
//! // ... enter executor.jit_code() ...
//! compiler::free(&mut executor);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Bit-splicer: the two primitives for reading/writing instruction-encoded
/// bitfields.
pub mod bits;

/// Compile-time configuration (relaxation toggles).
pub mod config;

/// The top-level trace compiler and release entry points.
pub mod compiler;

/// Error and warning taxonomy.
pub mod error;

/// The executor handle: the host-owned object a compiled trace attaches to.
pub mod executor;

/// Hole/patch-vector data model.
pub mod hole;

/// Page allocator: anonymous executable memory and permission transitions.
pub mod page;

/// The relocation engine and its two peephole relaxations.
pub mod reloc;

/// Stencil/stencil-group data model and the stencil emitter.
pub mod stencil;

/// A representative, hand-assembled stencil table standing in for the
/// offline stencil builder's output.
pub mod stencil_table;

/// Uop trace data model.
pub mod trace;

pub use compiler::{compile, free};
pub use config::CompileOptions;
pub use error::{CompileError, OsCode, PageError};
pub use executor::ExecutorHandle;
pub use hole::{Hole, HoleKind, HoleValue, PatchVector};
pub use stencil::{Stencil, StencilGroup};
pub use trace::{opcode, Format, UopInstruction};
