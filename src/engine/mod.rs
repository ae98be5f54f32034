//! Dynamic Execution Engine
//!
//! The engine turns compiled units into directly callable machine code on
//! demand, invokes named entry points, resolves external symbol references
//! lazily through a fallback chain, and guarantees one-time execution of a
//! unit's global initialization routines.
//!
//! # Modules
//!
//! - [`executor`]: the engine adapter driving the whole call protocol
//! - [`context`]: shared symbol namespace, resolver chain and unresolved
//!   ledger
//! - [`backend`]: Cranelift-backed code generation and per-call emission
//!   arenas
//! - `emission`: the per-call record enabling reverse-order rollback
//! - [`statics`]: the exactly-once constructor and repeatable destructor
//!   runner
//! - [`error`]: engine error types

pub mod backend;
pub mod context;
pub(crate) mod emission;
pub mod error;
pub mod executor;
pub mod statics;

pub use backend::{EngineConfig, OptLevel};
pub use context::{unresolved_symbol_trap, FallbackResolver, RuntimeContext, SymbolAddr};
pub use error::{EngineError, EngineResult};
pub use executor::{
    ExecStatus, Executor, EngineStats, ReturnSlot, MANAGED_EXIT_HOOK, PROCESS_EXIT_HOOK,
};
