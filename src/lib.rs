/// Ignitron - Dynamic Execution Engine Library
///
/// This library provides the dynamic code execution and symbol-resolution
/// core of an interactive compiled-language runtime: the component that
/// turns an in-memory compiled unit into directly callable machine code on
/// demand, invokes named entry points inside it, resolves the external
/// symbol references the generated code needs, and guarantees one-time
/// execution of a unit's global initialization routines.
///
/// # Architecture
///
/// Execution flows through two layers:
///
/// 1. **Compiled units** (`unit` module)
///    - Named functions in a small expression IR, produced by a front end
///    - Scalar, unit and aggregate (caller-storage) return conventions
///    - Well-known global constructor and destructor lists
///    - Structural validation and diagnostic text dumps
///
/// 2. **Execution engine** (`engine` module)
///    - Lazily created Cranelift backend, one instance per engine lifetime
///    - Per-call emission arenas: machine code is regenerated for each
///      entry-point call and freed afterwards, keeping memory bounded over
///      a long interactive session
///    - Lazy symbol resolution through a shared runtime context: registered
///      symbols first, then an append-only chain of fallback resolvers, in
///      order, first non-null answer wins
///    - Deferred failure: every symbol that defeats the chain is recorded
///      in a ledger and bound to a terminal stub so one compilation surfaces
///      all unresolved names; the call is blocked and rolled back before
///      dispatch, and only that call is affected
///    - Exactly-once global constructor runs, guarded by a re-entrancy flag
///      and by removal of the constructor list after a successful run
///
/// # Example
///
/// ```rust
/// use ignitron::{CodeUnit, Executor, ExecStatus, Expr, FunctionDef, ReturnSlot};
///
/// let unit = CodeUnit::builder("demo")
///     .function(FunctionDef::scalar(
///         "addTwo",
///         0,
///         vec![Expr::add(Expr::Const(40), Expr::Const(2))],
///     ))
///     .build();
///
/// let mut executor = Executor::new();
/// executor.load_unit(unit);
///
/// let mut out = 0i64;
/// let status = executor
///     .execute_entry_point("addTwo", ReturnSlot::Scalar(&mut out))
///     .unwrap();
/// assert_eq!(status, ExecStatus::Success);
/// assert_eq!(out, 42);
/// ```
pub mod engine;
pub mod unit;

pub use engine::{
    unresolved_symbol_trap, EngineConfig, EngineError, EngineResult, EngineStats, ExecStatus,
    Executor, FallbackResolver, OptLevel, ReturnSlot, RuntimeContext, SymbolAddr,
    MANAGED_EXIT_HOOK, PROCESS_EXIT_HOOK,
};
pub use unit::{CodeUnit, Expr, FunctionDef, RetKind, UnitBuilder, VerifyIssue};
