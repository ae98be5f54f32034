//! Execution Engine
//!
//! [`Executor`] turns a loaded [`CodeUnit`] into running machine code on
//! demand. Each entry-point call follows the same protocol:
//!
//! 1. Look the entry up in the current unit; a missing name is reported and
//!    has no side effects.
//! 2. If the unit defines both the standard process-exit hook and the
//!    runtime-managed one, rewire the standard hook's resolved address to
//!    the managed handler so exit cleanup funnels through the engine.
//! 3. Open an emission arena and compile the entry together with everything
//!    it reaches; external references resolve lazily through the runtime
//!    context during finalization.
//! 4. Inspect the unresolved-symbol ledger. Non-empty: drop the speculative
//!    stub bindings, unregister the emitted functions in reverse order, and
//!    report the names without ever dispatching the call. Empty: dispatch.
//! 5. Free the call's machine code either way. Code is never retained
//!    across calls; recompilation is the price of bounded memory over a
//!    long interactive session.
//!
//! Unresolved symbols therefore block exactly one call. The caller can
//! register the missing symbol or another fallback resolver, reset the
//! ledger, and retry the same entry point.

use std::cell::Cell;
use std::collections::HashSet;

use tracing::{debug, warn};

use super::backend::{EngineConfig, JitBackend};
use super::context::{RuntimeContext, SymbolAddr};
use super::emission::EmissionLog;
use super::error::{EngineError, EngineResult};
use crate::unit::{CodeUnit, RetKind};

/// Symbol name generated code uses to register process-exit callbacks.
pub const PROCESS_EXIT_HOOK: &str = "atexit";

/// Runtime-managed replacement whose address is substituted for
/// [`PROCESS_EXIT_HOOK`] when a unit defines both.
pub const MANAGED_EXIT_HOOK: &str = "__rt_atexit";

// =============================================================================
// Call interface types
// =============================================================================

/// Where an entry point's result should go.
pub enum ReturnSlot<'a> {
    /// Fire and forget; any result is discarded.
    Discard,
    /// Receive a scalar result.
    Scalar(&'a mut i64),
    /// Caller-owned storage for an aggregate result, one element per field.
    /// The callee writes the result here; no separate value is produced.
    Aggregate(&'a mut [i64]),
}

/// Outcome of one entry-point call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    /// The entry name is absent from the loaded unit (or not invokable).
    /// The call was a no-op.
    EntryPointNotFound,
    /// The listed symbols defeated the resolver chain. Only this call was
    /// blocked; the engine is clean and the caller may retry after
    /// registering the symbols.
    UnresolvedSymbols(Vec<String>),
}

/// Diagnostic counters, in the spirit of a tiered compiler's statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub entry_calls: u64,
    pub completed: u64,
    pub missing_entries: u64,
    pub unresolved_failures: u64,
    pub functions_compiled: u64,
    pub constructors_run: u64,
    pub destructors_run: u64,
}

// =============================================================================
// Engine state
// =============================================================================

/// Backend handle plus the initializer re-entrancy flag. The backend is
/// created once, on first use, and reused for every subsequent unit.
pub(crate) struct EngineState {
    pub(crate) backend: Option<JitBackend>,
    pub(crate) initializers_active: Cell<bool>,
}

impl EngineState {
    fn new() -> Self {
        EngineState {
            backend: None,
            initializers_active: Cell::new(false),
        }
    }
}

/// Result of compiling one attempt's roots, before dispatch.
pub(crate) enum Prepared {
    /// Everything resolved; the arena holds callable code.
    Ready(super::backend::EmissionUnit),
    /// The attempt was rolled back; these symbols were unresolved.
    Blocked(Vec<String>),
}

// =============================================================================
// Executor
// =============================================================================

/// The execution engine. See the module documentation for the call protocol.
pub struct Executor {
    pub(crate) config: EngineConfig,
    pub(crate) context: RuntimeContext,
    pub(crate) state: EngineState,
    pub(crate) unit: Option<CodeUnit>,
    pub(crate) stats: EngineStats,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::with_context(EngineConfig::default(), RuntimeContext::new())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_context(config, RuntimeContext::new())
    }

    /// Build an executor around an injected runtime context. Contexts are
    /// shareable, so several independent executors can coexist in one
    /// process, each with its own symbol namespace and resolver chain or a
    /// shared one.
    pub fn with_context(config: EngineConfig, context: RuntimeContext) -> Self {
        Executor {
            config,
            context,
            state: EngineState::new(),
            unit: None,
            stats: EngineStats::default(),
        }
    }

    /// The runtime context this executor resolves symbols through.
    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Take ownership of a freshly compiled unit. Any previously loaded
    /// unit is torn down. The backend is created on first load and reused
    /// afterwards; failure to create it is fatal.
    pub fn load_unit(&mut self, unit: CodeUnit) {
        debug!(unit = unit.name(), "loading code unit");
        self.ensure_backend();
        self.unit = Some(unit);
    }

    /// The currently loaded unit, if any.
    pub fn unit(&self) -> Option<&CodeUnit> {
        self.unit.as_ref()
    }

    fn ensure_backend(&mut self) {
        let config = &self.config;
        let context = &self.context;
        self.state.backend.get_or_insert_with(|| {
            JitBackend::new(config, context.clone())
                .expect("code generation backend failed to initialize")
        });
    }

    // =========================================================================
    // Symbol resolution surface
    // =========================================================================

    /// Append a fallback resolver to the chain. Resolvers are consulted in
    /// installation order; the first non-null answer wins. No removal.
    pub fn install_fallback_resolver<F>(&mut self, resolver: F)
    where
        F: Fn(&str) -> Option<SymbolAddr> + Send + 'static,
    {
        self.context.install_resolver(Box::new(resolver));
    }

    /// Bind `name` in the dynamic symbol namespace, only if unbound.
    /// Returns false and leaves any existing binding untouched.
    pub fn register_external_symbol(&mut self, name: &str, addr: SymbolAddr) -> bool {
        self.context.register_symbol(name, addr)
    }

    /// Clear the unresolved-symbol ledger so a caller can retry after
    /// installing a new resolver or external symbol.
    pub fn reset_unresolved_ledger(&mut self) {
        self.context.clear_ledger();
    }

    // =========================================================================
    // Entry-point execution
    // =========================================================================

    /// Execute the named entry point, delivering its result to `slot`.
    ///
    /// Entry points take no arguments; a name bound to a parameterized
    /// function is reported the same way as a missing one. An aggregate
    /// result goes into the caller's storage only; a scalar slot passed for
    /// an aggregate entry is deliberately left untouched.
    pub fn execute_entry_point(
        &mut self,
        name: &str,
        slot: ReturnSlot<'_>,
    ) -> EngineResult<ExecStatus> {
        self.stats.entry_calls += 1;

        let ret = {
            let Some(unit) = self.unit.as_ref() else {
                warn!(entry = name, "no code unit loaded");
                self.stats.missing_entries += 1;
                return Ok(ExecStatus::EntryPointNotFound);
            };
            let Some(def) = unit.function(name) else {
                warn!(entry = name, unit = unit.name(), "entry point not found");
                self.stats.missing_entries += 1;
                return Ok(ExecStatus::EntryPointNotFound);
            };
            if def.params != 0 {
                warn!(
                    entry = name,
                    params = def.params,
                    "entry point takes parameters and cannot be invoked directly"
                );
                self.stats.missing_entries += 1;
                return Ok(ExecStatus::EntryPointNotFound);
            }
            def.ret
        };

        match self.prepare(&[name], true)? {
            Prepared::Blocked(names) => {
                warn!(entry = name, symbols = ?names, "entry point blocked by unresolved symbols");
                self.stats.unresolved_failures += 1;
                Ok(ExecStatus::UnresolvedSymbols(names))
            }
            Prepared::Ready(emission) => {
                let addr = emission.address_of(name).ok_or_else(|| {
                    EngineError::Codegen(format!("no machine code registered for entry '{}'", name))
                })?;
                invoke(addr, ret, slot)?;
                self.stats.completed += 1;
                Ok(ExecStatus::Success)
                // `emission` drops here, freeing the call's machine code.
            }
        }
    }

    /// Compile `roots` and everything they reach in a fresh emission arena,
    /// applying the full resolution protocol. Returns the live arena when
    /// every reference resolved, or the rolled-back list of unresolved
    /// names. The ledger is left empty on every path out of here.
    pub(crate) fn prepare(
        &mut self,
        roots: &[&str],
        rewire_exit_hooks: bool,
    ) -> EngineResult<Prepared> {
        let Self {
            config,
            context,
            state,
            unit,
            stats,
        } = self;
        let unit = unit
            .as_ref()
            .ok_or_else(|| EngineError::MissingFunction(roots.join(", ")))?;

        // Fresh resolution cycle: the ledger starts empty and is emptied
        // again on every path out, including errors.
        context.clear_ledger();
        let _ledger_scope = context.ledger_scope();

        let backend = state.backend.get_or_insert_with(|| {
            JitBackend::new(config, context.clone())
                .expect("code generation backend failed to initialize")
        });

        let mut emission = backend.begin_emission();
        let mut log = EmissionLog::new();

        let mut redirects: HashSet<String> = HashSet::new();
        if rewire_exit_hooks
            && unit.function(PROCESS_EXIT_HOOK).is_some()
            && unit.function(MANAGED_EXIT_HOOK).is_some()
        {
            emission.compile_reachable(unit, &[MANAGED_EXIT_HOOK], &mut log, &redirects)?;
            if let Some(managed) = emission.address_of(MANAGED_EXIT_HOOK) {
                emission.set_override(PROCESS_EXIT_HOOK, managed);
                redirects.insert(PROCESS_EXIT_HOOK.to_owned());
                debug!("rewired process-exit hook to the runtime-managed handler");
            }
        }

        emission.compile_reachable(unit, roots, &mut log, &redirects)?;
        stats.functions_compiled += log.len() as u64;

        let unresolved = context.take_unresolved();
        if !unresolved.is_empty() {
            for symbol in &unresolved {
                context.forget_speculative(symbol);
            }
            for emitted in log.drain_reverse() {
                emission.unregister(&emitted);
            }
            debug!(
                count = unresolved.len(),
                "rolled back emission after unresolved symbols"
            );
            return Ok(Prepared::Blocked(unresolved));
            // `emission` drops here: the rolled-back code is freed and no
            // mapping from this attempt survives.
        }

        Ok(Prepared::Ready(emission))
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Structurally verify the loaded unit. Returns true when issues were
    /// found. Diagnostic only; execution is never blocked by it.
    pub fn verify(&self) -> bool {
        let Some(unit) = self.unit.as_ref() else {
            return false;
        };
        let issues = unit.validate();
        for issue in &issues {
            warn!(unit = unit.name(), %issue, "structural verification issue");
        }
        !issues.is_empty()
    }

    /// Render the loaded unit as text. Always succeeds.
    pub fn dump_as_text(&self) -> String {
        match self.unit.as_ref() {
            Some(unit) => unit.dump_text(),
            None => "<no unit loaded>\n".to_string(),
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Dispatch a compiled zero-argument entry point.
///
/// `addr` must be the finalized address of a function emitted with the
/// signature implied by `ret`; the caller guarantees the arena that produced
/// it is still alive.
pub(crate) fn invoke(addr: SymbolAddr, ret: RetKind, slot: ReturnSlot<'_>) -> EngineResult<()> {
    match ret {
        RetKind::Unit => {
            let entry: extern "C" fn() =
                unsafe { std::mem::transmute::<*const u8, extern "C" fn()>(addr.as_ptr()) };
            entry();
        }
        RetKind::Scalar => {
            let entry: extern "C" fn() -> i64 =
                unsafe { std::mem::transmute::<*const u8, extern "C" fn() -> i64>(addr.as_ptr()) };
            let value = entry();
            if let ReturnSlot::Scalar(out) = slot {
                *out = value;
            }
        }
        RetKind::Aggregate { fields } => {
            let entry: extern "C" fn(*mut i64) =
                unsafe { std::mem::transmute::<*const u8, extern "C" fn(*mut i64)>(addr.as_ptr()) };
            match slot {
                ReturnSlot::Aggregate(dest) => {
                    if dest.len() < fields {
                        return Err(EngineError::SlotTooSmall {
                            needed: fields,
                            got: dest.len(),
                        });
                    }
                    entry(dest.as_mut_ptr());
                }
                other => {
                    // The result demands caller storage but none was given;
                    // run into scratch space and leave any scalar slot alone.
                    if matches!(other, ReturnSlot::Scalar(_)) {
                        warn!("aggregate result discarded: caller supplied a scalar slot");
                    }
                    let mut scratch = vec![0i64; fields];
                    entry(scratch.as_mut_ptr());
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
