//! Runtime Context: Symbol Namespace, Resolver Chain and Unresolved Ledger
//!
//! All process-wide mutable state the engine needs during lazy symbol
//! resolution lives in one [`RuntimeContext`] object:
//!
//! - the dynamic symbol namespace (explicit registrations, first-writer-wins)
//! - the append-only chain of fallback resolvers, tried in registration order
//! - a cache of resolved addresses, including speculative terminal-stub
//!   bindings for names that defeated the chain
//! - the ledger of unresolved symbol names for the current execution attempt
//!
//! The context is injected into the engine rather than held as free-standing
//! statics, so several independent runtimes can coexist in one process. It is
//! cheaply cloneable; clones share the same state. The backend's symbol
//! lookup callback holds a clone, which is why the interior sits behind a
//! mutex even though the engine itself is single-threaded.
//!
//! # Resolution protocol
//!
//! A lookup walks: registered symbols, then the cache, then each resolver in
//! order until one returns an address. A name that exhausts the chain is
//! recorded in the ledger, bound speculatively to the terminal stub, and the
//! stub address is returned so code generation can complete. The stub is
//! never meant to run: the engine checks the ledger before dispatching the
//! call. Deferring the failure this way lets one compilation surface every
//! unresolved symbol at once instead of dying on the first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

/// Address of a native symbol, as registered with the dynamic namespace or
/// produced by a fallback resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolAddr(*const u8);

// Safety: a SymbolAddr is an opaque code/data address. It is only ever
// produced from 'static function pointers or addresses the registrant
// guarantees to outlive the runtime, and it is never dereferenced by the
// context itself.
unsafe impl Send for SymbolAddr {}
unsafe impl Sync for SymbolAddr {}

impl SymbolAddr {
    pub fn new(ptr: *const u8) -> Self {
        SymbolAddr(ptr)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.0
    }
}

/// A fallback resolver: given a symbol name, produce its address or decline.
pub type FallbackResolver = Box<dyn Fn(&str) -> Option<SymbolAddr> + Send>;

/// Terminal stub handed out for names no resolver could bind.
///
/// Reaching this function at run time means a call was dispatched that the
/// engine should have blocked; shout about it instead of silently returning.
pub extern "C" fn unresolved_symbol_trap() {
    error!("call into an unresolved symbol stub; this call should have been blocked before dispatch");
    eprintln!(
        "ignitron: call into an unresolved symbol stub; \
         this call should have been blocked before dispatch"
    );
}

fn trap_addr() -> SymbolAddr {
    SymbolAddr::new(unresolved_symbol_trap as *const u8)
}

struct ContextInner {
    /// Explicitly registered symbols. First writer wins; later registrations
    /// for the same name are rejected.
    symbols: HashMap<String, SymbolAddr>,

    /// Fallback resolvers in registration order. Append-only.
    resolvers: Vec<FallbackResolver>,

    /// Previously resolved addresses, including speculative stub bindings.
    cache: HashMap<String, SymbolAddr>,

    /// Names that defeated the resolver chain during the current attempt.
    ledger: HashSet<String>,
}

/// Shared runtime context. See the module documentation.
#[derive(Clone)]
pub struct RuntimeContext {
    inner: Arc<Mutex<ContextInner>>,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeContext {
    pub fn new() -> Self {
        RuntimeContext {
            inner: Arc::new(Mutex::new(ContextInner {
                symbols: HashMap::new(),
                resolvers: Vec::new(),
                cache: HashMap::new(),
                ledger: HashSet::new(),
            })),
        }
    }

    /// Bind `name` in the dynamic symbol namespace, only if unbound.
    /// Returns false and leaves the existing binding untouched otherwise.
    pub fn register_symbol(&self, name: &str, addr: SymbolAddr) -> bool {
        let mut inner = self.inner.lock();
        if inner.symbols.contains_key(name) {
            debug!(symbol = name, "symbol already bound; registration rejected");
            return false;
        }
        inner.symbols.insert(name.to_owned(), addr);
        true
    }

    /// Append a fallback resolver to the chain. There is no removal.
    pub fn install_resolver(&self, resolver: FallbackResolver) {
        self.inner.lock().resolvers.push(resolver);
    }

    /// Resolve `name` for linking, recording a ledger entry if every source
    /// is exhausted. Always returns a usable address; for an unresolvable
    /// name that address is the terminal stub.
    pub(crate) fn resolve_recording(&self, name: &str) -> SymbolAddr {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(addr) = inner.symbols.get(name) {
            return *addr;
        }
        if let Some(addr) = inner.cache.get(name) {
            return *addr;
        }
        for resolver in &inner.resolvers {
            if let Some(addr) = resolver(name) {
                inner.cache.insert(name.to_owned(), addr);
                return addr;
            }
        }

        debug!(symbol = name, "resolver chain exhausted; binding terminal stub");
        inner.ledger.insert(name.to_owned());
        let stub = trap_addr();
        inner.cache.insert(name.to_owned(), stub);
        stub
    }

    /// Drain the ledger, returning the recorded names in sorted order.
    pub(crate) fn take_unresolved(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().ledger.drain().collect();
        names.sort();
        names
    }

    /// Clear the ledger without reading it.
    pub fn clear_ledger(&self) {
        self.inner.lock().ledger.clear();
    }

    /// Remove the speculative stub binding for `name`, if that is what the
    /// cache currently holds. A real resolved address is left alone.
    pub(crate) fn forget_speculative(&self, name: &str) {
        let mut inner = self.inner.lock();
        if inner.cache.get(name) == Some(&trap_addr()) {
            inner.cache.remove(name);
        }
    }

    /// Scope guard clearing the ledger when dropped, so every exit path of
    /// an execution attempt leaves it empty.
    pub(crate) fn ledger_scope(&self) -> LedgerScope<'_> {
        LedgerScope { context: self }
    }
}

pub(crate) struct LedgerScope<'a> {
    context: &'a RuntimeContext,
}

impl Drop for LedgerScope<'_> {
    fn drop(&mut self) {
        self.context.clear_ledger();
    }
}

// =============================================================================
// Tests
// =============================================================================
