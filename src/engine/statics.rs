//! Static Constructor and Destructor Runs
//!
//! A unit may carry two well-known lists: global constructors, which must
//! run exactly once before the unit's code is used, and global destructors,
//! which run at teardown. The constructor run is guarded twice:
//!
//! - a re-entrancy flag rejects a nested run triggered from inside a
//!   constructor, since list removal plus flag reset is not otherwise atomic
//!   with respect to such a constructor
//! - after a successful run the list itself is removed from the unit, so a
//!   later call finds nothing to do
//!
//! Destructor runs carry no guard and leave the list in place; repeated
//! teardown passes are legal, and whatever bookkeeping matters after the
//! first run belongs to the backend, not to this runner.

use tracing::debug;

use super::error::{EngineError, EngineResult};
use super::executor::{Executor, Prepared, ReturnSlot};

impl Executor {
    /// Run the loaded unit's global constructors exactly once.
    ///
    /// A unit without a constructor list, a unit whose list was already
    /// consumed, and a nested call from within a running constructor are all
    /// no-ops. On an unresolved-symbol failure nothing has run yet and the
    /// list is retained, so the caller can register the symbols and retry.
    pub fn run_global_initializers_once(&mut self) -> EngineResult<()> {
        let Some(names) = self
            .unit
            .as_ref()
            .and_then(|u| u.global_ctors().map(<[String]>::to_vec))
        else {
            return Ok(());
        };

        if self.state.initializers_active.get() {
            debug!("constructor run already in progress; nested request ignored");
            return Ok(());
        }

        self.state.initializers_active.set(true);
        let result = self.run_function_list(&names, "constructor");
        if result.is_ok() {
            if let Some(unit) = self.unit.as_mut() {
                unit.take_global_ctors();
            }
            self.stats.constructors_run += names.len() as u64;
        }
        self.state.initializers_active.set(false);
        result
    }

    /// Run the loaded unit's global destructors, if any. May legitimately
    /// run more than once; the list is never removed by this runner.
    pub fn run_global_destructors_once(&mut self) -> EngineResult<()> {
        let Some(names) = self
            .unit
            .as_ref()
            .and_then(|u| u.global_dtors().map(<[String]>::to_vec))
        else {
            return Ok(());
        };

        let result = self.run_function_list(&names, "destructor");
        if result.is_ok() {
            self.stats.destructors_run += names.len() as u64;
        }
        result
    }

    /// Compile the whole list in one emission arena, then dispatch each
    /// member in list order. Unresolved symbols block the entire list before
    /// anything has run.
    fn run_function_list(&mut self, names: &[String], what: &'static str) -> EngineResult<()> {
        if names.is_empty() {
            return Ok(());
        }

        {
            let unit = self
                .unit
                .as_ref()
                .ok_or_else(|| EngineError::MissingFunction(names.join(", ")))?;
            for name in names {
                let def = unit
                    .function(name)
                    .ok_or_else(|| EngineError::MissingFunction(name.clone()))?;
                if def.params != 0 {
                    return Err(EngineError::Codegen(format!(
                        "{} '{}' must take no parameters",
                        what, name
                    )));
                }
            }
        }

        let roots: Vec<&str> = names.iter().map(String::as_str).collect();
        match self.prepare(&roots, false)? {
            Prepared::Blocked(symbols) => Err(EngineError::UnresolvedSymbols(symbols)),
            Prepared::Ready(emission) => {
                for name in names {
                    let addr = emission.address_of(name).ok_or_else(|| {
                        EngineError::Codegen(format!("no machine code registered for {} '{}'", what, name))
                    })?;
                    let ret = self
                        .unit
                        .as_ref()
                        .and_then(|u| u.function(name))
                        .map(|def| def.ret)
                        .ok_or_else(|| EngineError::MissingFunction(name.clone()))?;
                    // List members run fire-and-forget regardless of their
                    // return kind.
                    super::executor::invoke(addr, ret, ReturnSlot::Discard)?;
                    debug!(function = name.as_str(), "{} ran", what);
                }
                Ok(())
                // The arena drops here; list code is not retained either.
            }
        }
    }
}
