//! Shared helpers for the integration test suite.

use ignitron::{CodeUnit, Executor};

/// Install a test-friendly subscriber once per process. Repeat calls are
/// harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Fresh engine with `unit` loaded and logging initialized.
pub fn engine_with(unit: CodeUnit) -> Executor {
    init_tracing();
    let mut executor = Executor::new();
    executor.load_unit(unit);
    executor
}
