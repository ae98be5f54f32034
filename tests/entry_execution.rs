//! End-to-end tests for entry-point execution: scalar and aggregate return
//! conventions, lazy symbol resolution through the fallback chain, ledger
//! rollback, and the retry protocol after registering missing symbols.

mod common;

use std::sync::atomic::{AtomicI64, Ordering};

use common::engine_with;
use ignitron::{
    CodeUnit, EngineConfig, EngineError, ExecStatus, Executor, Expr, FunctionDef, ReturnSlot,
    RuntimeContext, SymbolAddr,
};

#[test]
fn test_add_two_returns_sum() {
    let unit = CodeUnit::builder("sums")
        .function(FunctionDef::scalar(
            "addTwo",
            0,
            vec![Expr::add(Expr::Const(40), Expr::Const(2))],
        ))
        .build();

    let mut executor = engine_with(unit);
    let mut out = 0i64;
    let status = executor
        .execute_entry_point("addTwo", ReturnSlot::Scalar(&mut out))
        .unwrap();
    assert_eq!(status, ExecStatus::Success);
    assert_eq!(out, 42);
}

#[test]
fn test_local_call_chain_with_arguments() {
    let unit = CodeUnit::builder("chain")
        .function(FunctionDef::scalar(
            "double",
            1,
            vec![Expr::mul(Expr::Arg(0), Expr::Const(2))],
        ))
        .function(FunctionDef::scalar(
            "quadruple",
            1,
            vec![Expr::call(
                "double",
                vec![Expr::call("double", vec![Expr::Arg(0)])],
            )],
        ))
        .function(FunctionDef::scalar(
            "main_wrapper",
            0,
            vec![Expr::call("quadruple", vec![Expr::Const(10)])],
        ))
        .build();

    let mut executor = engine_with(unit);
    let mut out = 0i64;
    let status = executor
        .execute_entry_point("main_wrapper", ReturnSlot::Scalar(&mut out))
        .unwrap();
    assert_eq!(status, ExecStatus::Success);
    assert_eq!(out, 40);
}

#[test]
fn test_pure_unit_never_reports_unresolved() {
    let unit = CodeUnit::builder("pure")
        .function(FunctionDef::scalar("one", 0, vec![Expr::Const(1)]))
        .function(FunctionDef::scalar(
            "two",
            0,
            vec![Expr::call("one", vec![]), Expr::Const(2)],
        ))
        .build();

    let mut executor = engine_with(unit);
    for _ in 0..2 {
        for entry in ["one", "two"] {
            let status = executor
                .execute_entry_point(entry, ReturnSlot::Discard)
                .unwrap();
            assert_eq!(status, ExecStatus::Success);
        }
    }
}

#[test]
fn test_missing_entry_point_is_a_noop() {
    let unit = CodeUnit::builder("small")
        .function(FunctionDef::scalar("real", 0, vec![Expr::Const(9)]))
        .build();

    let mut executor = engine_with(unit);
    let status = executor
        .execute_entry_point("imaginary", ReturnSlot::Discard)
        .unwrap();
    assert_eq!(status, ExecStatus::EntryPointNotFound);

    // The engine stays usable.
    let mut out = 0i64;
    let status = executor
        .execute_entry_point("real", ReturnSlot::Scalar(&mut out))
        .unwrap();
    assert_eq!(status, ExecStatus::Success);
    assert_eq!(out, 9);
}

// =============================================================================
// Unresolved symbols and retry
// =============================================================================

#[test]
fn test_unresolved_symbol_blocks_only_that_call() {
    let unit = CodeUnit::builder("mixed")
        .function(FunctionDef::scalar(
            "callIt",
            0,
            vec![Expr::call_extern("missingFn", vec![])],
        ))
        .function(FunctionDef::scalar(
            "addTwo",
            0,
            vec![Expr::add(Expr::Const(1), Expr::Const(1))],
        ))
        .build();

    let mut executor = engine_with(unit);
    let status = executor
        .execute_entry_point("callIt", ReturnSlot::Discard)
        .unwrap();
    assert_eq!(
        status,
        ExecStatus::UnresolvedSymbols(vec!["missingFn".to_string()])
    );

    // The ledger was cleared on the way out; an unrelated entry point on
    // the same unit executes normally.
    let mut out = 0i64;
    let status = executor
        .execute_entry_point("addTwo", ReturnSlot::Scalar(&mut out))
        .unwrap();
    assert_eq!(status, ExecStatus::Success);
    assert_eq!(out, 2);
}

#[test]
fn test_one_call_surfaces_all_unresolved_symbols() {
    let unit = CodeUnit::builder("holes")
        .function(FunctionDef::scalar(
            "needy",
            0,
            vec![Expr::add(
                Expr::call_extern("alpha_helper", vec![]),
                Expr::call_extern("beta_helper", vec![]),
            )],
        ))
        .build();

    let mut executor = engine_with(unit);
    let status = executor
        .execute_entry_point("needy", ReturnSlot::Discard)
        .unwrap();
    assert_eq!(
        status,
        ExecStatus::UnresolvedSymbols(vec![
            "alpha_helper".to_string(),
            "beta_helper".to_string()
        ])
    );
}

#[test]
fn test_registering_symbol_enables_retry() {
    extern "C" fn seven() -> i64 {
        7
    }

    let unit = CodeUnit::builder("retry")
        .function(FunctionDef::scalar(
            "f",
            0,
            vec![Expr::call_extern("bar", vec![])],
        ))
        .build();

    let mut executor = engine_with(unit);
    let status = executor
        .execute_entry_point("f", ReturnSlot::Discard)
        .unwrap();
    assert_eq!(status, ExecStatus::UnresolvedSymbols(vec!["bar".to_string()]));

    assert!(executor.register_external_symbol("bar", SymbolAddr::new(seven as *const u8)));
    executor.reset_unresolved_ledger();

    let mut out = 0i64;
    let status = executor
        .execute_entry_point("f", ReturnSlot::Scalar(&mut out))
        .unwrap();
    assert_eq!(status, ExecStatus::Success);
    assert_eq!(out, 7);
}

#[test]
fn test_fallback_resolver_precedence() {
    extern "C" fn forty() -> i64 {
        40
    }
    extern "C" fn two() -> i64 {
        2
    }

    let build = || {
        CodeUnit::builder("probe")
            .function(FunctionDef::scalar(
                "ask",
                0,
                vec![Expr::call_extern("mystery", vec![])],
            ))
            .build()
    };

    // First resolver declines, second answers: the second's address is used.
    let mut executor = engine_with(build());
    executor.install_fallback_resolver(|_| None);
    executor.install_fallback_resolver(|name| {
        (name == "mystery").then(|| SymbolAddr::new(two as *const u8))
    });
    let mut out = 0i64;
    let status = executor
        .execute_entry_point("ask", ReturnSlot::Scalar(&mut out))
        .unwrap();
    assert_eq!(status, ExecStatus::Success);
    assert_eq!(out, 2);

    // Both answer: the first non-null result wins, no re-ranking.
    let mut executor = engine_with(build());
    executor.install_fallback_resolver(|name| {
        (name == "mystery").then(|| SymbolAddr::new(forty as *const u8))
    });
    executor.install_fallback_resolver(|name| {
        (name == "mystery").then(|| SymbolAddr::new(two as *const u8))
    });
    let mut out = 0i64;
    let status = executor
        .execute_entry_point("ask", ReturnSlot::Scalar(&mut out))
        .unwrap();
    assert_eq!(status, ExecStatus::Success);
    assert_eq!(out, 40);
}

#[test]
fn test_register_external_symbol_first_writer_wins() {
    extern "C" fn first() -> i64 {
        1
    }
    extern "C" fn second() -> i64 {
        2
    }

    let unit = CodeUnit::builder("claims")
        .function(FunctionDef::scalar(
            "read",
            0,
            vec![Expr::call_extern("x", vec![])],
        ))
        .build();

    let mut executor = engine_with(unit);
    assert!(executor.register_external_symbol("x", SymbolAddr::new(first as *const u8)));
    assert!(!executor.register_external_symbol("x", SymbolAddr::new(second as *const u8)));

    let mut out = 0i64;
    let status = executor
        .execute_entry_point("read", ReturnSlot::Scalar(&mut out))
        .unwrap();
    assert_eq!(status, ExecStatus::Success);
    assert_eq!(out, 1);
}

#[test]
fn test_executors_can_share_a_runtime_context() {
    extern "C" fn nine() -> i64 {
        9
    }

    common::init_tracing();
    let context = RuntimeContext::new();
    let mut first = Executor::with_context(EngineConfig::default(), context.clone());
    let mut second = Executor::with_context(EngineConfig::default(), context);

    let build = |name: &str| {
        CodeUnit::builder(name)
            .function(FunctionDef::scalar(
                "probe",
                0,
                vec![Expr::call_extern("shared_nine", vec![])],
            ))
            .build()
    };
    first.load_unit(build("a"));
    second.load_unit(build("b"));

    assert!(first.register_external_symbol("shared_nine", SymbolAddr::new(nine as *const u8)));
    // The binding went into the shared namespace: the second engine sees it
    // as already bound and resolves through it.
    assert!(!second.register_external_symbol("shared_nine", SymbolAddr::new(nine as *const u8)));

    let mut out = 0i64;
    let status = second
        .execute_entry_point("probe", ReturnSlot::Scalar(&mut out))
        .unwrap();
    assert_eq!(status, ExecStatus::Success);
    assert_eq!(out, 9);
}

// =============================================================================
// Return conventions
// =============================================================================

#[test]
fn test_aggregate_return_uses_caller_storage() {
    let unit = CodeUnit::builder("agg")
        .function(FunctionDef::aggregate(
            "makePair",
            0,
            vec![Expr::Const(3), Expr::Const(4)],
        ))
        .build();

    let mut executor = engine_with(unit);
    let mut storage = [0i64; 2];
    let status = executor
        .execute_entry_point("makePair", ReturnSlot::Aggregate(&mut storage))
        .unwrap();
    assert_eq!(status, ExecStatus::Success);
    assert_eq!(storage, [3, 4]);
}

#[test]
fn test_aggregate_result_never_populates_a_scalar_slot() {
    let unit = CodeUnit::builder("agg")
        .function(FunctionDef::aggregate(
            "makePair",
            0,
            vec![Expr::Const(3), Expr::Const(4)],
        ))
        .build();

    let mut executor = engine_with(unit);
    let mut sentinel = -7i64;
    let status = executor
        .execute_entry_point("makePair", ReturnSlot::Scalar(&mut sentinel))
        .unwrap();
    assert_eq!(status, ExecStatus::Success);
    // The result only ever lands in caller-supplied aggregate storage.
    assert_eq!(sentinel, -7);
}

#[test]
fn test_aggregate_slot_too_small_is_rejected_before_dispatch() {
    let unit = CodeUnit::builder("agg")
        .function(FunctionDef::aggregate(
            "makeTriple",
            0,
            vec![Expr::Const(1), Expr::Const(2), Expr::Const(3)],
        ))
        .build();

    let mut executor = engine_with(unit);
    let mut storage = [0i64; 1];
    let err = executor
        .execute_entry_point("makeTriple", ReturnSlot::Aggregate(&mut storage))
        .unwrap_err();
    assert_eq!(err, EngineError::SlotTooSmall { needed: 3, got: 1 });
}

#[test]
fn test_fire_and_forget_side_effects() {
    static HITS: AtomicI64 = AtomicI64::new(0);
    extern "C" fn bump() -> i64 {
        HITS.fetch_add(1, Ordering::SeqCst) + 1
    }

    let unit = CodeUnit::builder("effects")
        .function(FunctionDef::effect(
            "poke",
            0,
            vec![Expr::call_extern("bump_hits", vec![])],
        ))
        .build();

    let mut executor = engine_with(unit);
    assert!(executor.register_external_symbol("bump_hits", SymbolAddr::new(bump as *const u8)));

    let status = executor
        .execute_entry_point("poke", ReturnSlot::Discard)
        .unwrap();
    assert_eq!(status, ExecStatus::Success);
    assert_eq!(HITS.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Exit-hook rewiring
// =============================================================================

#[test]
fn test_exit_hook_rewires_to_managed_handler() {
    static NOTED: AtomicI64 = AtomicI64::new(0);
    extern "C" fn note(value: i64) -> i64 {
        NOTED.store(value, Ordering::SeqCst);
        0
    }

    // The unit defines both the standard exit hook and the runtime-managed
    // one. The standard body would return 0; the managed handler forwards
    // its argument to the runtime and returns it.
    let unit = CodeUnit::builder("hooks")
        .function(FunctionDef::scalar("atexit", 1, vec![Expr::Const(0)]))
        .function(FunctionDef::scalar(
            "__rt_atexit",
            1,
            vec![
                Expr::call_extern("note_exit_registration", vec![Expr::Arg(0)]),
                Expr::Arg(0),
            ],
        ))
        .function(FunctionDef::scalar(
            "register_cleanup",
            0,
            vec![Expr::call("atexit", vec![Expr::Const(5)])],
        ))
        .build();

    let mut executor = engine_with(unit);
    assert!(executor
        .register_external_symbol("note_exit_registration", SymbolAddr::new(note as *const u8)));

    let mut out = 0i64;
    let status = executor
        .execute_entry_point("register_cleanup", ReturnSlot::Scalar(&mut out))
        .unwrap();
    assert_eq!(status, ExecStatus::Success);

    // The call to the standard hook landed in the managed handler.
    assert_eq!(out, 5);
    assert_eq!(NOTED.load(Ordering::SeqCst), 5);
}
