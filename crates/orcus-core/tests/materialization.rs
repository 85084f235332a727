//! Deferred materialization: exactly-once execution, shared outcomes and
//! dispatch.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

use jit_fixture::{define_absolute, flags_map, symbol_map};
use orcus_core::{
    DispatchMode, ErrorKind, ExecutionSession, ExecutorAddr, MaterializationUnit, OrcError,
    SessionConfig, SymbolState, absolute_symbols,
};

const LOOKUP_THREADS: usize = 8;

// ─── Exactly once ───

#[test]
fn concurrent_lookups_trigger_one_materialization() {
    let session = ExecutionSession::new();
    let dylib = session.create_jit_dylib("main").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let resolved = symbol_map(&session, &[("foo", 0x10), ("bar", 0x20)]);
    let unit = {
        let runs = runs.clone();
        MaterializationUnit::deferred(
            "slow",
            flags_map(&session, &["foo", "bar"]),
            move |mut responsibility| {
                runs.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                responsibility.notify_resolved(resolved).unwrap();
            },
        )
    };
    dylib
        .define(&dylib.create_resource_tracker(), unit)
        .unwrap();
    assert_eq!(
        dylib.symbol_state(&session.intern("foo")),
        Some(SymbolState::Declared)
    );

    let barrier = Arc::new(Barrier::new(LOOKUP_THREADS));
    let handles: Vec<_> = (0..LOOKUP_THREADS)
        .map(|_| {
            let session = session.clone();
            let dylib = dylib.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                session.lookup(&dylib, "foo")
            })
        })
        .collect();
    for handle in handles {
        let addr = handle.join().expect("lookup thread panicked");
        assert_eq!(addr, Ok(ExecutorAddr::new(0x10)));
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        session.lookup(&dylib, "bar").unwrap(),
        ExecutorAddr::new(0x20)
    );
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn failure_is_shared_by_every_waiter_and_never_retried() {
    let session = ExecutionSession::new();
    let dylib = session.create_jit_dylib("main").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let unit = {
        let runs = runs.clone();
        MaterializationUnit::deferred(
            "broken",
            flags_map(&session, &["foo"]),
            move |responsibility| {
                runs.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                responsibility.fail_materialization("codegen exploded");
            },
        )
    };
    dylib
        .define(&dylib.default_resource_tracker(), unit)
        .unwrap();

    let barrier = Arc::new(Barrier::new(LOOKUP_THREADS));
    let handles: Vec<_> = (0..LOOKUP_THREADS)
        .map(|_| {
            let session = session.clone();
            let dylib = dylib.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                session.lookup(&dylib, "foo")
            })
        })
        .collect();
    let expected = OrcError::MaterializationFailure {
        name: "foo".to_string(),
        message: Arc::from("codegen exploded"),
    };
    for handle in handles {
        let result = handle.join().expect("lookup thread panicked");
        assert_eq!(result, Err(expected.clone()));
    }

    assert_eq!(session.lookup(&dylib, "foo"), Err(expected));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        dylib.symbol_state(&session.intern("foo")),
        Some(SymbolState::Failed)
    );

    // A failed record still occupies its name.
    let tracker = dylib.create_resource_tracker();
    let err = dylib
        .define(
            &tracker,
            absolute_symbols(symbol_map(&session, &[("foo", 1)])),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateDefinition);
}

// ─── Responsibility ───

#[test]
fn dropped_responsibility_fails_outstanding_symbols() {
    let session = ExecutionSession::new();
    let dylib = session.create_jit_dylib("main").unwrap();
    let resolved = symbol_map(&session, &[("a", 0xa)]);
    dylib
        .define(
            &dylib.default_resource_tracker(),
            MaterializationUnit::deferred(
                "partial",
                flags_map(&session, &["a", "b"]),
                move |mut responsibility| {
                    responsibility.notify_resolved(resolved).unwrap();
                    assert_eq!(responsibility.symbols().len(), 1);
                },
            ),
        )
        .unwrap();

    assert_eq!(session.lookup(&dylib, "a").unwrap(), ExecutorAddr::new(0xa));
    let err = session.lookup(&dylib, "b").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MaterializationFailure);
    assert!(err.to_string().contains("dropped"), "{err}");
}

#[test]
fn notify_resolved_rejects_symbols_outside_the_unit() {
    let session = ExecutionSession::new();
    let dylib = session.create_jit_dylib("main").unwrap();
    let stray = symbol_map(&session, &[("foo", 1), ("other", 2)]);
    let good = symbol_map(&session, &[("foo", 1)]);
    let (tx, rx) = mpsc::channel();
    dylib
        .define(
            &dylib.default_resource_tracker(),
            MaterializationUnit::deferred(
                "strict",
                flags_map(&session, &["foo"]),
                move |mut responsibility| {
                    tx.send(responsibility.notify_resolved(stray)).unwrap();
                    responsibility.notify_resolved(good).unwrap();
                },
            ),
        )
        .unwrap();

    assert_eq!(session.lookup(&dylib, "foo").unwrap(), ExecutorAddr::new(1));
    let rejected = rx.recv().unwrap().unwrap_err();
    assert_eq!(rejected.kind(), ErrorKind::MaterializationFailure);
    assert!(!dylib.contains(&session.intern("other")));
}

#[test]
fn materializer_can_look_up_other_symbols() {
    let session = ExecutionSession::new();
    let dylib = session.create_jit_dylib("main").unwrap();
    define_absolute(
        &session,
        &dylib,
        &dylib.default_resource_tracker(),
        &[("helper", 0x40)],
    );
    dylib
        .define(
            &dylib.create_resource_tracker(),
            MaterializationUnit::deferred(
                "entry",
                flags_map(&session, &["entry"]),
                |mut responsibility| {
                    let dylib = responsibility.target_dylib().clone();
                    let session = dylib.session().unwrap();
                    let helper = session.lookup(&dylib, "helper").unwrap();
                    let resolved = symbol_map(&session, &[("entry", helper.value() + 1)]);
                    responsibility.notify_resolved(resolved).unwrap();
                },
            ),
        )
        .unwrap();

    assert_eq!(
        session.lookup(&dylib, "entry").unwrap(),
        ExecutorAddr::new(0x41)
    );
}

// ─── Dispatch ───

#[test]
fn threaded_dispatch_runs_materializer_on_named_thread() {
    let config = SessionConfig {
        dispatch: DispatchMode::Threaded,
        ..SessionConfig::default()
    };
    let session = ExecutionSession::with_config(config);
    let dylib = session.create_jit_dylib("main").unwrap();
    let resolved = symbol_map(&session, &[("work", 0x77)]);
    let (tx, rx) = mpsc::channel();
    dylib
        .define(
            &dylib.default_resource_tracker(),
            MaterializationUnit::deferred(
                "worker",
                flags_map(&session, &["work"]),
                move |mut responsibility| {
                    tx.send(thread::current().name().map(str::to_owned))
                        .unwrap();
                    responsibility.notify_resolved(resolved).unwrap();
                },
            ),
        )
        .unwrap();

    assert_eq!(
        session.lookup(&dylib, "work").unwrap(),
        ExecutorAddr::new(0x77)
    );
    assert_eq!(
        rx.recv().unwrap().as_deref(),
        Some("orcus-materialize:worker")
    );
}
