//! On-miss definition generators: consultation order, stock generators and
//! search orders.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use jit_fixture::{define_absolute, flags_map, symbol_map};
use orcus_core::{
    ErrorKind, EvaluatedSymbol, ExecutionSession, ExecutorAddr, JitDylib, JitDylibLookupFlags,
    JitSymbolFlags, LookupKind, MaterializationUnit, OrcError, ReexportsGenerator,
    StaticSymbolGenerator, SymbolMap, SymbolStringPtr, absolute_symbols,
};

/// Generator body that defines every requested name at `addr`.
fn define_all(dylib: &JitDylib, names: &[SymbolStringPtr], addr: u64) -> Result<(), OrcError> {
    let symbols = names
        .iter()
        .map(|name| {
            (
                name.clone(),
                EvaluatedSymbol::new(ExecutorAddr::new(addr), JitSymbolFlags::EXPORTED),
            )
        })
        .collect();
    dylib.define(&dylib.default_resource_tracker(), absolute_symbols(symbols))
}

// ─── Consultation protocol ───

#[test]
fn generators_run_in_order_and_stop_at_first_supplier() {
    let session = ExecutionSession::new();
    let dylib = session.create_jit_dylib("main").unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let log = calls.clone();
    dylib.add_generator_fn(move |_, _, _, _| {
        log.lock().unwrap().push(0);
        Ok(())
    });
    let log = calls.clone();
    dylib.add_generator_fn(move |_, dylib, _, names| {
        log.lock().unwrap().push(1);
        define_all(dylib, names, 0x100)
    });
    let log = calls.clone();
    dylib.add_generator_fn(move |_, dylib, _, names| {
        log.lock().unwrap().push(2);
        define_all(dylib, names, 0x200)
    });
    assert_eq!(dylib.generator_count(), 3);

    assert_eq!(session.lookup(&dylib, "x").unwrap(), ExecutorAddr::new(0x100));
    assert_eq!(*calls.lock().unwrap(), vec![0, 1]);

    // Now a table hit: no generator runs.
    assert_eq!(session.lookup(&dylib, "x").unwrap(), ExecutorAddr::new(0x100));
    assert_eq!(*calls.lock().unwrap(), vec![0, 1]);
}

#[test]
fn generators_are_not_consulted_for_defined_names() {
    let session = ExecutionSession::new();
    let dylib = session.create_jit_dylib("main").unwrap();
    define_absolute(&session, &dylib, &dylib.default_resource_tracker(), &[("known", 5)]);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    dylib.add_generator_fn(move |_, _, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    assert_eq!(session.lookup(&dylib, "known").unwrap(), ExecutorAddr::new(5));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let err = session.lookup(&dylib, "unknown").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SymbolNotFound);
    let err = session.lookup(&dylib, "unknown").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SymbolNotFound);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn generator_error_aborts_the_lookup() {
    let session = ExecutionSession::new();
    let dylib = session.create_jit_dylib("main").unwrap();
    let later = Arc::new(AtomicUsize::new(0));
    dylib.add_generator_fn(|_, _, _, _| Err(OrcError::generator("symbol server offline")));
    let counter = later.clone();
    dylib.add_generator_fn(move |_, dylib, _, names| {
        counter.fetch_add(1, Ordering::SeqCst);
        define_all(dylib, names, 1)
    });

    let err = session.lookup(&dylib, "f").unwrap_err();
    assert_eq!(err, OrcError::generator("symbol server offline"));
    assert_eq!(err.kind(), ErrorKind::GeneratorFailure);
    assert_eq!(later.load(Ordering::SeqCst), 0);
    assert!(!dylib.contains(&session.intern("f")));
}

#[test]
fn generator_receives_lookup_kind_and_flags() {
    let session = ExecutionSession::new();
    let dylib = session.create_jit_dylib("main").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    dylib.add_generator_fn(move |kind, _, flags, names| {
        let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
        log.lock().unwrap().push((kind, flags, names));
        Ok(())
    });

    let order = [(dylib.clone(), JitDylibLookupFlags::MatchExportedSymbolsOnly)];
    let err = session
        .lookup_symbol(&order, LookupKind::DlSym, "probe")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SymbolNotFound);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(
            LookupKind::DlSym,
            JitDylibLookupFlags::MatchExportedSymbolsOnly,
            vec!["probe".to_string()],
        )]
    );
}

#[test]
fn concurrent_misses_generate_once() {
    const THREADS: usize = 8;
    let session = ExecutionSession::new();
    let dylib = session.create_jit_dylib("main").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    dylib.add_generator_fn(move |_, dylib, _, names| {
        counter.fetch_add(1, Ordering::SeqCst);
        define_all(dylib, names, 0xbeef)
    });

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let session = session.clone();
            let dylib = dylib.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                session.lookup(&dylib, "shared")
            })
        })
        .collect();
    for handle in handles {
        let result = handle.join().expect("lookup thread panicked");
        assert_eq!(result, Ok(ExecutorAddr::new(0xbeef)));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn generator_lookups_do_not_block_other_misses() {
    let session = ExecutionSession::new();
    let main = session.create_jit_dylib("main").unwrap();
    let (entered_tx, entered_rx) = mpsc::channel();
    main.add_generator_fn(move |_, dylib, _, names| {
        let session = dylib.session().ok_or(OrcError::SessionEnded)?;
        let mut symbols = SymbolMap::default();
        for name in names {
            let addr = match name.as_str() {
                "helper" => 0x40,
                "outer" => {
                    entered_tx.send(()).unwrap();
                    session.lookup(dylib, "dep")?.value() + 1
                }
                _ => continue,
            };
            symbols.insert(
                name.clone(),
                EvaluatedSymbol::new(ExecutorAddr::new(addr), JitSymbolFlags::EXPORTED),
            );
        }
        dylib.define(&dylib.default_resource_tracker(), absolute_symbols(symbols))
    });

    // `dep` pauses mid-materialization, then misses `helper` in the same dylib.
    let (started_tx, started_rx) = mpsc::channel();
    let (proceed_tx, proceed_rx) = mpsc::channel::<()>();
    main.define(
        &main.create_resource_tracker(),
        MaterializationUnit::deferred(
            "dep",
            flags_map(&session, &["dep"]),
            move |mut responsibility| {
                started_tx.send(()).unwrap();
                proceed_rx.recv().unwrap();
                let dylib = responsibility.target_dylib().clone();
                let session = dylib.session().unwrap();
                let helper = session.lookup(&dylib, "helper").unwrap();
                let resolved = symbol_map(&session, &[("dep", helper.value() + 0x100)]);
                responsibility.notify_resolved(resolved).unwrap();
            },
        ),
    )
    .unwrap();

    let (result_tx, result_rx) = mpsc::channel();
    for name in ["dep", "outer"] {
        let session = session.clone();
        let main = main.clone();
        let result_tx = result_tx.clone();
        thread::spawn(move || result_tx.send((name, session.lookup(&main, name))));
        if name == "dep" {
            started_rx.recv().unwrap();
        } else {
            entered_rx.recv().unwrap();
        }
    }
    proceed_tx.send(()).unwrap();

    let mut results: Vec<_> = (0..2)
        .map(|_| {
            result_rx
                .recv_timeout(Duration::from_secs(10))
                .expect("lookups deadlocked")
        })
        .collect();
    results.sort_by_key(|(name, _)| *name);
    let expected: Vec<(&str, Result<ExecutorAddr, OrcError>)> = vec![
        ("dep", Ok(ExecutorAddr::new(0x140))),
        ("outer", Ok(ExecutorAddr::new(0x141))),
    ];
    assert_eq!(results, expected);
}

// ─── Stock generators ───

#[test]
fn static_symbol_generator_serves_allowed_names() {
    let session = ExecutionSession::new();
    let dylib = session.create_jit_dylib("main").unwrap();
    dylib.add_generator(
        StaticSymbolGenerator::new()
            .with_symbol("puts", ExecutorAddr::new(0x500), JitSymbolFlags::EXPORTED)
            .with_symbol("secret", ExecutorAddr::new(0x600), JitSymbolFlags::EXPORTED)
            .with_filter(|name| name != "secret"),
    );

    assert_eq!(session.lookup(&dylib, "puts").unwrap(), ExecutorAddr::new(0x500));
    assert_eq!(
        dylib.owner_of(&session.intern("puts")),
        Some(dylib.default_resource_tracker().key())
    );
    let err = session.lookup(&dylib, "secret").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SymbolNotFound);
    let err = session.lookup(&dylib, "printf").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SymbolNotFound);
}

#[test]
fn static_only_generator_ignores_dlsym_lookups() {
    let session = ExecutionSession::new();
    let dylib = session.create_jit_dylib("main").unwrap();
    dylib.add_generator(
        [(
            "malloc",
            EvaluatedSymbol::new(ExecutorAddr::new(0x700), JitSymbolFlags::EXPORTED),
        )]
        .into_iter()
        .collect::<StaticSymbolGenerator>()
        .static_lookups_only(),
    );
    let order = [(dylib.clone(), JitDylibLookupFlags::MatchAllSymbols)];

    let err = session
        .lookup_symbol(&order, LookupKind::DlSym, "malloc")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SymbolNotFound);

    let symbol = session
        .lookup_symbol(&order, LookupKind::Static, "malloc")
        .unwrap();
    assert_eq!(symbol.address(), ExecutorAddr::new(0x700));
    assert!(symbol.flags().is_exported());
}

#[test]
fn reexports_generator_forwards_to_source_dylib() {
    let session = ExecutionSession::new();
    let libm = session.create_jit_dylib("libm").unwrap();
    let main = session.create_jit_dylib("main").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let resolved = symbol_map(&session, &[("cos", 0xc05)]);
    let counter = runs.clone();
    libm.define(
        &libm.default_resource_tracker(),
        MaterializationUnit::deferred(
            "libm-cos",
            flags_map(&session, &["cos"]),
            move |mut responsibility| {
                counter.fetch_add(1, Ordering::SeqCst);
                responsibility.notify_resolved(resolved).unwrap();
            },
        ),
    )
    .unwrap();
    let mut hidden = symbol_map(&session, &[]);
    hidden.insert(
        session.intern("internal"),
        EvaluatedSymbol::new(ExecutorAddr::new(0x1), JitSymbolFlags::CALLABLE),
    );
    libm.define(&libm.default_resource_tracker(), absolute_symbols(hidden))
        .unwrap();

    main.add_generator(ReexportsGenerator::new(
        libm.clone(),
        JitDylibLookupFlags::MatchExportedSymbolsOnly,
    ));

    assert_eq!(session.lookup(&main, "cos").unwrap(), ExecutorAddr::new(0xc05));
    assert_eq!(session.lookup(&main, "cos").unwrap(), ExecutorAddr::new(0xc05));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(main.contains(&session.intern("cos")));

    let err = session.lookup(&main, "internal").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SymbolNotFound);
    assert!(!main.contains(&session.intern("internal")));
}

#[test]
fn reexports_are_revoked_with_their_source_tracker() {
    let session = ExecutionSession::new();
    let lib = session.create_jit_dylib("lib").unwrap();
    let main = session.create_jit_dylib("main").unwrap();
    let tracker = lib.create_resource_tracker();
    define_absolute(&session, &lib, &tracker, &[("f", 0xf00)]);
    main.add_generator(ReexportsGenerator::new(
        lib.clone(),
        JitDylibLookupFlags::MatchAllSymbols,
    ));

    assert_eq!(session.lookup(&main, "f").unwrap(), ExecutorAddr::new(0xf00));
    assert_eq!(main.owner_of(&session.intern("f")), Some(tracker.key()));

    tracker.remove().unwrap();
    assert_eq!(
        session.lookup(&main, "f"),
        Err(OrcError::symbol_not_found("f"))
    );
    assert!(!main.contains(&session.intern("f")));
    assert!(lib.is_empty());
}

// ─── Search order ───

#[test]
fn search_order_returns_first_match() {
    let session = ExecutionSession::new();
    let first = session.create_jit_dylib("first").unwrap();
    let second = session.create_jit_dylib("second").unwrap();
    define_absolute(
        &session,
        &second,
        &second.default_resource_tracker(),
        &[("f", 2), ("g", 3)],
    );
    define_absolute(&session, &first, &first.default_resource_tracker(), &[("f", 1)]);
    let order = [
        (first.clone(), JitDylibLookupFlags::MatchAllSymbols),
        (second.clone(), JitDylibLookupFlags::MatchAllSymbols),
    ];

    let f = session.lookup_symbol(&order, LookupKind::Static, "f").unwrap();
    let g = session.lookup_symbol(&order, LookupKind::Static, "g").unwrap();
    assert_eq!(f.address(), ExecutorAddr::new(1));
    assert_eq!(g.address(), ExecutorAddr::new(3));
}
