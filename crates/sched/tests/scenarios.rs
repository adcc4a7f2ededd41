//! End-to-end scenarios: exploration, replay and persistence through the
//! public driver surface.

use std::sync::Arc;

use parking_lot::Mutex;

use interlace_sched::check::{assume, assume_eq};
use interlace_sched::sample::ConcurrentList;
use interlace_sched::{yield_point, ActionLog, ExploreConfig, Mode, Pruned, Scenario, SchedError, TransferEvent};

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

type Shared = Arc<Mutex<Vec<&'static str>>>;

/// Two threads that each append their name once, with no yield points.
fn two_appenders(sc: &mut Scenario) -> Shared {
    let out: Shared = Arc::new(Mutex::new(Vec::new()));
    for name in ["a", "b"] {
        let out = Arc::clone(&out);
        sc.add_thread(name, move || {
            out.lock().push(name);
            Ok(())
        })
        .unwrap();
    }
    let o = Arc::clone(&out);
    sc.add_setup(move |_| {
        o.lock().clear();
        Ok(())
    });
    out
}

fn expect_order(sc: &mut Scenario, out: &Shared, expected: &'static [&'static str]) {
    let out = Arc::clone(out);
    sc.add_teardown(move |_| assume_eq(expected, &out.lock()[..]));
}

#[test]
fn test_exists_finds_first_order_immediately() {
    init_test_logging();
    let mut sc = Scenario::new();
    let out = two_appenders(&mut sc);
    expect_order(&mut sc, &out, &["a", "b"]);

    let report = sc.explore_exists().unwrap();
    assert_eq!(report.paths, 1);
    assert_eq!(report.runs, 1);
    assert_eq!(
        report.log.to_text(),
        "main, main, 1 -> a\na, ending, 1 -> main\nmain, main, 1 -> b\nb, ending, 1 -> main\n"
    );
}

#[test]
fn test_exists_backtracks_to_reversed_order() {
    init_test_logging();
    let mut sc = Scenario::new();
    let out = two_appenders(&mut sc);
    expect_order(&mut sc, &out, &["b", "a"]);

    let report = sc.explore_exists().unwrap();
    assert_eq!(report.runs, 3);
    assert_eq!(report.backtracks, 2);
    assert_eq!(
        report.log.to_text(),
        "main, main, 1 -> b\nb, ending, 1 -> main\nmain, main, 1 -> a\na, ending, 1 -> main\n"
    );
}

#[test]
fn test_forall_reports_exactly_two_orders() {
    init_test_logging();
    let mut sc = Scenario::new();
    let out = two_appenders(&mut sc);
    let finals: Arc<Mutex<Vec<Vec<&'static str>>>> = Arc::default();
    let (o, f) = (Arc::clone(&out), Arc::clone(&finals));
    sc.add_teardown(move |_| {
        f.lock().push(o.lock().clone());
        Ok(())
    });

    let report = sc.explore_forall().unwrap();
    assert_eq!(report.paths, 2);
    assert_eq!(*finals.lock(), vec![vec!["a", "b"], vec!["b", "a"]]);
}

#[test]
fn test_no_feasible_execution() {
    init_test_logging();
    let mut sc = Scenario::new();
    two_appenders(&mut sc);
    sc.add_teardown(|_| assume(false, "never satisfied"));
    assert!(matches!(sc.explore_exists(), Err(SchedError::NoFeasibleExecution)));
    assert!(matches!(sc.explore_forall(), Err(SchedError::NoFeasibleExecution)));
}

const ALTERNATION: &str = "\
main, main, 1 -> producer
producer, add_2, 1 -> main
main, main, 1 -> consumer
consumer, take_2, 1 -> main
main, main, 1 -> producer
producer, add_2, 1 -> main
main, main, 1 -> consumer
consumer, take_2, 1 -> main
main, main, 1 -> producer
producer, ending, 1 -> main
main, main, 1 -> consumer
consumer, ending, 1 -> main
";

#[test]
fn test_replay_capacity_one_alternation() {
    init_test_logging();
    let list = ConcurrentList::with_capacity(1);
    let states: Arc<Mutex<Vec<Vec<char>>>> = Arc::default();

    let mut sc = Scenario::replaying(ActionLog::parse(ALTERNATION).unwrap());
    let producer = list.clone();
    sc.add_thread("producer", move || {
        producer.add('x')?;
        producer.add('y')
    })
    .unwrap();
    let consumer = list.clone();
    sc.add_thread("consumer", move || {
        consumer.take()?;
        consumer.take()?;
        Ok(())
    })
    .unwrap();
    let (l, st) = (list.clone(), Arc::clone(&states));
    sc.add_setup(move |_| {
        l.clear();
        st.lock().clear();
        Ok(())
    });
    let (l, st) = (list.clone(), Arc::clone(&states));
    sc.with_body(move |d| {
        let record = |st: &Mutex<Vec<Vec<char>>>| {
            let now = l.contents();
            let mut st = st.lock();
            if st.last() != Some(&now) {
                st.push(now);
            }
        };
        record(&st);
        while !d.all_ended() {
            d.transfer(None)?;
            record(&st);
        }
        Ok(())
    });

    let report = sc.replay(false).unwrap();
    assert_eq!(report.mode, Mode::Replay);
    assert_eq!(report.paths, 1);
    assert_eq!(*states.lock(), vec![vec![], vec!['x'], vec![], vec!['y'], vec![]]);
}

#[test]
fn test_replay_is_deterministic_across_save_and_load() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schedule.txt");

    let mut explored = Scenario::new();
    let out = two_appenders(&mut explored);
    expect_order(&mut explored, &out, &["b", "a"]);
    explored.explore_exists().unwrap();
    explored.save_to(&path).unwrap();

    let mut replayed = Scenario::load(&path).unwrap();
    assert_eq!(replayed.mode(), Mode::Replay);
    let out = two_appenders(&mut replayed);

    replayed.replay(false).unwrap();
    let first = replayed.transcript();
    assert_eq!(*out.lock(), ["b", "a"]);
    replayed.replay(false).unwrap();
    assert_eq!(replayed.transcript(), first);
    assert_eq!(*out.lock(), ["b", "a"]);

    let triples: Vec<String> = first
        .iter()
        .map(|e| format!("{}, {} -> {}", e.source, e.yield_label, e.target))
        .collect();
    assert_eq!(
        triples,
        ["main, main -> b", "b, ending -> main", "main, main -> a", "a, ending -> main"]
    );
}

#[test]
fn test_open_explores_then_replays() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("open.txt");

    let mut first = Scenario::open(&path).unwrap();
    assert_eq!(first.mode(), Mode::Explore);
    two_appenders(&mut first);
    first.run(false).unwrap();
    first.save().unwrap();

    let mut second = Scenario::open(&path).unwrap();
    assert_eq!(second.mode(), Mode::Replay);
    assert_eq!(second.path(), Some(path.as_path()));
    let out = two_appenders(&mut second);
    second.run(false).unwrap();
    assert_eq!(*out.lock(), ["a", "b"]);
}

#[test]
fn test_stale_log_is_a_replay_mismatch() {
    init_test_logging();
    let log = ActionLog::parse("main, main, 1 -> a\nb, ending, 1 -> main\n").unwrap();
    let mut sc = Scenario::replaying(log);
    two_appenders(&mut sc);
    let err = sc.replay(false).unwrap_err();
    assert!(err.is_replay_mismatch(), "{err}");
    assert!(matches!(err, SchedError::ReplayMismatch { index: 1, .. }));
}

#[test]
fn test_short_log_is_exhausted() {
    init_test_logging();
    let mut sc = Scenario::replaying(ActionLog::parse("main, main, 1 -> a\n").unwrap());
    two_appenders(&mut sc);
    assert!(matches!(sc.replay(false), Err(SchedError::LogExhausted { .. })));
}

#[test]
fn test_failed_replay_falls_back_to_search() {
    init_test_logging();
    let log = ActionLog::parse(
        "main, main, 1 -> a\na, ending, 1 -> main\nmain, main, 1 -> b\nb, ending, 1 -> main\n",
    )
    .unwrap();

    let mut strict = Scenario::replaying(log.clone());
    let out = two_appenders(&mut strict);
    expect_order(&mut strict, &out, &["b", "a"]);
    assert!(matches!(strict.replay(false), Err(SchedError::ReplayFailed { .. })));

    let mut lenient = Scenario::replaying(log);
    let out = two_appenders(&mut lenient);
    expect_order(&mut lenient, &out, &["b", "a"]);
    let report = lenient.replay(true).unwrap();
    assert_eq!(report.mode, Mode::Explore);
    assert_eq!(lenient.mode(), Mode::Explore);
    assert_eq!(*out.lock(), ["b", "a"]);
}

#[test]
fn test_until_holds_thread_at_label() {
    init_test_logging();
    let list = ConcurrentList::new();
    let mut sc = Scenario::new();
    let p = list.clone();
    sc.add_thread("p", move || p.add(1)).unwrap();
    let l = list.clone();
    sc.add_setup(move |_| {
        l.clear();
        Ok(())
    });
    let l = list.clone();
    sc.with_body(move |d| {
        d.until("add_2").transfer(Some("p"))?;
        assert_eq!(l.contents(), [1]);
        assert!(!d.is_ended("p"));
        d.transfer(Some("p"))?;
        assert!(d.is_ended("p"));
        Ok(())
    });

    let report = sc.explore_exists().unwrap();
    assert_eq!(
        report.log.to_text(),
        "main, main, 1 -> p\np, add_2, 1 -> main\nmain, main, 1 -> p\np, ending, 1 -> main\n"
    );
}

#[test]
fn test_finish_swallows_yields() {
    init_test_logging();
    let mut sc = Scenario::new();
    for name in ["a", "b"] {
        sc.add_thread(name, || yield_point("step")).unwrap();
    }
    sc.with_body(|d| {
        d.finish("a")?.finish("b")?;
        Ok(())
    });

    let report = sc.explore_exists().unwrap();
    assert_eq!(report.log.to_text(), "a, ending, 1 -> main\nb, ending, 1 -> main\n");
    assert!(sc.transcript().iter().all(|e| e.yield_label == "ending"));
}

#[test]
fn test_threads_created_by_the_body() {
    init_test_logging();
    let hits: Arc<Mutex<u32>> = Arc::default();
    let mut sc = Scenario::with_config(ExploreConfig::new().max_runs(50));
    let h = Arc::clone(&hits);
    sc.with_body(move |d| {
        let h = Arc::clone(&h);
        d.thread("worker", move || {
            *h.lock() += 1;
            Ok(())
        })?;
        d.transfer(Some("worker"))?;
        Ok(())
    });

    let report = sc.explore_forall().unwrap();
    assert_eq!(report.paths, 1);
    assert_eq!(*hits.lock(), 1);
    sc.explore_exists().unwrap();
    assert_eq!(*hits.lock(), 2);
}

#[test]
#[should_panic(expected = "broken invariant")]
fn test_assertion_in_thread_aborts_search() {
    init_test_logging();
    let mut sc = Scenario::new();
    sc.add_thread("bad", || {
        assert!(1 + 1 == 3, "broken invariant");
        Ok(())
    })
    .unwrap();
    let _ = sc.explore_forall();
}

#[test]
fn test_prune_inside_thread_backtracks() {
    init_test_logging();
    let out: Shared = Arc::default();
    let mut sc = Scenario::new();
    for name in ["a", "b"] {
        let out = Arc::clone(&out);
        sc.add_thread(name, move || {
            // b may only run after a
            if name == "b" && out.lock().is_empty() {
                return Err(Pruned::new("b before a"));
            }
            out.lock().push(name);
            Ok(())
        })
        .unwrap();
    }
    let o = Arc::clone(&out);
    sc.add_setup(move |_| {
        o.lock().clear();
        Ok(())
    });

    let report = sc.explore_forall().unwrap();
    assert_eq!(report.paths, 1);
}

fn event(source: &str, yield_label: &str, target: &str) -> TransferEvent {
    TransferEvent {
        source: source.to_string(),
        yield_label: yield_label.to_string(),
        target: target.to_string(),
    }
}

/// Each thread steps once, from its own call site.
fn two_steppers(log: Option<ActionLog>) -> Scenario {
    let mut sc = match log {
        Some(log) => Scenario::replaying(log),
        None => Scenario::new(),
    };
    sc.add_thread("a", || yield_point("step")).unwrap();
    sc.add_thread("b", || yield_point("step")).unwrap();
    sc.with_body(|d| {
        d.until("step").transfer(Some("a"))?;
        d.until("step").transfer(Some("b"))?;
        while !d.all_ended() {
            d.transfer_star()?;
        }
        Ok(())
    });
    sc
}

#[test]
fn test_threads_may_share_a_yield_label() {
    init_test_logging();
    let mut sc = two_steppers(None);
    let report = sc.explore_exists().unwrap();
    assert_eq!(
        report.log.to_text(),
        "main, main, 1 -> a\na, step, 1 -> main\nmain, main, 1 -> b\nb, step, 1 -> main\n\
         main, main, 1 -> a\na, ending, 1 -> main\nmain, main, 1 -> b\nb, ending, 1 -> main\n"
    );

    let mut replayed = two_steppers(Some(report.log));
    replayed.replay(false).unwrap();
    let transcript = replayed.transcript();
    assert_eq!(transcript[1], event("a", "step", "main"));
    assert_eq!(transcript[3], event("b", "step", "main"));
}

#[test]
fn test_labels_must_fit_the_log_format() {
    init_test_logging();
    let mut sc = Scenario::new();
    assert!(matches!(
        sc.add_thread("w, x", || Ok(())),
        Err(SchedError::InvalidLabel { .. })
    ));

    sc.add_thread("w", || yield_point("step -> 2")).unwrap();
    assert!(matches!(sc.explore_exists(), Err(SchedError::InvalidLabel { .. })));
}

#[test]
fn test_until_end_runs_thread_to_completion() {
    init_test_logging();
    let mut sc = Scenario::new();
    sc.add_thread("t", || {
        yield_point("t_1")?;
        yield_point("t_2")
    })
    .unwrap();
    sc.with_body(|d| {
        d.until_end().transfer(Some("t"))?;
        assert!(d.is_ended("t"));
        Ok(())
    });

    let report = sc.explore_exists().unwrap();
    assert_eq!(report.log.to_text(), "main, main, 1 -> t\nt, ending, 1 -> main\n");
}

#[test]
fn test_until_with_filters_on_source() {
    init_test_logging();
    let hits: Shared = Arc::default();
    let mut sc = Scenario::new();
    for name in ["a", "b"] {
        let hits = Arc::clone(&hits);
        sc.add_thread(name, move || {
            hits.lock().push(name);
            yield_point("tick")?;
            hits.lock().push(name);
            Ok(())
        })
        .unwrap();
    }
    let h = Arc::clone(&hits);
    sc.add_setup(move |_| {
        h.lock().clear();
        Ok(())
    });
    sc.with_body(|d| {
        d.until_with(|e| e.source == "b").transfer(None)?;
        while !d.all_ended() {
            d.transfer_star()?;
        }
        Ok(())
    });

    // the first free choice runs `a`, whose yields never satisfy the predicate
    let report = sc.explore_exists().unwrap();
    assert!(report.runs > 1);
    assert_eq!(sc.transcript()[..2], [event("main", "main", "b"), event("b", "tick", "main")]);
    assert_eq!(*hits.lock(), ["b", "a", "a", "b"]);
}

fn resumed_scenario(log: Option<ActionLog>) -> Scenario {
    let mut sc = match log {
        Some(log) => Scenario::replaying(log),
        None => Scenario::new(),
    };
    sc.add_thread("t", || yield_point("t_1")).unwrap();
    sc.with_body(|d| {
        d.resume("t")?;
        assert!(d.is_ended("t"));
        Ok(())
    });
    sc
}

#[test]
fn test_resume_is_not_recorded() {
    init_test_logging();
    let mut sc = resumed_scenario(None);
    let report = sc.explore_exists().unwrap();
    assert_eq!(report.log.to_text(), "t, ending, 1 -> main\n");

    let mut replayed = resumed_scenario(Some(report.log));
    replayed.replay(false).unwrap();
    assert_eq!(replayed.transcript(), [event("t", "ending", "main")]);
}
