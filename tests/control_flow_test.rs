//! Property #10: control-flow semantics observed end to end through a
//! running graph rather than unit-tested against `run_control_inner`
//! directly.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flowmgr::event::NoopListener;
use flowmgr::{BodyRegistry, Builder, Loader, MarkerLog, Overrides, Registry, RunConfig, RunOutcome, Scheduler, TaskStatus};

fn write_package(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("flow.yaml");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    path
}

async fn run(path: &Path, task: &str, rundir: &Path) -> RunOutcome {
    let (arena, _root_id) = Loader::new().load(path).unwrap();
    let markers = MarkerLog::new();
    let registry = Registry::new();
    let overrides = Overrides::new();
    let graph = Builder::new(&arena, &registry, &overrides, rundir.to_path_buf(), &markers)
        .build(task)
        .unwrap();
    assert!(!markers.has_errors());

    let mut bodies = BodyRegistry::new();
    flowmgr::stdlib::register(&mut bodies);
    let config = RunConfig::from_env(rundir.to_path_buf()).unwrap().with_cache_root(None);

    let scheduler = Scheduler::new(
        Arc::new(arena),
        Arc::new(bodies),
        None,
        config,
        Arc::new(markers),
        Arc::new(NoopListener),
    );
    scheduler.run(graph).await.unwrap()
}

/// `if` with `cond=false` never runs its body.
#[tokio::test]
async fn if_false_skips_without_running_body() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("counter");
    let pkg = write_package(
        dir.path(),
        &format!(
            "package:\n  name: p\ntasks:\n  t:\n    control:\n      kind: if\n      cond: \"false\"\n    shell: \"echo x >> {}\"\n",
            counter.display()
        ),
    );
    let rundir = dir.path().join("run");
    let outcome = run(&pkg, "p.t", &rundir).await;

    assert_eq!(outcome.result("p.t").unwrap().status, TaskStatus::Skipped);
    assert!(!counter.exists(), "body must not have run");
}

/// `if` with `cond=true` runs its body exactly once.
#[tokio::test]
async fn if_true_runs_body_once() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("counter");
    let pkg = write_package(
        dir.path(),
        &format!(
            "package:\n  name: p\ntasks:\n  t:\n    control:\n      kind: if\n      cond: \"true\"\n    shell: \"echo x >> {}\"\n",
            counter.display()
        ),
    );
    let rundir = dir.path().join("run");
    let outcome = run(&pkg, "p.t", &rundir).await;

    assert!(outcome.is_success("p.t"));
    let lines = std::fs::read_to_string(&counter).unwrap().lines().count();
    assert_eq!(lines, 1);
}

/// `repeat count=N until=<always true>` stops after the first iteration.
#[tokio::test]
async fn repeat_stops_on_first_iteration_where_until_holds() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("counter");
    let pkg = write_package(
        dir.path(),
        &format!(
            "package:\n  name: p\n\
             tasks:\n\
             \x20 t:\n\
             \x20   control:\n\
             \x20     kind: repeat\n\
             \x20     count: \"5\"\n\
             \x20     until: \"state.done\"\n\
             \x20     state:\n\
             \x20       init:\n\
             \x20         done: true\n\
             \x20   shell: \"echo x >> {}\"\n",
            counter.display()
        ),
    );
    let rundir = dir.path().join("run");
    let outcome = run(&pkg, "p.t", &rundir).await;

    assert!(outcome.is_success("p.t"));
    let lines = std::fs::read_to_string(&counter).unwrap().lines().count();
    assert_eq!(lines, 1, "expected exactly one iteration, ran {lines}");
}

/// `repeat count=N until=<always false>` runs the full N iterations.
#[tokio::test]
async fn repeat_runs_full_count_when_until_never_holds() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("counter");
    let pkg = write_package(
        dir.path(),
        &format!(
            "package:\n  name: p\n\
             tasks:\n\
             \x20 t:\n\
             \x20   control:\n\
             \x20     kind: repeat\n\
             \x20     count: \"5\"\n\
             \x20     until: \"state.done\"\n\
             \x20     state:\n\
             \x20       init:\n\
             \x20         done: false\n\
             \x20   shell: \"echo x >> {}\"\n",
            counter.display()
        ),
    );
    let rundir = dir.path().join("run");
    let outcome = run(&pkg, "p.t", &rundir).await;

    assert!(outcome.is_success("p.t"));
    let lines = std::fs::read_to_string(&counter).unwrap().lines().count();
    assert_eq!(lines, 5);
}

/// `do-while` runs its body at least once even when `until` holds from
/// the start (unlike `if`/`while`, which may run zero times).
#[tokio::test]
async fn do_while_runs_body_at_least_once() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("counter");
    let pkg = write_package(
        dir.path(),
        &format!(
            "package:\n  name: p\n\
             tasks:\n\
             \x20 t:\n\
             \x20   control:\n\
             \x20     kind: do-while\n\
             \x20     until: \"true\"\n\
             \x20     max_iter: 10\n\
             \x20   shell: \"echo x >> {}\"\n",
            counter.display()
        ),
    );
    let rundir = dir.path().join("run");
    let outcome = run(&pkg, "p.t", &rundir).await;

    assert!(outcome.is_success("p.t"));
    let lines = std::fs::read_to_string(&counter).unwrap().lines().count();
    assert_eq!(lines, 1);
}

/// `while cond=false` never runs its body (contrast with `do-while`).
#[tokio::test]
async fn while_false_never_runs_body() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("counter");
    let pkg = write_package(
        dir.path(),
        &format!(
            "package:\n  name: p\n\
             tasks:\n\
             \x20 t:\n\
             \x20   control:\n\
             \x20     kind: while\n\
             \x20     cond: \"false\"\n\
             \x20     max_iter: 10\n\
             \x20   shell: \"echo x >> {}\"\n",
            counter.display()
        ),
    );
    let rundir = dir.path().join("run");
    let outcome = run(&pkg, "p.t", &rundir).await;

    assert_eq!(outcome.result("p.t").unwrap().status, TaskStatus::Skipped);
    assert!(!counter.exists());
}

/// `while cond: "state.count < 3"` with a body that reports `count` via
/// its output stops after exactly 3 iterations — the condition is
/// evaluated against state the body itself mutated, not a constant, so
/// a body that never changed anything would either never stop (until
/// `max_iter`) or never start.
#[tokio::test]
async fn while_terminates_on_state_mutated_by_body_not_a_constant() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = write_package(
        dir.path(),
        "package:\n  name: p\n\
         tasks:\n\
         \x20 t:\n\
         \x20   control:\n\
         \x20     kind: while\n\
         \x20     cond: \"state.count < 3\"\n\
         \x20     max_iter: 10\n\
         \x20     state:\n\
         \x20       init:\n\
         \x20         count: 0\n\
         \x20   uses: std.Counter\n",
    );
    let rundir = dir.path().join("run");
    let outcome = run(&pkg, "p.t", &rundir).await;

    assert!(outcome.is_success("p.t"));
    let output = outcome.output("p.t").unwrap();
    assert_eq!(output[0].get("count"), Some(&flowmgr::Value::Int(3)));
}

/// `do-while until: "state.count >= 3"` likewise runs until the body's
/// reported state crosses the threshold, not for a fixed number of
/// iterations decided up front.
#[tokio::test]
async fn do_while_terminates_on_state_mutated_by_body_not_a_constant() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = write_package(
        dir.path(),
        "package:\n  name: p\n\
         tasks:\n\
         \x20 t:\n\
         \x20   control:\n\
         \x20     kind: do-while\n\
         \x20     until: \"state.count >= 3\"\n\
         \x20     max_iter: 10\n\
         \x20     state:\n\
         \x20       init:\n\
         \x20         count: 0\n\
         \x20   uses: std.Counter\n",
    );
    let rundir = dir.path().join("run");
    let outcome = run(&pkg, "p.t", &rundir).await;

    assert!(outcome.is_success("p.t"));
    let output = outcome.output("p.t").unwrap();
    assert_eq!(output[0].get("count"), Some(&flowmgr::Value::Int(3)));
}

/// A body that signals `_break` in its reported state stops a `repeat`
/// loop early, before its `count` iterations or its `until` condition
/// would otherwise have ended it.
#[tokio::test]
async fn repeat_honors_break_signal_from_body_state() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = write_package(
        dir.path(),
        "package:\n  name: p\n\
         tasks:\n\
         \x20 t:\n\
         \x20   control:\n\
         \x20     kind: repeat\n\
         \x20     count: \"10\"\n\
         \x20     until: \"state.never\"\n\
         \x20     state:\n\
         \x20       init:\n\
         \x20         never: false\n\
         \x20   uses: std.Counter\n\
         \x20   with:\n\
         \x20     step: 1\n\
         \x20     break_at: 4\n",
    );
    let rundir = dir.path().join("run");
    let outcome = run(&pkg, "p.t", &rundir).await;

    assert!(outcome.is_success("p.t"));
    let output = outcome.output("p.t").unwrap();
    // `count` stops at 4 (the `break_at` threshold), well short of the
    // 10 iterations `count: "10"` alone would have run, proving the
    // `_break` sentinel from body-reported state — not `until` — ended
    // the loop.
    assert_eq!(output[0].get("count"), Some(&flowmgr::Value::Int(4)));
}
