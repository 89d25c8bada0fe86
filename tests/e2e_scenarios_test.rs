//! End-to-end scenarios E1-E6: a package file on disk, run through the
//! full `Loader` -> `Builder` -> `Scheduler` pipeline, asserting on the
//! observable outcome exactly as a user of the CLI would see it.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flowmgr::event::NoopListener;
use flowmgr::{BodyRegistry, Builder, CacheLayer, Loader, MarkerLog, Overrides, Registry, RunConfig, RunOutcome, Scheduler};

fn write_package(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("flow.yaml");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    path
}

async fn run(
    path: &Path,
    task: &str,
    rundir: &Path,
    cache_root: Option<PathBuf>,
    nproc: Option<usize>,
) -> (RunOutcome, MarkerLog) {
    let (arena, _root_id) = Loader::new().load(path).unwrap();
    let markers = MarkerLog::new();
    let registry = Registry::new();
    let overrides = Overrides::new();
    let graph = Builder::new(&arena, &registry, &overrides, rundir.to_path_buf(), &markers)
        .build(task)
        .unwrap();

    let build_markers = markers.snapshot();
    assert!(!markers.has_errors(), "elaboration errors: {build_markers:?}");

    let mut bodies = BodyRegistry::new();
    flowmgr::stdlib::register(&mut bodies);

    let mut config = RunConfig::from_env(rundir.to_path_buf()).unwrap().with_cache_root(cache_root);
    if let Some(nproc) = nproc {
        config = config.with_nproc(nproc);
    }
    let cache = config.cache_root.clone().map(CacheLayer::local).map(Arc::new);

    let scheduler = Scheduler::new(
        Arc::new(arena),
        Arc::new(bodies),
        cache,
        config,
        Arc::new(markers),
        Arc::new(NoopListener),
    );
    let outcome = scheduler.run(graph).await.unwrap();
    let markers = MarkerLog::new();
    for m in outcome.markers() {
        markers.push(m);
    }
    (outcome, markers)
}

/// E1: `uses: std.Message` with `with: {msg: "hi"}` succeeds with status 0.
#[tokio::test]
async fn e1_std_message_runs_and_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = write_package(
        dir.path(),
        "package:\n  name: p\ntasks:\n  t:\n    uses: std.Message\n    with:\n      msg: \"hi\"\n",
    );
    let rundir = dir.path().join("run");
    let (outcome, _markers) = run(&pkg, "p.t", &rundir, None, None).await;

    assert!(outcome.is_success("p.t"));
    assert_eq!(outcome.final_status(), 0);
    let output = outcome.output("p.t").unwrap();
    assert_eq!(output[0].get("msg"), Some(&flowmgr::Value::str("hi")));
}

/// E2: a FileSet producer feeds a matching consumer; a mismatched
/// `filetype` still runs but a DataflowMismatch warning is emitted.
#[tokio::test]
async fn e2_dataflow_match_and_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = write_package(
        dir.path(),
        "package:\n  name: p\n\
         tasks:\n\
         \x20 produce:\n\
         \x20   uses: std.FileSet\n\
         \x20   with:\n\
         \x20     filetype: verilog\n\
         \x20     files: [\"a.v\", \"b.v\"]\n\
         \x20   produces:\n\
         \x20   - type: std.FileSet\n\
         \x20     with:\n\
         \x20       filetype: verilog\n\
         \x20 consume_match:\n\
         \x20   shell: \"echo consumed\"\n\
         \x20   needs: [produce]\n\
         \x20   consumes:\n\
         \x20   - type: std.FileSet\n\
         \x20     with:\n\
         \x20       filetype: verilog\n\
         \x20 consume_mismatch:\n\
         \x20   shell: \"echo consumed\"\n\
         \x20   needs: [produce]\n\
         \x20   consumes:\n\
         \x20   - type: std.FileSet\n\
         \x20     with:\n\
         \x20       filetype: vhdl\n",
    );
    let rundir = dir.path().join("run");

    let (outcome, markers) = run(&pkg, "p.consume_match", &rundir, None, None).await;
    assert!(outcome.is_success("p.produce"));
    assert!(outcome.is_success("p.consume_match"));
    assert!(markers.snapshot().iter().all(|m| m.kind != "DataflowMismatch"));

    let rundir2 = dir.path().join("run2");
    let (outcome2, markers2) = run(&pkg, "p.consume_mismatch", &rundir2, None, None).await;
    assert!(outcome2.is_success("p.consume_mismatch"));
    assert!(markers2.snapshot().iter().any(|m| m.kind == "DataflowMismatch"));
}

/// E3: a matrix compound task expands to one subtask per combination.
#[tokio::test]
async fn e3_matrix_expands_to_cartesian_product() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = write_package(
        dir.path(),
        "package:\n  name: p\n\
         tasks:\n\
         \x20 all:\n\
         \x20   strategy:\n\
         \x20     matrix:\n\
         \x20       topic: [x, y]\n\
         \x20       kind: [a, b]\n\
         \x20   subtasks:\n\
         \x20     msg:\n\
         \x20       uses: std.Message\n\
         \x20       with:\n\
         \x20         msg: \"${{ this.topic }}_${{ this.kind }}\"\n",
    );
    let rundir = dir.path().join("run");
    let (outcome, _markers) = run(&pkg, "p.all", &rundir, None, None).await;

    assert_eq!(outcome.final_status(), 0);
    // Matrix dimensions are iterated in sorted-key order (`kind` before
    // `topic`), so the clone-name suffix and the rendered message are
    // both `{kind}_{topic}`.
    for (kind, topic) in [("a", "x"), ("a", "y"), ("b", "x"), ("b", "y")] {
        let node_name = format!("p.all_{kind}_{topic}.msg");
        let output = outcome.output(&node_name).unwrap_or_else(|| panic!("missing output for {node_name}"));
        assert_eq!(output[0].get("msg"), Some(&flowmgr::Value::str(format!("{topic}_{kind}"))));
    }
}

/// E4: a cached task stores on the first run and hits cache on the second.
#[tokio::test]
async fn e4_cache_round_trip_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = write_package(
        dir.path(),
        "package:\n  name: p\ntasks:\n  build:\n    uses: std.FileSet\n    cache:\n      enabled: true\n    with:\n      filetype: verilog\n      files: [\"a.v\", \"b.v\"]\n",
    );
    let cache_root = dir.path().join("cache");

    let rundir1 = dir.path().join("run1");
    let (outcome1, _) = run(&pkg, "p.build", &rundir1, Some(cache_root.clone()), None).await;
    assert!(outcome1.is_success("p.build"));
    let result1 = outcome1.result("p.build").unwrap();
    assert!(!result1.cache_hit);
    assert_eq!(result1.output.len(), 1);

    let rundir2 = dir.path().join("run2");
    let (outcome2, _) = run(&pkg, "p.build", &rundir2, Some(cache_root), None).await;
    let result2 = outcome2.result("p.build").unwrap();
    assert!(result2.cache_hit);
    assert_eq!(result2.output.len(), result1.output.len());
    assert_eq!(result1.output[0].get("filetype"), result2.output[0].get("filetype"));

    // The restored file list must be the same *list* (both entries) and
    // each path must be retargeted to the *new* rundir, not the
    // original one the entry was stored from (§4.5 output_template
    // re-expansion).
    let Some(flowmgr::Value::List(paths1)) = result1.output[0].get("paths") else {
        panic!("expected a paths list");
    };
    let Some(flowmgr::Value::List(paths2)) = result2.output[0].get("paths") else {
        panic!("expected a paths list");
    };
    assert_eq!(paths1.len(), 2);
    assert_eq!(paths2.len(), paths1.len());
    for p2 in paths2 {
        let p2 = p2.as_str().unwrap();
        assert!(p2.starts_with(&rundir2.display().to_string()), "restored path {p2} not retargeted to rundir2");
    }
}

/// E5: a failing shell task cancels its dependent; final status is the
/// failing exit code.
#[tokio::test]
async fn e5_failure_cancels_downstream_and_propagates_status() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = write_package(
        dir.path(),
        "package:\n  name: p\n\
         tasks:\n\
         \x20 fails:\n\
         \x20   shell: \"exit 2\"\n\
         \x20 downstream:\n\
         \x20   shell: \"echo never\"\n\
         \x20   needs: [fails]\n",
    );
    let rundir = dir.path().join("run");
    let (outcome, _markers) = run(&pkg, "p.downstream", &rundir, None, None).await;

    assert_eq!(outcome.final_status(), 2);
    assert!(!outcome.is_success("p.fails"));
    let downstream = outcome.result("p.downstream").unwrap();
    assert!(matches!(downstream.status, flowmgr::TaskStatus::Cancelled));
}
