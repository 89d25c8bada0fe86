//! Testable properties #8 (native boolean stringification through
//! whole-string substitution), #9 (diagnostics report the *expanded*
//! reference, not the raw `${{ }}` template), and #11 (a `local`-scoped
//! task that nothing reaches from the chosen root is flagged, not
//! silently dropped).

use std::io::Write as _;
use std::path::{Path, PathBuf};

use flowmgr::{Builder, FlowError, Loader, MarkerLog, Overrides, Registry};

fn write_package(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("flow.yaml");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    path
}

/// Property #8: a bare `${{ }}` substitution of a boolean renders the
/// native `True`/`False` form, matching the task-definition-language
/// convention rather than JSON's `true`/`false`.
#[test]
fn boolean_substitution_uses_native_stringification() {
    let mut locals = std::collections::BTreeMap::new();
    locals.insert("flag".to_string(), flowmgr::Value::Bool(true));
    locals.insert("off".to_string(), flowmgr::Value::Bool(false));
    let scope = flowmgr::Scope::new().with_locals(locals);

    let rendered = flowmgr::substitute("state is ${{ flag }}, other is ${{ off }}", &scope).unwrap();
    assert_eq!(rendered.to_string(), "state is True, other is False");
}

/// Property #9: when a `uses:` target built from `${{ }}` expansion
/// doesn't resolve to any known task or type, the error names the
/// *expanded* target (`hdlsim.nope.SimImage`), not the raw template
/// (`hdlsim.${{ SIM }}.SimImage`) — a user debugging the failure needs
/// to see what the expression actually evaluated to.
#[test]
fn unresolved_uses_reference_error_names_the_expanded_target() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = write_package(
        dir.path(),
        "package:\n  name: p\n  vars:\n    SIM: nope\ntasks:\n  t:\n    uses: \"hdlsim.${{ SIM }}.SimImage\"\n",
    );
    let err = Loader::new().load(&pkg).unwrap_err();
    match err {
        FlowError::UnknownReference { expanded, template } => {
            assert_eq!(expanded, "hdlsim.nope.SimImage");
            assert_eq!(template, "hdlsim.${{ SIM }}.SimImage");
        }
        other => panic!("expected UnknownReference, got {other:?}"),
    }
}

/// Property #11: a `visibility: local` task that the chosen root never
/// transitively needs is reachable by name (visibility doesn't gate
/// root selection) but is flagged `UnusedTask` precisely because
/// nothing else reaches it — it isn't silently compiled away.
#[test]
fn local_task_unreachable_from_root_is_flagged_unused() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = write_package(
        dir.path(),
        "package:\n  name: p\ntasks:\n  helper:\n    visibility: local\n    shell: \"echo helper\"\n  main:\n    shell: \"echo main\"\n",
    );
    let (arena, _root_id) = Loader::new().load(&pkg).unwrap();
    let registry = Registry::new();
    let overrides = Overrides::new();
    let markers = MarkerLog::new();
    let rundir = dir.path().join("run");

    Builder::new(&arena, &registry, &overrides, rundir, &markers).build("p.main").unwrap();

    let snapshot = markers.snapshot();
    assert!(
        snapshot.iter().any(|m| m.kind == "UnusedTask" && m.msg.contains("p.helper")),
        "expected an UnusedTask marker naming p.helper, got {snapshot:?}"
    );
}

/// The same `local` task, chosen directly as root, still builds: a
/// visibility restriction only affects reachability reporting relative
/// to *another* root, not direct selection.
#[test]
fn local_task_can_still_be_built_directly_as_root() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = write_package(
        dir.path(),
        "package:\n  name: p\ntasks:\n  helper:\n    visibility: local\n    shell: \"echo helper\"\n  main:\n    shell: \"echo main\"\n",
    );
    let (arena, _root_id) = Loader::new().load(&pkg).unwrap();
    let registry = Registry::new();
    let overrides = Overrides::new();
    let markers = MarkerLog::new();
    let rundir = dir.path().join("run");

    let graph = Builder::new(&arena, &registry, &overrides, rundir, &markers).build("p.helper").unwrap();
    assert_eq!(graph.len(), 1);
}
