//! The scheduler (C7, §4.8): a cooperative, bounded-parallelism executor
//! that walks a [`TaskGraph`] to completion. Leaf/control nodes run as
//! spawned tasks gated by the jobserver; structural nodes (compounds and
//! synthetic `in` nodes) are folded in synchronously as soon as their
//! inputs are ready, since they do no real work of their own.
//!
//! A ready-set scan over a `JoinSet`, emitting listener events as each
//! node starts, completes, is skipped, or is cancelled, generalized from
//! a flat task list to a graph with structural aggregation, memento/cache
//! gating, and control flow.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheLayer, HashInput, HashRecipe};
use crate::config::RunConfig;
use crate::error::{FlowError, Result};
use crate::event::{Marker, MarkerLog, TaskEvent, TaskListener};
use crate::graph::{NodeId, TaskGraph, TaskNode, NodeBody};
use crate::loader::PackageArena;
use crate::model::{Body, ConsumesSpec, ControlFlow, Passthrough, Pattern};
use crate::store::{DataItem, OutputStore, TaskResult, TaskStatus};
use crate::util::constants::JOBSERVER_ACQUIRE_TIMEOUT;
use crate::value::Value;

use super::body::{run_shell, BodyRegistry};
use super::context::RunContext;
use super::data::TaskInput;
use super::dynamic::DynamicHandle;
use super::memento;
use crate::expr::{Scope};
use crate::jobserver::JobServer;

/// State shared between the coordinator loop and every spawned node task,
/// and reused by [`super::dynamic`] for both joint and nested dynamic
/// submission.
pub(crate) struct Shared {
    pub(crate) arena: Arc<PackageArena>,
    pub(crate) bodies: Arc<BodyRegistry>,
    pub(crate) cache: Option<Arc<CacheLayer>>,
    pub(crate) config: RunConfig,
    pub(crate) markers: Arc<MarkerLog>,
    pub(crate) listener: Arc<dyn TaskListener>,
    pub(crate) jobserver: JobServer,
    pub(crate) store: OutputStore,
    pub(crate) graph: RwLock<TaskGraph>,
    pub(crate) cancel: CancellationToken,
    /// Last memento computed for each node that has finished, keyed by
    /// run name — consulted by a node's dependents, not by itself.
    pub(crate) mementos: DashMap<Arc<str>, String>,
    pub(crate) seen_rundirs: Mutex<HashSet<PathBuf>>,
    /// Woken whenever the store gains an entry or the graph gains a
    /// dynamically-submitted node, so waiters never just poll blindly.
    pub(crate) wake: Notify,
}

/// Pre-run builder for a [`Scheduler`]. Each field mirrors one of the
/// run's fixed collaborators; `run` consumes `self` since a scheduler is
/// single-use, same as the builder it sits downstream of.
pub struct Scheduler {
    arena: Arc<PackageArena>,
    bodies: Arc<BodyRegistry>,
    cache: Option<Arc<CacheLayer>>,
    config: RunConfig,
    markers: Arc<MarkerLog>,
    listener: Arc<dyn TaskListener>,
}

impl Scheduler {
    pub fn new(
        arena: Arc<PackageArena>,
        bodies: Arc<BodyRegistry>,
        cache: Option<Arc<CacheLayer>>,
        config: RunConfig,
        markers: Arc<MarkerLog>,
        listener: Arc<dyn TaskListener>,
    ) -> Self {
        Self {
            arena,
            bodies,
            cache,
            config,
            markers,
            listener,
        }
    }

    /// Run `graph` to completion. Node failures are fail-fast (they
    /// cancel the rest of the run) but never propagate as an `Err` here —
    /// inspect [`RunOutcome`] for per-task status and the marker log for
    /// diagnostics. `Err` is reserved for run setup itself (an invalid
    /// `nproc`, a broken jobserver).
    pub async fn run(self, graph: TaskGraph) -> Result<RunOutcome> {
        self.config.validate()?;
        let jobserver = JobServer::new(self.config.nproc, &self.config.rundir)?;

        let shared = Arc::new(Shared {
            arena: self.arena,
            bodies: self.bodies,
            cache: self.cache,
            config: self.config,
            markers: self.markers,
            listener: self.listener,
            jobserver,
            store: OutputStore::new(),
            graph: RwLock::new(graph),
            cancel: CancellationToken::new(),
            mementos: DashMap::new(),
            seen_rundirs: Mutex::new(HashSet::new()),
            wake: Notify::new(),
        });

        drive(Arc::clone(&shared)).await;

        Ok(RunOutcome { shared })
    }
}

/// The finished state of a run: every node's result is in `store`, every
/// diagnostic is in `markers`. Exposes just enough of the internal
/// `Shared` state for a caller (or a nested [`super::dynamic::run_nested`]
/// call) to read it back.
pub struct RunOutcome {
    shared: Arc<Shared>,
}

impl RunOutcome {
    pub fn root(&self) -> NodeId {
        self.shared.graph.read().root()
    }

    pub fn output(&self, name: &str) -> Option<Vec<DataItem>> {
        self.shared.store.get_output(name)
    }

    pub fn result(&self, name: &str) -> Option<TaskResult> {
        self.shared.store.get(name)
    }

    pub fn is_success(&self, name: &str) -> bool {
        self.shared.store.is_success(name)
    }

    pub fn markers(&self) -> Vec<Marker> {
        self.shared.markers.snapshot()
    }

    pub fn has_errors(&self) -> bool {
        self.shared.markers.has_errors()
    }

    /// The run's overall exit status (§6): `max` of every node's own
    /// status, so a single failing task anywhere in the graph makes the
    /// whole run non-zero.
    pub fn final_status(&self) -> i32 {
        let graph = self.shared.graph.read();
        graph
            .iter()
            .filter_map(|(_, node)| self.shared.store.get(&node.name))
            .map(|r| r.status.exit_code())
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn graph(&self) -> parking_lot::RwLockReadGuard<'_, TaskGraph> {
        self.shared.graph.read()
    }

    pub(crate) fn store(&self) -> &OutputStore {
        &self.shared.store
    }
}

// ── the coordinator loop ──────────────────────────────────────────

async fn drive(shared: Arc<Shared>) {
    let mut dispatched: HashSet<NodeId> = HashSet::new();
    let mut join_set: JoinSet<()> = JoinSet::new();

    loop {
        let mut progressed = false;
        let mut any_pending = false;

        {
            let graph = shared.graph.read();
            let len = graph.len();
            for i in 0..len {
                let id = NodeId::from_index(i);
                let name = graph.get(id).name.clone();

                if shared.store.contains(&name) {
                    continue;
                }
                any_pending = true;
                if dispatched.contains(&id) {
                    continue;
                }

                if shared.cancel.is_cancelled() {
                    shared.listener.on_event(TaskEvent::Cancelled { task: name.clone() });
                    shared.store.insert(name, TaskResult::cancelled());
                    dispatched.insert(id);
                    progressed = true;
                    continue;
                }

                if !node_ready(&graph, &shared.store, id) {
                    continue;
                }

                dispatched.insert(id);
                progressed = true;
                match &graph.get(id).body {
                    NodeBody::Leaf(None) | NodeBody::Compound { .. } => {
                        finalize_structural(&shared, &graph, id);
                    }
                    NodeBody::Leaf(Some(_)) => {
                        let shared = Arc::clone(&shared);
                        join_set.spawn(async move { run_leaf(&shared, id).await });
                    }
                    NodeBody::Control { .. } => {
                        let shared = Arc::clone(&shared);
                        join_set.spawn(async move { run_control(&shared, id).await });
                    }
                }
            }
        }

        if !any_pending && join_set.is_empty() {
            break;
        }
        if progressed {
            continue;
        }

        if join_set.is_empty() {
            tokio::select! {
                _ = shared.wake.notified() => {},
                _ = tokio::time::sleep(Duration::from_millis(25)) => {},
            }
        } else {
            tokio::select! {
                _ = join_set.join_next() => {},
                _ = shared.wake.notified() => {},
            }
        }
    }
}

fn node_ready(graph: &TaskGraph, store: &OutputStore, id: NodeId) -> bool {
    let node = graph.get(id);
    match &node.body {
        NodeBody::Compound { subtasks, .. } => subtasks.iter().all(|&s| store.contains(&graph.get(s).name)),
        _ => node.needs.iter().filter(|e| e.blocking).all(|e| store.contains(&graph.get(e.target).name)),
    }
}

// ── structural nodes: no jobserver token, resolved synchronously ──

fn finalize_structural(shared: &Shared, graph: &TaskGraph, id: NodeId) {
    let node = graph.get(id);
    let output = match &node.body {
        NodeBody::Leaf(None) => flatten_needs_output(graph, &shared.store, node),
        NodeBody::Compound { in_node, subtasks, sinks } => {
            aggregate_compound_output(graph, &shared.store, node, *in_node, subtasks, sinks)
        }
        _ => unreachable!("finalize_structural only called for Leaf(None)/Compound"),
    };

    let result = TaskResult::success(output, true, Duration::ZERO);
    shared.listener.on_event(TaskEvent::Start { task: node.name.clone() });
    shared.listener.on_event(TaskEvent::Complete {
        task: node.name.clone(),
        result: result.clone(),
    });
    shared.store.insert(node.name.clone(), result);
    shared.wake.notify_waiters();
}

fn flatten_needs_output(graph: &TaskGraph, store: &OutputStore, node: &TaskNode) -> Vec<DataItem> {
    let mut out = Vec::new();
    for edge in &node.needs {
        if let Some(items) = store.get_output(&graph.get(edge.target).name) {
            out.extend(items);
        }
    }
    out
}

fn aggregate_compound_output(
    graph: &TaskGraph,
    store: &OutputStore,
    node: &TaskNode,
    in_node: NodeId,
    subtasks: &[NodeId],
    sinks: &[NodeId],
) -> Vec<DataItem> {
    let mut out = Vec::new();
    for &sink in sinks {
        if let Some(items) = store.get_output(&graph.get(sink).name) {
            out.extend(items);
        }
    }

    match node.passthrough {
        Passthrough::None => {}
        Passthrough::All => {
            if let Some(items) = store.get_output(&graph.get(in_node).name) {
                out.extend(items);
            }
        }
        Passthrough::Unused => {
            if let Some(items) = store.get_output(&graph.get(in_node).name) {
                for item in items {
                    let as_produce = Pattern {
                        type_name: item.type_name.clone(),
                        with: item.attrs.clone(),
                    };
                    let consumed = subtasks
                        .iter()
                        .any(|&sid| crate::graph::is_compatible(&graph.get(sid).consumes, std::slice::from_ref(&as_produce)));
                    if !consumed {
                        out.push(item);
                    }
                }
            }
        }
    }
    out
}

// ── leaf nodes: real work, gated by jobserver + memento/cache ─────

async fn run_leaf(shared: &Arc<Shared>, id: NodeId) {
    let node = shared.graph.read().get(id).clone();
    shared.listener.on_event(TaskEvent::Start { task: node.name.clone() });
    let result = run_leaf_inner(shared, &node).await;
    finish_node(shared, &node, result).await;
}

async fn run_control(shared: &Arc<Shared>, id: NodeId) {
    let node = shared.graph.read().get(id).clone();
    shared.listener.on_event(TaskEvent::Start { task: node.name.clone() });
    let result = run_control_inner(shared, &node).await;
    finish_node(shared, &node, result).await;
}

async fn finish_node(shared: &Arc<Shared>, node: &TaskNode, result: Result<TaskResult>) {
    let result = match result {
        Ok(r) => r,
        Err(e) => {
            let marker = Marker::error("TaskFailure", e.to_string());
            TaskResult::failed(1, marker, Duration::ZERO)
        }
    };

    for m in &result.markers {
        shared.markers.push(m.clone());
    }

    match result.status {
        TaskStatus::Skipped => shared.listener.on_event(TaskEvent::Skipped { task: node.name.clone() }),
        TaskStatus::Failed(_) => {
            shared.listener.on_event(TaskEvent::Complete {
                task: node.name.clone(),
                result: result.clone(),
            });
            shared.cancel.cancel();
        }
        _ => shared.listener.on_event(TaskEvent::Complete {
            task: node.name.clone(),
            result: result.clone(),
        }),
    }

    shared.store.insert(node.name.clone(), result);
    shared.wake.notify_waiters();
}

fn base_env() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

fn gather_inputs(graph: &TaskGraph, store: &OutputStore, node: &TaskNode) -> Vec<DataItem> {
    let mut out = Vec::new();
    for edge in &node.needs {
        if let Some(items) = store.get_output(&graph.get(edge.target).name) {
            out.extend(items);
        }
    }
    out
}

fn gather_mementos(shared: &Shared, graph: &TaskGraph, node: &TaskNode) -> Vec<String> {
    node.needs
        .iter()
        .filter_map(|e| shared.mementos.get(graph.get(e.target).name.as_ref()).map(|m| m.clone()))
        .collect()
}

fn upstream_changed(store: &OutputStore, graph: &TaskGraph, node: &TaskNode) -> bool {
    node.needs.iter().any(|e| store.changed(&graph.get(e.target).name))
}

fn node_scope(shared: &Shared, node: &TaskNode) -> Scope {
    let owning_pkg = shared.arena.iter().find(|p| p.task(&node.task_name).is_some());
    let package_vars = owning_pkg.map(|p| p.vars.clone()).unwrap_or_default();

    let mut scope = Scope::new()
        .with_locals(node.params.clone())
        .with_this(node.this_vars.clone())
        .with_package_vars(package_vars);

    if let Some(pkg) = owning_pkg {
        for import_name in &pkg.imports {
            if let Some(import_pkg) = shared.arena.by_name(import_name) {
                let qualifier = import_name.rsplit('.').next().unwrap_or(import_name);
                scope = scope.with_import(qualifier, import_pkg.vars.clone());
            }
        }
    }
    scope
}

/// Parse and evaluate a bare (non-`${{ }}`-wrapped) control-flow
/// condition string, e.g. `cond`, `count`, `until`, `when`.
fn eval_raw(source: &str, scope: &Scope) -> Result<Value> {
    let expr = crate::expr::parse(source).map_err(|reason| FlowError::ExprParseError {
        source: source.to_string(),
        reason,
    })?;
    crate::expr::eval_expr(&expr, scope, source)
}

fn dynamic_handle(shared: &Arc<Shared>) -> DynamicHandle {
    if shared.config.dynamic_scheduling {
        DynamicHandle::Joint(Arc::clone(shared))
    } else {
        DynamicHandle::Nested(Arc::clone(shared))
    }
}

async fn dispatch_body(shared: &Arc<Shared>, node: &TaskNode, body: &Body, input: TaskInput) -> Result<super::body::BodyOutcome> {
    let _token = shared.jobserver.acquire(JOBSERVER_ACQUIRE_TIMEOUT).await?;
    match body {
        Body::Shell(command) => run_shell(node.name.as_ref(), command, &input, None).await,
        Body::Native(name) => {
            let f = shared.bodies.get(name).cloned().ok_or_else(|| FlowError::UncaughtBodyException {
                task: node.name.to_string(),
                reason: format!("no native body registered for `{name}`"),
            })?;
            let ctx = Arc::new(RunContext::new(
                node.name.clone(),
                input.clone(),
                Arc::clone(&shared.markers),
                dynamic_handle(shared),
            ));
            f(ctx, input).await
        }
    }
}

fn build_hash_inputs(inputs: &[DataItem]) -> Vec<(PathBuf, Vec<u8>, String)> {
    let mut out = Vec::new();
    for item in inputs {
        let filetype = item.get("filetype").and_then(Value::as_str).unwrap_or("").to_string();
        if let Some(Value::Str(p)) = item.get("path") {
            if let Ok(contents) = std::fs::read(p.as_ref()) {
                out.push((PathBuf::from(p.as_ref()), contents, filetype.clone()));
            }
        }
        if let Some(Value::List(paths)) = item.get("paths") {
            for pv in paths {
                if let Value::Str(p) = pv {
                    if let Ok(contents) = std::fs::read(p.as_ref()) {
                        out.push((PathBuf::from(p.as_ref()), contents, filetype.clone()));
                    }
                }
            }
        }
    }
    out
}

async fn run_leaf_inner(shared: &Arc<Shared>, node: &TaskNode) -> Result<TaskResult> {
    let scope = node_scope(shared, node);
    if let Some(cond) = &node.iff {
        if !eval_raw(cond, &scope)?.is_truthy() {
            return Ok(TaskResult::skipped());
        }
    }

    let body = match &node.body {
        NodeBody::Leaf(Some(b)) => b.clone(),
        _ => {
            return Err(FlowError::UncaughtBodyException {
                task: node.name.to_string(),
                reason: "leaf node has no body".to_string(),
            })
        }
    };

    let (inputs, predecessor_changed) = {
        let graph = shared.graph.read();
        (gather_inputs(&graph, &shared.store, node), upstream_changed(&shared.store, &graph, node))
    };

    if node.cache.enabled {
        if let Some(cache) = shared.cache.clone() {
            return run_leaf_cached(shared, node, &body, inputs, &cache).await;
        }
    }
    run_leaf_mementoed(shared, node, &body, inputs, predecessor_changed).await
}

async fn run_leaf_cached(
    shared: &Arc<Shared>,
    node: &TaskNode,
    body: &Body,
    inputs: Vec<DataItem>,
    cache: &Arc<CacheLayer>,
) -> Result<TaskResult> {
    let hash_files = build_hash_inputs(&inputs);
    let hash_inputs: Vec<HashInput> = hash_files
        .iter()
        .map(|(path, contents, filetype)| HashInput {
            path,
            contents,
            filetype,
        })
        .collect();
    let env = base_env();
    let env_subset: BTreeMap<String, String> = env.iter().filter(|(k, _)| node.cache.hash.contains(k)).map(|(k, v)| (k.clone(), v.clone())).collect();

    let recipe = HashRecipe {
        task_name: &node.task_name,
        params: &node.params,
        inputs: hash_inputs,
        env: &env_subset,
        shell_stamps: &[],
    };
    let key = cache.compute_key(&recipe)?;

    if let Some((entry, provider)) = cache.lookup(&key)? {
        let restored = cache.restore(&entry, provider, &node.rundir)?;
        let items: Vec<DataItem> = serde_json::from_value(restored.output).unwrap_or_default();
        return Ok(TaskResult::cache_hit(items));
    }

    let started = Instant::now();
    let input = TaskInput {
        params: node.params.clone(),
        inputs,
        memento: None,
        rundir: node.rundir.clone(),
        srcdir: node.srcdir.clone(),
        env,
    };
    let outcome = dispatch_body(shared, node, body, input).await?;
    let duration = started.elapsed();

    if outcome.exit_code != 0 {
        let marker = Marker::error("TaskFailure", format!("exit code {}", outcome.exit_code));
        let mut result = TaskResult::failed(outcome.exit_code, marker, duration);
        result.markers.extend(outcome.markers);
        return Ok(result);
    }

    let mut result = TaskResult::success(outcome.output.clone(), true, duration);
    result.markers = outcome.markers;

    if !outcome.output.is_empty() {
        if let Ok(template) = serde_json::to_value(&outcome.output) {
            let template = crate::cache::templatize_rundir(&template, &node.rundir);
            if let Err(e) = cache.store(key, template, None) {
                result.markers.push(Marker::warn("CacheStoreFailed", e.to_string()));
            }
        }
    }
    Ok(result)
}

async fn run_leaf_mementoed(
    shared: &Arc<Shared>,
    node: &TaskNode,
    body: &Body,
    inputs: Vec<DataItem>,
    predecessor_changed: bool,
) -> Result<TaskResult> {
    let input_mementos: Vec<String> = {
        let graph = shared.graph.read();
        gather_mementos(shared, &graph, node)
    };
    let input_mementos_ref: Vec<&str> = input_mementos.iter().map(String::as_str).collect();
    let own_memento = memento::compute(&node.task_name, &node.params, &input_mementos_ref);
    let prior = memento::read(&node.rundir);

    if !predecessor_changed && prior.as_deref() == Some(own_memento.as_str()) {
        shared.mementos.insert(node.name.clone(), own_memento);
        let previous_output = memento::read_output(&node.rundir).unwrap_or_default();
        return Ok(TaskResult::success(previous_output, false, Duration::ZERO));
    }

    let started = Instant::now();
    let input = TaskInput {
        params: node.params.clone(),
        inputs,
        memento: prior,
        rundir: node.rundir.clone(),
        srcdir: node.srcdir.clone(),
        env: base_env(),
    };
    let outcome = dispatch_body(shared, node, body, input).await?;
    let duration = started.elapsed();

    if outcome.exit_code != 0 {
        let marker = Marker::error("TaskFailure", format!("exit code {}", outcome.exit_code));
        let mut result = TaskResult::failed(outcome.exit_code, marker, duration);
        result.markers.extend(outcome.markers);
        return Ok(result);
    }

    memento::write(&node.rundir, &own_memento)?;
    memento::write_output(&node.rundir, &outcome.output)?;
    shared.mementos.insert(node.name.clone(), own_memento);

    let mut result = TaskResult::success(outcome.output, true, duration);
    result.markers = outcome.markers;
    Ok(result)
}

// ── control nodes: five ControlFlow kinds, each running a body like a
// leaf but conditionally or repeatedly, with no memento/cache gating ──

/// Sets `_iter`/`_max_iter` in `state` ahead of an iteration so both the
/// body (via `${{ state.* }}`) and the loop's own `cond`/`until` can
/// observe the current position (§4.4, `original_source`'s
/// `_inject_iteration_vars`).
fn inject_iteration_vars(state: &mut BTreeMap<String, Value>, iter: u64, max_iter: Option<u64>) {
    state.insert("_iter".to_string(), Value::Int(iter as i64));
    if let Some(m) = max_iter {
        state.insert("_max_iter".to_string(), Value::Int(m as i64));
    }
}

/// Merges every attribute of every body output item into `state`
/// (`original_source`'s `_extract_output_state`) — a body reports state
/// updates simply by producing an output item carrying the new values.
fn extract_output_state(output: &[DataItem]) -> BTreeMap<String, Value> {
    let mut merged = BTreeMap::new();
    for item in output {
        for (k, v) in &item.attrs {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// A body signals early loop termination by setting `_break` truthy in
/// its reported state (`original_source`'s `_check_break_signal`).
fn break_requested(state: &BTreeMap<String, Value>) -> bool {
    state.get("_break").map(Value::is_truthy).unwrap_or(false)
}

#[allow(clippy::too_many_arguments)]
async fn run_one_iteration(
    shared: &Arc<Shared>,
    node: &TaskNode,
    body: &Option<Body>,
    inputs: &[DataItem],
    started: Instant,
    last_output: &mut Vec<DataItem>,
    markers: &mut Vec<Marker>,
    ran_once: &mut bool,
    state: &mut BTreeMap<String, Value>,
    scope: &mut Scope,
) -> Result<Option<TaskResult>> {
    let Some(b) = body else { return Ok(None) };

    let input = TaskInput {
        params: node.params.clone(),
        inputs: inputs.to_vec(),
        memento: None,
        rundir: node.rundir.clone(),
        srcdir: node.srcdir.clone(),
        env: base_env(),
    };
    let outcome = dispatch_body(shared, node, b, input).await?;
    *ran_once = true;
    markers.extend(outcome.markers.clone());

    if outcome.exit_code != 0 {
        let marker = Marker::error("TaskFailure", format!("exit code {}", outcome.exit_code));
        let mut result = TaskResult::failed(outcome.exit_code, marker, started.elapsed());
        result.markers = markers.clone();
        return Ok(Some(result));
    }

    for (k, v) in extract_output_state(&outcome.output) {
        state.insert(k, v);
    }
    scope.locals.insert("state".to_string(), Value::Map(state.clone()));

    *last_output = outcome.output;
    Ok(None)
}

async fn run_control_inner(shared: &Arc<Shared>, node: &TaskNode) -> Result<TaskResult> {
    let (flow, body) = match &node.body {
        NodeBody::Control { flow, body } => (flow.clone(), body.clone()),
        _ => {
            return Err(FlowError::UncaughtBodyException {
                task: node.name.to_string(),
                reason: "control node missing its control block".to_string(),
            })
        }
    };

    let base_scope = node_scope(shared, node);
    if let Some(cond) = &node.iff {
        if !eval_raw(cond, &base_scope)?.is_truthy() {
            return Ok(TaskResult::skipped());
        }
    }

    // `state` is seeded from `control.state.init` and, after each
    // iteration, merged with whatever the body's output items reported
    // (§4.4; `original_source`'s `_inject_iteration_vars`/
    // `_extract_output_state`/`_check_break_signal`). `scope`'s `state`
    // local is refreshed in lockstep so `cond`/`until`/`when` observe
    // the latest values, not the initial seed.
    let mut state = flow.state_init().clone();
    let mut scope = base_scope;
    scope.locals.insert("state".to_string(), Value::Map(state.clone()));

    let inputs = {
        let graph = shared.graph.read();
        gather_inputs(&graph, &shared.store, node)
    };

    let started = Instant::now();
    let mut last_output = Vec::new();
    let mut markers = Vec::new();
    let mut ran_once = false;

    match &flow {
        ControlFlow::If { cond, .. } => {
            if eval_raw(cond, &scope)?.is_truthy() {
                if let Some(result) = run_one_iteration(
                    shared,
                    node,
                    &body,
                    &inputs,
                    started,
                    &mut last_output,
                    &mut markers,
                    &mut ran_once,
                    &mut state,
                    &mut scope,
                )
                .await?
                {
                    return Ok(result);
                }
            }
        }
        ControlFlow::Match { cases, default, .. } => {
            let mut any_match = false;
            for case in cases {
                if eval_raw(&case.when, &scope)?.is_truthy() {
                    any_match = true;
                    break;
                }
            }
            if any_match || *default {
                if let Some(result) = run_one_iteration(
                    shared,
                    node,
                    &body,
                    &inputs,
                    started,
                    &mut last_output,
                    &mut markers,
                    &mut ran_once,
                    &mut state,
                    &mut scope,
                )
                .await?
                {
                    return Ok(result);
                }
            }
        }
        ControlFlow::Repeat { count, until, .. } => {
            let n = eval_raw(count, &scope)?.as_int().unwrap_or(0).max(0) as u64;
            for iter in 0..n {
                inject_iteration_vars(&mut state, iter, Some(n));
                scope.locals.insert("state".to_string(), Value::Map(state.clone()));
                if let Some(result) = run_one_iteration(
                    shared,
                    node,
                    &body,
                    &inputs,
                    started,
                    &mut last_output,
                    &mut markers,
                    &mut ran_once,
                    &mut state,
                    &mut scope,
                )
                .await?
                {
                    return Ok(result);
                }
                if break_requested(&state) {
                    break;
                }
                if let Some(u) = until {
                    if eval_raw(u, &scope)?.is_truthy() {
                        break;
                    }
                }
            }
        }
        ControlFlow::While { cond, max_iter, .. } => {
            let mut iter = 0u64;
            loop {
                inject_iteration_vars(&mut state, iter, Some(*max_iter));
                scope.locals.insert("state".to_string(), Value::Map(state.clone()));
                if !eval_raw(cond, &scope)?.is_truthy() {
                    break;
                }
                if iter >= *max_iter {
                    return Err(FlowError::ControlMaxIterExceeded {
                        task: node.name.to_string(),
                        max_iter: *max_iter,
                    });
                }
                if let Some(result) = run_one_iteration(
                    shared,
                    node,
                    &body,
                    &inputs,
                    started,
                    &mut last_output,
                    &mut markers,
                    &mut ran_once,
                    &mut state,
                    &mut scope,
                )
                .await?
                {
                    return Ok(result);
                }
                if break_requested(&state) {
                    break;
                }
                iter += 1;
            }
        }
        ControlFlow::DoWhile { until, max_iter, .. } => {
            let mut iter = 0u64;
            loop {
                inject_iteration_vars(&mut state, iter, Some(*max_iter));
                scope.locals.insert("state".to_string(), Value::Map(state.clone()));
                if iter >= *max_iter {
                    return Err(FlowError::ControlMaxIterExceeded {
                        task: node.name.to_string(),
                        max_iter: *max_iter,
                    });
                }
                if let Some(result) = run_one_iteration(
                    shared,
                    node,
                    &body,
                    &inputs,
                    started,
                    &mut last_output,
                    &mut markers,
                    &mut ran_once,
                    &mut state,
                    &mut scope,
                )
                .await?
                {
                    return Ok(result);
                }
                iter += 1;
                if break_requested(&state) || eval_raw(until, &scope)?.is_truthy() {
                    break;
                }
            }
        }
    }

    if !ran_once {
        return Ok(TaskResult::skipped());
    }
    let mut result = TaskResult::success(last_output, true, started.elapsed());
    result.markers = markers;
    Ok(result)
}
