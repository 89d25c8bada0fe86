//! Dynamic subgraph submission (§4.9): a running task body can mint new
//! [`TaskNodeSpec`]s via [`super::context::RunContext::mk_task_node`] and
//! submit them mid-run instead of only at build time. Generalizes the
//! builder's own single-node instantiation path (`Builder::instantiate_single`)
//! into a free function the runtime can call repeatedly, since `Builder`
//! itself is call-once by design.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FlowError, Result};
use crate::graph::{NeedEdge, NodeBody, NodeId, TaskGraph, TaskNode, TaskNodeSpec};
use crate::model::{CachePolicy, ParamDef, Task};
use crate::store::DataItem;
use crate::util::constants::RUN_SUBGRAPH_TIMEOUT;
use crate::value::Value;

use super::scheduler::Shared;

/// A node submitted via [`super::context::RunContext::run_subgraph`]:
/// the node descriptor plus the names it depends on. A dependency name
/// may refer to another node in the same batch, or to one already
/// present in the run's graph/output store.
#[derive(Debug, Clone)]
pub struct DynamicNode {
    pub spec: TaskNodeSpec,
    pub needs: Vec<String>,
}

impl DynamicNode {
    pub fn new(spec: TaskNodeSpec) -> Self {
        Self { spec, needs: Vec::new() }
    }

    pub fn needing(mut self, needs: Vec<String>) -> Self {
        self.needs = needs;
        self
    }
}

/// How a [`super::context::RunContext`] reaches the owning scheduler to
/// submit dynamic work. `Disabled` is for contexts built outside of a
/// live scheduler run — unit tests, `cargo bench` harnesses, anywhere a
/// native body is exercised without a real run behind it.
#[derive(Clone)]
pub enum DynamicHandle {
    Disabled,
    /// `config.dynamic_scheduling == true`: submitted nodes join the
    /// same ready-queue and output store as the rest of the run.
    Joint(Arc<Shared>),
    /// `config.dynamic_scheduling == false`: submitted nodes run to
    /// completion in a nested [`super::scheduler::Scheduler`] instance
    /// over the same rundir instead of joining the caller's queue.
    Nested(Arc<Shared>),
}

impl DynamicHandle {
    pub fn disabled() -> Self {
        DynamicHandle::Disabled
    }

    pub async fn run_subgraph(&self, caller: &str, nodes: Vec<DynamicNode>, timeout: Option<Duration>) -> Result<Vec<DataItem>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        let timeout = timeout.unwrap_or(RUN_SUBGRAPH_TIMEOUT);
        match self {
            DynamicHandle::Disabled => Err(FlowError::UncaughtBodyException {
                task: caller.to_string(),
                reason: "run_subgraph called from a context with no attached scheduler".to_string(),
            }),
            DynamicHandle::Joint(shared) => run_joint(shared, caller, nodes, timeout).await,
            DynamicHandle::Nested(shared) => run_nested(shared, caller, nodes, timeout).await,
        }
    }
}

/// Resolve a dynamically submitted task's params the way
/// `Builder::resolve_params` does, minus override/import-qualifier
/// support — a dynamic `with` map is already concrete values from the
/// calling native body, not a package-declared override chain
/// (documented simplification, see DESIGN.md).
fn resolve_dynamic_params(task: &Task, with: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>> {
    let mut locals: BTreeMap<String, Value> = BTreeMap::new();
    for (pname, def) in task.schema.iter() {
        let value = resolve_one(pname, def, with, &locals)?;
        locals.insert(pname.to_string(), value);
    }
    for (k, v) in with {
        locals.entry(k.clone()).or_insert_with(|| v.clone());
    }
    Ok(locals)
}

fn resolve_one(pname: &str, def: &ParamDef, with: &BTreeMap<String, Value>, locals: &BTreeMap<String, Value>) -> Result<Value> {
    let value = with
        .get(pname)
        .cloned()
        .or_else(|| def.default.clone())
        .unwrap_or(Value::Null);
    match &value {
        Value::Str(s) if s.contains("${{") => {
            let scope = crate::expr::Scope::new().with_locals(locals.clone());
            crate::expr::substitute(s, &scope)
        }
        _ => Ok(value),
    }
}

fn compute_dynamic_rundir(shared: &Shared, name: &str) -> PathBuf {
    let base = name.replace('.', "/");
    let mut seen = shared.seen_rundirs.lock();
    let mut dir = shared.config.rundir.join(&base);
    let mut n = 1;
    while seen.contains(&dir) {
        n += 1;
        dir = shared.config.rundir.join(format!("{base}-{n}"));
    }
    seen.insert(dir.clone());
    dir
}

/// Build a [`TaskNode`] for one submitted spec. Only leaf and control
/// tasks are supported dynamically — matrix/generate strategies and
/// compound subtask expansion are build-time-only concepts tightly
/// coupled to `Builder`'s private mutable state (documented scope
/// decision, see DESIGN.md).
fn instantiate_node(shared: &Shared, name: &str, spec: &TaskNodeSpec) -> Result<TaskNode> {
    let task = shared
        .arena
        .find_task(&spec.task_name)
        .cloned()
        .ok_or_else(|| FlowError::UnresolvedForwardReference {
            task: name.to_string(),
            reference: spec.task_name.clone(),
        })?;

    if task.is_compound() {
        return Err(FlowError::UncaughtBodyException {
            task: name.to_string(),
            reason: format!("dynamic submission of compound task `{}` is not supported", spec.task_name),
        });
    }

    let params = resolve_dynamic_params(&task, &spec.with)?;
    let rundir = compute_dynamic_rundir(shared, name);
    let srcdir = shared
        .arena
        .iter()
        .find(|p| p.task(&task.name).is_some())
        .map(|p| p.basedir.clone())
        .unwrap_or_else(|| shared.config.rundir.clone());

    let body = match &task.control {
        Some(flow) => NodeBody::Control {
            flow: flow.clone(),
            body: task.body.clone(),
        },
        None => NodeBody::Leaf(task.body.clone()),
    };

    Ok(TaskNode {
        name: Arc::from(name),
        task_name: task.name.clone(),
        params,
        this_vars: BTreeMap::new(),
        needs: Vec::new(),
        rundir,
        srcdir,
        parent: None,
        body,
        produces: task.produces.clone(),
        consumes: task.consumes.clone(),
        visibility: task.visibility,
        passthrough: task.passthrough,
        iff: task.iff.clone(),
        cache: if task.cache.enabled { task.cache.clone() } else { CachePolicy::default() },
        tags: task.tags.clone(),
    })
}

fn submitted_name(caller: &str, spec: &TaskNodeSpec, index: usize) -> String {
    spec.name.clone().unwrap_or_else(|| format!("{caller}.dyn.{index}"))
}

/// True if `target` can already reach `from` via `needs` edges —
/// meaning wiring a new edge `from -> target` would close a cycle.
fn reaches(graph: &TaskGraph, from: NodeId, to: NodeId) -> bool {
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(n) = stack.pop() {
        if n == to {
            return true;
        }
        if !seen.insert(n) {
            continue;
        }
        for e in &graph.get(n).needs {
            stack.push(e.target);
        }
    }
    false
}

fn batch_sinks(graph: &TaskGraph, ids: &[NodeId]) -> Vec<NodeId> {
    ids.iter()
        .copied()
        .filter(|&candidate| {
            !ids.iter()
                .any(|&other| other != candidate && graph.get(other).needs.iter().any(|e| e.target == candidate))
        })
        .collect()
}

async fn run_joint(shared: &Arc<Shared>, caller: &str, nodes: Vec<DynamicNode>, timeout: Duration) -> Result<Vec<DataItem>> {
    let ids = {
        let mut graph = shared.graph.write();
        let mut batch_names: BTreeMap<String, NodeId> = BTreeMap::new();
        let mut ids = Vec::with_capacity(nodes.len());

        for (i, dn) in nodes.iter().enumerate() {
            let name = submitted_name(caller, &dn.spec, i);
            let node = instantiate_node(shared, &name, &dn.spec)?;
            let id = graph.append(node);
            batch_names.insert(name, id);
            ids.push(id);
        }

        for (dn, &id) in nodes.iter().zip(ids.iter()) {
            for dep in &dn.needs {
                let target = if let Some(&t) = batch_names.get(dep) {
                    t
                } else if let Some(t) = graph.by_name(dep) {
                    t
                } else {
                    return Err(FlowError::SubgraphUnknownReference {
                        task: caller.to_string(),
                        reference: dep.clone(),
                    });
                };
                if reaches(&graph, target, id) {
                    return Err(FlowError::SubgraphCycle {
                        task: caller.to_string(),
                        reference: dep.clone(),
                    });
                }
                graph.get_mut(id).needs.push(NeedEdge { target, blocking: true });
            }
        }
        ids
    };

    shared.wake.notify_waiters();
    wait_for_completion(shared, &ids, timeout).await
}

async fn wait_for_completion(shared: &Arc<Shared>, ids: &[NodeId], timeout: Duration) -> Result<Vec<DataItem>> {
    let deadline = tokio::time::Instant::now() + timeout;
    let names: Vec<Arc<str>> = {
        let graph = shared.graph.read();
        ids.iter().map(|&id| graph.get(id).name.clone()).collect()
    };
    loop {
        if names.iter().all(|n| shared.store.contains(n)) {
            break;
        }
        if shared.cancel.is_cancelled() {
            return Err(FlowError::UncaughtBodyException {
                task: "run_subgraph".to_string(),
                reason: "run was cancelled before the submitted subgraph completed".to_string(),
            });
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(FlowError::TaskTimeout {
                task: "run_subgraph".to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
        let wait = tokio::time::sleep(Duration::from_millis(20));
        tokio::select! {
            _ = shared.wake.notified() => {},
            _ = wait => {},
        }
    }
    let graph = shared.graph.read();
    let sinks = batch_sinks(&graph, ids);
    let mut out = Vec::new();
    for id in sinks {
        if let Some(items) = shared.store.get_output(&graph.get(id).name) {
            out.extend(items);
        }
    }
    Ok(out)
}

/// `dynamic_scheduling == false` fallback: run the submitted batch to
/// completion in an isolated, nested scheduler over the same rundir,
/// sharing the arena/body registry/cache/jobserver/markers/listener
/// with the owning run. Only batch-local `needs` are supported here —
/// referencing a node outside the batch would require snapshotting its
/// output across scheduler instances, which this simplification skips
/// (see DESIGN.md).
async fn run_nested(shared: &Arc<Shared>, caller: &str, nodes: Vec<DynamicNode>, timeout: Duration) -> Result<Vec<DataItem>> {
    let mut graph_nodes = Vec::with_capacity(nodes.len());
    let mut batch_names: BTreeMap<String, usize> = BTreeMap::new();

    for (i, dn) in nodes.iter().enumerate() {
        let name = submitted_name(caller, &dn.spec, i);
        let node = instantiate_node(shared, &name, &dn.spec)?;
        batch_names.insert(name, graph_nodes.len());
        graph_nodes.push(node);
    }

    for (i, dn) in nodes.iter().enumerate() {
        for dep in &dn.needs {
            let Some(&target_idx) = batch_names.get(dep) else {
                return Err(FlowError::SubgraphUnknownReference {
                    task: caller.to_string(),
                    reference: dep.clone(),
                });
            };
            graph_nodes[i].needs.push(NeedEdge {
                target: NodeId::from_index(target_idx),
                blocking: true,
            });
        }
    }

    if graph_nodes.is_empty() {
        return Ok(Vec::new());
    }

    let root = NodeId::from_index(0);
    let nested_graph = TaskGraph::from_parts(graph_nodes, root);

    let scheduler = super::scheduler::Scheduler::new(
        Arc::clone(&shared.arena),
        Arc::clone(&shared.bodies),
        shared.cache.clone(),
        shared.config.clone(),
        Arc::clone(&shared.markers),
        Arc::clone(&shared.listener),
    );
    let outcome = tokio::time::timeout(timeout, scheduler.run(nested_graph))
        .await
        .map_err(|_| FlowError::TaskTimeout {
            task: "run_subgraph".to_string(),
            timeout_secs: timeout.as_secs(),
        })??;

    let ids: Vec<NodeId> = (0..nodes.len()).map(NodeId::from_index).collect();
    let graph = outcome.graph();
    let sinks = batch_sinks(&graph, &ids);
    let mut out = Vec::new();
    for id in sinks {
        if let Some(items) = outcome.store().get_output(&graph.get(id).name) {
            out.extend(items);
        }
    }
    Ok(out)
}
