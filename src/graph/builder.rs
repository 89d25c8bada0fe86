//! Graph builder (§4.3, C4): expands an elaborated root [`Task`] into a
//! [`TaskGraph`] of concrete [`TaskNode`]s.
//!
//! Compound expansion, matrix/generate strategies, rundir computation,
//! dependency lowering, and override application all happen in a first
//! pass that may leave `needs` edges unresolved for tasks declared later
//! in source order; a second pass resolves those forward references and
//! runs a three-color DFS over the flat node arena, which already
//! includes every nested compound subgraph.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{FlowError, Result};
use crate::event::{Marker, MarkerLog};
use crate::expr::{substitute, Scope};
use crate::loader::PackageArena;
use crate::model::{CachePolicy, ConsumesSpec, Package, Passthrough, RundirPolicy, Strategy, Task, Visibility};
use crate::value::Value;

use super::matcher::is_compatible;
use super::node::{NeedEdge, NodeBody, NodeId, TaskNode};
use super::registry::{GeneratorCtx, Registry};
use super::TaskGraph;

/// Parameter overrides keyed by the string form the caller supplied
/// (`--set`, a config file's `overrides:` block, …). Three shapes are
/// accepted and resolved in this precedence order against a node's
/// *declarative* task name (§4.3):
///
/// 1. fully-qualified — `<full.dotted.task.name>.<param>`
/// 2. task-qualified — `<task>.<param>` (package prefix stripped)
/// 3. bare — `<param>` (applies to every task with a matching param name)
#[derive(Debug, Clone, Default)]
pub struct Overrides(BTreeMap<String, Value>);

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    fn resolve(&self, fq_task_name: &str, bare_task_name: &str, param: &str) -> Option<&Value> {
        self.0
            .get(&format!("{fq_task_name}.{param}"))
            .or_else(|| self.0.get(&format!("{bare_task_name}.{param}")))
            .or_else(|| self.0.get(param))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Builds one [`TaskGraph`] from a single root task name. Single-use:
/// call [`Builder::build`] once and discard.
pub struct Builder<'a> {
    arena: &'a PackageArena,
    registry: &'a Registry,
    overrides: &'a Overrides,
    root_rundir: PathBuf,
    markers: &'a MarkerLog,

    nodes: Vec<TaskNode>,
    /// Declarative task name -> every NodeId instantiated from it. A
    /// matrix/generate strategy produces more than one entry per task.
    instances: BTreeMap<String, Vec<NodeId>>,
    /// (node awaiting a need, raw declarative task name it names)
    /// deferred to the second pass so forward references resolve.
    pending_needs: Vec<(NodeId, String)>,
    seen_rundirs: HashSet<PathBuf>,
}

impl<'a> Builder<'a> {
    pub fn new(arena: &'a PackageArena, registry: &'a Registry, overrides: &'a Overrides, root_rundir: PathBuf, markers: &'a MarkerLog) -> Self {
        Self {
            arena,
            registry,
            overrides,
            root_rundir,
            markers,
            nodes: Vec::new(),
            instances: BTreeMap::new(),
            pending_needs: Vec::new(),
            seen_rundirs: HashSet::new(),
        }
    }

    pub fn build(mut self, root_task: &str) -> Result<TaskGraph> {
        let task = self
            .arena
            .find_task(root_task)
            .ok_or_else(|| FlowError::UnresolvedForwardReference {
                task: "<root>".to_string(),
                reference: root_task.to_string(),
            })?
            .clone();

        let root_ids = self.instantiate(&task, &BTreeMap::new(), &BTreeMap::new(), None, root_task)?;
        let root = match root_ids.len() {
            1 => root_ids[0],
            _ => self.synthesize_aggregate_root(root_ids, root_task),
        };

        self.resolve_needs()?;
        self.wire_implicit_compound_edges();
        self.finalize_sinks();
        self.detect_cycles()?;
        self.detect_unused_tasks(root);

        Ok(TaskGraph {
            nodes: self.nodes,
            root,
        })
    }

    // ── instantiation ──────────────────────────────────────────────

    /// Expand `task` under strategy rules, returning every NodeId it
    /// produced (more than one only for matrix/generate).
    fn instantiate(
        &mut self,
        task: &Task,
        with: &BTreeMap<String, Value>,
        outer_this: &BTreeMap<String, Value>,
        parent: Option<NodeId>,
        name_base: &str,
    ) -> Result<Vec<NodeId>> {
        match &task.strategy {
            Some(Strategy::Matrix(dims)) => self.instantiate_matrix(task, with, outer_this, parent, name_base, dims),
            Some(Strategy::Generate(gen_name)) => self.instantiate_generate(task, outer_this, parent, name_base, gen_name),
            None => self.instantiate_single(task, with, outer_this, parent, name_base),
        }
    }

    fn instantiate_matrix(
        &mut self,
        task: &Task,
        with: &BTreeMap<String, Value>,
        outer_this: &BTreeMap<String, Value>,
        parent: Option<NodeId>,
        name_base: &str,
        dims: &BTreeMap<String, Vec<Value>>,
    ) -> Result<Vec<NodeId>> {
        if let Some((dim, _)) = dims.iter().find(|(_, v)| v.is_empty()) {
            self.markers.push(Marker::error(
                "EmptyMatrixDimension",
                format!("matrix dimension `{dim}` on task `{}` is empty", task.name),
            ));
            return Err(FlowError::EmptyMatrixDimension {
                task: task.name.clone(),
                dimension: dim.clone(),
            });
        }

        let mut combos: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new()];
        for (key, values) in dims {
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for v in values {
                    let mut c = combo.clone();
                    c.insert(key.clone(), v.clone());
                    next.push(c);
                }
            }
            combos = next;
        }

        let mut out = Vec::new();
        for combo in &combos {
            let suffix = combo.values().map(|v| v.to_string()).collect::<Vec<_>>().join("_");
            let mut this_for_clone = outer_this.clone();
            this_for_clone.extend(combo.iter().map(|(k, v)| (k.clone(), v.clone())));
            let clone_name = format!("{name_base}_{suffix}");
            out.extend(self.instantiate_single(task, with, &this_for_clone, parent, &clone_name)?);
        }
        Ok(out)
    }

    fn instantiate_generate(
        &mut self,
        task: &Task,
        outer_this: &BTreeMap<String, Value>,
        parent: Option<NodeId>,
        name_base: &str,
        gen_name: &str,
    ) -> Result<Vec<NodeId>> {
        let generator = self
            .registry
            .generator(gen_name)
            .ok_or_else(|| FlowError::UnknownGenerator {
                task: task.name.clone(),
                name: gen_name.to_string(),
            })?
            .clone();

        let ctx = GeneratorCtx {
            task_name: &task.name,
            this_vars: outer_this,
        };
        let specs = generator(&ctx)?;

        let mut out = Vec::new();
        for (i, spec) in specs.into_iter().enumerate() {
            let sub_task = self
                .arena
                .find_task(&spec.task_name)
                .cloned()
                .ok_or_else(|| FlowError::UnresolvedForwardReference {
                    task: task.name.clone(),
                    reference: spec.task_name.clone(),
                })?;
            let name = spec.name.unwrap_or_else(|| format!("{name_base}.gen{i}"));
            out.extend(self.instantiate_single(&sub_task, &spec.with, outer_this, parent, &name)?);
        }
        Ok(out)
    }

    /// Build exactly one node (recursing into subtasks for a compound).
    fn instantiate_single(
        &mut self,
        task: &Task,
        with: &BTreeMap<String, Value>,
        this_vars: &BTreeMap<String, Value>,
        parent: Option<NodeId>,
        name: &str,
    ) -> Result<Vec<NodeId>> {
        let owning_pkg = self.owning_package(&task.name);
        let params = self.resolve_params(task, with, this_vars, owning_pkg)?;
        let rundir = self.compute_rundir(task.rundir, parent, name);
        let srcdir = owning_pkg.map(|p| p.basedir.clone()).unwrap_or_else(|| self.root_rundir.clone());

        let id = self.reserve_node(name, task, &params, this_vars, rundir.clone(), srcdir, parent);

        let body = if task.is_compound() {
            let mut subtask_ids = Vec::new();
            for sub_name in &task.subtasks {
                let sub_task = self.arena.find_task(sub_name).cloned().ok_or_else(|| FlowError::UnresolvedForwardReference {
                    task: task.name.clone(),
                    reference: sub_name.clone(),
                })?;
                let bare = sub_name.rsplit('.').next().unwrap_or(sub_name.as_str());
                let child_name = format!("{name}.{bare}");
                subtask_ids.extend(self.instantiate(&sub_task, &BTreeMap::new(), &params, Some(id), &child_name)?);
            }
            let in_node = self.make_in_node(id, task, &params, this_vars, rundir);
            NodeBody::Compound {
                in_node,
                subtasks: subtask_ids,
                sinks: Vec::new(),
            }
        } else if let Some(control) = &task.control {
            NodeBody::Control {
                flow: control.clone(),
                body: task.body.clone(),
            }
        } else {
            NodeBody::Leaf(task.body.clone())
        };
        self.nodes[id.0].body = body;

        for dep in &task.needs {
            self.pending_needs.push((id, dep.clone()));
        }

        self.instances.entry(task.name.clone()).or_default().push(id);
        Ok(vec![id])
    }

    fn reserve_node(
        &mut self,
        name: &str,
        task: &Task,
        params: &BTreeMap<String, Value>,
        this_vars: &BTreeMap<String, Value>,
        rundir: PathBuf,
        srcdir: PathBuf,
        parent: Option<NodeId>,
    ) -> NodeId {
        self.nodes.push(TaskNode {
            name: Arc::from(name),
            task_name: task.name.clone(),
            params: params.clone(),
            this_vars: this_vars.clone(),
            needs: Vec::new(),
            rundir,
            srcdir,
            parent,
            body: NodeBody::Leaf(None),
            produces: task.produces.clone(),
            consumes: task.consumes.clone(),
            visibility: task.visibility,
            passthrough: task.passthrough,
            iff: task.iff.clone(),
            cache: task.cache.clone(),
            tags: task.tags.clone(),
        });
        NodeId(self.nodes.len() - 1)
    }

    /// Synthetic node aggregating a compound's own `needs` (§4.3).
    fn make_in_node(&mut self, compound_id: NodeId, task: &Task, params: &BTreeMap<String, Value>, this_vars: &BTreeMap<String, Value>, rundir: PathBuf) -> NodeId {
        let name = format!("{}.in", self.nodes[compound_id.0].name);
        let srcdir = self.nodes[compound_id.0].srcdir.clone();
        self.nodes.push(TaskNode {
            name: Arc::from(name.as_str()),
            task_name: format!("{}#in", task.name),
            params: params.clone(),
            this_vars: this_vars.clone(),
            needs: Vec::new(),
            rundir,
            srcdir,
            parent: Some(compound_id),
            body: NodeBody::Leaf(None),
            produces: Vec::new(),
            consumes: ConsumesSpec::default(),
            visibility: Visibility::Local,
            passthrough: Passthrough::None,
            iff: None,
            cache: CachePolicy::default(),
            tags: Vec::new(),
        });
        let id = NodeId(self.nodes.len() - 1);
        for dep in &task.needs {
            self.pending_needs.push((id, dep.clone()));
        }
        id
    }

    /// A root task that itself carries `strategy: matrix` has no single
    /// node to return — wrap the clones in a synthetic root compound so
    /// callers always get one [`NodeId`] back (a builder decision,
    /// documented in DESIGN.md).
    fn synthesize_aggregate_root(&mut self, root_ids: Vec<NodeId>, base_name: &str) -> NodeId {
        let in_name = format!("{base_name}.in");
        self.nodes.push(TaskNode {
            name: Arc::from(in_name.as_str()),
            task_name: format!("{base_name}#in"),
            params: BTreeMap::new(),
            this_vars: BTreeMap::new(),
            needs: Vec::new(),
            rundir: self.root_rundir.clone(),
            srcdir: self.root_rundir.clone(),
            parent: None,
            body: NodeBody::Leaf(None),
            produces: Vec::new(),
            consumes: ConsumesSpec::default(),
            visibility: Visibility::Local,
            passthrough: Passthrough::None,
            iff: None,
            cache: CachePolicy::default(),
            tags: Vec::new(),
        });
        let in_id = NodeId(self.nodes.len() - 1);

        self.nodes.push(TaskNode {
            name: Arc::from(base_name),
            task_name: format!("{base_name}#root"),
            params: BTreeMap::new(),
            this_vars: BTreeMap::new(),
            needs: Vec::new(),
            rundir: self.root_rundir.clone(),
            srcdir: self.root_rundir.clone(),
            parent: None,
            body: NodeBody::Compound {
                in_node: in_id,
                subtasks: root_ids,
                sinks: Vec::new(),
            },
            produces: Vec::new(),
            consumes: ConsumesSpec::default(),
            visibility: Visibility::Root,
            passthrough: Passthrough::All,
            iff: None,
            cache: CachePolicy::default(),
            tags: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    // ── parameter resolution ────────────────────────────────────────

    fn resolve_params(&self, task: &Task, with: &BTreeMap<String, Value>, this_vars: &BTreeMap<String, Value>, owning_pkg: Option<&Package>) -> Result<BTreeMap<String, Value>> {
        let package_vars = owning_pkg.map(|p| p.vars.clone()).unwrap_or_default();
        let bare_task = owning_pkg
            .and_then(|p| task.name.strip_prefix(&format!("{}.", p.name)))
            .unwrap_or(&task.name)
            .to_string();

        let mut locals: BTreeMap<String, Value> = BTreeMap::new();
        for (pname, def) in task.schema.iter() {
            let value = if let Some(v) = self.overrides.resolve(&task.name, &bare_task, pname) {
                v.clone()
            } else if let Some(v) = with.get(pname) {
                v.clone()
            } else if let Some(d) = &def.default {
                d.clone()
            } else {
                Value::Null
            };

            let resolved = match &value {
                Value::Str(s) if s.contains("${{") => {
                    let mut scope = Scope::new().with_locals(locals.clone()).with_this(this_vars.clone()).with_package_vars(package_vars.clone());
                    if let Some(pkg) = owning_pkg {
                        for import_name in &pkg.imports {
                            if let Some(import_pkg) = self.arena.by_name(import_name) {
                                let qualifier = import_name.rsplit('.').next().unwrap_or(import_name);
                                scope = scope.with_import(qualifier, import_pkg.vars.clone());
                            }
                        }
                    }
                    substitute(s, &scope)?
                }
                _ => value,
            };
            locals.insert(pname.to_string(), resolved);
        }

        // Allow `with`/overrides to pass values for params not declared
        // in the schema (e.g. a generator-supplied extra binding).
        for (k, v) in with {
            locals.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Ok(locals)
    }

    fn owning_package(&self, task_name: &str) -> Option<&'a Package> {
        self.arena.iter().find(|p| p.task(task_name).is_some())
    }

    fn compute_rundir(&mut self, policy: RundirPolicy, parent: Option<NodeId>, name: &str) -> PathBuf {
        match policy {
            RundirPolicy::Top => self.root_rundir.clone(),
            RundirPolicy::Inherit => parent.map(|p| self.nodes[p.0].rundir.clone()).unwrap_or_else(|| self.root_rundir.clone()),
            RundirPolicy::Unique => {
                let base = name.replace('.', "/");
                let mut dir = self.root_rundir.join(&base);
                let mut n = 1;
                while self.seen_rundirs.contains(&dir) {
                    n += 1;
                    dir = self.root_rundir.join(format!("{base}-{n}"));
                }
                self.seen_rundirs.insert(dir.clone());
                dir
            }
        }
    }

    // ── second pass: needs resolution, cycle + unused-task detection ─

    fn resolve_needs(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending_needs);
        for (node_id, dep_name) in pending {
            let Some(targets) = self.instances.get(&dep_name).cloned() else {
                return Err(FlowError::UnresolvedForwardReference {
                    task: self.nodes[node_id.0].task_name.clone(),
                    reference: dep_name,
                });
            };
            for target in targets {
                self.nodes[node_id.0].needs.push(NeedEdge { target, blocking: true });
                let (consumes, produces) = (self.nodes[node_id.0].consumes.clone(), self.nodes[target.0].produces.clone());
                if !is_compatible(&consumes, &produces) {
                    self.markers.push(Marker::warn(
                        "DataflowMismatch",
                        format!(
                            "`{}` consumes nothing produced by `{}`",
                            self.nodes[node_id.0].name, self.nodes[target.0].name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Every subtask of a compound implicitly waits on the compound's
    /// own `in` node, so the compound's declared `needs` are satisfied
    /// before any subtask starts (a builder decision; see DESIGN.md).
    fn wire_implicit_compound_edges(&mut self) {
        let compounds: Vec<(NodeId, NodeId, Vec<NodeId>)> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| match &n.body {
                NodeBody::Compound { in_node, subtasks, .. } => Some((NodeId(i), *in_node, subtasks.clone())),
                _ => None,
            })
            .collect();
        for (_, in_node, subtasks) in compounds {
            for sub in subtasks {
                if !self.nodes[sub.0].needs.iter().any(|e| e.target == in_node) {
                    self.nodes[sub.0].needs.push(NeedEdge { target: in_node, blocking: true });
                }
            }
        }
    }

    fn finalize_sinks(&mut self) {
        let compound_ids: Vec<NodeId> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_compound())
            .map(|(i, _)| NodeId(i))
            .collect();
        for id in compound_ids {
            let subtasks = match &self.nodes[id.0].body {
                NodeBody::Compound { subtasks, .. } => subtasks.clone(),
                _ => unreachable!(),
            };
            let sinks: Vec<NodeId> = subtasks
                .iter()
                .copied()
                .filter(|&candidate| {
                    !subtasks
                        .iter()
                        .any(|&other| other != candidate && self.nodes[other.0].needs.iter().any(|e| e.target == candidate))
                })
                .collect();
            if let NodeBody::Compound { sinks: s, .. } = &mut self.nodes[id.0].body {
                *s = sinks;
            }
        }
    }

    fn detect_cycles(&self) -> Result<()> {
        let n = self.nodes.len();
        let mut color = vec![Color::White; n];
        let mut stack = Vec::new();
        for start in 0..n {
            if color[start] == Color::White {
                self.dfs_visit(start, &mut color, &mut stack)?;
            }
        }
        Ok(())
    }

    fn dfs_visit(&self, node: usize, color: &mut [Color], stack: &mut Vec<usize>) -> Result<()> {
        color[node] = Color::Gray;
        stack.push(node);
        for edge in &self.nodes[node].needs {
            let next = edge.target.0;
            match color[next] {
                Color::White => self.dfs_visit(next, color, stack)?,
                Color::Gray => {
                    let pos = stack.iter().position(|&n| n == next).expect("gray node must be on stack");
                    let mut names: Vec<&str> = stack[pos..].iter().map(|&i| &*self.nodes[i].name).collect();
                    names.push(&self.nodes[next].name);
                    return Err(FlowError::CircularDependency { cycle: names.join(" -> ") });
                }
                Color::Black => {}
            }
        }
        stack.pop();
        color[node] = Color::Black;
        Ok(())
    }

    fn detect_unused_tasks(&self, root: NodeId) {
        let root_task_name = self.nodes[root.0].task_name.clone();
        let Some(owning) = self.owning_package(&root_task_name) else {
            return;
        };
        for (name, task) in &owning.tasks {
            if matches!(task.visibility, Visibility::Export | Visibility::Root) {
                continue;
            }
            if !self.instances.contains_key(name) {
                self.markers.push(Marker::warn(
                    "UnusedTask",
                    format!("task `{name}` is unreachable from root `{root_task_name}` and not exported"),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Loader;
    use std::io::Write;

    fn load_single(contents: &str) -> (tempfile::TempDir, PackageArena) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        let (arena, _root) = Loader::new().load(&path).unwrap();
        (dir, arena)
    }

    #[test]
    fn builds_a_single_leaf_node() {
        let (_dir, arena) = load_single("package:\n  name: proj\ntasks:\n  t:\n    shell: \"echo hi\"\n");
        let registry = Registry::new();
        let overrides = Overrides::new();
        let markers = MarkerLog::new();
        let builder = Builder::new(&arena, &registry, &overrides, PathBuf::from("/tmp/run"), &markers);
        let graph = builder.build("proj.t").unwrap();
        assert_eq!(graph.len(), 1);
        assert!(!graph.get(graph.root()).is_compound());
    }

    #[test]
    fn circular_needs_is_rejected() {
        let (_dir, arena) = load_single(
            "package:\n  name: proj\ntasks:\n  a:\n    needs: [proj.b]\n  b:\n    needs: [proj.a]\n",
        );
        let registry = Registry::new();
        let overrides = Overrides::new();
        let markers = MarkerLog::new();
        let builder = Builder::new(&arena, &registry, &overrides, PathBuf::from("/tmp/run"), &markers);
        let err = builder.build("proj.a").unwrap_err();
        assert!(matches!(err, FlowError::CircularDependency { .. }));
    }

    #[test]
    fn matrix_strategy_expands_into_one_node_per_combination() {
        let (_dir, arena) = load_single(
            "package:\n  name: proj\ntasks:\n  t:\n    strategy:\n      matrix:\n        topic: [x, y]\n        kind: [a, b]\n",
        );
        let registry = Registry::new();
        let overrides = Overrides::new();
        let markers = MarkerLog::new();
        let builder = Builder::new(&arena, &registry, &overrides, PathBuf::from("/tmp/run"), &markers);
        let graph = builder.build("proj.t").unwrap();
        // 4 clones + synthetic aggregate root + its `in` node.
        assert_eq!(graph.len(), 6);
    }

    #[test]
    fn fully_qualified_override_wins_over_bare() {
        let (_dir, arena) = load_single(
            "package:\n  name: proj\ntypes:\n  MsgType:\n    with:\n      msg: hello\ntasks:\n  t:\n    uses: proj.MsgType\n",
        );
        let registry = Registry::new();
        let mut overrides = Overrides::new();
        overrides.set("msg", Value::from("bare"));
        overrides.set("proj.t.msg", Value::from("specific"));
        let markers = MarkerLog::new();
        let builder = Builder::new(&arena, &registry, &overrides, PathBuf::from("/tmp/run"), &markers);
        let graph = builder.build("proj.t").unwrap();
        let node = graph.get(graph.root());
        assert_eq!(node.params.get("msg"), Some(&Value::from("specific")));
    }
}
