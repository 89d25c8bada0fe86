//! Package loading and elaboration (§4.2): turns package files on disk into
//! the in-memory [`Package`]/[`Task`]/[`TypeDef`] model consumed by
//! [`crate::graph::builder`].
//!
//! Loading is two-phase: [`Loader::load`] first parses every file reachable
//! through `imports:`/`fragments:` into a path-keyed [`RawPackage`] table
//! (detecting import cycles along the way), then links each `RawPackage`
//! into an elaborated [`Package`] in a second pass. Splitting parse from
//! link lets two packages import each other's *files* without the model
//! itself needing a mutable back-edge.

mod raw;
mod parse;
mod validate;

pub use raw::{RawPackage, RawPackageHeader, RawTask, RawType, RAW_TASK_FIELDS};
pub use parse::parse_file;
pub use validate::{suggest_field, validate_with_block, wrap_yaml_error};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{FlowError, Result};
use crate::event::Marker;
use crate::expr::{self, Scope};
use crate::model::{
    Body, Package, ParamDef, ParamSchema, ParamType, Task, TypeDef, Passthrough, RundirPolicy, Visibility,
};
use crate::value::Value;

const PACKAGE_FILE_STEMS: &[&str] = &["flow"];
const PACKAGE_FILE_EXTS: &[&str] = &["dv", "yaml", "yml", "toml"];

/// Identity of a [`Package`] inside a [`PackageArena`]. Stable for the
/// lifetime of the arena; loading the same path twice returns the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageId(usize);

/// Path-keyed collection of every package reachable from a load root.
#[derive(Debug, Default)]
pub struct PackageArena {
    packages: Vec<Package>,
    by_path: BTreeMap<PathBuf, PackageId>,
}

impl PackageArena {
    pub fn get(&self, id: PackageId) -> &Package {
        &self.packages[id.0]
    }

    pub fn get_mut(&mut self, id: PackageId) -> &mut Package {
        &mut self.packages[id.0]
    }

    pub fn by_name(&self, name: &str) -> Option<&Package> {
        self.packages.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Package> {
        self.packages.iter()
    }

    /// Look up a task by its fully-qualified name across every loaded
    /// package (task-name resolution case (a), §4.2).
    pub fn find_task(&self, qualified_name: &str) -> Option<&Task> {
        self.packages.iter().find_map(|p| p.task(qualified_name))
    }

    /// Look up a type definition by its fully-qualified name across every
    /// loaded package.
    pub fn find_type(&self, qualified_name: &str) -> Option<&TypeDef> {
        self.packages.iter().find_map(|p| p.type_def(qualified_name))
    }

    fn insert(&mut self, path: PathBuf, package: Package) -> PackageId {
        let id = PackageId(self.packages.len());
        self.packages.push(package);
        self.by_path.insert(path, id);
        id
    }
}

/// Loads and elaborates a package tree rooted at a single file.
pub struct Loader {
    search_roots: Vec<PathBuf>,
    pub markers: Vec<Marker>,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    pub fn new() -> Self {
        Self {
            search_roots: Vec::new(),
            markers: Vec::new(),
        }
    }

    pub fn load(&mut self, root: &Path) -> Result<(PackageArena, PackageId)> {
        let root = root.canonicalize().map_err(|_| FlowError::PackageNotFound {
            path: root.display().to_string(),
        })?;
        if let Some(parent) = root.parent() {
            self.search_roots.push(parent.to_path_buf());
        }

        let mut raw_map: BTreeMap<PathBuf, RawPackage> = BTreeMap::new();
        let mut visiting: Vec<PathBuf> = Vec::new();
        self.parse_all(&root, &mut visiting, &mut raw_map)?;

        let mut arena = PackageArena::default();
        let root_id = self.link_package(&root, &raw_map, &mut arena)?;
        self.backfill_cross_package_uses(&mut arena)?;

        Ok((arena, root_id))
    }

    /// Phase 1: recursively parse every file reachable via `imports:` and
    /// `fragments:`, memoized by canonical path. Cycles in the *file* graph
    /// (as opposed to a task `uses:` cycle, caught later) are reported here.
    fn parse_all(
        &mut self,
        path: &Path,
        visiting: &mut Vec<PathBuf>,
        raw_map: &mut BTreeMap<PathBuf, RawPackage>,
    ) -> Result<()> {
        if raw_map.contains_key(path) {
            return Ok(());
        }
        if visiting.contains(&path.to_path_buf()) {
            let mut cycle: Vec<String> = visiting.iter().map(|p| p.display().to_string()).collect();
            cycle.push(path.display().to_string());
            return Err(FlowError::ImportCycle {
                package: path.display().to_string(),
                cycle: cycle.join(" → "),
            });
        }
        visiting.push(path.to_path_buf());

        let contents = fs::read_to_string(path).map_err(|_| FlowError::PackageNotFound {
            path: path.display().to_string(),
        })?;
        let raw = parse_file(path, &contents)?;

        let basedir = path.parent().unwrap_or_else(|| Path::new("."));
        for reference in raw.imports.iter().chain(raw.fragments.iter()) {
            let resolved = self.resolve_reference(basedir, reference)?;
            self.parse_all(&resolved, visiting, raw_map)?;
        }

        raw_map.insert(path.to_path_buf(), raw);
        visiting.pop();
        Ok(())
    }

    /// Resolves an `imports:`/`fragments:` entry to a concrete file path.
    /// Tried in order: joined against the importing file's directory, then
    /// each recorded search root (so a sub-package can find a sibling
    /// relative to the project root, not just relative to itself). A
    /// directory target is walked recursively for the first `flow.*` file.
    fn resolve_reference(&self, basedir: &Path, reference: &str) -> Result<PathBuf> {
        let mut candidates = vec![basedir.join(reference)];
        candidates.extend(self.search_roots.iter().map(|root| root.join(reference)));

        for candidate in candidates {
            if candidate.is_file() {
                return candidate.canonicalize().map_err(FlowError::Io);
            }
            if candidate.is_dir() {
                if let Some(found) = find_package_file_under(&candidate) {
                    return found.canonicalize().map_err(FlowError::Io);
                }
            }
        }
        Err(FlowError::PackageNotFound {
            path: reference.to_string(),
        })
    }

    /// Phase 2: link a parsed file (and the fragments/imports it pulls in)
    /// into an elaborated [`Package`], memoized by path so importing the
    /// same package twice yields the same [`PackageId`] (§3 identity
    /// invariant).
    fn link_package(&mut self, path: &Path, raw_map: &BTreeMap<PathBuf, RawPackage>, arena: &mut PackageArena) -> Result<PackageId> {
        if let Some(id) = arena.by_path.get(path) {
            return Ok(*id);
        }

        let raw = raw_map.get(path).expect("parse_all populated every reachable path");
        let basedir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let file_label = path.display().to_string();

        let mut package = Package::new(raw.package.name.clone(), basedir.clone());
        package.vars = raw.package.vars.clone();
        package.tags = raw.package.tags.clone();

        for import in &raw.imports {
            let import_path = self.resolve_reference(&basedir, import)?;
            let imported_id = self.link_package(&import_path, raw_map, arena)?;
            let imported_name = arena.get(imported_id).name.clone();
            package.imports.push(imported_name);
        }

        // Merge the root file's own tasks/types plus every fragment's,
        // tracking each qualified name's "local prefix" — the namespace a
        // bare reference inside that task resolves against first.
        let mut raw_tasks: BTreeMap<String, RawTask> = BTreeMap::new();
        let mut raw_types: BTreeMap<String, RawType> = BTreeMap::new();
        let mut local_prefix: BTreeMap<String, String> = BTreeMap::new();
        let mut fragment_names_seen = std::collections::HashSet::new();

        insert_raw_entries(&raw.tasks, &raw.types, &package.name, &mut raw_tasks, &mut raw_types, &mut local_prefix)?;

        for fragment_ref in &raw.fragments {
            let fragment_path = self.resolve_reference(&basedir, fragment_ref)?;
            let fragment_raw = raw_map.get(&fragment_path).expect("fragment was parsed in phase 1");
            let fragment_name = if fragment_raw.package.name != package.name && !fragment_raw.package.name.is_empty() {
                Some(fragment_raw.package.name.clone())
            } else {
                None
            };
            if let Some(name) = &fragment_name {
                if !fragment_names_seen.insert(name.clone()) {
                    return Err(FlowError::DuplicateFragmentName {
                        package: package.name.clone(),
                        name: name.clone(),
                    });
                }
            }
            let prefix = match &fragment_name {
                Some(name) => format!("{}.{}", package.name, name),
                None => package.name.clone(),
            };
            insert_raw_entries(&fragment_raw.tasks, &fragment_raw.types, &prefix, &mut raw_tasks, &mut raw_types, &mut local_prefix)?;
        }

        apply_overrides(&mut raw_tasks, &package.name, &local_prefix)?;

        let pkg_scope = Scope::new().with_package_vars(package.vars.clone());

        let mut resolved_types: BTreeMap<String, TypeDef> = BTreeMap::new();
        let type_names: Vec<String> = raw_types.keys().cloned().collect();
        for name in &type_names {
            let mut resolving = Vec::new();
            let type_def = resolve_type(name, &raw_types, &mut resolved_types, &mut resolving)?;
            package.types.insert(name.clone(), type_def);
        }

        let mut resolved_tasks: BTreeMap<String, Task> = BTreeMap::new();
        let task_names: Vec<String> = raw_tasks.keys().cloned().collect();
        for name in &task_names {
            let prefix = local_prefix.get(name).cloned().unwrap_or_else(|| package.name.clone());
            let mut resolving = Vec::new();
            let task = resolve_task(
                name,
                &prefix,
                &package.name,
                &raw_tasks,
                &raw_types,
                &package.types,
                &pkg_scope,
                &file_label,
                &mut resolved_tasks,
                &mut resolving,
            )?;
            package.tasks.insert(name.clone(), task);
        }

        let id = arena.insert(path.to_path_buf(), package);
        Ok(id)
    }

    /// After every package in the tree has been linked, re-resolve any task
    /// whose `uses:` target lives in a different package than the one that
    /// declared it — the originating package couldn't see that task's
    /// schema during its own `link_package` pass.
    fn backfill_cross_package_uses(&mut self, arena: &mut PackageArena) -> Result<()> {
        let mut patches: Vec<(PackageId, String, Task)> = Vec::new();
        for (idx, package) in arena.packages.iter().enumerate() {
            for (name, task) in &package.tasks {
                let Some(target) = &task.uses else { continue };
                if !task.schema.is_empty() || task.body.is_some() {
                    continue;
                }
                if let Some(base) = arena.find_task(target) {
                    let mut patched = task.clone();
                    patched.schema = base.schema.clone();
                    patched.produces = base.produces.clone();
                    patched.consumes = base.consumes.clone();
                    patched.rundir = base.rundir;
                    patched.visibility = base.visibility;
                    patched.passthrough = base.passthrough;
                    patched.cache = base.cache.clone();
                    patched.body = base.body.clone();
                    patches.push((PackageId(idx), name.clone(), patched));
                } else if let Some(type_def) = arena.find_type(target) {
                    let mut patched = task.clone();
                    patched.schema = type_def.schema.clone();
                    patches.push((PackageId(idx), name.clone(), patched));
                } else if !target.starts_with("std.") {
                    return Err(FlowError::UnknownReference {
                        expanded: target.clone(),
                        template: target.clone(),
                    });
                }
            }
        }
        for (id, name, task) in patches {
            arena.get_mut(id).tasks.insert(name, task);
        }
        Ok(())
    }
}

fn find_package_file_under(dir: &Path) -> Option<PathBuf> {
    let mut matches: Vec<PathBuf> = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_package_file_name(e.path()))
        .map(|e| e.into_path())
        .collect();
    matches.sort_by_key(|p| p.components().count());
    matches.into_iter().next()
}

fn is_package_file_name(path: &Path) -> bool {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { return false };
    let Some(ext) = path.extension().and_then(|s| s.to_str()) else { return false };
    PACKAGE_FILE_STEMS.contains(&stem) && PACKAGE_FILE_EXTS.contains(&ext)
}

/// Merges one file's raw tasks/types into the package-wide tables, qualifying
/// each key as `<pkg>.[<fragment>.]<key>` and rejecting a name already taken
/// by a non-override entry.
fn insert_raw_entries(
    tasks: &BTreeMap<String, RawTask>,
    types: &BTreeMap<String, RawType>,
    prefix: &str,
    raw_tasks: &mut BTreeMap<String, RawTask>,
    raw_types: &mut BTreeMap<String, RawType>,
    local_prefix: &mut BTreeMap<String, String>,
) -> Result<()> {
    for (key, task) in tasks {
        let qualified = format!("{prefix}.{key}");
        if task.override_target.is_none() {
            if raw_tasks.contains_key(&qualified) {
                return Err(FlowError::DuplicateTaskName { name: qualified });
            }
            raw_tasks.insert(qualified.clone(), task.clone());
        } else {
            // Override entries are staged under a synthetic key; `apply_overrides`
            // retargets them onto the base task's qualified name.
            raw_tasks.insert(format!("{qualified}#override"), task.clone());
        }
        local_prefix.insert(qualified, prefix.to_string());
    }
    for (key, ty) in types {
        let qualified = format!("{prefix}.{key}");
        raw_types.insert(qualified, ty.clone());
    }
    Ok(())
}

/// Retargets every staged `#override` entry onto its `override:` target,
/// erroring if the target was never declared (§4.2 override resolution).
fn apply_overrides(raw_tasks: &mut BTreeMap<String, RawTask>, pkg_name: &str, local_prefix: &BTreeMap<String, String>) -> Result<()> {
    let staged: Vec<(String, RawTask)> = raw_tasks
        .iter()
        .filter(|(k, _)| k.ends_with("#override"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for (staged_key, task) in staged {
        raw_tasks.remove(&staged_key);
        let target = task.override_target.clone().expect("staged entries always have an override target");
        let own_prefix = staged_key.rsplit_once("#override").map(|(k, _)| k).and_then(|k| local_prefix.get(k)).cloned().unwrap_or_else(|| pkg_name.to_string());

        let candidate_local = format!("{own_prefix}.{target}");
        let candidate_pkg = format!("{pkg_name}.{target}");
        let qualified_target = if raw_tasks.contains_key(&candidate_local) {
            candidate_local
        } else if raw_tasks.contains_key(&candidate_pkg) {
            candidate_pkg
        } else if raw_tasks.contains_key(&target) {
            target.clone()
        } else {
            return Err(FlowError::OverrideTargetMissing {
                task: target.clone(),
                target,
            });
        };

        raw_tasks.insert(qualified_target, task);
    }
    Ok(())
}

/// Resolves a bare/fragment-qualified reference against the tasks known to
/// this package. Returns `None` when the name belongs to another package
/// (resolved later, against the whole arena, by the graph builder or by
/// [`Loader::backfill_cross_package_uses`]).
fn qualify_relative(raw_name: &str, local_prefix: &str, pkg_name: &str, raw_tasks: &BTreeMap<String, RawTask>) -> Option<String> {
    if raw_name.starts_with(&format!("{pkg_name}.")) {
        return raw_tasks.contains_key(raw_name).then(|| raw_name.to_string());
    }
    let local_candidate = format!("{local_prefix}.{raw_name}");
    if raw_tasks.contains_key(&local_candidate) {
        return Some(local_candidate);
    }
    let pkg_candidate = format!("{pkg_name}.{raw_name}");
    if raw_tasks.contains_key(&pkg_candidate) {
        return Some(pkg_candidate);
    }
    None
}

fn infer_param_def(v: &Value) -> ParamDef {
    let ty = match v {
        Value::Bool(_) => ParamType::Bool,
        Value::Int(_) => ParamType::Int,
        Value::Float(_) => ParamType::Float,
        Value::List(_) => ParamType::List,
        Value::Map(_) => ParamType::Map,
        Value::Null | Value::Str(_) => ParamType::Str,
    };
    ParamDef::new(ty).with_default(v.clone())
}

#[allow(clippy::too_many_arguments)]
fn resolve_type(
    name: &str,
    raw_types: &BTreeMap<String, RawType>,
    resolved: &mut BTreeMap<String, TypeDef>,
    resolving: &mut Vec<String>,
) -> Result<TypeDef> {
    if let Some(t) = resolved.get(name) {
        return Ok(t.clone());
    }
    if resolving.contains(&name.to_string()) {
        let mut cycle = resolving.clone();
        cycle.push(name.to_string());
        return Err(FlowError::CircularDependency { cycle: cycle.join(" → ") });
    }
    let raw = raw_types.get(name).ok_or_else(|| FlowError::UnknownReference {
        expanded: name.to_string(),
        template: name.to_string(),
    })?;
    resolving.push(name.to_string());

    let mut schema = ParamSchema::new();
    if let Some(base_name) = &raw.uses {
        if raw_types.contains_key(base_name) {
            let base = resolve_type(base_name, raw_types, resolved, resolving)?;
            schema = base.schema;
        }
    }
    for (key, value) in &raw.with {
        let def = match schema.get(key) {
            Some(existing) => {
                let mut existing = existing.clone();
                existing.default = Some(value.clone());
                existing
            }
            None => infer_param_def(value),
        };
        schema.insert(key.clone(), def);
    }

    resolving.pop();
    let type_def = TypeDef {
        name: name.to_string(),
        uses: raw.uses.clone(),
        schema,
        doc: raw.doc.clone(),
    };
    resolved.insert(name.to_string(), type_def.clone());
    Ok(type_def)
}

#[allow(clippy::too_many_arguments)]
fn resolve_task(
    qualified_name: &str,
    local_prefix: &str,
    pkg_name: &str,
    raw_tasks: &BTreeMap<String, RawTask>,
    raw_types: &BTreeMap<String, RawType>,
    package_types: &BTreeMap<String, TypeDef>,
    pkg_scope: &Scope,
    file_label: &str,
    resolved: &mut BTreeMap<String, Task>,
    resolving: &mut Vec<String>,
) -> Result<Task> {
    if let Some(t) = resolved.get(qualified_name) {
        return Ok(t.clone());
    }
    if resolving.contains(&qualified_name.to_string()) {
        let mut cycle = resolving.clone();
        cycle.push(qualified_name.to_string());
        return Err(FlowError::CircularDependency { cycle: cycle.join(" → ") });
    }
    let raw = raw_tasks.get(qualified_name).ok_or_else(|| FlowError::UnknownReference {
        expanded: qualified_name.to_string(),
        template: qualified_name.to_string(),
    })?;
    resolving.push(qualified_name.to_string());

    let mut task = Task::new(qualified_name.to_string());

    if let Some(uses_tmpl) = &raw.uses {
        let expanded = expr::substitute(uses_tmpl, pkg_scope)?;
        let expanded_str = expanded.as_str().map(str::to_string).unwrap_or_else(|| expanded.to_string());

        if let Some(base_name) = qualify_relative(&expanded_str, local_prefix, pkg_name, raw_tasks) {
            let base_prefix = local_prefix.to_string();
            let base = resolve_task(
                &base_name,
                &base_prefix,
                pkg_name,
                raw_tasks,
                raw_types,
                package_types,
                pkg_scope,
                file_label,
                resolved,
                resolving,
            )
            .map_err(|_| FlowError::UnknownReference {
                expanded: base_name.clone(),
                template: uses_tmpl.clone(),
            })?;
            task.schema = base.schema.clone();
            task.produces = base.produces.clone();
            task.consumes = base.consumes.clone();
            task.rundir = base.rundir;
            task.visibility = base.visibility;
            task.passthrough = base.passthrough;
            task.cache = base.cache.clone();
            task.body = base.body.clone();
            task.uses = Some(base_name);
        } else if let Some(type_name) = qualify_type_relative(&expanded_str, local_prefix, pkg_name, raw_types) {
            let mut type_resolving = Vec::new();
            let mut type_resolved: BTreeMap<String, TypeDef> = package_types.clone();
            let type_def = resolve_type(&type_name, raw_types, &mut type_resolved, &mut type_resolving)?;
            task.schema = type_def.schema;
            task.uses = Some(type_name);
        } else if expanded_str.starts_with("std.") {
            // A built-in task the core doesn't ship a declarative definition
            // for (§6: "the standard library of built-in task implementations"
            // is an external collaborator). Its schema is inferred from the
            // call site's own `with:` block, the same way an ad hoc type's
            // schema is inferred from its `with:` block in `resolve_type`,
            // and its body dispatches by name into the runtime's native
            // `BodyRegistry` rather than a shell command.
            let mut schema = ParamSchema::new();
            for (key, value) in &raw.with {
                schema.insert(key.clone(), infer_param_def(value));
            }
            task.schema = schema;
            task.body = Some(Body::Native(expanded_str.clone()));
            task.uses = Some(expanded_str);
        } else {
            task.uses = Some(expanded_str);
        }
    }

    if !raw.with.is_empty() {
        validate_with_types(&task.schema, &raw.with, file_label)?;
        for (key, value) in &raw.with {
            match task.schema.get(key) {
                Some(def) => {
                    let mut def = def.clone();
                    def.default = Some(value.clone());
                    task.schema.insert(key.clone(), def);
                }
                None => {
                    let known: Vec<&str> = task.schema.names().collect();
                    return Err(FlowError::SchemaValidation {
                        file: file_label.to_string(),
                        line: 0,
                        column: 0,
                        field: key.clone(),
                        suggestion: suggest_field(key, &known).unwrap_or_default(),
                    });
                }
            }
        }
    }

    for dep in &raw.needs {
        task.needs.push(expand_and_qualify(dep, local_prefix, pkg_name, raw_tasks, pkg_scope)?);
    }
    for dep in &raw.feeds {
        task.feeds.push(expand_and_qualify(dep, local_prefix, pkg_name, raw_tasks, pkg_scope)?);
    }
    for sub in &raw.subtasks {
        task.subtasks.push(qualify_relative(sub, local_prefix, pkg_name, raw_tasks).unwrap_or_else(|| sub.clone()));
    }

    task.consumes = raw.consumes.clone();
    if !raw.produces.is_empty() {
        let mut produces = task.produces.clone();
        produces.extend(raw.produces.clone());
        task.produces = produces;
    }

    if let Some(r) = &raw.rundir {
        task.rundir = parse_rundir(r);
    }
    if let Some(v) = &raw.visibility {
        task.visibility = parse_visibility(v);
    }
    if let Some(p) = &raw.passthrough {
        task.passthrough = parse_passthrough(p);
    }
    task.iff = raw.iff.clone();
    if raw.cache.enabled || !raw.cache.hash.is_empty() {
        task.cache = raw.cache.clone();
    }
    if let Some(shell) = &raw.shell {
        task.body = Some(Body::Shell(shell.clone()));
    }
    task.strategy = raw.strategy.clone();
    task.control = raw.control.clone();
    task.tags = raw.tags.clone();

    if task.has_control_strategy_conflict() {
        return Err(FlowError::ControlStrategyConflict { task: qualified_name.to_string() });
    }

    resolving.pop();
    resolved.insert(qualified_name.to_string(), task.clone());
    Ok(task)
}

fn expand_and_qualify(
    raw_ref: &str,
    local_prefix: &str,
    pkg_name: &str,
    raw_tasks: &BTreeMap<String, RawTask>,
    pkg_scope: &Scope,
) -> Result<String> {
    let expanded = expr::substitute(raw_ref, pkg_scope)?;
    let expanded_str = expanded.as_str().map(str::to_string).unwrap_or_else(|| expanded.to_string());
    Ok(qualify_relative(&expanded_str, local_prefix, pkg_name, raw_tasks).unwrap_or(expanded_str))
}

fn qualify_type_relative(raw_name: &str, local_prefix: &str, pkg_name: &str, raw_types: &BTreeMap<String, RawType>) -> Option<String> {
    if raw_name.starts_with(&format!("{pkg_name}.")) {
        return raw_types.contains_key(raw_name).then(|| raw_name.to_string());
    }
    let local_candidate = format!("{local_prefix}.{raw_name}");
    if raw_types.contains_key(&local_candidate) {
        return Some(local_candidate);
    }
    let pkg_candidate = format!("{pkg_name}.{raw_name}");
    if raw_types.contains_key(&pkg_candidate) {
        return Some(pkg_candidate);
    }
    None
}

fn parse_rundir(s: &str) -> RundirPolicy {
    match s.to_ascii_lowercase().as_str() {
        "inherit" => RundirPolicy::Inherit,
        "top" => RundirPolicy::Top,
        _ => RundirPolicy::Unique,
    }
}

fn parse_visibility(s: &str) -> Visibility {
    match s.to_ascii_lowercase().as_str() {
        "root" => Visibility::Root,
        "export" => Visibility::Export,
        "local" => Visibility::Local,
        _ => Visibility::Default,
    }
}

fn parse_passthrough(s: &str) -> Passthrough {
    match s.to_ascii_lowercase().as_str() {
        "all" => Passthrough::All,
        "unused" => Passthrough::Unused,
        _ => Passthrough::None,
    }
}

fn json_schema_for(schema: &ParamSchema) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    for (name, def) in schema.iter() {
        let ty = match &def.type_ {
            ParamType::Str | ParamType::Path => "string",
            ParamType::Int => "integer",
            ParamType::Float => "number",
            ParamType::Bool => "boolean",
            ParamType::List => "array",
            ParamType::Map | ParamType::Named(_) => "object",
        };
        properties.insert(name.to_string(), serde_json::json!({ "type": ty }));
    }
    serde_json::json!({ "type": "object", "properties": properties })
}

/// Type-checks a task's `with:` values against its (already inherited)
/// parameter schema using a compiled JSON Schema (§4.2).
fn validate_with_types(schema: &ParamSchema, with: &BTreeMap<String, Value>, file_label: &str) -> Result<()> {
    let schema_json = json_schema_for(schema);
    let mut instance = serde_json::Map::new();
    for (key, value) in with {
        if schema.get(key).is_some() {
            instance.insert(key.clone(), value.to_json());
        }
    }
    if !jsonschema::is_valid(&schema_json, &serde_json::Value::Object(instance)) {
        return Err(FlowError::SchemaValidation {
            file: file_label.to_string(),
            line: 0,
            column: 0,
            field: "with".to_string(),
            suggestion: "a `with:` value does not match its declared parameter type".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_a_minimal_single_file_package() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(
            dir.path(),
            "flow.yaml",
            "package:\n  name: proj\ntasks:\n  build:\n    shell: \"echo hi\"\n",
        );
        let (arena, id) = Loader::new().load(&root).unwrap();
        let pkg = arena.get(id);
        assert_eq!(pkg.name, "proj");
        assert!(pkg.task("proj.build").is_some());
    }

    #[test]
    fn uses_inherits_schema_and_body_from_base_task() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(
            dir.path(),
            "flow.yaml",
            "package:\n  name: proj\n\
             tasks:\n\
             \x20 base:\n\
             \x20   shell: \"echo ${{ this.msg }}\"\n\
             \x20 derived:\n\
             \x20   uses: base\n\
             \x20   with:\n\
             \x20     msg: hello\n",
        );
        let (arena, id) = Loader::new().load(&root).unwrap();
        let pkg = arena.get(id);
        let derived = pkg.task("proj.derived").unwrap();
        assert!(matches!(derived.body, Some(Body::Shell(_))));
    }

    #[test]
    fn override_of_missing_base_task_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(
            dir.path(),
            "flow.yaml",
            "package:\n  name: proj\ntasks:\n  whatever:\n    override: nope\n",
        );
        let result = Loader::new().load(&root);
        assert!(matches!(result, Err(FlowError::OverrideTargetMissing { .. })));
    }

    #[test]
    fn override_replaces_the_named_base_task() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(
            dir.path(),
            "flow.yaml",
            "package:\n  name: proj\n\
             tasks:\n\
             \x20 t1:\n\
             \x20   shell: \"echo base\"\n\
             \x20 replacement:\n\
             \x20   override: t1\n\
             \x20   shell: \"echo patched\"\n",
        );
        let (arena, id) = Loader::new().load(&root).unwrap();
        let pkg = arena.get(id);
        let t1 = pkg.task("proj.t1").unwrap();
        assert!(matches!(&t1.body, Some(Body::Shell(s)) if s == "echo patched"));
    }

    #[test]
    fn fragment_tasks_are_namespaced_by_fragment_name() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "frag.yaml", "package:\n  name: myfrag\ntasks:\n  t2:\n    shell: \"echo frag\"\n");
        let root = write(
            dir.path(),
            "flow.yaml",
            "package:\n  name: foo\ntasks:\n  t1:\n    shell: \"echo t1\"\nfragments:\n- frag.yaml\n",
        );
        let (arena, id) = Loader::new().load(&root).unwrap();
        let pkg = arena.get(id);
        assert!(pkg.task("foo.t1").is_some());
        assert!(pkg.task("foo.myfrag.t2").is_some());
    }

    #[test]
    fn duplicate_fragment_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "frag1.yaml", "package:\n  name: myfrag\ntasks:\n  a:\n    shell: \"echo a\"\n");
        write(dir.path(), "frag2.yaml", "package:\n  name: myfrag\ntasks:\n  b:\n    shell: \"echo b\"\n");
        let root = write(
            dir.path(),
            "flow.yaml",
            "package:\n  name: foo\ntasks:\n  t1:\n    shell: \"echo t1\"\nfragments:\n- frag1.yaml\n- frag2.yaml\n",
        );
        let result = Loader::new().load(&root);
        assert!(matches!(result, Err(FlowError::DuplicateFragmentName { .. })));
    }

    #[test]
    fn import_cycle_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.yaml", "package:\n  name: b\nimports:\n- a.yaml\n");
        let root = write(dir.path(), "a.yaml", "package:\n  name: a\nimports:\n- b.yaml\n");
        let result = Loader::new().load(&root);
        assert!(matches!(result, Err(FlowError::ImportCycle { .. })));
    }

    #[test]
    fn needs_with_expression_template_is_expanded_and_qualified() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(
            dir.path(),
            "flow.yaml",
            "package:\n  name: proj\n  vars:\n    sim: vlt\n\
             tasks:\n\
             \x20 vlt_lib:\n\
             \x20   shell: \"echo lib\"\n\
             \x20 sim_img:\n\
             \x20   needs:\n\
             \x20   - \"${{ sim }}_lib\"\n\
             \x20   shell: \"echo img\"\n",
        );
        let (arena, id) = Loader::new().load(&root).unwrap();
        let pkg = arena.get(id);
        let task = pkg.task("proj.sim_img").unwrap();
        assert_eq!(task.needs, vec!["proj.vlt_lib".to_string()]);
    }

    #[test]
    fn unknown_with_key_is_a_schema_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(
            dir.path(),
            "flow.yaml",
            "package:\n  name: proj\n\
             tasks:\n\
             \x20 base:\n\
             \x20   shell: \"echo hi\"\n\
             \x20 derived:\n\
             \x20   uses: base\n\
             \x20   with:\n\
             \x20     bogus: 1\n",
        );
        let result = Loader::new().load(&root);
        assert!(matches!(result, Err(FlowError::SchemaValidation { .. })));
    }
}
