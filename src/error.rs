// The #[error] attribute from thiserror uses struct fields via string interpolation,
// but Rust's unused_assignments lint doesn't recognize this.
#![allow(unused_assignments)]

//! Error taxonomy for the flowmgr core.
//!
//! Error code ranges:
//! - FLOW-000-019: Expression/value errors
//! - FLOW-020-049: Loader/elaborator errors
//! - FLOW-050-079: Graph builder errors
//! - FLOW-080-109: Cache layer errors
//! - FLOW-110-119: Jobserver errors
//! - FLOW-120-159: Scheduler/runner errors

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlowError>;

/// Trait for errors that provide fix suggestions to a human reader.
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
///
/// Implements both `thiserror::Error` for std error compatibility and
/// `miette::Diagnostic` for fancy terminal error display.
#[derive(Error, Debug, Diagnostic)]
#[diagnostic(url(docsrs))]
pub enum FlowError {
    // ═══════════════════════════════════════════
    // EXPRESSION / VALUE ERRORS (000-019)
    // ═══════════════════════════════════════════
    #[error("[FLOW-001] Failed to parse expression `{source}`: {reason}")]
    #[diagnostic(code(flowmgr::expr_parse_error))]
    ExprParseError { source: String, reason: String },

    #[error("[FLOW-002] Unknown identifier `{name}` in expression `{source}`")]
    #[diagnostic(
        code(flowmgr::expr_unknown_identifier),
        help("Check the scope lookup order: local params, this.*, package vars, imports, env")
    )]
    ExprUnknownIdentifier { name: String, source: String },

    #[error("[FLOW-003] Expression `{source}` expanded into a null value")]
    #[diagnostic(code(flowmgr::expr_null_value))]
    ExprNullValue { source: String },

    #[error("[FLOW-004] Cannot index into a {type_name} value in expression `{source}`")]
    #[diagnostic(code(flowmgr::expr_invalid_traversal))]
    ExprInvalidTraversal { source: String, type_name: String },

    #[error("[FLOW-005] Substitution recursion exceeded maximum depth {max_depth} in `{source}`")]
    #[diagnostic(
        code(flowmgr::expr_max_depth),
        help("Check for a substitution cycle between referenced variables")
    )]
    ExprMaxDepthExceeded { source: String, max_depth: usize },

    #[error("[FLOW-006] Type mismatch in expression `{source}`: expected {expected}, got {actual}")]
    #[diagnostic(code(flowmgr::expr_type_mismatch))]
    ExprTypeMismatch {
        source: String,
        expected: String,
        actual: String,
    },

    // ═══════════════════════════════════════════
    // LOADER / ELABORATOR ERRORS (020-049)
    // ═══════════════════════════════════════════
    #[error("[FLOW-020] Failed to parse package file {path}: {reason}")]
    #[diagnostic(code(flowmgr::parse_error))]
    ParseError { path: String, reason: String },

    #[error("[FLOW-021] Package file not found: {path}")]
    #[diagnostic(code(flowmgr::package_not_found), help("Check the file path and any `imports:` search path"))]
    PackageNotFound { path: String },

    #[error("[FLOW-022] Schema validation failed at {file}:{line}:{column}: unknown field `{field}`{suggestion}")]
    #[diagnostic(code(flowmgr::schema_validation))]
    SchemaValidation {
        file: String,
        line: usize,
        column: usize,
        field: String,
        suggestion: String,
    },

    #[error("[FLOW-023] `control` and `strategy` are mutually exclusive on task `{task}`")]
    #[diagnostic(code(flowmgr::control_strategy_conflict))]
    ControlStrategyConflict { task: String },

    #[error("[FLOW-024] Control block of kind `{kind}` on task `{task}` is missing required field `{field}`")]
    #[diagnostic(code(flowmgr::control_missing_field))]
    ControlMissingField {
        task: String,
        kind: String,
        field: String,
    },

    #[error("[FLOW-025] Unknown reference `{expanded}` (from template `{template}`)")]
    #[diagnostic(
        code(flowmgr::unknown_reference),
        help("The message contains the *expanded* target, not the template source")
    )]
    UnknownReference { expanded: String, template: String },

    #[error("[FLOW-026] `override: {target}` on task `{task}` has no matching base task")]
    #[diagnostic(code(flowmgr::override_target_missing))]
    OverrideTargetMissing { task: String, target: String },

    #[error("[FLOW-027] Fragment name `{name}` is declared more than once in package `{package}`")]
    #[diagnostic(code(flowmgr::duplicate_fragment_name))]
    DuplicateFragmentName { package: String, name: String },

    #[error("[FLOW-028] Task name collision: `{name}` is declared more than once")]
    #[diagnostic(code(flowmgr::duplicate_task_name))]
    DuplicateTaskName { name: String },

    #[error("[FLOW-029] Import cycle detected while loading package `{package}`: {cycle}")]
    #[diagnostic(code(flowmgr::import_cycle))]
    ImportCycle { package: String, cycle: String },

    // ═══════════════════════════════════════════
    // GRAPH BUILDER ERRORS (050-079)
    // ═══════════════════════════════════════════
    #[error("[FLOW-050] Circular dependency detected: {cycle}")]
    #[diagnostic(code(flowmgr::circular_dependency), help("Break the cycle by removing one of the listed `needs` edges"))]
    CircularDependency { cycle: String },

    #[error("[FLOW-051] Task `{task}` has no producer for dependency `{dep}`")]
    #[diagnostic(code(flowmgr::missing_dependency))]
    MissingDependency { task: String, dep: String },

    #[error("[FLOW-052] Forward reference `{reference}` from task `{task}` could not be resolved")]
    #[diagnostic(code(flowmgr::unresolved_forward_reference))]
    UnresolvedForwardReference { task: String, reference: String },

    #[error("[FLOW-053] Matrix strategy on task `{task}` has an empty dimension `{dimension}`")]
    #[diagnostic(code(flowmgr::empty_matrix_dimension))]
    EmptyMatrixDimension { task: String, dimension: String },

    #[error("[FLOW-054] Generator `{name}` registered for task `{task}` is unknown to the registry")]
    #[diagnostic(code(flowmgr::unknown_generator))]
    UnknownGenerator { task: String, name: String },

    #[error("[FLOW-055] Output item from task `{task}` is missing a `type` field")]
    #[diagnostic(code(flowmgr::invalid_output_item), help("Every data item must carry a non-empty `type`"))]
    InvalidOutputItem { task: String },

    // ═══════════════════════════════════════════
    // CACHE LAYER ERRORS (080-109)
    // ═══════════════════════════════════════════
    #[error("[FLOW-080] Cache entry for key `{key}` is corrupt: {reason}")]
    #[diagnostic(code(flowmgr::cache_corrupt), help("Treated as a cache miss"))]
    CacheCorrupt { key: String, reason: String },

    #[error("[FLOW-081] Failed to store cache entry for key `{key}`: {reason}")]
    #[diagnostic(code(flowmgr::cache_store_failed), help("The task result is still reported as successful"))]
    CacheStoreFailed { key: String, reason: String },

    #[error("[FLOW-082] Timed out acquiring {kind} lock on cache entry `{key}` after {timeout_secs}s")]
    #[diagnostic(code(flowmgr::lock_timeout))]
    LockTimeout {
        key: String,
        kind: String,
        timeout_secs: u64,
    },

    #[error("[FLOW-083] Malformed cache key `{key}`: expected `task:hash` form")]
    #[diagnostic(code(flowmgr::malformed_cache_key))]
    MalformedCacheKey { key: String },

    #[error("[FLOW-084] Artifact path `{path}` escapes the rundir for cache entry `{key}`")]
    #[diagnostic(code(flowmgr::path_traversal), help("Cache artifact paths must remain inside the rundir"))]
    PathTraversal { key: String, path: String },

    #[error("[FLOW-085] No hash provider supports filetype `{filetype}`")]
    #[diagnostic(code(flowmgr::no_hash_provider))]
    NoHashProvider { filetype: String },

    // ═══════════════════════════════════════════
    // JOBSERVER ERRORS (110-119)
    // ═══════════════════════════════════════════
    #[error("[FLOW-110] nproc must be >= 1, got {nproc}")]
    #[diagnostic(code(flowmgr::invalid_nproc))]
    InvalidNproc { nproc: i64 },

    #[error("[FLOW-111] Timed out acquiring a jobserver token after {timeout_secs}s")]
    #[diagnostic(code(flowmgr::jobserver_timeout))]
    JobserverTimeout { timeout_secs: u64 },

    #[error("[FLOW-112] Jobserver is broken: {reason}")]
    #[diagnostic(code(flowmgr::jobserver_broken), help("The run is aborted"))]
    JobServerBroken { reason: String },

    // ═══════════════════════════════════════════
    // SCHEDULER / RUNNER ERRORS (120-159)
    // ═══════════════════════════════════════════
    #[error("[FLOW-120] Task `{task}` failed with status {status}: {reason}")]
    #[diagnostic(code(flowmgr::task_failure))]
    TaskFailure {
        task: String,
        status: i32,
        reason: String,
    },

    #[error("[FLOW-121] Task `{task}` body raised an uncaught error: {reason}")]
    #[diagnostic(code(flowmgr::uncaught_body_exception))]
    UncaughtBodyException { task: String, reason: String },

    #[error("[FLOW-122] Task `{task}` timed out after {timeout_secs}s")]
    #[diagnostic(code(flowmgr::task_timeout))]
    TaskTimeout { task: String, timeout_secs: u64 },

    #[error("[FLOW-123] run_subgraph from task `{task}` references unknown node `{reference}`")]
    #[diagnostic(
        code(flowmgr::subgraph_unknown_reference),
        help("Submitted subgraph nodes may reference only batch-local or already in-flight nodes")
    )]
    SubgraphUnknownReference { task: String, reference: String },

    #[error("[FLOW-124] run_subgraph from task `{task}` would introduce a cycle via `{reference}`")]
    #[diagnostic(code(flowmgr::subgraph_cycle))]
    SubgraphCycle { task: String, reference: String },

    #[error("[FLOW-125] Control task `{task}` exceeded max_iter={max_iter}")]
    #[diagnostic(code(flowmgr::control_max_iter_exceeded))]
    ControlMaxIterExceeded { task: String, max_iter: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FixSuggestion for FlowError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            FlowError::SchemaValidation { suggestion, .. } if !suggestion.is_empty() => {
                Some(suggestion.as_str())
            }
            FlowError::CircularDependency { .. } => {
                Some("Break the cycle by removing one of the listed `needs` edges")
            }
            _ => None,
        }
    }
}
