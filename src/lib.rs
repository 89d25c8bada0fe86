//! flowmgr - a declarative task-graph build/CI workflow engine.
//!
//! ## Module Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        DOMAIN MODEL                          │
//! │  value/     Dynamically-typed Value (Null/Bool/Int/.../Map)  │
//! │  model/     Package, Task, ParamSchema — the declarative form │
//! │  expr/      `${{ expr }}` lexer/parser/evaluator/substitution │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      APPLICATION LAYER                       │
//! │  loader/    Package parsing, `uses`/override/fragment linking │
//! │  graph/     TaskNode elaboration: matrix/generate, needs, DFS │
//! │  cache/     Content-addressed hash + provider chain + restore │
//! │  jobserver/ GNU Make-compatible FIFO token pool               │
//! │  runtime/   Scheduler: ready-queue, leaf execution, dynamic   │
//! │             subgraph submission                               │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    INFRASTRUCTURE LAYER                      │
//! │  store/     Concurrent per-task result store (DashMap)       │
//! │  event/     Structured diagnostics: Marker, MarkerLog         │
//! │  util/      String interning, JSONPath, shared constants      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`value`] | The dynamically-typed `Value` with native stringification |
//! | [`model`] | `Package`/`Task`/`ParamSchema` — the declarative task model |
//! | [`expr`] | `${{ }}` expression language and whole-string substitution |
//! | [`loader`] | Two-phase package loading, `uses` inheritance, fragments |
//! | [`graph`] | Graph elaboration: matrix/generate strategies, cycle checks |
//! | [`cache`] | Hashing, storage providers, locking, restore/store |
//! | [`jobserver`] | Bounded concurrency via a GNU Make-compatible jobserver |
//! | [`runtime`] | The scheduler that walks a `TaskGraph` to completion |
//! | [`stdlib`] | The handful of `std.*` built-in task bodies (§1, §6) |
//! | [`store`] | Thread-safe per-task output storage |
//! | [`event`] | Structured diagnostics delivered to listeners |
//! | [`util`] | String interning, JSONPath, shared timeout constants |
//! | [`error`] | The `FlowError` taxonomy with fix suggestions |
//! | [`config`] | Layered run configuration (nproc, cache root, rundir) |

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod expr;
pub mod graph;
pub mod jobserver;
pub mod loader;
pub mod model;
pub mod runtime;
pub mod stdlib;
pub mod store;
pub mod util;
pub mod value;

#[cfg(feature = "test-fixtures")]
pub mod test_fixtures;

// ═══════════════════════════════════════════════════════════════
// PUBLIC API RE-EXPORTS
// ═══════════════════════════════════════════════════════════════

pub use error::{FixSuggestion, FlowError};

pub use config::RunConfig;

pub use value::Value;

pub use model::{ConsumesSpec, Package, ParamDef, ParamSchema, ParamType, Pattern, Task};

pub use expr::{eval_expr, substitute, BinOp, Expr, PipeStage, Scope, UnOp};

pub use loader::{Loader, PackageArena};

pub use graph::{Builder, GeneratorCtx, GeneratorFn, NodeId, Overrides, Registry, TaskGraph, TaskNode};

pub use cache::{CacheEntry, CacheLayer, CacheProvider, HashProvider, HashProviderRegistry};

pub use jobserver::JobServer;

pub use runtime::{BodyRegistry, RunContext, RunOutcome, Scheduler};

pub use store::{DataItem, OutputStore, TaskResult, TaskStatus};

pub use event::{Location, Marker, MarkerLog, Severity, TaskEvent, TaskListener};
