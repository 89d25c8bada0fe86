//! The declarative `Task` model (§3) — a named node in a package's task
//! table, before graph elaboration turns it into concrete `TaskNode`s
//! (see [`crate::graph::node`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

use super::schema::ParamSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RundirPolicy {
    #[default]
    Unique,
    Inherit,
    Top,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Root,
    Export,
    Local,
    #[default]
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Passthrough {
    #[default]
    None,
    All,
    Unused,
}

/// A single `produces`/`consumes` entry: a record type plus an
/// attribute-equality subset pattern (§4.6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub with: BTreeMap<String, Value>,
}

/// `consumes:` field (§4.6): absent/`"all"` matches anything, `"none"`
/// matches only a producer with no output, or an explicit OR-list of
/// patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConsumesSpec {
    Sentinel(String),
    Patterns(Vec<Pattern>),
}

impl Default for ConsumesSpec {
    fn default() -> Self {
        ConsumesSpec::Sentinel("all".to_string())
    }
}

impl ConsumesSpec {
    pub fn matches_none_output(&self) -> bool {
        matches!(self, ConsumesSpec::Sentinel(s) if s == "none")
    }

    pub fn matches_anything(&self) -> bool {
        matches!(self, ConsumesSpec::Sentinel(s) if s == "all")
    }

    pub fn patterns(&self) -> &[Pattern] {
        match self {
            ConsumesSpec::Patterns(p) => p,
            ConsumesSpec::Sentinel(_) => &[],
        }
    }
}

/// `strategy:` block (§4.3): a task either expands by cartesian product
/// over named dimensions, or calls a registered generator at build time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Matrix(BTreeMap<String, Vec<Value>>),
    Generate(String),
}

/// `control.state.init` (§4.4): the state map a control task's body
/// observes and updates via `${{ state.* }}`, seeded before the first
/// iteration/branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlState {
    #[serde(default)]
    pub init: BTreeMap<String, Value>,
}

/// `control:` block (§4.4). Mutually exclusive with `strategy` on the
/// same task (enforced by the loader, not this type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControlFlow {
    If {
        cond: String,
        #[serde(default)]
        state: ControlState,
    },
    Match {
        cases: Vec<MatchCase>,
        #[serde(default)]
        default: bool,
        #[serde(default)]
        state: ControlState,
    },
    Repeat {
        count: String,
        #[serde(default)]
        until: Option<String>,
        #[serde(default)]
        state: ControlState,
    },
    While {
        cond: String,
        max_iter: u64,
        #[serde(default)]
        state: ControlState,
    },
    DoWhile {
        until: String,
        max_iter: u64,
        #[serde(default)]
        state: ControlState,
    },
}

impl ControlFlow {
    pub fn max_iter(&self) -> Option<u64> {
        match self {
            ControlFlow::While { max_iter, .. } | ControlFlow::DoWhile { max_iter, .. } => Some(*max_iter),
            _ => None,
        }
    }

    pub fn state_init(&self) -> &BTreeMap<String, Value> {
        match self {
            ControlFlow::If { state, .. }
            | ControlFlow::Match { state, .. }
            | ControlFlow::Repeat { state, .. }
            | ControlFlow::While { state, .. }
            | ControlFlow::DoWhile { state, .. } => &state.init,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCase {
    pub when: String,
}

/// `cache:` block (§4.5). `None` means the task is never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default)]
    pub hash: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            hash: Vec::new(),
            enabled: false,
        }
    }
}

/// The task's executable body. Exactly one variant is ever populated on
/// a leaf task; a compound task has `subtasks` instead and no body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Shell(String),
    /// Name of a native routine registered in the runtime body registry.
    Native(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Task {
    /// Fully-qualified name: `pkg.[frag.]task[.subtask...]`.
    pub name: String,
    #[serde(default)]
    pub uses: Option<String>,
    #[serde(default)]
    pub schema: ParamSchema,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub feeds: Vec<String>,
    #[serde(default)]
    pub consumes: ConsumesSpec,
    #[serde(default)]
    pub produces: Vec<Pattern>,
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub control: Option<ControlFlow>,
    #[serde(default)]
    pub rundir: RundirPolicy,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub passthrough: Passthrough,
    #[serde(default)]
    pub iff: Option<String>,
    #[serde(default)]
    pub cache: CachePolicy,
    #[serde(default)]
    pub body: Option<Body>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_compound(&self) -> bool {
        !self.subtasks.is_empty()
    }

    /// Mutually-exclusive check enforced by the loader (§4.2): a task
    /// may declare `control` or `strategy`, never both.
    pub fn has_control_strategy_conflict(&self) -> bool {
        self.control.is_some() && self.strategy.is_some()
    }
}
