//! Concrete execution nodes (§3 TaskNode): what the builder produces from
//! an elaborated [`crate::model::Task`]. A `TaskNode` is an *instance* —
//! matrix/generate strategies turn one declarative task into many nodes,
//! each with its own resolved parameter struct and rundir.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::model::{Body, CachePolicy, ConsumesSpec, ControlFlow, Passthrough, Pattern, Visibility};
use crate::value::Value;

/// Index of a [`TaskNode`] inside a [`super::TaskGraph`]. Stable for the
/// lifetime of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(super) usize);

impl NodeId {
    /// Construct a `NodeId` for a graph assembled outside the builder —
    /// the nested scheduler [`crate::runtime::dynamic`] spins up over a
    /// caller-submitted batch has no `Builder` to hand out ids from.
    pub(crate) fn from_index(i: usize) -> Self {
        NodeId(i)
    }
}

/// A `needs` edge to another node. `blocking` gates scheduler readiness
/// (§4.8); this crate's package file grammar only ever produces blocking
/// edges — see DESIGN.md for the non-blocking-edge simplification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedEdge {
    pub target: NodeId,
    pub blocking: bool,
}

/// The node's executable shape (§3: Leaf / Compound / Control).
#[derive(Debug, Clone)]
pub enum NodeBody {
    Leaf(Option<Body>),
    Compound {
        /// Synthetic node aggregating the compound's own `needs` (§4.3).
        in_node: NodeId,
        subtasks: Vec<NodeId>,
        /// Subtasks with no in-compound dependent; their outputs are the
        /// compound's aggregated output.
        sinks: Vec<NodeId>,
    },
    Control {
        flow: ControlFlow,
        /// The body each iteration/branch invokes (§4.4: control tasks run
        /// a body like a leaf, just conditionally or repeatedly).
        body: Option<Body>,
    },
}

#[derive(Debug, Clone)]
pub struct TaskNode {
    /// Unique name within the run (may differ from `task_name` for
    /// matrix/generate clones, e.g. `proj.msg.x_a`).
    pub name: Arc<str>,
    /// The declarative task this node instantiates.
    pub task_name: String,
    /// Resolved parameter values (`${{ }}` templates already substituted).
    pub params: BTreeMap<String, Value>,
    /// `this.*` scope visible to this node's own template expansion —
    /// the enclosing compound's params plus any matrix loop variables.
    pub this_vars: BTreeMap<String, Value>,
    pub needs: Vec<NeedEdge>,
    pub rundir: PathBuf,
    pub srcdir: PathBuf,
    pub parent: Option<NodeId>,
    pub body: NodeBody,
    pub produces: Vec<Pattern>,
    pub consumes: ConsumesSpec,
    pub visibility: Visibility,
    pub passthrough: Passthrough,
    pub iff: Option<String>,
    pub cache: CachePolicy,
    pub tags: Vec<String>,
}

impl TaskNode {
    pub fn is_compound(&self) -> bool {
        matches!(self.body, NodeBody::Compound { .. })
    }

    pub fn is_control(&self) -> bool {
        matches!(self.body, NodeBody::Control { .. })
    }
}

/// A node the build-time `generate` strategy asks the builder to
/// instantiate, naming an existing declarative task as its base (§4.3).
#[derive(Debug, Clone)]
pub struct TaskNodeSpec {
    pub name: Option<String>,
    pub task_name: String,
    pub with: BTreeMap<String, Value>,
}
