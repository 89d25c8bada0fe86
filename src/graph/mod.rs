//! Graph construction (C4): turns an elaborated [`crate::model::Task`]
//! reachable from a root task name into a concrete [`TaskGraph`] of
//! [`TaskNode`]s that the scheduler (C7) can walk.

pub mod builder;
pub mod matcher;
pub mod node;
pub mod registry;

pub use builder::{Builder, Overrides};
pub use matcher::{is_compatible, pattern_matches};
pub use node::{NeedEdge, NodeBody, NodeId, TaskNode, TaskNodeSpec};
pub use registry::{GeneratorCtx, GeneratorFn, Registry};

/// The concrete graph produced by the builder for a single run: a flat
/// arena of [`TaskNode`]s plus the id of the root node. Nested compound
/// subtasks and their synthetic `in` nodes live in the same arena, so a
/// plain walk over `iter()` already covers the whole tree.
#[derive(Debug)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    root: NodeId,
}

impl TaskGraph {
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> &TaskNode {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &TaskNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| &*n.name == name).map(NodeId)
    }

    /// Append a dynamically-constructed node (§4.9) and return its id.
    /// Used by the runtime when a running task submits a subgraph;
    /// never called during the initial build.
    pub fn append(&mut self, node: TaskNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Mutable access to an already-placed node, for wiring `needs` edges
    /// onto a dynamically-appended node once its dependencies' ids are
    /// known (§4.9). Not exposed outside the crate — external callers
    /// only ever see a graph through [`Builder::build`]'s finished form.
    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut TaskNode {
        &mut self.nodes[id.0]
    }

    /// Assemble a graph directly from an already-built node list, for
    /// the nested scheduler a disabled dynamic-scheduling run spins up
    /// over a caller-submitted batch (§4.9). `root` need not be
    /// meaningful beyond indexing into `nodes`.
    pub(crate) fn from_parts(nodes: Vec<TaskNode>, root: NodeId) -> Self {
        Self { nodes, root }
    }
}
