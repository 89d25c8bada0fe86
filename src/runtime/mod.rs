//! The scheduler (C7, §4.8) and its collaborators: native/shell task
//! bodies, the per-invocation run context, the `TaskDataInput` a leaf
//! body receives, dynamic subgraph submission (C8), and the memento
//! (up-to-date) bookkeeping.

pub mod body;
pub mod context;
pub mod data;
pub mod dynamic;
pub mod memento;
pub mod scheduler;

pub use body::{BodyOutcome, BodyRegistry, NativeBodyFn, NativeBodyFuture};
pub use context::{ExecCmd, ExecResult, RunContext};
pub use data::TaskInput;
pub use dynamic::{DynamicHandle, DynamicNode};
pub use scheduler::{RunOutcome, Scheduler};
