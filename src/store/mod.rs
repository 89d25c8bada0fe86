//! Output storage: typed data items produced by tasks, and the
//! concurrent store the scheduler uses to publish/observe results.

mod output;

pub use output::{DataItem, OutputStore, TaskResult, TaskStatus};
