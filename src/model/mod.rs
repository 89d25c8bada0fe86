//! In-memory representation of packages, tasks, types, and parameter
//! schemas (§3, C2). Populated by [`crate::loader`], consumed by
//! [`crate::graph`].

pub mod package;
pub mod schema;
pub mod task;
pub mod typedef;

pub use package::Package;
pub use schema::{ParamDef, ParamSchema, ParamType};
pub use task::{
    Body, CachePolicy, ConsumesSpec, ControlFlow, ControlState, MatchCase, Passthrough, Pattern, RundirPolicy,
    Strategy, Task, Visibility,
};
pub use typedef::TypeDef;
