//! Cross-cutting utilities shared across components.

pub mod constants;
pub mod intern;
pub mod jsonpath;
pub mod leven;

pub use intern::intern;
