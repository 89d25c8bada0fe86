//! Type definitions (§3): like a task but non-executable — a schema
//! whose instances are output records produced by tasks.

use serde::{Deserialize, Serialize};

use super::schema::ParamSchema;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Fully-qualified name, e.g. `std.FileSet`.
    pub name: String,
    /// Optional base type this one extends (`uses`).
    #[serde(default)]
    pub uses: Option<String>,
    pub schema: ParamSchema,
    #[serde(default)]
    pub doc: Option<String>,
}

impl TypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uses: None,
            schema: ParamSchema::new(),
            doc: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::{ParamDef, ParamType};

    #[test]
    fn builds_a_type_with_schema() {
        let mut t = TypeDef::new("std.FileSet");
        t.schema.insert("filetype", ParamDef::new(ParamType::Str));
        assert_eq!(t.schema.len(), 1);
        assert_eq!(t.name, "std.FileSet");
    }
}
