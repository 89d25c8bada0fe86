//! Parameter schemas (§3): an ordered map from name to `{type, default,
//! doc}`. Declaration order matters for matrix-strategy lexicographic
//! ordering (§4.3), so this is a `Vec<(String, ParamDef)>` rather than a
//! `BTreeMap` — no corpus crate here supplies an order-preserving map,
//! and adding one for this alone isn't warranted.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// The declared type of a parameter. `Named` refers to a user-defined
/// [`crate::model::typedef::TypeDef`] by name.
///
/// Serializes to and from a plain string (`"str"`, `"int"`, … or a
/// type name like `"std.FileSet"`) since the package file formats
/// write parameter types as bare strings, not tagged objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ParamType {
    Str,
    Int,
    Float,
    Bool,
    List,
    Map,
    Path,
    Named(String),
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Str => write!(f, "str"),
            ParamType::Int => write!(f, "int"),
            ParamType::Float => write!(f, "float"),
            ParamType::Bool => write!(f, "bool"),
            ParamType::List => write!(f, "list"),
            ParamType::Map => write!(f, "map"),
            ParamType::Path => write!(f, "path"),
            ParamType::Named(name) => write!(f, "{name}"),
        }
    }
}

impl From<String> for ParamType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "str" => ParamType::Str,
            "int" => ParamType::Int,
            "float" => ParamType::Float,
            "bool" => ParamType::Bool,
            "list" => ParamType::List,
            "map" => ParamType::Map,
            "path" => ParamType::Path,
            _ => ParamType::Named(s),
        }
    }
}

impl From<ParamType> for String {
    fn from(t: ParamType) -> Self {
        t.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    #[serde(rename = "type")]
    pub type_: ParamType,
    pub default: Option<Value>,
    #[serde(default)]
    pub doc: Option<String>,
}

impl ParamDef {
    pub fn new(type_: ParamType) -> Self {
        Self {
            type_,
            default: None,
            doc: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Ordered parameter schema. `merge` implements inheritance: the
/// child's definitions overlay the base's, but any name declared only
/// in the base keeps the base's position in the order, and any new name
/// in the child is appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema(Vec<(String, ParamDef)>);

impl ParamSchema {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, def: ParamDef) {
        let name = name.into();
        if let Some(slot) = self.0.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = def;
        } else {
            self.0.push((name, def));
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamDef> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamDef)> {
        self.0.iter().map(|(n, d)| (n.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Inheritance merge: `self` (the base) overlaid by `child`.
    pub fn merge(&self, child: &ParamSchema) -> ParamSchema {
        let mut merged = self.clone();
        for (name, def) in &child.0 {
            merged.insert(name.clone(), def.clone());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overlays_child_over_base_preserving_base_order() {
        let mut base = ParamSchema::new();
        base.insert("a", ParamDef::new(ParamType::Str));
        base.insert("b", ParamDef::new(ParamType::Int));

        let mut child = ParamSchema::new();
        child.insert("b", ParamDef::new(ParamType::Int).with_default(Value::Int(5)));
        child.insert("c", ParamDef::new(ParamType::Bool));

        let merged = base.merge(&child);
        let names: Vec<_> = merged.names().collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(merged.get("b").unwrap().default, Some(Value::Int(5)));
    }

    #[test]
    fn param_type_display_matches_grammar_names() {
        assert_eq!(ParamType::Str.to_string(), "str");
        assert_eq!(ParamType::Named("std.FileSet".to_string()).to_string(), "std.FileSet");
    }

    #[test]
    fn param_type_roundtrips_through_json_strings() {
        let t = ParamType::Named("std.FileSet".to_string());
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"std.FileSet\"");
        let back: ParamType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);

        let builtin: ParamType = serde_json::from_str("\"bool\"").unwrap();
        assert_eq!(builtin, ParamType::Bool);
    }
}
