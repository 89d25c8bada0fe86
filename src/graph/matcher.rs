//! Dataflow subset-match (§4.6), grounded line-for-line on the reference
//! implementation's `DataflowMatcher.check_compatibility` /
//! `_find_matching_produce` / `_pattern_matches` trio (see DESIGN.md).
//!
//! A consume pattern matches a produce pattern iff the two share a
//! record type and every attribute in the consume pattern is present in
//! the produce pattern with an equal value (subset match, not equality).

use crate::model::{ConsumesSpec, Pattern};

pub fn pattern_matches(consume: &Pattern, produce: &Pattern) -> bool {
    consume.type_name == produce.type_name
        && consume.with.iter().all(|(k, v)| produce.with.get(k) == Some(v))
}

/// Whether a consumer's `consumes:` spec is satisfied by a producer's
/// `produces:` list. Never a hard failure — callers turn `false` into a
/// `DataflowMismatch` warning, not an error (§4.6, §7).
pub fn is_compatible(consumes: &ConsumesSpec, produces: &[Pattern]) -> bool {
    if consumes.matches_anything() {
        return true;
    }
    if consumes.matches_none_output() {
        return produces.is_empty();
    }
    consumes
        .patterns()
        .iter()
        .any(|c| produces.iter().any(|p| pattern_matches(c, p)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(type_name: &str, with: &[(&str, Value)]) -> Pattern {
        Pattern {
            type_name: type_name.to_string(),
            with: with.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    use crate::value::Value;

    #[test]
    fn absent_consumes_matches_anything() {
        let consumes = ConsumesSpec::default();
        assert!(is_compatible(&consumes, &[]));
        assert!(is_compatible(&consumes, &[pattern("std.FileSet", &[])]));
    }

    #[test]
    fn none_consumes_requires_empty_produces() {
        let consumes = ConsumesSpec::Sentinel("none".to_string());
        assert!(is_compatible(&consumes, &[]));
        assert!(!is_compatible(&consumes, &[pattern("std.FileSet", &[])]));
    }

    #[test]
    fn pattern_list_matches_on_subset_of_attributes() {
        let consumes = ConsumesSpec::Patterns(vec![pattern("std.FileSet", &[("filetype", Value::from("verilog"))])]);
        let produces = vec![pattern(
            "std.FileSet",
            &[("filetype", Value::from("verilog")), ("lang_version", Value::from("2012"))],
        )];
        assert!(is_compatible(&consumes, &produces));
    }

    #[test]
    fn mismatched_attribute_value_is_incompatible() {
        let consumes = ConsumesSpec::Patterns(vec![pattern("std.FileSet", &[("filetype", Value::from("vhdl"))])]);
        let produces = vec![pattern("std.FileSet", &[("filetype", Value::from("verilog"))])];
        assert!(!is_compatible(&consumes, &produces));
    }

    #[test]
    fn type_mismatch_is_incompatible_even_with_matching_attributes() {
        let consumes = ConsumesSpec::Patterns(vec![pattern("std.Message", &[])]);
        let produces = vec![pattern("std.FileSet", &[])];
        assert!(!is_compatible(&consumes, &produces));
    }
}
