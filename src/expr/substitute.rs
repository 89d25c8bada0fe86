//! The `${{ expr }}` substitution engine.
//!
//! Cow-based zero-allocation early return, whole-string type
//! preservation: a template that is a single bare `${{ }}` expression
//! returns the underlying `Value` directly instead of stringifying it.
//! The string-interpolation fallback goes through `Value::Display`,
//! which renders booleans as `True`/`False`, not `true`/`false`.

use std::borrow::Cow;

use crate::error::FlowError;
use crate::value::Value;

use super::eval::{eval, Scope};
use super::parser;
use crate::util::constants::MAX_EXPANSION_DEPTH;

/// Substitute every `${{ ... }}` marker in `input` against `scope`.
///
/// If `input`, once trimmed, is *exactly* one marker (`${{ expr }}`),
/// the expression's evaluated `Value` is returned unchanged — this is
/// how a YAML field can resolve to a list or map rather than a string.
/// Otherwise the markers are stringified in place (via `Value::Display`)
/// and a `Value::Str` is returned.
pub fn substitute(input: &str, scope: &Scope) -> Result<Value, FlowError> {
    substitute_depth(input, scope, 0)
}

fn substitute_depth(input: &str, scope: &Scope, depth: usize) -> Result<Value, FlowError> {
    if depth > MAX_EXPANSION_DEPTH {
        return Err(FlowError::ExprMaxDepthExceeded {
            source: input.to_string(),
            max_depth: MAX_EXPANSION_DEPTH,
        });
    }

    if !input.contains("${{") {
        return Ok(Value::Str(input.into()));
    }

    if let Some(src) = whole_string_marker(input) {
        let expr = parser::parse(src).map_err(|reason| FlowError::ExprParseError {
            source: src.to_string(),
            reason,
        })?;
        let value = eval(&expr, scope, src)?;
        if let Value::Str(s) = &value {
            if s.contains("${{") {
                return substitute_depth(s, scope, depth + 1);
            }
        }
        return Ok(value);
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let end = after.find("}}").ok_or_else(|| FlowError::ExprParseError {
            source: input.to_string(),
            reason: "unterminated ${{ ... }} marker".to_string(),
        })?;
        let src = after[..end].trim();
        let expr = parser::parse(src).map_err(|reason| FlowError::ExprParseError {
            source: src.to_string(),
            reason,
        })?;
        let value = eval(&expr, scope, src)?;
        out.push_str(&value.to_string());
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    if out.contains("${{") {
        substitute_depth(&out, scope, depth + 1)
    } else {
        Ok(Value::Str(out.into()))
    }
}

/// If `input`, once trimmed, is exactly one `${{ ... }}` marker, return
/// the inner expression source. Otherwise `None`.
fn whole_string_marker(input: &str) -> Option<&str> {
    let trimmed = input.trim();
    let inner = trimmed.strip_prefix("${{")?.strip_suffix("}}")?;
    if inner.contains("${{") {
        None
    } else {
        Some(inner.trim())
    }
}

/// Zero-allocation view over a string with no substitution markers.
/// Callers that only need to know whether expansion is required (not
/// the expanded value) can use this instead of `substitute`.
pub fn maybe_borrowed(input: &str) -> Cow<'_, str> {
    if input.contains("${{") {
        Cow::Owned(input.to_string())
    } else {
        Cow::Borrowed(input)
    }
}
