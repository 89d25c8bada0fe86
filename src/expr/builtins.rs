//! Built-in pipe filters and free functions: `length`, `sort`, `unique`,
//! `reverse`, `first`, `last`, `split`, `shell()`.
//!
//! Pipe filters (`xs | sort`) reach here through [`call`], which treats
//! the piped-in value as an implicit first argument. Free function calls
//! (`shell("echo hi")`) reach here through [`call_free`].

use std::process::Command;

use crate::error::FlowError;
use crate::value::Value;

/// Dispatch a pipe-filter stage: `base | name(args...)`.
pub fn call(name: &str, base: &Value, args: &[Value], source: &str) -> Result<Value, FlowError> {
    match name {
        "length" => length(base, source),
        "sort" => sort(base, source),
        "unique" => unique(base, source),
        "reverse" => reverse(base, source),
        "first" => first(base, source),
        "last" => last(base, source),
        "split" => split(base, args, source),
        other => Err(FlowError::ExprUnknownIdentifier {
            name: other.to_string(),
            source: source.to_string(),
        }),
    }
}

/// Dispatch a free function call: `name(args...)`, no piped-in base.
pub fn call_free(name: &str, args: &[Value], source: &str) -> Result<Value, FlowError> {
    match name {
        "shell" => shell(args, source),
        "length" => length(first_arg(args, source)?, source),
        "sort" => sort(first_arg(args, source)?, source),
        "unique" => unique(first_arg(args, source)?, source),
        "reverse" => reverse(first_arg(args, source)?, source),
        "first" => first(first_arg(args, source)?, source),
        "last" => last(first_arg(args, source)?, source),
        "split" => split(first_arg(args, source)?, &args[1..], source),
        other => Err(FlowError::ExprUnknownIdentifier {
            name: other.to_string(),
            source: source.to_string(),
        }),
    }
}

fn first_arg<'a>(args: &'a [Value], source: &str) -> Result<&'a Value, FlowError> {
    args.first().ok_or_else(|| FlowError::ExprTypeMismatch {
        source: source.to_string(),
        expected: "at least one argument".to_string(),
        actual: "none".to_string(),
    })
}

fn as_list<'a>(v: &'a Value, source: &str) -> Result<&'a [Value], FlowError> {
    v.as_list().ok_or_else(|| FlowError::ExprTypeMismatch {
        source: source.to_string(),
        expected: "list".to_string(),
        actual: v.type_name().to_string(),
    })
}

fn length(v: &Value, source: &str) -> Result<Value, FlowError> {
    let n = match v {
        Value::List(items) => items.len(),
        Value::Str(s) => s.chars().count(),
        Value::Map(m) => m.len(),
        other => {
            return Err(FlowError::ExprTypeMismatch {
                source: source.to_string(),
                expected: "list, str, or map".to_string(),
                actual: other.type_name().to_string(),
            })
        }
    };
    Ok(Value::Int(n as i64))
}

fn sort(v: &Value, source: &str) -> Result<Value, FlowError> {
    let mut items = as_list(v, source)?.to_vec();
    items.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
    Ok(Value::List(items))
}

fn unique(v: &Value, source: &str) -> Result<Value, FlowError> {
    let items = as_list(v, source)?;
    let mut seen = Vec::new();
    for item in items {
        if !seen.contains(item) {
            seen.push(item.clone());
        }
    }
    Ok(Value::List(seen))
}

fn reverse(v: &Value, source: &str) -> Result<Value, FlowError> {
    let mut items = as_list(v, source)?.to_vec();
    items.reverse();
    Ok(Value::List(items))
}

fn first(v: &Value, source: &str) -> Result<Value, FlowError> {
    as_list(v, source)?
        .first()
        .cloned()
        .ok_or_else(|| FlowError::ExprInvalidTraversal {
            source: source.to_string(),
            type_name: "empty list".to_string(),
        })
}

fn last(v: &Value, source: &str) -> Result<Value, FlowError> {
    as_list(v, source)?
        .last()
        .cloned()
        .ok_or_else(|| FlowError::ExprInvalidTraversal {
            source: source.to_string(),
            type_name: "empty list".to_string(),
        })
}

fn split(v: &Value, args: &[Value], source: &str) -> Result<Value, FlowError> {
    let s = v.as_str().ok_or_else(|| FlowError::ExprTypeMismatch {
        source: source.to_string(),
        expected: "str".to_string(),
        actual: v.type_name().to_string(),
    })?;
    let sep = args.first().and_then(Value::as_str).unwrap_or(" ");
    Ok(Value::List(s.split(sep).map(Value::from).collect()))
}

/// Runs `args[0]` as a shell command via `sh -c` and returns its trimmed
/// stdout as a string. Used by cache hash recipes and task parameter
/// expressions that shell out for a derived value.
fn shell(args: &[Value], source: &str) -> Result<Value, FlowError> {
    let cmd = first_arg(args, source)?.as_str().ok_or_else(|| FlowError::ExprTypeMismatch {
        source: source.to_string(),
        expected: "str command".to_string(),
        actual: "non-str".to_string(),
    })?;
    let output = Command::new("sh").arg("-c").arg(cmd).output().map_err(FlowError::Io)?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(Value::from(stdout.trim_end().to_string()))
}
