//! The standard task library (§1, §6): the "handful of built-in task
//! implementations" the E2E scenarios in §8 need, kept deliberately
//! tiny since a real standard library is an external collaborator's
//! concern, not core engineering.
//!
//! `std.Message` prints a rendered message (E1); `std.FileSet` declares
//! a set of files as a single `std.FileSet` data item, writing
//! placeholder contents for any that don't already exist under the
//! task's rundir (E2, E4); `std.Counter` persists and reports an
//! incrementing counter, the only built-in whose output actually
//! changes call over call, which is what lets a control-flow node's
//! `state` move. All three are native bodies registered into a
//! [`BodyRegistry`] the same way any other native task would be,
//! dispatched via `Body::Native("std.Message" | "std.FileSet" | "std.Counter")`
//! from [`crate::loader`] when a task's `uses:` target is unresolved
//! locally and prefixed `std.` (see `loader::resolve_task`).

use std::sync::Arc;

use crate::error::FlowError;
use crate::runtime::{BodyOutcome, BodyRegistry, NativeBodyFn, RunContext, TaskInput};
use crate::store::DataItem;
use crate::value::Value;

/// Register every built-in into `registry`. Call once when assembling
/// the [`BodyRegistry`] for a run that may reference `std.*` tasks.
pub fn register(registry: &mut BodyRegistry) {
    registry.register("std.Message", message_body());
    registry.register("std.FileSet", fileset_body());
    registry.register("std.Counter", counter_body());
}

fn message_body() -> NativeBodyFn {
    Arc::new(move |ctx: Arc<RunContext>, input: TaskInput| {
        Box::pin(async move {
            let msg = input
                .params
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            println!("{}: {msg}", ctx.task_name);
            Ok(BodyOutcome {
                exit_code: 0,
                output: vec![DataItem::new("std.Message").with_attr("msg", Value::str(msg))],
                markers: Vec::new(),
            })
        })
    })
}

fn fileset_body() -> NativeBodyFn {
    Arc::new(move |ctx: Arc<RunContext>, input: TaskInput| {
        Box::pin(async move {
            let filetype = input
                .params
                .get("filetype")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let files: Vec<String> = match input.params.get("files") {
                Some(Value::List(items)) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
                _ => Vec::new(),
            };

            tokio::fs::create_dir_all(&ctx.rundir).await.map_err(FlowError::Io)?;

            let mut paths = Vec::new();
            for name in &files {
                let path = ctx.rundir.join(name);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(FlowError::Io)?;
                }
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    tokio::fs::write(&path, format!("// {name}\n")).await.map_err(FlowError::Io)?;
                }
                paths.push(Value::str(path.display().to_string()));
            }

            let item = DataItem::new("std.FileSet")
                .with_attr("filetype", Value::str(filetype))
                .with_attr("paths", Value::List(paths));

            Ok(BodyOutcome {
                exit_code: 0,
                output: vec![item],
                markers: Vec::new(),
            })
        })
    })
}

/// Increments a counter persisted under the task's rundir and reports it
/// as output state, one step per invocation. Used by control-flow bodies
/// (`repeat`/`while`/`do-while`) to prove their loop condition reacts to
/// state the body itself reported, not just the iteration's constant
/// inputs — the same rundir is reused across iterations of one control
/// node, so the file on disk is what survives between calls.
fn counter_body() -> NativeBodyFn {
    Arc::new(move |ctx: Arc<RunContext>, input: TaskInput| {
        Box::pin(async move {
            let step = input.params.get("step").and_then(Value::as_int).unwrap_or(1);
            let break_at = input.params.get("break_at").and_then(Value::as_int);
            let path = ctx.rundir.join("counter.state");

            tokio::fs::create_dir_all(&ctx.rundir).await.map_err(FlowError::Io)?;
            let current = match tokio::fs::read_to_string(&path).await {
                Ok(s) => s.trim().parse::<i64>().unwrap_or(0),
                Err(_) => 0,
            };
            let next = current + step;
            tokio::fs::write(&path, next.to_string()).await.map_err(FlowError::Io)?;

            let mut item = DataItem::new("std.Counter").with_attr("count", Value::Int(next));
            if break_at.is_some_and(|b| next >= b) {
                item = item.with_attr("_break", Value::Bool(true));
            }

            Ok(BodyOutcome {
                exit_code: 0,
                output: vec![item],
                markers: Vec::new(),
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MarkerLog;
    use crate::runtime::DynamicHandle;
    use std::collections::BTreeMap;

    fn sample_input(dir: &std::path::Path, params: BTreeMap<String, Value>) -> TaskInput {
        TaskInput {
            params,
            inputs: Vec::new(),
            memento: None,
            rundir: dir.to_path_buf(),
            srcdir: dir.to_path_buf(),
            env: Default::default(),
        }
    }

    #[tokio::test]
    async fn message_body_echoes_rendered_msg_and_produces_output() {
        let registry = {
            let mut r = BodyRegistry::new();
            register(&mut r);
            r
        };
        let f = registry.get("std.Message").unwrap().clone();

        let dir = tempfile::tempdir().unwrap();
        let mut params = BTreeMap::new();
        params.insert("msg".to_string(), Value::str("hi"));
        let input = sample_input(dir.path(), params);
        let ctx = Arc::new(RunContext::new(
            Arc::from("p.t"),
            input.clone(),
            Arc::new(MarkerLog::new()),
            DynamicHandle::disabled(),
        ));

        let outcome = f(ctx, input).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.output.len(), 1);
        assert_eq!(outcome.output[0].get("msg"), Some(&Value::str("hi")));
    }

    #[tokio::test]
    async fn fileset_body_writes_missing_files_and_emits_single_item() {
        let registry = {
            let mut r = BodyRegistry::new();
            register(&mut r);
            r
        };
        let f = registry.get("std.FileSet").unwrap().clone();

        let dir = tempfile::tempdir().unwrap();
        let mut params = BTreeMap::new();
        params.insert(
            "files".to_string(),
            Value::List(vec![Value::str("a.v"), Value::str("b.v")]),
        );
        params.insert("filetype".to_string(), Value::str("verilog"));
        let input = sample_input(dir.path(), params);
        let ctx = Arc::new(RunContext::new(
            Arc::from("p.build"),
            input.clone(),
            Arc::new(MarkerLog::new()),
            DynamicHandle::disabled(),
        ));

        let outcome = f(ctx, input).await.unwrap();
        assert_eq!(outcome.output.len(), 1);
        let item = &outcome.output[0];
        assert_eq!(item.type_name, "std.FileSet");
        assert_eq!(item.get("filetype"), Some(&Value::str("verilog")));
        let Some(Value::List(paths)) = item.get("paths") else {
            panic!("expected paths list");
        };
        assert_eq!(paths.len(), 2);
        assert!(dir.path().join("a.v").exists());
        assert!(dir.path().join("b.v").exists());
    }
}
