//! Task bodies (§3, §4.8 step 5): a leaf task invokes either a shell
//! command or a native routine registered by name. Shell stdout/stderr
//! is tee'd to `<rundir>/<task>.log`; a small regex scanner lifts
//! `error:`/`warning:` prefixed lines into markers with a source
//! location, the way a compiler wrapper script typically reports them.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{FlowError, Result};
use crate::event::{Location, Marker};
use crate::store::DataItem;
use crate::util::constants::EXEC_TIMEOUT;

use super::data::TaskInput;
use super::context::RunContext;

/// Output of running a task body: the produced records plus any
/// diagnostic markers picked up along the way.
pub struct BodyOutcome {
    pub exit_code: i32,
    pub output: Vec<DataItem>,
    pub markers: Vec<Marker>,
}

pub type NativeBodyFuture = Pin<Box<dyn Future<Output = Result<BodyOutcome>> + Send>>;
pub type NativeBodyFn = Arc<dyn Fn(Arc<RunContext>, TaskInput) -> NativeBodyFuture + Send + Sync>;

/// Maps a `Body::Native(name)` to the Rust closure it invokes. Threaded
/// explicitly by the caller that constructs the [`super::Scheduler`],
/// mirroring [`crate::graph::Registry`]'s non-global design.
#[derive(Default, Clone)]
pub struct BodyRegistry {
    natives: BTreeMap<String, NativeBodyFn>,
}

impl BodyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, f: NativeBodyFn) {
        self.natives.insert(name.into(), f);
    }

    pub fn get(&self, name: &str) -> Option<&NativeBodyFn> {
        self.natives.get(name)
    }
}

static MARKER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(error|warning)\s*:\s*(.*)$").expect("static regex is valid"));

/// Run a shell command, writing combined stdout/stderr to
/// `<rundir>/<task>.log` and scanning it for `error:`/`warning:` lines.
pub async fn run_shell(task_name: &str, command: &str, input: &TaskInput, timeout: Option<Duration>) -> Result<BodyOutcome> {
    std::fs::create_dir_all(&input.rundir).map_err(FlowError::Io)?;
    let log_path = input.rundir.join(format!("{task_name}.log"));

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(&input.rundir)
        .envs(&input.env)
        .env("SRCDIR", &input.srcdir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = cmd.spawn().map_err(FlowError::Io)?;
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let timeout = timeout.unwrap_or(EXEC_TIMEOUT);
    let wait = async {
        use tokio::io::AsyncReadExt;
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let mut stdout = stdout;
        let mut stderr = stderr;
        let (out_res, err_res, status) = tokio::join!(
            stdout.read_to_end(&mut out_buf),
            stderr.read_to_end(&mut err_buf),
            child.wait(),
        );
        out_res.map_err(FlowError::Io)?;
        err_res.map_err(FlowError::Io)?;
        let status = status.map_err(FlowError::Io)?;
        Ok::<_, FlowError>((out_buf, err_buf, status))
    };

    let (stdout_bytes, stderr_bytes, status) = match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(FlowError::TaskTimeout {
                task: task_name.to_string(),
                timeout_secs: timeout.as_secs(),
            })
        }
    };

    let mut log_file = tokio::fs::File::create(&log_path).await.map_err(FlowError::Io)?;
    log_file.write_all(&stdout_bytes).await.map_err(FlowError::Io)?;
    log_file.write_all(&stderr_bytes).await.map_err(FlowError::Io)?;

    let combined = String::from_utf8_lossy(&stdout_bytes).into_owned() + &String::from_utf8_lossy(&stderr_bytes);
    let markers = scan_markers(&combined, &log_path.display().to_string());

    Ok(BodyOutcome {
        exit_code: status.code().unwrap_or(-1),
        output: Vec::new(),
        markers,
    })
}

fn scan_markers(text: &str, file: &str) -> Vec<Marker> {
    text.lines()
        .enumerate()
        .filter_map(|(i, line)| {
            let caps = MARKER_LINE.captures(line)?;
            let loc = Location {
                file: file.to_string(),
                line: i + 1,
                column: 1,
            };
            let msg = caps[2].to_string();
            Some(if caps[1].eq_ignore_ascii_case("error") {
                Marker::error("ShellDiagnostic", msg).with_loc(loc)
            } else {
                Marker::warn("ShellDiagnostic", msg).with_loc(loc)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_error_and_warning_prefixed_lines() {
        let text = "compiling...\nerror: undefined reference\nwarning: unused variable\nok";
        let markers = scan_markers(text, "build.log");
        assert_eq!(markers.len(), 2);
        assert!(markers[0].is_error());
        assert!(!markers[1].is_error());
    }

    #[tokio::test]
    async fn shell_body_writes_log_and_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let input = TaskInput {
            params: Default::default(),
            inputs: Vec::new(),
            memento: None,
            rundir: dir.path().to_path_buf(),
            srcdir: dir.path().to_path_buf(),
            env: Default::default(),
        };
        let outcome = run_shell("pkg.t", "echo hello", &input, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(dir.path().join("pkg.t.log").exists());
    }

    #[tokio::test]
    async fn shell_body_surfaces_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let input = TaskInput {
            params: Default::default(),
            inputs: Vec::new(),
            memento: None,
            rundir: dir.path().to_path_buf(),
            srcdir: dir.path().to_path_buf(),
            env: Default::default(),
        };
        let outcome = run_shell("pkg.t", "exit 3", &input, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
    }
}
