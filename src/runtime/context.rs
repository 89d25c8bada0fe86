//! Task-run context (§6): the API surface a body — native or shell —
//! runs against. A single context struct rather than a dozen threaded
//! parameters, carrying the scheduler hooks a native body needs to
//! emit markers, mint names, and submit dynamic work.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{FlowError, Result};
use crate::event::{Marker, MarkerLog};
use crate::graph::{NodeId, TaskNodeSpec};
use crate::store::DataItem;
use crate::util::constants::EXEC_TIMEOUT;
use crate::value::Value;

use super::data::TaskInput;
use super::dynamic::{DynamicHandle, DynamicNode};

/// One command to run under [`RunContext::exec_parallel`].
pub struct ExecCmd {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub logfile: Option<PathBuf>,
}

/// The result of a single `exec`/`exec_parallel` invocation.
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Passed by reference to every native body invocation (§6). `exec` and
/// `exec_parallel` spawn subprocesses without acquiring a fresh
/// jobserver token — the calling task already holds one for the whole
/// body invocation (resolved Open Question, see DESIGN.md).
pub struct RunContext {
    pub(crate) task_name: Arc<str>,
    pub(crate) rundir: PathBuf,
    pub(crate) srcdir: PathBuf,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) input: TaskInput,
    pub(crate) markers: Arc<MarkerLog>,
    pub(crate) dynamic: DynamicHandle,
    name_counter: std::sync::atomic::AtomicU64,
}

impl RunContext {
    pub(crate) fn new(task_name: Arc<str>, input: TaskInput, markers: Arc<MarkerLog>, dynamic: DynamicHandle) -> Self {
        Self {
            task_name,
            rundir: input.rundir.clone(),
            srcdir: input.srcdir.clone(),
            env: input.env.clone(),
            input,
            markers,
            dynamic,
            name_counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn rundir(&self) -> &std::path::Path {
        &self.rundir
    }

    pub fn srcdir(&self) -> &std::path::Path {
        &self.srcdir
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.input.params
    }

    pub fn inputs(&self) -> &[DataItem] {
        &self.input.inputs
    }

    pub fn memento(&self) -> Option<&str> {
        self.input.memento.as_deref()
    }

    /// Construct a `DataItem` the way the scripting surface's
    /// `mkDataItem(type, **attrs)` builder does.
    pub fn mk_data_item(&self, type_name: impl Into<String>, attrs: BTreeMap<String, Value>) -> DataItem {
        let mut item = DataItem::new(type_name);
        item.attrs = attrs;
        item
    }

    /// A name unique within this task's invocation, for a dynamically
    /// submitted node that doesn't need a caller-chosen name.
    pub fn mk_name(&self, hint: &str) -> String {
        let n = self.name_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("{}.{hint}.{n}", self.task_name)
    }

    /// Build a [`TaskNodeSpec`] for later submission via
    /// [`RunContext::run_subgraph`] — the `mkTaskNode`/`addTask` pair
    /// collapsed into a single builder since Rust has no keyword-arg
    /// splat to mirror `**params`.
    pub fn mk_task_node(&self, task_name: impl Into<String>, name: Option<String>, with: BTreeMap<String, Value>) -> TaskNodeSpec {
        TaskNodeSpec {
            name,
            task_name: task_name.into(),
            with,
        }
    }

    /// Submit a batch of dynamically-constructed nodes and await their
    /// completion (§4.9). Returns the aggregated outputs in submission
    /// order.
    pub async fn run_subgraph(&self, nodes: Vec<DynamicNode>, timeout: Option<Duration>) -> Result<Vec<DataItem>> {
        self.dynamic.run_subgraph(&self.task_name, nodes, timeout).await
    }

    /// Spawn a subprocess and wait for it, writing combined output to
    /// `logfile` if given. Does not acquire a jobserver token.
    pub async fn exec(&self, argv: &[String], cwd: Option<&std::path::Path>, logfile: Option<&std::path::Path>) -> Result<ExecResult> {
        run_one(argv, cwd.unwrap_or(&self.rundir), &self.env, logfile, EXEC_TIMEOUT).await
    }

    /// Run several commands concurrently, collecting each result in
    /// input order.
    pub async fn exec_parallel(&self, cmds: Vec<ExecCmd>) -> Result<Vec<ExecResult>> {
        let futures = cmds.into_iter().map(|cmd| {
            let env = self.env.clone();
            let default_cwd = self.rundir.clone();
            async move {
                let cwd = cmd.cwd.unwrap_or(default_cwd);
                run_one(&cmd.argv, &cwd, &env, cmd.logfile.as_deref(), EXEC_TIMEOUT).await
            }
        });
        futures::future::try_join_all(futures).await
    }

    pub fn info(&self, msg: impl Into<String>) {
        self.markers.push(Marker::info("TaskInfo", msg));
    }

    pub fn warn(&self, msg: impl Into<String>) {
        self.markers.push(Marker::warn("TaskWarn", msg));
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.markers.push(Marker::error("TaskError", msg));
    }
}

async fn run_one(
    argv: &[String],
    cwd: &std::path::Path,
    env: &BTreeMap<String, String>,
    logfile: Option<&std::path::Path>,
    timeout: Duration,
) -> Result<ExecResult> {
    let (program, args) = argv.split_first().ok_or_else(|| FlowError::UncaughtBodyException {
        task: "exec".to_string(),
        reason: "empty argv".to_string(),
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .envs(env)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = cmd.spawn().map_err(FlowError::Io)?;
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

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
                task: program.clone(),
                timeout_secs: timeout.as_secs(),
            })
        }
    };

    if let Some(path) = logfile {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(FlowError::Io)?;
        }
        let mut combined = stdout_bytes.clone();
        combined.extend_from_slice(&stderr_bytes);
        std::fs::write(path, combined).map_err(FlowError::Io)?;
    }

    Ok(ExecResult {
        exit_code: status.code().unwrap_or(-1),
        stdout: stdout_bytes,
        stderr: stderr_bytes,
    })
}
