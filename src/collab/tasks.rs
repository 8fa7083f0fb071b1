//! Task-graph collaborator.
//!
//! The hub never owns the task graph; it asks an external tool which tasks
//! are ready and asks it to mark one as claimed. [`CommandTaskGraph`] drives
//! a CLI that prints JSON on stdout.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::constants::DEFAULT_TASK_TOOL;

/// Task-graph failures.
#[derive(Debug, thiserror::Error)]
pub enum TaskGraphError {
    /// The tool could not be started at all.
    #[error("task tool `{tool}` unavailable: {source}")]
    Spawn {
        /// Program that failed to start.
        tool: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },
    /// The tool ran and exited non-zero.
    #[error("task tool exited with {status}: {stderr}")]
    Failed {
        /// Exit status description.
        status: String,
        /// Trimmed stderr.
        stderr: String,
    },
    /// The tool printed something that is not JSON.
    #[error("task tool returned invalid JSON: {0}")]
    InvalidOutput(#[from] serde_json::Error),
    /// Task ids are passed as argv; refuse anything that looks like a flag.
    #[error("invalid task id: {0:?}")]
    InvalidTaskId(String),
}

impl TaskGraphError {
    /// True when the tool is missing rather than failing.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Spawn { .. })
    }
}

/// External task graph.
#[async_trait]
pub trait TaskGraph: Send + Sync {
    /// Tasks whose dependencies are satisfied.
    async fn ready_tasks(&self) -> Result<Vec<Value>, TaskGraphError>;

    /// Mark `task_id` in progress for `session_id`. Returns the tool's view
    /// of the task.
    async fn claim(&self, task_id: &str, session_id: &str) -> Result<Value, TaskGraphError>;
}

/// Task graph backed by a CLI tool (`bd` by default).
#[derive(Debug, Clone)]
pub struct CommandTaskGraph {
    program: String,
    base_args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl Default for CommandTaskGraph {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_TOOL)
    }
}

impl CommandTaskGraph {
    /// Drive `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            cwd: None,
        }
    }

    /// Arguments placed before every subcommand.
    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Run the tool from `dir`.
    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    async fn run(&self, args: &[&str]) -> Result<Value, TaskGraphError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args).args(args).kill_on_drop(true);
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|source| TaskGraphError::Spawn {
            tool: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(TaskGraphError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(trimmed)?)
    }
}

#[async_trait]
impl TaskGraph for CommandTaskGraph {
    async fn ready_tasks(&self) -> Result<Vec<Value>, TaskGraphError> {
        match self.run(&["ready", "--json"]).await? {
            Value::Array(tasks) => Ok(tasks),
            Value::Null => Ok(Vec::new()),
            other => Ok(vec![other]),
        }
    }

    async fn claim(&self, task_id: &str, session_id: &str) -> Result<Value, TaskGraphError> {
        if task_id.is_empty() || task_id.starts_with('-') {
            return Err(TaskGraphError::InvalidTaskId(task_id.to_string()));
        }
        let mut args = vec!["update", task_id, "--status", "in_progress"];
        if !session_id.is_empty() && !session_id.starts_with('-') {
            args.extend(["--assignee", session_id]);
        }
        args.push("--json");
        self.run(&args).await
    }
}
