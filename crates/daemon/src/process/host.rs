// Host process-management facility: spawn, signal, wait, liveness.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::process::ProcessKey;

/// Fully resolved command line for one runtime process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
}

impl LaunchSpec {
    /// Substitute `{port}`, `{workspace}` and `{session_id}` in the configured
    /// arguments and environment values.
    pub fn for_key(config: &RuntimeConfig, key: &ProcessKey, port: u16) -> Self {
        let port = port.to_string();
        let workspace = key.workspace().display().to_string();
        let session = key.session_id().map(|id| id.to_string()).unwrap_or_default();
        let expand = |raw: &str| {
            raw.replace("{port}", &port)
                .replace("{workspace}", &workspace)
                .replace("{session_id}", &session)
        };

        Self {
            command: config.command.clone(),
            args: config.args.iter().map(|arg| expand(arg)).collect(),
            env: config.env.iter().map(|(k, v)| (k.clone(), expand(v))).collect(),
            working_dir: key.workspace_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful shutdown request.
    Term,
    /// Forced kill.
    Kill,
}

impl Signal {
    fn flag(self) -> &'static str {
        match self {
            Self::Term => "-TERM",
            Self::Kill => "-KILL",
        }
    }
}

/// Process-management primitives the registry is built on.
pub trait ProcessHost: Send + Sync + 'static {
    /// Launch a process and return its pid.
    fn spawn_process(&self, spec: &LaunchSpec) -> Result<u32>;

    fn send_signal(&self, pid: u32, signal: Signal) -> Result<()>;

    /// Resolves once the process has exited, with its exit code when it
    /// exited normally.
    fn wait_exit(&self, pid: u32) -> BoxFuture<'static, Option<i32>>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Exit state published by the reaper task: `None` while running,
/// `Some(code)` once exited.
type ExitState = Option<Option<i32>>;

/// Production host backed by `tokio::process`.
///
/// Each child gets a reaper task that owns the `Child` and publishes its exit
/// on a watch channel, so any number of callers can wait on or poll it.
#[derive(Default)]
pub struct TokioProcessHost {
    exits: Arc<Mutex<HashMap<u32, watch::Receiver<ExitState>>>>,
}

impl TokioProcessHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn exit_watch(&self, pid: u32) -> Option<watch::Receiver<ExitState>> {
        self.exits.lock().unwrap_or_else(PoisonError::into_inner).get(&pid).cloned()
    }
}

impl ProcessHost for TokioProcessHost {
    fn spawn_process(&self, spec: &LaunchSpec) -> Result<u32> {
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", spec.command))?;

        let Some(pid) = child.id() else {
            bail!("`{}` exited before reporting a pid", spec.command);
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(pid, line = %line, "agent runtime stderr");
                }
            });
        }

        let (tx, rx) = watch::channel(None);
        {
            let mut exits = self.exits.lock().unwrap_or_else(PoisonError::into_inner);
            exits.retain(|_, state| state.borrow().is_none());
            exits.insert(pid, rx);
        }

        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(error) => {
                    warn!(pid, error = %error, "failed to reap agent runtime");
                    None
                }
            };
            info!(pid, ?code, "agent runtime exited");
            tx.send_replace(Some(code));
        });

        Ok(pid)
    }

    fn send_signal(&self, pid: u32, signal: Signal) -> Result<()> {
        let status = std::process::Command::new("kill")
            .arg(signal.flag())
            .arg(pid.to_string())
            .status()
            .with_context(|| format!("failed to run kill {} {pid}", signal.flag()))?;
        if !status.success() && self.is_alive(pid) {
            bail!("kill {} {pid} exited with {status}", signal.flag());
        }
        Ok(())
    }

    fn wait_exit(&self, pid: u32) -> BoxFuture<'static, Option<i32>> {
        let watch = self.exit_watch(pid);
        async move {
            let mut rx = watch?;
            let state = rx.wait_for(Option::is_some).await.ok()?;
            (*state).flatten()
        }
        .boxed()
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.exit_watch(pid).is_some_and(|rx| rx.borrow().is_none())
    }
}
