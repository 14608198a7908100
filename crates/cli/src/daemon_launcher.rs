// Auto-start of `berthd` for commands that need a live daemon.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::UnixStream;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::client::default_socket_path;

const STARTUP_DEADLINE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Start `berthd` in the background unless its socket already accepts.
pub async fn ensure_daemon_running() -> Result<()> {
    DaemonLauncher::from_env().ensure_running().await
}

#[derive(Debug, Clone)]
struct DaemonLauncher {
    socket_path: PathBuf,
    binary: OsString,
    /// Daemon stderr goes here so a failed start can be diagnosed.
    log_path: Option<PathBuf>,
    deadline: Duration,
}

impl DaemonLauncher {
    fn from_env() -> Self {
        let socket_path = default_socket_path();
        let log_path = socket_path.parent().map(|dir| dir.join("berthd.log"));
        Self {
            socket_path,
            binary: std::env::var_os("BERTH_DAEMON_BIN").unwrap_or_else(|| OsString::from("berthd")),
            log_path,
            deadline: STARTUP_DEADLINE,
        }
    }

    async fn ensure_running(&self) -> Result<()> {
        match UnixStream::connect(&self.socket_path).await {
            Ok(_) => Ok(()),
            Err(err) if should_attempt_launch(err.kind()) => {
                info!(binary = ?self.binary, socket = %self.socket_path.display(), "starting daemon");
                self.spawn()?;
                self.wait_for_socket().await
            }
            Err(err) => Err(err).with_context(|| {
                format!("failed to connect to daemon socket at `{}`", self.socket_path.display())
            }),
        }
    }

    fn spawn(&self) -> Result<()> {
        let stderr = match &self.log_path {
            Some(path) => log_file(path).map(Stdio::from).unwrap_or_else(|err| {
                debug!(path = %path.display(), error = %err, "daemon log unavailable");
                Stdio::null()
            }),
            None => Stdio::null(),
        };

        Command::new(&self.binary)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .spawn()
            .map(|_child| ())
            .map_err(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    anyhow!(
                        "unable to find daemon binary `{}`; install berthd or set BERTH_DAEMON_BIN",
                        self.binary.to_string_lossy()
                    )
                } else {
                    anyhow!(err).context(format!(
                        "failed to spawn daemon process `{}`",
                        self.binary.to_string_lossy()
                    ))
                }
            })
    }

    async fn wait_for_socket(&self) -> Result<()> {
        let started = Instant::now();
        loop {
            let err = match UnixStream::connect(&self.socket_path).await {
                Ok(_) => return Ok(()),
                Err(err) if should_attempt_launch(err.kind()) => err,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!(
                            "daemon started but its socket at `{}` refused us",
                            self.socket_path.display()
                        )
                    });
                }
            };
            if started.elapsed() >= self.deadline {
                let hint = self
                    .log_path
                    .as_deref()
                    .map(|path| format!("; see {}", path.display()))
                    .unwrap_or_default();
                return Err(anyhow!(
                    "daemon socket did not come up at `{}` within {:?} (last error: {err}){hint}",
                    self.socket_path.display(),
                    self.deadline
                ));
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

fn should_attempt_launch(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound)
}

fn log_file(path: &Path) -> io::Result<std::fs::File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
