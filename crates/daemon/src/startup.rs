// Daemon runtime files: PID file, Unix socket, liveness check.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tracing::info;

/// Socket path: ~/.berth/daemon.sock
const SOCKET_NAME: &str = "daemon.sock";
/// PID file: ~/.berth/daemon.pid (diagnostics only)
const PID_FILE_NAME: &str = "daemon.pid";
/// Scheduled task store: ~/.berth/meta.db
const META_DB_NAME: &str = "meta.db";

/// Resolved paths for daemon runtime files.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub base_dir: PathBuf,
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub meta_db_path: PathBuf,
    pub config_path: PathBuf,
}

impl DaemonPaths {
    /// Resolve paths under `~/.berth/`, creating the directory.
    pub fn resolve() -> Result<Self> {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .context("could not determine home directory")?;
        Self::under(home.join(".berth"))
    }

    /// Lay out runtime files under an explicit base directory.
    pub fn under(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to create `{}`", base_dir.display()))?;
        restrict_permissions(&base_dir, 0o700)
            .with_context(|| format!("failed to restrict `{}`", base_dir.display()))?;
        Ok(Self {
            socket_path: base_dir.join(SOCKET_NAME),
            pid_path: base_dir.join(PID_FILE_NAME),
            meta_db_path: base_dir.join(META_DB_NAME),
            config_path: base_dir.join("config.toml"),
            base_dir,
        })
    }
}

/// Set `mode` on `path` if it exists and differs. No-op off unix.
pub fn restrict_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if !path.exists() {
            return Ok(());
        }
        let current = fs::metadata(path)?.permissions().mode() & 0o777;
        if current != mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }

    Ok(())
}

/// Write the current process PID to the PID file.
pub fn write_pid_file(path: &Path) -> Result<()> {
    let pid = std::process::id();
    let mut file = fs::File::create(path).context("failed to create PID file")?;
    write!(file, "{pid}").context("failed to write PID")?;
    restrict_permissions(path, 0o600).context("failed to restrict PID file")?;
    info!(pid, path = %path.display(), "wrote PID file");
    Ok(())
}

/// Remove a runtime file on shutdown, ignoring absence.
pub fn remove_runtime_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(error = %e, path = %path.display(), "failed to remove runtime file");
        }
    }
}

/// Remove stale socket file and bind a new Unix listener.
/// The daemon signals readiness by accepting connections on this socket.
pub async fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        fs::remove_file(path).context("failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(path).context("failed to bind Unix socket")?;
    restrict_permissions(path, 0o600).context("failed to restrict socket")?;
    info!(path = %path.display(), "daemon socket ready");
    Ok(listener)
}

/// Check if a daemon is already running by connecting to the socket.
pub async fn is_daemon_running(socket_path: &Path) -> bool {
    tokio::net::UnixStream::connect(socket_path).await.is_ok()
}
