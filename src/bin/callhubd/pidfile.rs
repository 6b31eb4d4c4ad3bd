//! PID file bookkeeping and backgrounding for `callhubd`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};

/// Location of the relay's PID file.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the recorded PID if that process is still alive.
    ///
    /// A file left behind by a dead process is removed.
    pub fn running(&self) -> Option<u32> {
        let pid = fs::read_to_string(&self.path).ok()?.trim().parse().ok()?;
        if process_alive(pid) {
            Some(pid)
        } else {
            let _ = fs::remove_file(&self.path);
            None
        }
    }

    /// Records the current process; the file is removed when the guard drops.
    pub fn claim(&self) -> Result<PidGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, process::id().to_string())
            .with_context(|| format!("Failed to write PID file {}", self.path.display()))?;
        Ok(PidGuard {
            path: self.path.clone(),
        })
    }
}

/// Removes the PID file on drop.
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Probes `pid` with signal 0.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs permission and existence checks only
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Asks `pid` to shut down gracefully.
pub fn send_terminate(pid: u32) -> Result<()> {
    let target = libc::pid_t::try_from(pid).context("PID out of range")?;
    // SAFETY: plain kill(2) with a valid signal number
    if unsafe { libc::kill(target, libc::SIGTERM) } != 0 {
        bail!(
            "Failed to send SIGTERM to process {pid}: {}",
            io::Error::last_os_error()
        );
    }
    Ok(())
}

/// Forks into the background with stdout and stderr appended to `log_path`.
pub fn detach(log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
    let log_err = log.try_clone().context("Failed to duplicate log handle")?;

    daemonize::Daemonize::new()
        .working_directory("/")
        .stdout(log)
        .stderr(log_err)
        .start()
        .context("Failed to daemonize")?;
    Ok(())
}
