//! Startup sequencing and the single-instance PID lock.
//!
//! Every other broker error (spawn, delivery, relay) is reported on the
//! event bus and to the caller that triggered it; the broker keeps running.
//! Only the handful of errors that happen before the event bus exists —
//! lock contention, an unreadable runtime directory — are allowed to exit
//! the process, and they always carry a classified code and a one-line
//! remediation rather than a bare `anyhow` message.

use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupErrorCode {
    LockHeld,
    StalePid,
    PermissionDenied,
    BadCwd,
}

impl StartupErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StartupErrorCode::LockHeld => "lock_held",
            StartupErrorCode::StalePid => "stale_pid",
            StartupErrorCode::PermissionDenied => "permission_denied",
            StartupErrorCode::BadCwd => "bad_cwd",
        }
    }
}

/// A classified, user-facing startup failure.
///
/// Unlike worker- or relay-scoped errors, a `StartupError` is fatal: it is
/// only ever raised before the broker has a worker registry or an event bus
/// to report into, so the only audience is the process's own exit path.
#[derive(Debug)]
pub struct StartupError {
    pub code: StartupErrorCode,
    pub message: String,
    pub remediation: String,
}

impl StartupError {
    pub fn lock_held(root: &Path, holder_pid: Option<u32>) -> Self {
        let message = match holder_pid {
            Some(pid) => format!(
                "another broker instance (pid {pid}) holds the lock in {}",
                root.display()
            ),
            None => format!("another broker instance holds the lock in {}", root.display()),
        };
        Self {
            code: StartupErrorCode::LockHeld,
            message,
            remediation: "run `get_status` against the running instance, or shut it down before starting a new one (status, down, force)".to_string(),
        }
    }

    pub fn stale_pid_recovery_failed(root: &Path) -> Self {
        Self {
            code: StartupErrorCode::StalePid,
            message: format!(
                "detected a stale lock in {} but failed to reclaim it",
                root.display()
            ),
            remediation: "remove the lock file manually (force) and retry".to_string(),
        }
    }

    pub fn permission_denied(path: &Path, source: &std::io::Error) -> Self {
        Self {
            code: StartupErrorCode::PermissionDenied,
            message: format!("cannot access runtime directory {}: {source}", path.display()),
            remediation: "check directory permissions for the runtime path and re-run with sufficient privileges".to_string(),
        }
    }

    pub fn bad_cwd(path: &Path) -> Self {
        Self {
            code: StartupErrorCode::BadCwd,
            message: format!("working directory {} is not usable", path.display()),
            remediation: "pass an existing, writable directory and retry".to_string(),
        }
    }
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} — {}",
            self.code.as_str(),
            self.message,
            self.remediation
        )
    }
}

impl std::error::Error for StartupError {}

/// Paths under the project's `.agent-relay` runtime directory.
#[derive(Debug, Clone)]
pub struct RuntimeLayout {
    pub root: PathBuf,
    pub lock: PathBuf,
    pub pid: PathBuf,
    pub creds: PathBuf,
    pub state: PathBuf,
    pub pending: PathBuf,
}

impl RuntimeLayout {
    pub fn new(project_dir: &Path) -> Self {
        let root = project_dir.join(".agent-relay");
        Self {
            lock: root.join("broker.lock"),
            pid: root.join("broker.pid"),
            creds: root.join("relaycast.json"),
            state: root.join("state.json"),
            pending: root.join("pending.json"),
            root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_layout_nests_under_project_dir() {
        let layout = RuntimeLayout::new(Path::new("/tmp/proj"));
        assert_eq!(layout.root, Path::new("/tmp/proj/.agent-relay"));
        assert_eq!(layout.lock, Path::new("/tmp/proj/.agent-relay/broker.lock"));
        assert_eq!(layout.pid, Path::new("/tmp/proj/.agent-relay/broker.pid"));
    }

    #[test]
    fn startup_error_display_includes_code_and_remediation() {
        let error = StartupError::lock_held(Path::new("/tmp/proj/.agent-relay"), Some(123));
        let rendered = error.to_string();
        assert!(rendered.starts_with("[lock_held]"));
        assert!(rendered.contains("pid 123"));
        assert!(rendered.contains("status, down, force"));
    }

    #[test]
    fn permission_denied_carries_source_context() {
        let source = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = StartupError::permission_denied(Path::new("/tmp/proj/.agent-relay"), &source);
        assert_eq!(error.code.as_str(), "permission_denied");
        assert!(error.message.contains("denied"));
    }
}
