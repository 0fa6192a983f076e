//! Launching and signalling the external client process
//!
//! The controller's state machine only talks to a [`ProcessDriver`], so tests
//! can substitute a fake and run the lifecycle without real processes.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Signals the controller sends to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// stdout and stderr are appended here; discarded when `None`
    pub log_file: Option<PathBuf>,
}

/// "Wait up to `timeout`, checking every `poll_interval`"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Process operations used by the subprocess controller
pub trait ProcessDriver: Send + Sync {
    /// Launch `spec` as the leader of a new process group, returning its pid
    fn spawn(&self, spec: &LaunchSpec) -> io::Result<u32>;

    /// Probe `pid` with signal 0
    fn is_alive(&self, pid: u32) -> bool;

    /// Signal every process in the group led by `pid`
    fn signal_group(&self, pid: u32, signal: Signal) -> io::Result<()>;

    /// Signal `pid` alone
    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()>;

    /// Locate the program that [`spawn`](Self::spawn) would run
    fn resolve(&self, program: &Path) -> Option<PathBuf> {
        resolve_program(program)
    }
}

/// Poll until `pid` is gone or the policy's deadline passes.
///
/// Returns `true` once the process has exited.
pub async fn wait_for_exit(driver: &dyn ProcessDriver, pid: u32, policy: WaitPolicy) -> bool {
    let deadline = Instant::now() + policy.timeout;
    loop {
        if !driver.is_alive(pid) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(policy.poll_interval.min(deadline - now)).await;
    }
}

/// Find `program` on disk, searching `PATH` for bare names
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Driver backed by real OS processes
#[derive(Debug, Default, Clone)]
pub struct SystemDriver;

impl SystemDriver {
    pub fn new() -> Self {
        Self
    }
}

fn open_log(path: &Path) -> io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

impl ProcessDriver for SystemDriver {
    fn spawn(&self, spec: &LaunchSpec) -> io::Result<u32> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.stdin(Stdio::null());

        match &spec.log_file {
            Some(path) => {
                let log = open_log(path)?;
                cmd.stdout(Stdio::from(log.try_clone()?));
                cmd.stderr(Stdio::from(log));
            }
            None => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child exited before reporting a pid"))?;

        // Reap the child so a dead client never lingers as a zombie that
        // still answers the liveness probe.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(pid, ?status, "Client process exited"),
                Err(e) => warn!(pid, error = %e, "Failed to wait for client process"),
            }
        });

        debug!(pid, program = %spec.program.display(), "Spawned client process");
        Ok(pid)
    }

    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 1 {
            return false;
        }
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    #[cfg(unix)]
    fn signal_group(&self, pid: u32, signal: Signal) -> io::Result<()> {
        let pgid = checked_pid(pid)?;
        let result = unsafe { libc::killpg(pgid, raw_signal(signal)) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _pid: u32, _signal: Signal) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "process groups require unix"))
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        let pid = checked_pid(pid)?;
        let result = unsafe { libc::kill(pid, raw_signal(signal)) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _pid: u32, _signal: Signal) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "signals require unix"))
    }
}

#[cfg(unix)]
fn checked_pid(pid: u32) -> io::Result<i32> {
    // 0 and 1 would address our own group or init
    match i32::try_from(pid) {
        Ok(pid) if pid > 1 => Ok(pid),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {}", pid),
        )),
    }
}

#[cfg(unix)]
fn raw_signal(signal: Signal) -> i32 {
    match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_spec(secs: &str) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("sleep"),
            args: vec![secs.to_string()],
            log_file: None,
        }
    }

    #[test]
    fn test_resolve_program_searches_path() {
        assert!(resolve_program(Path::new("sleep")).is_some());
        assert!(resolve_program(Path::new("definitely-not-a-real-binary-xyz")).is_none());
        assert!(resolve_program(Path::new("/nonexistent/dir/frpc")).is_none());
    }

    #[test]
    fn test_default_wait_policy() {
        let policy = WaitPolicy::default();
        assert_eq!(policy.timeout, Duration::from_secs(5));
        assert_eq!(policy.poll_interval, Duration::from_millis(100));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_signal_and_wait() {
        let driver = SystemDriver::new();
        let pid = driver.spawn(&sleep_spec("60")).unwrap();
        assert!(driver.is_alive(pid));

        driver.signal_group(pid, Signal::Terminate).unwrap();

        let policy = WaitPolicy {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        };
        assert!(wait_for_exit(&driver, pid, policy).await);
        assert!(!driver.is_alive(pid));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_for_exit_times_out() {
        let driver = SystemDriver::new();
        let pid = driver.spawn(&sleep_spec("60")).unwrap();

        let policy = WaitPolicy {
            timeout: Duration::from_millis(150),
            poll_interval: Duration::from_millis(50),
        };
        assert!(!wait_for_exit(&driver, pid, policy).await);

        driver.signal(pid, Signal::Kill).unwrap();
        assert!(wait_for_exit(&driver, pid, WaitPolicy::default()).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_writes_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("frpc.log");
        let driver = SystemDriver::new();

        let spec = LaunchSpec {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), "echo started".to_string()],
            log_file: Some(log.clone()),
        };
        let pid = driver.spawn(&spec).unwrap();
        assert!(wait_for_exit(&driver, pid, WaitPolicy::default()).await);

        assert!(std::fs::read_to_string(&log).unwrap().contains("started"));
    }

    #[test]
    fn test_refuses_reserved_pids() {
        let driver = SystemDriver::new();
        assert!(!driver.is_alive(0));
        assert!(!driver.is_alive(1));
        #[cfg(unix)]
        assert!(driver.signal(0, Signal::Terminate).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let driver = SystemDriver::new();
        let spec = LaunchSpec {
            program: PathBuf::from("/nonexistent/frpc"),
            args: Vec::new(),
            log_file: None,
        };
        let err = driver.spawn(&spec).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
