//! Subprocess lifecycle: spawn into a fresh process group, stop with a
//! SIGTERM grace period, then SIGKILL the whole group.

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::error::ProcessError;

/// Sends the signals used to stop a subprocess tree.
pub trait TreeTerminator: Send + Sync + fmt::Debug {
    /// Ask the group leader to exit.
    fn terminate(&self, pid: Pid) -> nix::Result<()>;

    /// Kill every process in the group.
    fn kill_group(&self, pgid: Pid) -> nix::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SignalTerminator;

impl TreeTerminator for SignalTerminator {
    fn terminate(&self, pid: Pid) -> nix::Result<()> {
        kill(pid, Signal::SIGTERM)
    }

    fn kill_group(&self, pgid: Pid) -> nix::Result<()> {
        killpg(pgid, Signal::SIGKILL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Stopping,
    Terminated,
}

/// How a stopped subprocess ended up.
#[derive(Debug)]
pub enum StopOutcome {
    /// Exited with status 0 after SIGTERM
    Exited,
    /// Already reaped by someone else, e.g. a wrapper script's signal handling
    ReapedElsewhere,
    /// Ignored SIGTERM and had to be killed
    Killed,
    /// Waiting on the process failed
    WaitFailed(io::Error),
    /// Ended in any other way
    Unknown(ExitStatus),
}

impl StopOutcome {
    pub fn classify(waited: io::Result<ExitStatus>) -> Self {
        match waited {
            Ok(status) if status.code() == Some(0) => StopOutcome::Exited,
            Ok(status) if status.signal() == Some(Signal::SIGKILL as i32) => StopOutcome::Killed,
            Ok(status) => StopOutcome::Unknown(status),
            Err(e) if e.raw_os_error() == Some(Errno::ECHILD as i32) => {
                StopOutcome::ReapedElsewhere
            }
            Err(e) => StopOutcome::WaitFailed(e),
        }
    }

    /// Exit code the worker uses if it shuts down because of this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            StopOutcome::Exited | StopOutcome::ReapedElsewhere => 0,
            StopOutcome::Killed | StopOutcome::WaitFailed(_) => 2,
            StopOutcome::Unknown(_) => 3,
        }
    }

    /// Nothing is known about what is left of the process tree.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, StopOutcome::WaitFailed(_))
    }
}

/// What to run for one attempt.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the worker's own environment
    pub env: Vec<(String, String)>,
}

/// A running subprocess that leads its own process group.
#[derive(Debug)]
pub struct Subprocess {
    child: Child,
    pid: Pid,
    pgid: Pid,
    state: ProcessState,
    terminator: Arc<dyn TreeTerminator>,
}

impl Subprocess {
    pub fn spawn(
        spec: &CommandSpec,
        terminator: Arc<dyn TreeTerminator>,
    ) -> Result<Self, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: spec.program.clone(),
            source,
        })?;
        let raw_pid = child
            .id()
            .ok_or_else(|| ProcessError::MissingPid(spec.program.clone()))?;
        let pid = Pid::from_raw(raw_pid as i32);
        let pgid = match getpgid(Some(pid)) {
            Ok(pgid) => pgid,
            Err(e) => {
                tracing::info!(pid = %pid, error = %e, "Unable to get pgid, using pid");
                pid
            }
        };

        tracing::debug!(pid = %pid, pgid = %pgid, program = %spec.program, "Started process");
        Ok(Self {
            child,
            pid,
            pgid,
            state: ProcessState::Running,
            terminator,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await;
        self.set_state(ProcessState::Terminated);
        status
    }

    /// SIGTERM the process, then SIGKILL its whole group if it is still
    /// running after `grace`.
    ///
    /// A leader that has already exited is not signalled again; its status
    /// is classified and only the group sweep remains.
    pub async fn stop(&mut self, grace: Duration) -> Result<StopOutcome, ProcessError> {
        if self.state == ProcessState::Terminated {
            tracing::info!(pid = %self.pid, pgid = %self.pgid, "Process already exited, stopping its group");
            return Ok(StopOutcome::classify(self.child.wait().await));
        }
        tracing::info!(pid = %self.pid, grace_period = ?grace, "Stopping process");
        self.set_state(ProcessState::Stopping);
        self.terminator.terminate(self.pid)?;

        let waited = tokio::select! {
            biased;
            status = self.child.wait() => status,
            _ = tokio::time::sleep(grace) => {
                tracing::info!(pid = %self.pid, pgid = %self.pgid, "Killing process group");
                if let Err(e) = self.terminator.kill_group(self.pgid) {
                    tracing::warn!(pgid = %self.pgid, error = %e, "Failed to kill process group");
                }
                self.child.wait().await
            }
        };
        self.set_state(ProcessState::Terminated);

        let outcome = StopOutcome::classify(waited);
        match &outcome {
            StopOutcome::Exited => tracing::info!(pid = %self.pid, "Process exited"),
            StopOutcome::ReapedElsewhere => {
                tracing::info!(pid = %self.pid, "Process exited outside of worker")
            }
            StopOutcome::Killed => tracing::error!(pid = %self.pid, "Process killed"),
            StopOutcome::WaitFailed(e) => {
                tracing::error!(pid = %self.pid, error = %e, "Unknown wait error")
            }
            StopOutcome::Unknown(status) => {
                tracing::error!(pid = %self.pid, state = %status, "Process in unknown state")
            }
        }
        Ok(outcome)
    }

    /// SIGKILL anything still left in the process group.
    pub fn kill_group(&self) {
        match self.terminator.kill_group(self.pgid) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pgid = %self.pgid, error = %e, "Failed to kill process group"),
        }
    }

    fn set_state(&mut self, state: ProcessState) {
        if self.state != state {
            tracing::debug!(pid = %self.pid, from = ?self.state, to = ?state, "Process state changed");
            self.state = state;
        }
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        if self.state != ProcessState::Terminated {
            self.kill_group();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: Vec::new(),
        }
    }

    #[derive(Debug, Default)]
    struct CountingTerminator {
        terms: AtomicUsize,
        kills: AtomicUsize,
    }

    impl TreeTerminator for CountingTerminator {
        fn terminate(&self, pid: Pid) -> nix::Result<()> {
            self.terms.fetch_add(1, Ordering::SeqCst);
            SignalTerminator.terminate(pid)
        }

        fn kill_group(&self, pgid: Pid) -> nix::Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            SignalTerminator.kill_group(pgid)
        }
    }

    #[test]
    fn classify_exit_states() {
        assert!(matches!(
            StopOutcome::classify(Ok(ExitStatus::from_raw(0))),
            StopOutcome::Exited
        ));
        assert!(matches!(
            StopOutcome::classify(Ok(ExitStatus::from_raw(9))),
            StopOutcome::Killed
        ));
        assert!(matches!(
            StopOutcome::classify(Ok(ExitStatus::from_raw(15))),
            StopOutcome::Unknown(_)
        ));
        assert!(matches!(
            StopOutcome::classify(Err(io::Error::from_raw_os_error(Errno::ECHILD as i32))),
            StopOutcome::ReapedElsewhere
        ));
        assert!(matches!(
            StopOutcome::classify(Err(io::Error::from(io::ErrorKind::Other))),
            StopOutcome::WaitFailed(_)
        ));
    }

    #[test]
    fn exit_codes_per_outcome() {
        assert_eq!(StopOutcome::Exited.exit_code(), 0);
        assert_eq!(StopOutcome::ReapedElsewhere.exit_code(), 0);
        assert_eq!(StopOutcome::Killed.exit_code(), 2);
        assert_eq!(
            StopOutcome::WaitFailed(io::Error::from(io::ErrorKind::Other)).exit_code(),
            2
        );
        assert_eq!(StopOutcome::Unknown(ExitStatus::from_raw(15)).exit_code(), 3);
    }

    #[tokio::test]
    async fn spawned_process_leads_its_own_group() {
        let mut process = Subprocess::spawn(&sh("exit 0"), Arc::new(SignalTerminator)).unwrap();
        assert_eq!(process.pgid, process.pid);
        assert_eq!(process.state(), ProcessState::Running);

        let status = process.wait().await.unwrap();
        assert!(status.success());
        assert_eq!(process.state(), ProcessState::Terminated);
    }

    #[tokio::test]
    async fn spawn_failure_names_the_program() {
        let spec = CommandSpec {
            program: "/nonexistent/command_12345".to_string(),
            args: Vec::new(),
            env: Vec::new(),
        };
        let err = Subprocess::spawn(&spec, Arc::new(SignalTerminator)).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/command_12345"));
    }

    #[tokio::test]
    async fn stop_respecting_sigterm_skips_group_kill() {
        let terminator = Arc::new(CountingTerminator::default());
        let mut process =
            Subprocess::spawn(&sh("trap 'exit 0' TERM; while :; do sleep 0.1; done"), terminator.clone())
                .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = process.stop(Duration::from_secs(5)).await.unwrap();

        assert!(matches!(outcome, StopOutcome::Exited));
        assert_eq!(terminator.terms.load(Ordering::SeqCst), 1);
        assert_eq!(terminator.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_after_leader_exit_does_not_signal_it() {
        let terminator = Arc::new(CountingTerminator::default());
        let mut process = Subprocess::spawn(&sh("exit 0"), terminator.clone()).unwrap();
        process.wait().await.unwrap();

        let outcome = process.stop(Duration::from_secs(5)).await.unwrap();

        assert!(matches!(outcome, StopOutcome::Exited));
        assert_eq!(terminator.terms.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropping_a_running_process_kills_its_group() {
        let terminator = Arc::new(CountingTerminator::default());
        let process = Subprocess::spawn(&sh("sleep 30 & wait"), terminator.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        drop(process);

        assert_eq!(terminator.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_a_reaped_process_sends_nothing() {
        let terminator = Arc::new(CountingTerminator::default());
        let mut process = Subprocess::spawn(&sh("exit 0"), terminator.clone()).unwrap();
        process.wait().await.unwrap();

        drop(process);

        assert_eq!(terminator.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_kills_group_that_ignores_sigterm() {
        let terminator = Arc::new(CountingTerminator::default());
        let mut process =
            Subprocess::spawn(&sh("trap '' TERM; sleep 30"), terminator.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = process.stop(Duration::from_millis(200)).await.unwrap();

        assert!(matches!(outcome, StopOutcome::Killed));
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(terminator.kills.load(Ordering::SeqCst), 1);
        assert_eq!(process.state(), ProcessState::Terminated);
    }
}
