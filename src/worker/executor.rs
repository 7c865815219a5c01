use std::any::Any;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::heartbeat::Heartbeat;
use super::output::{capture_warnings, stream_stdout, WarningRing};
use super::process::{CommandSpec, SignalTerminator, Subprocess, TreeTerminator};
use crate::args::parse_args;
use crate::broker::Job;
use crate::config::ExecutionConfig;
use crate::error::AttemptError;

/// One try at running a job, with its own work directory.
///
/// The directory is removed when the attempt is dropped, whatever the
/// outcome.
#[derive(Debug)]
pub struct Attempt {
    pub index: u32,
    pub job_id: String,
    work_dir: TempDir,
}

impl Attempt {
    /// Create `<function>-<job_id>-<index>-XXXXXX` under the sandbox root.
    pub fn create(config: &ExecutionConfig, job_id: &str, index: u32) -> io::Result<Self> {
        let prefix = format!("{}-{}-{}-", config.function_name, job_id, index);
        let work_dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(config.sandbox_dir())?;
        Ok(Self {
            index,
            job_id: job_id.to_string(),
            work_dir,
        })
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    /// Variables added to the subprocess environment.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            ("JOB_ID".to_string(), self.job_id.clone()),
            (
                "WORK_DIR".to_string(),
                self.work_dir.path().to_string_lossy().into_owned(),
            ),
        ]
    }
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Halt,
    Timeout(Duration),
}

/// Runs single attempts of a job as a subprocess.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    config: Arc<ExecutionConfig>,
    halt: CancellationToken,
    terminator: Arc<dyn TreeTerminator>,
}

impl JobExecutor {
    pub fn new(config: Arc<ExecutionConfig>, halt: CancellationToken) -> Self {
        Self {
            config,
            halt,
            terminator: Arc::new(SignalTerminator),
        }
    }

    pub fn with_terminator(mut self, terminator: Arc<dyn TreeTerminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Run one attempt of `job` to completion.
    ///
    /// Output is streamed to the job while the subprocess runs and the tail
    /// of stderr is sent as a single warning once it has finished. A panic
    /// anywhere in the attempt is reported to the job as a warning and
    /// returned as [`AttemptError::Panicked`].
    pub async fn execute(&self, job: Arc<dyn Job>, attempt: &Attempt) -> Result<(), AttemptError> {
        let executor = self.clone();
        let task_job = job.clone();
        let job_id = attempt.job_id.clone();
        let env = attempt.env();
        let index = attempt.index;

        let handle = tokio::spawn(async move {
            executor
                .run_attempt(task_job, &job_id, index, env)
                .await
        });

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                let message = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    e.to_string()
                };
                tracing::error!(job_id = %attempt.job_id, try_number = index, error = %message, "Attempt panicked");
                job.send_warning(message.as_bytes());
                Err(AttemptError::Panicked(message))
            }
        }
    }

    async fn run_attempt(
        &self,
        job: Arc<dyn Job>,
        job_id: &str,
        index: u32,
        env: Vec<(String, String)>,
    ) -> Result<(), AttemptError> {
        let stop_heartbeat = CancellationToken::new();
        // cancels the heartbeat even if the attempt unwinds
        let guard = stop_heartbeat.clone().drop_guard();
        let heartbeat = {
            let job = job.clone();
            let job_id = job_id.to_string();
            let stop = stop_heartbeat.clone();
            let interval = self.config.heartbeat_interval;
            tokio::spawn(async move {
                Heartbeat::new(interval)
                    .run(job.as_ref(), &job_id, index, stop)
                    .await
            })
        };

        let result = self.run_command(&job, env).await;

        drop(guard);
        if let Err(e) = heartbeat.await {
            tracing::warn!(job_id, error = %e, "Heartbeat task failed");
        }
        result
    }

    async fn run_command(
        &self,
        job: &Arc<dyn Job>,
        env: Vec<(String, String)>,
    ) -> Result<(), AttemptError> {
        let args = self.build_args(job.data())?;
        let spec = CommandSpec {
            program: self.config.command.clone(),
            args,
            env,
        };
        let mut process =
            Subprocess::spawn(&spec, self.terminator.clone()).map_err(AttemptError::Spawn)?;

        let stdout = process.take_stdout();
        let mut pump: JoinHandle<io::Result<()>> = {
            let job = job.clone();
            tokio::spawn(async move {
                match stdout {
                    Some(stdout) => stream_stdout(stdout, job.as_ref()).await,
                    None => Ok(()),
                }
            })
        };
        let stderr = process.take_stderr();
        let capacity = self.config.warning_lines;
        let mut capture: JoinHandle<WarningRing> = tokio::spawn(async move {
            match stderr {
                Some(stderr) => capture_warnings(stderr, capacity).await,
                None => WarningRing::new(capacity),
            }
        });

        let timeout = self.config.cmd_timeout;
        let deadline = async move {
            if timeout.is_zero() {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(timeout).await
            }
        };

        // finished only once the leader has exited and both pipes are closed,
        // so descendants holding stdout or stderr stay subject to halt and timeout
        let mut pumped = None;
        let mut ring = None;
        let finished = tokio::select! {
            biased;
            _ = self.halt.cancelled() => Err(Interrupt::Halt),
            _ = deadline => Err(Interrupt::Timeout(timeout)),
            status = async {
                let status = process.wait().await;
                pumped = Some(join_output(&mut pump).await);
                ring = Some(join_capture(&mut capture, capacity).await);
                status
            } => Ok(status),
        };

        let (result, exit_code) = match finished {
            Ok(status) => {
                let pumped = match pumped.take() {
                    Some(pumped) => pumped,
                    None => join_output(&mut pump).await,
                };
                let result = match status {
                    Err(e) => Err(AttemptError::Wait(e)),
                    Ok(status) if !status.success() => Err(AttemptError::Exit(status)),
                    Ok(_) => pumped.map_err(AttemptError::Output),
                };
                (result, None)
            }
            Err(interrupt) => {
                let stopped = self.interrupt(&mut process, interrupt).await;
                process.kill_group();
                if pumped.is_none() {
                    if let Err(e) = join_output(&mut pump).await {
                        tracing::debug!(error = %e, "Stdout stream ended with error after stop");
                    }
                }
                stopped
            }
        };

        if self.config.has_timeout() {
            let timed_out = matches!(result, Err(AttemptError::TimedOut(_)));
            tracing::info!(
                function = %self.config.function_name,
                timeout = ?timeout,
                value = u8::from(timed_out),
                "Worker timed out counter"
            );
        }

        let ring = match ring {
            Some(ring) => ring,
            None => join_capture(&mut capture, capacity).await,
        };
        if !ring.is_empty() {
            job.send_warning(&ring.report());
        }

        if let Some(code) = exit_code {
            tracing::error!(code, "Exiting worker after stopping job process");
            std::process::exit(code);
        }
        result
    }

    fn build_args(&self, payload: &[u8]) -> Result<Vec<String>, AttemptError> {
        let payload = String::from_utf8_lossy(payload);
        if self.config.parse_args {
            Ok(parse_args(&payload)?)
        } else {
            Ok(vec![payload.into_owned()])
        }
    }

    /// Stop the subprocess because of `interrupt`.
    ///
    /// Halts get the SIGTERM grace period, timeouts are killed immediately.
    /// Returns the attempt's error and, when the worker itself should exit,
    /// the exit code to use.
    async fn interrupt(
        &self,
        process: &mut Subprocess,
        interrupt: Interrupt,
    ) -> (Result<(), AttemptError>, Option<i32>) {
        let grace = match interrupt {
            Interrupt::Halt => self.config.sigterm_grace_period,
            Interrupt::Timeout(_) => Duration::ZERO,
        };
        let outcome = match process.stop(grace).await {
            Ok(outcome) => outcome,
            Err(e) => return (Err(AttemptError::Stop(e)), None),
        };

        let (error, escalate) = match interrupt {
            Interrupt::Halt => (AttemptError::Halted, true),
            Interrupt::Timeout(timeout) => {
                (AttemptError::TimedOut(timeout), outcome.is_indeterminate())
            }
        };
        let exit_code = (escalate && self.config.exit_on_stop).then(|| outcome.exit_code());
        (Err(error), exit_code)
    }
}

async fn join_output(pump: &mut JoinHandle<io::Result<()>>) -> io::Result<()> {
    match pump.await {
        Ok(result) => result,
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
    }
}

async fn join_capture(capture: &mut JoinHandle<WarningRing>, capacity: usize) -> WarningRing {
    match capture.await {
        Ok(ring) => ring,
        Err(e) => {
            tracing::warn!(error = %e, "Stderr capture task failed");
            WarningRing::new(capacity)
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
