use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::backoff::{BackoffState, MAX_ERROR_BACKOFF};
use super::executor::{Attempt, JobExecutor};
use super::process::TreeTerminator;
use crate::broker::{job_id, Job, JobHandler};
use crate::config::ExecutionConfig;
use crate::error::AttemptError;

/// Runs jobs with retries and pauses between jobs under sustained failure.
///
/// One runner is shared by every job the worker handles; the backoff window
/// is the only state carried from one job to the next.
pub struct JobRunner {
    config: Arc<ExecutionConfig>,
    executor: JobExecutor,
    halt: CancellationToken,
    backoff: Arc<Mutex<BackoffState>>,
}

impl JobRunner {
    pub fn new(config: Arc<ExecutionConfig>, halt: CancellationToken) -> Self {
        let backoff = BackoffState::new(config.error_backoff_count, config.error_backoff_rate);
        Self {
            executor: JobExecutor::new(config.clone(), halt.clone()),
            config,
            halt,
            backoff: Arc::new(Mutex::new(backoff)),
        }
    }

    pub fn with_terminator(mut self, terminator: Arc<dyn TreeTerminator>) -> Self {
        self.executor = self.executor.with_terminator(terminator);
        self
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Pause applied after the most recent job.
    pub async fn current_backoff(&self) -> Duration {
        self.backoff.lock().await.current()
    }

    /// Run `job` until an attempt succeeds or the retries run out.
    ///
    /// Output reaches the broker through the job as it is produced, so the
    /// returned bytes are always empty. Only the last attempt's error is
    /// returned. A job stopped by halt is not retried and counts as done.
    pub async fn process(&self, job: Arc<dyn Job>) -> Result<Vec<u8>, AttemptError> {
        let function = job.function_name().to_string();
        let job_id = match job_id(job.as_ref()) {
            "" => {
                let id = rand::thread_rng().gen_range(0..u32::MAX).to_string();
                tracing::info!(function = %function, job_id = %id, "rand-job-id");
                id
            }
            id => id.to_string(),
        };

        let started = Instant::now();
        tracing::info!(function = %function, job_id = %job_id, "Job started");

        let attempts = self.config.retry_count.saturating_add(1);
        let mut last_error = None;
        for index in 0..attempts {
            let result = match Attempt::create(&self.config, &job_id, index) {
                Ok(attempt) => self.executor.execute(job.clone(), &attempt).await,
                Err(e) => Err(AttemptError::WorkDir(e)),
            };

            match result {
                Ok(()) => {
                    tracing::info!(
                        function = %function,
                        job_id = %job_id,
                        try_number = index,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Job succeeded"
                    );
                    tracing::info!(function = %function, job_id = %job_id, "Job finished");
                    return Ok(Vec::new());
                }
                Err(e) if e.is_halt() => {
                    tracing::info!(function = %function, job_id = %job_id, try_number = index, "Job halted");
                    tracing::info!(function = %function, job_id = %job_id, "Job finished");
                    return Ok(Vec::new());
                }
                Err(e) => {
                    let retrying = index + 1 < attempts && !self.halt.is_cancelled();
                    if retrying {
                        tracing::warn!(
                            function = %function,
                            job_id = %job_id,
                            try_number = index,
                            error = %e,
                            "Job attempt failed, retrying"
                        );
                    }
                    last_error = Some(e);
                    if !retrying {
                        break;
                    }
                }
            }
        }

        let error = last_error.unwrap_or(AttemptError::Halted);
        tracing::error!(function = %function, job_id = %job_id, error = %error, "Job failed");
        tracing::info!(function = %function, job_id = %job_id, "Job finished");
        Err(error)
    }

    /// Run `job`, then pause if every job in the backoff window has failed.
    ///
    /// The pause comes after the result is known and does not change it.
    pub async fn process_with_error_backoff(
        &self,
        job: Arc<dyn Job>,
    ) -> Result<Vec<u8>, AttemptError> {
        let result = self.process(job).await;

        let pause = self.backoff.lock().await.record(result.is_ok());
        if let Some(pause) = pause {
            let pause = pause.min(MAX_ERROR_BACKOFF);
            tracing::warn!(
                function = %self.config.function_name,
                backoff = ?pause,
                window = self.config.error_backoff_count,
                "Every recent job failed, pausing before the next one"
            );
            tokio::time::sleep(pause).await;
        }
        result
    }
}

#[async_trait]
impl JobHandler for JobRunner {
    async fn handle(&self, job: Arc<dyn Job>) -> Result<Vec<u8>, AttemptError> {
        self.process_with_error_backoff(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockJob;

    fn runner(command: &str, configure: impl FnOnce(&mut ExecutionConfig)) -> JobRunner {
        let mut config = ExecutionConfig::new("test", command);
        config.error_backoff_count = 0;
        configure(&mut config);
        JobRunner::new(Arc::new(config), CancellationToken::new())
    }

    #[tokio::test]
    async fn success_returns_empty_result() {
        let runner = runner("echo", |_| {});
        let job = Arc::new(MockJob::new("hello").with_handle("H:lap:1"));

        let result = runner.process(job.clone()).await.unwrap();

        assert!(result.is_empty());
        assert_eq!(job.out_string(), "hello\n");
    }

    #[tokio::test]
    async fn only_last_error_is_returned() {
        let runner = runner("sh", |c| c.retry_count = 2);
        let job = Arc::new(MockJob::new("-c 'exit 3'").with_handle("H:lap:1"));

        let err = runner.process(job).await.unwrap_err();

        assert_eq!(err.to_string(), "exit status 3");
    }

    #[tokio::test]
    async fn missing_job_id_still_runs() {
        let runner = runner("sh", |_| {});
        let job = Arc::new(MockJob::new(r#"-c 'printf %s "$JOB_ID"'"#).with_handle(""));

        runner.process(job.clone()).await.unwrap();

        let id = job.out_string();
        assert!(!id.is_empty());
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn halt_before_start_is_not_retried() {
        let halt = CancellationToken::new();
        halt.cancel();
        let mut config = ExecutionConfig::new("test", "sh");
        config.retry_count = 3;
        config.sigterm_grace_period = Duration::from_millis(100);
        let runner = JobRunner::new(Arc::new(config), halt);
        let job = Arc::new(MockJob::new("-c 'echo attempt; sleep 5'").with_handle("H:lap:1"));

        let result = runner.process(job.clone()).await;

        assert!(result.is_ok());
        assert!(job.out_string().matches("attempt").count() <= 1);
    }
}
