//! Job execution engine.
//!
//! Every job the broker hands over runs as a local subprocess:
//! - **Execution**: spawn the command in its own process group, stream its
//!   stdout to the job and keep the tail of its stderr as a warning
//! - **Interruption**: stop the subprocess tree on timeout or halt
//! - **Retries**: rerun failed attempts in fresh work directories
//! - **Backoff**: pause between jobs once every recent job has failed
//!
//! # Components
//!
//! - [`JobRunner`]: retries and error backoff around single attempts
//! - [`JobExecutor`]: runs one attempt and races it against timeout and halt
//! - [`process`]: subprocess spawn, stop and process-group kill
//! - [`output`]: stdout streaming and the stderr warning ring
//! - [`heartbeat`]: periodic liveness reports while an attempt runs
//! - [`backoff`]: window of recent job outcomes
//!
//! # Execution Flow
//!
//! 1. [`JobRunner::process`] creates an [`Attempt`](executor::Attempt) with
//!    its own work directory
//! 2. [`JobExecutor::execute`] spawns the command with `JOB_ID` and
//!    `WORK_DIR` set
//! 3. Output is streamed while the subprocess runs; the warning is sent once
//!    it has finished
//! 4. Failed attempts are retried until one succeeds or the retries run out

pub mod backoff;
pub mod executor;
pub mod heartbeat;
pub mod output;
pub mod process;
pub mod retry;

pub use executor::JobExecutor;
pub use retry::JobRunner;
