//! Keeping the broker connection alive, or giving up loudly.
//!
//! A dropped connection is retried in place with exponential backoff. Any
//! other non-temporary network fault interrupts the whole process so an
//! external supervisor restarts the worker with a fresh broker address.

use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{raise, Signal};
use tokio_util::sync::CancellationToken;

use super::gearman::GearmanWorker;
use super::{Job, JobHandler};
use crate::config::ReconnectPolicy;
use crate::error::BrokerError;

/// A connection that can be re-established in place.
#[async_trait]
pub trait Reconnect: Send {
    async fn reconnect(&mut self) -> Result<(), BrokerError>;
}

/// What the error handler did about a broker error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// The connection was re-established
    Reconnected,
    /// The error was logged and can be retried
    Ignored,
    /// The process was asked to shut down
    Escalated,
}

/// Retry `target.reconnect()` with exponentially growing delays.
///
/// The first attempt is immediate; up to `policy.attempts` retries follow,
/// waiting `base_delay`, then twice that, and so on. The last error is
/// returned once retries are exhausted.
pub async fn reconnect_with_backoff<R: Reconnect + ?Sized>(
    target: &mut R,
    policy: &ReconnectPolicy,
) -> Result<(), BrokerError> {
    let mut delay = policy.base_delay;
    let mut retries = 0;
    loop {
        match target.reconnect().await {
            Ok(()) => return Ok(()),
            Err(e) if retries >= policy.attempts => return Err(e),
            Err(e) => {
                retries += 1;
                tracing::debug!(retry = retries, delay = ?delay, error = %e, "Reconnect failed, backing off");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
}

/// Decides how to react to errors reported by the broker client.
pub struct ErrorHandler {
    name: String,
    policy: ReconnectPolicy,
    interrupt: Box<dyn Fn() + Send + Sync>,
}

impl ErrorHandler {
    /// Escalation raises SIGINT on the current process.
    pub fn new(name: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            interrupt: Box::new(interrupt_self),
        }
    }

    /// Replace the escalation action.
    pub fn with_interrupt(mut self, interrupt: impl Fn() + Send + Sync + 'static) -> Self {
        self.interrupt = Box::new(interrupt);
        self
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub async fn handle<R: Reconnect + ?Sized>(&self, err: BrokerError, target: &mut R) -> Recovery {
        if !matches!(err, BrokerError::Disconnected) {
            return self.on_error(err);
        }

        tracing::info!(name = %self.name, error = %err, "Disconnected from broker, reconnecting");
        match reconnect_with_backoff(target, &self.policy).await {
            Ok(()) => {
                tracing::info!(name = %self.name, "Reconnected to broker");
                Recovery::Reconnected
            }
            Err(rc_err) => {
                tracing::error!(name = %self.name, error = %rc_err, "Failed to reconnect to broker");
                self.on_error(rc_err)
            }
        }
    }

    fn on_error(&self, err: BrokerError) -> Recovery {
        tracing::info!(name = %self.name, error = %err, "Broker error");
        if err.is_network() && !err.is_temporary() {
            tracing::error!(name = %self.name, "Unrecoverable network error, interrupting worker");
            (self.interrupt)();
            Recovery::Escalated
        } else {
            Recovery::Ignored
        }
    }
}

fn interrupt_self() {
    if let Err(e) = raise(Signal::SIGINT) {
        tracing::error!(error = %e, "Failed to interrupt worker process");
    }
}

/// Serve jobs until `shutdown` is cancelled.
///
/// Jobs are handled one at a time. Shutdown only stops the worker from
/// grabbing new jobs; an in-flight job always runs to completion first.
pub async fn serve<H: JobHandler + ?Sized>(
    worker: &mut GearmanWorker,
    handler: &H,
    errors: &ErrorHandler,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(function = %worker.function(), "Shutdown requested, no longer accepting jobs");
                break;
            }
            next = worker.next_job() => next,
        };

        let err = match next {
            Ok(job) => {
                let job = Arc::new(job);
                let result = handler.handle(job.clone() as Arc<dyn Job>).await;
                match worker.complete(&job, &result) {
                    Ok(()) => continue,
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        match errors.handle(err, worker).await {
            Recovery::Reconnected => {}
            Recovery::Ignored => tokio::time::sleep(errors.policy().base_delay).await,
            Recovery::Escalated => {
                shutdown.cancelled().await;
                break;
            }
        }
    }

    worker.close().await;
}
