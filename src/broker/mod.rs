//! Boundary between the execution engine and the job broker.
//!
//! The engine only ever sees a job through the [`Job`] trait, which exposes
//! the payload and the side effects a broker supports while a job runs:
//!
//! - **Output**: incremental bytes for the job's result (`WORK_DATA`)
//! - **Warnings**: out-of-band diagnostics (`WORK_WARNING`)
//! - **Progress**: numerator/denominator status updates (`WORK_STATUS`)
//!
//! # Components
//!
//! - [`gearman`]: Gearman worker protocol client and its packet codec
//! - [`resilience`]: reconnect backoff, error escalation and the serve loop
//! - [`mock`]: in-memory [`Job`] used by tests

pub mod gearman;
pub mod mock;
pub mod resilience;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AttemptError;

/// One job handed to this worker by the broker.
pub trait Job: Send + Sync {
    /// Raw payload
    fn data(&self) -> &[u8];

    /// Broker-assigned handle, e.g. `H:host:123`
    fn handle(&self) -> &str;

    /// Registered function the job was submitted to
    fn function_name(&self) -> &str;

    fn send_data(&self, data: &[u8]);

    fn send_warning(&self, data: &[u8]);

    fn update_status(&self, numerator: u32, denominator: u32);
}

/// Extract the job identifier, the last `:`-separated segment of the handle.
pub fn job_id(job: &dyn Job) -> &str {
    job.handle().rsplit(':').next().unwrap_or_default()
}

/// Something that turns a job into a result for the broker.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Arc<dyn Job>) -> Result<Vec<u8>, AttemptError>;
}
