use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::broker::Job;

/// Periodically reports that an attempt is still running.
pub struct Heartbeat {
    interval: Duration,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Tick until `stop` is cancelled, returning the number of beats sent.
    ///
    /// Each beat logs the attempt and reports `(beats, 0)` as the job's
    /// status, a zero denominator meaning the total is unknown. A zero
    /// interval disables the heartbeat.
    pub async fn run(
        &self,
        job: &dyn Job,
        job_id: &str,
        attempt: u32,
        stop: CancellationToken,
    ) -> u32 {
        if self.interval.is_zero() {
            return 0;
        }
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut beats = 0;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    beats += 1;
                    job.update_status(beats, 0);
                    tracing::info!(
                        function = %job.function_name(),
                        job_id,
                        try_number = attempt,
                        beats,
                        unit = ?self.interval,
                        "Heartbeat"
                    );
                }
            }
        }
        beats
    }
}
