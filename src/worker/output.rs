use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::broker::Job;

/// Largest chunk forwarded to the job in one `send_data` call.
pub const STDOUT_CHUNK_SIZE: usize = 1024;

/// Forward a subprocess's stdout to the job as it is produced.
///
/// Each chunk is also mirrored to this worker's stdout. Returns once the
/// reader reaches end of stream.
pub async fn stream_stdout<R>(mut reader: R, job: &dyn Job) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; STDOUT_CHUNK_SIZE];
    let mut mirror = tokio::io::stdout();
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        job.send_data(&buffer[..n]);
        if let Err(e) = mirror.write_all(&buffer[..n]).await {
            tracing::debug!(error = %e, "Failed to mirror job stdout");
        }
    }
}

/// The most recent lines of a subprocess's stderr.
#[derive(Debug, Clone)]
pub struct WarningRing {
    lines: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl WarningRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: impl Into<Vec<u8>>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Retained lines, oldest first, each terminated by `\n`.
    pub fn report(&self) -> Vec<u8> {
        let mut report = Vec::new();
        for line in &self.lines {
            report.extend_from_slice(line);
            report.push(b'\n');
        }
        report
    }
}

/// Read stderr line by line, mirroring it to this worker's stderr and
/// keeping the last `capacity` lines.
///
/// A read error ends the capture early; whatever was read so far is kept.
pub async fn capture_warnings<R>(reader: R, capacity: usize) -> WarningRing
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut ring = WarningRing::new(capacity);
    let mut mirror = tokio::io::stderr();
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if let Err(e) = mirror.write_all(&line).await {
                    tracing::debug!(error = %e, "Failed to mirror job stderr");
                }
                ring.push(trim_line_ending(&line));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read job stderr");
                break;
            }
        }
    }
    ring
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
