//! Shared helpers for worker and broker integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::StreamExt;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;

use cmdworker::broker::gearman::{GearmanCodec, Packet, PacketType};
use cmdworker::broker::mock::MockJob;
use cmdworker::config::ExecutionConfig;
use cmdworker::worker::JobRunner;

/// Config for running `command` with backoff disabled and work directories
/// created under `sandbox`.
pub fn test_config(command: &str, sandbox: &Path) -> ExecutionConfig {
    ExecutionConfig {
        error_backoff_count: 0,
        sandbox_root: Some(sandbox.to_path_buf()),
        sigterm_grace_period: Duration::from_secs(2),
        ..ExecutionConfig::new("test", command)
    }
}

pub fn runner(config: ExecutionConfig) -> JobRunner {
    JobRunner::new(Arc::new(config), CancellationToken::new())
}

/// Payload that makes `sh` run `script`.
pub fn sh_payload(script: &str) -> String {
    match shlex::try_quote(script) {
        Ok(quoted) => format!("-c {}", quoted),
        Err(e) => panic!("cannot quote {:?}: {}", script, e),
    }
}

/// A job running `script` through `sh`, with handle `H:test:<id>`.
pub fn sh_job(script: &str, id: &str) -> Arc<MockJob> {
    Arc::new(
        MockJob::new(sh_payload(script))
            .with_handle(format!("H:test:{}", id))
            .with_function("test"),
    )
}

pub fn sandbox() -> TempDir {
    tempfile::tempdir().unwrap()
}

/// Number of entries left in `dir`.
pub fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

/// Whether `pid` is still a live (non-zombie) process.
#[cfg(target_os = "linux")]
pub fn is_alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

/// Wait until `pid` is gone, giving up after `limit`.
#[cfg(target_os = "linux")]
pub async fn wait_for_exit(pid: i32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    !is_alive(pid)
}

/// Broker side of a single Gearman worker connection.
pub struct BrokerConn {
    reader: FramedRead<OwnedReadHalf, GearmanCodec>,
    writer: OwnedWriteHalf,
}

impl BrokerConn {
    pub fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: FramedRead::new(read, GearmanCodec::server()),
            writer: write,
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        let mut buf = BytesMut::new();
        GearmanCodec::server().encode(packet, &mut buf).unwrap();
        self.writer.write_all(&buf).await.unwrap();
    }

    /// Next packet from the worker, failing the test after five seconds.
    pub async fn recv(&mut self) -> Packet {
        tokio::time::timeout(Duration::from_secs(5), self.reader.next())
            .await
            .expect("timed out waiting for worker packet")
            .expect("worker closed the connection")
            .unwrap()
    }

    /// Receive until a packet of `kind` arrives, returning everything seen.
    pub async fn recv_until(&mut self, kind: PacketType) -> Vec<Packet> {
        let mut seen = Vec::new();
        loop {
            let packet = self.recv().await;
            let done = packet.kind == kind;
            seen.push(packet);
            if done {
                return seen;
            }
        }
    }

    /// Whether the worker closed its end within five seconds.
    pub async fn is_closed(&mut self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(5), self.reader.next()).await,
            Ok(None) | Ok(Some(Err(_)))
        )
    }

    /// Packets sent before the worker closed its end, failing the test if it
    /// is still open after five seconds.
    pub async fn drain_until_closed(&mut self) -> Vec<Packet> {
        let mut seen = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.reader.next())
                .await
                .expect("worker did not close the connection")
            {
                Some(Ok(packet)) => seen.push(packet),
                Some(Err(_)) | None => return seen,
            }
        }
    }

    /// Handshake up to the worker's first grab request.
    pub async fn expect_registration(&mut self, function: &str) {
        let can_do = self.recv().await;
        assert_eq!(can_do.kind, PacketType::CanDo);
        assert_eq!(can_do.arg_str(0), function);
        assert_eq!(self.recv().await.kind, PacketType::GrabJob);
    }
}

/// A local listener standing in for gearmand.
pub struct FakeBroker {
    listener: TcpListener,
}

impl FakeBroker {
    pub async fn start() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn addr(&self) -> String {
        self.listener.local_addr().unwrap().to_string()
    }

    pub async fn accept(&self) -> BrokerConn {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), self.listener.accept())
            .await
            .expect("timed out waiting for worker to connect")
            .unwrap();
        BrokerConn::new(stream)
    }
}
