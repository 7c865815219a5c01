use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{Encoder, FramedRead};

use super::codec::{GearmanCodec, Packet, PacketType};
use crate::broker::resilience::Reconnect;
use crate::broker::Job;
use crate::error::{AttemptError, BrokerError};

/// Job received over a Gearman connection.
///
/// Output, warnings and status updates are queued onto the connection's
/// writer task, so they can be sent from any task without awaiting.
#[derive(Debug)]
pub struct GearmanJob {
    handle: String,
    function: String,
    payload: Bytes,
    outbound: mpsc::UnboundedSender<Packet>,
}

impl GearmanJob {
    fn from_assignment(packet: &Packet, outbound: mpsc::UnboundedSender<Packet>) -> Self {
        Self {
            handle: packet.arg_str(0),
            function: packet.arg_str(1),
            payload: Bytes::copy_from_slice(packet.arg(2)),
            outbound,
        }
    }

    fn send(&self, packet: Packet) {
        if self.outbound.send(packet).is_err() {
            tracing::debug!(handle = %self.handle, "Broker connection closed, dropping job update");
        }
    }
}

impl Job for GearmanJob {
    fn data(&self) -> &[u8] {
        &self.payload
    }

    fn handle(&self) -> &str {
        &self.handle
    }

    fn function_name(&self) -> &str {
        &self.function
    }

    fn send_data(&self, data: &[u8]) {
        self.send(Packet::work_data(&self.handle, data));
    }

    fn send_warning(&self, data: &[u8]) {
        self.send(Packet::work_warning(&self.handle, data));
    }

    fn update_status(&self, numerator: u32, denominator: u32) {
        self.send(Packet::work_status(&self.handle, numerator, denominator));
    }
}

struct Connection {
    reader: FramedRead<OwnedReadHalf, GearmanCodec>,
    outbound: mpsc::UnboundedSender<Packet>,
    writer: JoinHandle<()>,
}

impl Connection {
    async fn open(addr: &str, function: &str) -> Result<Self, BrokerError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(write, rx));
        let conn = Self {
            reader: FramedRead::new(read, GearmanCodec::worker()),
            outbound: tx,
            writer,
        };
        conn.send(Packet::can_do(function))?;
        Ok(conn)
    }

    fn send(&self, packet: Packet) -> Result<(), BrokerError> {
        self.outbound
            .send(packet)
            .map_err(|_| BrokerError::Disconnected)
    }

    async fn recv(&mut self) -> Result<Packet, BrokerError> {
        match self.reader.next().await {
            Some(packet) => packet,
            None => Err(BrokerError::Disconnected),
        }
    }

    /// Drop a connection that is already broken without waiting for writes.
    fn abandon(self) {
        self.writer.abort();
    }

    /// Flush queued packets and close the socket.
    async fn close(self) {
        let Connection {
            reader,
            outbound,
            writer,
        } = self;
        drop(outbound);
        drop(reader);
        if let Err(e) = writer.await {
            tracing::warn!(error = %e, "Broker writer task failed");
        }
    }
}

async fn write_loop(mut write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Packet>) {
    let mut codec = GearmanCodec::worker();
    let mut buf = BytesMut::new();

    while let Some(packet) = rx.recv().await {
        buf.clear();
        if let Err(e) = codec.encode(packet, &mut buf) {
            tracing::warn!(error = %e, "Failed to encode packet for broker");
            continue;
        }
        if let Err(e) = write.write_all(&buf).await {
            tracing::warn!(error = %e, "Failed to write to broker");
            return;
        }
    }
    let _ = write.shutdown().await;
}

/// Serial Gearman worker: registers one function and grabs one job at a time.
pub struct GearmanWorker {
    addr: String,
    function: String,
    conn: Option<Connection>,
}

impl GearmanWorker {
    pub fn new(addr: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            function: function.into(),
            conn: None,
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Connect and register the function. Registration carries no timeout,
    /// leaving the broker free to hand out jobs of any duration.
    pub async fn connect(&mut self) -> Result<(), BrokerError> {
        let conn = Connection::open(&self.addr, &self.function).await?;
        if let Some(old) = self.conn.replace(conn) {
            old.abandon();
        }
        tracing::info!(addr = %self.addr, function = %self.function, "Registered with broker");
        Ok(())
    }

    /// Wait for the broker to assign a job.
    ///
    /// Cancel safe: dropping the future between packets loses nothing but
    /// the outstanding grab request.
    pub async fn next_job(&mut self) -> Result<GearmanJob, BrokerError> {
        let conn = self.conn.as_mut().ok_or(BrokerError::Disconnected)?;
        conn.send(Packet::grab_job())?;

        loop {
            let packet = conn.recv().await?;
            match packet.kind {
                PacketType::NoJob => conn.send(Packet::pre_sleep())?,
                PacketType::Noop => conn.send(Packet::grab_job())?,
                PacketType::JobAssign => {
                    return Ok(GearmanJob::from_assignment(&packet, conn.outbound.clone()))
                }
                PacketType::Error => {
                    return Err(BrokerError::Server {
                        code: packet.arg_str(0),
                        message: packet.arg_str(1),
                    })
                }
                other => tracing::debug!(packet = ?other, "Ignoring unexpected packet"),
            }
        }
    }

    /// Report the final result of a job.
    pub fn complete(
        &self,
        job: &GearmanJob,
        result: &Result<Vec<u8>, AttemptError>,
    ) -> Result<(), BrokerError> {
        let conn = self.conn.as_ref().ok_or(BrokerError::Disconnected)?;
        let packet = match result {
            Ok(data) => Packet::work_complete(&job.handle, data),
            Err(e) => Packet::work_exception(&job.handle, &e.to_string()),
        };
        conn.send(packet)
    }

    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close().await;
            tracing::info!(addr = %self.addr, "Closed broker connection");
        }
    }
}

#[async_trait]
impl Reconnect for GearmanWorker {
    async fn reconnect(&mut self) -> Result<(), BrokerError> {
        if let Some(old) = self.conn.take() {
            old.abandon();
        }
        self.connect().await
    }
}
