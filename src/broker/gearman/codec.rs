use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::BrokerError;

pub const REQ_MAGIC: &[u8; 4] = b"\0REQ";
pub const RES_MAGIC: &[u8; 4] = b"\0RES";

const HEADER_LEN: usize = 12;
const MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

/// The subset of Gearman packet types a worker sends or receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    CanDo,
    PreSleep,
    Noop,
    GrabJob,
    NoJob,
    JobAssign,
    WorkStatus,
    WorkComplete,
    WorkFail,
    EchoReq,
    EchoRes,
    Error,
    WorkException,
    WorkData,
    WorkWarning,
}

impl PacketType {
    pub fn code(self) -> u32 {
        match self {
            PacketType::CanDo => 1,
            PacketType::PreSleep => 4,
            PacketType::Noop => 6,
            PacketType::GrabJob => 9,
            PacketType::NoJob => 10,
            PacketType::JobAssign => 11,
            PacketType::WorkStatus => 12,
            PacketType::WorkComplete => 13,
            PacketType::WorkFail => 14,
            PacketType::EchoReq => 16,
            PacketType::EchoRes => 17,
            PacketType::Error => 19,
            PacketType::WorkException => 25,
            PacketType::WorkData => 28,
            PacketType::WorkWarning => 29,
        }
    }

    /// Number of NUL-separated arguments. The last one may itself contain NULs.
    pub fn arity(self) -> usize {
        match self {
            PacketType::PreSleep | PacketType::Noop | PacketType::GrabJob | PacketType::NoJob => 0,
            PacketType::CanDo
            | PacketType::WorkFail
            | PacketType::EchoReq
            | PacketType::EchoRes => 1,
            PacketType::WorkComplete
            | PacketType::Error
            | PacketType::WorkException
            | PacketType::WorkData
            | PacketType::WorkWarning => 2,
            PacketType::JobAssign | PacketType::WorkStatus => 3,
        }
    }
}

impl TryFrom<u32> for PacketType {
    type Error = BrokerError;

    fn try_from(code: u32) -> Result<Self, BrokerError> {
        Ok(match code {
            1 => PacketType::CanDo,
            4 => PacketType::PreSleep,
            6 => PacketType::Noop,
            9 => PacketType::GrabJob,
            10 => PacketType::NoJob,
            11 => PacketType::JobAssign,
            12 => PacketType::WorkStatus,
            13 => PacketType::WorkComplete,
            14 => PacketType::WorkFail,
            16 => PacketType::EchoReq,
            17 => PacketType::EchoRes,
            19 => PacketType::Error,
            25 => PacketType::WorkException,
            28 => PacketType::WorkData,
            29 => PacketType::WorkWarning,
            other => {
                return Err(BrokerError::Protocol(format!(
                    "unsupported packet type {}",
                    other
                )))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub args: Vec<Bytes>,
}

impl Packet {
    pub fn new(kind: PacketType, args: Vec<Bytes>) -> Self {
        Self { kind, args }
    }

    pub fn can_do(function: &str) -> Self {
        Self::new(PacketType::CanDo, vec![copy(function)])
    }

    pub fn grab_job() -> Self {
        Self::new(PacketType::GrabJob, Vec::new())
    }

    pub fn pre_sleep() -> Self {
        Self::new(PacketType::PreSleep, Vec::new())
    }

    pub fn noop() -> Self {
        Self::new(PacketType::Noop, Vec::new())
    }

    pub fn no_job() -> Self {
        Self::new(PacketType::NoJob, Vec::new())
    }

    pub fn job_assign(handle: &str, function: &str, data: &[u8]) -> Self {
        Self::new(
            PacketType::JobAssign,
            vec![copy(handle), copy(function), Bytes::copy_from_slice(data)],
        )
    }

    pub fn work_data(handle: &str, data: &[u8]) -> Self {
        Self::new(
            PacketType::WorkData,
            vec![copy(handle), Bytes::copy_from_slice(data)],
        )
    }

    pub fn work_warning(handle: &str, data: &[u8]) -> Self {
        Self::new(
            PacketType::WorkWarning,
            vec![copy(handle), Bytes::copy_from_slice(data)],
        )
    }

    pub fn work_status(handle: &str, numerator: u32, denominator: u32) -> Self {
        Self::new(
            PacketType::WorkStatus,
            vec![
                copy(handle),
                Bytes::from(numerator.to_string()),
                Bytes::from(denominator.to_string()),
            ],
        )
    }

    pub fn work_complete(handle: &str, data: &[u8]) -> Self {
        Self::new(
            PacketType::WorkComplete,
            vec![copy(handle), Bytes::copy_from_slice(data)],
        )
    }

    pub fn work_exception(handle: &str, message: &str) -> Self {
        Self::new(PacketType::WorkException, vec![copy(handle), copy(message)])
    }

    /// Argument `index`, or an empty slice when the packet is short.
    pub fn arg(&self, index: usize) -> &[u8] {
        self.args.get(index).map(|b| b.as_ref()).unwrap_or_default()
    }

    pub fn arg_str(&self, index: usize) -> String {
        String::from_utf8_lossy(self.arg(index)).into_owned()
    }

    fn body_len(&self) -> usize {
        let joined: usize = self.args.iter().map(Bytes::len).sum();
        joined + self.args.len().saturating_sub(1)
    }
}

fn copy(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Frames Gearman binary packets: 4-byte magic, big-endian type and body
/// length, then NUL-separated arguments.
#[derive(Debug, Clone, Copy)]
pub struct GearmanCodec {
    outbound: &'static [u8; 4],
    inbound: &'static [u8; 4],
}

impl GearmanCodec {
    /// Worker side: sends requests, receives responses
    pub fn worker() -> Self {
        Self {
            outbound: REQ_MAGIC,
            inbound: RES_MAGIC,
        }
    }

    /// Broker side, used by test brokers
    pub fn server() -> Self {
        Self {
            outbound: RES_MAGIC,
            inbound: REQ_MAGIC,
        }
    }
}

impl Decoder for GearmanCodec {
    type Item = Packet;
    type Error = BrokerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, BrokerError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if &src[..4] != self.inbound {
            return Err(BrokerError::Protocol(format!(
                "unexpected magic {:?}",
                &src[..4]
            )));
        }
        let code = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        let size = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if size > MAX_PACKET_SIZE {
            return Err(BrokerError::Protocol(format!(
                "packet of {} bytes exceeds limit",
                size
            )));
        }
        if src.len() < HEADER_LEN + size {
            src.reserve(HEADER_LEN + size - src.len());
            return Ok(None);
        }

        let kind = PacketType::try_from(code)?;
        src.advance(HEADER_LEN);
        let body = src.split_to(size).freeze();
        Ok(Some(Packet::new(kind, split_args(body, kind.arity()))))
    }
}

impl Encoder<Packet> for GearmanCodec {
    type Error = BrokerError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), BrokerError> {
        let size = packet.body_len();
        let size = u32::try_from(size)
            .map_err(|_| BrokerError::Protocol(format!("packet of {} bytes too large", size)))?;

        dst.reserve(HEADER_LEN + size as usize);
        dst.put_slice(self.outbound);
        dst.put_u32(packet.kind.code());
        dst.put_u32(size);
        for (i, arg) in packet.args.iter().enumerate() {
            if i > 0 {
                dst.put_u8(0);
            }
            dst.put_slice(arg);
        }
        Ok(())
    }
}

fn split_args(mut body: Bytes, arity: usize) -> Vec<Bytes> {
    if arity == 0 {
        return Vec::new();
    }
    let mut args = Vec::with_capacity(arity);
    while args.len() + 1 < arity {
        match body.iter().position(|&b| b == 0) {
            Some(pos) => {
                args.push(body.split_to(pos));
                body.advance(1);
            }
            None => break,
        }
    }
    args.push(body);
    args
}
