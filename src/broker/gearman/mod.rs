//! Worker side of the Gearman binary protocol.
//!
//! Only what a single-function, one-job-at-a-time worker needs is
//! implemented: registration, the grab/sleep/wake cycle, and reporting job
//! output, warnings, status and completion.

pub mod client;
pub mod codec;

pub use client::{GearmanJob, GearmanWorker};
pub use codec::{GearmanCodec, Packet, PacketType};
