//! Client to metanode wire protocol
//!
//! Packets carry an opcode, a partition id and a bincode payload. Replies
//! reuse the request's identity and carry a result code plus an
//! opcode-specific body.

mod packet;
mod request;
mod status;

pub use packet::{OpCode, Packet, PacketHeader, DEFAULT_DEADLINE, MAGIC, MAX_PACKET_SIZE};
pub use request::*;
pub use status::{ResultCode, Status};
