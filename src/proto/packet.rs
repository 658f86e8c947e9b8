//! Request/response packet exchanged between meta clients and metanodes

use std::io::Cursor;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{de::DeserializeOwned, Serialize};

use super::status::{ResultCode, Status};
use crate::error::{Error, Result};

/// First byte of every packet
pub const MAGIC: u8 = 0xFF;

/// Default read/write deadline for a packet round trip
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(15);

/// Upper bound on a packet body
pub const MAX_PACKET_SIZE: u32 = 64 * 1024 * 1024;

/// Packet opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    CreateInode = 0x20,
    UnlinkInode = 0x21,
    CreateDentry = 0x22,
    DeleteDentry = 0x23,
    Lookup = 0x25,
    ReadDir = 0x26,
    InodeGet = 0x27,
    BatchInodeGet = 0x28,
    UpdateDentry = 0x2C,
    LinkInode = 0x2E,
    EvictInode = 0x2F,
    SetAttr = 0x30,
    LookupName = 0x32,
    BatchUnlinkInode = 0x92,

    CreateMetaPartition = 0x40,
    DeleteMetaPartition = 0x42,
    UpdateMetaPartition = 0x43,
}

impl OpCode {
    /// Decode an opcode byte
    pub fn from_u8(value: u8) -> Option<Self> {
        let op = match value {
            0x20 => OpCode::CreateInode,
            0x21 => OpCode::UnlinkInode,
            0x22 => OpCode::CreateDentry,
            0x23 => OpCode::DeleteDentry,
            0x25 => OpCode::Lookup,
            0x26 => OpCode::ReadDir,
            0x27 => OpCode::InodeGet,
            0x28 => OpCode::BatchInodeGet,
            0x2C => OpCode::UpdateDentry,
            0x2E => OpCode::LinkInode,
            0x2F => OpCode::EvictInode,
            0x30 => OpCode::SetAttr,
            0x32 => OpCode::LookupName,
            0x92 => OpCode::BatchUnlinkInode,
            0x40 => OpCode::CreateMetaPartition,
            0x42 => OpCode::DeleteMetaPartition,
            0x43 => OpCode::UpdateMetaPartition,
            _ => return None,
        };
        Some(op)
    }

    /// Get opcode name for logging
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::CreateInode => "CreateInode",
            OpCode::UnlinkInode => "UnlinkInode",
            OpCode::CreateDentry => "CreateDentry",
            OpCode::DeleteDentry => "DeleteDentry",
            OpCode::Lookup => "Lookup",
            OpCode::ReadDir => "ReadDir",
            OpCode::InodeGet => "InodeGet",
            OpCode::BatchInodeGet => "BatchInodeGet",
            OpCode::UpdateDentry => "UpdateDentry",
            OpCode::LinkInode => "LinkInode",
            OpCode::EvictInode => "EvictInode",
            OpCode::SetAttr => "SetAttr",
            OpCode::LookupName => "LookupName",
            OpCode::BatchUnlinkInode => "BatchUnlinkInode",
            OpCode::CreateMetaPartition => "CreateMetaPartition",
            OpCode::DeleteMetaPartition => "DeleteMetaPartition",
            OpCode::UpdateMetaPartition => "UpdateMetaPartition",
        }
    }
}

/// Fixed-size packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u8,
    pub opcode: u8,
    pub result: u8,
    /// CRC32 of the body
    pub crc: u32,
    /// Body length
    pub size: u32,
    pub partition_id: u64,
    pub req_id: i64,
}

impl PacketHeader {
    /// Header size in bytes
    pub const SIZE: usize = 27;

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        let mut cursor = Cursor::new(&mut bytes[..]);
        // writes into a correctly sized buffer cannot fail
        let _ = cursor.write_u8(self.magic);
        let _ = cursor.write_u8(self.opcode);
        let _ = cursor.write_u8(self.result);
        let _ = cursor.write_u32::<BigEndian>(self.crc);
        let _ = cursor.write_u32::<BigEndian>(self.size);
        let _ = cursor.write_u64::<BigEndian>(self.partition_id);
        let _ = cursor.write_i64::<BigEndian>(self.req_id);
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Result<Self> {
        let mut cursor = Cursor::new(&bytes[..]);
        let header = Self {
            magic: cursor.read_u8()?,
            opcode: cursor.read_u8()?,
            result: cursor.read_u8()?,
            crc: cursor.read_u32::<BigEndian>()?,
            size: cursor.read_u32::<BigEndian>()?,
            partition_id: cursor.read_u64::<BigEndian>()?,
            req_id: cursor.read_i64::<BigEndian>()?,
        };

        if header.magic != MAGIC {
            return Err(Error::Network(format!("bad packet magic {:#x}", header.magic)));
        }
        if header.size > MAX_PACKET_SIZE {
            return Err(Error::Network(format!("packet body too large: {}", header.size)));
        }
        Ok(header)
    }
}

/// A request or response packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: u8,
    pub result: u8,
    pub partition_id: u64,
    pub req_id: i64,
    pub data: Vec<u8>,
}

impl Packet {
    /// Build a request carrying a bincode-encoded payload
    pub fn request<T: Serialize>(opcode: OpCode, partition_id: u64, payload: &T) -> Result<Self> {
        Ok(Self {
            opcode: opcode as u8,
            result: ResultCode::Pending as u8,
            partition_id,
            req_id: (rand::random::<u64>() >> 1) as i64,
            data: bincode::serialize(payload)?,
        })
    }

    /// Decode the opcode byte
    pub fn op(&self) -> Result<OpCode> {
        OpCode::from_u8(self.opcode).ok_or(Error::UnknownOpCode(self.opcode))
    }

    /// Decode the result byte
    pub fn result_code(&self) -> ResultCode {
        ResultCode::from_u8(self.result)
    }

    /// Decode the body
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.data)?)
    }

    /// Successful reply carrying a body
    pub fn reply<T: Serialize>(&self, body: &T) -> Result<Self> {
        Ok(self.reply_raw(ResultCode::Ok, bincode::serialize(body)?))
    }

    /// Reply with a result code and a human readable message
    pub fn reply_code(&self, code: ResultCode, message: &str) -> Self {
        self.reply_raw(code, message.as_bytes().to_vec())
    }

    /// Reply with the result code matching `status`
    pub fn reply_status(&self, status: Status, message: &str) -> Self {
        self.reply_code(ResultCode::from_status(status), message)
    }

    fn reply_raw(&self, code: ResultCode, data: Vec<u8>) -> Self {
        Self {
            opcode: self.opcode,
            result: code as u8,
            partition_id: self.partition_id,
            req_id: self.req_id,
            data,
        }
    }

    /// Header describing this packet
    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            magic: MAGIC,
            opcode: self.opcode,
            result: self.result,
            crc: crc32fast::hash(&self.data),
            size: self.data.len() as u32,
            partition_id: self.partition_id,
            req_id: self.req_id,
        }
    }

    /// Rebuild a packet from a verified header and its body
    pub fn from_parts(header: PacketHeader, data: Vec<u8>) -> Result<Self> {
        let computed = crc32fast::hash(&data);
        if computed != header.crc {
            return Err(Error::Network(format!(
                "packet checksum mismatch: expected {:#x}, got {:#x}",
                header.crc, computed
            )));
        }
        Ok(Self {
            opcode: header.opcode,
            result: header.result,
            partition_id: header.partition_id,
            req_id: header.req_id,
            data,
        })
    }

    /// Message text of a failed reply
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Get a short description for logging
    pub fn describe(&self) -> String {
        let op = OpCode::from_u8(self.opcode).map(|op| op.name()).unwrap_or("Unknown");
        format!(
            "{}(partition={}, req={}, result={:?})",
            op,
            self.partition_id,
            self.req_id,
            self.result_code()
        )
    }
}
