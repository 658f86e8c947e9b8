//! Per-operation status taxonomy and wire result codes

use serde::{Deserialize, Serialize};

/// Outcome of a single metadata operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Unknown,
    Ok,
    Exist,
    Noent,
    Full,
    Again,
    Error,
    Inval,
    NotPerm,
    ConflictExtents,
}

impl Status {
    /// Check if the status means success
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// POSIX errno for FUSE-style callers
    pub fn errno(&self) -> i32 {
        match self {
            // a caller asking for the errno of a success gets a retry hint
            Status::Ok => libc::EAGAIN,
            Status::Exist => libc::EEXIST,
            Status::Noent => libc::ENOENT,
            Status::Full => libc::ENOMEM,
            Status::Again => libc::EAGAIN,
            Status::Inval => libc::EINVAL,
            Status::NotPerm | Status::Error => libc::EPERM,
            Status::Unknown | Status::ConflictExtents => libc::EIO,
        }
    }
}

/// Result byte carried in a packet header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// Request is not yet answered
    Pending = 0x00,
    ArgMismatch = 0xF1,
    NotExist = 0xF2,
    DiskErr = 0xF3,
    Err = 0xF4,
    Again = 0xF5,
    Exist = 0xF6,
    InodeFull = 0xF7,
    TryOtherAddr = 0xF8,
    NotPerm = 0xF9,
    NotEmpty = 0xFA,
    Ok = 0xFB,
    ConflictExtents = 0xFC,
}

impl ResultCode {
    /// Decode a result byte; unknown values collapse to `Err`
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => ResultCode::Pending,
            0xF1 => ResultCode::ArgMismatch,
            0xF2 => ResultCode::NotExist,
            0xF3 => ResultCode::DiskErr,
            0xF5 => ResultCode::Again,
            0xF6 => ResultCode::Exist,
            0xF7 => ResultCode::InodeFull,
            0xF8 => ResultCode::TryOtherAddr,
            0xF9 => ResultCode::NotPerm,
            0xFA => ResultCode::NotEmpty,
            0xFB => ResultCode::Ok,
            0xFC => ResultCode::ConflictExtents,
            _ => ResultCode::Err,
        }
    }

    /// Client-side status for this result code
    pub fn to_status(self) -> Status {
        match self {
            ResultCode::Ok => Status::Ok,
            ResultCode::Exist => Status::Exist,
            ResultCode::NotExist => Status::Noent,
            ResultCode::InodeFull => Status::Full,
            ResultCode::Again | ResultCode::TryOtherAddr => Status::Again,
            ResultCode::ArgMismatch => Status::Inval,
            ResultCode::NotPerm => Status::NotPerm,
            ResultCode::ConflictExtents => Status::ConflictExtents,
            ResultCode::Pending => Status::Unknown,
            ResultCode::DiskErr | ResultCode::Err | ResultCode::NotEmpty => Status::Error,
        }
    }

    /// Server-side result code for a handler status
    pub fn from_status(status: Status) -> Self {
        match status {
            Status::Ok => ResultCode::Ok,
            Status::Exist => ResultCode::Exist,
            Status::Noent => ResultCode::NotExist,
            Status::Full => ResultCode::InodeFull,
            Status::Again => ResultCode::Again,
            Status::Inval => ResultCode::ArgMismatch,
            Status::NotPerm => ResultCode::NotPerm,
            Status::ConflictExtents => ResultCode::ConflictExtents,
            Status::Error | Status::Unknown => ResultCode::Err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_to_status() {
        assert_eq!(ResultCode::from_u8(0xFB).to_status(), Status::Ok);
        assert_eq!(ResultCode::from_u8(0xF2).to_status(), Status::Noent);
        assert_eq!(ResultCode::from_u8(0xF7).to_status(), Status::Full);
        assert_eq!(ResultCode::from_u8(0xFA).to_status(), Status::Error);
        assert_eq!(ResultCode::from_u8(0x42).to_status(), Status::Error);
    }

    #[test]
    fn test_errno() {
        assert_eq!(Status::Noent.errno(), libc::ENOENT);
        assert_eq!(Status::Full.errno(), libc::ENOMEM);
        assert_eq!(Status::Error.errno(), libc::EPERM);
    }
}
