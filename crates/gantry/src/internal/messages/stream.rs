//! Leading record of every I/O connection from a task to the launcher.
//!
//! Layout, network byte order: version (u16), task id (i32), stream type
//! (u16), credential signature ([`SIG_LEN`] bytes).
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

use crate::internal::credential::{SIG_LEN, Signature};

pub const STREAM_PROTOCOL_VERSION: u16 = 0x0a01;
pub const STREAM_HEADER_LEN: usize = 2 + 4 + 2 + SIG_LEN;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamType {
    /// Task stdout, stdin flows back over the same socket.
    InOut,
    /// Task stderr, also carries signals.
    SigErr,
}

impl StreamType {
    pub fn to_raw(self) -> u16 {
        match self {
            StreamType::InOut => 0,
            StreamType::SigErr => 1,
        }
    }

    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(StreamType::InOut),
            1 => Some(StreamType::SigErr),
            _ => None,
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::InOut => f.write_str("inout"),
            StreamType::SigErr => f.write_str("sigerr"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamHeaderError {
    #[error("header has {0} bytes, expected {STREAM_HEADER_LEN}")]
    Truncated(usize),
    #[error("protocol version {found:#x}, expected {expected:#x}")]
    VersionMismatch { expected: u16, found: u16 },
    #[error("task id {task_id} outside of 0..{nprocs}")]
    TaskOutOfRange { task_id: i32, nprocs: u32 },
    #[error("unknown stream type {0}")]
    UnknownStreamType(u16),
    #[error("signature does not match the step credential")]
    BadSignature,
}

#[derive(Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u16,
    pub task_id: i32,
    pub stream_type: u16,
    pub signature: Signature,
}

impl fmt::Debug for StreamHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHeader")
            .field("version", &self.version)
            .field("task_id", &self.task_id)
            .field("stream_type", &self.stream_type)
            .finish_non_exhaustive()
    }
}

impl StreamHeader {
    pub fn new(task_id: i32, stream_type: StreamType, signature: Signature) -> Self {
        StreamHeader {
            version: STREAM_PROTOCOL_VERSION,
            task_id,
            stream_type: stream_type.to_raw(),
            signature,
        }
    }

    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STREAM_HEADER_LEN);
        buf.put_u16(self.version);
        buf.put_i32(self.task_id);
        buf.put_u16(self.stream_type);
        buf.put_slice(&self.signature);
        buf.freeze()
    }

    pub fn unpack(mut data: &[u8]) -> Result<Self, StreamHeaderError> {
        if data.len() < STREAM_HEADER_LEN {
            return Err(StreamHeaderError::Truncated(data.len()));
        }
        let version = data.get_u16();
        let task_id = data.get_i32();
        let stream_type = data.get_u16();
        let mut signature = [0; SIG_LEN];
        data.copy_to_slice(&mut signature);
        Ok(StreamHeader {
            version,
            task_id,
            stream_type,
            signature,
        })
    }

    /// Checks the header against the step; returns the task id and stream type.
    pub fn validate(
        &self,
        nprocs: u32,
        signature: &Signature,
    ) -> Result<(u32, StreamType), StreamHeaderError> {
        if self.version != STREAM_PROTOCOL_VERSION {
            return Err(StreamHeaderError::VersionMismatch {
                expected: STREAM_PROTOCOL_VERSION,
                found: self.version,
            });
        }
        let task_id = u32::try_from(self.task_id)
            .ok()
            .filter(|id| *id < nprocs)
            .ok_or(StreamHeaderError::TaskOutOfRange {
                task_id: self.task_id,
                nprocs,
            })?;
        let stream_type = StreamType::from_raw(self.stream_type)
            .ok_or(StreamHeaderError::UnknownStreamType(self.stream_type))?;
        orion::util::secure_cmp(&self.signature, signature)
            .map_err(|_| StreamHeaderError::BadSignature)?;
        Ok((task_id, stream_type))
    }
}
