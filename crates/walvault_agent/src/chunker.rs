//! Cutting streamed bytes into upload units.

use crate::catalog::{BaseRef, ObjectName};
use crate::error::{AgentError, AgentResult};
use bytes::{Bytes, BytesMut};
use walvault_wal::{Lsn, SEGMENT_SIZE};

/// A named object ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadUnit {
    /// Object name.
    pub name: ObjectName,
    /// Object content.
    pub data: Bytes,
}

/// Accumulates the WAL stream and cuts it into whole segments.
///
/// The cursor is the start of the buffered bytes; the next delivery must
/// begin exactly at `cursor + buffered`.
#[derive(Debug)]
pub struct WalChunker {
    cursor: Lsn,
    timeline: u32,
    buf: BytesMut,
}

impl WalChunker {
    /// Creates a chunker whose first segment starts at `start`.
    pub fn new(start: Lsn, timeline: u32) -> Self {
        Self {
            cursor: start,
            timeline,
            buf: BytesMut::new(),
        }
    }

    /// Start of the buffered bytes.
    pub fn cursor(&self) -> Lsn {
        self.cursor
    }

    /// Number of bytes buffered but not yet cut.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Address the next delivery must start at.
    pub fn next_lsn(&self) -> Lsn {
        self.cursor + self.buf.len() as u64
    }

    /// Appends a delivery and returns every completed segment.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ProtocolViolation`] if `lsn` is not the
    /// expected next address; nothing is buffered in that case.
    pub fn push(&mut self, lsn: Lsn, data: &[u8]) -> AgentResult<Vec<UploadUnit>> {
        let expected = self.next_lsn();
        if lsn != expected {
            return Err(AgentError::ProtocolViolation { got: lsn, expected });
        }
        self.buf.extend_from_slice(data);

        let mut units = Vec::new();
        while self.buf.len() as u64 >= SEGMENT_SIZE {
            let segment = self.buf.split_to(SEGMENT_SIZE as usize).freeze();
            units.push(UploadUnit {
                name: ObjectName::Wal {
                    lsn: self.cursor,
                    timeline: self.timeline,
                },
                data: segment,
            });
            self.cursor += SEGMENT_SIZE;
        }
        Ok(units)
    }
}

/// Accumulates one base backup and cuts it into parts.
#[derive(Debug)]
pub struct BaseChunker {
    base: BaseRef,
    part_size: usize,
    next_part: u64,
    buf: BytesMut,
}

impl BaseChunker {
    /// Creates a chunker for the backup identified by `base`.
    pub fn new(base: BaseRef, part_size: usize) -> Self {
        Self {
            base,
            part_size: part_size.max(1),
            next_part: 0,
            buf: BytesMut::new(),
        }
    }

    /// The backup being chunked.
    pub fn base(&self) -> BaseRef {
        self.base
    }

    /// Number of parts emitted so far.
    pub fn parts_emitted(&self) -> u64 {
        self.next_part
    }

    /// Bytes buffered for the next part.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Appends archive bytes and returns every completed part.
    pub fn push(&mut self, data: &[u8]) -> Vec<UploadUnit> {
        self.buf.extend_from_slice(data);
        let mut units = Vec::new();
        while self.buf.len() >= self.part_size {
            let part = self.buf.split_to(self.part_size).freeze();
            units.push(UploadUnit {
                name: self.base.part_name(self.next_part),
                data: part,
            });
            self.next_part += 1;
        }
        units
    }

    /// Ends the backup, returning its final `.base` object.
    pub fn finish(self) -> UploadUnit {
        UploadUnit {
            name: self.base.final_name(),
            data: self.buf.freeze(),
        }
    }
}
