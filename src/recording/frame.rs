use crc32c::crc32c;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAX_ENTRY_BYTES: usize = 256 * 1024 * 1024;
/// sequence + timestamp + entry type
const HEADER_BYTES: usize = 8 + 8 + 1;
const CRC_BYTES: usize = 4;

/// One length-prefixed, checksummed entry of a recording file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFrame {
    pub sequence: u64,
    pub timestamp_micros: u64,
    pub entry_type: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("recording ends inside an entry")]
    Truncated,
    #[error("recording entry failed its checksum")]
    Corrupt,
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for FrameError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

fn read_exact_or_truncated(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), FrameError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FrameError::Truncated,
        _ => FrameError::Io(e.to_string()),
    })
}

pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Layout: `len:u32 | sequence:u64 | timestamp:u64 | type:u8 | payload |
    /// crc32c:u32`, big endian; the checksum covers everything before it.
    pub fn append(&mut self, frame: &RecordFrame) -> Result<(), FrameError> {
        let body_len = HEADER_BYTES + frame.payload.len() + CRC_BYTES;
        if body_len > MAX_ENTRY_BYTES {
            return Err(FrameError::Corrupt);
        }
        let len = u32::try_from(body_len).map_err(|_| FrameError::Corrupt)?;
        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&frame.sequence.to_be_bytes());
        buf.extend_from_slice(&frame.timestamp_micros.to_be_bytes());
        buf.push(frame.entry_type);
        buf.extend_from_slice(&frame.payload);
        let crc = crc32c(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        self.inner.write_all(&buf)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), FrameError> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// `Ok(None)` only at a clean entry boundary.
    pub fn next_frame(&mut self) -> Result<Option<RecordFrame>, FrameError> {
        let mut len_buf = [0u8; 4];
        if self.inner.read(&mut len_buf[..1])? == 0 {
            return Ok(None);
        }
        read_exact_or_truncated(&mut self.inner, &mut len_buf[1..])?;
        let body_len = u32::from_be_bytes(len_buf) as usize;
        if !(HEADER_BYTES + CRC_BYTES..=MAX_ENTRY_BYTES).contains(&body_len) {
            return Err(FrameError::Corrupt);
        }

        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&len_buf);
        buf.resize(4 + body_len, 0);
        read_exact_or_truncated(&mut self.inner, &mut buf[4..])?;

        let crc_at = buf.len() - CRC_BYTES;
        let (covered, stored) = buf.split_at(crc_at);
        let stored = u32::from_be_bytes(stored.try_into().map_err(|_| FrameError::Corrupt)?);
        if crc32c(covered) != stored {
            return Err(FrameError::Corrupt);
        }
        let header = &covered[4..4 + HEADER_BYTES];
        let sequence =
            u64::from_be_bytes(header[0..8].try_into().map_err(|_| FrameError::Corrupt)?);
        let timestamp_micros =
            u64::from_be_bytes(header[8..16].try_into().map_err(|_| FrameError::Corrupt)?);
        Ok(Some(RecordFrame {
            sequence,
            timestamp_micros,
            entry_type: header[16],
            payload: covered[4 + HEADER_BYTES..].to_vec(),
        }))
    }
}
