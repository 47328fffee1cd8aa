//! Semantic write-ahead log.
//!
//! One record per committed write transaction: the commit epoch
//! followed by the logical mutations in application order. Framing is
//! little-endian throughout:
//!
//! ```text
//! file header   magic "SBLW" (4) | version u16 | reserved u16
//! record        payload_len u32 | crc32 u32 | payload
//! payload       epoch i64 | op_count u32 | ops...
//! ```
//!
//! Replay accepts the longest valid prefix: a short or CRC-failing
//! record ends the log, and the file is truncated back to the last good
//! record before new appends.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Result, SableError};
use crate::types::{Label, Timestamp, VertexId};

const WAL_MAGIC: [u8; 4] = *b"SBLW";
const WAL_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 8;
const RECORD_HEADER_LEN: usize = 8;

const OP_PUT_VERTEX: u8 = 1;
const OP_DEL_VERTEX: u8 = 2;
const OP_PUT_EDGE: u8 = 3;
const OP_DEL_EDGE: u8 = 4;

/// A logical mutation applied by a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WalOp {
    PutVertex {
        vertex: VertexId,
        data: Vec<u8>,
    },
    DelVertex {
        vertex: VertexId,
        recycle: bool,
    },
    PutEdge {
        src: VertexId,
        label: Label,
        dst: VertexId,
        data: Vec<u8>,
        force_insert: bool,
    },
    DelEdge {
        src: VertexId,
        label: Label,
        dst: VertexId,
    },
}

impl WalOp {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            WalOp::PutVertex { vertex, data } => {
                out.push(OP_PUT_VERTEX);
                out.extend_from_slice(&vertex.to_le_bytes());
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }
            WalOp::DelVertex { vertex, recycle } => {
                out.push(OP_DEL_VERTEX);
                out.extend_from_slice(&vertex.to_le_bytes());
                out.push(*recycle as u8);
            }
            WalOp::PutEdge {
                src,
                label,
                dst,
                data,
                force_insert,
            } => {
                out.push(OP_PUT_EDGE);
                out.extend_from_slice(&src.to_le_bytes());
                out.extend_from_slice(&label.to_le_bytes());
                out.extend_from_slice(&dst.to_le_bytes());
                out.push(*force_insert as u8);
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }
            WalOp::DelEdge { src, label, dst } => {
                out.push(OP_DEL_EDGE);
                out.extend_from_slice(&src.to_le_bytes());
                out.extend_from_slice(&label.to_le_bytes());
                out.extend_from_slice(&dst.to_le_bytes());
            }
        }
    }

    /// Decodes one op, returning it and the bytes consumed.
    fn decode(buf: &[u8]) -> Result<(WalOp, usize)> {
        let tag = *buf.first().ok_or(SableError::Corruption("wal op truncated"))?;
        let rest = &buf[1..];
        match tag {
            OP_PUT_VERTEX => {
                let vertex = read_u64(rest, 0)?;
                let len = read_u32(rest, 8)? as usize;
                let data = read_bytes(rest, 12, len)?;
                Ok((WalOp::PutVertex { vertex, data }, 1 + 12 + len))
            }
            OP_DEL_VERTEX => {
                let vertex = read_u64(rest, 0)?;
                let recycle = *rest.get(8).ok_or(SableError::Corruption("wal op truncated"))?;
                Ok((
                    WalOp::DelVertex {
                        vertex,
                        recycle: recycle != 0,
                    },
                    1 + 9,
                ))
            }
            OP_PUT_EDGE => {
                let src = read_u64(rest, 0)?;
                let label = read_u16(rest, 8)?;
                let dst = read_u64(rest, 10)?;
                let force = *rest.get(18).ok_or(SableError::Corruption("wal op truncated"))?;
                let len = read_u32(rest, 19)? as usize;
                let data = read_bytes(rest, 23, len)?;
                Ok((
                    WalOp::PutEdge {
                        src,
                        label,
                        dst,
                        data,
                        force_insert: force != 0,
                    },
                    1 + 23 + len,
                ))
            }
            OP_DEL_EDGE => {
                let src = read_u64(rest, 0)?;
                let label = read_u16(rest, 8)?;
                let dst = read_u64(rest, 10)?;
                Ok((WalOp::DelEdge { src, label, dst }, 1 + 18))
            }
            _ => Err(SableError::Corruption("unknown wal op tag")),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct WalRecord {
    pub epoch: Timestamp,
    pub ops: Vec<WalOp>,
}

impl WalRecord {
    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&self.epoch.to_le_bytes());
        payload.extend_from_slice(&(self.ops.len() as u32).to_le_bytes());
        for op in &self.ops {
            op.encode_into(&mut payload);
        }
        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    fn decode_payload(payload: &[u8]) -> Result<Self> {
        let epoch = i64::from_le_bytes(
            payload
                .get(0..8)
                .ok_or(SableError::Corruption("wal record truncated"))?
                .try_into()
                .unwrap(),
        );
        let count = read_u32(payload, 8)? as usize;
        let mut ops = Vec::with_capacity(count);
        let mut cursor = 12;
        for _ in 0..count {
            let (op, consumed) = WalOp::decode(&payload[cursor.min(payload.len())..])?;
            ops.push(op);
            cursor += consumed;
        }
        Ok(Self { epoch, ops })
    }
}

pub(crate) struct Wal {
    file: Mutex<File>,
    sync: bool,
}

impl Wal {
    /// Opens (or creates) the log and returns it along with every
    /// record in the valid prefix, truncating trailing garbage.
    pub fn open(path: &Path, sync: bool) -> Result<(Self, Vec<WalRecord>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();

        let mut records = Vec::new();
        let mut valid_up_to = FILE_HEADER_LEN as u64;
        if len < FILE_HEADER_LEN as u64 {
            let mut header = [0u8; FILE_HEADER_LEN];
            header[0..4].copy_from_slice(&WAL_MAGIC);
            header[4..6].copy_from_slice(&WAL_VERSION.to_le_bytes());
            file.set_len(0)?;
            file.write_all(&header)?;
        } else {
            let mut buf = Vec::with_capacity(len as usize);
            file.read_to_end(&mut buf)?;
            if buf[0..4] != WAL_MAGIC {
                return Err(SableError::Corruption("wal magic mismatch"));
            }
            if u16::from_le_bytes(buf[4..6].try_into().unwrap()) != WAL_VERSION {
                return Err(SableError::Corruption("wal version mismatch"));
            }
            let mut cursor = FILE_HEADER_LEN;
            loop {
                let Some(header) = buf.get(cursor..cursor + RECORD_HEADER_LEN) else {
                    break;
                };
                let payload_len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
                let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
                let Some(payload) =
                    buf.get(cursor + RECORD_HEADER_LEN..cursor + RECORD_HEADER_LEN + payload_len)
                else {
                    break;
                };
                if crc32fast::hash(payload) != crc {
                    break;
                }
                match WalRecord::decode_payload(payload) {
                    Ok(record) => records.push(record),
                    Err(_) => break,
                }
                cursor += RECORD_HEADER_LEN + payload_len;
                valid_up_to = cursor as u64;
            }
            if valid_up_to < len {
                warn!(
                    valid_up_to,
                    len, "truncating wal tail past last valid record"
                );
            }
            file.set_len(valid_up_to)?;
        }
        file.seek(SeekFrom::End(0))?;
        if !records.is_empty() {
            info!(records = records.len(), "loaded wal records for replay");
        }
        Ok((
            Self {
                file: Mutex::new(file),
                sync,
            },
            records,
        ))
    }

    pub fn append(&self, epoch: Timestamp, ops: &[WalOp]) -> Result<()> {
        let record = WalRecord {
            epoch,
            ops: ops.to_vec(),
        };
        let encoded = record.encode();
        let mut file = self.file.lock();
        file.write_all(&encoded)?;
        if self.sync {
            file.sync_data()?;
        }
        Ok(())
    }
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(
        buf.get(at..at + 2)
            .ok_or(SableError::Corruption("wal op truncated"))?
            .try_into()
            .unwrap(),
    ))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(
        buf.get(at..at + 4)
            .ok_or(SableError::Corruption("wal op truncated"))?
            .try_into()
            .unwrap(),
    ))
}

fn read_u64(buf: &[u8], at: usize) -> Result<u64> {
    Ok(u64::from_le_bytes(
        buf.get(at..at + 8)
            .ok_or(SableError::Corruption("wal op truncated"))?
            .try_into()
            .unwrap(),
    ))
}

fn read_bytes(buf: &[u8], at: usize, len: usize) -> Result<Vec<u8>> {
    Ok(buf
        .get(at..at + len)
        .ok_or(SableError::Corruption("wal op truncated"))?
        .to_vec())
}
