//! Self-contained segment file written by the indexer for one chunk.
//!
//! Layout: a 5-byte file header (magic + version) followed by framed records.
//! Each frame is `[len: u32 LE][crc32: u32 LE][payload]`, the payload being
//! one JSON-encoded [`LogMessage`]. A torn trailing frame is dropped on
//! recovery; a bad file header is corruption.

use crate::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

const MAGIC: &[u8; 4] = b"SLSG";
const VERSION: u8 = 1;
const FILE_HEADER_LEN: usize = 5;
const FRAME_HEADER_LEN: usize = 8;

/// One log record as handed to the indexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub id: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// A segment after sealing: immutable bytes plus their content hash.
#[derive(Debug, Clone)]
pub struct SealedSegment {
    pub path: PathBuf,
    pub content_hash: String,
    pub size_bytes: u64,
    pub message_count: u64,
    pub bytes: Bytes,
}

/// Indexing engine seam: append records, then seal into a file that can be
/// served on its own.
#[async_trait]
pub trait IndexWriter: Send + Sync {
    /// Append one record, returning the bytes it added to the chunk.
    async fn append(&mut self, message: &LogMessage) -> Result<u64>;

    /// Flush and fsync, then hash the finished file. No appends after this.
    async fn seal(&mut self) -> Result<SealedSegment>;
}

/// Append-only segment writer.
pub struct SegmentWriter {
    path: PathBuf,
    file: File,
    message_count: u64,
    sealed: bool,
}

impl SegmentWriter {
    /// Create a new segment, failing if the file already exists.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await?;
        let mut header = [0u8; FILE_HEADER_LEN];
        header[0..4].copy_from_slice(MAGIC);
        header[4] = VERSION;
        file.write_all(&header).await?;
        Ok(Self {
            path,
            file,
            message_count: 0,
            sealed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for every appended frame to reach the file.
    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl IndexWriter for SegmentWriter {
    async fn append(&mut self, message: &LogMessage) -> Result<u64> {
        if self.sealed {
            return Err(Error::Internal(format!(
                "append to sealed segment {}",
                self.path.display()
            )));
        }
        let frame = encode_frame(message)?;
        self.file.write_all(&frame).await?;
        self.message_count += 1;
        Ok(frame.len() as u64)
    }

    async fn seal(&mut self) -> Result<SealedSegment> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        self.sealed = true;
        let bytes = Bytes::from(fs::read(&self.path).await?);
        Ok(SealedSegment {
            path: self.path.clone(),
            content_hash: content_hash(&bytes),
            size_bytes: bytes.len() as u64,
            message_count: self.message_count,
            bytes,
        })
    }
}

/// Hex blake3 digest of a sealed file.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn encode_frame(message: &LogMessage) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(message)?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&hasher.finalize().to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Result of scanning a segment: every intact record and where they end.
struct Scan {
    messages: Vec<LogMessage>,
    valid_len: usize,
}

fn scan(bytes: &[u8], origin: &str) -> Result<Scan> {
    if bytes.len() < FILE_HEADER_LEN || &bytes[0..4] != MAGIC {
        return Err(Error::Corruption(format!("{}: bad segment header", origin)));
    }
    if bytes[4] != VERSION {
        return Err(Error::Corruption(format!(
            "{}: unsupported segment version {}",
            origin, bytes[4]
        )));
    }

    let mut messages = Vec::new();
    let mut offset = FILE_HEADER_LEN;
    while offset < bytes.len() {
        let Some(header) = bytes.get(offset..offset + FRAME_HEADER_LEN) else {
            warn!(origin, records = messages.len(), "Truncated frame header, treating as crash point");
            break;
        };
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let start = offset + FRAME_HEADER_LEN;
        let Some(payload) = bytes.get(start..start + len) else {
            warn!(origin, records = messages.len(), "Truncated frame payload, discarding");
            break;
        };
        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != expected_crc {
            warn!(origin, records = messages.len(), "Frame CRC mismatch, discarding trailing data");
            break;
        }
        let message: LogMessage = serde_json::from_slice(payload)
            .map_err(|e| Error::Corruption(format!("{}: undecodable record: {}", origin, e)))?;
        messages.push(message);
        offset = start + len;
    }
    Ok(Scan {
        messages,
        valid_len: offset,
    })
}

/// Decode a sealed segment. Any damage is corruption.
pub fn decode_segment(bytes: &[u8]) -> Result<Vec<LogMessage>> {
    let scan = scan(bytes, "segment")?;
    if scan.valid_len != bytes.len() {
        return Err(Error::Corruption(format!(
            "segment has {} trailing bytes after {} records",
            bytes.len() - scan.valid_len,
            scan.messages.len()
        )));
    }
    Ok(scan.messages)
}

/// Seal a segment left behind by a crash: drop any torn tail, fsync, hash.
pub async fn recover_segment(path: &Path) -> Result<SealedSegment> {
    let raw = fs::read(path).await?;
    let origin = path.display().to_string();
    let scan = scan(&raw, &origin)?;
    let message_count = scan.messages.len() as u64;
    if scan.valid_len < raw.len() {
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(scan.valid_len as u64).await?;
        file.sync_all().await?;
    }
    let bytes = Bytes::copy_from_slice(&raw[..scan.valid_len]);
    Ok(SealedSegment {
        path: path.to_path_buf(),
        content_hash: content_hash(&bytes),
        size_bytes: bytes.len() as u64,
        message_count,
        bytes,
    })
}
