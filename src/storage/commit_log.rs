//! Commit log for crash recovery.
//!
//! Every committed transaction is appended as one frame holding all of its
//! redo operations, so a transaction is either fully present after a crash
//! or not at all. A torn frame at the tail is discarded on open.

use crate::error::{BrokerError, Result};
use crate::types::{MessageEnvelope, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for commit log file.
const LOG_MAGIC: &[u8; 4] = b"CLG\0";

/// Current commit log format version.
const LOG_VERSION: u8 = 1;

const HEADER_LEN: u64 = 5;

/// Upper bound for a single frame body.
const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// A redo operation recorded for a committed transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogOperation {
    CreateQueue { name: String },
    CreateDictionary { name: String },
    RemoveCollection { name: String },
    Enqueue { queue: String, envelope: MessageEnvelope },
    Dequeue { queue: String },
    Set { dictionary: String, key: String, value: Vec<u8> },
    Remove { dictionary: String, key: String },
}

/// One committed transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitFrame {
    /// Monotonic frame sequence number.
    pub seq: u64,
    /// Transaction that produced the frame.
    pub txn: u64,
    pub timestamp: Timestamp,
    pub operations: Vec<LogOperation>,
}

struct LogWriter {
    next_seq: u64,
    file: BufWriter<File>,
}

/// Append-only log of committed transactions.
pub struct CommitLog {
    path: PathBuf,
    sync_on_commit: bool,
    writer: Mutex<LogWriter>,
}

impl CommitLog {
    /// Create or open a commit log file.
    pub fn open(path: impl AsRef<Path>, sync_on_commit: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let next_seq = if path.exists() {
            let (frames, good_len) = Self::scan(&path)?;

            // Drop a torn tail so new frames are not written after garbage
            let file = OpenOptions::new().write(true).open(&path)?;
            if file.metadata()?.len() > good_len {
                tracing::warn!(path = %path.display(), good_len, "truncating torn commit log tail");
                file.set_len(good_len)?;
                file.sync_all()?;
            }

            frames.last().map(|f| f.seq + 1).unwrap_or(1)
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION])?;
            file.sync_all()?;
            1
        };

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok(Self {
            path,
            sync_on_commit,
            writer: Mutex::new(LogWriter {
                next_seq,
                file: BufWriter::new(file),
            }),
        })
    }

    /// Make sure the next frame gets at least `seq`.
    pub fn ensure_next_seq(&self, seq: u64) {
        let mut writer = self.writer.lock();
        writer.next_seq = writer.next_seq.max(seq);
    }

    /// Append a frame (returns its sequence number).
    pub fn append(&self, txn: u64, operations: Vec<LogOperation>) -> Result<u64> {
        let mut writer = self.writer.lock();
        let seq = writer.next_seq;

        let frame = CommitFrame {
            seq,
            txn,
            timestamp: Timestamp::now(),
            operations,
        };

        Self::write_frame(&mut writer.file, &frame)?;
        writer.file.flush()?;
        if self.sync_on_commit {
            writer.file.get_ref().sync_data()?;
        }

        writer.next_seq += 1;
        Ok(seq)
    }

    /// Read all intact frames.
    pub fn read_frames(&self) -> Result<Vec<CommitFrame>> {
        let _writer = self.writer.lock();
        Ok(Self::scan(&self.path)?.0)
    }

    /// Fold the log into something else, then truncate it.
    ///
    /// Appends are blocked while `fold` runs, so nothing committed after
    /// the read is lost by the truncation.
    pub fn compact<F>(&self, fold: F) -> Result<()>
    where
        F: FnOnce(&[CommitFrame]) -> Result<()>,
    {
        let mut writer = self.writer.lock();
        writer.file.flush()?;

        let (frames, _) = Self::scan(&self.path)?;
        fold(&frames)?;

        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(HEADER_LEN)?;
        file.sync_all()?;

        writer.file = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        Ok(())
    }

    /// Size of the log file in bytes.
    pub fn len_bytes(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Read intact frames and the byte length they cover.
    fn scan(path: &Path) -> Result<(Vec<CommitFrame>, u64)> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(BrokerError::InvalidFormat("Invalid commit log magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(BrokerError::InvalidFormat(format!(
                "Unsupported commit log version: {}",
                version[0]
            )));
        }

        file.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut reader = BufReader::new(file);
        let mut frames = Vec::new();
        let mut good_len = HEADER_LEN;

        while let Ok((frame, size)) = Self::read_frame(&mut reader) {
            good_len += size;
            frames.push(frame);
        }

        Ok((frames, good_len))
    }

    fn write_frame(writer: &mut BufWriter<File>, frame: &CommitFrame) -> Result<()> {
        let encoded = rmp_serde::to_vec(frame)?;

        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;

        let checksum = crc32fast::hash(&encoded);
        writer.write_all(&checksum.to_le_bytes())?;

        Ok(())
    }

    fn read_frame(reader: &mut BufReader<File>) -> Result<(CommitFrame, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_FRAME_LEN {
            return Err(BrokerError::Corruption("Commit frame too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);

        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(BrokerError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let frame = rmp_serde::from_slice(&encoded)?;
        Ok((frame, (len + 8) as u64))
    }
}
