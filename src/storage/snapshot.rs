//! Checkpoint snapshots of the full store state.

use super::commit_log::{CommitFrame, LogOperation};
use crate::error::{BrokerError, Result};
use crate::types::MessageEnvelope;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

/// Magic bytes for snapshot file.
const SNAPSHOT_MAGIC: &[u8; 4] = b"SNP\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// Contents of one collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CollectionData {
    Queue(VecDeque<MessageEnvelope>),
    Dictionary(BTreeMap<String, Vec<u8>>),
}

/// Durable image of every collection.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreImage {
    /// Sequence of the last commit frame folded into this image.
    pub last_seq: u64,
    pub collections: BTreeMap<String, CollectionData>,
}

impl StoreImage {
    /// Apply a frame unless it is already part of the image.
    pub fn apply_frame(&mut self, frame: &CommitFrame) -> Result<()> {
        if frame.seq <= self.last_seq {
            return Ok(());
        }
        for op in &frame.operations {
            self.apply(op)?;
        }
        self.last_seq = frame.seq;
        Ok(())
    }

    fn apply(&mut self, op: &LogOperation) -> Result<()> {
        match op {
            LogOperation::CreateQueue { name } => {
                self.collections
                    .entry(name.clone())
                    .or_insert_with(|| CollectionData::Queue(VecDeque::new()));
            }
            LogOperation::CreateDictionary { name } => {
                self.collections
                    .entry(name.clone())
                    .or_insert_with(|| CollectionData::Dictionary(BTreeMap::new()));
            }
            LogOperation::RemoveCollection { name } => {
                self.collections.remove(name);
            }
            LogOperation::Enqueue { queue, envelope } => {
                self.queue_mut(queue)?.push_back(envelope.clone());
            }
            LogOperation::Dequeue { queue } => {
                if self.queue_mut(queue)?.pop_front().is_none() {
                    return Err(BrokerError::Corruption(format!(
                        "dequeue from empty queue {}",
                        queue
                    )));
                }
            }
            LogOperation::Set {
                dictionary,
                key,
                value,
            } => {
                self.dictionary_mut(dictionary)?
                    .insert(key.clone(), value.clone());
            }
            LogOperation::Remove { dictionary, key } => {
                self.dictionary_mut(dictionary)?.remove(key);
            }
        }
        Ok(())
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut VecDeque<MessageEnvelope>> {
        match self.collections.get_mut(name) {
            Some(CollectionData::Queue(queue)) => Ok(queue),
            Some(_) => Err(BrokerError::WrongCollectionKind(name.to_string())),
            None => Err(BrokerError::Corruption(format!("unknown queue {}", name))),
        }
    }

    fn dictionary_mut(&mut self, name: &str) -> Result<&mut BTreeMap<String, Vec<u8>>> {
        match self.collections.get_mut(name) {
            Some(CollectionData::Dictionary(dict)) => Ok(dict),
            Some(_) => Err(BrokerError::WrongCollectionKind(name.to_string())),
            None => Err(BrokerError::Corruption(format!("unknown dictionary {}", name))),
        }
    }
}

/// Write a snapshot atomically (temp file + rename).
pub fn save(path: &Path, image: &StoreImage) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;

        file.write_all(SNAPSHOT_MAGIC)?;
        file.write_all(&[SNAPSHOT_VERSION])?;

        let encoded = rmp_serde::to_vec(image)?;
        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;

        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a snapshot, or None if there is none yet.
pub fn load(path: &Path) -> Result<Option<StoreImage>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path)?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(BrokerError::InvalidFormat("Invalid snapshot magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != SNAPSHOT_VERSION {
        return Err(BrokerError::InvalidFormat(format!(
            "Unsupported snapshot version: {}",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes) as usize;

    let mut encoded = vec![0u8; len];
    file.read_exact(&mut encoded)?;

    let mut checksum_bytes = [0u8; 4];
    file.read_exact(&mut checksum_bytes)?;
    let expected = u32::from_le_bytes(checksum_bytes);
    let got = crc32fast::hash(&encoded);
    if expected != got {
        return Err(BrokerError::ChecksumMismatch { expected, got });
    }

    Ok(Some(rmp_serde::from_slice(&encoded)?))
}
