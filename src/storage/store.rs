//! Transactional collection store.
//!
//! Collections are named queues of envelopes or dictionaries of encoded
//! values. A transaction locks every collection it touches until it commits
//! or is dropped, mutates in place, and keeps an undo log for rollback.
//! Committed changes are appended to the commit log as a single frame.

use super::commit_log::{CommitLog, LogOperation};
use super::snapshot::{self, CollectionData, StoreImage};
use crate::cancel::CancellationToken;
use crate::config::StoreConfig;
use crate::error::{BrokerError, Result};
use crate::types::MessageEnvelope;
use fs2::FileExt;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"SWB\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const COMMIT_LOG_FILE: &str = "commit.log";
const SNAPSHOT_FILE: &str = "snapshot.bin";

/// Granularity of lock waits, so cancellation is noticed promptly.
const LOCK_POLL: Duration = Duration::from_millis(10);

/// Kind of a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionKind {
    Queue,
    Dictionary,
}

impl CollectionKind {
    fn of(data: &CollectionData) -> Self {
        match data {
            CollectionData::Queue(_) => CollectionKind::Queue,
            CollectionData::Dictionary(_) => CollectionKind::Dictionary,
        }
    }

    fn empty(self) -> CollectionData {
        match self {
            CollectionKind::Queue => CollectionData::Queue(VecDeque::new()),
            CollectionKind::Dictionary => CollectionData::Dictionary(BTreeMap::new()),
        }
    }

    fn create_op(self, name: &str) -> LogOperation {
        let name = name.to_string();
        match self {
            CollectionKind::Queue => LogOperation::CreateQueue { name },
            CollectionKind::Dictionary => LogOperation::CreateDictionary { name },
        }
    }
}

struct Collection {
    data: CollectionData,
    /// Cleared when the collection is removed or its creation rolled back.
    live: bool,
}

type CollectionRef = Arc<Mutex<Collection>>;

/// Lock on a collection owned by the transaction rather than borrowed.
type CollectionGuard = ArcMutexGuard<RawMutex, Collection>;

/// Durable, transactional store of named collections.
pub struct StateStore {
    config: StoreConfig,

    /// All live collections by name.
    catalog: RwLock<HashMap<String, CollectionRef>>,

    /// None for in-memory stores.
    log: Option<CommitLog>,

    snapshot_path: Option<PathBuf>,

    /// Lock file for exclusive access.
    _lock_file: Option<File>,

    next_txn: AtomicU64,
}

impl StateStore {
    /// Open a store; in memory when `config.path` is None.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let dir = match config.path.clone() {
            Some(dir) => dir,
            None => return Ok(Self::from_image(config, StoreImage::default(), None, None, None)),
        };

        if dir.join("MANIFEST").exists() {
            Self::verify_manifest(&dir)?;
        } else {
            fs::create_dir_all(&dir)?;
            Self::write_manifest(&dir)?;
        }

        let lock_file = Self::acquire_lock(&dir)?;

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let mut image = snapshot::load(&snapshot_path)?.unwrap_or_default();
        let log = CommitLog::open(dir.join(COMMIT_LOG_FILE), config.sync_on_commit)?;

        let frames = log.read_frames()?;
        let mut replayed = 0usize;
        for frame in &frames {
            if frame.seq > image.last_seq {
                image.apply_frame(frame)?;
                replayed += 1;
            }
        }
        log.ensure_next_seq(image.last_seq + 1);

        tracing::info!(
            path = %dir.display(),
            collections = image.collections.len(),
            replayed,
            "opened state store"
        );

        Ok(Self::from_image(
            config,
            image,
            Some(log),
            Some(snapshot_path),
            Some(lock_file),
        ))
    }

    /// Open an in-memory store.
    pub fn in_memory() -> Self {
        Self::from_image(StoreConfig::in_memory(), StoreImage::default(), None, None, None)
    }

    fn from_image(
        config: StoreConfig,
        image: StoreImage,
        log: Option<CommitLog>,
        snapshot_path: Option<PathBuf>,
        lock_file: Option<File>,
    ) -> Self {
        let catalog = image
            .collections
            .into_iter()
            .map(|(name, data)| (name, Arc::new(Mutex::new(Collection { data, live: true }))))
            .collect();

        Self {
            config,
            catalog: RwLock::new(catalog),
            log,
            snapshot_path,
            _lock_file: lock_file,
            next_txn: AtomicU64::new(1),
        }
    }

    /// Whether commits survive a restart.
    pub fn is_durable(&self) -> bool {
        self.log.is_some()
    }

    /// Begin a transaction.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction::new(self, None)
    }

    /// Begin a transaction whose lock waits observe `token`.
    pub fn transaction_with_token(&self, token: CancellationToken) -> Transaction<'_> {
        Transaction::new(self, Some(token))
    }

    /// Run `f` in a transaction; commit on Ok, roll back on Err.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut tx = self.transaction();
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Like `with_transaction`, but lock waits give up once `token` fires.
    pub fn with_transaction_cancellable<T, F>(&self, token: &CancellationToken, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        token.check()?;
        let mut tx = self.transaction_with_token(token.clone());
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Names of collections starting with `prefix`, sorted.
    pub fn collection_names(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .catalog
            .read()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Whether a collection is currently in the catalog.
    pub fn contains_collection(&self, name: &str) -> bool {
        self.catalog.read().contains_key(name)
    }

    /// Length of a queue, or None if it does not exist.
    pub fn queue_len(&self, name: &str) -> Result<Option<u64>> {
        self.with_transaction(|tx| {
            if tx.contains(name)? {
                Ok(Some(tx.count(name)?))
            } else {
                Ok(None)
            }
        })
    }

    /// Fold the commit log into the snapshot and truncate the log.
    pub fn checkpoint(&self) -> Result<()> {
        let (log, path) = match (&self.log, &self.snapshot_path) {
            (Some(log), Some(path)) => (log, path),
            _ => return Ok(()),
        };

        let mut folded = 0usize;
        log.compact(|frames| {
            let mut image = snapshot::load(path)?.unwrap_or_default();
            for frame in frames {
                image.apply_frame(frame)?;
            }
            folded = frames.len();
            snapshot::save(path, &image)
        })?;

        tracing::info!(frames = folded, "checkpointed state store");
        Ok(())
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(BrokerError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(BrokerError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| BrokerError::Locked)?;

        Ok(lock_file)
    }
}

struct Held {
    collection: CollectionRef,
    guard: CollectionGuard,
}

enum Undo {
    Created(String),
    Enqueued(String),
    Dequeued(String, MessageEnvelope),
    Assigned {
        dictionary: String,
        key: String,
        previous: Option<Vec<u8>>,
    },
}

/// An open transaction. Dropping it without `commit` rolls it back.
pub struct Transaction<'s> {
    store: &'s StateStore,
    id: u64,
    token: Option<CancellationToken>,
    held: HashMap<String, Held>,
    undo: Vec<Undo>,
    redo: Vec<LogOperation>,
    removed: Vec<String>,
    done: bool,
}

impl<'s> Transaction<'s> {
    fn new(store: &'s StateStore, token: Option<CancellationToken>) -> Self {
        Self {
            store,
            id: store.next_txn.fetch_add(1, Ordering::SeqCst),
            token,
            held: HashMap::new(),
            undo: Vec::new(),
            redo: Vec::new(),
            removed: Vec::new(),
            done: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // --- Collections ---

    /// Whether `name` exists; locks it for this transaction if so.
    pub fn contains(&mut self, name: &str) -> Result<bool> {
        self.open_existing(name)
    }

    pub fn get_or_create_queue(&mut self, name: &str) -> Result<()> {
        self.get_or_create(name, CollectionKind::Queue)
    }

    pub fn get_or_create_dictionary(&mut self, name: &str) -> Result<()> {
        self.get_or_create(name, CollectionKind::Dictionary)
    }

    /// Remove a collection at commit. Returns false if it does not exist.
    pub fn remove_collection(&mut self, name: &str) -> Result<bool> {
        if !self.open_existing(name)? {
            return Ok(false);
        }
        self.removed.push(name.to_string());
        self.redo.push(LogOperation::RemoveCollection {
            name: name.to_string(),
        });
        Ok(true)
    }

    // --- Queues ---

    pub fn enqueue(&mut self, queue: &str, envelope: MessageEnvelope) -> Result<()> {
        self.queue_mut(queue)?.push_back(envelope.clone());
        self.undo.push(Undo::Enqueued(queue.to_string()));
        self.redo.push(LogOperation::Enqueue {
            queue: queue.to_string(),
            envelope,
        });
        Ok(())
    }

    /// Remove and return the head of the queue.
    pub fn try_dequeue(&mut self, queue: &str) -> Result<Option<MessageEnvelope>> {
        let head = self.queue_mut(queue)?.pop_front();
        if let Some(envelope) = &head {
            self.undo
                .push(Undo::Dequeued(queue.to_string(), envelope.clone()));
            self.redo.push(LogOperation::Dequeue {
                queue: queue.to_string(),
            });
        }
        Ok(head)
    }

    pub fn peek(&mut self, queue: &str) -> Result<Option<MessageEnvelope>> {
        Ok(self.queue_mut(queue)?.front().cloned())
    }

    pub fn count(&mut self, queue: &str) -> Result<u64> {
        Ok(self.queue_mut(queue)?.len() as u64)
    }

    /// All queued envelopes, head first.
    pub fn items(&mut self, queue: &str) -> Result<Vec<MessageEnvelope>> {
        Ok(self.queue_mut(queue)?.iter().cloned().collect())
    }

    // --- Dictionaries ---

    /// Read a value. A missing dictionary reads as a missing key.
    pub fn get(&mut self, dictionary: &str, key: &str) -> Result<Option<Vec<u8>>> {
        if !self.open_existing(dictionary)? {
            return Ok(None);
        }
        Ok(self.dictionary_mut(dictionary)?.get(key).cloned())
    }

    pub fn set(&mut self, dictionary: &str, key: &str, value: Vec<u8>) -> Result<()> {
        let previous = self
            .dictionary_mut(dictionary)?
            .insert(key.to_string(), value.clone());
        self.undo.push(Undo::Assigned {
            dictionary: dictionary.to_string(),
            key: key.to_string(),
            previous,
        });
        self.redo.push(LogOperation::Set {
            dictionary: dictionary.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Remove a key, returning the previous value.
    pub fn remove(&mut self, dictionary: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let previous = self.dictionary_mut(dictionary)?.remove(key);
        if previous.is_some() {
            self.undo.push(Undo::Assigned {
                dictionary: dictionary.to_string(),
                key: key.to_string(),
                previous: previous.clone(),
            });
            self.redo.push(LogOperation::Remove {
                dictionary: dictionary.to_string(),
                key: key.to_string(),
            });
        }
        Ok(previous)
    }

    /// Insert `add()` if the key is absent, otherwise replace with `update(current)`.
    pub fn add_or_update<A, U>(
        &mut self,
        dictionary: &str,
        key: &str,
        add: A,
        update: U,
    ) -> Result<Vec<u8>>
    where
        A: FnOnce() -> Result<Vec<u8>>,
        U: FnOnce(&[u8]) -> Result<Vec<u8>>,
    {
        let value = match self.get(dictionary, key)? {
            Some(current) => update(&current)?,
            None => add()?,
        };
        self.set(dictionary, key, value.clone())?;
        Ok(value)
    }

    /// Read a MessagePack-encoded value.
    pub fn get_value<T: DeserializeOwned>(&mut self, dictionary: &str, key: &str) -> Result<Option<T>> {
        match self.get(dictionary, key)? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write a MessagePack-encoded value, with named fields.
    pub fn set_value<T: Serialize>(&mut self, dictionary: &str, key: &str, value: &T) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(value)?;
        self.set(dictionary, key, bytes)
    }

    /// Typed `add_or_update`.
    pub fn add_or_update_value<T, A, U>(
        &mut self,
        dictionary: &str,
        key: &str,
        add: A,
        update: U,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        A: FnOnce() -> T,
        U: FnOnce(T) -> T,
    {
        let value = match self.get_value::<T>(dictionary, key)? {
            Some(current) => update(current),
            None => add(),
        };
        self.set_value(dictionary, key, &value)?;
        Ok(value)
    }

    // --- Completion ---

    /// Make all changes durable and visible, then release locks.
    pub fn commit(mut self) -> Result<()> {
        if !self.redo.is_empty() {
            if let Some(log) = &self.store.log {
                let operations = std::mem::take(&mut self.redo);
                log.append(self.id, operations)?;
            }
        }

        if !self.removed.is_empty() {
            let mut catalog = self.store.catalog.write();
            for name in &self.removed {
                if let Some(held) = self.held.get_mut(name) {
                    held.guard.live = false;
                    if catalog
                        .get(name)
                        .map(|c| Arc::ptr_eq(c, &held.collection))
                        .unwrap_or(false)
                    {
                        catalog.remove(name);
                    }
                }
            }
        }

        self.done = true;
        Ok(())
    }

    /// Discard all changes.
    pub fn abort(self) {}

    fn rollback(&mut self) {
        let undo = std::mem::take(&mut self.undo);
        for op in undo.into_iter().rev() {
            match op {
                Undo::Enqueued(name) => {
                    if let Some(CollectionData::Queue(queue)) = self.held_data(&name) {
                        queue.pop_back();
                    }
                }
                Undo::Dequeued(name, envelope) => {
                    if let Some(CollectionData::Queue(queue)) = self.held_data(&name) {
                        queue.push_front(envelope);
                    }
                }
                Undo::Assigned {
                    dictionary,
                    key,
                    previous,
                } => {
                    if let Some(CollectionData::Dictionary(dict)) = self.held_data(&dictionary) {
                        match previous {
                            Some(value) => {
                                dict.insert(key, value);
                            }
                            None => {
                                dict.remove(&key);
                            }
                        }
                    }
                }
                Undo::Created(name) => {
                    if let Some(held) = self.held.get_mut(&name) {
                        held.guard.live = false;
                        let mut catalog = self.store.catalog.write();
                        if catalog
                            .get(&name)
                            .map(|c| Arc::ptr_eq(c, &held.collection))
                            .unwrap_or(false)
                        {
                            catalog.remove(&name);
                        }
                    }
                }
            }
        }
    }

    // --- Locking ---

    fn held_data(&mut self, name: &str) -> Option<&mut CollectionData> {
        self.held.get_mut(name).map(|h| &mut h.guard.data)
    }

    fn lock(&self, name: &str, collection: &CollectionRef) -> Result<CollectionGuard> {
        if let Some(guard) = collection.try_lock_arc() {
            return Ok(guard);
        }

        let deadline = Instant::now() + self.store.config.lock_timeout;
        loop {
            if let Some(token) = &self.token {
                token.check()?;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BrokerError::LockTimeout(name.to_string()));
            }
            if let Some(guard) = collection.try_lock_arc_for((deadline - now).min(LOCK_POLL)) {
                return Ok(guard);
            }
        }
    }

    /// Lock an existing live collection. Returns false if there is none.
    fn open_existing(&mut self, name: &str) -> Result<bool> {
        if self.removed.iter().any(|n| n == name) {
            return Ok(false);
        }
        if self.held.contains_key(name) {
            return Ok(true);
        }

        loop {
            let found = self.store.catalog.read().get(name).cloned();
            let collection = match found {
                Some(collection) => collection,
                None => return Ok(false),
            };

            let guard = self.lock(name, &collection)?;
            if !guard.live {
                // Removed while we waited; the catalog no longer points at it
                continue;
            }

            self.held
                .insert(name.to_string(), Held { collection, guard });
            return Ok(true);
        }
    }

    fn get_or_create(&mut self, name: &str, kind: CollectionKind) -> Result<()> {
        if self.removed.iter().any(|n| n == name) {
            return Err(BrokerError::CollectionNotFound(name.to_string()));
        }

        loop {
            if self.open_existing(name)? {
                let data = self
                    .held_data(name)
                    .ok_or_else(|| BrokerError::CollectionNotFound(name.to_string()))?;
                if CollectionKind::of(data) != kind {
                    return Err(BrokerError::WrongCollectionKind(name.to_string()));
                }
                return Ok(());
            }

            let collection = Arc::new(Mutex::new(Collection {
                data: kind.empty(),
                live: true,
            }));
            let guard = collection.lock_arc();

            {
                let mut catalog = self.store.catalog.write();
                if catalog.contains_key(name) {
                    // Another transaction created it first
                    continue;
                }
                catalog.insert(name.to_string(), Arc::clone(&collection));
            }

            self.held
                .insert(name.to_string(), Held { collection, guard });
            self.undo.push(Undo::Created(name.to_string()));
            self.redo.push(kind.create_op(name));
            return Ok(());
        }
    }

    fn data_mut(&mut self, name: &str) -> Result<&mut CollectionData> {
        if !self.open_existing(name)? {
            return Err(BrokerError::CollectionNotFound(name.to_string()));
        }
        self.held_data(name)
            .ok_or_else(|| BrokerError::CollectionNotFound(name.to_string()))
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut VecDeque<MessageEnvelope>> {
        match self.data_mut(name)? {
            CollectionData::Queue(queue) => Ok(queue),
            CollectionData::Dictionary(_) => Err(BrokerError::WrongCollectionKind(name.to_string())),
        }
    }

    fn dictionary_mut(&mut self, name: &str) -> Result<&mut BTreeMap<String, Vec<u8>>> {
        match self.data_mut(name)? {
            CollectionData::Dictionary(dict) => Ok(dict),
            CollectionData::Queue(_) => Err(BrokerError::WrongCollectionKind(name.to_string())),
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    fn envelope(n: u8) -> MessageEnvelope {
        MessageEnvelope::raw("Order", vec![n])
    }

    #[test]
    fn test_commit_makes_changes_visible() {
        let store = StateStore::in_memory();
        store
            .with_transaction(|tx| {
                tx.get_or_create_queue("q")?;
                tx.enqueue("q", envelope(1))?;
                tx.enqueue("q", envelope(2))
            })
            .unwrap();

        assert_eq!(store.queue_len("q").unwrap(), Some(2));
        let head = store.with_transaction(|tx| tx.try_dequeue("q")).unwrap();
        assert_eq!(head, Some(envelope(1)));
    }

    #[test]
    fn test_drop_rolls_back() {
        let store = StateStore::in_memory();
        store
            .with_transaction(|tx| {
                tx.get_or_create_queue("q")?;
                tx.enqueue("q", envelope(1))
            })
            .unwrap();

        {
            let mut tx = store.transaction();
            assert_eq!(tx.try_dequeue("q").unwrap(), Some(envelope(1)));
            tx.enqueue("q", envelope(9)).unwrap();
            // dropped without commit
        }

        let items = store.with_transaction(|tx| tx.items("q")).unwrap();
        assert_eq!(items, vec![envelope(1)]);
    }

    #[test]
    fn test_rolled_back_creation_disappears() {
        let store = StateStore::in_memory();
        let result: Result<()> = store.with_transaction(|tx| {
            tx.get_or_create_dictionary("d")?;
            tx.set("d", "k", vec![1])?;
            Err(BrokerError::Cancelled)
        });
        assert!(result.is_err());
        assert!(!store.contains_collection("d"));
        assert_eq!(store.with_transaction(|tx| tx.get("d", "k")).unwrap(), None);
    }

    #[test]
    fn test_dictionary_ops() {
        let store = StateStore::in_memory();
        store
            .with_transaction(|tx| {
                tx.get_or_create_dictionary("d")?;
                tx.set("d", "a", vec![1])?;
                tx.add_or_update("d", "a", || Ok(vec![0]), |cur| Ok(vec![cur[0] + 1]))?;
                tx.add_or_update("d", "b", || Ok(vec![7]), |_| Ok(vec![0]))?;
                Ok(())
            })
            .unwrap();

        store
            .with_transaction(|tx| {
                assert_eq!(tx.get("d", "a")?, Some(vec![2]));
                assert_eq!(tx.get("d", "b")?, Some(vec![7]));
                assert_eq!(tx.remove("d", "b")?, Some(vec![7]));
                assert_eq!(tx.remove("d", "missing")?, None);
                Ok(())
            })
            .unwrap();

        assert_eq!(store.with_transaction(|tx| tx.get("d", "b")).unwrap(), None);
    }

    #[test]
    fn test_typed_values() {
        let store = StateStore::in_memory();
        let total = store
            .with_transaction(|tx| {
                tx.get_or_create_dictionary("counters")?;
                tx.add_or_update_value("counters", "hits", || 1u32, |n| n + 1)?;
                tx.add_or_update_value("counters", "hits", || 1u32, |n| n + 1)
            })
            .unwrap();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_wrong_kind() {
        let store = StateStore::in_memory();
        let result = store.with_transaction(|tx| {
            tx.get_or_create_queue("q")?;
            tx.get_or_create_dictionary("q")
        });
        assert!(matches!(result, Err(BrokerError::WrongCollectionKind(_))));
    }

    #[test]
    fn test_remove_collection() {
        let store = StateStore::in_memory();
        store
            .with_transaction(|tx| tx.get_or_create_queue("q"))
            .unwrap();

        let removed = store
            .with_transaction(|tx| {
                let removed = tx.remove_collection("q")?;
                assert!(!tx.contains("q")?);
                Ok(removed)
            })
            .unwrap();
        assert!(removed);
        assert!(!store.contains_collection("q"));

        let again = store.with_transaction(|tx| tx.remove_collection("q")).unwrap();
        assert!(!again);
    }

    #[test]
    fn test_enqueue_missing_queue() {
        let store = StateStore::in_memory();
        let result = store.with_transaction(|tx| tx.enqueue("nope", envelope(1)));
        assert!(matches!(result, Err(BrokerError::CollectionNotFound(_))));
    }

    #[test]
    fn test_lock_timeout() {
        let store = StateStore::open(StoreConfig {
            lock_timeout: Duration::from_millis(30),
            ..StoreConfig::in_memory()
        })
        .unwrap();
        store
            .with_transaction(|tx| tx.get_or_create_queue("q"))
            .unwrap();

        let mut holder = store.transaction();
        holder.enqueue("q", envelope(1)).unwrap();

        let result = thread::scope(|s| {
            s.spawn(|| store.with_transaction(|tx| tx.count("q")))
                .join()
                .unwrap()
        });
        assert!(matches!(result, Err(BrokerError::LockTimeout(_))));

        holder.commit().unwrap();
        assert_eq!(store.queue_len("q").unwrap(), Some(1));
    }

    #[test]
    fn test_cancelled_lock_wait() {
        let store = StateStore::in_memory();
        store
            .with_transaction(|tx| tx.get_or_create_queue("q"))
            .unwrap();

        let mut holder = store.transaction();
        holder.count("q").unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = store.with_transaction_cancellable(&token, |tx| tx.count("q"));
        assert!(matches!(result, Err(BrokerError::Cancelled)));
        drop(holder);
    }

    #[test]
    fn test_removed_collection_seen_as_missing_by_waiter() {
        let store = StateStore::in_memory();
        store
            .with_transaction(|tx| tx.get_or_create_queue("q"))
            .unwrap();

        let barrier = Barrier::new(2);
        thread::scope(|s| {
            let mut remover = store.transaction();
            remover.remove_collection("q").unwrap();

            let waiter = s.spawn(|| {
                barrier.wait();
                store.with_transaction(|tx| tx.contains("q"))
            });

            barrier.wait();
            thread::sleep(Duration::from_millis(20));
            remover.commit().unwrap();

            assert!(!waiter.join().unwrap().unwrap());
        });
    }

    #[test]
    fn test_durable_reopen() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path().join("state"));

        {
            let store = StateStore::open(config.clone()).unwrap();
            assert!(store.is_durable());
            store
                .with_transaction(|tx| {
                    tx.get_or_create_queue("q")?;
                    tx.get_or_create_queue("gone")?;
                    tx.enqueue("q", envelope(1))?;
                    tx.enqueue("q", envelope(2))
                })
                .unwrap();
            store
                .with_transaction(|tx| {
                    tx.try_dequeue("q")?;
                    tx.remove_collection("gone")
                })
                .unwrap();

            // Rolled back work never reaches the log
            let mut tx = store.transaction();
            tx.enqueue("q", envelope(3)).unwrap();
            tx.abort();
        }

        let store = StateStore::open(config).unwrap();
        assert_eq!(
            store.with_transaction(|tx| tx.items("q")).unwrap(),
            vec![envelope(2)]
        );
        assert!(!store.contains_collection("gone"));
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path().join("state"));
        let _first = StateStore::open(config.clone()).unwrap();
        assert!(matches!(StateStore::open(config), Err(BrokerError::Locked)));
    }

    #[test]
    fn test_checkpoint_then_reopen() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path().join("state"));

        {
            let store = StateStore::open(config.clone()).unwrap();
            store
                .with_transaction(|tx| {
                    tx.get_or_create_queue("q")?;
                    tx.enqueue("q", envelope(1))
                })
                .unwrap();
            store.checkpoint().unwrap();
            store
                .with_transaction(|tx| tx.enqueue("q", envelope(2)))
                .unwrap();
        }

        let store = StateStore::open(config).unwrap();
        assert_eq!(
            store.with_transaction(|tx| tx.items("q")).unwrap(),
            vec![envelope(1), envelope(2)]
        );
    }

    #[test]
    fn test_collection_names_by_prefix() {
        let store = StateStore::in_memory();
        store
            .with_transaction(|tx| {
                tx.get_or_create_dictionary("subscriptions/B")?;
                tx.get_or_create_dictionary("subscriptions/A")?;
                tx.get_or_create_queue("queues/1234/A")
            })
            .unwrap();

        assert_eq!(
            store.collection_names("subscriptions/"),
            vec!["subscriptions/A".to_string(), "subscriptions/B".to_string()]
        );
    }
}
