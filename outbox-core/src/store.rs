//! Queue storage for pending requests.
//!
//! [`QueueStore`] is the one storage interface every queue codes against.
//! Three backends implement it:
//!
//! - [`FileQueueStore`]: durable, one JSON file per item, used by the worker
//! - [`MemoryQueueStore`]: in-process, for tests and best-effort holding
//! - [`BlobQueueStore`]: a single JSON array in synchronous page storage
//!
//! ## Deletion contract
//!
//! Any context may call [`QueueStore::enqueue`]. Only the flush controller
//! calls [`QueueStore::remove`] and [`QueueStore::update`]. The stores do not
//! enforce this; callers honour it so that no general transaction protocol
//! is needed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::request::{IdempotencyKey, QueuedRequest};
use crate::storage::KeyValueStorage;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An item with this key is already queued.
    #[error("Duplicate key: {0}")]
    Duplicate(String),
    /// The item to update is not in the store.
    #[error("Key not found: {0}")]
    NotFound(String),
    /// The store refused the write because it is full.
    #[error("Storage quota exceeded (limit {limit})")]
    QuotaExceeded {
        /// The configured limit that was hit.
        limit: usize,
    },
    /// The backing storage is not available in this context.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    /// An I/O error occurred during persistence.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Persistent FIFO of pending requests, addressable by key.
pub trait QueueStore: Send + Sync {
    /// Append an item at the tail.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] if the key is already queued, or an
    /// I/O / quota error if the write fails.
    fn enqueue(&self, item: QueuedRequest) -> Result<(), StoreError>;

    /// All items in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn list_all(&self) -> Result<Vec<QueuedRequest>, StoreError>;

    /// Replace the stored copy of an existing item without moving it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the key is not queued.
    fn update(&self, item: &QueuedRequest) -> Result<(), StoreError>;

    /// Remove an item. Removing an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be modified.
    fn remove(&self, key: &IdempotencyKey) -> Result<(), StoreError>;

    /// Number of queued items.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.list_all()?.len())
    }

    /// Drop every queued item.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be modified.
    fn clear(&self) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// Durable store keeping one JSON file per queued item.
///
/// Files are named `{sequence:020}-{key}.json`; the sequence number is the
/// item's arena index and fixes its position, so FIFO order survives process
/// restarts. The directory is the source of truth and is rescanned on every
/// operation.
///
/// Appends are serialized only among one handle and its clones. Two handles
/// opened separately on the same directory, in one process or two, can pick
/// the same sequence number and fall back to key order. Let a single process
/// own the directory.
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    dir: PathBuf,
    max_items: Option<usize>,
    guard: Arc<Mutex<()>>,
}

struct StoredEntry {
    seq: u64,
    path: PathBuf,
    item: QueuedRequest,
}

impl FileQueueStore {
    /// Open a store in `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_items: None,
            guard: Arc::new(Mutex::new(())),
        })
    }

    /// Cap the number of items the store accepts.
    #[must_use]
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    /// The directory backing this store.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.guard
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Read every item file, ordered by sequence number.
    fn scan(&self) -> Result<Vec<StoredEntry>, StoreError> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(seq) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.split('-').next())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<QueuedRequest>(&contents) {
                Ok(item) => entries.push(StoredEntry { seq, path, item }),
                Err(e) => {
                    tracing::warn!("Skipping unreadable queue file {}: {e}", path.display());
                }
            }
        }
        entries.sort_by(|a, b| a.seq.cmp(&b.seq).then_with(|| a.item.key.cmp(&b.item.key)));
        Ok(entries)
    }

    fn write_atomic(path: &Path, item: &QueuedRequest) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(item)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl QueueStore for FileQueueStore {
    fn enqueue(&self, item: QueuedRequest) -> Result<(), StoreError> {
        let _guard = self.lock();
        let entries = self.scan()?;
        if entries.iter().any(|e| e.item.key == item.key) {
            return Err(StoreError::Duplicate(item.key.to_string()));
        }
        if let Some(limit) = self.max_items {
            if entries.len() >= limit {
                return Err(StoreError::QuotaExceeded { limit });
            }
        }
        let seq = entries.last().map_or(0, |e| e.seq + 1);
        let path = self.dir.join(format!(
            "{seq:020}-{}.json",
            sanitize_filename(item.key.as_str())
        ));
        Self::write_atomic(&path, &item)
    }

    fn list_all(&self) -> Result<Vec<QueuedRequest>, StoreError> {
        let _guard = self.lock();
        Ok(self.scan()?.into_iter().map(|e| e.item).collect())
    }

    fn update(&self, item: &QueuedRequest) -> Result<(), StoreError> {
        let _guard = self.lock();
        let entry = self
            .scan()?
            .into_iter()
            .find(|e| e.item.key == item.key)
            .ok_or_else(|| StoreError::NotFound(item.key.to_string()))?;
        Self::write_atomic(&entry.path, item)
    }

    fn remove(&self, key: &IdempotencyKey) -> Result<(), StoreError> {
        let _guard = self.lock();
        for entry in self.scan()?.into_iter().filter(|e| &e.item.key == key) {
            match std::fs::remove_file(&entry.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn count(&self) -> Result<usize, StoreError> {
        let _guard = self.lock();
        Ok(self.scan()?.len())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock();
        for entry in self.scan()? {
            if let Err(e) = std::fs::remove_file(&entry.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-process store. Contents are lost when the process exits.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    items: Arc<RwLock<Vec<QueuedRequest>>>,
    max_items: Option<usize>,
}

impl MemoryQueueStore {
    /// Create an empty, unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store holding at most `max_items`.
    #[must_use]
    pub fn with_max_items(max_items: usize) -> Self {
        Self {
            items: Arc::default(),
            max_items: Some(max_items),
        }
    }
}

impl QueueStore for MemoryQueueStore {
    fn enqueue(&self, item: QueuedRequest) -> Result<(), StoreError> {
        let mut items = self
            .items
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if items.iter().any(|i| i.key == item.key) {
            return Err(StoreError::Duplicate(item.key.to_string()));
        }
        if let Some(limit) = self.max_items {
            if items.len() >= limit {
                return Err(StoreError::QuotaExceeded { limit });
            }
        }
        items.push(item);
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<QueuedRequest>, StoreError> {
        let items = self
            .items
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(items.clone())
    }

    fn update(&self, item: &QueuedRequest) -> Result<(), StoreError> {
        let mut items = self
            .items
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let slot = items
            .iter_mut()
            .find(|i| i.key == item.key)
            .ok_or_else(|| StoreError::NotFound(item.key.to_string()))?;
        *slot = item.clone();
        Ok(())
    }

    fn remove(&self, key: &IdempotencyKey) -> Result<(), StoreError> {
        let mut items = self
            .items
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        items.retain(|i| &i.key != key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut items = self
            .items
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        items.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Blob store over synchronous page storage
// ---------------------------------------------------------------------------

/// Page-visible mirror of a queued request.
///
/// Serialized flat: the request's fields plus a `synced` flag the UI renders
/// as "queued" versus confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// The captured request.
    #[serde(flatten)]
    pub request: QueuedRequest,
    /// Whether the server has confirmed this operation.
    #[serde(default)]
    pub synced: bool,
}

impl PendingOperation {
    /// Wrap a captured request as not yet synced.
    #[must_use]
    pub fn new(request: QueuedRequest) -> Self {
        Self {
            request,
            synced: false,
        }
    }
}

/// A whole queue persisted as one JSON array under a single storage key.
///
/// Every mutation is a read-modify-write of the complete blob. Two contexts
/// writing the same key concurrently can lose each other's appends; this is
/// an accepted limitation of page-local storage.
#[derive(Debug, Clone)]
pub struct BlobQueueStore<S> {
    storage: S,
    storage_key: String,
}

impl<S: KeyValueStorage> BlobQueueStore<S> {
    /// Create a store persisting under `storage_key`.
    pub fn new(storage: S, storage_key: impl Into<String>) -> Self {
        Self {
            storage,
            storage_key: storage_key.into(),
        }
    }

    /// The storage key holding the blob.
    #[must_use]
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Read the persisted operations.
    ///
    /// A missing or unparseable value is treated as an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error only if the storage itself cannot be read.
    pub fn load(&self) -> Result<Vec<PendingOperation>, StoreError> {
        let Some(raw) = self.storage.get_item(&self.storage_key)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(ops) => Ok(ops),
            Err(e) => {
                tracing::warn!(
                    storage_key = %self.storage_key,
                    "Discarding unparseable queue blob: {e}"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Persist `ops` in a single write; an empty list removes the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage rejects the write.
    pub fn save(&self, ops: &[PendingOperation]) -> Result<(), StoreError> {
        if ops.is_empty() {
            return self.storage.remove_item(&self.storage_key);
        }
        let json = serde_json::to_string(ops)?;
        self.storage.set_item(&self.storage_key, &json)
    }
}

impl<S: KeyValueStorage> QueueStore for BlobQueueStore<S> {
    fn enqueue(&self, item: QueuedRequest) -> Result<(), StoreError> {
        let mut ops = self.load()?;
        if ops.iter().any(|op| op.request.key == item.key) {
            return Err(StoreError::Duplicate(item.key.to_string()));
        }
        ops.push(PendingOperation::new(item));
        self.save(&ops)
    }

    fn list_all(&self) -> Result<Vec<QueuedRequest>, StoreError> {
        Ok(self.load()?.into_iter().map(|op| op.request).collect())
    }

    fn update(&self, item: &QueuedRequest) -> Result<(), StoreError> {
        let mut ops = self.load()?;
        let slot = ops
            .iter_mut()
            .find(|op| op.request.key == item.key)
            .ok_or_else(|| StoreError::NotFound(item.key.to_string()))?;
        slot.request = item.clone();
        self.save(&ops)
    }

    fn remove(&self, key: &IdempotencyKey) -> Result<(), StoreError> {
        let mut ops = self.load()?;
        let before = ops.len();
        ops.retain(|op| &op.request.key != key);
        if ops.len() == before {
            return Ok(());
        }
        self.save(&ops)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.storage.remove_item(&self.storage_key)
    }
}

/// Sanitize a key for use as a filename.
///
/// Replaces any character that is not alphanumeric, `-`, or `_` with `_`.
pub(crate) fn sanitize_filename(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
