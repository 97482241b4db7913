//! Storage collaborator boundary.
//!
//! The engine persists serialized node versions through a `StorageManager`
//! and treats page identifiers as stable opaque handles. Two
//! implementations are provided: a `HashMap`-backed `MemoryStorage` and a
//! paged `DiskStorage` that reads and writes one fixed-size page per call.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::types::{PageId, TreeError, TreeResult, NEW_PAGE};

/// Synchronous, blocking page storage. `write` with `NEW_PAGE` allocates a
/// fresh identifier; all failures surface verbatim to the caller, the
/// engine never retries.
pub trait StorageManager: Send + Sync {
    fn read(&self, id: PageId) -> TreeResult<Vec<u8>>;

    /// Store `data` at `id`, or at a freshly allocated page when `id` is
    /// `NEW_PAGE`. Returns the identifier actually written.
    fn write(&self, id: PageId, data: &[u8]) -> TreeResult<PageId>;

    fn delete(&self, id: PageId) -> TreeResult<()>;

    fn flush(&self) -> TreeResult<()> {
        Ok(())
    }
}

impl<S: StorageManager> StorageManager for std::sync::Arc<S> {
    fn read(&self, id: PageId) -> TreeResult<Vec<u8>> {
        (**self).read(id)
    }

    fn write(&self, id: PageId, data: &[u8]) -> TreeResult<PageId> {
        (**self).write(id, data)
    }

    fn delete(&self, id: PageId) -> TreeResult<()> {
        (**self).delete(id)
    }

    fn flush(&self) -> TreeResult<()> {
        (**self).flush()
    }
}

// ============================================================================
// In-memory storage
// ============================================================================

/// Heap-backed storage, mainly for tests and ephemeral indexes.
#[derive(Default)]
pub struct MemoryStorage {
    pages: RwLock<HashMap<PageId, Vec<u8>>>,
    next_id: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored pages.
    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.read().is_empty()
    }
}

impl StorageManager for MemoryStorage {
    fn read(&self, id: PageId) -> TreeResult<Vec<u8>> {
        self.pages
            .read()
            .get(&id)
            .cloned()
            .ok_or(TreeError::PageNotFound(id))
    }

    fn write(&self, id: PageId, data: &[u8]) -> TreeResult<PageId> {
        let id = if id == NEW_PAGE {
            self.next_id.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        };
        self.pages.write().insert(id, data.to_vec());
        Ok(id)
    }

    fn delete(&self, id: PageId) -> TreeResult<()> {
        self.pages
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(TreeError::PageNotFound(id))
    }
}

// ============================================================================
// Paged disk storage
// ============================================================================

/// Default page size (16KB).
pub const DEFAULT_PAGE_SIZE: usize = 16384;

const LENGTH_PREFIX: usize = 8;

/// File-backed storage with fixed-size pages, one seek and one read per
/// page access. Freed pages are recycled through a per-session free list.
pub struct DiskStorage {
    file: RwLock<File>,
    #[allow(dead_code)]
    path: PathBuf,
    page_size: usize,
    next_page: AtomicU64,
    free_pages: Mutex<Vec<PageId>>,
}

impl DiskStorage {
    /// Create a new storage file, truncating any existing content.
    pub fn create(path: &Path) -> TreeResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: RwLock::new(file),
            path: path.to_path_buf(),
            page_size: DEFAULT_PAGE_SIZE,
            next_page: AtomicU64::new(0),
            free_pages: Mutex::new(Vec::new()),
        })
    }

    /// Open an existing storage file.
    pub fn open(path: &Path) -> TreeResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        let pages = len.div_ceil(DEFAULT_PAGE_SIZE);
        Ok(Self {
            file: RwLock::new(file),
            path: path.to_path_buf(),
            page_size: DEFAULT_PAGE_SIZE,
            next_page: AtomicU64::new(pages as u64),
            free_pages: Mutex::new(Vec::new()),
        })
    }
}

impl StorageManager for DiskStorage {
    fn read(&self, id: PageId) -> TreeResult<Vec<u8>> {
        let offset = id * self.page_size as u64;
        let mut file = self.file.write();
        if offset >= file.metadata()?.len() {
            return Err(TreeError::PageNotFound(id));
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; self.page_size];
        file.read_exact(&mut buffer)?;
        let len = u64::from_le_bytes(buffer[..LENGTH_PREFIX].try_into().expect("prefix")) as usize;
        if len == 0 || len > self.page_size - LENGTH_PREFIX {
            return Err(TreeError::PageNotFound(id));
        }
        buffer.drain(..LENGTH_PREFIX);
        buffer.truncate(len);
        Ok(buffer)
    }

    fn write(&self, id: PageId, data: &[u8]) -> TreeResult<PageId> {
        if data.len() > self.page_size - LENGTH_PREFIX {
            return Err(TreeError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "record too large: {} bytes (page size {})",
                    data.len(),
                    self.page_size
                ),
            )));
        }
        let id = if id == NEW_PAGE {
            self.free_pages
                .lock()
                .pop()
                .unwrap_or_else(|| self.next_page.fetch_add(1, Ordering::Relaxed))
        } else {
            id
        };

        let mut page = Vec::with_capacity(self.page_size);
        page.extend_from_slice(&(data.len() as u64).to_le_bytes());
        page.extend_from_slice(data);
        page.resize(self.page_size, 0);

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(id * self.page_size as u64))?;
        file.write_all(&page)?;
        Ok(id)
    }

    fn delete(&self, id: PageId) -> TreeResult<()> {
        // Zero the length prefix so subsequent reads fail, then recycle.
        let mut file = self.file.write();
        let offset = id * self.page_size as u64;
        if offset >= file.metadata()?.len() {
            return Err(TreeError::PageNotFound(id));
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&[0u8; LENGTH_PREFIX])?;
        drop(file);
        self.free_pages.lock().push(id);
        Ok(())
    }

    fn flush(&self) -> TreeResult<()> {
        self.file.write().sync_all()?;
        Ok(())
    }
}
