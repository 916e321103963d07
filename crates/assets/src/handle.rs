use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Raw cover bytes as returned by a resolver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetBlob {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl AssetBlob {
    pub fn new(mime_type: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self { mime_type: mime_type.into(), bytes: bytes.into() }
    }
}

struct HandleInner {
    id: u64,
    mime_type: String,
    bytes: Vec<u8>,
    released: AtomicBool,
}

/// A displayable reference to a resolved asset.
///
/// Clones share the same underlying resource. Once the owning cache releases
/// it, [`bytes()`](Self::bytes) returns `None` for every clone.
#[derive(Clone)]
pub struct AssetHandle {
    inner: Arc<HandleInner>,
}

impl AssetHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn mime_type(&self) -> &str {
        &self.inner.mime_type
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        if self.is_released() {
            return None;
        }
        Some(&self.inner.bytes)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}

impl PartialEq for AssetHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}
impl Eq for AssetHandle {}

impl fmt::Debug for AssetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetHandle")
            .field("id", &self.inner.id)
            .field("mime_type", &self.inner.mime_type)
            .field("len", &self.inner.bytes.len())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Issues and releases [`AssetHandle`]s, keeping count of both.
///
/// `acquired() - released()` is the number of live handles; after a cache has
/// shut down it is zero.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    next_id: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl HandleRegistry {
    pub fn acquire(&self, blob: AssetBlob) -> AssetHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.acquired.fetch_add(1, Ordering::AcqRel);
        AssetHandle {
            inner: Arc::new(HandleInner {
                id,
                mime_type: blob.mime_type,
                bytes: blob.bytes,
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Release a handle. Returns `false` if it had already been released.
    pub fn release(&self, handle: &AssetHandle) -> bool {
        if handle.inner.released.swap(true, Ordering::AcqRel) {
            tracing::warn!(handle = handle.id(), "Asset handle released twice");
            return false;
        }
        self.released.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    pub fn live(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }
}
