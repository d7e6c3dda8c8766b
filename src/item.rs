//! The disk engine's on-row/on-disk record, and the memory engine's node.

use std::time::Instant;

/// Whether values in a disk store may live inline in the row, as an external
/// file, or either depending on the item (see [`StorageType`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// Every value lives in `data/<filename>`; rows never carry `inline_data`.
    File,
    /// Every value lives in the `inline_data` column; rows never carry `filename`.
    Sqlite,
    /// Caller decides per item by supplying (or omitting) a filename.
    Mixed,
}

/// A single disk-engine entry: either inline (`value` set, `filename` unset)
/// or external (`filename` set, row holds only metadata).
#[derive(Debug, Clone)]
pub struct StorageItem {
    pub key: String,
    pub value: Vec<u8>,
    pub filename: Option<String>,
    pub size: u64,
    pub mod_time: i64,
    pub access_time: i64,
    pub extended_data: Option<Vec<u8>>,
}

impl StorageItem {
    pub fn is_external(&self) -> bool {
        self.filename.is_some()
    }
}

/// Metadata-only view of a [`StorageItem`], returned by `get_item_info`.
#[derive(Debug, Clone)]
pub struct StorageItemInfo {
    pub key: String,
    pub filename: Option<String>,
    pub size: u64,
    pub mod_time: i64,
    pub access_time: i64,
    pub extended_data: Option<Vec<u8>>,
}

/// The façade's unit of value in the memory tier: a decoded object plus its
/// optional extended-data sidecar, both already behind `Arc` so handing a
/// clone to a caller is a refcount bump rather than a copy.
pub struct Entry<T> {
    pub value: std::sync::Arc<T>,
    pub extended_data: Option<std::sync::Arc<Vec<u8>>>,
}

/// A node in the memory engine's intrusive LRU list.
///
/// `prev`/`next` are indexes into the engine's slab rather than raw pointers
/// or `Rc<RefCell<_>>`. The engine owns a `Vec<Slot>` and nodes reference
/// each other by index, which keeps `get`/`set`/`remove` free of borrow-checker
/// fights while staying safe code.
pub(crate) struct MemoryNode<V> {
    pub key: String,
    pub value: V,
    pub cost: u64,
    pub last_access: Instant,
    pub prev: Option<usize>,
    pub next: Option<usize>,
}
