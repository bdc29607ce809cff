//! Main crate Error

use crate::b_tree::b_node::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// For starter, to remove as code matures.
    #[error("Generic error: {0}")]
    Generic(String),
    /// For starter, to remove as code matures.
    #[error("Static error: {0}")]
    Static(&'static str),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("can't perform a write operation inside a read transaction")]
    WriteInsideReadTx,

    #[error("bad magic number {found:#010x}, the file is not a btree_kv database")]
    BadMagic { found: u32 },

    #[error("page {page} is out of bounds ({num_pages} pages in store)")]
    PageOutOfBounds { page: u64, num_pages: u64 },

    #[error("corrupted page {page}: {reason}")]
    CorruptedPage { page: u64, reason: &'static str },

    #[error("node on page {page} needs {needed} bytes but pages are {page_size} bytes")]
    NodeOverflow {
        page: u64,
        needed: usize,
        page_size: usize,
    },

    #[error("key of {0} bytes exceeds the {MAX_KEY_SIZE} byte limit")]
    KeyTooLarge(usize),

    #[error("value of {0} bytes exceeds the {MAX_VALUE_SIZE} byte limit")]
    ValueTooLarge(usize),

    #[error("entry of {size} bytes exceeds the {limit} byte limit for this page size")]
    EntryTooLarge { size: usize, limit: usize },

    #[error("collection {0:?} already exists")]
    CollectionAlreadyExists(String),

    #[error("{released} released pages do not fit the free list page (capacity {capacity})")]
    FreeListOverflow { released: usize, capacity: usize },

    #[error("invalid options: {0}")]
    InvalidOptions(String),
}
