//! # Storage Layer
//!
//! The record manager and its supporting pieces: a memory-mapped paged
//! file, zerocopy page and file headers, and a free-page chain. Everything
//! above this layer (B+trees, tables, indices) addresses storage purely by
//! page number.
//!
//! ```text
//! +-------------------------------+
//! |  Table / Index / Master       |
//! +-------------------------------+
//! |  BTree (one node per page)    |
//! +-------------------------------+
//! |  RecordFile (alloc/free/commit)
//! +-------------------------------+
//! |  PagedFile (mmap)             |
//! +-------------------------------+
//! ```
//!
//! One `RecordFile` exists per on-disk file: `master.db` plus a forward
//! and reverse file per index, named by attribute OID.

mod headers;
mod mmap;
mod page;
mod recfile;

pub use headers::{StoreFileHeader, CURRENT_VERSION, FILE_MAGIC};
pub use mmap::PagedFile;
pub use page::{validate_page, PageHeader, PageType};
pub use recfile::RecordFile;

pub use crate::config::constants::{
    FILE_HEADER_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_USABLE_SIZE,
};
