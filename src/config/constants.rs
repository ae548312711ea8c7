//! # Storage Engine Constants
//!
//! Central home for the constants that define the on-disk layout and the
//! default tuning knobs. Values that derive from each other are co-located
//! and checked with compile-time assertions so a change to one cannot
//! silently invalidate another.
//!
//! ## Layout constants
//!
//! ```text
//! PAGE_SIZE (16384 bytes)
//!       |
//!       +--> PAGE_HEADER_SIZE (16 bytes, every page)
//!       |
//!       +--> PAGE_USABLE_SIZE (derived: PAGE_SIZE - PAGE_HEADER_SIZE)
//!       |
//!       +--> FILE_HEADER_SIZE (128 bytes, page 0 only)
//! ```
//!
//! Page 0 of every record file is reserved for the file header; B+tree
//! nodes and free pages start at page 1.
//!
//! ## Tuning defaults
//!
//! - `DEFAULT_CACHE_SIZE`: record-manager cache budget, also the default
//!   for per-index key caches when no per-index value is configured.
//! - `DEFAULT_INDEX_CACHE_SIZE`: per-index normalized-key cache entries.
//! - `DEFAULT_DUPLICATE_LIMIT`: number of ids stored inline under a single
//!   index key before the value list is promoted to a nested B+tree.

/// Size of every page in a record file, in bytes.
pub const PAGE_SIZE: usize = 16384;

/// Size of the header at the start of every page.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Space available to cell data in a page after the page header.
pub const PAGE_USABLE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Size of the file header occupying the start of page 0.
pub const FILE_HEADER_SIZE: usize = 128;

const _: () = assert!(PAGE_USABLE_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE);
const _: () = assert!(FILE_HEADER_SIZE <= PAGE_SIZE);
const _: () = assert!(PAGE_HEADER_SIZE <= FILE_HEADER_SIZE);

/// Default record-manager cache budget (entries), matching the partition
/// default when no `cache_size` is configured.
pub const DEFAULT_CACHE_SIZE: usize = 10_000;

/// Default per-index normalized-key cache size.
pub const DEFAULT_INDEX_CACHE_SIZE: usize = 100;

/// Default duplicate limit: ids per key kept as an inline sorted array
/// before promotion to a nested B+tree.
pub const DEFAULT_DUPLICATE_LIMIT: usize = 512;

/// Reserved parent id for the partition suffix. No entry ever receives
/// this id; master ids start at [`FIRST_ENTRY_ID`].
pub const ROOT_PARENT_ID: u64 = 0;

/// First id handed out by the master table.
pub const FIRST_ENTRY_ID: u64 = 1;

const _: () = assert!(FIRST_ENTRY_ID > ROOT_PARENT_ID);
