//! # ditstore — Embedded Storage Engine for LDAP Directory Partitions
//!
//! ditstore persists directory entries keyed by an internal 64-bit id and
//! maintains the family of secondary indices that make hierarchical,
//! attribute-based, and alias-aware lookups efficient: normalized and
//! user-provided DN indices, a parent/child hierarchy index, an attribute
//! presence index, per-attribute user indices, and the three alias
//! tables with cycle and chain detection.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ditstore::{DitStore, Entry, IndexConfig, StoreConfig};
//!
//! let config = StoreConfig::new("./partition", "ou=system")
//!     .with_indexed_attribute(IndexConfig::new("cn"));
//! let mut store = DitStore::new(config);
//! store.init()?;
//!
//! let entry = Entry::with_attrs([
//!     ("objectClass", ["top", "person"].as_slice()),
//!     ("cn", ["alice"].as_slice()),
//!     ("sn", ["Smith"].as_slice()),
//! ]);
//! let id = store.add("cn=alice,ou=system", entry)?;
//! let fetched = store.lookup(id)?;
//! store.destroy()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------+
//! |        DitStore (coordinator)            |
//! +------------------------------------------+
//! | Master  |  ndn updn hierarchy presence   |
//! | table   |  alias oneAlias subAlias user* |
//! +------------------------------------------+
//! |   Table (duplicate-aware multimap)       |
//! +------------------------------------------+
//! |   BTree (slotted nodes, one per page)    |
//! +------------------------------------------+
//! |   RecordFile (pages, freelist, commit)   |
//! +------------------------------------------+
//! |   PagedFile (mmap)                       |
//! +------------------------------------------+
//! ```
//!
//! ## File Layout
//!
//! ```text
//! working_directory/
//! ├── master.db                           # id -> serialized entry
//! ├── <oid>.fwd.db / <oid>.rev.db         # one pair per index
//! └── ...
//! ```
//!
//! ## Consistency Model
//!
//! The coordinator is the sole writer; mutations take `&mut self` and
//! update every affected index before the entry blob is written. Caller
//! errors are raised before any index mutation; a failure after writes
//! begin poisons the store until it is destroyed and re-initialized.
//! Durability is per-operation with `sync_on_write`, otherwise on
//! explicit [`DitStore::sync`] or destroy.

#[macro_use]
mod macros;

pub mod btree;
pub mod cache;
pub mod config;
pub mod encoding;
pub mod entry;
pub mod error;
pub mod index;
pub mod master;
pub mod name;
pub mod schema;
pub mod storage;
pub mod store;

pub use config::{IndexConfig, Lifecycle, StoreConfig};
pub use entry::{Attribute, Entry, ModOp, Modification, Value};
pub use error::StoreError;
pub use index::{IdCursor, Index, IndexKey, KeyCursor};
pub use name::{Dn, Rdn};
pub use schema::{AttributeType, Normalizer, SchemaRegistry};
pub use store::DitStore;
