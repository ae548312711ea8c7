//! # Partition Configuration and Lifecycle
//!
//! [`StoreConfig`] is a plain value describing a partition before it is
//! opened: working directory, suffix, cache sizing, durability mode, and
//! the set of attributes to keep user indices on. It is consumed by
//! `DitStore::new`; after `init` the configuration is frozen — there are
//! no setters left to call, and reconfiguration means building a new
//! store.
//!
//! [`Lifecycle`] is the small initialized-flag helper the store composes
//! instead of inheriting: it turns out-of-order lifecycle calls into the
//! stable `NotInitialized` / `AlreadyInitialized` errors.

pub mod constants;

use std::path::PathBuf;
use std::sync::Arc;

use eyre::Result;

use crate::entry::Entry;
use crate::error::StoreError;
use crate::schema::SchemaRegistry;
use constants::{DEFAULT_CACHE_SIZE, DEFAULT_DUPLICATE_LIMIT, DEFAULT_INDEX_CACHE_SIZE};

/// Per-attribute index tuning.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    attribute: String,
    cache_size: usize,
    duplicate_limit: usize,
}

impl IndexConfig {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            cache_size: DEFAULT_INDEX_CACHE_SIZE,
            duplicate_limit: DEFAULT_DUPLICATE_LIMIT,
        }
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_duplicate_limit(mut self, duplicate_limit: usize) -> Self {
        self.duplicate_limit = duplicate_limit.max(1);
        self
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn duplicate_limit(&self) -> usize {
        self.duplicate_limit
    }
}

/// Everything a partition needs to open.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    working_directory: PathBuf,
    suffix_dn: String,
    name: String,
    cache_size: usize,
    sync_on_write: bool,
    context_entry: Option<Entry>,
    indexed_attributes: Vec<IndexConfig>,
    schema: Arc<SchemaRegistry>,
}

impl StoreConfig {
    pub fn new(working_directory: impl Into<PathBuf>, suffix_dn: impl Into<String>) -> Self {
        Self {
            working_directory: working_directory.into(),
            suffix_dn: suffix_dn.into(),
            name: String::new(),
            cache_size: DEFAULT_CACHE_SIZE,
            sync_on_write: true,
            context_entry: None,
            indexed_attributes: Vec::new(),
            schema: SchemaRegistry::core(),
        }
    }

    /// Diagnostic partition name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Commit after every mutation instead of on explicit sync.
    pub fn with_sync_on_write(mut self, sync_on_write: bool) -> Self {
        self.sync_on_write = sync_on_write;
        self
    }

    /// Entry used to synthesize the suffix when absent on disk.
    pub fn with_context_entry(mut self, entry: Entry) -> Self {
        self.context_entry = Some(entry);
        self
    }

    pub fn with_indexed_attribute(mut self, index: IndexConfig) -> Self {
        self.indexed_attributes.push(index);
        self
    }

    pub fn with_schema(mut self, schema: Arc<SchemaRegistry>) -> Self {
        self.schema = schema;
        self
    }

    pub fn working_directory(&self) -> &PathBuf {
        &self.working_directory
    }

    pub fn suffix_dn(&self) -> &str {
        &self.suffix_dn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn sync_on_write(&self) -> bool {
        self.sync_on_write
    }

    pub fn context_entry(&self) -> Option<&Entry> {
        self.context_entry.as_ref()
    }

    pub fn indexed_attributes(&self) -> &[IndexConfig] {
        &self.indexed_attributes
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }
}

/// Initialized-flag helper composed by the store.
#[derive(Debug, Default)]
pub struct Lifecycle {
    initialized: bool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }

    /// Fails with `NotInitialized` unless `init` has completed.
    pub fn check_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(StoreError::NotInitialized.into())
        }
    }

    /// Fails with `AlreadyInitialized` once `init` has completed.
    pub fn check_not_initialized(&self) -> Result<()> {
        if self.initialized {
            Err(StoreError::AlreadyInitialized.into())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_partition_defaults() {
        let config = StoreConfig::new("/tmp/p", "ou=system");
        assert_eq!(config.cache_size(), DEFAULT_CACHE_SIZE);
        assert!(config.sync_on_write());
        assert!(config.indexed_attributes().is_empty());

        let index = IndexConfig::new("cn");
        assert_eq!(index.cache_size(), DEFAULT_INDEX_CACHE_SIZE);
        assert_eq!(index.duplicate_limit(), DEFAULT_DUPLICATE_LIMIT);
    }

    #[test]
    fn lifecycle_flags_produce_stable_errors() {
        let mut lifecycle = Lifecycle::new();
        assert!(matches!(
            lifecycle.check_initialized().unwrap_err().downcast_ref(),
            Some(StoreError::NotInitialized)
        ));
        lifecycle.set_initialized(true);
        lifecycle.check_initialized().unwrap();
        assert!(matches!(
            lifecycle.check_not_initialized().unwrap_err().downcast_ref(),
            Some(StoreError::AlreadyInitialized)
        ));
    }
}
