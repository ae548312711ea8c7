//! # Index
//!
//! An index is a pair of duplicate-aware tables over two record files,
//! named by the indexed attribute's OID:
//!
//! ```text
//! <oid>.fwd.db    key    -> {entry id}
//! <oid>.rev.db    entry id -> {key}
//! ```
//!
//! The two tables must stay in perfect correspondence: every mutation
//! writes both before returning, and a disagreement between them is
//! surfaced as [`StoreError::IndexInconsistent`] for the coordinator to
//! treat as fatal.
//!
//! Keys are typed: `Index<u64>` for the id-keyed system indices
//! (hierarchy and the scope-alias tables) and `Index<String>` for
//! everything keyed by DN strings, OIDs, or attribute values. String keys
//! pass through the attribute's equality normalizer, memoized by a SIEVE
//! cache sized from the index configuration.

use std::marker::PhantomData;
use std::path::Path;

use eyre::Result;
use parking_lot::Mutex;

use crate::btree::{MemberCursor, Table};
use crate::cache::SieveCache;
use crate::encoding::{decode_id, encode_id};
use crate::error::StoreError;
use crate::schema::{AttributeType, Normalizer};

/// Normalization context handed to key encoding.
pub struct NormContext<'a> {
    normalizer: Normalizer,
    cache: &'a Mutex<SieveCache<String, String>>,
}

/// A type usable as an index key: encodes to order-preserving bytes.
pub trait IndexKey: Sized {
    fn encode(&self, ctx: &NormContext<'_>) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self>;
}

impl IndexKey for u64 {
    fn encode(&self, _ctx: &NormContext<'_>) -> Vec<u8> {
        encode_id(*self).to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_id(bytes)
    }
}

impl IndexKey for String {
    fn encode(&self, ctx: &NormContext<'_>) -> Vec<u8> {
        if ctx.normalizer == Normalizer::Exact {
            return self.clone().into_bytes();
        }
        let mut cache = ctx.cache.lock();
        if let Some(normalized) = cache.get(self) {
            return normalized.clone().into_bytes();
        }
        let normalized = ctx.normalizer.normalize(self);
        cache.insert(self.clone(), normalized.clone());
        normalized.into_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(std::str::from_utf8(bytes)?.to_string())
    }
}

#[derive(Debug)]
pub struct Index<K: IndexKey> {
    attr: AttributeType,
    fwd: Table,
    rev: Table,
    cache: Mutex<SieveCache<String, String>>,
    _key: PhantomData<fn() -> K>,
}

impl<K: IndexKey> Index<K> {
    /// Opens (creating as needed) the forward/reverse file pair for
    /// `attr` under `dir`.
    pub fn open(
        dir: &Path,
        attr: AttributeType,
        cache_size: usize,
        duplicate_limit: usize,
    ) -> Result<Self> {
        let fwd = Table::open_or_create(
            dir.join(format!("{}.fwd.db", attr.oid())),
            duplicate_limit,
        )?;
        let rev = Table::open_or_create(
            dir.join(format!("{}.rev.db", attr.oid())),
            duplicate_limit,
        )?;
        Ok(Self {
            attr,
            fwd,
            rev,
            cache: Mutex::new(SieveCache::new(cache_size)),
            _key: PhantomData,
        })
    }

    pub fn attribute(&self) -> &AttributeType {
        &self.attr
    }

    fn encode_key(&self, key: &K) -> Vec<u8> {
        key.encode(&NormContext {
            normalizer: self.attr.equality(),
            cache: &self.cache,
        })
    }

    /// Adds the `(key, id)` tuple to both tables. Idempotent per pair.
    pub fn add(&mut self, key: &K, id: u64) -> Result<()> {
        let key_bytes = self.encode_key(key);
        let id_bytes = encode_id(id);
        let added_fwd = self.fwd.add(&key_bytes, &id_bytes)?;
        let added_rev = self.rev.add(&id_bytes, &key_bytes)?;
        if added_fwd != added_rev {
            return Err(StoreError::IndexInconsistent.into());
        }
        Ok(())
    }

    /// Drops one `(key, id)` tuple from both tables. A no-op when absent.
    pub fn drop_pair(&mut self, key: &K, id: u64) -> Result<()> {
        let key_bytes = self.encode_key(key);
        let id_bytes = encode_id(id);
        let dropped_fwd = self.fwd.drop_pair(&key_bytes, &id_bytes)?;
        let dropped_rev = self.rev.drop_pair(&id_bytes, &key_bytes)?;
        if dropped_fwd != dropped_rev {
            return Err(StoreError::IndexInconsistent.into());
        }
        Ok(())
    }

    /// Drops every tuple involving `id`, enumerating its keys through the
    /// reverse table.
    pub fn drop_all(&mut self, id: u64) -> Result<()> {
        let id_bytes = encode_id(id);

        let mut keys = Vec::new();
        {
            let mut members = self.rev.members(&id_bytes)?;
            while let Some(key_bytes) = members.next()? {
                keys.push(key_bytes);
            }
        }

        for key_bytes in &keys {
            if !self.fwd.drop_pair(key_bytes, &id_bytes)? {
                return Err(StoreError::IndexInconsistent.into());
            }
        }
        self.rev.drop_key(&id_bytes)?;
        Ok(())
    }

    /// Least id under `key`, if any.
    pub fn forward_lookup(&self, key: &K) -> Result<Option<u64>> {
        let key_bytes = self.encode_key(key);
        self.fwd.first_member(&key_bytes)?.map(|b| decode_id(&b)).transpose()
    }

    /// Least key held by `id`, if any.
    pub fn reverse_lookup(&self, id: u64) -> Result<Option<K>> {
        self.rev
            .first_member(&encode_id(id))?
            .map(|b| K::decode(&b))
            .transpose()
    }

    pub fn has_value(&self, key: &K, id: u64) -> Result<bool> {
        let key_bytes = self.encode_key(key);
        self.fwd.has(&key_bytes, &encode_id(id))
    }

    /// Total tuples in the index.
    pub fn count(&self) -> Result<u64> {
        self.fwd.count()
    }

    /// Tuples under one key.
    pub fn count_key(&self, key: &K) -> Result<u64> {
        let key_bytes = self.encode_key(key);
        self.fwd.count_key(&key_bytes)
    }

    /// Cursor over the ids under `key`, ascending.
    pub fn list(&self, key: &K) -> Result<IdCursor<'_>> {
        let key_bytes = self.encode_key(key);
        Ok(IdCursor {
            inner: self.fwd.members(&key_bytes)?,
        })
    }

    /// Ids under `key`, materialized.
    pub fn list_ids(&self, key: &K) -> Result<Vec<u64>> {
        let mut cursor = self.list(key)?;
        let mut ids = Vec::new();
        while let Some(id) = cursor.next()? {
            ids.push(id);
        }
        Ok(ids)
    }

    /// Cursor over the keys held by `id`, ascending.
    pub fn list_reverse(&self, id: u64) -> Result<KeyCursor<'_, K>> {
        Ok(KeyCursor {
            inner: self.rev.members(&encode_id(id))?,
            _key: PhantomData,
        })
    }

    /// Keys held by `id`, materialized.
    pub fn reverse_keys(&self, id: u64) -> Result<Vec<K>> {
        let mut cursor = self.list_reverse(id)?;
        let mut keys = Vec::new();
        while let Some(key) = cursor.next()? {
            keys.push(key);
        }
        Ok(keys)
    }

    /// Every `(key, id)` tuple, materialized in key order.
    pub fn pairs(&self) -> Result<Vec<(K, u64)>> {
        let mut cursor = self.fwd.pairs()?;
        let mut out = Vec::new();
        while let Some((key_bytes, id_bytes)) = cursor.next()? {
            out.push((K::decode(&key_bytes)?, decode_id(&id_bytes)?));
        }
        Ok(out)
    }

    /// Flushes both backing files.
    pub fn sync(&self) -> Result<()> {
        self.fwd.sync()?;
        self.rev.sync()
    }
}

/// Cursor over entry ids.
pub struct IdCursor<'a> {
    inner: MemberCursor<'a>,
}

impl IdCursor<'_> {
    pub fn next(&mut self) -> Result<Option<u64>> {
        self.inner.next()?.map(|b| decode_id(&b)).transpose()
    }
}

/// Cursor over typed index keys.
pub struct KeyCursor<'a, K: IndexKey> {
    inner: MemberCursor<'a>,
    _key: PhantomData<fn() -> K>,
}

impl<K: IndexKey> KeyCursor<'_, K> {
    pub fn next(&mut self) -> Result<Option<K>> {
        self.inner.next()?.map(|b| K::decode(&b)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Normalizer;
    use tempfile::tempdir;

    fn string_index(dir: &Path) -> Index<String> {
        let attr = AttributeType::new("2.5.4.3", &["cn"], Normalizer::CaseIgnore);
        Index::open(dir, attr, 16, 4).unwrap()
    }

    fn id_index(dir: &Path) -> Index<u64> {
        let attr = AttributeType::new("1.2.3.4", &["hierarchy"], Normalizer::Exact);
        Index::open(dir, attr, 0, 4).unwrap()
    }

    #[test]
    fn add_and_lookup_normalizes_string_keys() {
        let dir = tempdir().unwrap();
        let mut idx = string_index(dir.path());

        idx.add(&"Alice  Smith".to_string(), 7).unwrap();
        assert_eq!(
            idx.forward_lookup(&"alice smith".to_string()).unwrap(),
            Some(7)
        );
        assert_eq!(
            idx.reverse_lookup(7).unwrap(),
            Some("alice smith".to_string())
        );
        assert!(idx.has_value(&"ALICE SMITH".to_string(), 7).unwrap());
    }

    #[test]
    fn forward_lookup_returns_least_id() {
        let dir = tempdir().unwrap();
        let mut idx = string_index(dir.path());
        let key = "shared".to_string();
        idx.add(&key, 42).unwrap();
        idx.add(&key, 7).unwrap();
        idx.add(&key, 99).unwrap();

        assert_eq!(idx.forward_lookup(&key).unwrap(), Some(7));
        assert_eq!(idx.count_key(&key).unwrap(), 3);
        assert_eq!(idx.list_ids(&key).unwrap(), vec![7, 42, 99]);
    }

    #[test]
    fn drop_all_clears_both_directions() {
        let dir = tempdir().unwrap();
        let mut idx = string_index(dir.path());
        idx.add(&"k1".to_string(), 5).unwrap();
        idx.add(&"k2".to_string(), 5).unwrap();
        idx.add(&"k1".to_string(), 6).unwrap();

        idx.drop_all(5).unwrap();

        assert!(!idx.has_value(&"k1".to_string(), 5).unwrap());
        assert!(!idx.has_value(&"k2".to_string(), 5).unwrap());
        assert!(idx.has_value(&"k1".to_string(), 6).unwrap());
        assert_eq!(idx.reverse_lookup(5).unwrap(), None);
        assert_eq!(idx.count().unwrap(), 1);
    }

    #[test]
    fn id_keys_sort_numerically_in_pairs() {
        let dir = tempdir().unwrap();
        let mut idx = id_index(dir.path());
        idx.add(&300, 1).unwrap();
        idx.add(&2, 2).unwrap();
        idx.add(&2, 3).unwrap();

        let pairs = idx.pairs().unwrap();
        assert_eq!(pairs, vec![(2, 2), (2, 3), (300, 1)]);
    }

    #[test]
    fn add_is_idempotent_per_tuple() {
        let dir = tempdir().unwrap();
        let mut idx = id_index(dir.path());
        idx.add(&1, 10).unwrap();
        idx.add(&1, 10).unwrap();
        assert_eq!(idx.count().unwrap(), 1);

        idx.drop_pair(&1, 10).unwrap();
        idx.drop_pair(&1, 10).unwrap();
        assert_eq!(idx.count().unwrap(), 0);
    }
}
