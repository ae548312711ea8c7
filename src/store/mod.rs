//! # Partition Store Coordinator
//!
//! [`DitStore`] is the sole writer over one directory partition: the
//! master table plus the seven system indices and any configured user
//! indices. Every mutation updates the coordinated index set before the
//! entry blob is written back, so the referential invariants hold after
//! each operation:
//!
//! - `ndn`/`updn` map each live id to its normalized and user-provided
//!   names;
//! - `hierarchy` links every non-suffix id under its parent id (the
//!   suffix hangs off the reserved parent id 0);
//! - `presence` and the user indices mirror exactly the attributes the
//!   entry carries;
//! - the three alias tables (`alias`, `oneAlias`, `subAlias`) describe
//!   every alias entry's target and the scope jumps it induces.
//!
//! ## Write discipline
//!
//! Operations validate everything user-visible (name resolution, schema,
//! alias constraints) before touching any index, so caller errors leave
//! the partition unchanged. Once index writes have begun, a failure
//! marks the store inconsistent: every following mutation fails with
//! `IndexInconsistent` until the partition is destroyed and re-opened.
//! No partial rollback across the trees is attempted.
//!
//! Mutations take `&mut self`; readers take `&self`. The single-writer /
//! concurrent-reader regime is therefore enforced by the borrow checker,
//! and callers that share a store across threads wrap it in an `RwLock`.
//!
//! ## Alias invariants
//!
//! An alias add enforces, in order: no alias to itself, no alias to one
//! of its own ancestors or descendants (cycle), target inside the
//! partition suffix, target exists, target is not itself an alias
//! (chain). Only then are the `alias`, `oneAlias`, and `subAlias` tuples
//! written. The subtree-scope walk runs from the alias's parent up to,
//! and not including, the suffix.
//!
//! Moves clear and rebuild the scope tuples of every alias living in the
//! moved subtree, and re-target aliases whose *target* lies in the moved
//! subtree so their stored target DN follows the move.

use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::config::constants::{
    DEFAULT_DUPLICATE_LIMIT, DEFAULT_INDEX_CACHE_SIZE, ROOT_PARENT_ID,
};
use crate::config::{Lifecycle, StoreConfig};
use crate::entry::{Attribute, Entry, ModOp, Modification, Value};
use crate::error::StoreError;
use crate::index::{IdCursor, Index};
use crate::master::MasterTable;
use crate::name::{Dn, Rdn};
use crate::schema::{AttributeType, Normalizer, SchemaRegistry};

/// OIDs of the system indices, used to name their file pairs.
pub const NDN_INDEX_OID: &str = "1.3.6.1.4.1.18060.0.4.1.2.1";
pub const UPDN_INDEX_OID: &str = "1.3.6.1.4.1.18060.0.4.1.2.2";
pub const PRESENCE_INDEX_OID: &str = "1.3.6.1.4.1.18060.0.4.1.2.3";
pub const HIERARCHY_INDEX_OID: &str = "1.3.6.1.4.1.18060.0.4.1.2.4";
pub const ALIAS_INDEX_OID: &str = "1.3.6.1.4.1.18060.0.4.1.2.5";
pub const ONE_ALIAS_INDEX_OID: &str = "1.3.6.1.4.1.18060.0.4.1.2.6";
pub const SUB_ALIAS_INDEX_OID: &str = "1.3.6.1.4.1.18060.0.4.1.2.7";

const SYSTEM_INDEX_NAMES: [(&str, &str); 7] = [
    (NDN_INDEX_OID, "ndn"),
    (UPDN_INDEX_OID, "updn"),
    (PRESENCE_INDEX_OID, "presence"),
    (HIERARCHY_INDEX_OID, "hierarchy"),
    (ALIAS_INDEX_OID, "alias"),
    (ONE_ALIAS_INDEX_OID, "oneAlias"),
    (SUB_ALIAS_INDEX_OID, "subAlias"),
];

/// The objectClass marking alias entries.
const ALIAS_OBJECT_CLASS: &str = "alias";
/// The attribute naming an alias's target.
const ALIAS_ATTRIBUTE: &str = "aliasedObjectName";

/// Validated alias target, ready to have its tuples written.
struct AliasPlan {
    norm_target: Dn,
    target_id: u64,
}

struct StoreInner {
    schema: Arc<SchemaRegistry>,
    suffix: Dn,
    up_suffix: Dn,
    master: MasterTable,
    ndn: Index<String>,
    updn: Index<String>,
    hierarchy: Index<u64>,
    presence: Index<String>,
    alias: Index<String>,
    one_alias: Index<u64>,
    sub_alias: Index<u64>,
    user_indices: HashMap<String, Index<String>>,
    alias_attr_oid: String,
    sync_on_write: bool,
    poisoned: bool,
}

/// The embedded partition store.
pub struct DitStore {
    config: StoreConfig,
    lifecycle: Lifecycle,
    inner: Option<StoreInner>,
}

impl DitStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            lifecycle: Lifecycle::new(),
            inner: None,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.lifecycle.is_initialized()
    }

    /// Opens the record files, brings up every index, and synthesizes the
    /// suffix entry when the partition is empty.
    pub fn init(&mut self) -> Result<()> {
        self.lifecycle.check_not_initialized()?;

        let schema = self.config.schema().clone();
        let up_suffix = Dn::parse(self.config.suffix_dn())?;
        let suffix = up_suffix.normalize(&schema)?;

        let dir = self.config.working_directory().clone();
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create working directory '{}'", dir.display()))?;

        // Index tuning: configured entries may address a system index by
        // its short name or OID; everything else becomes a user index.
        let mut sys_tuning: HashMap<&'static str, (usize, usize)> = HashMap::new();
        let mut user_configs = Vec::new();
        for index_config in self.config.indexed_attributes() {
            let id = index_config.attribute();
            match SYSTEM_INDEX_NAMES
                .iter()
                .find(|(oid, name)| id.eq_ignore_ascii_case(name) || id == *oid)
            {
                Some((oid, _)) => {
                    sys_tuning.insert(
                        *oid,
                        (index_config.cache_size(), index_config.duplicate_limit()),
                    );
                }
                None => user_configs.push(index_config.clone()),
            }
        }
        let tuning = |oid: &str| {
            sys_tuning
                .get(oid)
                .copied()
                .unwrap_or((DEFAULT_INDEX_CACHE_SIZE, DEFAULT_DUPLICATE_LIMIT))
        };

        let master = MasterTable::open_or_create(dir.join("master.db"))?;

        let open_sys = |oid: &str, name: &str| -> Result<(AttributeType, usize, usize)> {
            let (cache, dups) = tuning(oid);
            Ok((
                AttributeType::new(oid, &[name], Normalizer::Exact),
                cache,
                dups,
            ))
        };
        let (at, cache, dups) = open_sys(NDN_INDEX_OID, "ndn")?;
        let ndn = Index::open(&dir, at, cache, dups)?;
        let (at, cache, dups) = open_sys(UPDN_INDEX_OID, "updn")?;
        let updn = Index::open(&dir, at, cache, dups)?;
        let (at, cache, dups) = open_sys(PRESENCE_INDEX_OID, "presence")?;
        let presence = Index::open(&dir, at, cache, dups)?;
        let (at, cache, dups) = open_sys(HIERARCHY_INDEX_OID, "hierarchy")?;
        let hierarchy = Index::open(&dir, at, cache, dups)?;
        let (at, cache, dups) = open_sys(ALIAS_INDEX_OID, "alias")?;
        let alias = Index::open(&dir, at, cache, dups)?;
        let (at, cache, dups) = open_sys(ONE_ALIAS_INDEX_OID, "oneAlias")?;
        let one_alias = Index::open(&dir, at, cache, dups)?;
        let (at, cache, dups) = open_sys(SUB_ALIAS_INDEX_OID, "subAlias")?;
        let sub_alias = Index::open(&dir, at, cache, dups)?;

        let mut user_indices = HashMap::new();
        for index_config in &user_configs {
            let at = schema.attribute_type(index_config.attribute())?.clone();
            let oid = at.oid().to_string();
            debug!(
                attribute = index_config.attribute(),
                oid = %oid,
                cache = index_config.cache_size(),
                "opening user index"
            );
            let index = Index::open(
                &dir,
                at,
                index_config.cache_size(),
                index_config.duplicate_limit(),
            )?;
            user_indices.insert(oid, index);
        }

        let alias_attr_oid = schema.resolve_oid(ALIAS_ATTRIBUTE)?.to_string();

        let mut inner = StoreInner {
            schema,
            suffix: suffix.clone(),
            up_suffix: up_suffix.clone(),
            master,
            ndn,
            updn,
            hierarchy,
            presence,
            alias,
            one_alias,
            sub_alias,
            user_indices,
            alias_attr_oid,
            sync_on_write: self.config.sync_on_write(),
            poisoned: false,
        };

        // Synthesize the suffix entry when it is not on disk yet.
        if inner.entry_id(&suffix.to_string())?.is_none() {
            let entry = match self.config.context_entry() {
                Some(entry) => entry.clone(),
                None => {
                    let mut entry = Entry::new();
                    entry.add_value("objectClass", Value::from("top"));
                    entry.add_value(up_suffix.rdn().attr(), Value::from(up_suffix.rdn().value()));
                    entry
                }
            };
            let entry = {
                let mut e = entry;
                if e.get("objectClass").is_none() {
                    e.add_value("objectClass", Value::from("top"));
                }
                e
            };
            let id = inner.add(&up_suffix, &suffix, entry)?;
            debug!(suffix = %suffix, id, "created suffix entry");
        }

        self.inner = Some(inner);
        self.lifecycle.set_initialized(true);
        debug!(
            partition = self.config.name(),
            directory = %dir.display(),
            "partition store initialized"
        );
        Ok(())
    }

    /// Flushes and closes everything, in reverse of `init`. The store can
    /// be re-initialized afterwards.
    pub fn destroy(&mut self) -> Result<()> {
        self.lifecycle.check_initialized()?;
        if let Some(inner) = self.inner.take() {
            if let Err(err) = inner.sync_all() {
                warn!(error = %err, "failed to flush partition during destroy");
            }
        }
        self.lifecycle.set_initialized(false);
        debug!(partition = self.config.name(), "partition store destroyed");
        Ok(())
    }

    /// Commits every record file.
    pub fn sync(&self) -> Result<()> {
        self.reader()?.sync_all()
    }

    fn reader(&self) -> Result<&StoreInner> {
        self.lifecycle.check_initialized()?;
        Ok(self.inner.as_ref().expect("initialized store without inner"))
    }

    fn writer(&mut self) -> Result<&mut StoreInner> {
        self.lifecycle.check_initialized()?;
        let inner = self.inner.as_mut().expect("initialized store without inner");
        if inner.poisoned {
            return Err(StoreError::IndexInconsistent.into());
        }
        Ok(inner)
    }

    // ---- naming ----------------------------------------------------------

    /// Normalized suffix DN.
    pub fn suffix(&self) -> Result<String> {
        Ok(self.reader()?.suffix.to_string())
    }

    /// User-provided suffix DN.
    pub fn up_suffix(&self) -> Result<String> {
        Ok(self.reader()?.up_suffix.to_string())
    }

    /// Resolves a DN (any case/spacing) to its entry id.
    pub fn entry_id(&self, dn: &str) -> Result<Option<u64>> {
        let inner = self.reader()?;
        let norm = Dn::parse(dn)?.normalize(&inner.schema)?;
        inner.entry_id(&norm.to_string())
    }

    /// Normalized DN of an entry id.
    pub fn entry_dn(&self, id: u64) -> Result<Option<String>> {
        self.reader()?.entry_dn(id)
    }

    /// User-provided DN of an entry id.
    pub fn entry_updn(&self, id: u64) -> Result<Option<String>> {
        self.reader()?.entry_updn(id)
    }

    /// Parent id of an entry; the suffix reports the reserved id 0.
    pub fn parent_id(&self, id: u64) -> Result<Option<u64>> {
        self.reader()?.parent_id(id)
    }

    pub fn parent_id_of(&self, dn: &str) -> Result<Option<u64>> {
        match self.entry_id(dn)? {
            Some(id) => self.parent_id(id),
            None => Ok(None),
        }
    }

    /// Live entry count.
    pub fn count(&self) -> Result<u64> {
        self.reader()?.master.count()
    }

    // ---- crud ------------------------------------------------------------

    /// Adds an entry under `dn`, returning its new id.
    pub fn add(&mut self, dn: &str, entry: Entry) -> Result<u64> {
        let up_dn = Dn::parse(dn)?;
        let inner = self.writer()?;
        let norm = up_dn.normalize(&inner.schema)?;
        inner.add(&up_dn, &norm, entry)
    }

    /// Fetches the entry stored under `id`.
    pub fn lookup(&self, id: u64) -> Result<Entry> {
        self.reader()?.load_entry(id)
    }

    /// Deletes the entry with `id`. Deleting an entry that still has
    /// children is a caller error; check [`DitStore::child_count`] first.
    pub fn delete(&mut self, id: u64) -> Result<()> {
        self.writer()?.delete(id)
    }

    /// Applies one modification operation to every attribute in `mods`.
    pub fn modify(&mut self, dn: &str, op: ModOp, mods: &[Attribute]) -> Result<()> {
        let items: Vec<Modification> = mods
            .iter()
            .map(|attr| Modification::new(op, attr.clone()))
            .collect();
        self.modify_items(dn, &items)
    }

    /// Applies a sequence of modification items to the entry at `dn`.
    pub fn modify_items(&mut self, dn: &str, mods: &[Modification]) -> Result<()> {
        let parsed = Dn::parse(dn)?;
        let inner = self.writer()?;
        let norm = parsed.normalize(&inner.schema)?;
        inner.modify(&norm, mods)
    }

    /// Changes the entry's RDN, recursively rewriting descendant names.
    pub fn rename(&mut self, dn: &str, new_rdn: &str, delete_old_rdn: bool) -> Result<()> {
        let parsed = Dn::parse(dn)?;
        let rdn = Rdn::parse(new_rdn)?;
        let inner = self.writer()?;
        let norm = parsed.normalize(&inner.schema)?;
        inner.rename(&norm, &rdn, delete_old_rdn)
    }

    /// Moves the entry at `dn` (and its subtree) under `new_parent_dn`.
    pub fn move_entry(&mut self, dn: &str, new_parent_dn: &str) -> Result<()> {
        let parsed = Dn::parse(dn)?;
        let parent = Dn::parse(new_parent_dn)?;
        let inner = self.writer()?;
        let norm = parsed.normalize(&inner.schema)?;
        let norm_parent = parent.normalize(&inner.schema)?;
        let child_id = inner.require_id(&norm)?;
        inner.move_subtree(child_id, &norm_parent)
    }

    /// Renames the entry, then moves it under `new_parent_dn`.
    pub fn move_entry_and_rename(
        &mut self,
        dn: &str,
        new_parent_dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
    ) -> Result<()> {
        let parsed = Dn::parse(dn)?;
        let parent = Dn::parse(new_parent_dn)?;
        let rdn = Rdn::parse(new_rdn)?;
        let inner = self.writer()?;
        let norm = parsed.normalize(&inner.schema)?;
        let norm_parent = parent.normalize(&inner.schema)?;
        let child_id = inner.require_id(&norm)?;
        inner.rename(&norm, &rdn, delete_old_rdn)?;
        let inner = self.writer()?;
        inner.move_subtree(child_id, &norm_parent)
    }

    // ---- traversal -------------------------------------------------------

    /// Cursor over the ids of `id`'s direct children.
    pub fn list(&self, id: u64) -> Result<IdCursor<'_>> {
        self.reader()?.hierarchy.list(&id)
    }

    /// Direct child count.
    pub fn child_count(&self, id: u64) -> Result<u64> {
        self.reader()?.hierarchy.count_key(&id)
    }

    // ---- index access ----------------------------------------------------

    pub fn has_user_index_on(&self, attribute: &str) -> Result<bool> {
        let inner = self.reader()?;
        match inner.schema.resolve_oid(attribute) {
            Ok(oid) => Ok(inner.user_indices.contains_key(oid)),
            Err(_) => Ok(false),
        }
    }

    pub fn has_system_index_on(&self, attribute: &str) -> Result<bool> {
        self.reader()?;
        Ok(SYSTEM_INDEX_NAMES
            .iter()
            .any(|(oid, name)| attribute.eq_ignore_ascii_case(name) || attribute == *oid))
    }

    /// The user index on `attribute`, failing with `IndexNotFound` when
    /// none is configured.
    pub fn user_index(&self, attribute: &str) -> Result<&Index<String>> {
        let inner = self.reader()?;
        let oid = inner
            .schema
            .resolve_oid(attribute)
            .map_err(|_| StoreError::IndexNotFound {
                attribute: attribute.to_string(),
            })?;
        inner
            .user_indices
            .get(oid)
            .ok_or_else(|| {
                StoreError::IndexNotFound {
                    attribute: attribute.to_string(),
                }
                .into()
            })
    }

    /// OIDs of the configured user indices.
    pub fn user_index_names(&self) -> Result<Vec<String>> {
        Ok(self.reader()?.user_indices.keys().cloned().collect())
    }

    /// OIDs of the system indices.
    pub fn system_index_names(&self) -> Result<Vec<String>> {
        self.reader()?;
        Ok(SYSTEM_INDEX_NAMES
            .iter()
            .map(|(oid, _)| oid.to_string())
            .collect())
    }

    pub fn ndn_index(&self) -> Result<&Index<String>> {
        Ok(&self.reader()?.ndn)
    }

    pub fn updn_index(&self) -> Result<&Index<String>> {
        Ok(&self.reader()?.updn)
    }

    pub fn presence_index(&self) -> Result<&Index<String>> {
        Ok(&self.reader()?.presence)
    }

    pub fn alias_index(&self) -> Result<&Index<String>> {
        Ok(&self.reader()?.alias)
    }

    pub fn hierarchy_index(&self) -> Result<&Index<u64>> {
        Ok(&self.reader()?.hierarchy)
    }

    pub fn one_alias_index(&self) -> Result<&Index<u64>> {
        Ok(&self.reader()?.one_alias)
    }

    pub fn sub_alias_index(&self) -> Result<&Index<u64>> {
        Ok(&self.reader()?.sub_alias)
    }

    /// Debugging snapshot of every index tuple touching `id`, rendered as
    /// an entry with `_nDn`, `_upDn`, `_parent`, `_existence[<oid>]`, and
    /// `_child` attributes alongside any user-index keys.
    pub fn index_snapshot(&self, id: u64) -> Result<Entry> {
        self.reader()?.index_snapshot(id)
    }
}

impl StoreInner {
    // ---- small lookups ---------------------------------------------------

    fn entry_id(&self, ndn: &str) -> Result<Option<u64>> {
        self.ndn.forward_lookup(&ndn.to_string())
    }

    fn entry_dn(&self, id: u64) -> Result<Option<String>> {
        self.ndn.reverse_lookup(id)
    }

    fn entry_updn(&self, id: u64) -> Result<Option<String>> {
        self.updn.reverse_lookup(id)
    }

    fn parent_id(&self, id: u64) -> Result<Option<u64>> {
        self.hierarchy.reverse_lookup(id)
    }

    fn require_id(&self, norm: &Dn) -> Result<u64> {
        self.entry_id(&norm.to_string())?.ok_or_else(|| {
            StoreError::NoSuchObject {
                dn: norm.to_string(),
            }
            .into()
        })
    }

    fn load_entry(&self, id: u64) -> Result<Entry> {
        match self.master.get(id)? {
            Some(bytes) => Entry::decode(&bytes),
            None => Err(StoreError::NoSuchObject {
                dn: format!("#{id}"),
            }
            .into()),
        }
    }

    fn maybe_sync(&self) -> Result<()> {
        if self.sync_on_write {
            self.sync_all()?;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        for index in self.user_indices.values() {
            index.sync()?;
        }
        self.ndn.sync()?;
        self.updn.sync()?;
        self.hierarchy.sync()?;
        self.presence.sync()?;
        self.alias.sync()?;
        self.one_alias.sync()?;
        self.sub_alias.sync()?;
        self.master.sync()
    }

    /// Runs the write phase of an operation. Any failure here means part
    /// of the coordinated index set may have been mutated, so the store
    /// is poisoned until restart.
    fn guard<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.poisoned = true;
                warn!(error = %err, "mutation failed mid-write, store marked inconsistent");
                Err(err)
            }
        }
    }

    // ---- add -------------------------------------------------------------

    fn add(&mut self, up_dn: &Dn, norm_dn: &Dn, entry: Entry) -> Result<u64> {
        // Validation phase: nothing below may touch an index.
        let parent_id = if *norm_dn == self.suffix {
            ROOT_PARENT_ID
        } else {
            let parent = norm_dn.parent().ok_or_else(|| StoreError::NoSuchParent {
                dn: norm_dn.to_string(),
            })?;
            self.entry_id(&parent.to_string())?
                .ok_or(StoreError::NoSuchParent {
                    dn: parent.to_string(),
                })?
        };

        if entry.get("objectClass").is_none() {
            return Err(StoreError::SchemaViolation {
                detail: format!("entry '{up_dn}' has no objectClass attribute"),
            }
            .into());
        }

        let resolved = self.resolve_attributes(&entry)?;

        let alias_plan = if entry.has_object_class(ALIAS_OBJECT_CLASS) {
            let target = entry.first_text(ALIAS_ATTRIBUTE).ok_or_else(|| {
                StoreError::SchemaViolation {
                    detail: format!("alias entry '{up_dn}' has no {ALIAS_ATTRIBUTE} value"),
                }
            })?;
            Some(self.check_alias(norm_dn, target)?)
        } else {
            None
        };

        self.guard(move |s| {
            let id = s.master.next_id()?;

            if let Some(plan) = &alias_plan {
                s.apply_alias(id, norm_dn, plan)?;
            }

            s.ndn.add(&norm_dn.to_string(), id)?;
            s.updn.add(&up_dn.to_string(), id)?;
            s.hierarchy.add(&parent_id, id)?;

            for (oid, attr) in &resolved {
                if let Some(index) = s.user_indices.get_mut(oid) {
                    for value in attr.values() {
                        if let Some(text) = value.as_text() {
                            index.add(&text.to_string(), id)?;
                        }
                    }
                    s.presence.add(oid, id)?;
                }
            }

            s.master.put(id, &entry.encode())?;
            s.maybe_sync()?;
            debug!(dn = %norm_dn, id, "entry added");
            Ok(id)
        })
    }

    /// Resolves every attribute id of `entry`, failing early on schema
    /// violations.
    fn resolve_attributes(&self, entry: &Entry) -> Result<Vec<(String, Attribute)>> {
        entry
            .attributes()
            .iter()
            .map(|attr| {
                Ok((
                    self.schema.resolve_oid(attr.id())?.to_string(),
                    attr.clone(),
                ))
            })
            .collect()
    }

    // ---- delete ----------------------------------------------------------

    fn delete(&mut self, id: u64) -> Result<()> {
        let entry = self.load_entry(id)?;
        let parent_id = self.parent_id(id)?.ok_or(StoreError::NoSuchObject {
            dn: format!("#{id}"),
        })?;
        let resolved = self.resolve_attributes(&entry)?;
        let is_alias = entry.has_object_class(ALIAS_OBJECT_CLASS);

        self.guard(move |s| {
            if is_alias {
                s.drop_alias_indices(id)?;
            }

            s.ndn.drop_all(id)?;
            s.updn.drop_all(id)?;
            s.hierarchy.drop_all(id)?;
            if parent_id != ROOT_PARENT_ID {
                s.hierarchy.drop_pair(&parent_id, id)?;
            }

            for (oid, attr) in &resolved {
                if let Some(index) = s.user_indices.get_mut(oid) {
                    for value in attr.values() {
                        if let Some(text) = value.as_text() {
                            index.drop_pair(&text.to_string(), id)?;
                        }
                    }
                }
                s.presence.drop_pair(oid, id)?;
            }

            s.master.delete(id)?;
            s.maybe_sync()?;
            debug!(id, "entry deleted");
            Ok(())
        })
    }

    // ---- modify ----------------------------------------------------------

    fn modify(&mut self, norm_dn: &Dn, mods: &[Modification]) -> Result<()> {
        let id = self.require_id(norm_dn)?;
        let mut entry = self.load_entry(id)?;

        // Pre-validate against the pre-operation state: attribute ids
        // must resolve, and alias targets introduced by ADD/REPLACE must
        // satisfy the alias constraints.
        for item in mods {
            let oid = self.schema.resolve_oid(item.attribute.id())?.to_string();
            if oid == self.alias_attr_oid {
                let introduces_target = matches!(item.op, ModOp::Add)
                    || (matches!(item.op, ModOp::Replace) && !item.attribute.is_empty());
                if introduces_target {
                    let target = item
                        .attribute
                        .first()
                        .and_then(Value::as_text)
                        .ok_or_else(|| StoreError::SchemaViolation {
                            detail: format!("{ALIAS_ATTRIBUTE} modification carries no value"),
                        })?;
                    self.check_alias(norm_dn, target)?;
                }
            }
        }

        self.guard(move |s| {
            for item in mods {
                match item.op {
                    ModOp::Add => s.apply_mod_add(id, &mut entry, &item.attribute)?,
                    ModOp::Remove => s.apply_mod_remove(id, &mut entry, &item.attribute)?,
                    ModOp::Replace => s.apply_mod_replace(id, &mut entry, &item.attribute)?,
                }
            }
            s.master.put(id, &entry.encode())?;
            s.maybe_sync()?;
            Ok(())
        })
    }

    /// ADD: index the new values, extend the entry, and build alias
    /// tuples when the alias attribute appears.
    fn apply_mod_add(&mut self, id: u64, entry: &mut Entry, attr: &Attribute) -> Result<()> {
        let oid = self.schema.resolve_oid(attr.id())?.to_string();

        if let Some(index) = self.user_indices.get_mut(&oid) {
            for value in attr.values() {
                if let Some(text) = value.as_text() {
                    index.add(&text.to_string(), id)?;
                }
            }
            if !self.presence.has_value(&oid, id)? {
                self.presence.add(&oid, id)?;
            }
        }

        for value in attr.values() {
            entry.add_value(attr.id(), value.clone());
        }

        if oid == self.alias_attr_oid {
            let alias_dn = self.current_dn(id)?;
            let target = attr
                .first()
                .and_then(Value::as_text)
                .ok_or_else(|| StoreError::SchemaViolation {
                    detail: format!("{ALIAS_ATTRIBUTE} modification carries no value"),
                })?
                .to_string();
            let plan = self.check_alias(&alias_dn, &target)?;
            self.apply_alias(id, &alias_dn, &plan)?;
        }

        Ok(())
    }

    /// REMOVE: an empty value list removes the whole attribute; removed
    /// values leave the user index, and presence follows the last one.
    fn apply_mod_remove(&mut self, id: u64, entry: &mut Entry, attr: &Attribute) -> Result<()> {
        let oid = self.schema.resolve_oid(attr.id())?.to_string();

        let removed: Vec<Value> = if attr.is_empty() {
            entry
                .get(attr.id())
                .map(|a| a.values().to_vec())
                .unwrap_or_default()
        } else {
            attr.values().to_vec()
        };

        if let Some(index) = self.user_indices.get_mut(&oid) {
            for value in &removed {
                if let Some(text) = value.as_text() {
                    index.drop_pair(&text.to_string(), id)?;
                }
            }
            if index.reverse_lookup(id)?.is_none() {
                self.presence.drop_pair(&oid, id)?;
            }
        }

        if attr.is_empty() {
            entry.remove(attr.id());
        } else {
            for value in attr.values() {
                entry.remove_value(attr.id(), value);
            }
        }

        if oid == self.alias_attr_oid {
            self.drop_alias_indices(id)?;
        }

        Ok(())
    }

    /// REPLACE: rebuild the user index for this id, swap the attribute,
    /// and rebuild alias tuples when the alias attribute is replaced.
    fn apply_mod_replace(&mut self, id: u64, entry: &mut Entry, attr: &Attribute) -> Result<()> {
        let oid = self.schema.resolve_oid(attr.id())?.to_string();

        if let Some(index) = self.user_indices.get_mut(&oid) {
            index.drop_all(id)?;
            for value in attr.values() {
                if let Some(text) = value.as_text() {
                    index.add(&text.to_string(), id)?;
                }
            }
            if index.reverse_lookup(id)?.is_none() {
                self.presence.drop_pair(&oid, id)?;
            } else if !self.presence.has_value(&oid, id)? {
                self.presence.add(&oid, id)?;
            }
        }

        if oid == self.alias_attr_oid {
            self.drop_alias_indices(id)?;
        }

        if attr.is_empty() {
            entry.remove(attr.id());
        } else {
            entry.put(attr.clone());
        }

        if oid == self.alias_attr_oid && !attr.is_empty() {
            let alias_dn = self.current_dn(id)?;
            let target = attr
                .first()
                .and_then(Value::as_text)
                .ok_or_else(|| StoreError::SchemaViolation {
                    detail: format!("{ALIAS_ATTRIBUTE} modification carries no value"),
                })?
                .to_string();
            let plan = self.check_alias(&alias_dn, &target)?;
            self.apply_alias(id, &alias_dn, &plan)?;
        }

        Ok(())
    }

    fn current_dn(&self, id: u64) -> Result<Dn> {
        let dn = self.entry_dn(id)?.ok_or(StoreError::NoSuchObject {
            dn: format!("#{id}"),
        })?;
        Dn::parse(&dn)
    }

    // ---- rename ----------------------------------------------------------

    fn rename(&mut self, norm_dn: &Dn, new_rdn: &Rdn, delete_old_rdn: bool) -> Result<()> {
        let id = self.require_id(norm_dn)?;
        let mut entry = self.load_entry(id)?;
        let updn = Dn::parse(&self.entry_updn(id)?.ok_or(StoreError::NoSuchObject {
            dn: norm_dn.to_string(),
        })?)?;

        let new_rdn_at = self.schema.attribute_type(new_rdn.attr())?.clone();
        let old_rdn = updn.rdn().clone();
        let old_rdn_at = self.schema.attribute_type(old_rdn.attr())?.clone();

        // Renaming to the same (normalized) RDN must not strip the value.
        let same_rdn = new_rdn_at.oid() == old_rdn_at.oid()
            && new_rdn_at.equality().normalize(new_rdn.value())
                == old_rdn_at.equality().normalize(old_rdn.value());

        self.guard(move |s| {
            let new_value = Value::from(new_rdn.value());
            let already_present = entry
                .get(new_rdn.attr())
                .is_some_and(|a| a.contains(&new_value));
            if !already_present {
                entry.add_value(new_rdn.attr(), new_value.clone());
            }
            if let Some(index) = s.user_indices.get_mut(new_rdn_at.oid()) {
                index.add(&new_rdn.value().to_string(), id)?;
                if !s.presence.has_value(&new_rdn_at.oid().to_string(), id)? {
                    s.presence.add(&new_rdn_at.oid().to_string(), id)?;
                }
            }

            if delete_old_rdn && !same_rdn {
                let old_value = Value::from(old_rdn.value());
                entry.remove_value(old_rdn.attr(), &old_value);
                if let Some(index) = s.user_indices.get_mut(old_rdn_at.oid()) {
                    index.drop_pair(&old_rdn.value().to_string(), id)?;
                    if index.reverse_lookup(id)?.is_none() {
                        s.presence
                            .drop_pair(&old_rdn_at.oid().to_string(), id)?;
                    }
                }
            }

            s.master.put(id, &entry.encode())?;

            let new_updn = match updn.parent() {
                Some(parent) => parent.child(new_rdn.clone()),
                None => Dn::from_rdns(vec![new_rdn.clone()])?,
            };
            s.modify_dn(id, &new_updn, false)?;
            s.maybe_sync()?;
            debug!(id, new_rdn = %new_rdn, "entry renamed");
            Ok(())
        })
    }

    // ---- move ------------------------------------------------------------

    fn move_subtree(&mut self, child_id: u64, new_parent_norm: &Dn) -> Result<()> {
        let new_parent_id = self.require_id(new_parent_norm)?;
        let old_parent_id = self.parent_id(child_id)?.ok_or(StoreError::NoSuchObject {
            dn: format!("#{child_id}"),
        })?;
        ensure!(
            old_parent_id != ROOT_PARENT_ID,
            "the partition suffix cannot be moved"
        );
        let moved_base = self.current_dn(child_id)?;
        ensure!(
            !new_parent_norm.is_under(&moved_base),
            "cannot move '{moved_base}' below itself"
        );

        self.guard(move |s| {
            let retargets = s.drop_moved_alias_indices(&moved_base)?;

            s.hierarchy.drop_pair(&old_parent_id, child_id)?;
            s.hierarchy.add(&new_parent_id, child_id)?;

            let child_updn = Dn::parse(&s.entry_updn(child_id)?.ok_or(
                StoreError::NoSuchObject {
                    dn: format!("#{child_id}"),
                },
            )?)?;
            let parent_updn = Dn::parse(&s.entry_updn(new_parent_id)?.ok_or(
                StoreError::NoSuchObject {
                    dn: format!("#{new_parent_id}"),
                },
            )?)?;
            let new_updn = parent_updn.child(child_updn.rdn().clone());

            s.modify_dn(child_id, &new_updn, true)?;

            // Aliases pointing into the moved subtree follow their target.
            if !retargets.is_empty() {
                let new_base = s.current_dn(child_id)?;
                for (alias_id, old_target) in retargets {
                    let alias_dn = s.current_dn(alias_id)?;
                    let new_target = old_target.rebase(&moved_base, &new_base)?;
                    let plan = s.check_alias(&alias_dn, &new_target.to_string())?;
                    s.apply_alias(alias_id, &alias_dn, &plan)?;
                }
            }

            s.maybe_sync()?;
            debug!(child_id, new_parent = %new_parent_norm, "subtree moved");
            Ok(())
        })
    }

    /// Recursively rewrites the name indices for `id` and its subtree.
    /// Child ids are captured before any rewrite: the hierarchy index is
    /// not mutated here, but `ndn`/`updn` for each child are, so no live
    /// cursor may span the recursion.
    fn modify_dn(&mut self, id: u64, new_updn: &Dn, is_move: bool) -> Result<()> {
        let norm = new_updn.normalize(&self.schema)?;

        self.ndn.drop_all(id)?;
        self.ndn.add(&norm.to_string(), id)?;
        self.updn.drop_all(id)?;
        self.updn.add(&new_updn.to_string(), id)?;

        // A moved alias had its scope tuples purged up front; rebuild
        // them at the new location.
        if is_move {
            if let Some(target) = self.alias.reverse_lookup(id)? {
                let plan = self.check_alias(&norm, &target)?;
                self.apply_alias(id, &norm, &plan)?;
            }
        }

        let child_ids = self.hierarchy.list_ids(&id)?;
        for child_id in child_ids {
            let child_updn =
                Dn::parse(&self.entry_updn(child_id)?.ok_or(StoreError::NoSuchObject {
                    dn: format!("#{child_id}"),
                })?)?;
            let child_new_updn = new_updn.child(child_updn.rdn().clone());
            self.modify_dn(child_id, &child_new_updn, is_move)?;
        }
        Ok(())
    }

    // ---- alias indexing --------------------------------------------------

    /// Validates an alias target against the five alias invariants, in
    /// the original's order: self, cycle, external, missing, chain.
    fn check_alias(&self, alias_dn: &Dn, target: &str) -> Result<AliasPlan> {
        let norm_target = Dn::parse(target)?.normalize(&self.schema)?;

        if *alias_dn == norm_target {
            return Err(StoreError::AliasToSelf {
                alias: alias_dn.to_string(),
            }
            .into());
        }
        if alias_dn.starts_with(&norm_target) {
            return Err(StoreError::AliasCycle {
                alias: alias_dn.to_string(),
                target: norm_target.to_string(),
            }
            .into());
        }
        if !norm_target.starts_with(&self.suffix) {
            return Err(StoreError::AliasExternal {
                target: norm_target.to_string(),
                suffix: self.suffix.to_string(),
            }
            .into());
        }
        let target_id = match self.entry_id(&norm_target.to_string())? {
            Some(id) => id,
            None => {
                return Err(StoreError::AliasTargetMissing {
                    target: norm_target.to_string(),
                }
                .into())
            }
        };
        if self.alias.reverse_lookup(target_id)?.is_some() {
            return Err(StoreError::AliasChain {
                alias: alias_dn.to_string(),
                target: norm_target.to_string(),
            }
            .into());
        }

        Ok(AliasPlan {
            norm_target,
            target_id,
        })
    }

    /// Writes the alias tuples for a validated plan: the forward alias
    /// entry, the one-level jump at the parent (unless the target is a
    /// sibling), and subtree jumps for every ancestor below the suffix
    /// whose subtree does not already contain the target.
    fn apply_alias(&mut self, alias_id: u64, alias_dn: &Dn, plan: &AliasPlan) -> Result<()> {
        self.alias.add(&plan.norm_target.to_string(), alias_id)?;

        let Some(parent) = alias_dn.parent() else {
            return Ok(());
        };
        let parent_id = self.entry_id(&parent.to_string())?;

        if !plan.norm_target.is_sibling_of(alias_dn) {
            if let Some(pid) = parent_id {
                self.one_alias.add(&pid, plan.target_id)?;
            }
        }

        let mut ancestor = parent;
        let mut ancestor_id = parent_id;
        while ancestor != self.suffix {
            let Some(aid) = ancestor_id else { break };
            if !plan.norm_target.is_under(&ancestor) {
                self.sub_alias.add(&aid, plan.target_id)?;
            }
            match ancestor.parent() {
                Some(next) => {
                    ancestor = next;
                    ancestor_id = self.entry_id(&ancestor.to_string())?;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Removes every tuple the alias contributed: the scope jumps along
    /// its ancestor chain, then the forward alias entry itself. Only this
    /// alias's `(ancestor, target)` tuples are touched; other aliases of
    /// the same target keep theirs.
    fn drop_alias_indices(&mut self, alias_id: u64) -> Result<()> {
        let Some(target) = self.alias.reverse_lookup(alias_id)? else {
            return Ok(());
        };
        let target_id = self.entry_id(&target)?;
        let alias_dn = self.current_dn(alias_id)?;

        if let (Some(target_id), Some(parent)) = (target_id, alias_dn.parent()) {
            let mut ancestor = parent;
            let mut ancestor_id = self.entry_id(&ancestor.to_string())?;
            if let Some(aid) = ancestor_id {
                self.one_alias.drop_pair(&aid, target_id)?;
                self.sub_alias.drop_pair(&aid, target_id)?;
            }
            while ancestor != self.suffix {
                let Some(next) = ancestor.parent() else { break };
                ancestor = next;
                ancestor_id = self.entry_id(&ancestor.to_string())?;
                if let Some(aid) = ancestor_id {
                    self.sub_alias.drop_pair(&aid, target_id)?;
                }
            }
        }

        self.alias.drop_all(alias_id)?;
        Ok(())
    }

    /// For an alias living inside a subtree about to move: drops the
    /// scope tuples above the moved base (those ancestors stop being
    /// ancestors), leaving the forward alias entry and in-subtree tuples
    /// for the rename pass to rebuild.
    fn drop_alias_scope_above(&mut self, alias_id: u64, moved_base: &Dn) -> Result<()> {
        let Some(target) = self.alias.reverse_lookup(alias_id)? else {
            return Ok(());
        };
        let Some(target_id) = self.entry_id(&target)? else {
            return Ok(());
        };
        let alias_dn = self.current_dn(alias_id)?;
        let Some(parent) = moved_base.parent() else {
            return Ok(());
        };

        let mut ancestor = parent;
        let mut ancestor_id = self.entry_id(&ancestor.to_string())?;
        if let Some(aid) = ancestor_id {
            if alias_dn == *moved_base {
                self.one_alias.drop_pair(&aid, target_id)?;
            }
            self.sub_alias.drop_pair(&aid, target_id)?;
        }
        while ancestor != self.suffix {
            let Some(next) = ancestor.parent() else { break };
            ancestor = next;
            ancestor_id = self.entry_id(&ancestor.to_string())?;
            if let Some(aid) = ancestor_id {
                self.sub_alias.drop_pair(&aid, target_id)?;
            }
        }
        Ok(())
    }

    /// Sweeps the alias table before a move. Aliases *targeting* into the
    /// moved subtree are fully dropped and reported for re-targeting;
    /// aliases *living* in the moved subtree lose their above-base scope
    /// tuples and are rebuilt by the rename pass.
    fn drop_moved_alias_indices(&mut self, moved_base: &Dn) -> Result<Vec<(u64, Dn)>> {
        let tuples = self.alias.pairs()?;
        let mut retargets = Vec::new();

        for (target, alias_id) in tuples {
            let target_dn = Dn::parse(&target)?;
            let alias_dn = self.current_dn(alias_id)?;

            if target_dn.is_under(moved_base) {
                self.drop_alias_indices(alias_id)?;
                retargets.push((alias_id, target_dn));
            } else if alias_dn.is_under(moved_base) {
                self.drop_alias_scope_above(alias_id, moved_base)?;
            }
        }
        Ok(retargets)
    }

    // ---- diagnostics -----------------------------------------------------

    fn index_snapshot(&self, id: u64) -> Result<Entry> {
        let mut out = Entry::new();

        let dn = self.entry_dn(id)?.ok_or(StoreError::NoSuchObject {
            dn: format!("#{id}"),
        })?;
        out.put(Attribute::new("_nDn", [Value::from(dn)]));
        if let Some(updn) = self.entry_updn(id)? {
            out.put(Attribute::new("_upDn", [Value::from(updn)]));
        }
        if let Some(parent) = self.parent_id(id)? {
            out.put(Attribute::new("_parent", [Value::from(parent.to_string())]));
        }

        for index in self.user_indices.values() {
            let keys = index.reverse_keys(id)?;
            if !keys.is_empty() {
                out.put(Attribute::new(
                    index.attribute().primary_name(),
                    keys.into_iter().map(Value::from),
                ));
            }
        }

        for oid in self.presence.reverse_keys(id)? {
            out.put(Attribute::new(
                format!("_existence[{oid}]"),
                [Value::from(id.to_string())],
            ));
        }

        let children = self.hierarchy.list_ids(&id)?;
        if !children.is_empty() {
            out.put(Attribute::new(
                "_child",
                children.into_iter().map(|c| Value::from(c.to_string())),
            ));
        }

        Ok(out)
    }
}
