//! # Master Table
//!
//! The canonical entry store: a unique-key B+tree over `master.db`
//! mapping entry id (8-byte big-endian) to the serialized entry. The
//! persisted next-id counter lives in the file header and only ever
//! moves forward; deleted ids are never reissued.

use std::path::Path;

use eyre::Result;

use crate::btree::{create_root, BTree, TreeReader};
use crate::encoding::encode_id;
use crate::storage::RecordFile;

#[derive(Debug)]
pub struct MasterTable {
    file: RecordFile,
}

impl MasterTable {
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = RecordFile::open_or_create(path)?;
        if file.root_page()? == 0 {
            let root = create_root(&mut file)?;
            file.set_root_page(root)?;
        }
        Ok(Self { file })
    }

    /// Hands out the next entry id, advancing the persisted counter.
    pub fn next_id(&mut self) -> Result<u64> {
        self.file.next_id()
    }

    /// Upserts the serialized entry under `id`.
    pub fn put(&mut self, id: u64, entry: &[u8]) -> Result<()> {
        let root = self.file.root_page()?;
        let mut tree = BTree::open(&mut self.file, root)?;
        let inserted = tree.insert(&encode_id(id), entry, true)?;
        let new_root = tree.root();
        if new_root != root {
            self.file.set_root_page(new_root)?;
        }
        if inserted {
            let count = self.file.pair_count()?;
            self.file.set_pair_count(count + 1)?;
        }
        Ok(())
    }

    pub fn get(&self, id: u64) -> Result<Option<Vec<u8>>> {
        let root = self.file.root_page()?;
        TreeReader::new(&self.file, root).get(&encode_id(id))
    }

    /// Deletes the entry blob, reporting whether it existed. The id is
    /// not recycled.
    pub fn delete(&mut self, id: u64) -> Result<bool> {
        let root = self.file.root_page()?;
        let mut tree = BTree::open(&mut self.file, root)?;
        let removed = tree.remove(&encode_id(id))?;
        if removed {
            let count = self.file.pair_count()?;
            self.file.set_pair_count(count.saturating_sub(1))?;
        }
        Ok(removed)
    }

    /// Live entry count.
    pub fn count(&self) -> Result<u64> {
        self.file.pair_count()
    }

    pub fn sync(&self) -> Result<()> {
        self.file.commit()
    }
}
