//! # B+Tree Leaf Nodes
//!
//! Leaf nodes hold the actual key/value cells of a tree, one node per
//! page. A slot array after the page header keeps cells addressable in
//! sorted key order without moving cell bytes on insert or delete.
//!
//! ## Slot (8 bytes)
//!
//! ```text
//! +---------------------------+-----------+-----------+
//! |      prefix (4 bytes)     | offset 2B | key_len 2B|
//! +---------------------------+-----------+-----------+
//! ```
//!
//! The prefix caches the first four key bytes so most binary-search
//! probes compare a single `u32` instead of touching cell memory.
//!
//! ## Cell
//!
//! ```text
//! +------------------+------------------+------------------+
//! | key (key_len B)  | value_len varint | value            |
//! +------------------+------------------+------------------+
//! ```
//!
//! Cells grow upward from the page end; the slot array grows downward
//! from the header. Deleting a cell removes its slot and adds the cell
//! bytes to the fragmentation counter; the page is compacted lazily when
//! a later insert needs the fragmented space back.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::encoding::varint::{decode_varint, encode_varint, varint_len};
use crate::storage::{PageHeader, PageType, PAGE_HEADER_SIZE, PAGE_SIZE};

pub const SLOT_SIZE: usize = 8;
pub const LEAF_CONTENT_START: usize = PAGE_HEADER_SIZE;

/// Largest cell a leaf can host, leaving room for its slot.
pub const MAX_CELL_SIZE: usize = PAGE_SIZE - LEAF_CONTENT_START - SLOT_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq)]
pub struct Slot {
    pub prefix: [u8; 4],
    offset: U16,
    key_len: U16,
}

impl Slot {
    pub fn new(key: &[u8], offset: u16) -> Self {
        Self {
            prefix: extract_prefix(key),
            offset: U16::new(offset),
            key_len: U16::new(key.len() as u16),
        }
    }

    pub fn prefix_as_u32(&self) -> u32 {
        u32::from_be_bytes(self.prefix)
    }

    pub fn offset(&self) -> u16 {
        self.offset.get()
    }

    pub fn key_len(&self) -> u16 {
        self.key_len.get()
    }
}

/// First four bytes of `key`, zero-padded.
pub fn extract_prefix(key: &[u8]) -> [u8; 4] {
    let mut prefix = [0u8; 4];
    let len = key.len().min(4);
    prefix[..len].copy_from_slice(&key[..len]);
    prefix
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    /// Key absent; payload is the insertion point.
    NotFound(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct LeafNode<'a> {
    data: &'a [u8],
}

pub struct LeafNodeMut<'a> {
    data: &'a mut [u8],
}

impl<'a> LeafNode<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        let header = PageHeader::from_bytes(data)?;
        ensure!(
            header.page_type() == PageType::BTreeLeaf,
            "expected BTreeLeaf page, got {:?}",
            header.page_type()
        );
        Ok(Self { data })
    }

    fn header(&self) -> &PageHeader {
        // INVARIANT: length and type validated in from_page
        PageHeader::from_bytes(self.data).unwrap()
    }

    pub fn cell_count(&self) -> usize {
        self.header().cell_count() as usize
    }

    pub fn free_space(&self) -> usize {
        self.header().free_space() as usize
    }

    pub fn next_leaf(&self) -> u32 {
        self.header().link()
    }

    fn slot_offset(index: usize) -> usize {
        LEAF_CONTENT_START + index * SLOT_SIZE
    }

    pub fn slot_at(&self, index: usize) -> Result<&'a Slot> {
        ensure!(
            index < self.cell_count(),
            "slot index {} out of bounds (cell_count={})",
            index,
            self.cell_count()
        );
        let offset = Self::slot_offset(index);
        Slot::ref_from_bytes(&self.data[offset..offset + SLOT_SIZE])
            .map_err(|e| eyre::eyre!("failed to read slot {index}: {e:?}"))
    }

    pub fn key_at(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot_at(index)?;
        let start = slot.offset() as usize;
        let key_len = slot.key_len() as usize;
        ensure!(
            start + key_len <= PAGE_SIZE,
            "key extends beyond page boundary: offset={start}, key_len={key_len}"
        );
        Ok(&self.data[start..start + key_len])
    }

    pub fn value_at(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot_at(index)?;
        let value_start = slot.offset() as usize + slot.key_len() as usize;
        ensure!(value_start < PAGE_SIZE, "cell extends beyond page boundary");

        let (value_len, varint_size) = decode_varint(&self.data[value_start..])?;
        let data_start = value_start + varint_size;
        ensure!(
            data_start + value_len as usize <= PAGE_SIZE,
            "value extends beyond page boundary"
        );
        Ok(&self.data[data_start..data_start + value_len as usize])
    }

    /// Binary search by key. Probes compare cached prefixes first and only
    /// read full keys on a prefix tie.
    pub fn find_key(&self, key: &[u8]) -> SearchResult {
        let target_prefix = u32::from_be_bytes(extract_prefix(key));
        let mut lo = 0usize;
        let mut hi = self.cell_count();

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let slot = match self.slot_at(mid) {
                Ok(s) => s,
                Err(_) => return SearchResult::NotFound(mid),
            };

            let ord = match slot.prefix_as_u32().cmp(&target_prefix) {
                std::cmp::Ordering::Equal => {
                    let full = match self.key_at(mid) {
                        Ok(k) => k,
                        Err(_) => return SearchResult::NotFound(mid),
                    };
                    full.cmp(key)
                }
                other => other,
            };

            match ord {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return SearchResult::Found(mid),
            }
        }

        SearchResult::NotFound(lo)
    }
}

impl<'a> LeafNodeMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        LeafNode::from_page(data)?;
        Ok(Self { data })
    }

    /// Initializes the page as an empty leaf.
    pub fn init(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        PageHeader::new(PageType::BTreeLeaf).write_to(data)?;
        Ok(Self { data })
    }

    pub fn as_ref(&self) -> LeafNode<'_> {
        LeafNode { data: self.data }
    }

    pub fn cell_count(&self) -> usize {
        self.as_ref().cell_count()
    }

    pub fn free_space(&self) -> usize {
        self.as_ref().free_space()
    }

    pub fn key_at(&self, index: usize) -> Result<&[u8]> {
        let slot = *self.as_ref().slot_at(index)?;
        let start = slot.offset() as usize;
        Ok(&self.data[start..start + slot.key_len() as usize])
    }

    pub fn find_key(&self, key: &[u8]) -> SearchResult {
        self.as_ref().find_key(key)
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        // INVARIANT: length and type validated in from_page/init
        PageHeader::from_bytes_mut(self.data).unwrap()
    }

    /// Free bytes counting both the contiguous gap and fragmentation.
    fn reclaimable_space(&self) -> usize {
        let header = self.as_ref();
        header.free_space() + header.header().frag_bytes() as usize
    }

    /// Whether this page can take the cell, compacting if necessary.
    pub fn can_host(&self, key: &[u8], value: &[u8]) -> bool {
        let cell_size = key.len() + varint_len(value.len() as u64) + value.len();
        cell_size <= MAX_CELL_SIZE && cell_size + SLOT_SIZE <= self.reclaimable_space()
    }

    /// Inserts a cell, keeping slots sorted. Fails if the key exists or
    /// the page cannot host the cell even after compaction.
    pub fn insert_cell(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let cell_size = key.len() + varint_len(value.len() as u64) + value.len();
        let space_needed = cell_size + SLOT_SIZE;

        ensure!(
            cell_size <= MAX_CELL_SIZE,
            "cell of {} bytes exceeds page capacity {}",
            cell_size,
            MAX_CELL_SIZE
        );

        if self.free_space() < space_needed {
            ensure!(
                self.reclaimable_space() >= space_needed,
                "not enough free space: need {}, have {}",
                space_needed,
                self.reclaimable_space()
            );
            self.compact()?;
        }

        let insert_pos = match self.find_key(key) {
            SearchResult::Found(_) => bail!("key already exists"),
            SearchResult::NotFound(pos) => pos,
        };

        let free_end = self.as_ref().header().free_end() as usize;
        let new_free_end = free_end - cell_size;
        let mut offset = new_free_end;

        self.data[offset..offset + key.len()].copy_from_slice(key);
        offset += key.len();
        offset += encode_varint(value.len() as u64, &mut self.data[offset..]);
        self.data[offset..offset + value.len()].copy_from_slice(value);

        let cell_count = self.cell_count();
        for i in (insert_pos..cell_count).rev() {
            let src = LeafNode::slot_offset(i);
            let dst = LeafNode::slot_offset(i + 1);
            self.data.copy_within(src..src + SLOT_SIZE, dst);
        }

        let slot = Slot::new(key, new_free_end as u16);
        let slot_offset = LeafNode::slot_offset(insert_pos);
        self.data[slot_offset..slot_offset + SLOT_SIZE].copy_from_slice(slot.as_bytes());

        let header = self.header_mut();
        header.set_cell_count(cell_count as u16 + 1);
        header.set_free_start(header.free_start() + SLOT_SIZE as u16);
        header.set_free_end(new_free_end as u16);

        Ok(())
    }

    /// Removes the cell at `index`, leaving its bytes as fragmentation.
    pub fn delete_cell(&mut self, index: usize) -> Result<()> {
        let cell_count = self.cell_count();
        ensure!(
            index < cell_count,
            "delete index {} out of bounds (cell_count={})",
            index,
            cell_count
        );

        let slot = *self.as_ref().slot_at(index)?;
        let value_start = slot.offset() as usize + slot.key_len() as usize;
        let (value_len, varint_size) = decode_varint(&self.data[value_start..])?;
        let cell_size = slot.key_len() as usize + varint_size + value_len as usize;

        for i in index..cell_count - 1 {
            let src = LeafNode::slot_offset(i + 1);
            let dst = LeafNode::slot_offset(i);
            self.data.copy_within(src..src + SLOT_SIZE, dst);
        }

        let header = self.header_mut();
        header.set_cell_count(cell_count as u16 - 1);
        header.set_free_start(header.free_start() - SLOT_SIZE as u16);
        header.set_frag_bytes(header.frag_bytes().saturating_add(cell_size as u16));

        Ok(())
    }

    /// Rewrites all live cells contiguously at the page end, zeroing the
    /// fragmentation counter.
    fn compact(&mut self) -> Result<()> {
        let cell_count = self.cell_count();

        let mut cells: Vec<(Slot, Vec<u8>)> = Vec::with_capacity(cell_count);
        for i in 0..cell_count {
            let slot = *self.as_ref().slot_at(i)?;
            let start = slot.offset() as usize;
            let value_start = start + slot.key_len() as usize;
            let (value_len, varint_size) = decode_varint(&self.data[value_start..])?;
            let end = value_start + varint_size + value_len as usize;
            cells.push((slot, self.data[start..end].to_vec()));
        }

        let mut new_free_end = PAGE_SIZE;
        for (i, (mut slot, bytes)) in cells.into_iter().enumerate() {
            new_free_end -= bytes.len();
            self.data[new_free_end..new_free_end + bytes.len()].copy_from_slice(&bytes);
            slot.offset = U16::new(new_free_end as u16);
            let slot_offset = LeafNode::slot_offset(i);
            self.data[slot_offset..slot_offset + SLOT_SIZE].copy_from_slice(slot.as_bytes());
        }

        let header = self.header_mut();
        header.set_free_end(new_free_end as u16);
        header.set_frag_bytes(0);

        Ok(())
    }

    pub fn set_next_leaf(&mut self, page_no: u32) {
        self.header_mut().set_link(page_no);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_page() -> Vec<u8> {
        vec![0u8; PAGE_SIZE]
    }

    #[test]
    fn slot_is_8_bytes() {
        assert_eq!(std::mem::size_of::<Slot>(), SLOT_SIZE);
    }

    #[test]
    fn prefix_extraction_pads_short_keys() {
        assert_eq!(extract_prefix(b"abcdef"), [b'a', b'b', b'c', b'd']);
        assert_eq!(extract_prefix(b"xy"), [b'x', b'y', 0, 0]);
        assert_eq!(extract_prefix(b""), [0, 0, 0, 0]);
    }

    #[test]
    fn insert_keeps_cells_sorted() {
        let mut page = make_page();
        let mut leaf = LeafNodeMut::init(&mut page).unwrap();

        leaf.insert_cell(b"ou=system", b"1").unwrap();
        leaf.insert_cell(b"cn=a,ou=system", b"2").unwrap();
        leaf.insert_cell(b"dc=example", b"3").unwrap();

        assert_eq!(leaf.cell_count(), 3);
        assert_eq!(leaf.key_at(0).unwrap(), b"cn=a,ou=system");
        assert_eq!(leaf.key_at(1).unwrap(), b"dc=example");
        assert_eq!(leaf.key_at(2).unwrap(), b"ou=system");
    }

    #[test]
    fn find_key_with_prefix_collisions() {
        let mut page = make_page();
        let mut leaf = LeafNodeMut::init(&mut page).unwrap();

        leaf.insert_cell(b"test1", b"a").unwrap();
        leaf.insert_cell(b"test2", b"b").unwrap();
        leaf.insert_cell(b"test30", b"c").unwrap();

        assert_eq!(leaf.find_key(b"test1"), SearchResult::Found(0));
        assert_eq!(leaf.find_key(b"test2"), SearchResult::Found(1));
        assert_eq!(leaf.find_key(b"test30"), SearchResult::Found(2));
        assert_eq!(leaf.find_key(b"test0"), SearchResult::NotFound(0));
        assert_eq!(leaf.find_key(b"test3"), SearchResult::NotFound(2));
        assert_eq!(leaf.find_key(b"test9"), SearchResult::NotFound(3));
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut page = make_page();
        let mut leaf = LeafNodeMut::init(&mut page).unwrap();

        leaf.insert_cell(b"key", b"v1").unwrap();
        let err = leaf.insert_cell(b"key", b"v2").unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn delete_then_reinsert_reclaims_fragmentation() {
        let mut page = make_page();
        let mut leaf = LeafNodeMut::init(&mut page).unwrap();

        // Fill the page with evenly sized cells.
        let value = vec![0xAB; 100];
        let mut count = 0;
        loop {
            let key = format!("key{count:05}");
            if leaf.free_space() < key.len() + 2 + value.len() + SLOT_SIZE {
                break;
            }
            leaf.insert_cell(key.as_bytes(), &value).unwrap();
            count += 1;
        }
        assert!(count > 100);

        // Delete half, then reinsert: compaction must make the space usable.
        for i in (0..count).step_by(2) {
            let key = format!("key{i:05}");
            match leaf.find_key(key.as_bytes()) {
                SearchResult::Found(idx) => leaf.delete_cell(idx).unwrap(),
                SearchResult::NotFound(_) => panic!("missing {key}"),
            }
        }
        for i in (0..count).step_by(2) {
            let key = format!("new{i:05}");
            leaf.insert_cell(key.as_bytes(), &value).unwrap();
        }
        assert_eq!(leaf.cell_count(), count);
    }

    #[test]
    fn values_read_back_zero_copy() {
        let mut page = make_page();
        let mut leaf = LeafNodeMut::init(&mut page).unwrap();
        leaf.insert_cell(b"k", b"directory value").unwrap();

        let node = LeafNode::from_page(&page).unwrap();
        let value = node.value_at(0).unwrap();
        assert_eq!(value, b"directory value");
        let page_range = page.as_ptr() as usize..page.as_ptr() as usize + PAGE_SIZE;
        assert!(page_range.contains(&(value.as_ptr() as usize)));
    }

    #[test]
    fn oversized_cell_rejected() {
        let mut page = make_page();
        let mut leaf = LeafNodeMut::init(&mut page).unwrap();
        let huge = vec![0u8; PAGE_SIZE];
        assert!(leaf.insert_cell(b"k", &huge).is_err());
    }

    #[test]
    fn next_leaf_link_round_trips() {
        let mut page = make_page();
        let mut leaf = LeafNodeMut::init(&mut page).unwrap();
        leaf.set_next_leaf(42);
        assert_eq!(leaf.as_ref().next_leaf(), 42);
    }
}
