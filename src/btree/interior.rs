//! # B+Tree Interior Nodes
//!
//! Interior nodes hold separator keys and child page pointers. The slot
//! array embeds the child pointer next to the key prefix, so navigation
//! usually touches only the slot array:
//!
//! ```text
//! InteriorSlot (12 bytes):
//! +---------------------------+---------------------+---------+---------+
//! |      prefix (4 bytes)     | child_page (4 bytes)| off 2B  | klen 2B |
//! +---------------------------+---------------------+---------+---------+
//! ```
//!
//! Navigation for a search key K: keys strictly below `separator[i]` route
//! to `slot[i].child_page`; keys at or above every separator route to the
//! page header's `link` field (the rightmost child).

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::leaf::extract_prefix;
use crate::storage::{PageHeader, PageType, PAGE_HEADER_SIZE, PAGE_SIZE};

pub const INTERIOR_SLOT_SIZE: usize = 12;
pub const INTERIOR_CONTENT_START: usize = PAGE_HEADER_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq)]
pub struct InteriorSlot {
    pub prefix: [u8; 4],
    child_page: U32,
    offset: U16,
    key_len: U16,
}

const _: () = assert!(std::mem::size_of::<InteriorSlot>() == INTERIOR_SLOT_SIZE);

impl InteriorSlot {
    pub fn new(key: &[u8], child_page: u32, offset: u16) -> Self {
        Self {
            prefix: extract_prefix(key),
            child_page: U32::new(child_page),
            offset: U16::new(offset),
            key_len: U16::new(key.len() as u16),
        }
    }

    pub fn prefix_as_u32(&self) -> u32 {
        u32::from_be_bytes(self.prefix)
    }

    pub fn child_page(&self) -> u32 {
        self.child_page.get()
    }

    pub fn offset(&self) -> u16 {
        self.offset.get()
    }

    pub fn key_len(&self) -> u16 {
        self.key_len.get()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InteriorNode<'a> {
    data: &'a [u8],
}

pub struct InteriorNodeMut<'a> {
    data: &'a mut [u8],
}

impl<'a> InteriorNode<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        let header = PageHeader::from_bytes(data)?;
        ensure!(
            header.page_type() == PageType::BTreeInterior,
            "expected BTreeInterior page, got {:?}",
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

    pub fn right_child(&self) -> u32 {
        self.header().link()
    }

    fn slot_offset(index: usize) -> usize {
        INTERIOR_CONTENT_START + index * INTERIOR_SLOT_SIZE
    }

    pub fn slot_at(&self, index: usize) -> Result<&'a InteriorSlot> {
        ensure!(
            index < self.cell_count(),
            "slot index {} out of bounds (cell_count={})",
            index,
            self.cell_count()
        );
        let offset = Self::slot_offset(index);
        InteriorSlot::ref_from_bytes(&self.data[offset..offset + INTERIOR_SLOT_SIZE])
            .map_err(|e| eyre::eyre!("failed to read interior slot {index}: {e:?}"))
    }

    pub fn key_at(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot_at(index)?;
        let start = slot.offset() as usize;
        let key_len = slot.key_len() as usize;
        ensure!(
            start + key_len <= PAGE_SIZE,
            "separator extends beyond page boundary"
        );
        Ok(&self.data[start..start + key_len])
    }

    /// Child page the search for `key` must continue in. The second return
    /// is the slot index taken, `None` for the rightmost child.
    pub fn find_child(&self, key: &[u8]) -> Result<(u32, Option<usize>)> {
        let count = self.cell_count();
        if count == 0 {
            return Ok((self.right_child(), None));
        }

        let key_prefix = u32::from_be_bytes(extract_prefix(key));
        let mut lo = 0usize;
        let mut hi = count;

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let slot = self.slot_at(mid)?;

            match key_prefix.cmp(&slot.prefix_as_u32()) {
                std::cmp::Ordering::Less => hi = mid,
                std::cmp::Ordering::Greater => lo = mid + 1,
                std::cmp::Ordering::Equal => {
                    if key < self.key_at(mid)? {
                        hi = mid;
                    } else {
                        lo = mid + 1;
                    }
                }
            }
        }

        if lo < count {
            Ok((self.slot_at(lo)?.child_page(), Some(lo)))
        } else {
            Ok((self.right_child(), None))
        }
    }

    /// Every child page of this node, left to right.
    pub fn child_pages(&self) -> Result<Vec<u32>> {
        let mut children = Vec::with_capacity(self.cell_count() + 1);
        for i in 0..self.cell_count() {
            children.push(self.slot_at(i)?.child_page());
        }
        children.push(self.right_child());
        Ok(children)
    }
}

impl<'a> InteriorNodeMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        InteriorNode::from_page(data)?;
        Ok(Self { data })
    }

    /// Initializes the page as an empty interior node whose rightmost
    /// child is `right_child`.
    pub fn init(data: &'a mut [u8], right_child: u32) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        let mut header = PageHeader::new(PageType::BTreeInterior);
        header.set_link(right_child);
        header.write_to(data)?;
        Ok(Self { data })
    }

    pub fn as_ref(&self) -> InteriorNode<'_> {
        InteriorNode { data: self.data }
    }

    pub fn cell_count(&self) -> usize {
        self.as_ref().cell_count()
    }

    pub fn right_child(&self) -> u32 {
        self.as_ref().right_child()
    }

    pub fn free_space(&self) -> usize {
        self.as_ref().header().free_space() as usize
    }

    pub fn key_at(&self, index: usize) -> Result<&[u8]> {
        let slot = *self.as_ref().slot_at(index)?;
        let start = slot.offset() as usize;
        Ok(&self.data[start..start + slot.key_len() as usize])
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        // INVARIANT: length and type validated in from_page/init
        PageHeader::from_bytes_mut(self.data).unwrap()
    }

    /// Inserts a separator routing keys below it to `left_child`.
    pub fn insert_separator(&mut self, key: &[u8], left_child: u32) -> Result<()> {
        let space_needed = key.len() + INTERIOR_SLOT_SIZE;
        ensure!(
            self.free_space() >= space_needed,
            "not enough free space for separator: need {}, have {}",
            space_needed,
            self.free_space()
        );

        let insert_pos = self.find_insert_position(key)?;

        let free_end = self.as_ref().header().free_end() as usize;
        let new_free_end = free_end - key.len();
        self.data[new_free_end..new_free_end + key.len()].copy_from_slice(key);

        let cell_count = self.cell_count();
        for i in (insert_pos..cell_count).rev() {
            let src = InteriorNode::slot_offset(i);
            let dst = InteriorNode::slot_offset(i + 1);
            self.data.copy_within(src..src + INTERIOR_SLOT_SIZE, dst);
        }

        let slot = InteriorSlot::new(key, left_child, new_free_end as u16);
        let slot_offset = InteriorNode::slot_offset(insert_pos);
        self.data[slot_offset..slot_offset + INTERIOR_SLOT_SIZE]
            .copy_from_slice(slot.as_bytes());

        let header = self.header_mut();
        header.set_cell_count(cell_count as u16 + 1);
        header.set_free_start(header.free_start() + INTERIOR_SLOT_SIZE as u16);
        header.set_free_end(new_free_end as u16);

        Ok(())
    }

    fn find_insert_position(&self, key: &[u8]) -> Result<usize> {
        let node = self.as_ref();
        let mut lo = 0usize;
        let mut hi = node.cell_count();

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match node.key_at(mid)?.cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => bail!("separator key already exists"),
            }
        }
        Ok(lo)
    }

    pub fn set_right_child(&mut self, page_no: u32) {
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
    fn interior_slot_is_12_bytes() {
        assert_eq!(std::mem::size_of::<InteriorSlot>(), INTERIOR_SLOT_SIZE);
    }

    #[test]
    fn empty_node_routes_to_right_child() {
        let mut page = make_page();
        let node = InteriorNodeMut::init(&mut page, 7).unwrap();
        let (child, idx) = node.as_ref().find_child(b"anything").unwrap();
        assert_eq!(child, 7);
        assert_eq!(idx, None);
    }

    #[test]
    fn separators_route_keys_by_range() {
        let mut page = make_page();
        let mut node = InteriorNodeMut::init(&mut page, 30).unwrap();

        node.insert_separator(b"m", 10).unwrap();
        node.insert_separator(b"t", 20).unwrap();

        let node = InteriorNode::from_page(&page).unwrap();
        assert_eq!(node.find_child(b"a").unwrap().0, 10);
        assert_eq!(node.find_child(b"m").unwrap().0, 20);
        assert_eq!(node.find_child(b"s").unwrap().0, 20);
        assert_eq!(node.find_child(b"t").unwrap().0, 30);
        assert_eq!(node.find_child(b"z").unwrap().0, 30);
    }

    #[test]
    fn child_pages_lists_left_to_right() {
        let mut page = make_page();
        let mut node = InteriorNodeMut::init(&mut page, 3).unwrap();
        node.insert_separator(b"b", 1).unwrap();
        node.insert_separator(b"d", 2).unwrap();

        assert_eq!(node.as_ref().child_pages().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_separator_rejected() {
        let mut page = make_page();
        let mut node = InteriorNodeMut::init(&mut page, 9).unwrap();
        node.insert_separator(b"k", 1).unwrap();
        assert!(node.insert_separator(b"k", 2).is_err());
    }
}
