//! # Page Types and Header Layout
//!
//! Every page in a record file begins with a 16-byte header describing its
//! contents. The header is read and written in place through `zerocopy`,
//! so no bytes are copied when inspecting a page.
//!
//! ## Header layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       1     page_type    BTreeLeaf, BTreeInterior, Free
//! 1       1     flags        reserved
//! 2       2     cell_count   number of cells in this page
//! 4       2     free_start   offset where free space begins
//! 6       2     free_end     offset where free space ends
//! 8       2     frag_bytes   fragmented bytes inside the cell area
//! 10      2     reserved
//! 12      4     link         interior: rightmost child page
//!                            leaf: next leaf page (0 = none)
//!                            free: next free page in the chain (0 = none)
//! ```
//!
//! Cells are allocated from the end of the page growing upward; the slot
//! array grows downward from the header. `free_start..free_end` is the gap
//! between them.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{PAGE_HEADER_SIZE, PAGE_SIZE};

/// Discriminates what a page stores.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    BTreeInterior = 0x01,
    BTreeLeaf = 0x02,
    /// Member of the free-page chain; `link` points at the next free page.
    Free = 0x10,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::BTreeInterior,
            0x02 => PageType::BTreeLeaf,
            0x10 => PageType::Free,
            _ => PageType::Unknown,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    page_type: u8,
    flags: u8,
    cell_count: U16,
    free_start: U16,
    free_end: U16,
    frag_bytes: U16,
    reserved: [u8; 2],
    link: U32,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn new(page_type: PageType) -> Self {
        Self {
            page_type: page_type as u8,
            flags: 0,
            cell_count: U16::new(0),
            free_start: U16::new(PAGE_HEADER_SIZE as u16),
            free_end: U16::new(PAGE_SIZE as u16),
            frag_bytes: U16::new(0),
            reserved: [0; 2],
            link: U32::new(0),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {e:?}"))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {e:?}"))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        data[..PAGE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_byte(self.page_type)
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.page_type = page_type as u8;
    }

    pub fn free_space(&self) -> u16 {
        self.free_end().saturating_sub(self.free_start())
    }

    crate::zerocopy_accessors! {
        cell_count: u16,
        free_start: u16,
        free_end: u16,
        frag_bytes: u16,
        link: u32,
    }
}

/// Sanity-checks the header of a page buffer. A fully zeroed page is
/// accepted: freshly grown pages have not been initialized yet.
pub fn validate_page(data: &[u8]) -> Result<()> {
    ensure!(
        data.len() == PAGE_SIZE,
        "invalid page size: {} != {}",
        data.len(),
        PAGE_SIZE
    );

    let header = PageHeader::from_bytes(data)?;

    let zeroed = header.page_type == 0
        && header.cell_count() == 0
        && header.free_start() == 0
        && header.free_end() == 0;
    if zeroed {
        return Ok(());
    }

    ensure!(
        header.page_type() != PageType::Unknown,
        "invalid page type: {:02x}",
        header.page_type
    );
    ensure!(
        header.free_start() >= PAGE_HEADER_SIZE as u16,
        "free_start {} < header size {}",
        header.free_start(),
        PAGE_HEADER_SIZE
    );
    ensure!(
        header.free_end() as usize <= PAGE_SIZE,
        "free_end {} > page size {}",
        header.free_end(),
        PAGE_SIZE
    );
    ensure!(
        header.free_start() <= header.free_end(),
        "free_start {} > free_end {}",
        header.free_start(),
        header.free_end()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_16_bytes() {
        assert_eq!(std::mem::size_of::<PageHeader>(), 16);
    }

    #[test]
    fn new_header_spans_whole_page() {
        let header = PageHeader::new(PageType::BTreeLeaf);
        assert_eq!(header.page_type(), PageType::BTreeLeaf);
        assert_eq!(header.cell_count(), 0);
        assert_eq!(header.free_start(), PAGE_HEADER_SIZE as u16);
        assert_eq!(header.free_end(), PAGE_SIZE as u16);
        assert_eq!(header.free_space(), (PAGE_SIZE - PAGE_HEADER_SIZE) as u16);
    }

    #[test]
    fn mutation_through_from_bytes_mut_sticks() {
        let mut data = [0u8; PAGE_SIZE];
        {
            let header = PageHeader::from_bytes_mut(&mut data).unwrap();
            header.set_page_type(PageType::Free);
            header.set_link(77);
            header.set_cell_count(3);
        }
        let header = PageHeader::from_bytes(&data).unwrap();
        assert_eq!(header.page_type(), PageType::Free);
        assert_eq!(header.link(), 77);
        assert_eq!(header.cell_count(), 3);
    }

    #[test]
    fn validate_accepts_zeroed_page() {
        let data = [0u8; PAGE_SIZE];
        assert!(validate_page(&data).is_ok());
    }

    #[test]
    fn validate_rejects_unknown_type() {
        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xEE;
        data[4] = PAGE_HEADER_SIZE as u8;
        data[7] = 0x40;
        assert!(validate_page(&data).is_err());
    }

    #[test]
    fn validate_rejects_inverted_free_range() {
        let mut data = [0u8; PAGE_SIZE];
        PageHeader::new(PageType::BTreeLeaf).write_to(&mut data).unwrap();
        {
            let header = PageHeader::from_bytes_mut(&mut data).unwrap();
            header.set_free_start(0x3000);
            header.set_free_end(0x2000);
        }
        assert!(validate_page(&data).is_err());
    }
}
