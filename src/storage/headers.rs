//! # Record File Header
//!
//! Page 0 of every record file starts with a 128-byte header carrying the
//! file's identity and the persisted state the tables above need: the
//! primary tree root, the live pair count, the next-id counter (master
//! file only), and the head of the free-page chain. This is the property
//! sidecar of the record manager — everything a table persists besides its
//! tree pages lives here.
//!
//! ## Layout (128 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------------------------------
//! 0       16    magic
//! 16      4     version
//! 20      4     page_size
//! 24      4     root_page       primary B+tree root (0 = none yet)
//! 28      4     freelist_head   first page of the free chain (0 = none)
//! 32      4     freelist_count
//! 36      4     (padding)
//! 40      8     pair_count      live (key, value) pairs in the file
//! 48      8     next_id         id counter, master file only
//! 56      72    reserved
//! ```
//!
//! All multi-byte fields are little-endian via zerocopy wrapper types.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::FILE_HEADER_SIZE;
use crate::config::constants::FIRST_ENTRY_ID;

pub const FILE_MAGIC: &[u8; 16] = b"ditstore file v1";
pub const CURRENT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct StoreFileHeader {
    magic: [u8; 16],
    version: U32,
    page_size: U32,
    root_page: U32,
    freelist_head: U32,
    freelist_count: U32,
    padding: [u8; 4],
    pair_count: U64,
    next_id: U64,
    reserved: [u8; 72],
}

const _: () = assert!(std::mem::size_of::<StoreFileHeader>() == FILE_HEADER_SIZE);

impl StoreFileHeader {
    pub fn new() -> Self {
        Self {
            magic: *FILE_MAGIC,
            version: U32::new(CURRENT_VERSION),
            page_size: U32::new(super::PAGE_SIZE as u32),
            root_page: U32::new(0),
            freelist_head: U32::new(0),
            freelist_count: U32::new(0),
            padding: [0; 4],
            pair_count: U64::new(0),
            next_id: U64::new(FIRST_ENTRY_ID),
            reserved: [0; 72],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for StoreFileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse StoreFileHeader: {e:?}"))?;

        ensure!(&header.magic == FILE_MAGIC, "invalid record file magic");
        ensure!(
            header.version.get() == CURRENT_VERSION,
            "unsupported record file version {} (expected {})",
            header.version.get(),
            CURRENT_VERSION
        );
        ensure!(
            header.page_size.get() as usize == super::PAGE_SIZE,
            "record file page size {} does not match compiled page size {}",
            header.page_size.get(),
            super::PAGE_SIZE
        );

        Ok(header)
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for StoreFileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::mut_from_bytes(&mut bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse StoreFileHeader: {e:?}"))?;

        ensure!(&header.magic == FILE_MAGIC, "invalid record file magic");

        Ok(header)
    }

    pub fn write_to(&self, bytes: &mut [u8]) -> Result<()> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for StoreFileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );
        bytes[..FILE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    crate::zerocopy_accessors! {
        root_page: u32,
        freelist_head: u32,
        freelist_count: u32,
        pair_count: u64,
        next_id: u64,
    }
}

impl Default for StoreFileHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_exactly_128_bytes() {
        assert_eq!(std::mem::size_of::<StoreFileHeader>(), FILE_HEADER_SIZE);
    }

    #[test]
    fn new_header_round_trips() {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        let mut header = StoreFileHeader::new();
        header.set_root_page(5);
        header.set_pair_count(42);
        header.set_next_id(100);
        header.write_to(&mut buf).unwrap();

        let parsed = StoreFileHeader::from_bytes(&buf).unwrap();
        assert_eq!(parsed.version(), CURRENT_VERSION);
        assert_eq!(parsed.root_page(), 5);
        assert_eq!(parsed.pair_count(), 42);
        assert_eq!(parsed.next_id(), 100);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = [0u8; FILE_HEADER_SIZE];
        assert!(StoreFileHeader::from_bytes(&buf).is_err());
    }

    #[test]
    fn next_id_starts_at_first_entry_id() {
        assert_eq!(StoreFileHeader::new().next_id(), FIRST_ENTRY_ID);
    }
}
