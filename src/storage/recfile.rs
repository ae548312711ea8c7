//! # Record Manager
//!
//! `RecordFile` is the record manager of the engine: a page-granular
//! persistent blob store. Page 0 holds the [`StoreFileHeader`]; every
//! other page is either part of a B+tree or a member of the free-page
//! chain. Records are pages — `allocate` hands out a page number, `free`
//! returns it to the chain, and `commit` makes everything written so far
//! durable.
//!
//! ## Free-page chain
//!
//! Freed pages form an intrusive singly-linked list threaded through the
//! page headers themselves: a free page's `link` field names the next free
//! page, and the chain head lives in the file header. Allocation pops the
//! head; freeing pushes. No separate bookkeeping pages are needed.
//!
//! ## Durability
//!
//! Transactions are not used. Durability comes from explicit `commit`,
//! invoked by the store either after every mutation (sync-on-write) or on
//! demand. Between commits the OS may write pages back at its leisure;
//! a crash can lose the tail of un-committed work but never produces a
//! torn header, which is rewritten in full on every mutation of page 0.

use std::path::{Path, PathBuf};

use eyre::{ensure, Result};

use super::headers::StoreFileHeader;
use super::mmap::PagedFile;
use super::page::{validate_page, PageHeader, PageType};

#[derive(Debug)]
pub struct RecordFile {
    file: PagedFile,
    path: PathBuf,
}

impl RecordFile {
    /// Creates a fresh record file containing only the file header.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = PagedFile::create(&path, 1)?;
        StoreFileHeader::new().write_to(file.page_mut(0)?)?;
        Ok(Self { file, path })
    }

    /// Opens an existing record file, validating its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = PagedFile::open(&path)?;
        StoreFileHeader::from_bytes(file.page(0)?)?;
        Ok(Self { file, path })
    }

    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ---- header (property sidecar) ---------------------------------------

    fn header(&self) -> Result<&StoreFileHeader> {
        StoreFileHeader::from_bytes(self.file.page(0)?)
    }

    fn header_mut(&mut self) -> Result<&mut StoreFileHeader> {
        StoreFileHeader::from_bytes_mut(self.file.page_mut(0)?)
    }

    /// Root page of the primary tree, 0 when none has been created yet.
    pub fn root_page(&self) -> Result<u32> {
        Ok(self.header()?.root_page())
    }

    pub fn set_root_page(&mut self, page_no: u32) -> Result<()> {
        self.header_mut()?.set_root_page(page_no);
        Ok(())
    }

    /// Live (key, value) pair count of the tables hosted in this file.
    pub fn pair_count(&self) -> Result<u64> {
        Ok(self.header()?.pair_count())
    }

    pub fn set_pair_count(&mut self, count: u64) -> Result<()> {
        self.header_mut()?.set_pair_count(count);
        Ok(())
    }

    /// Returns the next id from the persisted counter and advances it.
    pub fn next_id(&mut self) -> Result<u64> {
        let header = self.header_mut()?;
        let id = header.next_id();
        header.set_next_id(id + 1);
        Ok(id)
    }

    // ---- page records ----------------------------------------------------

    pub fn page(&self, page_no: u32) -> Result<&[u8]> {
        ensure!(page_no != 0, "page 0 is reserved for the file header");
        self.file.page(page_no)
    }

    pub fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        ensure!(page_no != 0, "page 0 is reserved for the file header");
        self.file.page_mut(page_no)
    }

    /// Hands out a page: pops the free chain if possible, grows the file
    /// otherwise. The returned page content is unspecified; callers
    /// initialize it as a tree node before use.
    pub fn allocate(&mut self) -> Result<u32> {
        let head = self.header()?.freelist_head();

        if head != 0 {
            let next = PageHeader::from_bytes(self.file.page(head)?)?.link();
            let count = self.header()?.freelist_count();
            let header = self.header_mut()?;
            header.set_freelist_head(next);
            header.set_freelist_count(count.saturating_sub(1));
            return Ok(head);
        }

        let page_no = self.file.page_count();
        self.file.grow(page_no + 1)?;
        Ok(page_no)
    }

    /// Returns a page to the free chain.
    pub fn free(&mut self, page_no: u32) -> Result<()> {
        ensure!(page_no != 0, "cannot free the header page");
        ensure!(
            page_no < self.file.page_count(),
            "cannot free page {} beyond file end {}",
            page_no,
            self.file.page_count()
        );

        let head = self.header()?.freelist_head();
        {
            let page = self.file.page_mut(page_no)?;
            let mut node = PageHeader::new(PageType::Free);
            node.set_link(head);
            node.write_to(page)?;
        }
        let count = self.header()?.freelist_count();
        let header = self.header_mut()?;
        header.set_freelist_head(page_no);
        header.set_freelist_count(count + 1);
        Ok(())
    }

    pub fn free_page_count(&self) -> Result<u32> {
        Ok(self.header()?.freelist_count())
    }

    pub fn page_count(&self) -> u32 {
        self.file.page_count()
    }

    /// Flushes every page written so far to disk.
    pub fn commit(&self) -> Result<()> {
        self.file.sync()
    }

    /// Diagnostic sweep: checks the header of every page in the file.
    pub fn verify(&self) -> Result<()> {
        StoreFileHeader::from_bytes(self.file.page(0)?)?;
        for page_no in 1..self.file.page_count() {
            validate_page(self.file.page(page_no)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_grows_then_reuses_freed_pages() {
        let dir = tempdir().unwrap();
        let mut rf = RecordFile::create(dir.path().join("t.db")).unwrap();

        let a = rf.allocate().unwrap();
        let b = rf.allocate().unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        rf.free(a).unwrap();
        assert_eq!(rf.free_page_count().unwrap(), 1);

        let c = rf.allocate().unwrap();
        assert_eq!(c, a, "freed page is reused before growing");
        assert_eq!(rf.free_page_count().unwrap(), 0);
    }

    #[test]
    fn free_chain_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        {
            let mut rf = RecordFile::create(&path).unwrap();
            let a = rf.allocate().unwrap();
            let b = rf.allocate().unwrap();
            rf.free(a).unwrap();
            rf.free(b).unwrap();
            rf.commit().unwrap();
        }

        let mut rf = RecordFile::open(&path).unwrap();
        assert_eq!(rf.free_page_count().unwrap(), 2);
        assert_eq!(rf.allocate().unwrap(), 2);
        assert_eq!(rf.allocate().unwrap(), 1);
        assert_eq!(rf.allocate().unwrap(), 3);
    }

    #[test]
    fn next_id_is_monotonic_and_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        {
            let mut rf = RecordFile::create(&path).unwrap();
            assert_eq!(rf.next_id().unwrap(), 1);
            assert_eq!(rf.next_id().unwrap(), 2);
            rf.commit().unwrap();
        }

        let mut rf = RecordFile::open(&path).unwrap();
        assert_eq!(rf.next_id().unwrap(), 3);
    }

    #[test]
    fn page_zero_is_off_limits() {
        let dir = tempdir().unwrap();
        let mut rf = RecordFile::create(dir.path().join("t.db")).unwrap();
        assert!(rf.page(0).is_err());
        assert!(rf.page_mut(0).is_err());
        assert!(rf.free(0).is_err());
    }

    #[test]
    fn verify_accepts_a_healthy_file_and_catches_garbage() {
        let dir = tempdir().unwrap();
        let mut rf = RecordFile::create(dir.path().join("t.db")).unwrap();
        let page = rf.allocate().unwrap();
        rf.free(page).unwrap();
        rf.verify().unwrap();

        rf.page_mut(page).unwrap()[0] = 0xEE;
        assert!(rf.verify().is_err());
    }

    #[test]
    fn root_page_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        {
            let mut rf = RecordFile::create(&path).unwrap();
            rf.set_root_page(9).unwrap();
            rf.commit().unwrap();
        }
        let rf = RecordFile::open(&path).unwrap();
        assert_eq!(rf.root_page().unwrap(), 9);
    }
}
