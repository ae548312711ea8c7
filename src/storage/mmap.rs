//! # Memory-Mapped Paged File
//!
//! `PagedFile` maps a record file directly into the address space and
//! exposes it as an array of fixed-size pages. Reads return slices into
//! the mapping; no bytes are copied between kernel and user space, and
//! residency is delegated to the OS page cache.
//!
//! ## Safety model
//!
//! A mapping becomes invalid when the file is grown and remapped. Instead
//! of guarding that with runtime machinery, the API leans on the borrow
//! checker:
//!
//! ```text
//! page(&self) -> &[u8]          // shared borrow
//! page_mut(&mut self) -> &mut [u8]
//! grow(&mut self)               // exclusive borrow, no page refs alive
//! ```
//!
//! `grow` takes `&mut self`, so the compiler rejects any code that holds a
//! page slice across a remap.
//!
//! ## Durability
//!
//! `sync` flushes the mapping with `msync` (or the platform equivalent).
//! The record manager decides when to call it: after every mutation in
//! sync-on-write mode, otherwise on explicit sync or close.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::PAGE_SIZE;

#[derive(Debug)]
pub struct PagedFile {
    file: File,
    mmap: MmapMut,
    page_count: u32,
}

impl PagedFile {
    /// Opens an existing record file. The file size must be a non-zero
    /// multiple of the page size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open record file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot open empty record file '{}'",
            path.display()
        );
        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "record file '{}' size {} is not a multiple of the page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let page_count = (file_size / PAGE_SIZE as u64) as u32;

        // SAFETY: the file is opened read+write by this process and record
        // files are never shared with external writers. The mapping's
        // lifetime is tied to this struct, and all access is bounds-checked
        // through page()/page_mut().
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count,
        })
    }

    /// Creates (or truncates) a record file with `initial_page_count` pages.
    pub fn create<P: AsRef<Path>>(path: P, initial_page_count: u32) -> Result<Self> {
        let path = path.as_ref();

        ensure!(initial_page_count > 0, "initial page count must be at least 1");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create record file '{}'", path.display()))?;

        let file_size = initial_page_count as u64 * PAGE_SIZE as u64;
        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), file_size))?;

        // SAFETY: freshly created file with exclusive access, sized to a
        // page multiple above; all access is bounds-checked.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: initial_page_count,
        })
    }

    pub fn page(&self, page_no: u32) -> Result<&[u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );
        let offset = page_no as usize * PAGE_SIZE;
        Ok(&self.mmap[offset..offset + PAGE_SIZE])
    }

    pub fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );
        let offset = page_no as usize * PAGE_SIZE;
        Ok(&mut self.mmap[offset..offset + PAGE_SIZE])
    }

    /// Extends the file to `new_page_count` pages and remaps. A no-op when
    /// the file is already large enough.
    pub fn grow(&mut self, new_page_count: u32) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        self.mmap
            .flush_async()
            .wrap_err("failed to flush mapping before grow")?;

        let new_size = new_page_count as u64 * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend record file to {new_size} bytes"))?;

        // SAFETY: grow() holds &mut self, so no page slices are alive; the
        // old mapping was flushed and is dropped on reassignment.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file).wrap_err("failed to remap record file after grow")?
        };
        self.page_count = new_page_count;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to flush record file")
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }
}
