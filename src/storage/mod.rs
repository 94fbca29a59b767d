//! Heapfile I/O.
//!
//! The heapfile holds the tree header in its first block and page i at
//! byte offset `(i+1)·P`. A descriptor is opened per call rather than
//! held for the life of the tree, so concurrent loads are independent at
//! the OS layer and nothing in the engine pins a file handle across
//! suspension points.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::Result;
use crate::page::{HeapfileHeader, HEAPFILE_HEADER_SIZE};
use crate::types::PageId;

/// Handle on the heapfile backing one tree
pub struct Heapfile {
    path: PathBuf,
    page_size: u32,
}

impl Heapfile {
    /// Wrap an existing or to-be-created heapfile
    pub fn new<P: Into<PathBuf>>(path: P, page_size: u32) -> Self {
        Self {
            path: path.into(),
            page_size,
        }
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read just the tree header fields from the start of a heapfile
    pub fn read_header(path: &Path) -> Result<HeapfileHeader> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; HEAPFILE_HEADER_SIZE];
        file.read_exact(&mut buf)?;
        HeapfileHeader::read(&buf)
    }

    /// Create or truncate the heapfile and write its header block
    pub fn create(&self, header: &HeapfileHeader) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        let mut buf = vec![0u8; self.page_size as usize];
        header.write(&mut buf);
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Rewrite the header block in place
    pub fn write_header(&self, header: &HeapfileHeader) -> Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        let mut buf = vec![0u8; self.page_size as usize];
        header.write(&mut buf);
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        Ok(())
    }

    /// Read page `id`'s block; a short read is an I/O error
    pub fn read_block(&self, id: PageId) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(id.file_offset(self.page_size)))?;
        let mut buf = vec![0u8; self.page_size as usize];
        file.read_exact(&mut buf)?;
        debug!("read block {} from {}", id, self.path.display());
        Ok(buf)
    }

    /// Write page `id`'s block
    pub fn write_block(&self, id: PageId, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size as usize);
        let mut file = OpenOptions::new().write(true).create(true).open(&self.path)?;
        file.seek(SeekFrom::Start(id.file_offset(self.page_size)))?;
        file.write_all(buf)?;
        debug!("wrote block {} to {}", id, self.path.display());
        Ok(())
    }

    /// Delete the heapfile (used when a closed tree indexes nothing)
    pub fn remove(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}
