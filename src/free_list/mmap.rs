use crate::prelude::*;

use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;

use super::page_manager::PageStore;

const INITIAL_MMAP_SIZE: usize = 64 << 20; // 64 MiB

/// File backed page store. The file is mapped in chunks that double in
/// size, and grown ahead of the pages written to it.
pub struct MmapPageStore {
    file_pointer: File,
    page_size: usize,
    /** file size, can be larger than the database size */
    file: u64,
    /** mmap size, can be larger than the file size */
    total: usize,
    /** multiple mmaps, can be non-continuous */
    chunks: Vec<MmapMut>,
}

impl MmapPageStore {
    /// Opens or creates the file at `path`.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<MmapPageStore> {
        let file_pointer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;

        let file_size = file_pointer.metadata()?.len();
        if file_size % page_size as u64 != 0 {
            return Err(Error::Generic(f!(
                "file size {} is not a multiple of the page size {}",
                file_size,
                page_size
            )));
        }

        let mut mmap_size = INITIAL_MMAP_SIZE.div_ceil(page_size) * page_size;
        while (mmap_size as u64) < file_size {
            mmap_size *= 2;
        }

        // mmap_size can be larger than the file
        let mmap = unsafe { MmapOptions::new().len(mmap_size).map_mut(&file_pointer)? };

        Ok(MmapPageStore {
            file_pointer,
            page_size,
            file: file_size,
            total: mmap_size,
            chunks: vec![mmap],
        })
    }

    fn extend_file(&mut self, npages: u64) -> Result<()> {
        let mut file_pages = self.file / self.page_size as u64;
        if file_pages >= npages {
            return Ok(());
        }

        while file_pages < npages {
            // the file size is increased exponentially,
            // so that we don't have to extend the file for every update.
            let inc = (file_pages / 8).max(1);
            file_pages += inc;
        }

        let file_size = file_pages * self.page_size as u64;
        self.file_pointer.set_len(file_size)?;
        tracing::trace!(file_size, "extended database file");

        self.file = file_size;
        Ok(())
    }

    fn extend_mmap(&mut self, npages: u64) -> Result<()> {
        while (self.total as u64) < npages * self.page_size as u64 {
            let chunk = unsafe {
                MmapOptions::new()
                    .offset(self.total as u64)
                    .len(self.total)
                    .map_mut(&self.file_pointer)?
            };

            self.total *= 2;
            self.chunks.push(chunk);
        }
        Ok(())
    }

    /** returns the chunk index and then the offset of the page the ptr is referring to */
    fn get_offset_of_ptr(&self, ptr: u64) -> Result<(usize, usize)> {
        let mut start: u64 = 0;
        for (i, chunk) in self.chunks.iter().enumerate() {
            let end = start + (chunk.len() / self.page_size) as u64;
            if ptr < end {
                let offset = self.page_size * (ptr - start) as usize;
                return Ok((i, offset));
            }
            start = end;
        }
        Err(Error::PageOutOfBounds {
            page: ptr,
            num_pages: self.num_pages(),
        })
    }
}

impl PageStore for MmapPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn num_pages(&self) -> u64 {
        self.file / self.page_size as u64
    }

    fn read_page(&self, page_num: u64) -> Result<Vec<u8>> {
        if page_num >= self.num_pages() {
            return Err(Error::PageOutOfBounds {
                page: page_num,
                num_pages: self.num_pages(),
            });
        }

        let (chunk_index, offset) = self.get_offset_of_ptr(page_num)?;
        let chunk = &self.chunks[chunk_index];
        Ok(chunk[offset..offset + self.page_size].to_vec())
    }

    fn write_page(&mut self, page_num: u64, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(Error::Generic(f!(
                "page {} is {} bytes, expected {}",
                page_num,
                data.len(),
                self.page_size
            )));
        }

        self.extend_file(page_num + 1)?;
        self.extend_mmap(page_num + 1)?;

        let (chunk_index, offset) = self.get_offset_of_ptr(page_num)?;
        let page_size = self.page_size;
        let chunk = &mut self.chunks[chunk_index];
        chunk[offset..offset + page_size].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        for chunk in &self.chunks {
            chunk.flush()?;
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.sync()?;
        self.chunks.clear();
        Ok(())
    }
}
