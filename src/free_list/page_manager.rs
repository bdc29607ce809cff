use crate::prelude::*;

use std::collections::HashMap;

/// Fixed-size page I/O. Page `n` lives at byte offset `n * page_size`.
pub trait PageStore: Send + Sync {
    fn page_size(&self) -> usize;

    /// Pages addressable by `read_page`.
    fn num_pages(&self) -> u64;

    fn read_page(&self, page_num: u64) -> Result<Vec<u8>>;

    /// Writing past the end grows the store.
    fn write_page(&mut self, page_num: u64, data: &[u8]) -> Result<()>;

    /// Makes every written page durable.
    fn sync(&mut self) -> Result<()>;

    fn close(self: Box<Self>) -> Result<()>;
}

/// Page store kept in memory, for tests and throwaway databases.
#[derive(Debug, Default)]
pub struct MemoryPageStore {
    page_size: usize,
    num_pages: u64,
    pages: HashMap<u64, Vec<u8>>,
}

impl MemoryPageStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            ..Default::default()
        }
    }
}

impl PageStore for MemoryPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn num_pages(&self) -> u64 {
        self.num_pages
    }

    fn read_page(&self, page_num: u64) -> Result<Vec<u8>> {
        if page_num >= self.num_pages {
            return Err(Error::PageOutOfBounds {
                page: page_num,
                num_pages: self.num_pages,
            });
        }
        Ok(self
            .pages
            .get(&page_num)
            .cloned()
            .unwrap_or_else(|| vec![0; self.page_size]))
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
        self.pages.insert(page_num, data.to_vec());
        self.num_pages = self.num_pages.max(page_num + 1);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let mut store = MemoryPageStore::new(128);
        assert_eq!(store.num_pages(), 0);
        assert!(matches!(
            store.read_page(0),
            Err(Error::PageOutOfBounds { page: 0, num_pages: 0 })
        ));

        store.write_page(3, &[7; 128]).unwrap();
        assert_eq!(store.num_pages(), 4);
        assert_eq!(store.read_page(3).unwrap(), vec![7; 128]);
        // pages below the end that were never written read as zeros
        assert_eq!(store.read_page(1).unwrap(), vec![0; 128]);

        assert!(store.write_page(4, &[1; 64]).is_err());
        assert_eq!(store.num_pages(), 4);
    }
}
