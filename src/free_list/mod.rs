pub mod master_page;
pub mod mmap;
pub mod page_manager;

use std::collections::HashSet;

use crate::prelude::*;

use byteorder::{ByteOrder, LittleEndian};

use crate::b_tree::b_node::PAGE_NUMBER_SIZE;

// free list node format, the head node lives on the master page's free list
// page and the rest are chained through `next`:
// | max page | next | count |  released pages  |
// |    8B    |  8B  |  2B   |    count * 8B    |
const FL_HEADER: usize = 2 * PAGE_NUMBER_SIZE + 2;

/// Page allocator. Page 0 belongs to the master page, so the first page
/// handed out is 1.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FreeList {
    /// High-water mark of allocated pages
    max_page: u64,
    /// Pages eligible for reuse, handed out last in first out
    released_pages: Vec<u64>,
    /// Overflow nodes after the head page, in chain order. They are in use
    /// and never part of `released_pages`.
    chain_pages: Vec<u64>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_page(&self) -> u64 {
        self.max_page
    }

    pub fn released_pages(&self) -> &[u64] {
        &self.released_pages
    }

    pub fn chain_pages(&self) -> &[u64] {
        &self.chain_pages
    }

    pub fn get_next_page(&mut self) -> u64 {
        if let Some(page_num) = self.released_pages.pop() {
            return page_num;
        }
        self.max_page += 1;
        self.max_page
    }

    /// The caller guarantees the page is neither live nor already released.
    pub fn release_page(&mut self, page_num: u64) {
        self.released_pages.push(page_num);
    }

    /// Number of released pages one free list node can hold.
    pub fn capacity(page_size: usize) -> usize {
        (page_size.saturating_sub(FL_HEADER) / PAGE_NUMBER_SIZE).min(u16::MAX as usize)
    }

    fn chain_len_needed(&self, capacity: usize) -> usize {
        self.released_pages
            .len()
            .saturating_sub(capacity)
            .div_ceil(capacity.max(1))
    }

    /// Sizes the overflow chain to the released set. New chain pages come
    /// from the list itself and surplus ones go back to it, keeping at most
    /// one spare page.
    pub fn reserve_chain(&mut self, page_size: usize) {
        let capacity = Self::capacity(page_size);
        while self.chain_pages.len() > self.chain_len_needed(capacity) + 1 {
            if let Some(page_num) = self.chain_pages.pop() {
                self.released_pages.push(page_num);
            }
        }
        while self.chain_pages.len() < self.chain_len_needed(capacity) {
            let page_num = self.get_next_page();
            self.chain_pages.push(page_num);
        }
    }

    /// Encodes the head node for `head_page` and every chain node, in
    /// chain order. `reserve_chain` must have run since the last release.
    pub fn serialize(&self, head_page: u64, page_size: usize) -> Result<Vec<(u64, Vec<u8>)>> {
        let capacity = Self::capacity(page_size);
        let nodes: Vec<u64> = std::iter::once(head_page)
            .chain(self.chain_pages.iter().copied())
            .collect();
        if self.released_pages.len() > capacity * nodes.len() {
            return Err(Error::FreeListOverflow {
                released: self.released_pages.len(),
                capacity: capacity * nodes.len(),
            });
        }

        let mut chunks = self.released_pages.chunks(capacity.max(1));
        let mut pages = Vec::with_capacity(nodes.len());
        for (i, page_num) in nodes.iter().enumerate() {
            let released = chunks.next().unwrap_or(&[]);
            let next = nodes.get(i + 1).copied().unwrap_or(0);

            let mut buf = vec![0; page_size];
            let mut pos = 0;
            LittleEndian::write_u64(&mut buf[pos..], self.max_page);
            pos += PAGE_NUMBER_SIZE;
            LittleEndian::write_u64(&mut buf[pos..], next);
            pos += PAGE_NUMBER_SIZE;
            LittleEndian::write_u16(&mut buf[pos..], released.len() as u16);
            pos += 2;

            for page in released {
                LittleEndian::write_u64(&mut buf[pos..], *page);
                pos += PAGE_NUMBER_SIZE;
            }
            pages.push((*page_num, buf));
        }
        Ok(pages)
    }

    /// Loads the list starting at `head_page`, following the chain with
    /// `read_page`.
    pub fn deserialize(head_page: u64, read_page: impl Fn(u64) -> Result<Vec<u8>>) -> Result<Self> {
        let mut free_list = FreeList::new();
        let mut visited = HashSet::from([head_page]);
        let mut page_num = head_page;

        loop {
            let buf = read_page(page_num)?;
            let corrupted = |reason| Error::CorruptedPage {
                page: page_num,
                reason,
            };
            if buf.len() < FL_HEADER {
                return Err(corrupted("truncated free list header"));
            }

            let max_page = LittleEndian::read_u64(&buf[..PAGE_NUMBER_SIZE]);
            let next = LittleEndian::read_u64(&buf[PAGE_NUMBER_SIZE..2 * PAGE_NUMBER_SIZE]);
            let count = LittleEndian::read_u16(&buf[2 * PAGE_NUMBER_SIZE..FL_HEADER]) as usize;
            if page_num == head_page {
                free_list.max_page = max_page;
            } else if max_page != free_list.max_page {
                return Err(corrupted("free list nodes disagree on the max page"));
            }

            let end = FL_HEADER + count * PAGE_NUMBER_SIZE;
            let released = buf
                .get(FL_HEADER..end)
                .ok_or(corrupted("released pages out of page"))?;
            free_list
                .released_pages
                .extend(released.chunks_exact(PAGE_NUMBER_SIZE).map(LittleEndian::read_u64));

            if next == 0 {
                break;
            }
            if next > free_list.max_page || !visited.insert(next) {
                return Err(corrupted("bad free list chain pointer"));
            }
            free_list.chain_pages.push(next);
            page_num = next;
        }

        let max_page = free_list.max_page;
        let bad = free_list
            .released_pages
            .iter()
            .any(|page| *page == 0 || *page > max_page || visited.contains(page));
        if bad {
            return Err(Error::CorruptedPage {
                page: head_page,
                reason: "released page outside of the allocated range",
            });
        }
        Ok(free_list)
    }
}
