use std::collections::HashMap;
use std::sync::{RwLockReadGuard, RwLockWriteGuard};

use byteorder::{ByteOrder, LittleEndian};

use crate::b_tree::b_node::{Item, Node, Thresholds, MAX_KEY_SIZE, PAGE_NUMBER_SIZE};
use crate::b_tree::{BTree, BTreePageManager};
use crate::free_list::master_page::MasterPage;
use crate::prelude::*;

use super::collection::Collection;
use super::DatabaseInner;

// catalog value format:
// | root | counter |
// |  8B  |   8B    |
const COLLECTION_ENTRY_SIZE: usize = 2 * PAGE_NUMBER_SIZE;

/// The database gate, held for the whole life of a transaction.
enum Gate<'db> {
    Read(RwLockReadGuard<'db, DatabaseInner>),
    Write(RwLockWriteGuard<'db, DatabaseInner>),
}

impl<'db> Gate<'db> {
    fn inner(&self) -> &DatabaseInner {
        match self {
            Gate::Read(guard) => &**guard,
            Gate::Write(guard) => &**guard,
        }
    }

    fn inner_mut(&mut self) -> Result<&mut DatabaseInner> {
        match self {
            Gate::Write(guard) => Ok(&mut **guard),
            Gate::Read(_) => Err(Error::WriteInsideReadTx),
        }
    }
}

/// A copy-on-write view of the database.
///
/// Nodes touched by the transaction are staged in memory and only reach the
/// page store on `commit`. A write transaction holds the database
/// exclusively, read transactions share it.
pub struct Transaction<'db> {
    gate: Gate<'db>,
    dirty_nodes: HashMap<u64, Node>,
    pages_to_delete: Vec<u64>,
    allocated_pages: Vec<u64>,
    catalog_root: u64,
    finished: bool,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new_read(guard: RwLockReadGuard<'db, DatabaseInner>) -> Transaction<'db> {
        Self::new(Gate::Read(guard))
    }

    pub(crate) fn new_write(guard: RwLockWriteGuard<'db, DatabaseInner>) -> Transaction<'db> {
        Self::new(Gate::Write(guard))
    }

    fn new(gate: Gate<'db>) -> Transaction<'db> {
        let catalog_root = gate.inner().meta.root;
        Transaction {
            gate,
            dirty_nodes: HashMap::new(),
            pages_to_delete: Vec::new(),
            allocated_pages: Vec::new(),
            catalog_root,
            finished: false,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self.gate, Gate::Write(_))
    }

    /// Creates an empty collection. Fails when `name` is already taken.
    pub fn create_collection<'t>(&'t mut self, name: &[u8]) -> Result<Collection<'t, 'db>> {
        if !self.is_write() {
            return Err(Error::WriteInsideReadTx);
        }
        if name.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge(name.len()));
        }
        if self.catalog().find(name)?.is_some() {
            return Err(Error::CollectionAlreadyExists(
                String::from_utf8_lossy(name).into_owned(),
            ));
        }

        let root = self.page_new(vec![], vec![])?;
        self.page_write(&root)?;
        self.store_collection(name, root.page_num, 0)?;
        tracing::debug!(name = %String::from_utf8_lossy(name), root = root.page_num, "created collection");

        Ok(Collection::new(name.to_vec(), root.page_num, 0, self))
    }

    pub fn get_collection<'t>(&'t mut self, name: &[u8]) -> Result<Option<Collection<'t, 'db>>> {
        let Some(item) = self.catalog().find(name)? else {
            return Ok(None);
        };
        let (root, counter) = decode_collection(&item)?;
        Ok(Some(Collection::new(name.to_vec(), root, counter, self)))
    }

    /// Removes the collection and frees every page of its tree. Deleting a
    /// collection that does not exist does nothing.
    pub fn delete_collection(&mut self, name: &[u8]) -> Result<()> {
        if !self.is_write() {
            return Err(Error::WriteInsideReadTx);
        }
        let Some(item) = self.catalog().find(name)? else {
            return Ok(());
        };
        let (root, _) = decode_collection(&item)?;

        let pages = BTree::new(&mut *self, root).pages()?;
        for page_num in &pages {
            self.page_del(*page_num)?;
        }

        let mut catalog = self.catalog();
        catalog.remove(name)?;
        let catalog_root = catalog.root;
        self.catalog_root = catalog_root;
        tracing::debug!(name = %String::from_utf8_lossy(name), freed = pages.len(), "deleted collection");
        Ok(())
    }

    /// Writes the catalog entry of a collection.
    pub(crate) fn store_collection(&mut self, name: &[u8], root: u64, counter: u64) -> Result<()> {
        let mut value = [0; COLLECTION_ENTRY_SIZE];
        LittleEndian::write_u64(&mut value[..PAGE_NUMBER_SIZE], root);
        LittleEndian::write_u64(&mut value[PAGE_NUMBER_SIZE..], counter);

        let mut catalog = self.catalog();
        catalog.put(name, &value)?;
        let catalog_root = catalog.root;
        self.catalog_root = catalog_root;
        Ok(())
    }

    fn catalog(&mut self) -> BTree<&mut Self> {
        let root = self.catalog_root;
        BTree::new(self, root)
    }

    /// Writes the staged nodes, releases the deleted pages and persists the
    /// free list and the master page. On failure nothing is kept from the
    /// transaction and the pages it allocated are handed back.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        if !self.is_write() {
            return Ok(());
        }

        let dirty = self.dirty_nodes.len();
        let freed = self.pages_to_delete.len();
        let allocated = self.allocated_pages.len();
        match self.flush() {
            Ok(()) => {
                tracing::debug!(dirty, freed, allocated, "committed transaction");
                self.clear();
                Ok(())
            }
            Err(err) => {
                tracing::debug!(error = %err, "commit failed, discarding transaction");
                self.discard();
                Err(err)
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        let catalog_root = self.catalog_root;
        let inner = self.gate.inner_mut()?;

        let mut page_nums: Vec<&u64> = self.dirty_nodes.keys().collect();
        page_nums.sort();
        for page_num in page_nums {
            inner.write_node(&self.dirty_nodes[page_num])?;
        }

        let mut free_list = inner.free_list.clone();
        self.pages_to_delete.sort_unstable();
        self.pages_to_delete.dedup();
        for page_num in &self.pages_to_delete {
            free_list.release_page(*page_num);
        }
        free_list.reserve_chain(inner.store.page_size());
        inner.write_free_list(&free_list)?;

        let meta = MasterPage::new(catalog_root, inner.meta.free_list_page);
        inner.write_meta(&meta)?;
        inner.store.sync()?;

        inner.free_list = free_list;
        inner.meta = meta;
        Ok(())
    }

    /// Drops every staged change and returns the pages allocated by the
    /// transaction to the free list.
    pub fn rollback(mut self) {
        self.finished = true;
        tracing::debug!(
            dirty = self.dirty_nodes.len(),
            allocated = self.allocated_pages.len(),
            "rolled back transaction"
        );
        self.discard();
    }

    fn discard(&mut self) {
        if let Gate::Write(inner) = &mut self.gate {
            for page_num in self.allocated_pages.drain(..) {
                inner.free_list.release_page(page_num);
            }
        }
        self.clear();
    }

    fn clear(&mut self) {
        self.dirty_nodes.clear();
        self.pages_to_delete.clear();
        self.allocated_pages.clear();
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(write = self.is_write(), "transaction dropped without commit, rolling back");
            self.discard();
        }
    }
}

impl BTreePageManager for Transaction<'_> {
    fn thresholds(&self) -> Thresholds {
        self.gate.inner().thresholds
    }

    fn page_get(&self, page_num: u64) -> Result<Node> {
        if let Some(node) = self.dirty_nodes.get(&page_num) {
            return Ok(node.clone());
        }
        self.gate.inner().read_node(page_num)
    }

    fn page_new(&mut self, items: Vec<Item>, child_nodes: Vec<u64>) -> Result<Node> {
        let page_num = self.gate.inner_mut()?.free_list.get_next_page();
        self.allocated_pages.push(page_num);
        Ok(Node::new(page_num, items, child_nodes))
    }

    fn page_write(&mut self, node: &Node) -> Result<()> {
        self.gate.inner_mut()?;
        self.dirty_nodes.insert(node.page_num, node.clone());
        Ok(())
    }

    /// Pages allocated by this transaction were never visible to anyone
    /// else and go straight back to the free list.
    fn page_del(&mut self, page_num: u64) -> Result<()> {
        let inner = self.gate.inner_mut()?;
        self.dirty_nodes.remove(&page_num);
        match self.allocated_pages.iter().position(|page| *page == page_num) {
            Some(index) => {
                self.allocated_pages.swap_remove(index);
                inner.free_list.release_page(page_num);
            }
            None => self.pages_to_delete.push(page_num),
        }
        Ok(())
    }
}

fn decode_collection(item: &Item) -> Result<(u64, u64)> {
    if item.value.len() != COLLECTION_ENTRY_SIZE {
        return Err(Error::Generic(f!(
            "catalog entry {:?} is {} bytes, expected {}",
            String::from_utf8_lossy(&item.key),
            item.value.len(),
            COLLECTION_ENTRY_SIZE
        )));
    }
    let root = LittleEndian::read_u64(&item.value[..PAGE_NUMBER_SIZE]);
    let counter = LittleEndian::read_u64(&item.value[PAGE_NUMBER_SIZE..]);
    Ok((root, counter))
}
