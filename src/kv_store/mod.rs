mod collection;
mod options;
mod transaction;

use std::path::Path;
use std::sync::RwLock;

pub use self::collection::Collection;
pub use self::options::{Options, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
pub use self::transaction::Transaction;

use crate::b_tree::b_node::{Node, Thresholds};
use crate::free_list::master_page::{MasterPage, META_PAGE_NUMBER};
use crate::free_list::mmap::MmapPageStore;
use crate::free_list::page_manager::{MemoryPageStore, PageStore};
use crate::free_list::FreeList;
use crate::prelude::*;

/// Handle to an open database.
///
/// All access goes through transactions: any number of read transactions
/// may run at once, a write transaction runs alone.
pub struct Database {
    inner: RwLock<DatabaseInner>,
}

pub(crate) struct DatabaseInner {
    store: Box<dyn PageStore>,
    meta: MasterPage,
    free_list: FreeList,
    thresholds: Thresholds,
}

impl Database {
    /// Opens the database file at `path`, creating it when it is empty or
    /// missing.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Database> {
        options.validate()?;
        let store = MmapPageStore::open(path.as_ref(), options.page_size)?;
        tracing::debug!(path = %path.as_ref().display(), "opening database file");
        Self::with_store(Box::new(store), options)
    }

    /// A database that lives in memory and is lost on close.
    pub fn in_memory(options: Options) -> Result<Database> {
        Self::with_store(Box::new(MemoryPageStore::new(options.page_size)), options)
    }

    pub fn with_store(store: Box<dyn PageStore>, options: Options) -> Result<Database> {
        options.validate()?;
        if store.page_size() != options.page_size {
            return Err(Error::InvalidOptions(f!(
                "store pages are {} bytes, options ask for {}",
                store.page_size(),
                options.page_size
            )));
        }

        let thresholds = options.thresholds();
        let inner = if store.num_pages() == 0 {
            DatabaseInner::create(store, thresholds)?
        } else {
            DatabaseInner::load(store, thresholds)?
        };

        Ok(Database {
            inner: RwLock::new(inner),
        })
    }

    /// Blocks while a write transaction is running.
    pub fn begin_read(&self) -> Result<Transaction<'_>> {
        let guard = self
            .inner
            .read()
            .map_err(|_| Error::Static("database lock poisoned"))?;
        Ok(Transaction::new_read(guard))
    }

    /// Blocks while any other transaction is running.
    pub fn begin_write(&self) -> Result<Transaction<'_>> {
        let guard = self
            .inner
            .write()
            .map_err(|_| Error::Static("database lock poisoned"))?;
        Ok(Transaction::new_write(guard))
    }

    pub fn close(self) -> Result<()> {
        let inner = self
            .inner
            .into_inner()
            .map_err(|_| Error::Static("database lock poisoned"))?;
        tracing::debug!("closing database");
        inner.store.close()
    }
}

impl DatabaseInner {
    // page 0: master page, page 1: free list, page 2: empty catalog root
    fn create(store: Box<dyn PageStore>, thresholds: Thresholds) -> Result<DatabaseInner> {
        let mut free_list = FreeList::new();
        let free_list_page = free_list.get_next_page();
        let catalog_root = free_list.get_next_page();

        let mut inner = DatabaseInner {
            store,
            meta: MasterPage::new(catalog_root, free_list_page),
            free_list,
            thresholds,
        };

        inner.write_node(&Node::new(catalog_root, vec![], vec![]))?;
        let free_list = inner.free_list.clone();
        inner.write_free_list(&free_list)?;
        let meta = inner.meta;
        inner.write_meta(&meta)?;
        inner.store.sync()?;

        tracing::debug!(page_size = thresholds.page_size, "created database");
        Ok(inner)
    }

    fn load(store: Box<dyn PageStore>, thresholds: Thresholds) -> Result<DatabaseInner> {
        let meta = MasterPage::deserialize(&store.read_page(META_PAGE_NUMBER)?)?;
        let free_list =
            FreeList::deserialize(meta.free_list_page, |page_num| store.read_page(page_num))?;

        tracing::debug!(
            catalog_root = meta.root,
            max_page = free_list.max_page(),
            released = free_list.released_pages().len(),
            chain = free_list.chain_pages().len(),
            "loaded database"
        );
        Ok(DatabaseInner {
            store,
            meta,
            free_list,
            thresholds,
        })
    }

    fn read_node(&self, page_num: u64) -> Result<Node> {
        let page = self.store.read_page(page_num)?;
        Node::deserialize(page_num, &page)
    }

    fn write_node(&mut self, node: &Node) -> Result<()> {
        let mut page = vec![0; self.store.page_size()];
        node.serialize(&mut page)?;
        self.store.write_page(node.page_num, &page)
    }

    fn write_free_list(&mut self, free_list: &FreeList) -> Result<()> {
        let pages = free_list.serialize(self.meta.free_list_page, self.store.page_size())?;
        for (page_num, page) in pages {
            self.store.write_page(page_num, &page)?;
        }
        Ok(())
    }

    fn write_meta(&mut self, meta: &MasterPage) -> Result<()> {
        let mut page = vec![0; self.store.page_size()];
        meta.serialize(&mut page);
        self.store.write_page(META_PAGE_NUMBER, &page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(db: &Database) -> Vec<Vec<u8>> {
        let inner = db.inner.read().unwrap();
        (0..inner.store.num_pages())
            .map(|page_num| inner.store.read_page(page_num).unwrap())
            .collect()
    }

    #[test]
    fn test_create_layout() {
        let db = Database::in_memory(Options::default().page_size(512)).unwrap();
        let inner = db.inner.read().unwrap();
        assert_eq!(inner.meta, MasterPage::new(2, 1));
        assert_eq!(inner.free_list.max_page(), 2);
        assert_eq!(inner.store.num_pages(), 3);

        let catalog = inner.read_node(2).unwrap();
        assert!(catalog.is_leaf());
        assert!(catalog.items.is_empty());
    }

    #[test]
    fn test_scenario_a_put_find() {
        let db = Database::in_memory(Options::default()).unwrap();
        let mut tx = db.begin_write().unwrap();
        let mut collection = tx.create_collection(b"test").unwrap();
        collection.put(b"name", b"Celal").unwrap();
        let item = collection.find(b"name").unwrap().unwrap();
        assert_eq!(item.value, b"Celal");
        tx.commit().unwrap();
    }

    #[test]
    fn test_scenario_d_rollback_leaves_store_untouched() {
        let db = Database::in_memory(Options::default().page_size(512)).unwrap();
        let mut tx = db.begin_write().unwrap();
        let mut collection = tx.create_collection(b"test").unwrap();
        for i in 0..50 {
            collection.put(f!("key{}", i).as_bytes(), b"before").unwrap();
        }
        tx.commit().unwrap();
        let before = snapshot(&db);

        let mut tx = db.begin_write().unwrap();
        let mut collection = tx.get_collection(b"test").unwrap().unwrap();
        for i in 0..500 {
            collection.put(f!("key{}", i).as_bytes(), b"after").unwrap();
        }
        collection.remove(b"key1").unwrap();
        tx.rollback();
        assert_eq!(snapshot(&db), before);

        let mut tx = db.begin_read().unwrap();
        let collection = tx.get_collection(b"test").unwrap().unwrap();
        assert_eq!(collection.find(b"key1").unwrap().unwrap().value, b"before");
        assert!(collection.find(b"key100").unwrap().is_none());
        tx.commit().unwrap();
    }

    #[test]
    fn test_concurrent_readers() {
        let db = Database::in_memory(Options::default()).unwrap();
        let mut tx = db.begin_write().unwrap();
        let mut collection = tx.create_collection(b"c").unwrap();
        collection.put(b"k", b"v").unwrap();
        tx.commit().unwrap();

        let first = db.begin_read().unwrap();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let mut tx = db.begin_read().unwrap();
                    let collection = tx.get_collection(b"c").unwrap().unwrap();
                    assert_eq!(collection.find(b"k").unwrap().unwrap().value, b"v");
                    tx.commit().unwrap();
                });
            }
        });
        first.rollback();
    }

    #[test]
    fn test_mismatched_store_page_size() {
        let store = MemoryPageStore::new(1024);
        assert!(matches!(
            Database::with_store(Box::new(store), Options::default().page_size(512)),
            Err(Error::InvalidOptions(_))
        ));
    }
}
