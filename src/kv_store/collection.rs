use crate::b_tree::b_node::Item;
use crate::b_tree::BTree;
use crate::prelude::*;

use super::transaction::Transaction;

/// A named B+Tree, borrowed from the transaction it was opened in.
///
/// Root moves and counter changes are written back to the catalog right
/// away, so they commit or roll back with the rest of the transaction.
pub struct Collection<'t, 'db> {
    name: Vec<u8>,
    counter: u64,
    tree: BTree<&'t mut Transaction<'db>>,
}

impl<'t, 'db> Collection<'t, 'db> {
    pub(crate) fn new(
        name: Vec<u8>,
        root: u64,
        counter: u64,
        tx: &'t mut Transaction<'db>,
    ) -> Collection<'t, 'db> {
        Collection {
            name,
            counter,
            tree: BTree::new(tx, root),
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Inserts `key`, or overwrites its value when it is already present.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_write()?;
        let root = self.tree.root;
        self.tree.put(key, value)?;
        if self.tree.root != root {
            self.persist()?;
        }
        Ok(())
    }

    pub fn find(&self, key: &[u8]) -> Result<Option<Item>> {
        self.tree.find(key)
    }

    /// Returns whether the key was present. Removing an absent key changes
    /// nothing.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        self.check_write()?;
        let root = self.tree.root;
        let removed = self.tree.remove(key)?;
        if self.tree.root != root {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Returns the next value of the collection's counter, starting at 0.
    pub fn id(&mut self) -> Result<u64> {
        self.check_write()?;
        let id = self.counter;
        self.counter += 1;
        self.persist()?;
        Ok(id)
    }

    pub fn pages(&self) -> Result<Vec<u64>> {
        self.tree.pages()
    }

    pub fn height(&self) -> Result<usize> {
        self.tree.height()
    }

    fn check_write(&self) -> Result<()> {
        if self.tree.page_manager.is_write() {
            Ok(())
        } else {
            Err(Error::WriteInsideReadTx)
        }
    }

    fn persist(&mut self) -> Result<()> {
        let (root, counter) = (self.tree.root, self.counter);
        self.tree
            .page_manager
            .store_collection(&self.name, root, counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::b_tree::BTreePageManager;
    use crate::kv_store::{Database, Options};

    #[test]
    fn test_put_find_remove() {
        let db = Database::in_memory(Options::default().page_size(512)).unwrap();
        let mut tx = db.begin_write().unwrap();
        let mut collection = tx.create_collection(b"people").unwrap();
        assert_eq!(collection.name(), b"people");

        collection.put(b"name", b"Celal").unwrap();
        collection.put(b"name", b"Ada").unwrap();
        assert_eq!(collection.find(b"name").unwrap(), Some(Item::new(b"name", b"Ada")));

        assert!(collection.remove(b"name").unwrap());
        assert!(!collection.remove(b"name").unwrap());
        assert!(collection.find(b"name").unwrap().is_none());
        tx.commit().unwrap();
    }

    #[test]
    fn test_id_counter_is_persisted() {
        let db = Database::in_memory(Options::default()).unwrap();
        let mut tx = db.begin_write().unwrap();
        let mut collection = tx.create_collection(b"c").unwrap();
        assert_eq!(collection.id().unwrap(), 0);
        assert_eq!(collection.id().unwrap(), 1);
        tx.commit().unwrap();

        let mut tx = db.begin_write().unwrap();
        let mut collection = tx.get_collection(b"c").unwrap().unwrap();
        assert_eq!(collection.id().unwrap(), 2);
        tx.rollback();

        let mut tx = db.begin_write().unwrap();
        let mut collection = tx.get_collection(b"c").unwrap().unwrap();
        assert_eq!(collection.id().unwrap(), 2);
        tx.commit().unwrap();
    }

    #[test]
    fn test_root_moves_are_persisted() {
        let db = Database::in_memory(Options::default().page_size(256)).unwrap();
        let mut tx = db.begin_write().unwrap();
        let mut collection = tx.create_collection(b"c").unwrap();
        let first_root = collection.tree.root;
        for i in 0..200 {
            collection.put(f!("{:05}", i).as_bytes(), b"value").unwrap();
        }
        let root = collection.tree.root;
        assert_ne!(root, first_root);
        assert!(collection.height().unwrap() > 1);
        tx.commit().unwrap();

        let mut tx = db.begin_read().unwrap();
        let collection = tx.get_collection(b"c").unwrap().unwrap();
        assert_eq!(collection.tree.root, root);
        for i in 0..200 {
            assert!(collection.find(f!("{:05}", i).as_bytes()).unwrap().is_some());
        }
        let thresholds = collection.tree.page_manager.thresholds();
        let node = collection.tree.page_manager.page_get(root).unwrap();
        assert!(!thresholds.is_over_populated(&node));
        tx.commit().unwrap();
    }

    #[test]
    fn test_collections_are_independent() {
        let db = Database::in_memory(Options::default().page_size(512)).unwrap();
        let mut tx = db.begin_write().unwrap();
        for name in ["a", "b", "c"] {
            let mut collection = tx.create_collection(name.as_bytes()).unwrap();
            for i in 0..100 {
                collection.put(f!("key{}", i).as_bytes(), name.as_bytes()).unwrap();
            }
        }
        tx.delete_collection(b"b").unwrap();
        tx.commit().unwrap();

        let mut tx = db.begin_read().unwrap();
        assert!(tx.get_collection(b"b").unwrap().is_none());
        for name in ["a", "c"] {
            let collection = tx.get_collection(name.as_bytes()).unwrap().unwrap();
            for i in 0..100 {
                let item = collection.find(f!("key{}", i).as_bytes()).unwrap().unwrap();
                assert_eq!(item.value, name.as_bytes());
            }
        }
        tx.commit().unwrap();
    }
}
