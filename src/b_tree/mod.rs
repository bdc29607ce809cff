pub mod b_node;

use crate::prelude::*;

use self::b_node::{Item, Node, Thresholds, MAX_KEY_SIZE, MAX_VALUE_SIZE, PAGE_NUMBER_SIZE};

/// Storage callbacks for the tree, to keep the b-tree logic pure.
///
/// Nodes are values addressed by page number: `page_get` hands out a copy,
/// and changes only become visible to later `page_get` calls once they are
/// staged with `page_write`.
pub trait BTreePageManager {
    fn thresholds(&self) -> Thresholds;
    fn page_get(&self, page_num: u64) -> Result<Node>;
    /// Allocates a page number for a new node. The node is not staged.
    fn page_new(&mut self, items: Vec<Item>, child_nodes: Vec<u64>) -> Result<Node>;
    fn page_write(&mut self, node: &Node) -> Result<()>;
    fn page_del(&mut self, page_num: u64) -> Result<()>;
}

impl<T: BTreePageManager + ?Sized> BTreePageManager for &mut T {
    fn thresholds(&self) -> Thresholds {
        (**self).thresholds()
    }

    fn page_get(&self, page_num: u64) -> Result<Node> {
        (**self).page_get(page_num)
    }

    fn page_new(&mut self, items: Vec<Item>, child_nodes: Vec<u64>) -> Result<Node> {
        (**self).page_new(items, child_nodes)
    }

    fn page_write(&mut self, node: &Node) -> Result<()> {
        (**self).page_write(node)
    }

    fn page_del(&mut self, page_num: u64) -> Result<()> {
        (**self).page_del(page_num)
    }
}

/// Where a search ended: the item index inside `node`, and the child index
/// taken at every level from the root down to `node` (the root itself is
/// recorded as 0).
#[derive(Debug)]
pub struct KeyPosition {
    pub index: usize,
    pub node: Node,
    pub ancestor_indexes: Vec<usize>,
}

pub struct BTree<B: BTreePageManager> {
    // pointer (a nonzero page number), 0 for a tree without pages
    pub root: u64,
    pub page_manager: B,
}

impl<B: BTreePageManager> BTree<B> {
    pub fn new(page_manager: B, root: u64) -> BTree<B> {
        BTree { root, page_manager }
    }

    pub fn find(&self, key: &[u8]) -> Result<Option<Item>> {
        if self.root == 0 {
            return Ok(None);
        }

        let root = self.page_manager.page_get(self.root)?;
        Ok(self
            .find_key(root, key, true)?
            .map(|mut position| position.node.items.swap_remove(position.index)))
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_entry(key, value)?;
        let item = Item::new(key, value);

        if self.root == 0 {
            let root = self.page_manager.page_new(vec![item], vec![])?;
            self.page_manager.page_write(&root)?;
            self.root = root.page_num;
            return Ok(());
        }

        let root = self.page_manager.page_get(self.root)?;
        let KeyPosition {
            index,
            mut node,
            ancestor_indexes,
        } = self
            .find_key(root, key, false)?
            .ok_or(Error::Static("no insertion point found"))?;

        let exists = node
            .items
            .get(index)
            .map_or(false, |existing| existing.key == key);
        if exists {
            node.items[index] = item;
        } else {
            node.add_item(item, index);
        }
        self.page_manager.page_write(&node)?;

        // split bottom up, the found node is the last ancestor
        let thresholds = self.page_manager.thresholds();
        let mut ancestors = self.get_nodes(&ancestor_indexes)?;
        for i in (0..ancestors.len().saturating_sub(1)).rev() {
            let (upper, lower) = ancestors.split_at_mut(i + 1);
            let parent = &mut upper[i];
            let child = &mut lower[0];
            if thresholds.is_over_populated(child) {
                self.split(parent, child, ancestor_indexes[i + 1])?;
            }
        }

        let root = &mut ancestors[0];
        if thresholds.is_over_populated(root) {
            self.grow(root)?;
        }

        Ok(())
    }

    /// Puts a new root above the over populated `root` and splits it.
    fn grow(&mut self, root: &mut Node) -> Result<()> {
        let mut new_root = self.page_manager.page_new(vec![], vec![root.page_num])?;
        self.split(&mut new_root, root, 0)?;
        tracing::trace!(old_root = root.page_num, new_root = new_root.page_num, "tree grew a level");
        self.root = new_root.page_num;
        Ok(())
    }

    /// Returns false when the key was not in the tree, nothing is written then.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        if self.root == 0 {
            return Ok(false);
        }

        let root = self.page_manager.page_get(self.root)?;
        let Some(KeyPosition {
            index,
            mut node,
            mut ancestor_indexes,
        }) = self.find_key(root, key, true)?
        else {
            return Ok(false);
        };

        if node.is_leaf() {
            node.items.remove(index);
            self.page_manager.page_write(&node)?;
        } else {
            let affected_nodes = self.remove_item_from_internal(&mut node, index)?;
            ancestor_indexes.extend(affected_nodes);
        }

        let thresholds = self.page_manager.thresholds();
        let mut ancestors = self.get_nodes(&ancestor_indexes)?;
        for i in (0..ancestors.len().saturating_sub(1)).rev() {
            let (upper, lower) = ancestors.split_at_mut(i + 1);
            let parent = &mut upper[i];
            let child = &mut lower[0];
            if thresholds.is_under_populated(child) {
                self.rebalance_remove(parent, child, ancestor_indexes[i + 1])?;
            } else if thresholds.is_over_populated(child) {
                // a promoted item can be larger than the one it replaced
                self.split(parent, child, ancestor_indexes[i + 1])?;
            }
        }

        let root = &mut ancestors[0];
        if root.items.is_empty() && !root.is_leaf() {
            tracing::trace!(old_root = root.page_num, new_root = root.child_nodes[0], "tree lost a level");
            self.root = root.child_nodes[0];
            self.page_manager.page_del(root.page_num)?;
        } else if thresholds.is_over_populated(root) {
            self.grow(root)?;
        }

        Ok(true)
    }

    /// Every page reachable from the root.
    pub fn pages(&self) -> Result<Vec<u64>> {
        let mut pages = Vec::new();
        if self.root == 0 {
            return Ok(pages);
        }

        let mut stack = vec![self.root];
        while let Some(page_num) = stack.pop() {
            let node = self.page_manager.page_get(page_num)?;
            pages.push(page_num);
            stack.extend(node.child_nodes.iter().rev());
        }
        Ok(pages)
    }

    /// Number of levels, 0 for a tree without pages.
    pub fn height(&self) -> Result<usize> {
        let mut height = 0;
        let mut page_num = self.root;
        while page_num != 0 {
            let node = self.page_manager.page_get(page_num)?;
            height += 1;
            page_num = node.child_nodes.first().copied().unwrap_or(0);
        }
        Ok(height)
    }

    fn check_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge(key.len()));
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge(value.len()));
        }

        let size = key.len() + value.len() + PAGE_NUMBER_SIZE;
        let limit = self.page_manager.thresholds().max_entry_size();
        if size > limit {
            return Err(Error::EntryTooLarge { size, limit });
        }
        Ok(())
    }

    /// Descends from `root` looking for `key`. With `exact` a missing key
    /// gives `None`, otherwise the leaf position where it belongs.
    pub fn find_key(&self, root: Node, key: &[u8], exact: bool) -> Result<Option<KeyPosition>> {
        let mut ancestor_indexes = vec![0];
        let mut node = root;

        loop {
            let (was_found, index) = node.find_key_in_node(key);
            if was_found {
                return Ok(Some(KeyPosition {
                    index,
                    node,
                    ancestor_indexes,
                }));
            }

            if node.is_leaf() {
                if exact {
                    return Ok(None);
                }
                return Ok(Some(KeyPosition {
                    index,
                    node,
                    ancestor_indexes,
                }));
            }

            ancestor_indexes.push(index);
            let child = child_at(&node, index)?;
            node = self.page_manager.page_get(child)?;
        }
    }

    /// Fetches the path described by `indexes`, starting at the root.
    fn get_nodes(&self, indexes: &[usize]) -> Result<Vec<Node>> {
        let root = self.page_manager.page_get(self.root)?;

        let mut nodes = Vec::with_capacity(indexes.len());
        nodes.push(root);
        for &index in indexes.iter().skip(1) {
            let parent = &nodes[nodes.len() - 1];
            let child = self.page_manager.page_get(child_at(parent, index)?)?;
            nodes.push(child);
        }
        Ok(nodes)
    }

    /// Splits the over populated `child` of `parent` until every piece
    /// fits, then stages `parent`.
    fn split(&mut self, parent: &mut Node, child: &mut Node, child_index: usize) -> Result<()> {
        self.split_until_fits(parent, child, child_index)?;
        self.page_manager.page_write(parent)
    }

    /// Stages `node` and returns 1 when it fits. Otherwise splits it and
    /// both halves again, returning how many nodes it became.
    ///
    /// With a low min fill the split point sits near the front of the node
    /// and the sibling can still be over populated, with a high one the
    /// same holds for `node` itself.
    fn split_until_fits(&mut self, parent: &mut Node, node: &mut Node, node_index: usize) -> Result<usize> {
        if !self.page_manager.thresholds().is_over_populated(node) {
            self.page_manager.page_write(node)?;
            return Ok(1);
        }

        let mut sibling = self.split_off(parent, node, node_index)?;
        let left = self.split_until_fits(parent, node, node_index)?;
        let right = self.split_until_fits(parent, &mut sibling, node_index + left)?;
        Ok(left + right)
    }

    /// Moves the upper part of `node` into a new sibling and promotes the
    /// separating item into `parent`. Nothing is staged.
    fn split_off(&mut self, parent: &mut Node, node: &mut Node, node_index: usize) -> Result<Node> {
        let thresholds = self.page_manager.thresholds();
        let split_index = match thresholds.split_index(node) {
            Some(split_index) => split_index,
            None if node.items.len() >= 3 => node.items.len() / 2,
            None => {
                return Err(Error::Generic(f!(
                    "node {} with {} items is too small to split",
                    node.page_num,
                    node.items.len()
                )))
            }
        };

        let mut upper_items = node.items.split_off(split_index);
        let middle_item = upper_items.remove(0);
        let upper_children = if node.is_leaf() {
            vec![]
        } else {
            node.child_nodes.split_off(split_index + 1)
        };

        let sibling = self.page_manager.page_new(upper_items, upper_children)?;
        parent.add_item(middle_item, node_index);
        parent.child_nodes.insert(node_index + 1, sibling.page_num);
        tracing::trace!(
            node = node.page_num,
            sibling = sibling.page_num,
            parent = parent.page_num,
            "split node"
        );
        Ok(sibling)
    }

    /// Replaces `node.items[index]` with its predecessor, the last item of
    /// the rightmost leaf below `child_nodes[index]`. Returns the child
    /// indexes taken on the way down.
    fn remove_item_from_internal(&mut self, node: &mut Node, index: usize) -> Result<Vec<usize>> {
        let mut affected_nodes = vec![index];

        let mut leaf = self.page_manager.page_get(child_at(node, index)?)?;
        while !leaf.is_leaf() {
            let traversing_index = leaf.child_nodes.len() - 1;
            leaf = self.page_manager.page_get(leaf.child_nodes[traversing_index])?;
            affected_nodes.push(traversing_index);
        }

        let predecessor = leaf.items.pop().ok_or(Error::CorruptedPage {
            page: leaf.page_num,
            reason: "empty leaf below an internal node",
        })?;
        node.items[index] = predecessor;

        self.page_manager.page_write(node)?;
        self.page_manager.page_write(&leaf)?;
        Ok(affected_nodes)
    }

    fn rebalance_remove(&mut self, parent: &mut Node, node: &mut Node, node_index: usize) -> Result<()> {
        let thresholds = self.page_manager.thresholds();
        if parent.child_nodes.len() < 2 {
            return Ok(());
        }

        if node_index != 0 {
            let mut left = self.page_manager.page_get(parent.child_nodes[node_index - 1])?;
            if thresholds.can_spare_an_element(&left) {
                rotate_right(&mut left, parent, node, node_index)?;
                self.page_manager.page_write(&left)?;
                return self.write_or_split(parent, node, node_index);
            }
        }

        if node_index != parent.child_nodes.len() - 1 {
            let mut right = self.page_manager.page_get(parent.child_nodes[node_index + 1])?;
            if thresholds.can_spare_an_element(&right) {
                rotate_left(node, parent, &mut right, node_index)?;
                self.page_manager.page_write(&right)?;
                return self.write_or_split(parent, node, node_index);
            }
        }

        if node_index == 0 {
            let right = self.page_manager.page_get(parent.child_nodes[1])?;
            self.merge(parent, node, right, 1)
        } else {
            let mut left = self.page_manager.page_get(parent.child_nodes[node_index - 1])?;
            self.merge(parent, &mut left, node.clone(), node_index)
        }
    }

    /// Folds `right` and the separator above it into `left` and frees the
    /// page of `right`. A merged node that came out too big is split again.
    fn merge(&mut self, parent: &mut Node, left: &mut Node, right: Node, right_index: usize) -> Result<()> {
        let separator = parent.items.remove(right_index - 1);
        left.items.push(separator);
        left.items.extend(right.items);
        if !left.is_leaf() {
            left.child_nodes.extend(right.child_nodes);
        }
        parent.child_nodes.remove(right_index);
        self.page_manager.page_del(right.page_num)?;
        tracing::trace!(node = left.page_num, freed = right.page_num, "merged nodes");

        self.write_or_split(parent, left, right_index - 1)
    }

    /// Stages `parent` and its child `node`, splitting `node` first when it
    /// came out of a rotation or merge too big.
    fn write_or_split(&mut self, parent: &mut Node, node: &mut Node, node_index: usize) -> Result<()> {
        if self.page_manager.thresholds().is_over_populated(node) {
            return self.split(parent, node, node_index);
        }

        self.page_manager.page_write(node)?;
        self.page_manager.page_write(parent)
    }
}

fn child_at(node: &Node, index: usize) -> Result<u64> {
    node.child_nodes.get(index).copied().ok_or(Error::CorruptedPage {
        page: node.page_num,
        reason: "child index out of range",
    })
}

/// Moves the last item of `left` up into `parent` and the separator it
/// replaces down to the front of `node`.
fn rotate_right(left: &mut Node, parent: &mut Node, node: &mut Node, node_index: usize) -> Result<()> {
    let left_item = left.items.pop().ok_or(Error::Static("rotation from an empty sibling"))?;
    let parent_item_index = node_index.saturating_sub(1);
    let parent_item = std::mem::replace(&mut parent.items[parent_item_index], left_item);
    node.items.insert(0, parent_item);

    if !left.is_leaf() {
        if let Some(child) = left.child_nodes.pop() {
            node.child_nodes.insert(0, child);
        }
    }
    tracing::trace!(from = left.page_num, to = node.page_num, "rotated right");
    Ok(())
}

/// Moves the first item of `right` up into `parent` and the separator it
/// replaces down to the end of `node`.
fn rotate_left(node: &mut Node, parent: &mut Node, right: &mut Node, node_index: usize) -> Result<()> {
    if right.items.is_empty() {
        return Err(Error::Static("rotation from an empty sibling"));
    }
    let right_item = right.items.remove(0);
    let parent_item_index = node_index.min(parent.items.len() - 1);
    let parent_item = std::mem::replace(&mut parent.items[parent_item_index], right_item);
    node.items.push(parent_item);

    if !right.is_leaf() {
        let child = right.child_nodes.remove(0);
        node.child_nodes.push(child);
    }
    tracing::trace!(from = right.page_num, to = node.page_num, "rotated left");
    Ok(())
}
