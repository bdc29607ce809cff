use crate::prelude::*;

use byteorder::{ByteOrder, LittleEndian};

// node format:
// | leaf | nitems | (child 8B) offset 2B ... | (last child 8B) | ... free ... | klen key vlen val ... |
// | 1B   |   2B   |     per item, grows ->   |                 |              |  per item, grows <-  |

pub const NODE_HEADER_SIZE: usize = 3;
pub const PAGE_NUMBER_SIZE: usize = 8;
pub const OFFSET_SIZE: usize = 2;

pub const MAX_KEY_SIZE: usize = u8::MAX as usize;
pub const MAX_VALUE_SIZE: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Item {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Item {
    pub fn new(key: &[u8], value: &[u8]) -> Item {
        Item {
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }
}

/// In-memory copy of one page of a B+Tree.
///
/// A node with no children is a leaf. An internal node has exactly
/// `items.len() + 1` children and every key in `child_nodes[i]` sorts before
/// `items[i].key`, which sorts before every key in `child_nodes[i + 1]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    /// 0 until a page has been allocated for the node
    pub page_num: u64,
    pub items: Vec<Item>,
    pub child_nodes: Vec<u64>,
}

impl Node {
    pub fn new(page_num: u64, items: Vec<Item>, child_nodes: Vec<u64>) -> Node {
        Node {
            page_num,
            items,
            child_nodes,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.child_nodes.is_empty()
    }

    /// Returns whether the key is in this node and its index. When it is
    /// missing the index is the first item with a greater key.
    // TODO: bisect
    pub fn find_key_in_node(&self, key: &[u8]) -> (bool, usize) {
        for (i, existing) in self.items.iter().enumerate() {
            match existing.key.as_slice().cmp(key) {
                std::cmp::Ordering::Equal => return (true, i),
                std::cmp::Ordering::Greater => return (false, i),
                std::cmp::Ordering::Less => {}
            }
        }
        (false, self.items.len())
    }

    pub fn add_item(&mut self, item: Item, insertion_index: usize) {
        self.items.insert(insertion_index, item);
    }

    pub fn element_size(&self, i: usize) -> usize {
        self.items[i].key.len() + self.items[i].value.len() + PAGE_NUMBER_SIZE
    }

    /// Accounted size used by the fill thresholds.
    pub fn node_size(&self) -> usize {
        let elements: usize = (0..self.items.len()).map(|i| self.element_size(i)).sum();
        NODE_HEADER_SIZE + elements + PAGE_NUMBER_SIZE
    }

    /// Exact number of bytes `serialize` writes.
    pub fn serialized_size(&self) -> usize {
        let per_item_header = if self.is_leaf() {
            OFFSET_SIZE
        } else {
            PAGE_NUMBER_SIZE + OFFSET_SIZE
        };
        let trailing_child = if self.is_leaf() { 0 } else { PAGE_NUMBER_SIZE };
        let data: usize = self
            .items
            .iter()
            .map(|item| 2 + item.key.len() + item.value.len())
            .sum();
        NODE_HEADER_SIZE + per_item_header * self.items.len() + trailing_child + data
    }

    pub fn serialize(&self, buf: &mut [u8]) -> Result<()> {
        let needed = self.serialized_size();
        if needed > buf.len() {
            return Err(Error::NodeOverflow {
                page: self.page_num,
                needed,
                page_size: buf.len(),
            });
        }
        let is_leaf = self.is_leaf();
        if !is_leaf && self.child_nodes.len() != self.items.len() + 1 {
            return Err(Error::Generic(f!(
                "node {} has {} items but {} children",
                self.page_num,
                self.items.len(),
                self.child_nodes.len()
            )));
        }

        buf.fill(0);
        let mut left_pos = 0;
        let mut right_pos = buf.len();

        buf[left_pos] = u8::from(is_leaf);
        left_pos += 1;

        LittleEndian::write_u16(&mut buf[left_pos..], self.items.len() as u16);
        left_pos += 2;

        for (i, item) in self.items.iter().enumerate() {
            if !is_leaf {
                LittleEndian::write_u64(&mut buf[left_pos..], self.child_nodes[i]);
                left_pos += PAGE_NUMBER_SIZE;
            }

            let klen = u8::try_from(item.key.len()).map_err(|_| Error::KeyTooLarge(item.key.len()))?;
            let vlen =
                u8::try_from(item.value.len()).map_err(|_| Error::ValueTooLarge(item.value.len()))?;

            right_pos -= item.value.len();
            buf[right_pos..right_pos + item.value.len()].copy_from_slice(&item.value);
            right_pos -= 1;
            buf[right_pos] = vlen;

            right_pos -= item.key.len();
            buf[right_pos..right_pos + item.key.len()].copy_from_slice(&item.key);
            right_pos -= 1;
            buf[right_pos] = klen;

            LittleEndian::write_u16(&mut buf[left_pos..], right_pos as u16);
            left_pos += OFFSET_SIZE;
        }

        if let (false, Some(last)) = (is_leaf, self.child_nodes.last()) {
            LittleEndian::write_u64(&mut buf[left_pos..], *last);
        }

        Ok(())
    }

    pub fn deserialize(page_num: u64, buf: &[u8]) -> Result<Node> {
        let corrupted = |reason| Error::CorruptedPage {
            page: page_num,
            reason,
        };

        let is_leaf = match buf.first() {
            Some(1) => true,
            Some(0) => false,
            Some(_) => return Err(corrupted("invalid leaf flag")),
            None => return Err(corrupted("empty page")),
        };
        let items_count = read_u16_at(buf, 1).ok_or(corrupted("truncated header"))? as usize;
        let mut left_pos = NODE_HEADER_SIZE;

        let mut node = Node {
            page_num,
            items: Vec::with_capacity(items_count),
            child_nodes: Vec::new(),
        };

        for _ in 0..items_count {
            if !is_leaf {
                let child = read_u64_at(buf, left_pos).ok_or(corrupted("truncated child pointer"))?;
                left_pos += PAGE_NUMBER_SIZE;
                node.child_nodes.push(child);
            }

            let mut offset = read_u16_at(buf, left_pos).ok_or(corrupted("truncated offset"))? as usize;
            left_pos += OFFSET_SIZE;

            let klen = *buf.get(offset).ok_or(corrupted("key offset out of page"))? as usize;
            offset += 1;
            let key = buf
                .get(offset..offset + klen)
                .ok_or(corrupted("key out of page"))?
                .to_vec();
            offset += klen;

            let vlen = *buf.get(offset).ok_or(corrupted("value offset out of page"))? as usize;
            offset += 1;
            let value = buf
                .get(offset..offset + vlen)
                .ok_or(corrupted("value out of page"))?
                .to_vec();

            node.items.push(Item { key, value });
        }

        if !is_leaf {
            let last = read_u64_at(buf, left_pos).ok_or(corrupted("truncated child pointer"))?;
            node.child_nodes.push(last);
        }

        // page 0 is the master page, it can never be a child
        if node.child_nodes.contains(&0) {
            return Err(corrupted("child pointer to page 0"));
        }

        Ok(node)
    }
}

fn read_u16_at(buf: &[u8], pos: usize) -> Option<u16> {
    buf.get(pos..pos + 2).map(LittleEndian::read_u16)
}

fn read_u64_at(buf: &[u8], pos: usize) -> Option<u64> {
    buf.get(pos..pos + PAGE_NUMBER_SIZE).map(LittleEndian::read_u64)
}

/// Fill policy of a database: when nodes split, and when they borrow from
/// or merge with a sibling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub page_size: usize,
    pub min_fill_percent: f32,
    pub max_fill_percent: f32,
}

impl Thresholds {
    pub fn max_threshold(&self) -> f32 {
        self.max_fill_percent * self.page_size as f32
    }

    pub fn min_threshold(&self) -> f32 {
        self.min_fill_percent * self.page_size as f32
    }

    /// Also true when the node no longer fits its page, internal items take
    /// more room on disk than `element_size` counts.
    pub fn is_over_populated(&self, node: &Node) -> bool {
        node.node_size() as f32 > self.max_threshold() || node.serialized_size() > self.page_size
    }

    pub fn is_under_populated(&self, node: &Node) -> bool {
        (node.node_size() as f32) < self.min_threshold()
    }

    /// Index of the item to promote when splitting `node`. The items before
    /// it are just above the minimum threshold and at least one item stays
    /// after it.
    pub fn split_index(&self, node: &Node) -> Option<usize> {
        let mut size = NODE_HEADER_SIZE;
        let last_index = node.items.len().checked_sub(1)?;

        for i in 0..node.items.len() {
            size += node.element_size(i);
            if size as f32 > self.min_threshold() && i + 1 < last_index {
                return Some(i + 1);
            }
        }

        None
    }

    pub fn can_spare_an_element(&self, node: &Node) -> bool {
        self.split_index(node).is_some()
    }

    /// Largest `element_size` accepted for a single entry, so that any node
    /// holding two entries stays under the max threshold and in its page.
    pub fn max_entry_size(&self) -> usize {
        let usable = self.max_threshold() as usize;
        usable.saturating_sub(NODE_HEADER_SIZE + PAGE_NUMBER_SIZE) / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(page_size: usize) -> Thresholds {
        Thresholds {
            page_size,
            min_fill_percent: 0.5,
            max_fill_percent: 0.95,
        }
    }

    fn items(n: u8) -> Vec<Item> {
        (0..n)
            .map(|i| Item::new(&[b'k', i], &[b'v', i, i]))
            .collect()
    }

    #[test]
    fn test_leaf_round_trip() {
        let node = Node::new(7, items(10), vec![]);
        let mut buf = vec![0; 4096];
        node.serialize(&mut buf).unwrap();

        let restored = Node::deserialize(7, &buf).unwrap();
        assert_eq!(node, restored);
        assert!(restored.is_leaf());
    }

    #[test]
    fn test_internal_round_trip() {
        let node = Node::new(3, items(4), vec![10, 11, 12, 13, 14]);
        let mut buf = vec![0; 512];
        node.serialize(&mut buf).unwrap();

        let restored = Node::deserialize(3, &buf).unwrap();
        assert_eq!(node, restored);
        assert!(!restored.is_leaf());
    }

    #[test]
    fn test_empty_leaf_round_trip() {
        let node = Node::new(2, vec![], vec![]);
        let mut buf = vec![0; 128];
        node.serialize(&mut buf).unwrap();
        assert_eq!(&buf[..3], &[1, 0, 0]);
        assert_eq!(Node::deserialize(2, &buf).unwrap(), node);
    }

    #[test]
    fn test_serialized_layout() {
        let node = Node::new(1, vec![Item::new(b"ab", b"xyz")], vec![5, 6]);
        let mut buf = vec![0; 128];
        node.serialize(&mut buf).unwrap();

        // internal flag and item count
        assert_eq!(buf[0], 0);
        assert_eq!(LittleEndian::read_u16(&buf[1..3]), 1);
        // first child then the item offset
        assert_eq!(LittleEndian::read_u64(&buf[3..11]), 5);
        let offset = LittleEndian::read_u16(&buf[11..13]) as usize;
        assert_eq!(offset, 128 - 2 - 2 - 3);
        assert_eq!(LittleEndian::read_u64(&buf[13..21]), 6);
        // klen key vlen value at the end of the page
        assert_eq!(&buf[offset..], &[2, b'a', b'b', 3, b'x', b'y', b'z']);
        assert_eq!(node.serialized_size(), 21 + 7);
    }

    #[test]
    fn test_serialize_overflow() {
        let node = Node::new(9, items(20), vec![]);
        let mut buf = vec![0; 64];
        match node.serialize(&mut buf) {
            Err(Error::NodeOverflow { page, needed, page_size }) => {
                assert_eq!(page, 9);
                assert_eq!(needed, node.serialized_size());
                assert_eq!(page_size, 64);
            }
            other => panic!("expected overflow, got {:?}", other),
        }
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        let mut buf = vec![0; 128];
        buf[0] = 7;
        assert!(matches!(
            Node::deserialize(4, &buf),
            Err(Error::CorruptedPage { page: 4, .. })
        ));

        // a zeroed page reads as an internal node pointing at page 0
        let buf = vec![0; 128];
        assert!(matches!(
            Node::deserialize(4, &buf),
            Err(Error::CorruptedPage { page: 4, .. })
        ));

        // offset pointing past the end of the page
        let mut buf = vec![0; 16];
        buf[0] = 1;
        LittleEndian::write_u16(&mut buf[1..3], 1);
        LittleEndian::write_u16(&mut buf[3..5], 15);
        buf[15] = 9;
        assert!(Node::deserialize(4, &buf).is_err());
    }

    #[test]
    fn test_find_key_in_node() {
        let node = Node::new(1, items(5), vec![]);
        assert_eq!(node.find_key_in_node(&[b'k', 2]), (true, 2));
        assert_eq!(node.find_key_in_node(&[b'k']), (false, 0));
        assert_eq!(node.find_key_in_node(&[b'k', 2, 0]), (false, 3));
        assert_eq!(node.find_key_in_node(b"z"), (false, 5));
    }

    #[test]
    fn test_node_size() {
        let node = Node::new(1, vec![Item::new(b"abc", b"de"), Item::new(b"f", b"")], vec![]);
        assert_eq!(node.element_size(0), 3 + 2 + 8);
        assert_eq!(node.element_size(1), 1 + 8);
        assert_eq!(node.node_size(), 3 + 13 + 9 + 8);
    }

    #[test]
    fn test_thresholds() {
        let t = thresholds(100);
        assert_eq!(t.max_threshold(), 95.0);
        assert_eq!(t.min_threshold(), 50.0);

        // each element is 2 + 3 + 8 = 13 bytes
        let small = Node::new(1, items(2), vec![]);
        assert!(t.is_under_populated(&small));
        assert!(!t.is_over_populated(&small));

        let big = Node::new(1, items(7), vec![]);
        assert!(!t.is_under_populated(&big));
        assert!(t.is_over_populated(&big));
    }

    #[test]
    fn test_split_index() {
        let t = thresholds(100);
        // running size 3 + 13 * n passes 50 at n = 4, so items 0..=3 stay
        let node = Node::new(1, items(7), vec![]);
        assert_eq!(t.split_index(&node), Some(4));
        assert!(t.can_spare_an_element(&node));

        // 5 items: the threshold is passed at index 3, leaving nothing after index 4
        let node = Node::new(1, items(5), vec![]);
        assert_eq!(t.split_index(&node), None);
        assert!(!t.can_spare_an_element(&node));

        let empty = Node::new(1, vec![], vec![]);
        assert_eq!(t.split_index(&empty), None);
    }

    #[test]
    fn test_internal_node_overflows_before_threshold() {
        // internal items use 4 bytes more on disk than they are accounted for
        let t = Thresholds {
            page_size: 128,
            min_fill_percent: 0.5,
            max_fill_percent: 1.0,
        };
        let node = Node::new(1, items(8), (0..9).map(|i| i + 10).collect());
        assert!((node.node_size() as f32) <= t.max_threshold());
        assert!(node.serialized_size() > 128);
        assert!(t.is_over_populated(&node));
    }

    #[test]
    fn test_max_entry_size() {
        let t = thresholds(4096);
        let limit = t.max_entry_size();
        assert_eq!(limit, (3891 - 11) / 3);

        let node = Node::new(
            1,
            vec![
                Item::new(&vec![1; 255], &vec![1; 255]),
                Item::new(&vec![2; 255], &vec![2; 255]),
            ],
            vec![7, 8, 9],
        );
        assert!(!t.is_over_populated(&node));
    }
}
