use crate::prelude::*;

use byteorder::{ByteOrder, LittleEndian};

pub const META_PAGE_NUMBER: u64 = 0;
pub const MAGIC_NUMBER: u32 = 0xD00D_B00D;

const MAGIC_NUMBER_SIZE: usize = 4;
const META_SIZE: usize = MAGIC_NUMBER_SIZE + 8 + 8;

/// Page 0: where the catalog tree and the free list live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MasterPage {
    /// Root page of the catalog tree
    pub root: u64,
    pub free_list_page: u64,
}

impl MasterPage {
    pub fn new(root: u64, free_list_page: u64) -> Self {
        Self {
            root,
            free_list_page,
        }
    }

    pub fn serialize(&self, buf: &mut [u8]) {
        assert!(buf.len() >= META_SIZE, "page too small for the master page");
        buf.fill(0);
        let mut pos = 0;
        LittleEndian::write_u32(&mut buf[pos..], MAGIC_NUMBER);
        pos += MAGIC_NUMBER_SIZE;

        LittleEndian::write_u64(&mut buf[pos..], self.root);
        pos += 8;

        LittleEndian::write_u64(&mut buf[pos..], self.free_list_page);
    }

    /// Loads the master page. A wrong magic number means the file was not
    /// written by this engine and is never opened.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_SIZE {
            return Err(Error::CorruptedPage {
                page: META_PAGE_NUMBER,
                reason: "truncated master page",
            });
        }

        let mut pos = 0;
        let magic = LittleEndian::read_u32(&buf[pos..]);
        pos += MAGIC_NUMBER_SIZE;
        if magic != MAGIC_NUMBER {
            return Err(Error::BadMagic { found: magic });
        }

        let root = LittleEndian::read_u64(&buf[pos..]);
        pos += 8;
        let free_list_page = LittleEndian::read_u64(&buf[pos..]);

        let bad = root == META_PAGE_NUMBER
            || free_list_page == META_PAGE_NUMBER
            || root == free_list_page;
        if bad {
            return Err(Error::CorruptedPage {
                page: META_PAGE_NUMBER,
                reason: "bad master page",
            });
        }

        Ok(Self {
            root,
            free_list_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let meta = MasterPage::new(2, 1);
        let mut buf = vec![0xff; 128];
        meta.serialize(&mut buf);

        assert_eq!(LittleEndian::read_u32(&buf[..4]), MAGIC_NUMBER);
        assert_eq!(LittleEndian::read_u64(&buf[4..12]), 2);
        assert_eq!(LittleEndian::read_u64(&buf[12..20]), 1);
        assert_eq!(MasterPage::deserialize(&buf).unwrap(), meta);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = vec![0; 128];
        MasterPage::new(2, 1).serialize(&mut buf);
        buf[0] ^= 0xff;
        assert!(matches!(
            MasterPage::deserialize(&buf),
            Err(Error::BadMagic { .. })
        ));
    }

    #[test]
    fn test_bad_master_page() {
        let mut buf = vec![0; 128];
        MasterPage::new(1, 1).serialize(&mut buf);
        assert!(matches!(
            MasterPage::deserialize(&buf),
            Err(Error::CorruptedPage { page: 0, .. })
        ));
    }
}
