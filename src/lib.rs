#[macro_use]
extern crate lazy_static;

mod b_tree;
mod error;
mod free_list;
pub mod kv_store;
pub mod prelude;

pub use b_tree::b_node::{Item, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use free_list::mmap::MmapPageStore;
pub use free_list::page_manager::{MemoryPageStore, PageStore};
pub use kv_store::{Collection, Database, Options, Transaction};
