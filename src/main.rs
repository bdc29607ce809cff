use btree_kv::kv_store::{Database, Options};
use btree_kv::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("btree_kv=info")),
        )
        .init();

    let options = match std::env::args().nth(1) {
        Some(path) => Options::from_file(path)?,
        None => Options::default(),
    };
    let db = Database::open("main.db", options)?;

    let mut tx = db.begin_write()?;
    tx.delete_collection(b"demo")?;
    let mut collection = tx.create_collection(b"demo")?;
    collection.put(b"hello", b"world")?;
    let id = collection.id()?;
    tx.commit()?;

    let mut tx = db.begin_read()?;
    if let Some(collection) = tx.get_collection(b"demo")? {
        if let Some(item) = collection.find(b"hello")? {
            println!(
                "hello {} (id {})",
                String::from_utf8_lossy(&item.value),
                id
            );
        }
    }
    tx.rollback();

    db.close()
}
