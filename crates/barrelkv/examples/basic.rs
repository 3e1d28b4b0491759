//! Minimal usage demo: open a store, write a few keys, read them back.
//!
//! Run with `cargo run --example basic`.

use barrelkv::{Engine, Options};

fn main() -> Result<(), barrelkv::Error> {
    tracing_subscriber::fmt::init();

    let dir = std::env::temp_dir().join("barrelkv-basic-example");
    let engine = Engine::open(&dir, Options::default())?;

    engine.put(b"language", b"rust")?;
    engine.put(b"storage-model", b"append-only log")?;
    engine.delete(b"storage-model")?;
    engine.put(b"storage-model", b"log-structured")?;

    println!("language = {:?}", engine.get(b"language")?);
    println!("storage-model = {:?}", engine.get(b"storage-model")?);
    println!("missing = {:?}", engine.get(b"missing")?);

    engine.close()?;
    println!("data directory: {}", dir.display());
    Ok(())
}
