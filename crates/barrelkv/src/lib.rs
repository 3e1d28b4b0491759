//! An embedded, persistent key/value store.
//!
//! Writes are appended to a single active log file; reads are served
//! from an in-memory index of `key -> (file, offset, size)`. Sealed log
//! files are paired with a hint file so recovery on reopen never has to
//! read more than the active segment's tail. A background scheduler
//! reclaims space from sealed files once enough of their bytes have
//! gone stale, by rewriting the survivors into a fresh file.
//!
//! ```no_run
//! use barrelkv::{Engine, Options};
//!
//! # fn main() -> Result<(), barrelkv::Error> {
//! let engine = Engine::open("./data", Options::default())?;
//! engine.put(b"hello", b"world")?;
//! assert_eq!(engine.get(b"hello")?.as_deref(), Some(&b"world"[..]));
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

mod data_file;
mod engine;
mod error;
mod hint_file;
mod index;
mod locator;
mod merge;
mod options;
mod record;
mod stale;

pub use engine::Engine;
pub use error::{Error, Result};
pub use locator::{FileId, RecordLocator};
pub use options::Options;
