//! # Burrow Core
//!
//! A content-addressed virtual filesystem for recursive file
//! inspection.
//!
//! Inputs (a file, a directory tree, or a byte stream) are ingested
//! into a self-contained on-disk store while an in-memory namespace is
//! built above them. Every blob is identified in one pass (MD5,
//! SHA-1, SHA-256, SHA-512, Shannon entropy, size, and file type) and
//! deduplicated by SHA-512, so identical content is stored once and
//! shared by every node that refers to it. The namespace can be
//! serialised to a manifest, reopened, and extended.
//!
//! Besides named directory entries, any node can carry a single
//! anonymous *extraction child*: the decoded or decompressed view of
//! the same path, produced by external extractor tooling. Extraction
//! chains are addressed with an index (`stat_at`), and walks visit
//! them at the same path as their parent.
//!
//! ## Example
//!
//! ```no_run
//! use burrow_core::Fs;
//!
//! # fn main() -> burrow_core::Result<()> {
//! // Ingest a directory tree into ./store.
//! let fs = Fs::new_from_path("./store", "./data")?;
//!
//! fs.walk("/", |path, node| {
//!     println!("{path} {} {}", node.mimetype(), node.sha512());
//!     Ok(())
//! })?;
//!
//! // Persist the namespace; reopen it later with `open_existing`.
//! fs.close()?;
//! # Ok(())
//! # }
//! ```

mod db;
mod dest;
mod entropy;
mod error;
mod fs;
mod ident;
mod ingest;
mod manifest;
mod mode;
mod node;
mod path;
mod reference;
mod sniff;
mod writer;

pub use dest::{CachedDest, Destination, DEFAULT_CACHE_LIMIT};
pub use entropy::Entropy;
pub use error::{Error, Result};
pub use fs::Fs;
pub use ident::{IdentWriter, Identifiers};
pub use mode::{Mode, MODE_DIR, MODE_SYMLINK};
pub use node::Node;
pub use reference::Reference;
pub use sniff::{Filetype, TypeSniffer, MAX_DETECT_BYTES};
pub use writer::BlobWriter;
