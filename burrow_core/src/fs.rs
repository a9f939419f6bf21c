//! Filesystem views and the public lifecycle.

use crate::db::ReferenceDb;
use crate::error::{Error, Result};
use crate::ingest;
use crate::manifest;
use crate::mode::Mode;
use crate::node::Node;
use crate::path::{join_root, split};
use crate::writer::BlobWriter;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A view into a virtual filesystem.
///
/// Every view shares the reference database and lifecycle state of the
/// root it was derived from; only the root view may be closed. Cloning
/// a view is cheap.
#[derive(Clone)]
pub struct Fs {
    root: Arc<Node>,
    db: Arc<ReferenceDb>,
    is_root: bool,
}

impl Fs {
    // ---- construction ----

    /// Build a filesystem by streaming `reader` into the root blob.
    ///
    /// The storage directory is created exclusively; an existing
    /// directory is an error so a prior store is never clobbered.
    pub fn new_from_reader<R: Read>(
        storage_dir: impl Into<PathBuf>,
        name: &str,
        mode: Mode,
        mod_time: DateTime<Utc>,
        reader: R,
    ) -> Result<Fs> {
        let storage_dir = storage_dir.into();
        fs::create_dir(&storage_dir)?;
        let db = Arc::new(ReferenceDb::new(storage_dir, false));
        let root = Arc::new(Node::new(name, mode, mod_time));
        ingest::ingest_reader(&db, &root, reader)?;
        Ok(Fs {
            root,
            db,
            is_root: true,
        })
    }

    /// Build a filesystem from a host file or directory tree.
    ///
    /// A file becomes the root blob under its own basename, mode, and
    /// mtime; a directory becomes a directory root whose entries are
    /// ingested by parallel workers, first error wins.
    pub fn new_from_path(
        storage_dir: impl Into<PathBuf>,
        source: impl AsRef<Path>,
    ) -> Result<Fs> {
        let source = source.as_ref();
        let metadata = fs::metadata(source)?;
        let name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        let mod_time = DateTime::<Utc>::from(metadata.modified()?);
        let mode = ingest::host_mode(&metadata);

        if !metadata.is_dir() {
            let file = fs::File::open(source)?;
            return Self::new_from_reader(storage_dir, &name, mode, mod_time, file);
        }

        let storage_dir = storage_dir.into();
        fs::create_dir(&storage_dir)?;
        let db = Arc::new(ReferenceDb::new(storage_dir, false));
        let root = Arc::new(Node::new_dir(&name, mode, mod_time));
        ingest::ingest_tree(&db, &root, source)?;
        Ok(Fs {
            root,
            db,
            is_root: true,
        })
    }

    /// Build a filesystem from standard input under the synthetic name
    /// `stdin`.
    pub fn new_from_stdin(storage_dir: impl Into<PathBuf>) -> Result<Fs> {
        Self::new_from_reader(
            storage_dir,
            "stdin",
            Mode::new(0o755),
            Utc::now(),
            std::io::stdin().lock(),
        )
    }

    /// Reopen a previously closed filesystem from its storage
    /// directory.
    pub fn open_existing(storage_dir: impl Into<PathBuf>) -> Result<Fs> {
        Self::open_inner(storage_dir.into(), false)
    }

    /// Reopen a previously closed filesystem without allowing any
    /// mutation.
    pub fn open_existing_read_only(storage_dir: impl Into<PathBuf>) -> Result<Fs> {
        Self::open_inner(storage_dir.into(), true)
    }

    fn open_inner(storage_dir: PathBuf, read_only: bool) -> Result<Fs> {
        let db = Arc::new(ReferenceDb::new(storage_dir, read_only));
        let root = manifest::load(&db)?;
        Ok(Fs {
            root,
            db,
            is_root: true,
        })
    }

    // ---- lifecycle ----

    /// Serialise the namespace and close the filesystem.
    ///
    /// Only the root view may close, exactly once; afterwards every
    /// mutating operation on any view fails with `Closed`. A read-only
    /// filesystem closes without saving.
    pub fn close(&self) -> Result<()> {
        if self.db.is_closed() {
            return Err(Error::Closed);
        }
        if !self.is_root {
            return Err(Error::Child);
        }
        if !self.db.read_only() {
            manifest::save(&self.db, &self.root)?;
        }
        self.db.close();
        log::debug!("closed filesystem at {}", self.db.storage_dir().display());
        Ok(())
    }

    fn guard_open(&self) -> Result<()> {
        if self.db.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn guard_mutable(&self) -> Result<()> {
        self.guard_open()?;
        if self.db.read_only() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn view(&self, root: Arc<Node>) -> Fs {
        Fs {
            root,
            db: self.db.clone(),
            is_root: false,
        }
    }

    // ---- mutation ----

    /// Create a directory and any missing parents; returns a view on
    /// the terminal directory. The root path is a no-op.
    pub fn mkdir_p(&self, path: &str, mode: Mode, mod_time: DateTime<Utc>) -> Result<Fs> {
        self.guard_mutable()?;
        let segments = split(path)?;
        Ok(self.view(Node::mkdir_p(&self.root, &segments, mode, mod_time)?))
    }

    /// Create a regular file node at `path`, building parents as
    /// needed; returns a view on it. Write its content through
    /// [`Fs::create`].
    pub fn touch(&self, path: &str, mode: Mode, mod_time: DateTime<Utc>) -> Result<Fs> {
        self.guard_mutable()?;
        let segments = split(path)?;
        if segments.is_empty() {
            return Err(Error::OutsideFilesystem);
        }
        Ok(self.view(Node::touch(&self.root, &segments, mode, mod_time)?))
    }

    /// Attach a fresh regular node as this view's extraction child:
    /// the decoded sibling of the same path.
    pub fn touch_extraction(&self, mode: Mode, mod_time: DateTime<Utc>) -> Result<Fs> {
        self.guard_mutable()?;
        Ok(self.view(Node::touch(&self.root, &[], mode, mod_time)?))
    }

    /// Create a symlink node pointing at `target`.
    pub fn symlink(
        &self,
        target: &str,
        path: &str,
        mode: Mode,
        mod_time: DateTime<Utc>,
    ) -> Result<Fs> {
        self.guard_mutable()?;
        let segments = split(path)?;
        if segments.is_empty() {
            return Err(Error::OutsideFilesystem);
        }
        Ok(self.view(Node::symlink(&self.root, target, &segments, mode, mod_time)?))
    }

    /// Create a node at `path` sharing the reference of the node at
    /// `source_path`, bypassing identifier computation.
    pub fn hardlink(
        &self,
        source_path: &str,
        path: &str,
        mode: Mode,
        mod_time: DateTime<Utc>,
    ) -> Result<Fs> {
        self.guard_mutable()?;
        let source_segments = split(source_path)?;
        let source = Node::travel_to(&self.root, &source_segments, -1)?;
        let segments = split(path)?;
        if segments.is_empty() {
            return Err(Error::OutsideFilesystem);
        }
        Ok(self.view(Node::hardlink(
            &self.root,
            &source,
            &segments,
            mode,
            mod_time,
        )?))
    }

    /// A write handle for this view's root node. Bytes are streamed
    /// through the identifier pipeline; closing the handle finalises
    /// the identifiers and deduplicates the blob.
    pub fn create(&self) -> Result<BlobWriter> {
        self.guard_mutable()?;
        BlobWriter::new(self.db.clone(), self.root.clone())
    }

    /// Touch `path` and copy `reader` into it.
    pub fn copy_to<R: Read>(
        &self,
        path: &str,
        mode: Mode,
        mod_time: DateTime<Utc>,
        reader: R,
    ) -> Result<Fs> {
        let view = self.touch(path, mode, mod_time)?;
        ingest::ingest_reader(&self.db, &view.root, reader)?;
        Ok(view)
    }

    /// Attach an extraction child and copy `reader` into it.
    pub fn copy_extraction<R: Read>(
        &self,
        mode: Mode,
        mod_time: DateTime<Utc>,
        reader: R,
    ) -> Result<Fs> {
        let view = self.touch_extraction(mode, mod_time)?;
        ingest::ingest_reader(&self.db, &view.root, reader)?;
        Ok(view)
    }

    // ---- queries ----

    /// The node at `path`, resolved to the deepest element of any
    /// extraction chain.
    pub fn stat(&self, path: &str) -> Result<Arc<Node>> {
        self.guard_open()?;
        self.resolve(path, -1)
    }

    /// The node at `path` and index `at` along its extraction chain;
    /// `-1` selects the deepest element.
    pub fn stat_at(&self, path: &str, at: i64) -> Result<Arc<Node>> {
        self.guard_open()?;
        self.resolve(path, at)
    }

    fn resolve(&self, path: &str, at: i64) -> Result<Arc<Node>> {
        let segments = split(path)?;
        Node::travel_to(&self.root, &segments, at)
    }

    /// Open the blob of the node at `path` for reading. Directories
    /// and symlinks cannot be opened.
    pub fn open(&self, path: &str) -> Result<fs::File> {
        self.guard_open()?;
        let node = self.resolve(path, -1)?;
        self.open_node(&node)
    }

    /// Open a resolved node's blob for reading.
    pub fn open_node(&self, node: &Arc<Node>) -> Result<fs::File> {
        if !node.is_regular() {
            return Err(Error::not_regular(node.name()));
        }
        Ok(fs::File::open(
            node.reference().storage_path(self.db.storage_dir()),
        )?)
    }

    /// Open this view's root blob for reading.
    pub fn open_root(&self) -> Result<fs::File> {
        self.open_node(&self.root)
    }

    /// Depth-first walk from `path`. The callback sees each node with
    /// its namespace path; an extraction child appears at the same
    /// path as its parent, named children follow in lexicographic
    /// order. Returning `DontWalk` skips a subtree; any other error
    /// aborts the walk.
    pub fn walk<F>(&self, path: &str, mut callback: F) -> Result<()>
    where
        F: FnMut(&str, &Arc<Node>) -> Result<()>,
    {
        let segments = split(path)?;
        let start = Node::travel_to(&self.root, &segments, 0)?;
        let base = join_root(&segments);
        Node::walk_tree(&start, &base, false, &mut |walk_path, _, node| {
            callback(walk_path, node)
        })
    }

    /// A view rooted at the node `path` resolves to.
    pub fn fs_from(&self, path: &str) -> Result<Fs> {
        self.guard_open()?;
        Ok(self.view(self.resolve(path, -1)?))
    }

    /// Create (if needed) the directory `path` under this view with the
    /// root's mode and time, and return a view on it.
    pub fn new_fs_child(&self, path: &str) -> Result<Fs> {
        self.guard_mutable()?;
        let segments = split(path)?;
        if segments.is_empty() {
            return Err(Error::OutsideFilesystem);
        }
        Ok(self.view(Node::mkdir_p(
            &self.root,
            &segments,
            self.root.mode(),
            self.root.mod_time(),
        )?))
    }

    /// One view per direct child: the extraction child first, then
    /// named children in lexicographic order.
    pub fn fs_children(&self) -> Vec<Fs> {
        let reference = self.root.reference();
        let mut children = Vec::new();
        if let Some(child) = reference.extraction() {
            children.push(self.view(child));
        }
        for child in reference.children_sorted() {
            children.push(self.view(child));
        }
        children
    }

    // ---- root node accessors ----

    /// The node this view is rooted at.
    pub fn node(&self) -> &Arc<Node> {
        &self.root
    }

    pub fn id(&self) -> String {
        self.root.id()
    }

    pub fn is_dir(&self) -> bool {
        self.root.is_dir()
    }

    /// Regular as judged by the root node's filetype.
    pub fn is_regular(&self) -> bool {
        self.root.is_regular()
    }

    /// Diagnostic identity line for the root node.
    pub fn error_id(&self) -> String {
        self.root.error_id()
    }

    /// The on-disk path of this view's root blob.
    pub fn storage_path(&self) -> PathBuf {
        self.root.reference().storage_path(self.db.storage_dir())
    }

    pub fn storage_dir(&self) -> &Path {
        self.db.storage_dir()
    }

    // ---- diagnostics and tags ----

    /// Record an error on this view's root node and raise the
    /// filesystem-wide error flag. Subsequent operations proceed.
    pub fn set_error(&self, message: impl Into<String>) {
        self.root.reference().set_error(message.into());
        self.db.flag_error();
    }

    /// Record a warning on this view's root node and raise the
    /// filesystem-wide warning flag.
    pub fn add_warning(&self, message: impl Into<String>) {
        self.root.reference().add_warning(message.into());
        self.db.flag_warning();
    }

    /// `InFilesystem` iff any node anywhere recorded an error.
    pub fn fs_error(&self) -> Result<()> {
        if self.db.has_error() {
            return Err(Error::InFilesystem);
        }
        Ok(())
    }

    /// `InFilesystem` iff any node anywhere recorded a warning.
    pub fn fs_warning(&self) -> Result<()> {
        if self.db.has_warning() {
            return Err(Error::InFilesystem);
        }
        Ok(())
    }

    /// Set a tag on the root node's reference; nodes deduplicated onto
    /// the same content see the same tags.
    pub fn tag_set(&self, key: impl Into<String>, value: Value) {
        self.root.tag_set(key, value);
    }

    /// Set a tag only if absent, atomically.
    pub fn tag_set_if_absent(&self, key: impl Into<String>, value: Value) -> Result<()> {
        self.root.tag_set_if_absent(key, value)
    }

    pub fn tag_get(&self, key: &str) -> Option<Value> {
        self.root.tag_get(key)
    }

    /// Remove a tag, returning its value.
    pub fn tag_take(&self, key: &str) -> Option<Value> {
        self.root.tag_take(key)
    }
}
