//! Streaming write handle: identification, storage, deduplication.

use crate::db::ReferenceDb;
use crate::dest::{CachedDest, Destination};
use crate::error::{Error, Result};
use crate::ident::IdentWriter;
use crate::node::Node;
use crate::reference::Reference;
use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::Arc;

/// Write handle for a node's blob content.
///
/// Bytes are fanned through the identifier pipeline into a cached
/// destination. [`BlobWriter::finish`] freezes the identifiers and
/// either keeps the bytes or discards them in favour of an
/// already-stored duplicate.
pub struct BlobWriter {
    inner: IdentWriter<CachedDest>,
    node: Arc<Node>,
    db: Arc<ReferenceDb>,
}

impl BlobWriter {
    pub(crate) fn new(db: Arc<ReferenceDb>, node: Arc<Node>) -> Result<Self> {
        if !node.is_regular() {
            return Err(Error::CantWriteNewFile);
        }
        let path = node.reference().storage_path(db.storage_dir());
        Ok(BlobWriter {
            inner: IdentWriter::new(CachedDest::new(path)),
            node,
            db,
        })
    }

    /// Finalise the stream: install the identifiers on the node's
    /// reference, deduplicate by sha512, and persist or drop the
    /// backing bytes accordingly.
    pub fn finish(self) -> Result<()> {
        let BlobWriter { inner, node, db } = self;
        let (identifiers, mut dest) = inner.finish();

        let fresh = node.reference();
        fresh.finalise(identifiers);

        let (canonical, registered) = db.dedupe_or_register(&fresh);
        if registered {
            return Ok(dest.keep()?);
        }

        // Duplicate content: the earlier blob stays, this one goes.
        dest.discard()?;
        node.set_reference(canonical.clone());
        if reaches_sha512(&canonical, &canonical.sha512(), &mut HashSet::new()) {
            // Sharing the reference would let the tree walk back into
            // itself; undo and leave the node on its private copy.
            node.set_reference(fresh);
            return Err(Error::CircularReference);
        }
        Ok(())
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// True when a node carrying `sha512` content is reachable through the
/// reference's child links. `seen` holds visited references so shared
/// subtrees are traversed once.
fn reaches_sha512(
    reference: &Arc<Reference>,
    sha512: &str,
    seen: &mut HashSet<*const Reference>,
) -> bool {
    if !seen.insert(Arc::as_ptr(reference)) {
        return false;
    }
    let mut nodes = Vec::new();
    if let Some(child) = reference.extraction() {
        nodes.push(child);
    }
    nodes.extend(reference.children_sorted());
    for node in nodes {
        let child_reference = node.reference();
        if child_reference.sha512() == sha512 {
            return true;
        }
        if reaches_sha512(&child_reference, sha512, seen) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::Mode;
    use chrono::Utc;
    use std::path::Path;
    use tempfile::TempDir;

    fn setup(tmp: &TempDir) -> (Arc<ReferenceDb>, Arc<Node>) {
        let storage = tmp.path().join("store");
        std::fs::create_dir(&storage).unwrap();
        let db = Arc::new(ReferenceDb::new(storage, false));
        let root = Arc::new(Node::new_dir("root", Mode::new(0o755), Utc::now()));
        (db, root)
    }

    fn write_blob(db: &Arc<ReferenceDb>, node: &Arc<Node>, content: &[u8]) -> Result<()> {
        let mut writer = BlobWriter::new(db.clone(), node.clone())?;
        writer.write_all(content).unwrap();
        writer.finish()
    }

    fn file_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_new_blob_is_kept() {
        let tmp = TempDir::new().unwrap();
        let (db, root) = setup(&tmp);

        let node = Node::touch(&root, &["a"], Mode::new(0o644), Utc::now()).unwrap();
        write_blob(&db, &node, b"Hello, World!").unwrap();

        assert_eq!(file_count(db.storage_dir()), 1);
        let stored = db.storage_dir().join(node.id());
        assert_eq!(std::fs::read(stored).unwrap(), b"Hello, World!");
        assert_eq!(node.size(), 13);
    }

    #[test]
    fn test_duplicate_blob_is_discarded_and_shared() {
        let tmp = TempDir::new().unwrap();
        let (db, root) = setup(&tmp);

        let first = Node::touch(&root, &["a"], Mode::new(0o644), Utc::now()).unwrap();
        write_blob(&db, &first, b"Hello, World!").unwrap();

        let second = Node::touch(&root, &["b"], Mode::new(0o600), Utc::now()).unwrap();
        write_blob(&db, &second, b"Hello, World!").unwrap();

        assert!(Arc::ptr_eq(&first.reference(), &second.reference()));
        assert_eq!(first.id(), second.id());
        assert_eq!(file_count(db.storage_dir()), 1);
        // Location-unique state is not shared.
        assert_eq!(second.mode().perm(), 0o600);
    }

    #[test]
    fn test_distinct_blobs_both_stored() {
        let tmp = TempDir::new().unwrap();
        let (db, root) = setup(&tmp);

        let a = Node::touch(&root, &["a"], Mode::new(0o644), Utc::now()).unwrap();
        write_blob(&db, &a, b"one").unwrap();
        let b = Node::touch(&root, &["b"], Mode::new(0o644), Utc::now()).unwrap();
        write_blob(&db, &b, b"two").unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(file_count(db.storage_dir()), 2);
    }

    #[test]
    fn test_create_on_directory_fails() {
        let tmp = TempDir::new().unwrap();
        let (db, root) = setup(&tmp);
        assert!(matches!(
            BlobWriter::new(db, root),
            Err(Error::CantWriteNewFile)
        ));
    }

    #[test]
    fn test_extraction_child_with_same_content_is_circular() {
        let tmp = TempDir::new().unwrap();
        let (db, root) = setup(&tmp);

        let base = Node::touch(&root, &["bar"], Mode::new(0o644), Utc::now()).unwrap();
        write_blob(&db, &base, b"Hello, World!").unwrap();

        // The "decoded view" turns out to be byte-identical to the
        // blob it was decoded from.
        let child = Node::touch(&base, &[], Mode::new(0o644), Utc::now()).unwrap();
        let result = write_blob(&db, &child, b"Hello, World!");
        assert!(matches!(result, Err(Error::CircularReference)));

        // The node was left on its private reference: no cycle.
        assert!(!Arc::ptr_eq(&base.reference(), &child.reference()));
        let mut visits = 0;
        Node::walk_tree(&root, "/", false, &mut |_, _, _| {
            visits += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(visits, 3);
    }

    #[test]
    fn test_legitimate_dedup_through_extraction_is_allowed() {
        let tmp = TempDir::new().unwrap();
        let (db, root) = setup(&tmp);

        let base = Node::touch(&root, &["bar"], Mode::new(0o644), Utc::now()).unwrap();
        write_blob(&db, &base, b"compressed bytes").unwrap();

        let child = Node::touch(&base, &[], Mode::new(0o644), Utc::now()).unwrap();
        write_blob(&db, &child, b"plain bytes").unwrap();

        // A sibling file with the same content as the chain's deepest
        // element deduplicates without forming a cycle.
        let other = Node::touch(&root, &["copy"], Mode::new(0o644), Utc::now()).unwrap();
        write_blob(&db, &other, b"plain bytes").unwrap();
        assert!(Arc::ptr_eq(&other.reference(), &child.reference()));
    }
}
