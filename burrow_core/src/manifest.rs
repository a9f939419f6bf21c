//! Newline-delimited JSON persistence for the namespace.

use crate::db::ReferenceDb;
use crate::error::{Error, Result};
use crate::ident::Identifiers;
use crate::mode::Mode;
use crate::node::Node;
use crate::path::split;
use crate::reference::Reference;
use crate::sniff::Filetype;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufWriter, Write};
use std::sync::Arc;

/// One manifest line: a node flattened together with its reference.
/// The `child` flag distinguishes an extraction child from a named
/// child at the same path.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    path: String,
    child: bool,
    name: String,
    mode: Mode,
    #[serde(rename = "modTime")]
    mod_time: DateTime<Utc>,
    symlink: String,
    uid: String,
    #[serde(rename = "type")]
    filetype: Filetype,
    tags: BTreeMap<String, Value>,
    warning: Vec<String>,
    error: String,
    size: u64,
    md5: String,
    sha1: String,
    sha256: String,
    sha512: String,
    entropy: f64,
}

impl Record {
    fn for_node(path: &str, is_extraction: bool, node: &Node) -> Self {
        let reference = node.reference();
        let identifiers = reference.identifiers();
        Record {
            path: path.to_string(),
            child: is_extraction,
            name: node.name().to_string(),
            mode: node.mode(),
            mod_time: node.mod_time(),
            symlink: node.symlink_target().unwrap_or("").to_string(),
            uid: reference.id().to_string(),
            filetype: identifiers.filetype,
            tags: reference.tags_snapshot(),
            warning: reference.warnings(),
            error: reference.error().unwrap_or_default(),
            size: identifiers.size,
            md5: identifiers.md5,
            sha1: identifiers.sha1,
            sha256: identifiers.sha256,
            sha512: identifiers.sha512,
            entropy: identifiers.entropy,
        }
    }
}

/// Write the namespace to `fin.db` in walk order, one JSON object per
/// line.
pub(crate) fn save(db: &ReferenceDb, root: &Arc<Node>) -> Result<()> {
    let manifest_path = db.manifest_path();
    let file = fs::File::create(&manifest_path)?;
    let mut out = BufWriter::new(file);

    let mut saved = 0usize;
    Node::walk_tree(root, "/", false, &mut |path, is_extraction, node| {
        serde_json::to_writer(&mut out, &Record::for_node(path, is_extraction, node))?;
        out.write_all(b"\n")?;
        saved += 1;
        Ok(())
    })?;
    out.flush()?;
    log::debug!("saved manifest with {saved} entries");
    Ok(())
}

/// Rebuild the namespace from `fin.db`.
///
/// The first line is the root; every later line is placed by
/// [`attach`]. References are deduplicated as they arrive, and a
/// deduplicated reference whose sha512 matches one of its ancestors is
/// rejected as circular. On success the manifest is removed (kept when
/// opened read-only, since a read-only close never rewrites it).
pub(crate) fn load(db: &Arc<ReferenceDb>) -> Result<Arc<Node>> {
    let manifest_path = db.manifest_path();
    let file = fs::File::open(&manifest_path)?;
    let mut lines = io::BufReader::new(file).lines();

    let first = match lines.next() {
        Some(line) => line?,
        None => {
            return Err(Error::Io {
                source: io::Error::new(io::ErrorKind::InvalidData, "empty manifest"),
            })
        }
    };
    let record: Record = serde_json::from_str(&first)?;
    let (root, _) = restore_node(db, &record);

    let mut loaded = 1usize;
    for line in lines {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)?;
        let segments = split(&record.path)?;
        let (node, deduped) = restore_node(db, &record);
        attach(&root, &segments, &record, node, deduped)?;
        loaded += 1;
    }

    if !db.read_only() {
        fs::remove_file(&manifest_path)?;
    }
    log::debug!("loaded manifest with {loaded} entries");
    Ok(root)
}

/// Place a restored node under the tree per the first-resolvable-parent
/// rule.
///
/// Deduplicated references share children, so the walk serialises a
/// shared subtree once per referring path: a line whose uid is already
/// in place at its path is such a revisit and is skipped. Otherwise a
/// resolvable path deepens the extraction chain when the line's
/// `child` flag says so, and re-enters the parent's children when it
/// does not. A deduplicated reference repeating the content of a node
/// on its resolution path is circular.
fn attach(
    root: &Arc<Node>,
    segments: &[&str],
    record: &Record,
    node: Arc<Node>,
    deduped: bool,
) -> Result<()> {
    let Some((last, prefix)) = segments.split_last() else {
        // A repeated root path extends the root's extraction chain.
        let deepest = Node::travel_to(root, &[], -1)?;
        if deepest.id() == record.uid {
            return Ok(());
        }
        if deduped
            && !record.sha512.is_empty()
            && chain_contains_sha512(root, &[], &record.sha512)
        {
            return Err(Error::CircularReference);
        }
        deepest.reference().set_extraction(node)?;
        return Ok(());
    };

    let parent = Node::travel_to(root, prefix, -1)?;
    let existing = match Node::travel_to(&parent, &[*last], -1) {
        Ok(existing) => Some(existing),
        Err(Error::NotFound) => None,
        Err(err) => return Err(err),
    };
    if let Some(existing) = &existing {
        if existing.id() == record.uid {
            return Ok(());
        }
    }

    if deduped && !record.sha512.is_empty() {
        // An extraction child is checked against its whole resolution
        // path, itself included; a named child only against its proper
        // ancestors.
        let ancestors = if record.child { segments } else { prefix };
        if chain_contains_sha512(root, ancestors, &record.sha512) {
            return Err(Error::CircularReference);
        }
    }

    match existing {
        Some(existing) if record.child => {
            existing.reference().set_extraction(node)?;
        }
        _ => {
            parent.reference().insert_child(node)?;
        }
    }
    Ok(())
}

/// Rebuild the node and its reference, deduplicating through the
/// database. Tags and diagnostics are only applied when the reference
/// is new; a deduplicated line shares the already-populated canonical
/// reference.
fn restore_node(db: &Arc<ReferenceDb>, record: &Record) -> (Arc<Node>, bool) {
    let reference = Arc::new(Reference::with_id(record.uid.clone()));
    reference.finalise(Identifiers {
        size: record.size,
        md5: record.md5.clone(),
        sha1: record.sha1.clone(),
        sha256: record.sha256.clone(),
        sha512: record.sha512.clone(),
        entropy: record.entropy,
        filetype: record.filetype.clone(),
    });

    let (canonical, registered) = db.dedupe_or_register(&reference);
    if registered {
        canonical.set_tags(record.tags.clone());
        if !record.error.is_empty() {
            canonical.set_error(record.error.clone());
            db.flag_error();
        }
        if !record.warning.is_empty() {
            db.flag_warning();
        }
        for warning in &record.warning {
            canonical.add_warning(warning.clone());
        }
    }

    let symlink = if record.symlink.is_empty() {
        None
    } else {
        Some(record.symlink.clone())
    };
    let node = Arc::new(Node::restored(
        record.name.clone(),
        record.mode,
        record.mod_time,
        symlink,
        canonical,
    ));
    (node, !registered)
}

/// Walk the resolution path the way `travel_to(-1)` would and report
/// whether any visited node already carries the sha512.
fn chain_contains_sha512(node: &Arc<Node>, segments: &[&str], sha512: &str) -> bool {
    if node.sha512() == sha512 {
        return true;
    }
    if let Some(child) = node.reference().extraction() {
        return chain_contains_sha512(&child, segments, sha512);
    }
    let Some((first, rest)) = segments.split_first() else {
        return false;
    };
    match node.reference().named_child(first) {
        Some(child) => chain_contains_sha512(&child, rest, sha512),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db(tmp: &TempDir, read_only: bool) -> Arc<ReferenceDb> {
        Arc::new(ReferenceDb::new(tmp.path().to_path_buf(), read_only))
    }

    fn finalised(node: &Arc<Node>, sha512: &str, size: u64) {
        node.reference().finalise(Identifiers {
            size,
            md5: format!("md5-{sha512}"),
            sha1: format!("sha1-{sha512}"),
            sha256: format!("sha256-{sha512}"),
            sha512: sha512.to_string(),
            entropy: 3.5,
            filetype: Filetype {
                extension: "txt".to_string(),
                mimetype: "text/plain; charset=utf-8".to_string(),
            },
        });
    }

    /// A small namespace with a directory, two deduplicated files, a
    /// symlink, an extraction chain, tags, a warning, and an error.
    fn build_sample(db: &Arc<ReferenceDb>) -> Arc<Node> {
        let time = Utc::now();
        let root = Arc::new(Node::new("stdin", Mode::new(0o755), time));
        finalised(&root, "root-sha", 10);
        db.dedupe_or_register(&root.reference());
        root.tag_set("foo", "bar".into());

        let bar = Node::touch(&root, &["foo", "bar"], Mode::new(0o655), time).unwrap();
        finalised(&bar, "bar-sha", 13);
        db.dedupe_or_register(&bar.reference());
        bar.reference().add_warning("oops".to_string());
        db.flag_warning();

        // A duplicate of /foo/bar under another name.
        let dup = Node::touch(&root, &["foo", "dup"], Mode::new(0o600), time).unwrap();
        finalised(&dup, "bar-sha", 13);
        let (canonical, registered) = db.dedupe_or_register(&dup.reference());
        assert!(!registered);
        dup.set_reference(canonical);

        Node::symlink(&root, "/foo/bar", &["foo", "link"], Mode::new(0o777), time).unwrap();

        // Extraction chain under /foo/bar.
        let inner = Node::touch(&bar, &[], Mode::new(0o644), time).unwrap();
        finalised(&inner, "inner-sha", 64);
        db.dedupe_or_register(&inner.reference());
        inner.reference().set_error("decode failed".to_string());
        db.flag_error();

        root
    }

    fn snapshot(root: &Arc<Node>) -> Vec<(String, bool, String, u32, String, String, String)> {
        let mut rows = Vec::new();
        Node::walk_tree(root, "/", false, &mut |path, is_extraction, node| {
            rows.push((
                path.to_string(),
                is_extraction,
                node.name().to_string(),
                node.mode().bits(),
                node.sha512(),
                node.mimetype(),
                node.symlink_target().unwrap_or("").to_string(),
            ));
            Ok(())
        })
        .unwrap();
        rows
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let db = test_db(&tmp, false);
        let root = build_sample(&db);
        let before = snapshot(&root);

        save(&db, &root).unwrap();
        assert!(db.manifest_path().exists());

        let reloaded_db = test_db(&tmp, false);
        let reloaded = load(&reloaded_db).unwrap();
        assert_eq!(snapshot(&reloaded), before);

        // The manifest is consumed by a successful load.
        assert!(!reloaded_db.manifest_path().exists());

        // Tags, warnings, errors, and the aggregate flags round-trip.
        assert_eq!(reloaded.tag_get("foo"), Some("bar".into()));
        let bar = Node::travel_to(&reloaded, &["foo", "bar"], 0).unwrap();
        assert_eq!(bar.warnings(), vec!["oops".to_string()]);
        let inner = Node::travel_to(&reloaded, &["foo", "bar"], -1).unwrap();
        assert_eq!(inner.error(), Some("decode failed".to_string()));
        assert!(reloaded_db.has_error());
        assert!(reloaded_db.has_warning());
    }

    #[test]
    fn test_load_restores_dedup_sharing() {
        let tmp = TempDir::new().unwrap();
        let db = test_db(&tmp, false);
        let root = build_sample(&db);
        save(&db, &root).unwrap();

        let reloaded = load(&test_db(&tmp, false)).unwrap();
        let bar = Node::travel_to(&reloaded, &["foo", "bar"], 0).unwrap();
        let dup = Node::travel_to(&reloaded, &["foo", "dup"], 0).unwrap();
        assert!(Arc::ptr_eq(&bar.reference(), &dup.reference()));
    }

    #[test]
    fn test_load_reattaches_extraction_chain() {
        let tmp = TempDir::new().unwrap();
        let db = test_db(&tmp, false);
        let root = build_sample(&db);
        save(&db, &root).unwrap();

        let reloaded = load(&test_db(&tmp, false)).unwrap();
        let base = Node::travel_to(&reloaded, &["foo", "bar"], 0).unwrap();
        let deepest = Node::travel_to(&reloaded, &["foo", "bar"], -1).unwrap();
        assert!(!Arc::ptr_eq(&base, &deepest));
        assert_eq!(base.sha512(), "bar-sha");
        assert_eq!(deepest.sha512(), "inner-sha");
        assert!(matches!(
            Node::travel_to(&reloaded, &["foo", "bar"], 2),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_shared_subtree_roundtrip() {
        // A deduplicated file pair shares children, so the walk emits
        // the shared subtree once per path; reloading must rebuild the
        // same shape instead of treating the revisit as an extraction.
        let tmp = TempDir::new().unwrap();
        let db = test_db(&tmp, false);
        let time = Utc::now();

        let root = Arc::new(Node::new_dir("root", Mode::new(0o755), time));
        let bar = Node::touch(&root, &["bar"], Mode::new(0o655), time).unwrap();
        finalised(&bar, "same-sha", 13);
        db.dedupe_or_register(&bar.reference());

        let baz = Node::touch(&root, &["baz"], Mode::new(0o600), time).unwrap();
        finalised(&baz, "same-sha", 13);
        let (canonical, registered) = db.dedupe_or_register(&baz.reference());
        assert!(!registered);
        baz.set_reference(canonical);

        let nested = Node::touch(&bar, &["moreFoo"], Mode::new(0o100), time).unwrap();
        finalised(&nested, "nested-sha", 11);
        db.dedupe_or_register(&nested.reference());

        let before = snapshot(&root);
        assert_eq!(
            before.iter().map(|row| row.0.as_str()).collect::<Vec<_>>(),
            vec!["/", "/bar", "/bar/moreFoo", "/baz", "/baz/moreFoo"]
        );

        save(&db, &root).unwrap();
        let reloaded = load(&test_db(&tmp, false)).unwrap();
        assert_eq!(snapshot(&reloaded), before);

        let one = Node::travel_to(&reloaded, &["bar", "moreFoo"], 0).unwrap();
        let two = Node::travel_to(&reloaded, &["baz", "moreFoo"], 0).unwrap();
        assert!(Arc::ptr_eq(&one.reference(), &two.reference()));
    }

    #[test]
    fn test_read_only_load_keeps_manifest() {
        let tmp = TempDir::new().unwrap();
        let db = test_db(&tmp, false);
        let root = build_sample(&db);
        save(&db, &root).unwrap();

        let reloaded_db = test_db(&tmp, true);
        load(&reloaded_db).unwrap();
        assert!(reloaded_db.manifest_path().exists());
    }

    #[test]
    fn test_load_missing_manifest_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            load(&test_db(&tmp, false)),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn test_load_rejects_circular_reference() {
        let tmp = TempDir::new().unwrap();
        let db = test_db(&tmp, false);
        let time = Utc::now();

        // A root blob whose "extracted" view claims the same content.
        let root = Arc::new(Node::new("quine", Mode::new(0o644), time));
        finalised(&root, "same-sha", 32);
        db.dedupe_or_register(&root.reference());
        let mut lines = Vec::new();
        lines.push(serde_json::to_string(&Record::for_node("/", false, &root)).unwrap());
        // A second line at the same path with a fresh uid but the same
        // hashes: the deduplicated reference is its own ancestor.
        let mut record: Record = serde_json::from_str(&lines[0]).unwrap();
        record.child = true;
        record.uid = "00000000-0000-4000-8000-000000000000".to_string();
        lines.push(serde_json::to_string(&record).unwrap());
        fs::write(db.manifest_path(), lines.join("\n") + "\n").unwrap();

        let result = load(&test_db(&tmp, false));
        assert!(matches!(result, Err(Error::CircularReference)));
    }

    #[test]
    fn test_collision_line_becomes_extraction_child() {
        let tmp = TempDir::new().unwrap();
        let db = test_db(&tmp, false);
        let time = Utc::now();

        let root = Arc::new(Node::new_dir("root", Mode::new(0o755), time));
        let file = Node::touch(&root, &["data"], Mode::new(0o644), time).unwrap();
        finalised(&file, "outer-sha", 8);
        db.dedupe_or_register(&file.reference());
        save(&db, &root).unwrap();

        // Append a second line for the same path with different content:
        // on load it must become the extraction child of /data.
        let extracted = Arc::new(Node::new("data", Mode::new(0o600), time));
        finalised(&extracted, "inner-sha", 4);
        let line =
            serde_json::to_string(&Record::for_node("/data", true, &extracted)).unwrap();
        let mut manifest = fs::read_to_string(db.manifest_path()).unwrap();
        manifest.push_str(&line);
        manifest.push('\n');
        fs::write(db.manifest_path(), manifest).unwrap();

        let reloaded = load(&test_db(&tmp, false)).unwrap();
        let base = Node::travel_to(&reloaded, &["data"], 0).unwrap();
        let deep = Node::travel_to(&reloaded, &["data"], -1).unwrap();
        assert_eq!(base.sha512(), "outer-sha");
        assert_eq!(deep.sha512(), "inner-sha");
    }
}
