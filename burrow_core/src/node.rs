//! A location in the virtual namespace, and the tree operations on it.

use crate::error::{Error, Result};
use crate::mode::Mode;
use crate::path::join_path;
use crate::reference::{read, write, Reference};
use crate::sniff::Filetype;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, RwLock};

/// A node binds a path segment, mode, and timestamp to a shared
/// [`Reference`]. Everything content-related lives on the reference;
/// the node itself is the location-unique part.
pub struct Node {
    name: String,
    mode: Mode,
    mod_time: DateTime<Utc>,
    symlink: Option<String>,
    reference: RwLock<Arc<Reference>>,
}

impl Node {
    pub(crate) fn new(name: &str, mode: Mode, mod_time: DateTime<Utc>) -> Self {
        Self::with_reference(name, mode, mod_time, Arc::new(Reference::new()))
    }

    pub(crate) fn new_dir(name: &str, mode: Mode, mod_time: DateTime<Utc>) -> Self {
        Self::with_reference(
            name,
            mode.into_dir(),
            mod_time,
            Arc::new(Reference::with_filetype(Filetype::dir())),
        )
    }

    pub(crate) fn new_symlink(
        name: &str,
        target: &str,
        mode: Mode,
        mod_time: DateTime<Utc>,
    ) -> Self {
        let mut node = Self::with_reference(
            name,
            mode.into_symlink(),
            mod_time,
            Arc::new(Reference::with_filetype(Filetype::symlink())),
        );
        node.symlink = Some(target.to_string());
        node
    }

    pub(crate) fn with_reference(
        name: &str,
        mode: Mode,
        mod_time: DateTime<Utc>,
        reference: Arc<Reference>,
    ) -> Self {
        Node {
            name: name.to_string(),
            mode,
            mod_time,
            symlink: None,
            reference: RwLock::new(reference),
        }
    }

    /// Reassemble a node from persisted parts.
    pub(crate) fn restored(
        name: String,
        mode: Mode,
        mod_time: DateTime<Utc>,
        symlink: Option<String>,
        reference: Arc<Reference>,
    ) -> Self {
        Node {
            name,
            mode,
            mod_time,
            symlink,
            reference: RwLock::new(reference),
        }
    }

    // ---- file-info-shaped queries ----

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn mod_time(&self) -> DateTime<Utc> {
        self.mod_time
    }

    /// The link target; populated iff the mode marks a symlink.
    pub fn symlink_target(&self) -> Option<&str> {
        self.symlink.as_deref()
    }

    pub fn is_dir(&self) -> bool {
        self.mode.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.mode.is_symlink()
    }

    /// Regular as judged by the reference's filetype, so that every
    /// node sharing a blob agrees.
    pub fn is_regular(&self) -> bool {
        let filetype = self.filetype();
        !filetype.is_dir() && !filetype.is_symlink()
    }

    pub fn size(&self) -> u64 {
        self.reference().size()
    }

    // ---- reference plumbing ----

    pub fn reference(&self) -> Arc<Reference> {
        read(&self.reference).clone()
    }

    pub(crate) fn set_reference(&self, reference: Arc<Reference>) {
        *write(&self.reference) = reference;
    }

    pub fn id(&self) -> String {
        self.reference().id().to_string()
    }

    pub fn filetype(&self) -> Filetype {
        self.reference().filetype()
    }

    pub fn mimetype(&self) -> String {
        self.filetype().mimetype
    }

    pub fn md5(&self) -> String {
        self.reference().identifiers().md5
    }

    pub fn sha1(&self) -> String {
        self.reference().identifiers().sha1
    }

    pub fn sha256(&self) -> String {
        self.reference().identifiers().sha256
    }

    pub fn sha512(&self) -> String {
        self.reference().sha512()
    }

    pub fn entropy(&self) -> f64 {
        self.reference().identifiers().entropy
    }

    /// Diagnostic identity line for log and error messages.
    pub fn error_id(&self) -> String {
        let reference = self.reference();
        format!(
            "id: {}, name: {}, type: {}",
            reference.id(),
            self.name,
            reference.filetype().mimetype
        )
    }

    // ---- tags (delegated to the shared reference) ----

    pub fn tag_set(&self, key: impl Into<String>, value: Value) {
        self.reference().tag_set(key, value);
    }

    pub fn tag_set_if_absent(&self, key: impl Into<String>, value: Value) -> Result<()> {
        self.reference().tag_set_if_absent(key, value)
    }

    pub fn tag_get(&self, key: &str) -> Option<Value> {
        self.reference().tag_get(key)
    }

    pub fn tag_take(&self, key: &str) -> Option<Value> {
        self.reference().tag_take(key)
    }

    pub fn error(&self) -> Option<String> {
        self.reference().error()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.reference().warnings()
    }

    // ---- namespace engine ----

    /// Descend `paths`, creating directories as needed. An existing
    /// non-directory entry is replaced by a fresh directory, orphaning
    /// its reference, unless it carries an extraction child; then the
    /// descent fails with `HasChild` rather than clobbering the
    /// extracted view.
    pub(crate) fn mkdir_p(
        node: &Arc<Node>,
        paths: &[&str],
        mode: Mode,
        mod_time: DateTime<Utc>,
    ) -> Result<Arc<Node>> {
        let Some((first, rest)) = paths.split_first() else {
            return Ok(node.clone());
        };
        let reference = node.reference();
        let child = match reference.named_child_checked(first)? {
            Some(existing) if existing.is_dir() => existing,
            Some(existing) if existing.reference().extraction().is_some() => {
                return Err(Error::HasChild);
            }
            _ => reference.insert_child(Arc::new(Node::new_dir(first, mode, mod_time)))?,
        };
        Node::mkdir_p(&child, rest, mode, mod_time)
    }

    /// Attach a fresh regular node. Empty `paths` attaches it as the
    /// extraction child, carrying the parent's name; otherwise the
    /// prefix is mkdir'd and the terminal segment becomes a named
    /// child, replacing any previous entry of that name.
    pub(crate) fn touch(
        node: &Arc<Node>,
        paths: &[&str],
        mode: Mode,
        mod_time: DateTime<Utc>,
    ) -> Result<Arc<Node>> {
        let Some((name, prefix)) = paths.split_last() else {
            return node
                .reference()
                .set_extraction(Arc::new(Node::new(&node.name, mode, mod_time)));
        };
        let dir = Node::mkdir_p(node, prefix, mode, mod_time)?;
        dir.reference()
            .insert_child(Arc::new(Node::new(name, mode, mod_time)))
    }

    /// Attach a symlink node pointing at `target`. `paths` must be
    /// non-empty.
    pub(crate) fn symlink(
        node: &Arc<Node>,
        target: &str,
        paths: &[&str],
        mode: Mode,
        mod_time: DateTime<Utc>,
    ) -> Result<Arc<Node>> {
        let Some((name, prefix)) = paths.split_last() else {
            return Err(Error::OutsideFilesystem);
        };
        let dir = Node::mkdir_p(node, prefix, mode, mod_time)?;
        dir.reference()
            .insert_child(Arc::new(Node::new_symlink(name, target, mode, mod_time)))
    }

    /// Attach a node sharing `source`'s reference, bypassing identifier
    /// computation. `paths` must be non-empty.
    pub(crate) fn hardlink(
        node: &Arc<Node>,
        source: &Arc<Node>,
        paths: &[&str],
        mode: Mode,
        mod_time: DateTime<Utc>,
    ) -> Result<Arc<Node>> {
        let Some((name, prefix)) = paths.split_last() else {
            return Err(Error::OutsideFilesystem);
        };
        let dir = Node::mkdir_p(node, prefix, mode, mod_time)?;
        dir.reference().insert_child(Arc::new(Node::with_reference(
            name,
            mode,
            mod_time,
            source.reference(),
        )))
    }

    /// Resolve `paths` with an index along extraction chains.
    ///
    /// While the current node carries an extraction child and `at` is
    /// non-zero, resolution descends into the chain, counting `at`
    /// down once per hop at the terminal path. `at == -1` therefore
    /// selects the deepest element, `at == k` the k-th, and an index
    /// past the end reports `NotFound`.
    pub(crate) fn travel_to(node: &Arc<Node>, paths: &[&str], at: i64) -> Result<Arc<Node>> {
        if at != 0 {
            if let Some(child) = node.reference().extraction() {
                let at = if paths.is_empty() { at - 1 } else { at };
                return Node::travel_to(&child, paths, at);
            }
        }
        if paths.is_empty() {
            if at > 0 {
                return Err(Error::NotFound);
            }
            return Ok(node.clone());
        }
        match node.reference().named_child(paths[0]) {
            Some(child) => Node::travel_to(&child, &paths[1..], at),
            None => Err(Error::NotFound),
        }
    }

    /// Depth-first deterministic walk. The callback sees the node
    /// first; `DontWalk` skips its children, any other error aborts.
    /// An extraction child is visited at the *same* path as its
    /// parent; named children follow in lexicographic order.
    pub(crate) fn walk_tree(
        node: &Arc<Node>,
        path: &str,
        is_extraction: bool,
        callback: &mut dyn FnMut(&str, bool, &Arc<Node>) -> Result<()>,
    ) -> Result<()> {
        match callback(path, is_extraction, node) {
            Ok(()) => {}
            Err(Error::DontWalk) => return Ok(()),
            Err(err) => return Err(err),
        }
        let reference = node.reference();
        if let Some(child) = reference.extraction() {
            return Node::walk_tree(&child, path, true, callback);
        }
        for child in reference.children_sorted() {
            let child_path = join_path(path, child.name());
            Node::walk_tree(&child, &child_path, false, callback)?;
        }
        Ok(())
    }
}
