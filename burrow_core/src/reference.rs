//! Blob-unique state, shared by every node that resolves to the same
//! content.

use crate::error::{Error, Result};
use crate::ident::Identifiers;
use crate::node::Node;
use crate::sniff::Filetype;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Acquire a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// The child slot of a reference: either named directory entries or a
/// single anonymous extraction child, never both at once.
pub(crate) enum Links {
    Empty,
    Children(BTreeMap<String, Arc<Node>>),
    Extraction(Arc<Node>),
}

/// Everything unique to a blob, as opposed to a location in the
/// namespace: identity, content descriptors, neighbourhood links,
/// diagnostics, and tags.
///
/// A reference is shared by all nodes that deduplicate onto it; the
/// content descriptors are frozen once the sha512 is known.
pub struct Reference {
    id: String,
    identifiers: RwLock<Identifiers>,
    links: Mutex<Links>,
    error: Mutex<Option<String>>,
    warnings: Mutex<Vec<String>>,
    tags: Mutex<HashMap<String, Value>>,
}

impl Reference {
    pub(crate) fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub(crate) fn with_id(id: String) -> Self {
        Reference {
            id,
            identifiers: RwLock::new(Identifiers::default()),
            links: Mutex::new(Links::Empty),
            error: Mutex::new(None),
            warnings: Mutex::new(Vec::new()),
            tags: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh reference carrying a synthetic filetype (directories and
    /// symlinks bypass the sniffer).
    pub(crate) fn with_filetype(filetype: Filetype) -> Self {
        let reference = Self::new();
        write(&reference.identifiers).filetype = filetype;
        reference
    }

    /// The stable opaque id, also the blob's file name in the storage
    /// directory.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn storage_path(&self, storage_dir: &Path) -> PathBuf {
        storage_dir.join(&self.id)
    }

    pub fn identifiers(&self) -> Identifiers {
        read(&self.identifiers).clone()
    }

    pub fn sha512(&self) -> String {
        read(&self.identifiers).sha512.clone()
    }

    pub fn size(&self) -> u64 {
        read(&self.identifiers).size
    }

    pub fn filetype(&self) -> Filetype {
        read(&self.identifiers).filetype.clone()
    }

    /// Install the finalised descriptors. Once a sha512 is present the
    /// content fields are frozen and later calls are ignored.
    pub(crate) fn finalise(&self, identifiers: Identifiers) {
        let mut current = write(&self.identifiers);
        if current.sha512.is_empty() {
            *current = identifiers;
        }
    }

    // ---- links ----

    /// Direct named lookup. A node holding an extraction child simply
    /// has no named children.
    pub(crate) fn named_child(&self, name: &str) -> Option<Arc<Node>> {
        match &*lock(&self.links) {
            Links::Children(children) => children.get(name).cloned(),
            _ => None,
        }
    }

    /// Named lookup for mkdir-style descent; refuses when an extraction
    /// child occupies the slot.
    pub(crate) fn named_child_checked(&self, name: &str) -> Result<Option<Arc<Node>>> {
        match &*lock(&self.links) {
            Links::Extraction(_) => Err(Error::HasChild),
            Links::Children(children) => Ok(children.get(name).cloned()),
            Links::Empty => Ok(None),
        }
    }

    /// Attach a named child, replacing any existing entry of the same
    /// name (the replaced node's reference is orphaned).
    pub(crate) fn insert_child(&self, node: Arc<Node>) -> Result<Arc<Node>> {
        let mut links = lock(&self.links);
        match &mut *links {
            Links::Extraction(_) => Err(Error::HasChild),
            Links::Children(children) => {
                children.insert(node.name().to_string(), node.clone());
                Ok(node)
            }
            Links::Empty => {
                let mut children = BTreeMap::new();
                children.insert(node.name().to_string(), node.clone());
                *links = Links::Children(children);
                Ok(node)
            }
        }
    }

    /// Attach the single anonymous extraction child, replacing any
    /// previous one.
    pub(crate) fn set_extraction(&self, node: Arc<Node>) -> Result<Arc<Node>> {
        let mut links = lock(&self.links);
        if let Links::Children(children) = &*links {
            if !children.is_empty() {
                return Err(Error::HasChildren);
            }
        }
        *links = Links::Extraction(node.clone());
        Ok(node)
    }

    pub(crate) fn extraction(&self) -> Option<Arc<Node>> {
        match &*lock(&self.links) {
            Links::Extraction(node) => Some(node.clone()),
            _ => None,
        }
    }

    /// Named children in lexicographic name order.
    pub(crate) fn children_sorted(&self) -> Vec<Arc<Node>> {
        match &*lock(&self.links) {
            Links::Children(children) => children.values().cloned().collect(),
            _ => Vec::new(),
        }
    }

    // ---- diagnostics ----

    pub(crate) fn set_error(&self, message: String) {
        *lock(&self.error) = Some(message);
    }

    pub fn error(&self) -> Option<String> {
        lock(&self.error).clone()
    }

    pub(crate) fn add_warning(&self, message: String) {
        lock(&self.warnings).push(message);
    }

    pub fn warnings(&self) -> Vec<String> {
        lock(&self.warnings).clone()
    }

    // ---- tags ----

    /// Set a tag, overwriting any previous value.
    pub fn tag_set(&self, key: impl Into<String>, value: Value) {
        lock(&self.tags).insert(key.into(), value);
    }

    /// Set a tag only if the key is absent; the check and the insert
    /// happen under one lock.
    pub fn tag_set_if_absent(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let mut tags = lock(&self.tags);
        let key = key.into();
        if tags.contains_key(&key) {
            return Err(Error::AlreadyExists);
        }
        tags.insert(key, value);
        Ok(())
    }

    pub fn tag_get(&self, key: &str) -> Option<Value> {
        lock(&self.tags).get(key).cloned()
    }

    /// Remove a tag, returning its value.
    pub fn tag_take(&self, key: &str) -> Option<Value> {
        lock(&self.tags).remove(key)
    }

    pub(crate) fn tags_snapshot(&self) -> BTreeMap<String, Value> {
        lock(&self.tags)
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub(crate) fn set_tags(&self, entries: impl IntoIterator<Item = (String, Value)>) {
        let mut tags = lock(&self.tags);
        for (key, value) in entries {
            tags.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::Mode;
    use chrono::Utc;

    fn node(name: &str) -> Arc<Node> {
        Arc::new(Node::new(name, Mode::new(0o644), Utc::now()))
    }

    #[test]
    fn test_children_and_extraction_are_exclusive() {
        let reference = Reference::new();
        reference.insert_child(node("a")).unwrap();
        assert!(matches!(
            reference.set_extraction(node("x")),
            Err(Error::HasChildren)
        ));

        let other = Reference::new();
        other.set_extraction(node("x")).unwrap();
        assert!(matches!(other.insert_child(node("a")), Err(Error::HasChild)));
        assert!(matches!(
            other.named_child_checked("a"),
            Err(Error::HasChild)
        ));
        assert!(other.named_child("a").is_none());
    }

    #[test]
    fn test_insert_child_overwrites_same_name() {
        let reference = Reference::new();
        let first = reference.insert_child(node("a")).unwrap();
        let second = reference.insert_child(node("a")).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        let children = reference.children_sorted();
        assert_eq!(children.len(), 1);
        assert!(Arc::ptr_eq(&children[0], &second));
    }

    #[test]
    fn test_children_sorted_order() {
        let reference = Reference::new();
        for name in ["zeta", "alpha", "mid"] {
            reference.insert_child(node(name)).unwrap();
        }
        let names: Vec<_> = reference
            .children_sorted()
            .iter()
            .map(|child| child.name().to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_finalise_freezes_content() {
        let reference = Reference::new();
        let mut identifiers = Identifiers {
            sha512: "aaaa".to_string(),
            size: 4,
            ..Identifiers::default()
        };
        reference.finalise(identifiers.clone());
        assert_eq!(reference.sha512(), "aaaa");

        identifiers.sha512 = "bbbb".to_string();
        reference.finalise(identifiers);
        assert_eq!(reference.sha512(), "aaaa");
        assert_eq!(reference.size(), 4);
    }

    #[test]
    fn test_tags() {
        let reference = Reference::new();
        assert!(reference.tag_get("foo").is_none());

        reference.tag_set("foo", 47.into());
        assert_eq!(reference.tag_get("foo"), Some(47.into()));

        reference.tag_set("foo", 53.into());
        assert_eq!(reference.tag_get("foo"), Some(53.into()));

        assert!(matches!(
            reference.tag_set_if_absent("foo", 7.into()),
            Err(Error::AlreadyExists)
        ));
        assert_eq!(reference.tag_get("foo"), Some(53.into()));

        reference.tag_set_if_absent("bar", 7.into()).unwrap();
        assert_eq!(reference.tag_get("bar"), Some(7.into()));

        assert_eq!(reference.tag_take("bar"), Some(7.into()));
        assert!(reference.tag_get("bar").is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(Reference::new().id(), Reference::new().id());
    }
}
