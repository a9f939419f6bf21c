//! Per-filesystem reference database: content-addressed deduplication
//! plus the lifecycle state shared by every view.

use crate::reference::{lock, Reference};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Manifest file name inside the storage directory.
pub(crate) const MANIFEST_NAME: &str = "fin.db";

pub(crate) struct ReferenceDb {
    storage_dir: PathBuf,
    references: Mutex<HashMap<String, Arc<Reference>>>,
    error: AtomicBool,
    warning: AtomicBool,
    closed: AtomicBool,
    read_only: bool,
}

impl ReferenceDb {
    pub(crate) fn new(storage_dir: PathBuf, read_only: bool) -> Self {
        ReferenceDb {
            storage_dir,
            references: Mutex::new(HashMap::new()),
            error: AtomicBool::new(false),
            warning: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            read_only,
        }
    }

    pub(crate) fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub(crate) fn manifest_path(&self) -> PathBuf {
        self.storage_dir.join(MANIFEST_NAME)
    }

    /// Content-addressed deduplication: returns the canonical reference
    /// for the sha512 and whether the passed reference became it.
    ///
    /// References without a sha512 (directories, symlinks, in-flight
    /// blobs) are never registered and come back unchanged.
    pub(crate) fn dedupe_or_register(&self, reference: &Arc<Reference>) -> (Arc<Reference>, bool) {
        let sha512 = reference.sha512();
        if sha512.is_empty() {
            return (reference.clone(), true);
        }
        let mut references = lock(&self.references);
        if let Some(existing) = references.get(&sha512) {
            log::debug!("dedup hit {} -> {}", reference.id(), existing.id());
            return (existing.clone(), false);
        }
        references.insert(sha512, reference.clone());
        (reference.clone(), true)
    }

    // The error and warning bits are monotonic: node operations only
    // ever set them, queries only read them.

    pub(crate) fn flag_error(&self) {
        self.error.store(true, Ordering::Relaxed);
    }

    pub(crate) fn flag_warning(&self) {
        self.warning.store(true, Ordering::Relaxed);
    }

    pub(crate) fn has_error(&self) -> bool {
        self.error.load(Ordering::Relaxed)
    }

    pub(crate) fn has_warning(&self) -> bool {
        self.warning.load(Ordering::Relaxed)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub(crate) fn read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::Identifiers;

    fn reference_with_sha(sha512: &str) -> Arc<Reference> {
        let reference = Arc::new(Reference::new());
        reference.finalise(Identifiers {
            sha512: sha512.to_string(),
            ..Identifiers::default()
        });
        reference
    }

    #[test]
    fn test_first_registration_wins() {
        let db = ReferenceDb::new(PathBuf::from("unused"), false);

        let first = reference_with_sha("aa");
        let (canonical, registered) = db.dedupe_or_register(&first);
        assert!(registered);
        assert!(Arc::ptr_eq(&canonical, &first));

        let second = reference_with_sha("aa");
        let (canonical, registered) = db.dedupe_or_register(&second);
        assert!(!registered);
        assert!(Arc::ptr_eq(&canonical, &first));
    }

    #[test]
    fn test_distinct_hashes_coexist() {
        let db = ReferenceDb::new(PathBuf::from("unused"), false);
        let (_, first_new) = db.dedupe_or_register(&reference_with_sha("aa"));
        let (_, second_new) = db.dedupe_or_register(&reference_with_sha("bb"));
        assert!(first_new);
        assert!(second_new);
    }

    #[test]
    fn test_empty_sha_never_registered() {
        let db = ReferenceDb::new(PathBuf::from("unused"), false);

        let first = Arc::new(Reference::new());
        let (canonical, registered) = db.dedupe_or_register(&first);
        assert!(registered);
        assert!(Arc::ptr_eq(&canonical, &first));

        // A second unhashed reference is not deduplicated onto the first.
        let second = Arc::new(Reference::new());
        let (canonical, registered) = db.dedupe_or_register(&second);
        assert!(registered);
        assert!(Arc::ptr_eq(&canonical, &second));
    }

    #[test]
    fn test_flags_are_monotonic() {
        let db = ReferenceDb::new(PathBuf::from("unused"), false);
        assert!(!db.has_error());
        assert!(!db.has_warning());
        db.flag_error();
        db.flag_warning();
        assert!(db.has_error());
        assert!(db.has_warning());
    }

    #[test]
    fn test_concurrent_dedupe_single_winner() {
        let db = Arc::new(ReferenceDb::new(PathBuf::from("unused"), false));
        let mut registered_count = 0;

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let db = db.clone();
                    scope.spawn(move || {
                        let (_, registered) = db.dedupe_or_register(&reference_with_sha("same"));
                        registered
                    })
                })
                .collect();
            for handle in handles {
                if handle.join().unwrap() {
                    registered_count += 1;
                }
            }
        });

        assert_eq!(registered_count, 1);
    }
}
