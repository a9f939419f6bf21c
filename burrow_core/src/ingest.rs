//! Ingesting host files and directory trees into the namespace.

use crate::db::ReferenceDb;
use crate::error::{Error, Result};
use crate::mode::Mode;
use crate::node::Node;
use crate::reference::lock;
use crate::writer::BlobWriter;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// First-error-wins collector for a group of parallel ingest workers.
///
/// Every worker offers its failure; only the first is kept, the rest
/// are dropped. Workers check [`FirstError::is_set`] before taking new
/// work so a failure drains the group quickly.
pub(crate) struct FirstError {
    set: AtomicBool,
    slot: Mutex<Option<Error>>,
}

impl FirstError {
    pub(crate) fn new() -> Self {
        FirstError {
            set: AtomicBool::new(false),
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn offer(&self, err: Error) {
        let mut slot = lock(&self.slot);
        if slot.is_none() {
            self.set.store(true, Ordering::Release);
            *slot = Some(err);
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub(crate) fn take(self) -> Option<Error> {
        self.slot
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stream `reader` into the node's blob through the identifier
/// pipeline, deduplicating on close.
pub(crate) fn ingest_reader<R: Read>(
    db: &Arc<ReferenceDb>,
    node: &Arc<Node>,
    mut reader: R,
) -> Result<()> {
    let mut writer = BlobWriter::new(db.clone(), node.clone())?;
    io::copy(&mut reader, &mut writer)?;
    writer.finish()
}

/// Ingest every entry under `dir` into the directory node, one worker
/// per entry, workers recursing into subdirectories. The first failing
/// worker's error wins; the group is always drained before returning.
pub(crate) fn ingest_tree(db: &Arc<ReferenceDb>, root: &Arc<Node>, dir: &Path) -> Result<()> {
    log::debug!("ingesting directory tree {}", dir.display());
    let errors = FirstError::new();
    rayon::scope(|scope| {
        spawn_dir(scope, db, &errors, root.clone(), dir.to_path_buf());
    });
    match errors.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn spawn_dir<'s>(
    scope: &rayon::Scope<'s>,
    db: &'s Arc<ReferenceDb>,
    errors: &'s FirstError,
    node: Arc<Node>,
    dir: PathBuf,
) {
    scope.spawn(move |scope| {
        if errors.is_set() {
            return;
        }
        if let Err(err) = ingest_entries(scope, db, errors, &node, &dir) {
            errors.offer(err);
        }
    });
}

fn ingest_entries<'s>(
    scope: &rayon::Scope<'s>,
    db: &'s Arc<ReferenceDb>,
    errors: &'s FirstError,
    node: &Arc<Node>,
    dir: &Path,
) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let mod_time = DateTime::<Utc>::from(metadata.modified()?);
        let mode = host_mode(&metadata);

        if metadata.is_dir() {
            let child = node
                .reference()
                .insert_child(Arc::new(Node::new_dir(&name, mode, mod_time)))?;
            spawn_dir(scope, db, errors, child, path);
        } else if metadata.file_type().is_symlink() {
            let target = fs::read_link(&path)?;
            node.reference().insert_child(Arc::new(Node::new_symlink(
                &name,
                &target.to_string_lossy(),
                mode,
                mod_time,
            )))?;
        } else {
            let child = node
                .reference()
                .insert_child(Arc::new(Node::new(&name, mode, mod_time)))?;
            let db = db.clone();
            scope.spawn(move |_| {
                if errors.is_set() {
                    return;
                }
                if let Err(err) = ingest_file(&db, &child, &path) {
                    errors.offer(err);
                }
            });
        }
    }
    Ok(())
}

fn ingest_file(db: &Arc<ReferenceDb>, node: &Arc<Node>, path: &Path) -> Result<()> {
    log::trace!("ingesting file {}", path.display());
    let file = fs::File::open(path)?;
    ingest_reader(db, node, file)
}

/// Permission bits of a host directory entry.
#[cfg(unix)]
pub(crate) fn host_mode(metadata: &fs::Metadata) -> Mode {
    use std::os::unix::fs::PermissionsExt;
    Mode::new(metadata.permissions().mode() & 0o777)
}

/// Permission bits of a host directory entry (non-unix fallback).
#[cfg(not(unix))]
pub(crate) fn host_mode(metadata: &fs::Metadata) -> Mode {
    if metadata.is_dir() {
        Mode::new(0o755)
    } else {
        Mode::new(0o644)
    }
}
