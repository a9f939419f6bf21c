//! Traversal-safe path handling.

use crate::error::{Error, Result};

/// Split a `/`-delimited path into its segments.
///
/// Empty and `.` segments are dropped; `..` pops the previous segment
/// and fails with `OutsideFilesystem` when there is nothing left to
/// pop. A generic path cleaner is deliberately not used here: cleaning
/// `..` against `/` would silently swallow escape attempts.
pub(crate) fn split(path: &str) -> Result<Vec<&str>> {
    let mut segments = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::OutsideFilesystem);
                }
            }
            _ => segments.push(part),
        }
    }
    Ok(segments)
}

/// The normalised absolute form of split segments.
pub(crate) fn join_root(segments: &[&str]) -> String {
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Append a child name to a walk path.
pub(crate) fn join_path(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}
