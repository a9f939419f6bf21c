//! Error types for burrow_core.

use thiserror::Error;

/// Result type alias using burrow_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during virtual filesystem operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Sentinel returned from a walk callback to skip a node's
    /// children. Never surfaces from `walk` itself.
    #[error("dont walk entry's children")]
    DontWalk,

    /// The path does not resolve to a node.
    #[error("file not found")]
    NotFound,

    /// The path climbs above the filesystem root.
    #[error("path is outside of filesystem")]
    OutsideFilesystem,

    /// The filesystem has been closed.
    #[error("virtual filesystem is closed")]
    Closed,

    /// The filesystem was opened read-only.
    #[error("virtual filesystem is read-only")]
    ReadOnly,

    /// Close was attempted on a view that is not the root filesystem.
    #[error("virtual filesystem is a child of another filesystem")]
    Child,

    /// At least one node carries an error or warning.
    #[error("filesystem errors")]
    InFilesystem,

    /// The node holds an extraction child, so named children are
    /// unavailable.
    #[error("has child")]
    HasChild,

    /// The node holds named children, so an extraction child cannot be
    /// attached.
    #[error("has children")]
    HasChildren,

    /// The tag key is already present.
    #[error("tag already exists")]
    AlreadyExists,

    /// Linking the blob would make a reference reachable from itself.
    #[error("circular reference")]
    CircularReference,

    /// Blob content cannot be written to this node.
    #[error("cant write new file")]
    CantWriteNewFile,

    /// The node is not a regular file and cannot be opened for reading.
    #[error("not a regular file: {name}")]
    NotRegular { name: String },

    /// Underlying I/O failure.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Manifest encoding or decoding failure.
    #[error("manifest error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create a NotRegular error.
    pub fn not_regular(name: impl Into<String>) -> Self {
        Error::NotRegular { name: name.into() }
    }
}
