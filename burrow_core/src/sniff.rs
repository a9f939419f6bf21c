//! File type detection from a buffered leading prefix.

use serde::{Deserialize, Serialize};

/// Number of leading bytes captured for type detection.
pub const MAX_DETECT_BYTES: usize = 65536;

/// A detected file type: extension plus MIME label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filetype {
    pub extension: String,
    pub mimetype: String,
}

impl Filetype {
    /// Synthetic type for directories.
    pub fn dir() -> Self {
        Filetype {
            extension: "dir".to_string(),
            mimetype: "directory/directory".to_string(),
        }
    }

    /// Synthetic type for symlinks.
    pub fn symlink() -> Self {
        Filetype {
            extension: "symlink".to_string(),
            mimetype: "symlink/symlink".to_string(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mimetype == "directory/directory"
    }

    pub fn is_symlink(&self) -> bool {
        self.mimetype == "symlink/symlink"
    }
}

impl Default for Filetype {
    fn default() -> Self {
        Filetype {
            extension: String::new(),
            mimetype: "application/octet-stream".to_string(),
        }
    }
}

/// Buffers up to [`MAX_DETECT_BYTES`] leading bytes of a stream; bytes
/// past the prefix are dropped but still counted as written.
pub struct TypeSniffer {
    data: Vec<u8>,
}

impl TypeSniffer {
    pub fn new() -> Self {
        TypeSniffer { data: Vec::new() }
    }

    /// Capture bytes into the prefix buffer.
    pub fn update(&mut self, data: &[u8]) {
        let remaining = MAX_DETECT_BYTES - self.data.len();
        let take = remaining.min(data.len());
        self.data.extend_from_slice(&data[..take]);
    }

    /// Run detection over the captured prefix.
    ///
    /// Magic-number detection first; printable data falls back to
    /// `text/plain`, everything else to the octet-stream default.
    pub fn finalise(&self) -> Filetype {
        if self.data.is_empty() {
            return Filetype::default();
        }
        if let Some(kind) = infer::get(&self.data) {
            return Filetype {
                extension: kind.extension().to_string(),
                mimetype: kind.mime_type().to_string(),
            };
        }
        if looks_textual(&self.data) {
            return Filetype {
                extension: "txt".to_string(),
                mimetype: "text/plain; charset=utf-8".to_string(),
            };
        }
        Filetype::default()
    }
}

impl Default for TypeSniffer {
    fn default() -> Self {
        Self::new()
    }
}

/// NUL-free UTF-8 counts as text. The captured prefix may end in the
/// middle of a code point, so a truncated trailing sequence is allowed.
fn looks_textual(data: &[u8]) -> bool {
    let valid = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(err) if err.error_len().is_none() => {
            let prefix = &data[..err.valid_up_to()];
            std::str::from_utf8(prefix).unwrap_or("")
        }
        Err(_) => return false,
    };
    !valid.bytes().any(|byte| byte == 0)
}
