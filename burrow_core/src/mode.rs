//! File modes: permission bits combined with kind flags.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Directory flag bit.
pub const MODE_DIR: u32 = 1 << 31;

/// Symlink flag bit.
pub const MODE_SYMLINK: u32 = 1 << 27;

/// A file mode: POSIX permission bits in the low nine bits, kind flags
/// above them. The integer layout matches the manifest encoding.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mode(u32);

impl Mode {
    /// Create a mode from raw bits.
    pub fn new(bits: u32) -> Self {
        Mode(bits)
    }

    /// The raw bits, flags included.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// The permission bits only.
    pub fn perm(self) -> u32 {
        self.0 & 0o777
    }

    /// True when the directory flag is set.
    pub fn is_dir(self) -> bool {
        self.0 & MODE_DIR != 0
    }

    /// True when the symlink flag is set.
    pub fn is_symlink(self) -> bool {
        self.0 & MODE_SYMLINK != 0
    }

    /// True when no kind flag is set.
    pub fn is_regular(self) -> bool {
        !self.is_dir() && !self.is_symlink()
    }

    /// The same permissions with the directory flag set.
    pub(crate) fn into_dir(self) -> Self {
        Mode(self.0 | MODE_DIR)
    }

    /// The same permissions with the symlink flag set.
    pub(crate) fn into_symlink(self) -> Self {
        Mode(self.0 | MODE_SYMLINK)
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mode({:#o})", self.0)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_dir() {
            "d"
        } else if self.is_symlink() {
            "l"
        } else {
            "-"
        };
        write!(f, "{}{:03o}", kind, self.perm())
    }
}
