//! Write targets with keep-or-discard semantics.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

/// Default in-memory threshold before a destination spills to disk.
pub const DEFAULT_CACHE_LIMIT: usize = 1024 * 1024;

/// A write target whose bytes are only persisted once the caller knows
/// the blob is worth keeping.
pub trait Destination {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Persist the written bytes and close the target.
    fn keep(&mut self) -> io::Result<()>;

    /// Drop the written bytes, removing any backing file.
    fn discard(&mut self) -> io::Result<()>;
}

enum State {
    Buffered(Vec<u8>),
    Spilled(File),
    Closed,
}

/// Buffers writes in memory up to a threshold, then promotes to a
/// backing file. Small blobs that turn out to be duplicates never
/// touch the disk.
pub struct CachedDest {
    path: PathBuf,
    limit: usize,
    state: State,
}

impl CachedDest {
    /// A destination backed by `path`, with the default threshold.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_limit(path, DEFAULT_CACHE_LIMIT)
    }

    /// A destination backed by `path` with a custom threshold. A limit
    /// of zero writes through to disk immediately.
    pub fn with_limit(path: impl Into<PathBuf>, limit: usize) -> Self {
        CachedDest {
            path: path.into(),
            limit,
            state: State::Buffered(Vec::new()),
        }
    }

    fn spill(&mut self) -> io::Result<()> {
        let buffered = match std::mem::replace(&mut self.state, State::Closed) {
            State::Buffered(buffered) => buffered,
            other => {
                self.state = other;
                return Ok(());
            }
        };
        let mut file = File::create(&self.path)?;
        file.write_all(&buffered)?;
        self.state = State::Spilled(file);
        Ok(())
    }
}

impl Destination for CachedDest {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match &mut self.state {
            State::Spilled(file) => return file.write_all(buf),
            State::Closed => return Err(io::Error::other("destination is closed")),
            State::Buffered(buffered) => buffered.extend_from_slice(buf),
        }
        let over_limit = matches!(&self.state, State::Buffered(buffered) if buffered.len() >= self.limit);
        if over_limit {
            self.spill()?;
        }
        Ok(())
    }

    fn keep(&mut self) -> io::Result<()> {
        self.spill()?;
        if let State::Spilled(file) = &mut self.state {
            file.flush()?;
        }
        self.state = State::Closed;
        Ok(())
    }

    fn discard(&mut self) -> io::Result<()> {
        let spilled = matches!(self.state, State::Spilled(_));
        self.state = State::Closed;
        if spilled {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
