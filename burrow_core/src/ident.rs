//! One-pass blob identification: digests, entropy, size, and file type.

use crate::dest::Destination;
use crate::entropy::Entropy;
use crate::sniff::{Filetype, TypeSniffer};
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use std::io::{self, Write};

/// The finalised descriptors of a byte stream. Hashes are lowercase
/// hexadecimal; entropy is in bits per byte.
#[derive(Debug, Clone, PartialEq)]
pub struct Identifiers {
    pub size: u64,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub sha512: String,
    pub entropy: f64,
    pub filetype: Filetype,
}

impl Default for Identifiers {
    fn default() -> Self {
        Identifiers {
            size: 0,
            md5: String::new(),
            sha1: String::new(),
            sha256: String::new(),
            sha512: String::new(),
            entropy: 0.0,
            filetype: Filetype::default(),
        }
    }
}

/// A write sink that fans every slice to MD5, SHA-1, SHA-256, SHA-512,
/// the entropy accumulator, the type sniffer, a byte counter, and an
/// underlying destination. The digest sinks never fail; only the
/// destination can surface an error.
pub struct IdentWriter<D: Destination> {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    sha512: Sha512,
    entropy: Entropy,
    sniffer: TypeSniffer,
    size: u64,
    dest: D,
}

impl<D: Destination> IdentWriter<D> {
    pub fn new(dest: D) -> Self {
        IdentWriter {
            md5: Md5::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            sha512: Sha512::new(),
            entropy: Entropy::new(),
            sniffer: TypeSniffer::new(),
            size: 0,
            dest,
        }
    }

    /// Finalise every sink, handing back the identifiers and the
    /// destination for the keep-or-discard decision.
    pub fn finish(self) -> (Identifiers, D) {
        let identifiers = Identifiers {
            size: self.size,
            md5: hex::encode(self.md5.finalize()),
            sha1: hex::encode(self.sha1.finalize()),
            sha256: hex::encode(self.sha256.finalize()),
            sha512: hex::encode(self.sha512.finalize()),
            entropy: self.entropy.bits_per_byte(),
            filetype: self.sniffer.finalise(),
        };
        (identifiers, self.dest)
    }
}

impl<D: Destination> Write for IdentWriter<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.dest.write_all(buf)?;
        self.md5.update(buf);
        self.sha1.update(buf);
        self.sha256.update(buf);
        self.sha512.update(buf);
        self.entropy.update(buf);
        self.sniffer.update(buf);
        self.size += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
