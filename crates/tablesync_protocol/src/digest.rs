//! Content hashing for attachment identity.

use crate::MD5_PREFIX;
use md5::{Digest, Md5};

/// Returns the manifest hash of `contents`: `md5:` followed by lowercase hex.
pub fn content_md5(contents: &[u8]) -> String {
    let mut stream = Md5Stream::new();
    stream.update(contents);
    stream.finish()
}

/// Incremental form of [`content_md5`] for files read in chunks.
#[derive(Clone, Default)]
pub struct Md5Stream(Md5);

impl std::fmt::Debug for Md5Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Md5Stream")
    }
}

impl Md5Stream {
    /// Creates an empty hasher.
    pub fn new() -> Self {
        Self(Md5::new())
    }

    /// Feeds more bytes.
    pub fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }

    /// Returns the `md5:<hex>` string.
    pub fn finish(self) -> String {
        format!("{MD5_PREFIX}{}", hex::encode(self.0.finalize()))
    }
}
