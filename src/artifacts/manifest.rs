use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Versioned prefix hashed ahead of the entries.
pub const MANIFEST_DIGEST_PREFIX: &str = "runhub-artifact-manifest-v1\n";
pub const MANIFEST_VERSION: u32 = 1;

/// Base64 MD5 of `bytes`, the digest recorded for every manifest entry.
pub fn entry_digest(bytes: &[u8]) -> String {
    STANDARD.encode(md5::compute(bytes).0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    /// Keyed by entry path; iteration order is the digest order.
    pub contents: BTreeMap<String, ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            contents: BTreeMap::new(),
        }
    }
}

impl Manifest {
    /// Replaces any entry with the same path.
    pub fn insert(&mut self, entry: ManifestEntry) -> Option<ManifestEntry> {
        self.contents.insert(entry.path.clone(), entry)
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.contents.get(path)
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Hex MD5 over the prefix and every `path:digest` line in path order.
    ///
    /// Depends only on the set of (path, digest) pairs, never on how the
    /// manifest was assembled.
    pub fn digest(&self) -> String {
        let mut context = md5::Context::new();
        context.consume(MANIFEST_DIGEST_PREFIX.as_bytes());
        for (path, entry) in &self.contents {
            context.consume(format!("{path}:{}\n", entry.digest).as_bytes());
        }
        format!("{:x}", context.compute())
    }
}
