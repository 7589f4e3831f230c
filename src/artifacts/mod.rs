//! Content-addressed artifact manifests.

pub mod builder;
pub mod manifest;

pub use builder::{Artifact, ArtifactBuilder};
pub use manifest::{entry_digest, Manifest, ManifestEntry, MANIFEST_DIGEST_PREFIX, MANIFEST_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("failed to stage artifact data in {path}: {source}")]
    Staging {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode artifact entry {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid artifact entry name `{name}`: {reason}")]
    InvalidName { name: String, reason: String },
}
