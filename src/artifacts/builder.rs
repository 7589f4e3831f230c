use super::{entry_digest, ArtifactError, Manifest, ManifestEntry};
use crate::record::ArtifactRecord;
use crate::shared::ids::validate_identifier_value;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempPath;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub name: String,
    pub artifact_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub digest: String,
    pub manifest: Manifest,
}

/// Draft artifact whose entries are staged as local files.
///
/// Staged files live as long as the builder. Owned by a single worker.
pub struct ArtifactBuilder {
    staging_dir: PathBuf,
    artifact: Artifact,
    staged: Vec<TempPath>,
    dirty: bool,
}

impl ArtifactBuilder {
    pub fn new(
        staging_dir: impl Into<PathBuf>,
        name: impl Into<String>,
        artifact_type: impl Into<String>,
    ) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            artifact: Artifact {
                name: name.into(),
                artifact_type: artifact_type.into(),
                description: None,
                digest: String::new(),
                manifest: Manifest::default(),
            },
            staged: Vec::new(),
            dirty: true,
        }
    }

    /// Builder populated with every data entry of `record`.
    pub fn from_record(staging_dir: &Path, record: &ArtifactRecord) -> Result<Self, ArtifactError> {
        let mut builder = Self::new(staging_dir, &record.name, &record.artifact_type);
        builder.artifact.description = record.description.clone();
        for data in &record.data {
            builder.add_data(&data.name, &data.payload)?;
        }
        Ok(builder)
    }

    /// Stages `payload` as compact JSON and records it under `name`. A
    /// later add under the same name replaces the earlier entry.
    pub fn add_data<T: Serialize + ?Sized>(
        &mut self,
        name: &str,
        payload: &T,
    ) -> Result<&ManifestEntry, ArtifactError> {
        validate_entry_name(name)?;
        let bytes = serde_json::to_vec(payload).map_err(|source| ArtifactError::Encode {
            name: name.to_string(),
            source,
        })?;
        let local_path = self.stage(&bytes)?;

        let entry = ManifestEntry {
            path: name.to_string(),
            digest: entry_digest(&bytes),
            local_path: Some(local_path.to_path_buf()),
            size: bytes.len() as u64,
        };
        if let Some(previous) = self.artifact.manifest.insert(entry) {
            tracing::warn!(
                artifact = %self.artifact.name,
                entry = name,
                previous_digest = %previous.digest,
                "artifact: entry replaced by a later add"
            );
        }
        self.staged.push(local_path);
        self.dirty = true;
        tracing::debug!(artifact = %self.artifact.name, entry = name, "artifact: staged entry");

        self.artifact
            .manifest
            .get(name)
            .ok_or_else(|| ArtifactError::InvalidName {
                name: name.to_string(),
                reason: "entry missing after insert".to_string(),
            })
    }

    /// The artifact with a digest matching its current manifest.
    pub fn get_artifact(&mut self) -> &Artifact {
        if self.dirty {
            self.artifact.digest = self.artifact.manifest.digest();
            self.dirty = false;
        }
        &self.artifact
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn manifest(&self) -> &Manifest {
        &self.artifact.manifest
    }

    fn stage(&self, bytes: &[u8]) -> Result<TempPath, ArtifactError> {
        let staging_error = |source| ArtifactError::Staging {
            path: self.staging_dir.display().to_string(),
            source,
        };
        std::fs::create_dir_all(&self.staging_dir).map_err(staging_error)?;
        let mut file = tempfile::Builder::new()
            .prefix("artifact-")
            .suffix(".json")
            .tempfile_in(&self.staging_dir)
            .map_err(staging_error)?;
        file.write_all(bytes).map_err(staging_error)?;
        file.flush().map_err(staging_error)?;
        Ok(file.into_temp_path())
    }
}

fn validate_entry_name(name: &str) -> Result<(), ArtifactError> {
    let invalid = |reason: String| ArtifactError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.starts_with('/') || name.split('/').any(|part| part == "..") {
        return Err(invalid("must be a relative path inside the artifact".to_string()));
    }
    for part in name.split('/') {
        validate_identifier_value("entry path segment", part).map_err(invalid)?;
    }
    Ok(())
}
