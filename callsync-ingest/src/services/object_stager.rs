//! Durable staging of recordings and their metadata
//!
//! Objects live under `recordings/<h[0..2]>/<h>/` where `h` is the SHA-256
//! of the external call ID, so the same call always maps to the same key
//! and re-staging overwrites in place. Each object directory holds the
//! audio file and an `object.json` manifest carrying the expiry time used
//! by [`ObjectStager::cleanup_expired`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use super::biztel_client::Recording;
use super::retry_policy::{RetryPolicy, Retryable};
use crate::models::{CallMetadata, StorageRef};

const RECORDINGS_PREFIX: &str = "recordings";
const MANIFEST_FILE: &str = "object.json";

/// Object storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode object manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Invalid storage reference: {0}")]
    InvalidRef(String),
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }
}

/// Durable store for staged recordings
#[async_trait]
pub trait ObjectStager: Send + Sync {
    /// Persist audio and metadata; idempotent per call ID
    async fn stage(
        &self,
        external_call_id: &str,
        recording: &Recording,
        metadata: &CallMetadata,
    ) -> Result<StorageRef, StorageError>;

    async fn exists(&self, storage_ref: &StorageRef) -> Result<bool, StorageError>;

    /// Delete objects whose expiry is before `now`; returns how many were removed
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;
}

/// Manifest written next to each staged recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectManifest {
    pub external_call_id: String,
    pub audio_file: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// SHA-256 of the audio bytes
    pub sha256: String,
    pub staged_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: CallMetadata,
}

/// Filesystem-backed [`ObjectStager`]
pub struct LocalObjectStager {
    root: PathBuf,
    ttl: chrono::Duration,
    retry: RetryPolicy,
}

impl LocalObjectStager {
    pub fn new(root: impl Into<PathBuf>, ttl: chrono::Duration, retry: RetryPolicy) -> Self {
        Self {
            root: root.into(),
            ttl,
            retry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Storage key for a call ID
    pub fn key_for(external_call_id: &str) -> String {
        let digest = format!("{:x}", Sha256::digest(external_call_id.as_bytes()));
        format!("{}/{}/{}", RECORDINGS_PREFIX, &digest[..2], digest)
    }

    fn object_dir(&self, storage_ref: &StorageRef) -> Result<PathBuf, StorageError> {
        let key = storage_ref.as_str();
        let valid = key.starts_with(RECORDINGS_PREFIX)
            && key
                .split('/')
                .all(|part| !part.is_empty() && part != "." && part != "..");
        if !valid {
            return Err(StorageError::InvalidRef(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    async fn write_object(
        &self,
        dir: &Path,
        external_call_id: &str,
        recording: &Recording,
        metadata: &CallMetadata,
    ) -> Result<(), StorageError> {
        fs::create_dir_all(dir).await?;

        let audio_file = format!("audio.{}", extension_for(&recording.content_type));
        write_atomic(&dir.join(&audio_file), &recording.audio).await?;

        let staged_at = Utc::now();
        let manifest = ObjectManifest {
            external_call_id: external_call_id.to_string(),
            audio_file,
            content_type: recording.content_type.clone(),
            size_bytes: recording.audio.len() as u64,
            sha256: format!("{:x}", Sha256::digest(&recording.audio)),
            staged_at,
            expires_at: staged_at + self.ttl,
            metadata: metadata.clone(),
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        write_atomic(&dir.join(MANIFEST_FILE), &manifest_json).await?;

        remove_other_audio(dir, &manifest.audio_file).await?;
        Ok(())
    }

    /// Read the manifest of a staged object
    pub async fn read_manifest(&self, storage_ref: &StorageRef) -> Result<ObjectManifest, StorageError> {
        let path = self.object_dir(storage_ref)?.join(MANIFEST_FILE);
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl ObjectStager for LocalObjectStager {
    async fn stage(
        &self,
        external_call_id: &str,
        recording: &Recording,
        metadata: &CallMetadata,
    ) -> Result<StorageRef, StorageError> {
        let storage_ref = StorageRef::new(Self::key_for(external_call_id));
        let dir = self.object_dir(&storage_ref)?;

        self.retry
            .run("stage_object", || {
                self.write_object(&dir, external_call_id, recording, metadata)
            })
            .await?;

        tracing::debug!(
            external_call_id,
            storage_ref = %storage_ref,
            size_bytes = recording.audio.len(),
            "Recording staged"
        );

        Ok(storage_ref)
    }

    async fn exists(&self, storage_ref: &StorageRef) -> Result<bool, StorageError> {
        let path = self.object_dir(storage_ref)?.join(MANIFEST_FILE);
        Ok(fs::try_exists(path).await?)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let recordings = self.root.join(RECORDINGS_PREFIX);
        if !fs::try_exists(&recordings).await? {
            return Ok(0);
        }

        let mut deleted = 0usize;
        let mut shards = fs::read_dir(&recordings).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut objects = fs::read_dir(shard.path()).await?;
            while let Some(object) = objects.next_entry().await? {
                let dir = object.path();
                let manifest = match fs::read(dir.join(MANIFEST_FILE)).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                let manifest: ObjectManifest = match serde_json::from_slice(&manifest) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(path = %dir.display(), error = %e, "Unreadable object manifest, leaving object in place");
                        continue;
                    }
                };
                if manifest.expires_at < now {
                    fs::remove_dir_all(&dir).await?;
                    deleted += 1;
                    tracing::debug!(
                        external_call_id = %manifest.external_call_id,
                        expires_at = %manifest.expires_at,
                        "Deleted expired object"
                    );
                }
            }
        }

        tracing::info!(deleted, "Expired object cleanup finished");
        Ok(deleted)
    }
}

/// Write to a sibling temp file, then rename over the target
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Delete `audio.*` files left by an earlier staging with another content type
async fn remove_other_audio(dir: &Path, keep: &str) -> std::io::Result<()> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("audio.") && name != keep {
            match fs::remove_file(entry.path()).await {
                Ok(()) => tracing::debug!(file = %name, "Removed superseded audio file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

fn extension_for(content_type: &str) -> &'static str {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/ogg" => "ogg",
        "audio/mp4" | "audio/aac" => "m4a",
        _ => "bin",
    }
}
