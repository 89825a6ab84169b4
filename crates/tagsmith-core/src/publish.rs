//! Artifact publishing to object storage.
//!
//! [`Publisher`] uploads compact images under `static/{identifier}.{ext}` and
//! returns the public URL, which is derived from the storage root, bucket and
//! key without another round trip:
//!
//! ```text
//! {root}/storage/v1/object/public/{bucket}/static/{identifier}.jpg
//! ```
//!
//! The storage service itself sits behind [`ObjectStorage`];
//! [`SupabaseStorage`] speaks the Supabase Storage REST API over `reqwest`.

use crate::{
    error::PublishError,
    types::{CompactImage, Identifier, storage_key},
};
use async_trait::async_trait;
use reqwest::{Client, header};
use std::sync::Arc;

/// Minimal object-storage capability used by the pipeline.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `bytes` at `key` inside `bucket`.
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PublishError>;

    /// Deletes the object at `key`. Missing objects are not an error.
    async fn remove(&self, bucket: &str, key: &str) -> Result<(), PublishError>;
}

/// Public URL of an object, per the storage naming convention.
pub fn public_url(root: &str, bucket: &str, key: &str) -> String {
    format!(
        "{}/storage/v1/object/public/{bucket}/{key}",
        root.trim_end_matches('/')
    )
}

/// Uploads compact images and computes their public URLs.
#[derive(Clone)]
pub struct Publisher {
    storage: Arc<dyn ObjectStorage>,
    root: String,
}

impl Publisher {
    pub fn new(storage: Arc<dyn ObjectStorage>, root: impl Into<String>) -> Self {
        Self {
            storage,
            root: root.into(),
        }
    }

    /// Public URL the artifact for `identifier` would have in `bucket`.
    pub fn url_for(&self, image: &CompactImage, identifier: &Identifier, bucket: &str) -> String {
        public_url(&self.root, bucket, &storage_key(identifier, image.format))
    }

    /// Uploads `image` for `identifier` into `bucket`.
    ///
    /// The local artifact must still exist right before upload; this catches
    /// stage-ordering bugs that hand over a path that was never flushed or was
    /// already cleaned up.
    ///
    /// # Errors
    ///
    /// - [`PublishError::MissingArtifact`] if the local file is gone.
    /// - Any error from the underlying [`ObjectStorage`].
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self, image, identifier), fields(identifier = %identifier)))]
    pub async fn publish(
        &self,
        image: &CompactImage,
        identifier: &Identifier,
        bucket: &str,
    ) -> Result<String, PublishError> {
        if !tokio::fs::try_exists(&image.path).await.unwrap_or(false) {
            return Err(PublishError::MissingArtifact {
                path: image.path.display().to_string(),
            });
        }

        let bytes = tokio::fs::read(&image.path).await?;
        let key = storage_key(identifier, image.format);

        #[cfg(feature = "tracing")]
        tracing::debug!(bucket, key = %key, size = bytes.len(), "uploading artifact");

        self.storage
            .upload(bucket, &key, bytes, image.format.content_type())
            .await?;

        Ok(public_url(&self.root, bucket, &key))
    }

    /// Removes a previously published artifact.
    pub async fn unpublish(
        &self,
        image: &CompactImage,
        identifier: &Identifier,
        bucket: &str,
    ) -> Result<(), PublishError> {
        self.storage
            .remove(bucket, &storage_key(identifier, image.format))
            .await
    }
}

/// Supabase Storage client.
#[derive(Clone)]
pub struct SupabaseStorage {
    client: Client,
    root: String,
    api_key: String,
}

impl SupabaseStorage {
    pub fn new(client: Client, root: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            root: root.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/storage/v1/object/{bucket}/{key}", self.root)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header("apikey", &self.api_key)
    }
}

async fn reject(response: reqwest::Response) -> PublishError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    PublishError::Rejected { status, body }
}

fn transport(err: reqwest::Error) -> PublishError {
    PublishError::Transport(err.to_string())
}

#[async_trait]
impl ObjectStorage for SupabaseStorage {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PublishError> {
        let response = self
            .authorize(self.client.post(self.object_url(bucket, key)))
            .header(header::CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .map_err(transport)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(reject(response).await)
        }
    }

    async fn remove(&self, bucket: &str, key: &str) -> Result<(), PublishError> {
        let response = self
            .authorize(
                self.client
                    .delete(format!("{}/storage/v1/object/{bucket}", self.root)),
            )
            .json(&serde_json::json!({ "prefixes": [key] }))
            .send()
            .await
            .map_err(transport)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(reject(response).await)
        }
    }
}
