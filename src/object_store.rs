use crate::config::{Access, EnvConfig, EnvName};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// One entry returned by a single-level bucket listing. An object carries
/// its full path; a prefix is a folder that must be listed again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEntry {
    Object(String),
    Prefix(String),
}

/// Bucket operations the sync loop and the download gate need. The real
/// implementation talks to S3-compatible storage; tests substitute an
/// in-memory bucket.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Check that the bucket is reachable.
    async fn bucket_exists(&self) -> Result<bool>;
    /// Create the bucket if it does not exist. "Already exists" is
    /// success, not an error.
    async fn ensure_bucket(&self) -> Result<()>;
    /// List one level under `prefix` (pass "" for the bucket root).
    async fn list(&self, prefix: &str) -> Result<Vec<ListEntry>>;
    /// Download a full object.
    async fn download(&self, path: &str) -> Result<Vec<u8>>;
    /// Upload an object, replacing any existing object at the same path.
    async fn upload(&self, path: &str, body: Vec<u8>) -> Result<()>;
}

/// S3-compatible object storage client bound to one bucket on one
/// environment.
pub struct ObjectStore {
    client: S3Client,
    bucket: String,
}

impl ObjectStore {
    /// Build a client for `bucket` on the given environment, using the
    /// privileged key. Fails fast on blank endpoint or key.
    pub async fn connect(env_name: EnvName, env: &EnvConfig, bucket: &str) -> Result<Self> {
        let service_key = env.credentials(env_name, Access::Privileged)?;
        let credentials = Credentials::new(service_key, service_key, None, None, "gallery-env");

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(env.region.clone()))
            .load()
            .await;

        let s3_config = S3ConfigBuilder::from(&aws_config)
            .credentials_provider(credentials)
            .endpoint_url(&env.endpoint_url)
            // Supabase/MinIO style endpoints need path-style access
            .force_path_style(true)
            .build();

        let client = S3Client::from_conf(s3_config);

        info!(
            environment = %env_name,
            endpoint = %env.endpoint_url,
            bucket = %bucket,
            "Object storage client initialized"
        );

        Ok(Self {
            client,
            bucket: bucket.to_string(),
        })
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Generate a short-lived signed retrieval URL for an object.
    #[instrument(skip(self), fields(path = %path))]
    pub async fn signed_url(&self, path: &str, expiry: Duration) -> Result<String> {
        let presigning_config =
            PresigningConfig::expires_in(expiry).context("Failed to create presigning config")?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .presigned(presigning_config)
            .await
            .context("Failed to generate signed URL")?;

        Ok(presigned.uri().to_string())
    }
}

#[async_trait]
impl BucketStore for ObjectStore {
    async fn bucket_exists(&self) -> Result<bool> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    Ok(false)
                } else {
                    Err(e).context("Failed to check bucket existence")
                }
            }
        }
    }

    async fn ensure_bucket(&self) -> Result<()> {
        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "Bucket created");
                Ok(())
            }
            Err(e) => {
                let already_exists = e
                    .as_service_error()
                    .map(|e| e.is_bucket_already_exists() || e.is_bucket_already_owned_by_you())
                    .unwrap_or(false);
                if already_exists {
                    debug!(bucket = %self.bucket, "Bucket already exists");
                    Ok(())
                } else {
                    Err(e).context("Failed to create bucket")
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ListEntry>> {
        // Folder-like prefixes always end in "/" at the S3 level
        let list_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix.trim_end_matches('/'))
        };

        let mut entries = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&list_prefix)
                .delimiter("/")
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .context("Failed to list bucket")?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    entries.push(ListEntry::Object(key.to_string()));
                }
            }

            for common in response.common_prefixes() {
                if let Some(p) = common.prefix() {
                    entries.push(ListEntry::Prefix(p.trim_end_matches('/').to_string()));
                }
            }

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(entries)
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .with_context(|| format!("Failed to download {path}"))?;

        let data = response
            .body
            .collect()
            .await
            .with_context(|| format!("Failed to read body of {path}"))?;

        Ok(data.into_bytes().to_vec())
    }

    async fn upload(&self, path: &str, body: Vec<u8>) -> Result<()> {
        let content_type = content_type_for(path);
        let size = body.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .with_context(|| format!("Failed to upload {path}"))?;

        debug!(path = %path, size_bytes = size, "Object uploaded");
        Ok(())
    }
}

/// Content type from the object path's extension
pub fn content_type_for(path: &str) -> &'static str {
    let extension = path.rsplit('.').next().unwrap_or("");
    match extension.to_ascii_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("albums/kasiki/001.jpg"), "image/jpeg");
        assert_eq!(content_type_for("a.JPEG"), "image/jpeg");
        assert_eq!(content_type_for("thumb.png"), "image/png");
        assert_eq!(content_type_for("cover.webp"), "image/webp");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn test_list_entry_equality() {
        assert_eq!(
            ListEntry::Object("a/1.jpg".to_string()),
            ListEntry::Object("a/1.jpg".to_string())
        );
        assert_ne!(
            ListEntry::Object("a".to_string()),
            ListEntry::Prefix("a".to_string())
        );
    }
}
