use crate::image_store::{ImageRecord, ImageStore, StoreError};
use crate::object_store::ObjectStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, instrument};

/// Validity window for issued retrieval links
pub const SIGNED_URL_TTL: Duration = Duration::from_secs(60);

/// Repository operations the gate needs
#[async_trait]
pub trait GateStore: Send + Sync {
    async fn image(&self, id: i32) -> Result<Option<ImageRecord>, StoreError>;
    async fn has_premium(&self, user_id: &str) -> Result<bool, StoreError>;
    async fn record_download(&self, image_id: i32, user_id: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl GateStore for ImageStore {
    async fn image(&self, id: i32) -> Result<Option<ImageRecord>, StoreError> {
        self.get_image(id).await
    }

    async fn has_premium(&self, user_id: &str) -> Result<bool, StoreError> {
        self.has_premium_access(user_id).await
    }

    async fn record_download(&self, image_id: i32, user_id: &str) -> Result<(), StoreError> {
        self.track_download(image_id, user_id).await
    }
}

/// Signed-URL issuance, implemented by the object storage client
#[async_trait]
pub trait UrlSigner: Send + Sync {
    async fn signed_url(&self, path: &str, expiry: Duration) -> Result<String>;
}

#[async_trait]
impl UrlSigner for ObjectStore {
    async fn signed_url(&self, path: &str, expiry: Duration) -> Result<String> {
        ObjectStore::signed_url(self, path, expiry).await
    }
}

/// Why a download request was refused
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("image not found")]
    NotFound,
    #[error("premium access required to download this image")]
    Forbidden,
    #[error("failed to produce a download link")]
    Storage(#[source] anyhow::Error),
}

impl From<StoreError> for GateError {
    fn from(e: StoreError) -> Self {
        GateError::Storage(e.into())
    }
}

/// An issued retrieval link
#[derive(Debug, Clone)]
pub struct DownloadGrant {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Decide whether `user_id` may download `image_id` and, if so, issue a
/// time-limited retrieval link.
///
/// Premium images require an entitlement; the download event is recorded
/// before the link is signed, so an issued link always corresponds to a
/// recorded event even if the caller never uses it. Terminal in one
/// step, there is no retry loop here.
#[instrument(skip(store, signer))]
pub async fn request_download(
    store: &dyn GateStore,
    signer: &dyn UrlSigner,
    image_id: i32,
    user_id: &str,
) -> Result<DownloadGrant, GateError> {
    let image = store.image(image_id).await?.ok_or(GateError::NotFound)?;

    if image.is_premium && !store.has_premium(user_id).await? {
        info!(image_id, user_id = %user_id, "Premium download refused");
        return Err(GateError::Forbidden);
    }

    store.record_download(image_id, user_id).await?;

    let url = signer
        .signed_url(&image.image_path, SIGNED_URL_TTL)
        .await
        .map_err(GateError::Storage)?;
    let expires_at = Utc::now() + chrono::Duration::from_std(SIGNED_URL_TTL).unwrap_or_default();

    info!(image_id, user_id = %user_id, "Download granted");
    Ok(DownloadGrant { url, expires_at })
}
