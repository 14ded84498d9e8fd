use crate::config::DatabaseConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use tracing::{debug, info, instrument};

/// Typed repository failures. "Not found" is never an error here, it is
/// an absent result; errors mean the operation itself failed. Callers
/// that only care about presence can treat both the same, the download
/// gate needs to tell them apart.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database operation failed")]
    Database(#[from] sqlx::Error),
    #[error("database migration failed")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Image category tags, mirrored by the Postgres `tag_enum` type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tag_enum")]
pub enum Tag {
    Kasiki,
    Reception,
    Nikah,
    Studio,
    Magazine,
}

// The Type derive does not cover arrays of a named enum; images carry
// their tags as a tag_enum[] column.
impl sqlx::postgres::PgHasArrayType for Tag {
    fn array_type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("_tag_enum")
    }
}

impl FromStr for Tag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Kasiki" => Ok(Tag::Kasiki),
            "Reception" => Ok(Tag::Reception),
            "Nikah" => Ok(Tag::Nikah),
            "Studio" => Ok(Tag::Studio),
            "Magazine" => Ok(Tag::Magazine),
            other => Err(format!("unknown tag: {other}")),
        }
    }
}

/// A gallery image row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: i32,
    pub title: String,
    pub description: Option<String>,
    pub image_path: String,
    pub thumbnail_path: String,
    pub tags: Vec<Tag>,
    pub is_premium: bool,
    pub download_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Fields for creating an image (admin/import path)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewImage {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub image_path: String,
    pub thumbnail_path: String,
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub is_premium: bool,
}

/// Partial image update; absent fields are left unchanged
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub tags: Option<Vec<Tag>>,
    pub is_premium: Option<bool>,
}

/// Image list filter. Absent fields mean "no constraint".
#[derive(Debug, Clone)]
pub struct ImageFilter {
    /// Match images whose tag set intersects this set
    pub tags: Option<Vec<Tag>>,
    /// Exact premium flag match
    pub is_premium: Option<bool>,
    /// 1-based page number
    pub page: i64,
    /// Page size
    pub limit: i64,
}

impl Default for ImageFilter {
    fn default() -> Self {
        Self {
            tags: None,
            is_premium: None,
            page: 1,
            limit: 20,
        }
    }
}

impl ImageFilter {
    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.limit
    }
}

/// One recorded download. Append-only audit log, one row per successful
/// gated download.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DownloadEvent {
    pub id: i32,
    pub image_id: i32,
    pub user_id: String,
    pub downloaded_at: DateTime<Utc>,
}

/// A premium entitlement row; its presence is the sole source of truth
/// for "this user may download premium images".
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PremiumAccess {
    pub id: i32,
    pub user_id: String,
    pub purchased_at: DateTime<Utc>,
}

const IMAGE_COLUMNS: &str = "id, title, description, image_path, thumbnail_path, \
                             tags, is_premium, download_count, created_at";

/// PostgreSQL-backed store for image metadata, favorites, premium
/// entitlement and download accounting.
pub struct ImageStore {
    pool: PgPool,
}

impl ImageStore {
    /// Create a new store with a connection pool
    pub async fn connect(db_url: &str, config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .connect(db_url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// List images matching the filter, newest first.
    #[instrument(skip(self))]
    pub async fn list_images(&self, filter: &ImageFilter) -> Result<Vec<ImageRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {IMAGE_COLUMNS}
            FROM images
            WHERE ($1::tag_enum[] IS NULL OR tags && $1)
              AND ($2::boolean IS NULL OR is_premium = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        );

        let images = sqlx::query_as::<_, ImageRecord>(&sql)
            .bind(&filter.tags)
            .bind(filter.is_premium)
            .bind(filter.limit)
            .bind(filter.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok(images)
    }

    /// Get a single image by id
    pub async fn get_image(&self, id: i32) -> Result<Option<ImageRecord>, StoreError> {
        let sql = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = $1");
        let image = sqlx::query_as::<_, ImageRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(image)
    }

    /// Create an image
    #[instrument(skip(self, image), fields(title = %image.title))]
    pub async fn create_image(&self, image: &NewImage) -> Result<ImageRecord, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO images (title, description, image_path, thumbnail_path, tags, is_premium)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {IMAGE_COLUMNS}
            "#
        );

        let created = sqlx::query_as::<_, ImageRecord>(&sql)
            .bind(&image.title)
            .bind(&image.description)
            .bind(&image.image_path)
            .bind(&image.thumbnail_path)
            .bind(&image.tags)
            .bind(image.is_premium)
            .fetch_one(&self.pool)
            .await?;

        debug!(image_id = created.id, "Image created");
        Ok(created)
    }

    /// Update an image; absent fields keep their current value.
    #[instrument(skip(self, update))]
    pub async fn update_image(
        &self,
        id: i32,
        update: &ImageUpdate,
    ) -> Result<Option<ImageRecord>, StoreError> {
        let sql = format!(
            r#"
            UPDATE images SET
                title = COALESCE($2, title),
                description = COALESCE($3, description),
                image_path = COALESCE($4, image_path),
                thumbnail_path = COALESCE($5, thumbnail_path),
                tags = COALESCE($6, tags),
                is_premium = COALESCE($7, is_premium)
            WHERE id = $1
            RETURNING {IMAGE_COLUMNS}
            "#
        );

        let updated = sqlx::query_as::<_, ImageRecord>(&sql)
            .bind(id)
            .bind(&update.title)
            .bind(&update.description)
            .bind(&update.image_path)
            .bind(&update.thumbnail_path)
            .bind(&update.tags)
            .bind(update.is_premium)
            .fetch_optional(&self.pool)
            .await?;

        Ok(updated)
    }

    /// Delete an image. Dependent download events and favorites cascade.
    #[instrument(skip(self))]
    pub async fn delete_image(&self, id: i32) -> Result<Option<ImageRecord>, StoreError> {
        let sql = format!("DELETE FROM images WHERE id = $1 RETURNING {IMAGE_COLUMNS}");
        let deleted = sqlx::query_as::<_, ImageRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(deleted)
    }

    /// Record one download: append a download event and increment the
    /// image's counter, atomically. Either both happen or neither does.
    #[instrument(skip(self))]
    pub async fn track_download(&self, image_id: i32, user_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO image_downloads (image_id, user_id) VALUES ($1, $2)")
            .bind(image_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE images SET download_count = download_count + 1 WHERE id = $1")
            .bind(image_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        metrics::counter!("store.downloads.tracked").increment(1);
        debug!(image_id, user_id = %user_id, "Download tracked");
        Ok(())
    }

    /// List a user's favorite images, newest first.
    #[instrument(skip(self))]
    pub async fn list_favorites(
        &self,
        user_id: &str,
        page: i64,
        limit: i64,
    ) -> Result<Vec<ImageRecord>, StoreError> {
        let sql = r#"
            SELECT i.id, i.title, i.description, i.image_path, i.thumbnail_path,
                   i.tags, i.is_premium, i.download_count, i.created_at
            FROM user_favorites f
            INNER JOIN images i ON i.id = f.image_id
            WHERE f.user_id = $1
            ORDER BY i.created_at DESC
            LIMIT $2 OFFSET $3
            "#;

        let images = sqlx::query_as::<_, ImageRecord>(sql)
            .bind(user_id)
            .bind(limit)
            .bind((page.max(1) - 1) * limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(images)
    }

    /// Add an image to a user's favorites. Idempotent: a duplicate pair
    /// is absorbed. Returns whether a new row was inserted.
    pub async fn add_favorite(&self, image_id: i32, user_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_favorites (user_id, image_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id, image_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(image_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove exactly one favorite pair. Returns whether a row existed.
    pub async fn remove_favorite(&self, image_id: i32, user_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM user_favorites WHERE user_id = $1 AND image_id = $2",
        )
        .bind(user_id)
        .bind(image_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Check whether a user holds a premium entitlement
    pub async fn has_premium_access(&self, user_id: &str) -> Result<bool, StoreError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM user_premium_access WHERE user_id = $1)",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// Grant a premium entitlement. Idempotent: granting twice returns
    /// the existing row with its original purchase timestamp.
    #[instrument(skip(self))]
    pub async fn grant_premium_access(&self, user_id: &str) -> Result<PremiumAccess, StoreError> {
        let access = sqlx::query_as::<_, PremiumAccess>(
            r#"
            INSERT INTO user_premium_access (user_id)
            VALUES ($1)
            ON CONFLICT (user_id) DO UPDATE SET user_id = EXCLUDED.user_id
            RETURNING id, user_id, purchased_at
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        info!(user_id = %user_id, "Premium access granted");
        Ok(access)
    }

    /// Revoke a premium entitlement. Returns whether one existed.
    #[instrument(skip(self))]
    pub async fn revoke_premium_access(&self, user_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM user_premium_access WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get the entitlement record for a user
    pub async fn premium_access_details(
        &self,
        user_id: &str,
    ) -> Result<Option<PremiumAccess>, StoreError> {
        let access = sqlx::query_as::<_, PremiumAccess>(
            "SELECT id, user_id, purchased_at FROM user_premium_access WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(access)
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_defaults_and_offset() {
        let filter = ImageFilter::default();
        assert_eq!(filter.page, 1);
        assert_eq!(filter.limit, 20);
        assert_eq!(filter.offset(), 0);

        let filter = ImageFilter {
            page: 3,
            limit: 20,
            ..Default::default()
        };
        assert_eq!(filter.offset(), 40);

        // Page 0 is treated as page 1
        let filter = ImageFilter {
            page: 0,
            ..Default::default()
        };
        assert_eq!(filter.offset(), 0);
    }

    #[test]
    fn test_tag_parsing() {
        assert_eq!("Kasiki".parse::<Tag>().unwrap(), Tag::Kasiki);
        assert_eq!("Magazine".parse::<Tag>().unwrap(), Tag::Magazine);
        assert!("kasiki".parse::<Tag>().is_err());
        assert!("Wedding".parse::<Tag>().is_err());
    }

    #[test]
    fn test_tag_maps_to_postgres_enum_and_array_types() {
        use sqlx::postgres::PgHasArrayType;
        use sqlx::{Type, TypeInfo};

        // tag_enum[] columns decode through the array type; Postgres
        // names array types with a leading underscore.
        assert_eq!(<Tag as Type<sqlx::Postgres>>::type_info().name(), "tag_enum");
        assert_eq!(Tag::array_type_info().name(), "_tag_enum");
    }

    #[test]
    fn test_tag_serde_round_trip() {
        let json = serde_json::to_string(&Tag::Reception).unwrap();
        assert_eq!(json, "\"Reception\"");
        let tag: Tag = serde_json::from_str("\"Nikah\"").unwrap();
        assert_eq!(tag, Tag::Nikah);
    }

    #[test]
    fn test_new_image_deserializes_camel_case() {
        let image: NewImage = serde_json::from_str(
            r#"{
                "title": "First dance",
                "imagePath": "reception/001.jpg",
                "thumbnailPath": "thumbs/reception/001.jpg",
                "tags": ["Reception"],
                "isPremium": true
            }"#,
        )
        .unwrap();

        assert_eq!(image.title, "First dance");
        assert_eq!(image.tags, vec![Tag::Reception]);
        assert!(image.is_premium);
        assert!(image.description.is_none());
    }
}
