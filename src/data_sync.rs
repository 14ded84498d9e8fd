use crate::image_store::{DownloadEvent, ImageRecord, PremiumAccess};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::{info, instrument, warn};

/// Per-table sync failures
#[derive(Debug, thiserror::Error)]
pub enum DataSyncError {
    #[error("unknown table \"{0}\"")]
    UnknownTable(String),
    #[error("database operation failed")]
    Database(#[from] sqlx::Error),
}

/// Outcome of one data sync run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataSyncReport {
    pub tables_synced: usize,
    pub tables_failed: usize,
    pub rows_copied: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
struct FavoriteRow {
    user_id: String,
    image_id: i32,
}

/// Copy rows for each named table from the source database to the
/// target database, replacing the target's contents wholesale. A table
/// that fails to copy is logged and skipped; the run continues with the
/// next table.
///
/// Tables are copied in dependency order regardless of the order given
/// on the command line: replacing `images` cascade-deletes the target's
/// `image_downloads` and `user_favorites` rows, so it has to go before
/// them or it would wipe rows the run just wrote.
#[instrument(skip(source, target))]
pub async fn copy_tables(source: &PgPool, target: &PgPool, tables: &[String]) -> DataSyncReport {
    let mut report = DataSyncReport::default();

    for table in order_for_copy(tables) {
        match copy_table(source, target, table).await {
            Ok(rows) => {
                info!(table = %table, rows, "Table synced");
                report.tables_synced += 1;
                report.rows_copied += rows;
            }
            Err(e) => {
                warn!(table = %table, error = %e, "Skipping table after sync failure");
                report.tables_failed += 1;
            }
        }
    }

    report
}

/// Referenced tables before referencing ones; unknown names last so
/// their errors don't interleave with real copies. The sort is stable,
/// ties keep the caller's order.
fn order_for_copy(tables: &[String]) -> Vec<&String> {
    fn precedence(table: &str) -> u8 {
        match table {
            "images" => 0,
            "user_premium_access" => 1,
            "image_downloads" => 2,
            "user_favorites" => 3,
            _ => u8::MAX,
        }
    }

    let mut ordered: Vec<&String> = tables.iter().collect();
    ordered.sort_by_key(|table| precedence(table));
    ordered
}

/// Copy one known table. The column sets are fixed, so each table gets a
/// typed copy rather than a generic row shuffle.
async fn copy_table(source: &PgPool, target: &PgPool, table: &str) -> Result<u64, DataSyncError> {
    match table {
        "images" => copy_images(source, target).await,
        "image_downloads" => copy_downloads(source, target).await,
        "user_favorites" => copy_favorites(source, target).await,
        "user_premium_access" => copy_premium_access(source, target).await,
        other => Err(DataSyncError::UnknownTable(other.to_string())),
    }
}

async fn copy_images(source: &PgPool, target: &PgPool) -> Result<u64, DataSyncError> {
    let rows = sqlx::query_as::<_, ImageRecord>(
        "SELECT id, title, description, image_path, thumbnail_path, \
         tags, is_premium, download_count, created_at FROM images",
    )
    .fetch_all(source)
    .await?;

    let mut tx = target.begin().await?;
    sqlx::query("DELETE FROM images").execute(&mut *tx).await?;

    for row in &rows {
        sqlx::query(
            r#"
            INSERT INTO images (id, title, description, image_path, thumbnail_path,
                                tags, is_premium, download_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(row.id)
        .bind(&row.title)
        .bind(&row.description)
        .bind(&row.image_path)
        .bind(&row.thumbnail_path)
        .bind(&row.tags)
        .bind(row.is_premium)
        .bind(row.download_count)
        .bind(row.created_at)
        .execute(&mut *tx)
        .await?;
    }

    // Ids were copied verbatim, bump the sequence past them
    sqlx::query(
        "SELECT setval(pg_get_serial_sequence('images', 'id'), \
         COALESCE((SELECT MAX(id) FROM images), 0) + 1, false)",
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(rows.len() as u64)
}

async fn copy_downloads(source: &PgPool, target: &PgPool) -> Result<u64, DataSyncError> {
    let rows = sqlx::query_as::<_, DownloadEvent>(
        "SELECT id, image_id, user_id, downloaded_at FROM image_downloads",
    )
    .fetch_all(source)
    .await?;

    let mut tx = target.begin().await?;
    sqlx::query("DELETE FROM image_downloads")
        .execute(&mut *tx)
        .await?;

    for row in &rows {
        sqlx::query(
            "INSERT INTO image_downloads (id, image_id, user_id, downloaded_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(row.id)
        .bind(row.image_id)
        .bind(&row.user_id)
        .bind(row.downloaded_at)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "SELECT setval(pg_get_serial_sequence('image_downloads', 'id'), \
         COALESCE((SELECT MAX(id) FROM image_downloads), 0) + 1, false)",
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(rows.len() as u64)
}

async fn copy_favorites(source: &PgPool, target: &PgPool) -> Result<u64, DataSyncError> {
    let rows = sqlx::query_as::<_, FavoriteRow>("SELECT user_id, image_id FROM user_favorites")
        .fetch_all(source)
        .await?;

    let mut tx = target.begin().await?;
    sqlx::query("DELETE FROM user_favorites")
        .execute(&mut *tx)
        .await?;

    for row in &rows {
        sqlx::query("INSERT INTO user_favorites (user_id, image_id) VALUES ($1, $2)")
            .bind(&row.user_id)
            .bind(row.image_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(rows.len() as u64)
}

async fn copy_premium_access(source: &PgPool, target: &PgPool) -> Result<u64, DataSyncError> {
    let rows = sqlx::query_as::<_, PremiumAccess>(
        "SELECT id, user_id, purchased_at FROM user_premium_access",
    )
    .fetch_all(source)
    .await?;

    let mut tx = target.begin().await?;
    sqlx::query("DELETE FROM user_premium_access")
        .execute(&mut *tx)
        .await?;

    for row in &rows {
        sqlx::query(
            "INSERT INTO user_premium_access (id, user_id, purchased_at) VALUES ($1, $2, $3)",
        )
        .bind(row.id)
        .bind(&row.user_id)
        .bind(row.purchased_at)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "SELECT setval(pg_get_serial_sequence('user_premium_access', 'id'), \
         COALESCE((SELECT MAX(id) FROM user_premium_access), 0) + 1, false)",
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(rows.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_table_is_an_error() {
        let err = DataSyncError::UnknownTable("nope".to_string());
        assert_eq!(err.to_string(), "unknown table \"nope\"");
    }

    #[test]
    fn test_dependents_copy_after_images() {
        let tables: Vec<String> = ["user_favorites", "image_downloads", "images"]
            .iter()
            .map(|t| t.to_string())
            .collect();

        let ordered = order_for_copy(&tables);

        assert_eq!(ordered, ["images", "image_downloads", "user_favorites"]);
    }

    #[test]
    fn test_unknown_tables_sort_last() {
        let tables: Vec<String> = ["bogus", "images", "user_premium_access"]
            .iter()
            .map(|t| t.to_string())
            .collect();

        let ordered = order_for_copy(&tables);

        assert_eq!(ordered, ["images", "user_premium_access", "bogus"]);
    }

    #[test]
    fn test_report_default_is_empty() {
        let report = DataSyncReport::default();
        assert_eq!(report.tables_synced, 0);
        assert_eq!(report.tables_failed, 0);
        assert_eq!(report.rows_copied, 0);
    }
}
