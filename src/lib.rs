//! Gallery Service
//!
//! Storage sync and premium-gated download service for the wedding
//! gallery storefront. The service keeps image files in S3-compatible
//! object storage across three deployment targets (local, staging,
//! production), indexes their metadata in PostgreSQL, and issues
//! short-lived signed download URLs gated on premium entitlement.
//!
//! ## Components
//!
//! - **Environment registry** ([`config`]): a keyed table resolving an
//!   environment name to a storage endpoint, keys and database URL, with
//!   one fallible lookup instead of branching at every call site.
//! - **Storage mirror** ([`storage_sync`]): bulk object copy from one
//!   environment's bucket to another through a local staging directory,
//!   additive and idempotent, with per-object failure isolation.
//! - **Access repository** ([`image_store`]): filtered image listing,
//!   favorites, premium entitlement, and atomic download accounting.
//! - **Download gate** ([`download_gate`]): the policy deciding whether
//!   a requesting user gets a 60-second signed retrieval link, recording
//!   the download before the link is handed back.
//! - **HTTP surface** ([`api`]): thin pass-through route handlers with a
//!   uniform `{success, data | error}` envelope.
//! - **Data sync** ([`data_sync`]): table-level row copy between
//!   environment databases for the `gallery-env` CLI.

pub mod api;
pub mod config;
pub mod data_sync;
pub mod download_gate;
pub mod image_store;
pub mod object_store;
pub mod storage_sync;

pub use config::{Access, Config, EnvConfig, EnvName};
pub use download_gate::{request_download, DownloadGrant, GateError, SIGNED_URL_TTL};
pub use image_store::{ImageFilter, ImageRecord, ImageStore, StoreError, Tag};
pub use object_store::{BucketStore, ObjectStore};
pub use storage_sync::{download_bucket, sync_bucket, upload_dir, SyncError, SyncReport};
