//! Remote dataset catalog.
//!
//! The catalog lists the records of a dataset version as a stream and resolves
//! volume references to their physical location. [`CatalogProvider`] hands out
//! catalogs bound to an (endpoint, user) pair; the gRPC implementation keeps one
//! connection per pair for the lifetime of the driver.

pub mod grpc;
pub mod proto;

use std::sync::Arc;

use async_trait::async_trait;
use common::{DatasetRecord, DatasetRef, VolumeDescriptor, VolumeRef};
use futures::stream::BoxStream;

use crate::error::CatalogError;

/// Lazy sequence of records. Dropping it aborts the underlying call.
pub type RecordStream = BoxStream<'static, Result<DatasetRecord, CatalogError>>;

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Opens a streaming read of every record of `dataset`.
    async fn list_records(&self, dataset: &DatasetRef) -> Result<RecordStream, CatalogError>;

    /// Single lookup, never cached here.
    async fn resolve_volume(&self, volume: &VolumeRef) -> Result<VolumeDescriptor, CatalogError>;
}

#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn catalog(&self, endpoint: &str, user: &str) -> Result<Arc<dyn Catalog>, CatalogError>;
}
