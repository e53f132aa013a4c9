use std::collections::HashMap;
use std::sync::Arc;

use common::{VolumeDescriptor, VolumeKey, VolumeRef};
use tokio::sync::RwLock;
use tracing::debug;

use crate::catalog::Catalog;
use crate::error::CatalogError;

/// Volume descriptors resolved during one staging call.
///
/// The producer fills it while reading records; the index builder only reads.
/// It lives as long as the call and is never shared between calls.
#[derive(Clone, Default)]
pub struct VolumeCache {
    volumes: Arc<RwLock<HashMap<VolumeKey, VolumeDescriptor>>>,
}

impl VolumeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, volume: &VolumeRef) -> Option<VolumeDescriptor> {
        self.volumes.read().await.get(&volume.key()).cloned()
    }

    pub async fn insert(&self, volume: &VolumeRef, descriptor: VolumeDescriptor) {
        self.volumes.write().await.insert(volume.key(), descriptor);
    }

    /// Cached descriptor, or one catalog lookup stored for the next reference.
    pub async fn resolve(
        &self,
        volume: &VolumeRef,
        catalog: &dyn Catalog,
    ) -> Result<VolumeDescriptor, CatalogError> {
        if let Some(descriptor) = self.get(volume).await {
            return Ok(descriptor);
        }
        let descriptor = catalog.resolve_volume(volume).await?;
        debug!(
            "resolved volume {} to {}/{}",
            volume.key(),
            descriptor.bucket,
            descriptor.path
        );
        self.insert(volume, descriptor.clone()).await;
        Ok(descriptor)
    }

    pub async fn len(&self) -> usize {
        self.volumes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
