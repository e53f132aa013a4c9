use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{DatasetRecord, DatasetRef, VolumeDescriptor, VolumeRef};
use futures::StreamExt;
use tokio::sync::Mutex;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};
use tracing::{debug, info};

use super::proto::{
    DataItem, GET_VOLUME_PATH, GetVolumeReq, LIST_DATA_ITEMS_PATH, ListDataItemsReq, Volume,
};
use super::{Catalog, CatalogProvider, RecordStream};
use crate::error::CatalogError;

pub const EMAIL_KEY: &str = "x-user-email";
pub const USERNAME_KEY: &str = "x-user-name";

/// Attaches the acting user to every outgoing call.
#[derive(Clone)]
pub struct UserInterceptor {
    email: MetadataValue<Ascii>,
    name: MetadataValue<Ascii>,
}

impl UserInterceptor {
    pub fn new(user: &str) -> Result<Self, CatalogError> {
        // `alice@example.com` acts as `alice`
        let name = user.split_once('@').map_or(user, |(name, _)| name);
        let parse = |v: &str| -> Result<MetadataValue<Ascii>, CatalogError> {
            v.parse()
                .map_err(|_| CatalogError::InvalidUser(user.to_string()))
        };
        Ok(UserInterceptor {
            email: parse(user)?,
            name: parse(name)?,
        })
    }
}

impl Interceptor for UserInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let md = request.metadata_mut();
        md.insert(EMAIL_KEY, self.email.clone());
        md.insert(USERNAME_KEY, self.name.clone());
        Ok(request)
    }
}

type AuthChannel = InterceptedService<Channel, UserInterceptor>;

/// Catalog backed by the dataset and volume gRPC services of one endpoint.
#[derive(Clone)]
pub struct GrpcCatalog {
    inner: Grpc<AuthChannel>,
}

impl GrpcCatalog {
    pub fn new(channel: Channel, interceptor: UserInterceptor) -> Self {
        GrpcCatalog {
            inner: Grpc::new(InterceptedService::new(channel, interceptor)),
        }
    }

    async fn ready(&self) -> Result<Grpc<AuthChannel>, CatalogError> {
        let mut grpc = self.inner.clone();
        grpc.ready()
            .await
            .map_err(|e| Status::unknown(format!("service was not ready: {e}")))?;
        Ok(grpc)
    }
}

#[async_trait]
impl Catalog for GrpcCatalog {
    async fn list_records(&self, dataset: &DatasetRef) -> Result<RecordStream, CatalogError> {
        let mut grpc = self.ready().await?;
        let codec: ProstCodec<ListDataItemsReq, DataItem> = ProstCodec::default();
        let response = grpc
            .server_streaming(
                Request::new(ListDataItemsReq::from(dataset)),
                PathAndQuery::from_static(LIST_DATA_ITEMS_PATH),
                codec,
            )
            .await?;
        debug!("opened record stream for dataset {dataset}");

        let stream = response
            .into_inner()
            .map(|item| item.map(DatasetRecord::from).map_err(CatalogError::from));
        Ok(stream.boxed())
    }

    async fn resolve_volume(&self, volume: &VolumeRef) -> Result<VolumeDescriptor, CatalogError> {
        let mut grpc = self.ready().await?;
        let codec: ProstCodec<GetVolumeReq, Volume> = ProstCodec::default();
        let response = grpc
            .unary(
                Request::new(GetVolumeReq::from(volume)),
                PathAndQuery::from_static(GET_VOLUME_PATH),
                codec,
            )
            .await?;
        response
            .into_inner()
            .descriptor()
            .ok_or_else(|| CatalogError::MissingVolumeSpec(volume.key().to_string()))
    }
}

/// Connection pool keyed by `<user>@<endpoint>`.
///
/// Channels are created lazily and shared by every request of the same user on
/// the same endpoint until [`GrpcCatalogPool::close`] drops them.
pub struct GrpcCatalogPool {
    dial_timeout: Duration,
    channels: Mutex<HashMap<String, Channel>>,
}

impl GrpcCatalogPool {
    pub fn new(dial_timeout: Duration) -> Self {
        GrpcCatalogPool {
            dial_timeout,
            channels: Mutex::new(HashMap::new()),
        }
    }

    async fn channel(&self, endpoint: &str, user: &str) -> Result<Channel, CatalogError> {
        let key = format!("{user}@{endpoint}");
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(&key) {
            return Ok(channel.clone());
        }

        let uri = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{endpoint}")
        };
        let mut ep =
            Endpoint::from_shared(uri).map_err(|e| CatalogError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        if !self.dial_timeout.is_zero() {
            ep = ep.connect_timeout(self.dial_timeout);
        }
        let channel = ep.connect_lazy();
        info!("new catalog connection for {key}");
        channels.insert(key, channel.clone());
        Ok(channel)
    }

    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CatalogProvider for GrpcCatalogPool {
    async fn catalog(&self, endpoint: &str, user: &str) -> Result<Arc<dyn Catalog>, CatalogError> {
        let interceptor = UserInterceptor::new(user)?;
        let channel = self.channel(endpoint, user).await?;
        Ok(Arc::new(GrpcCatalog::new(channel, interceptor)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_interceptor_metadata() {
        let mut interceptor = UserInterceptor::new("ava@example.com").unwrap();
        let request = interceptor.call(Request::new(())).unwrap();
        let md = request.metadata();
        assert_eq!(md.get(EMAIL_KEY).unwrap(), "ava@example.com");
        assert_eq!(md.get(USERNAME_KEY).unwrap(), "ava");

        let mut interceptor = UserInterceptor::new("admin").unwrap();
        let request = interceptor.call(Request::new(())).unwrap();
        assert_eq!(request.metadata().get(USERNAME_KEY).unwrap(), "admin");

        assert!(matches!(
            UserInterceptor::new("bad\nuser"),
            Err(CatalogError::InvalidUser(_))
        ));
    }

    #[tokio::test]
    async fn test_pool_reuses_connection_per_user_and_endpoint() {
        let pool = GrpcCatalogPool::new(Duration::from_secs(1));
        assert!(pool.is_empty().await);
        pool.catalog("127.0.0.1:9000", "ava").await.unwrap();
        pool.catalog("127.0.0.1:9000", "ava").await.unwrap();
        assert_eq!(pool.len().await, 1);
        pool.catalog("127.0.0.1:9000", "bob").await.unwrap();
        pool.catalog("http://127.0.0.1:9001", "ava").await.unwrap();
        assert_eq!(pool.len().await, 3);

        assert!(matches!(
            pool.catalog("bad endpoint", "ava").await,
            Err(CatalogError::InvalidEndpoint { .. })
        ));

        assert_eq!(pool.len().await, 3);
    }
}
