use std::sync::Arc;

use super::{Connection, ResponseStream};
use crate::auth::AuthFilter;
use crate::proto::google::spanner::v1::{self as proto, spanner_client::SpannerClient};
use crate::{DatabaseId, Error, SpannerResource};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use gcp_auth::AuthenticationManager;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, ClientTlsConfig};
use tonic::Request;
use tower::filter::{AsyncFilter, AsyncFilterLayer};
use tower::util::Either;
use tower::ServiceBuilder;

const RESOURCE_PREFIX_HEADER: &str = "google-cloud-resource-prefix";

#[derive(Clone)]
struct GrpcConnection {
    database: DatabaseId,
    spanner: SpannerClient<Either<AsyncFilter<Channel, AuthFilter>, Channel>>,
}

pub(crate) async fn connect(
    endpoint: Option<String>,
    tls_config: Option<ClientTlsConfig>,
    auth: Option<Arc<AuthenticationManager>>,
    database: DatabaseId,
) -> Result<Box<dyn Connection>, Error> {
    let channel = match endpoint {
        None => Channel::from_static("https://spanner.googleapis.com")
            .tls_config(tls_config.ok_or_else(|| Error::Config("TLS is required".into()))?)?,
        Some(hostname) => {
            let channel = Channel::from_shared(hostname).map_err(|invalid_uri| {
                Error::Config(format!("invalid endpoint: {}", invalid_uri))
            })?;
            if let Some(tls_config) = tls_config {
                channel.tls_config(tls_config)?
            } else {
                channel
            }
        }
    };

    let channel = channel.connect().await?;

    let auth_layer = auth.map(|auth| AsyncFilterLayer::new(AuthFilter::new(auth)));

    let channel = ServiceBuilder::new()
        .option_layer(auth_layer)
        .service(channel);

    tracing::debug!(database = %database, "connected to Cloud Spanner");

    let spanner = SpannerClient::new(channel);

    Ok(Box::new(GrpcConnection { database, spanner }))
}

impl GrpcConnection {
    /// Wraps `message` in a request routed to this connection's database.
    fn request<T>(&self, message: T) -> Result<Request<T>, Error> {
        let prefix = MetadataValue::from_str(&self.database.id())
            .map_err(|err| Error::Config(format!("invalid database name: {}", err)))?;
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert(RESOURCE_PREFIX_HEADER, prefix);
        Ok(request)
    }

    // the generated client needs `&mut self`, clones share the underlying channel
    fn client(&self) -> SpannerClient<Either<AsyncFilter<Channel, AuthFilter>, Channel>> {
        self.spanner.clone()
    }
}

#[async_trait]
impl Connection for GrpcConnection {
    async fn create_session(&self, multiplexed: bool) -> Result<proto::Session, Error> {
        let request = self.request(proto::CreateSessionRequest {
            database: self.database.id(),
            session: Some(proto::Session {
                multiplexed,
                ..Default::default()
            }),
        })?;
        Ok(self.client().create_session(request).await?.into_inner())
    }

    async fn begin_transaction(
        &self,
        request: proto::BeginTransactionRequest,
    ) -> Result<proto::Transaction, Error> {
        let request = self.request(request)?;
        Ok(self.client().begin_transaction(request).await?.into_inner())
    }

    async fn commit(&self, request: proto::CommitRequest) -> Result<proto::CommitResponse, Error> {
        let request = self.request(request)?;
        Ok(self.client().commit(request).await?.into_inner())
    }

    async fn rollback(&self, request: proto::RollbackRequest) -> Result<(), Error> {
        let request = self.request(request)?;
        self.client().rollback(request).await?;
        Ok(())
    }

    async fn execute_streaming_sql(
        &self,
        request: proto::ExecuteSqlRequest,
    ) -> Result<ResponseStream<proto::PartialResultSet>, Error> {
        let request = self.request(request)?;
        let response = self.client().execute_streaming_sql(request).await?;
        Ok(response.into_inner().map_err(Error::from).boxed())
    }

    async fn streaming_read(
        &self,
        request: proto::ReadRequest,
    ) -> Result<ResponseStream<proto::PartialResultSet>, Error> {
        let request = self.request(request)?;
        let response = self.client().streaming_read(request).await?;
        Ok(response.into_inner().map_err(Error::from).boxed())
    }

    async fn execute_batch_dml(
        &self,
        request: proto::ExecuteBatchDmlRequest,
    ) -> Result<proto::ExecuteBatchDmlResponse, Error> {
        let request = self.request(request)?;
        Ok(self.client().execute_batch_dml(request).await?.into_inner())
    }

    async fn batch_write(
        &self,
        request: proto::BatchWriteRequest,
    ) -> Result<ResponseStream<proto::BatchWriteResponse>, Error> {
        let request = self.request(request)?;
        let response = self.client().batch_write(request).await?;
        Ok(response.into_inner().map_err(Error::from).boxed())
    }
}
