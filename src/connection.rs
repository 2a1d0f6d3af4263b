use crate::proto::google::spanner::v1 as proto;
use crate::Error;
use async_trait::async_trait;
use dyn_clone::DynClone;
use futures::stream::BoxStream;

/// A server-streaming response.
pub type ResponseStream<T> = BoxStream<'static, Result<T, Error>>;

/// The RPCs of the Cloud Spanner data API used by sessions and transactions.
///
/// Implementations return transport failures as [`Error::Status`], untouched.
#[async_trait]
pub trait Connection
where
    Self: DynClone + Send + Sync,
{
    async fn create_session(&self, multiplexed: bool) -> Result<proto::Session, Error>;
    async fn begin_transaction(
        &self,
        request: proto::BeginTransactionRequest,
    ) -> Result<proto::Transaction, Error>;
    async fn commit(&self, request: proto::CommitRequest) -> Result<proto::CommitResponse, Error>;
    async fn rollback(&self, request: proto::RollbackRequest) -> Result<(), Error>;
    async fn execute_streaming_sql(
        &self,
        request: proto::ExecuteSqlRequest,
    ) -> Result<ResponseStream<proto::PartialResultSet>, Error>;
    async fn streaming_read(
        &self,
        request: proto::ReadRequest,
    ) -> Result<ResponseStream<proto::PartialResultSet>, Error>;
    async fn execute_batch_dml(
        &self,
        request: proto::ExecuteBatchDmlRequest,
    ) -> Result<proto::ExecuteBatchDmlResponse, Error>;
    async fn batch_write(
        &self,
        request: proto::BatchWriteRequest,
    ) -> Result<ResponseStream<proto::BatchWriteResponse>, Error>;
}

dyn_clone::clone_trait_object!(Connection);

pub(crate) mod grpc;
#[cfg(test)]
pub(crate) mod mock;
