use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use gcp_auth::AuthenticationManager;
use tonic::{Code, Status};

use crate::connection::{grpc, Connection};
use crate::error::{retry_decision, RetryDecision, RetrySite};
use crate::proto::google::spanner::v1 as proto;
use crate::session::{SessionFactory, SessionLease, SessionSource};
use crate::transaction::base::to_system_time;
use crate::transaction::{TransactionCore, TransactionSettings};
use crate::{
    AsyncTransactionRunner, Config, ConfigBuilder, Dml, Error, MutationGroup, PartitionedDml,
    PartitionedDmlOptions, ReadContext, ReadWriteOptions, RequestOptions, Snapshot,
    SpannerResource, Statement, TimestampBound, Transaction, TransactionOptions,
    TransactionRunner,
};

/// Options of [`Client::batch_write`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchWriteOptions {
    pub request_options: Option<RequestOptions>,
    pub exclude_txn_from_change_streams: bool,
}

/// The outcome of some of the groups of a [`Client::batch_write`].
#[derive(Debug)]
pub struct BatchWriteResponse {
    /// Positions of the groups this response covers, in the request.
    pub indexes: Vec<usize>,
    /// The commit timestamp of the groups, or why they were not applied.
    pub result: Result<Option<SystemTime>, Status>,
}

impl From<proto::BatchWriteResponse> for BatchWriteResponse {
    fn from(value: proto::BatchWriteResponse) -> Self {
        let result = match value.status {
            Some(status) if status.code != Code::Ok as i32 => {
                Err(Status::new(Code::from(status.code), status.message))
            }
            _ => Ok(value.commit_timestamp.as_ref().and_then(to_system_time)),
        };
        Self {
            indexes: value
                .indexes
                .into_iter()
                .filter_map(|idx| usize::try_from(idx).ok())
                .collect(),
            result,
        }
    }
}

/// An asynchronous Cloud Spanner client bound to one database.
///
/// Transactions obtain their session from the client's [`SessionSource`] and give it back
/// when they end.
#[derive(Clone)]
pub struct Client {
    sessions: Arc<dyn SessionSource>,
    settings: Arc<TransactionSettings>,
    deadline: Duration,
}

impl Client {
    pub fn configure() -> ConfigBuilder {
        Config::builder()
    }

    pub async fn connect(config: Config) -> Result<Self, Error> {
        let config = config.resolve_emulator();
        let auth = match &config.auth {
            None if !config.emulator => Some(Arc::new(AuthenticationManager::new().await?)),
            auth => auth.clone(),
        };
        let connection = grpc::connect(
            config.endpoint.clone(),
            config.tls_config.clone(),
            auth,
            config.database.clone(),
        )
        .await?;
        Self::with_connection(connection, config).await
    }

    /// A client whose sessions use `connection`.
    pub async fn with_connection(
        connection: Box<dyn Connection>,
        config: Config,
    ) -> Result<Self, Error> {
        let sessions = SessionFactory::new(connection, config.session.clone()).await?;
        Ok(Self::with_session_source(Arc::new(sessions), &config))
    }

    pub fn with_session_source(sessions: Arc<dyn SessionSource>, config: &Config) -> Self {
        Self {
            sessions,
            settings: Arc::new(TransactionSettings {
                tracer: config.tracer.clone(),
                database: config.database.id(),
                default_isolation_level: config.default_isolation_level,
                directed_read_options: config.directed_read_options.clone(),
                query_options: config.query_options.clone(),
            }),
            deadline: config.transaction_deadline,
        }
    }

    /// Binds a transaction to the leased session, which goes back to its source once the
    /// transaction ends.
    fn start(&self, lease: SessionLease, options: TransactionOptions) -> Arc<TransactionCore> {
        let core = TransactionCore::new(lease.session().clone(), self.settings.clone(), options);
        let sessions = self.sessions.clone();
        core.on_end(move || sessions.release(lease));
        core
    }

    /// A read-only transaction whose reads each run as a single-use transaction.
    pub async fn single_use(&self, bound: TimestampBound) -> Result<Snapshot, Error> {
        let lease = self.sessions.get_session().await?;
        Ok(Snapshot::new(
            self.start(lease, TransactionOptions::ReadOnly(bound.into())),
        ))
    }

    /// A read-only transaction that has begun: all its reads see the same data.
    pub async fn snapshot(&self, bound: TimestampBound) -> Result<Snapshot, Error> {
        loop {
            let lease = self.sessions.get_session().await?;
            let multiplexed = lease.session().is_multiplexed();
            let snapshot = Snapshot::new(
                self.start(lease, TransactionOptions::ReadOnly(bound.clone().into())),
            );
            match snapshot.begin().await {
                Ok(_) => return Ok(snapshot),
                Err(error) => {
                    snapshot.end();
                    match retry_decision(RetrySite::Acquire { multiplexed }, &error) {
                        RetryDecision::RetryWithNewSession => {
                            tracing::debug!(error = %error, "retrying snapshot on a new session");
                        }
                        _ => return Err(error),
                    }
                }
            }
        }
    }

    /// A read-write transaction, begun inline by its first request.
    ///
    /// Aborted transactions are not retried; see [`Client::read_write`] for that.
    pub async fn transaction(&self, options: ReadWriteOptions) -> Result<Transaction, Error> {
        let lease = self.sessions.get_session_for_read_write().await?;
        Ok(Transaction::new(
            self.start(lease, TransactionOptions::ReadWrite(options)),
        ))
    }

    pub fn read_write(&self) -> TransactionRunner {
        TransactionRunner::new(self.sessions.clone(), self.settings.clone(), self.deadline)
    }

    pub fn read_write_async(&self) -> AsyncTransactionRunner {
        AsyncTransactionRunner::new(self.sessions.clone(), self.settings.clone(), self.deadline)
    }

    /// A partitioned DML transaction on a session for partitioned operations.
    pub async fn partitioned_dml(
        &self,
        options: &PartitionedDmlOptions,
    ) -> Result<PartitionedDml, Error> {
        let lease = self.sessions.get_session_for_partitioned_ops().await?;
        Ok(PartitionedDml::new(self.start(
            lease,
            TransactionOptions::partitioned_dml(options),
        )))
    }

    /// Runs `statement` as partitioned DML, starting over in a new transaction whenever it
    /// aborts. Returns a lower bound of the number of modified rows.
    pub async fn run_partitioned_update(
        &self,
        statement: Statement,
        options: PartitionedDmlOptions,
    ) -> Result<i64, Error> {
        loop {
            let dml = self.partitioned_dml(&options).await?;
            match dml.run_update(statement.clone()).await {
                Err(error) if error.is_aborted() => {
                    tracing::debug!(error = %error, "partitioned update aborted, retrying");
                }
                result => return result,
            }
        }
    }

    /// Applies groups of mutations outside of any transaction.
    ///
    /// Each group is applied atomically, at least once; groups are independent of each
    /// other. The request is sent again on a new session while no response was received and
    /// the session was not found.
    pub async fn batch_write(
        &self,
        groups: &[MutationGroup],
        options: BatchWriteOptions,
    ) -> Result<Vec<BatchWriteResponse>, Error> {
        let mut span = crate::trace::Span::start(
            self.settings.tracer.as_ref(),
            "CloudSpanner.Database.batchWriteAtLeastOnce",
            &[("db.name", self.settings.database.clone())],
        );
        let result = self.batch_write_inner(groups, &options).await;
        if let Err(error) = &result {
            span.set_error(error);
        }
        result
    }

    async fn batch_write_inner(
        &self,
        groups: &[MutationGroup],
        options: &BatchWriteOptions,
    ) -> Result<Vec<BatchWriteResponse>, Error> {
        loop {
            let lease = self.sessions.get_session().await?;
            let session = lease.session().clone();
            let request = proto::BatchWriteRequest {
                session: session.name().to_string(),
                request_options: options.request_options.as_ref().map(Into::into),
                mutation_groups: groups.iter().map(MutationGroup::proto).collect(),
                exclude_txn_from_change_streams: options.exclude_txn_from_change_streams,
            };

            let mut responses = Vec::new();
            let failure = match session.batch_write(request).await {
                Ok(mut stream) => loop {
                    match stream.next().await {
                        Some(Ok(response)) => responses.push(response.into()),
                        Some(Err(error)) => {
                            session.observe(&error);
                            break Some(error);
                        }
                        None => break None,
                    }
                },
                Err(error) => Some(error),
            };
            self.sessions.release(lease);

            let error = match failure {
                None => return Ok(responses),
                Some(error) => error,
            };
            let site = RetrySite::BatchWrite {
                received_data: !responses.is_empty(),
            };
            match retry_decision(site, &error) {
                RetryDecision::RetryWithNewSession => {
                    tracing::debug!(error = %error, "retrying batch write on a new session");
                }
                _ => return Err(error),
            }
        }
    }
}
