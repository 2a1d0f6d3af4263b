use std::sync::Arc;

use async_trait::async_trait;
use bb8::{ManageConnection, PooledConnection};
use parking_lot::Mutex;
use tonic::Code;

use crate::config::SessionOptions;
use crate::connection::{Connection, ResponseStream};
use crate::proto::google::spanner::v1 as proto;
use crate::Error;

/// A Cloud Spanner session and the connection its requests travel on.
///
/// The last session-not-found error observed on any request is kept so that a pooled
/// session can be discarded instead of being handed out again.
pub struct Session {
    name: String,
    multiplexed: bool,
    connection: Box<dyn Connection>,
    last_error: Mutex<Option<(Code, String)>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("multiplexed", &self.multiplexed)
            .finish()
    }
}

impl Session {
    pub fn new(name: String, multiplexed: bool, connection: Box<dyn Connection>) -> Self {
        Self {
            name,
            multiplexed,
            connection,
            last_error: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_multiplexed(&self) -> bool {
        self.multiplexed
    }

    /// The code and message of the last session-not-found error seen on this session.
    pub fn last_error(&self) -> Option<(Code, String)> {
        self.last_error.lock().clone()
    }

    pub(crate) fn is_not_found(&self) -> bool {
        self.last_error.lock().is_some()
    }

    pub(crate) fn observe(&self, error: &Error) {
        if error.is_session_not_found() {
            tracing::debug!(session = %self.name, "session not found");
            *self.last_error.lock() = Some((error.code(), error.message()));
        }
    }

    fn observed<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(error) = &result {
            self.observe(error);
        }
        result
    }

    pub(crate) async fn begin_transaction(
        &self,
        request: proto::BeginTransactionRequest,
    ) -> Result<proto::Transaction, Error> {
        self.observed(self.connection.begin_transaction(request).await)
    }

    pub(crate) async fn commit(
        &self,
        request: proto::CommitRequest,
    ) -> Result<proto::CommitResponse, Error> {
        self.observed(self.connection.commit(request).await)
    }

    pub(crate) async fn rollback(&self, request: proto::RollbackRequest) -> Result<(), Error> {
        self.observed(self.connection.rollback(request).await)
    }

    pub(crate) async fn execute_streaming_sql(
        &self,
        request: proto::ExecuteSqlRequest,
    ) -> Result<ResponseStream<proto::PartialResultSet>, Error> {
        self.observed(self.connection.execute_streaming_sql(request).await)
    }

    pub(crate) async fn streaming_read(
        &self,
        request: proto::ReadRequest,
    ) -> Result<ResponseStream<proto::PartialResultSet>, Error> {
        self.observed(self.connection.streaming_read(request).await)
    }

    pub(crate) async fn execute_batch_dml(
        &self,
        request: proto::ExecuteBatchDmlRequest,
    ) -> Result<proto::ExecuteBatchDmlResponse, Error> {
        self.observed(self.connection.execute_batch_dml(request).await)
    }

    pub(crate) async fn batch_write(
        &self,
        request: proto::BatchWriteRequest,
    ) -> Result<ResponseStream<proto::BatchWriteResponse>, Error> {
        self.observed(self.connection.batch_write(request).await)
    }
}

async fn create_session(
    connection: &(dyn Connection + 'static),
    multiplexed: bool,
) -> Result<Arc<Session>, Error> {
    let session = connection.create_session(multiplexed).await?;
    tracing::debug!(session = %session.name, multiplexed, "created session");
    Ok(Arc::new(Session::new(
        session.name,
        multiplexed,
        dyn_clone::clone_box(connection),
    )))
}

pub struct SessionManager {
    connection: Box<dyn Connection>,
}

impl SessionManager {
    pub(crate) fn new(connection: Box<dyn Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl ManageConnection for SessionManager {
    type Connection = Arc<Session>;
    type Error = Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        create_session(self.connection.as_ref(), false).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        match conn.last_error() {
            Some((code, message)) => Err(Error::Status(tonic::Status::new(code, message))),
            None => Ok(()),
        }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_not_found()
    }
}

/// The pool of regular sessions.
pub type SessionPool = bb8::Pool<SessionManager>;

/// The single multiplexed session of a client, created on first use and recreated once the
/// server no longer knows it.
pub struct MultiplexedSession {
    connection: Box<dyn Connection>,
    session: tokio::sync::Mutex<Option<Arc<Session>>>,
}

impl MultiplexedSession {
    pub(crate) fn new(connection: Box<dyn Connection>) -> Self {
        Self {
            connection,
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<Arc<Session>, Error> {
        let mut current = self.session.lock().await;
        match current.as_ref() {
            Some(session) if !session.is_not_found() => Ok(session.clone()),
            _ => {
                let session = create_session(self.connection.as_ref(), true).await?;
                *current = Some(session.clone());
                Ok(session)
            }
        }
    }
}

/// A session handed out by a [`SessionSource`].
///
/// Pooled sessions go back to their pool when the lease is released or dropped.
pub struct SessionLease {
    session: Arc<Session>,
    _pooled: Option<PooledConnection<'static, SessionManager>>,
}

impl SessionLease {
    /// A lease that is not tied to any pool.
    pub fn detached(session: Arc<Session>) -> Self {
        Self {
            session,
            _pooled: None,
        }
    }

    fn pooled(pooled: PooledConnection<'static, SessionManager>) -> Self {
        Self {
            session: Arc::clone(&*pooled),
            _pooled: Some(pooled),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

/// Hands out sessions to transactions, choosing between the pool and the multiplexed session.
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// A session for read-only work.
    async fn get_session(&self) -> Result<SessionLease, Error>;
    async fn get_session_for_read_write(&self) -> Result<SessionLease, Error>;
    async fn get_session_for_partitioned_ops(&self) -> Result<SessionLease, Error>;

    fn release(&self, lease: SessionLease) {
        drop(lease);
    }

    fn is_multiplexed_enabled(&self) -> bool;
    fn is_multiplexed_enabled_for_rw(&self) -> bool;
}

pub struct SessionFactory {
    pool: SessionPool,
    multiplexed: Option<MultiplexedSession>,
    options: SessionOptions,
}

impl SessionFactory {
    pub async fn new(
        connection: Box<dyn Connection>,
        options: SessionOptions,
    ) -> Result<Self, Error> {
        if options.max_sessions == 0 {
            return Err(Error::Config("max_sessions must be positive".to_string()));
        }
        let pool = bb8::Pool::builder()
            .max_size(options.max_sessions)
            .min_idle(Some(options.min_sessions))
            .connection_timeout(options.acquire_timeout)
            .build(SessionManager::new(dyn_clone::clone_box(connection.as_ref())))
            .await?;

        let multiplexed = options
            .multiplexed
            .then(|| MultiplexedSession::new(connection));

        Ok(Self {
            pool,
            multiplexed,
            options,
        })
    }

    async fn pooled(&self) -> Result<SessionLease, Error> {
        Ok(SessionLease::pooled(self.pool.get_owned().await?))
    }

    async fn multiplexed_or_pooled(&self, use_multiplexed: bool) -> Result<SessionLease, Error> {
        match &self.multiplexed {
            Some(multiplexed) if use_multiplexed => {
                Ok(SessionLease::detached(multiplexed.get().await?))
            }
            _ => self.pooled().await,
        }
    }
}

#[async_trait]
impl SessionSource for SessionFactory {
    async fn get_session(&self) -> Result<SessionLease, Error> {
        self.multiplexed_or_pooled(true).await
    }

    async fn get_session_for_read_write(&self) -> Result<SessionLease, Error> {
        self.multiplexed_or_pooled(self.options.multiplexed_for_rw)
            .await
    }

    async fn get_session_for_partitioned_ops(&self) -> Result<SessionLease, Error> {
        self.multiplexed_or_pooled(self.options.multiplexed_for_partitioned_ops)
            .await
    }

    fn is_multiplexed_enabled(&self) -> bool {
        self.multiplexed.is_some()
    }

    fn is_multiplexed_enabled_for_rw(&self) -> bool {
        self.multiplexed.is_some() && self.options.multiplexed_for_rw
    }
}
