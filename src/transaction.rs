use std::sync::Arc;

use async_trait::async_trait;

use crate::{Error, KeySet, RequestOptions, ResultSet, RowStream, Statement};

pub use self::options::*;
pub use self::partitioned::PartitionedDml;
pub use self::read_write::{CommitOptions, CommitResponse, Transaction};
pub use self::runner::{AsyncTransactionRunner, TransactionRunner};
pub use self::snapshot::Snapshot;

#[doc(hidden)]
pub use self::base::TransactionCore;
pub(crate) use self::base::TransactionSettings;

mod begin;
pub(crate) mod base;
mod options;
mod partitioned;
mod read_write;
mod runner;
mod snapshot;

/// A read of rows by key, as opposed to a SQL query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadRequest {
    pub columns: Vec<String>,
    pub key_set: KeySet,
    /// Reads through this secondary index instead of the primary key.
    pub index: Option<String>,
    pub limit: Option<i64>,
    pub request_options: Option<RequestOptions>,
    pub directed_read_options: Option<DirectedReadOptions>,
}

impl ReadRequest {
    pub fn new<I, S>(columns: I, key_set: KeySet) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            key_set,
            ..Default::default()
        }
    }

    pub fn index(mut self, index: &str) -> Self {
        self.index = Some(index.to_string());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn request_options(mut self, options: RequestOptions) -> Self {
        self.request_options = Some(options);
        self
    }

    pub fn directed_read_options(mut self, options: DirectedReadOptions) -> Self {
        self.directed_read_options = Some(options);
        self
    }
}

/// Operations shared by every kind of transaction: reads, queries and the transaction's
/// lifecycle.
///
/// Requests issued before a read-write transaction has an id are serialized: the first one
/// begins the transaction inline, the others wait for its id and then run in the order they
/// were issued.
#[async_trait]
pub trait ReadContext: Send + Sync {
    #[doc(hidden)]
    fn core(&self) -> &Arc<TransactionCore>;

    /// Begins the transaction explicitly, unless it has already begun.
    async fn begin(&self) -> Result<Vec<u8>, Error> {
        self.core().begin().await
    }

    fn read_stream(&self, table: &str, request: ReadRequest) -> RowStream {
        self.core().read_stream(table, request)
    }

    async fn read(&self, table: &str, request: ReadRequest) -> Result<ResultSet, Error> {
        self.core().read(table, request).await
    }

    fn run_stream(&self, statement: Statement) -> RowStream {
        self.core().run_stream(statement)
    }

    /// Runs a query and buffers its rows.
    ///
    /// ```no_run
    /// # use spanner_txn::*;
    /// # async fn f(client: Client) -> Result<(), Error> {
    /// let snapshot = client.snapshot(TimestampBound::Strong).await?;
    /// let result_set = snapshot
    ///     .run(Statement::new("SELECT name FROM person WHERE id = @id").bind("id", &42)?)
    ///     .await?;
    /// # Ok(()) }
    /// ```
    async fn run(&self, statement: Statement) -> Result<ResultSet, Error> {
        self.core().run(statement).await
    }

    /// The transaction id, once the server returned one.
    fn id(&self) -> Option<Vec<u8>> {
        self.core().id()
    }

    /// Ends the transaction and releases its session. Further calls do nothing.
    fn end(&self) {
        self.core().end()
    }

    fn ended(&self) -> bool {
        self.core().ended()
    }
}

/// Transactions that can run DML statements.
#[async_trait]
pub trait Dml: ReadContext {
    /// Runs a DML statement and returns the number of rows it modified.
    async fn run_update(&self, statement: Statement) -> Result<i64, Error> {
        self.core().run_update(statement).await
    }
}
