use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tonic::{Code, Status};

use super::base::{to_system_time, TransactionCore};
use super::options::{ReadLockMode, ReadWriteOptions, TransactionOptions};
use super::{Dml, ReadContext};
use crate::mutation::{select_mutation_key, writes_array_to};
use crate::proto::google::spanner::v1 as proto;
use crate::{Error, KeySet, Mutation, MutationRow, MutationSet, RequestOptions, Statement};

use proto::commit_request::Transaction as CommitTarget;
use proto::commit_response::MultiplexedSessionRetry;

const JSON_ARRAY_HINT: &str = "\nThe value is an array. Encode it as a JSON string holding \
    the array, for example `[{\"key\":\"value\"}]`, to write it into a JSON column.";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommitOptions {
    pub return_commit_stats: bool,
    /// How long the server may delay the commit to batch it with others.
    pub max_commit_delay: Option<Duration>,
    pub request_options: Option<RequestOptions>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommitResponse {
    pub commit_timestamp: Option<SystemTime>,
    /// Only set when commit statistics were requested.
    pub mutation_count: Option<i64>,
}

/// A read-write transaction.
///
/// Mutations are buffered locally and sent with [`Transaction::commit`]. DML statements and
/// reads run immediately, beginning the transaction inline with the first of them.
#[derive(Clone, Debug)]
pub struct Transaction {
    core: Arc<TransactionCore>,
}

impl ReadContext for Transaction {
    fn core(&self) -> &Arc<TransactionCore> {
        &self.core
    }
}

impl Dml for Transaction {}

impl Transaction {
    pub(crate) fn new(core: Arc<TransactionCore>) -> Self {
        Self { core }
    }

    fn buffer(&self, mutation: Mutation) -> Result<(), Error> {
        self.core.ensure_active()?;
        self.core.with_state(|state| state.mutations.push(mutation));
        Ok(())
    }

    pub fn insert(&self, table: &str, rows: Vec<MutationRow>) -> Result<(), Error> {
        self.buffer(Mutation::insert(table, rows)?)
    }

    pub fn update(&self, table: &str, rows: Vec<MutationRow>) -> Result<(), Error> {
        self.buffer(Mutation::update(table, rows)?)
    }

    pub fn upsert(&self, table: &str, rows: Vec<MutationRow>) -> Result<(), Error> {
        self.buffer(Mutation::upsert(table, rows)?)
    }

    pub fn replace(&self, table: &str, rows: Vec<MutationRow>) -> Result<(), Error> {
        self.buffer(Mutation::replace(table, rows)?)
    }

    pub fn delete_rows(&self, table: &str, key_set: KeySet) -> Result<(), Error> {
        self.buffer(Mutation::delete(table, key_set))
    }

    /// Buffers every mutation of `mutations`, in order.
    pub fn write(&self, mutations: &MutationSet) -> Result<(), Error> {
        self.core.ensure_active()?;
        self.core.with_state(|state| {
            state
                .mutations
                .extend(mutations.mutations().iter().cloned())
        });
        Ok(())
    }

    /// Runs DML statements in order, in a single request.
    ///
    /// Execution stops at the first failing statement; the returned
    /// [`Error::BatchUpdate`] holds the row counts of the statements before it.
    pub async fn batch_update(&self, statements: Vec<Statement>) -> Result<Vec<i64>, Error> {
        let mut span = self.core.span("CloudSpanner.Transaction.batchUpdate");
        if statements.is_empty() {
            let error = Error::BatchUpdate {
                status: Status::invalid_argument("batchUpdate requires at least 1 DML statement."),
                row_counts: Vec::new(),
            };
            span.set_error(&error);
            return Err(error);
        }

        let (selector, mut slot) = match self.core.acquire_selector().await {
            Ok(acquired) => acquired,
            Err(error) => {
                span.set_error(&error);
                return Err(error);
            }
        };
        let seqno = self.core.next_seqno();
        let request = self.core.with_state(|state| proto::ExecuteBatchDmlRequest {
            session: self.core.session().name().to_string(),
            transaction: Some(selector),
            statements: statements.iter().map(Into::into).collect(),
            seqno,
            request_options: self.core.request_options(state, None),
            last_statements: false,
        });

        let result = match self.core.session().execute_batch_dml(request).await {
            Ok(response) => {
                if let Some(token) = response.precommit_token {
                    self.core.update_precommit_token(token);
                }
                let mut row_counts = Vec::with_capacity(response.result_sets.len());
                for result_set in response.result_sets {
                    if let Some(transaction) = result_set.metadata.and_then(|m| m.transaction) {
                        self.core.on_transaction(transaction, slot.take());
                    }
                    let count = result_set
                        .stats
                        .map(crate::ResultSetStats::from)
                        .and_then(|stats| stats.row_count)
                        .map(|count| count.value())
                        .unwrap_or(0);
                    row_counts.push(count);
                }
                match response.status {
                    Some(status) if status.code != Code::Ok as i32 => Err(Error::BatchUpdate {
                        status: Status::new(Code::from(status.code), status.message),
                        row_counts,
                    }),
                    _ => Ok(row_counts),
                }
            }
            Err(error) => Err(error),
        };

        if let Err(error) = &result {
            self.core
                .on_request_error(error, slot.take(), false, &mut span)
                .await;
            span.set_error(error);
        }
        result
    }

    /// Commits the buffered mutations and ends the transaction, whatever the outcome.
    ///
    /// A transaction that never began commits as a single-use transaction, in one request.
    /// Inside a runner it begins explicitly first.
    pub async fn commit(&self, options: CommitOptions) -> Result<CommitResponse, Error> {
        let mut span = self.core.span("CloudSpanner.Transaction.commit");
        let result = self.commit_inner(options, &mut span).await;
        if let Err(error) = &result {
            span.set_error(error);
        }
        self.core.end();
        result
    }

    async fn commit_inner(
        &self,
        options: CommitOptions,
        span: &mut crate::trace::Span,
    ) -> Result<CommitResponse, Error> {
        self.core.ensure_active()?;
        let session = self.core.session().clone();

        if self.core.id().is_none() && self.core.in_runner() {
            if session.is_multiplexed() {
                self.core.with_state(|state| {
                    state.mutation_key = select_mutation_key(&state.mutations).map(Into::into);
                });
            }
            self.core.begin().await?;
        }

        let (mut request, mutations) = self.core.with_state(|state| {
            let transaction = match &state.id {
                Some(id) => CommitTarget::TransactionId(id.clone()),
                None => CommitTarget::SingleUseTransaction(
                    state
                        .options
                        .encode(self.core.settings().default_isolation_level),
                ),
            };
            let request = proto::CommitRequest {
                session: session.name().to_string(),
                mutations: state.mutations.iter().map(Into::into).collect(),
                return_commit_stats: options.return_commit_stats,
                max_commit_delay: options.max_commit_delay.map(Into::into),
                request_options: self
                    .core
                    .request_options(state, options.request_options.as_ref()),
                precommit_token: None,
                transaction: Some(transaction),
            };
            (request, state.mutations.clone())
        });

        span.add_event("Starting Commit");
        loop {
            request.precommit_token = self.core.precommit_token();
            let response = match session.commit(request.clone()).await {
                Ok(response) => response,
                Err(error) => {
                    span.add_event("Commit failed");
                    return Err(decorate_commit_error(error, &mutations));
                }
            };

            if let Some(MultiplexedSessionRetry::PrecommitToken(token)) =
                response.multiplexed_session_retry.clone()
            {
                let retry = self.core.with_state(|state| !state.retry_commit);
                if retry {
                    tracing::debug!(seq_num = token.seq_num, "commit asked to retry with a new precommit token");
                    self.core.with_state(|state| state.retry_commit = true);
                    self.core.update_precommit_token(token);
                    continue;
                }
            }

            self.core
                .with_state(|state| state.commit_timestamp = response.commit_timestamp.clone());
            span.add_event("Commit Done");
            return Ok(CommitResponse {
                commit_timestamp: response.commit_timestamp.as_ref().and_then(to_system_time),
                mutation_count: response.commit_stats.map(|stats| stats.mutation_count),
            });
        }
    }

    /// Rolls the transaction back and ends it.
    ///
    /// A transaction without an id has nothing to roll back on the server and only ends.
    pub async fn rollback(&self) -> Result<(), Error> {
        let mut span = self.core.span("CloudSpanner.Transaction.rollback");
        let id = match self.core.id() {
            Some(id) => id,
            None => {
                span.add_event("Transaction ID is unknown, nothing to rollback.");
                self.core.end();
                return Ok(());
            }
        };
        let request = proto::RollbackRequest {
            session: self.core.session().name().to_string(),
            transaction_id: id,
        };
        let result = self.core.session().rollback(request).await;
        if let Err(error) = &result {
            span.set_error(error);
        }
        self.core.end();
        result
    }

    fn with_read_write_options(&self, f: impl FnOnce(&mut ReadWriteOptions)) {
        self.core.with_state(|state| {
            if let TransactionOptions::ReadWrite(options) = &mut state.options {
                f(options)
            }
        })
    }

    /// Takes locks at commit time only, validating reads then.
    pub fn use_optimistic_lock(&self) {
        self.with_read_write_options(|options| options.read_lock_mode = ReadLockMode::Optimistic);
    }

    pub fn exclude_txn_from_change_streams(&self) {
        self.with_read_write_options(|options| options.exclude_txn_from_change_streams = true);
    }

    /// Replaces the options used when the transaction begins.
    pub fn set_read_write_transaction_options(&self, options: ReadWriteOptions) {
        self.with_read_write_options(|current| {
            let previous_transaction_id = current.previous_transaction_id.take();
            *current = ReadWriteOptions {
                previous_transaction_id,
                ..options
            };
        });
    }

    /// Tags every request of this transaction.
    pub fn set_transaction_tag(&self, tag: &str) {
        self.core
            .with_state(|state| state.transaction_tag = Some(tag.to_string()));
    }

    /// Marks the transaction as driven by a runner, which retries it as a whole.
    ///
    /// Such a transaction begins explicitly before committing and after a failed first
    /// request, so that its id is known to the retry.
    pub fn use_in_runner(&self) {
        self.core.with_state(|state| state.use_in_runner = true);
    }

    pub fn commit_timestamp(&self) -> Option<SystemTime> {
        self.core
            .with_state(|state| state.commit_timestamp.clone())
            .as_ref()
            .and_then(to_system_time)
    }
}

/// Appends guidance to a commit that failed because an array was written to a JSON column.
fn decorate_commit_error(error: Error, mutations: &[Mutation]) -> Error {
    if error.code() != Code::FailedPrecondition {
        return error;
    }
    let message = error.message();
    let column_and_table = message
        .split_once("Invalid value for column ")
        .and_then(|(_, rest)| rest.split_once(": Expected JSON"))
        .and_then(|(location, _)| location.split_once(" in table "));
    match column_and_table {
        Some((column, table)) if writes_array_to(mutations, table, column) => {
            error.with_appended_message(JSON_ARRAY_HINT)
        }
        _ => error,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::mock::{
        precommit_token, selector_of, MockConnection, Recorded, BEGUN_TRANSACTION_ID,
        INLINE_TRANSACTION_ID,
    };
    use crate::trace::{InMemoryTracer, SpanStatus};
    use crate::transaction::base::test::{session, settings};
    use crate::{ToSpanner, Value};
    use proto::transaction_selector::Selector;

    fn transaction(
        connection: &MockConnection,
        tracer: &InMemoryTracer,
        multiplexed: bool,
    ) -> Transaction {
        Transaction::new(TransactionCore::new(
            session(connection, multiplexed),
            settings(tracer),
            TransactionOptions::ReadWrite(ReadWriteOptions::default()),
        ))
    }

    fn row(id: i64) -> MutationRow {
        MutationRow::new().set("id", &id).unwrap()
    }

    #[tokio::test]
    async fn test_blind_write_commits_in_one_request() {
        let connection = MockConnection::new();
        let tracer = InMemoryTracer::new();
        let tx = transaction(&connection, &tracer, false);
        tx.insert("numbers", vec![row(1), row(2)]).unwrap();

        let response = tx.commit(CommitOptions::default()).await.unwrap();
        assert!(response.commit_timestamp.is_some());
        assert_eq!(tx.commit_timestamp(), response.commit_timestamp);
        assert!(tx.ended());

        let requests = connection.requests();
        assert_eq!(requests.len(), 1);
        match &requests[0] {
            Recorded::Commit(commit) => {
                assert!(matches!(
                    commit.transaction,
                    Some(CommitTarget::SingleUseTransaction(_))
                ));
                assert_eq!(commit.mutations.len(), 1);
            }
            other => panic!("unexpected request {:?}", other),
        }

        let span = tracer.find("CloudSpanner.Transaction.commit").unwrap();
        assert_eq!(span.events, vec!["Starting Commit", "Commit Done"]);
    }

    #[tokio::test]
    async fn test_commit_uses_inline_begun_id() {
        let connection = MockConnection::new();
        let tracer = InMemoryTracer::new();
        let tx = transaction(&connection, &tracer, false);
        assert_eq!(tx.run_update(Statement::new("UPDATE t SET x = 1")).await.unwrap(), 1);
        tx.commit(CommitOptions::default()).await.unwrap();

        let commits = connection.commits();
        assert_eq!(
            commits[0].transaction,
            Some(CommitTarget::TransactionId(INLINE_TRANSACTION_ID.to_vec()))
        );
    }

    #[tokio::test]
    async fn test_runner_commit_begins_with_mutation_key_on_multiplexed_session() {
        let connection = MockConnection::new();
        let tracer = InMemoryTracer::new();
        let tx = transaction(&connection, &tracer, true);
        tx.use_in_runner();
        tx.insert("numbers", vec![row(1)]).unwrap();
        tx.delete_rows("numbers", KeySet::all()).unwrap();

        tx.commit(CommitOptions::default()).await.unwrap();

        let begins = connection.begins();
        assert_eq!(begins.len(), 1);
        let key = begins[0].mutation_key.clone().unwrap();
        assert!(matches!(key.operation, Some(proto::mutation::Operation::Delete(_))));
        assert_eq!(
            connection.commits()[0].transaction,
            Some(CommitTarget::TransactionId(BEGUN_TRANSACTION_ID.to_vec()))
        );
    }

    #[tokio::test]
    async fn test_multiplexed_retry_commits_at_most_twice() {
        let connection = MockConnection::new();
        let retry = |seq_num| {
            Ok(proto::CommitResponse {
                multiplexed_session_retry: Some(MultiplexedSessionRetry::PrecommitToken(
                    precommit_token(seq_num),
                )),
                ..Default::default()
            })
        };
        connection.push_commit(retry(4));
        connection.push_commit(retry(5));
        let tracer = InMemoryTracer::new();
        let tx = transaction(&connection, &tracer, true);
        tx.run_update(Statement::new("UPDATE t SET x = 1")).await.unwrap();

        tx.commit(CommitOptions::default()).await.unwrap();

        let commits = connection.commits();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].precommit_token, None);
        assert_eq!(commits[1].precommit_token, Some(precommit_token(4)));
        assert!(tx.core.with_state(|state| state.retry_commit));
    }

    #[tokio::test]
    async fn test_commit_failure_ends_and_adds_json_hint() {
        let connection = MockConnection::new();
        connection.push_commit(Err(Error::Status(Status::failed_precondition(
            "Invalid value for column Foo in table Bar: Expected JSON.",
        ))));
        let tracer = InMemoryTracer::new();
        let tx = transaction(&connection, &tracer, false);
        let array = vec![1i64, 2].to_spanner().unwrap();
        tx.insert(
            "Bar",
            vec![MutationRow::new().set_value("Foo", array)],
        )
        .unwrap();

        let error = tx.commit(CommitOptions::default()).await.unwrap_err();
        assert_eq!(error.code(), Code::FailedPrecondition);
        assert!(error
            .message()
            .starts_with("Invalid value for column Foo in table Bar: Expected JSON."));
        assert!(error.message().ends_with(JSON_ARRAY_HINT));
        assert!(tx.ended());

        let span = tracer.find("CloudSpanner.Transaction.commit").unwrap();
        assert_eq!(span.events, vec!["Starting Commit", "Commit failed"]);
        assert!(matches!(span.status, SpanStatus::Error(_)));
    }

    #[tokio::test]
    async fn test_json_hint_requires_array_value() {
        let connection = MockConnection::new();
        let message = "Invalid value for column Foo in table Bar: Expected JSON.";
        connection.push_commit(Err(Error::Status(Status::failed_precondition(message))));
        let tracer = InMemoryTracer::new();
        let tx = transaction(&connection, &tracer, false);
        tx.insert(
            "Bar",
            vec![MutationRow::new().set_value("Foo", Value::String("x".to_string()))],
        )
        .unwrap();

        let error = tx.commit(CommitOptions::default()).await.unwrap_err();
        assert_eq!(error.message(), message);
    }

    #[tokio::test]
    async fn test_rollback_without_id_sends_nothing() {
        let connection = MockConnection::new();
        let tracer = InMemoryTracer::new();
        let tx = transaction(&connection, &tracer, false);
        tx.insert("numbers", vec![row(1)]).unwrap();

        tx.rollback().await.unwrap();
        assert!(connection.requests().is_empty());
        assert!(tx.ended());
        let span = tracer.find("CloudSpanner.Transaction.rollback").unwrap();
        assert_eq!(
            span.events,
            vec!["Transaction ID is unknown, nothing to rollback."]
        );
    }

    #[tokio::test]
    async fn test_rollback_error_is_returned_after_ending() {
        let connection = MockConnection::new();
        connection.push_rollback(Err(Error::Status(Status::internal("rollback failed"))));
        let tracer = InMemoryTracer::new();
        let tx = transaction(&connection, &tracer, false);
        tx.begin().await.unwrap();

        let error = tx.rollback().await.unwrap_err();
        assert_eq!(error.message(), "rollback failed");
        assert!(tx.ended());
        assert_eq!(connection.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_update_is_rejected_locally() {
        let connection = MockConnection::new();
        let tracer = InMemoryTracer::new();
        let tx = transaction(&connection, &tracer, false);

        match tx.batch_update(Vec::new()).await {
            Err(Error::BatchUpdate { status, row_counts }) => {
                assert_eq!(status.code(), Code::InvalidArgument);
                assert_eq!(status.message(), "batchUpdate requires at least 1 DML statement.");
                assert!(row_counts.is_empty());
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(connection.requests().is_empty());
    }

    #[tokio::test]
    async fn test_batch_update_failure_keeps_row_counts() {
        let connection = MockConnection::new();
        connection.push_batch_dml(Ok(proto::ExecuteBatchDmlResponse {
            result_sets: vec![proto::ResultSet {
                metadata: Some(crate::connection::mock::metadata(&[], true)),
                stats: Some(crate::connection::mock::row_count(3)),
                ..Default::default()
            }],
            status: Some(crate::proto::google::rpc::Status {
                code: Code::InvalidArgument as i32,
                message: "bad statement".to_string(),
                details: Vec::new(),
            }),
            precommit_token: None,
        }));
        let tracer = InMemoryTracer::new();
        let tx = transaction(&connection, &tracer, false);

        let statements = vec![Statement::new("UPDATE a"), Statement::new("UPDATE b")];
        match tx.batch_update(statements).await {
            Err(Error::BatchUpdate { status, row_counts }) => {
                assert_eq!(status.code(), Code::InvalidArgument);
                assert_eq!(row_counts, vec![3]);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(tx.id(), Some(INLINE_TRANSACTION_ID.to_vec()));
    }

    #[tokio::test]
    async fn test_batch_update_begins_inline_and_counts_seqno() {
        let connection = MockConnection::new();
        let tracer = InMemoryTracer::new();
        let tx = transaction(&connection, &tracer, false);
        let counts = tx
            .batch_update(vec![Statement::new("UPDATE a"), Statement::new("UPDATE b")])
            .await
            .unwrap();
        assert_eq!(counts, vec![1, 1]);
        tx.run(Statement::new("SELECT 1")).await.unwrap();

        let requests = connection.requests();
        match &requests[0] {
            Recorded::BatchDml(batch) => {
                assert_eq!(batch.seqno, 1);
                assert!(matches!(
                    selector_of(&batch.transaction),
                    Some(Selector::Begin(_))
                ));
            }
            other => panic!("unexpected request {:?}", other),
        }
        let query = &connection.queries()[0];
        assert_eq!(query.seqno, 2);
        assert_eq!(
            selector_of(&query.transaction),
            Some(&Selector::Id(INLINE_TRANSACTION_ID.to_vec()))
        );
    }

    #[tokio::test]
    async fn test_options_are_applied_at_begin() {
        let connection = MockConnection::new();
        let tracer = InMemoryTracer::new();
        let tx = transaction(&connection, &tracer, false);
        tx.use_optimistic_lock();
        tx.exclude_txn_from_change_streams();
        tx.set_transaction_tag("app=test");
        tx.begin().await.unwrap();

        let begin = &connection.begins()[0];
        let options = begin.options.clone().unwrap();
        assert!(options.exclude_txn_from_change_streams);
        match options.mode {
            Some(proto::transaction_options::Mode::ReadWrite(read_write)) => {
                assert_eq!(
                    read_write.read_lock_mode,
                    proto::transaction_options::read_write::ReadLockMode::Optimistic as i32
                );
            }
            other => panic!("unexpected mode {:?}", other),
        }
        assert_eq!(
            begin.request_options.as_ref().map(|o| o.transaction_tag.as_str()),
            Some("app=test")
        );
    }

    #[tokio::test]
    async fn test_mutations_rejected_after_end() {
        let connection = MockConnection::new();
        let tracer = InMemoryTracer::new();
        let tx = transaction(&connection, &tracer, false);
        tx.end();
        assert!(tx.insert("numbers", vec![row(1)]).is_err());
        assert!(tx.commit(CommitOptions::default()).await.is_err());
        assert!(connection.requests().is_empty());
    }
}
