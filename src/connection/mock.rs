//! A scripted in-memory [`Connection`] for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{Connection, ResponseStream};
use crate::proto::google::spanner::v1 as proto;
use crate::Error;

pub(crate) const INLINE_TRANSACTION_ID: &[u8] = b"inline-tx";
pub(crate) const BEGUN_TRANSACTION_ID: &[u8] = b"begun-tx";

/// A request received by [`MockConnection`].
#[derive(Clone, Debug)]
pub(crate) enum Recorded {
    CreateSession { multiplexed: bool },
    Begin(proto::BeginTransactionRequest),
    Commit(proto::CommitRequest),
    Rollback(proto::RollbackRequest),
    ExecuteSql(proto::ExecuteSqlRequest),
    Read(proto::ReadRequest),
    BatchDml(proto::ExecuteBatchDmlRequest),
    BatchWrite(proto::BatchWriteRequest),
}

type Items<T> = Vec<Result<T, Error>>;

#[derive(Default)]
struct Script {
    requests: Vec<Recorded>,
    sessions: usize,
    begin: VecDeque<Result<proto::Transaction, Error>>,
    commit: VecDeque<Result<proto::CommitResponse, Error>>,
    rollback: VecDeque<Result<(), Error>>,
    streams: VecDeque<Result<Items<proto::PartialResultSet>, Error>>,
    batch_dml: VecDeque<Result<proto::ExecuteBatchDmlResponse, Error>>,
    batch_write: VecDeque<Result<Items<proto::BatchWriteResponse>, Error>>,
    stream_gate: Option<oneshot::Receiver<()>>,
}

/// Replays scripted responses, falling back to a successful default for every RPC.
#[derive(Clone, Default)]
pub(crate) struct MockConnection {
    script: Arc<Mutex<Script>>,
}

impl MockConnection {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn requests(&self) -> Vec<Recorded> {
        self.script.lock().requests.clone()
    }

    pub(crate) fn commits(&self) -> Vec<proto::CommitRequest> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                Recorded::Commit(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn begins(&self) -> Vec<proto::BeginTransactionRequest> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                Recorded::Begin(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn queries(&self) -> Vec<proto::ExecuteSqlRequest> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                Recorded::ExecuteSql(q) => Some(q),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| matches!(r, Recorded::Rollback(_)))
            .count()
    }

    pub(crate) fn push_begin(&self, response: Result<proto::Transaction, Error>) {
        self.script.lock().begin.push_back(response);
    }

    pub(crate) fn push_commit(&self, response: Result<proto::CommitResponse, Error>) {
        self.script.lock().commit.push_back(response);
    }

    pub(crate) fn push_rollback(&self, response: Result<(), Error>) {
        self.script.lock().rollback.push_back(response);
    }

    /// The next query or read answers with `items`, one stream message each.
    pub(crate) fn push_stream(&self, items: Items<proto::PartialResultSet>) {
        self.script.lock().streams.push_back(Ok(items));
    }

    /// The next query or read fails before returning a stream.
    pub(crate) fn fail_stream(&self, error: Error) {
        self.script.lock().streams.push_back(Err(error));
    }

    pub(crate) fn push_batch_dml(&self, response: Result<proto::ExecuteBatchDmlResponse, Error>) {
        self.script.lock().batch_dml.push_back(response);
    }

    pub(crate) fn push_batch_write(&self, items: Result<Items<proto::BatchWriteResponse>, Error>) {
        self.script.lock().batch_write.push_back(items);
    }

    /// The next query or read waits until the returned sender fires.
    pub(crate) fn gate_next_stream(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.script.lock().stream_gate = Some(rx);
        tx
    }

    fn record(&self, request: Recorded) {
        self.script.lock().requests.push(request);
    }

    async fn stream(
        &self,
        selector: Option<&proto::TransactionSelector>,
    ) -> Result<ResponseStream<proto::PartialResultSet>, Error> {
        let (gate, scripted) = {
            let mut script = self.script.lock();
            (script.stream_gate.take(), script.streams.pop_front())
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let items = match scripted {
            Some(items) => items?,
            None => vec![Ok(default_result(selector))],
        };
        Ok(futures::stream::iter(items).boxed())
    }
}

/// One INT64 column `n` holding 1, a row count of 1 and an inline-begun transaction when
/// the selector asks for one.
pub(crate) fn default_result(
    selector: Option<&proto::TransactionSelector>,
) -> proto::PartialResultSet {
    let begins = matches!(
        selector.and_then(|s| s.selector.as_ref()),
        Some(proto::transaction_selector::Selector::Begin(_))
    );
    proto::PartialResultSet {
        metadata: Some(metadata(&[("n", proto::TypeCode::Int64)], begins)),
        values: vec![string_value("1")],
        stats: Some(row_count(1)),
        resume_token: b"done".to_vec(),
        ..Default::default()
    }
}

/// A stream of one INT64 column `n`, one row per message.
pub(crate) fn int64_rows(values: &[i64]) -> Items<proto::PartialResultSet> {
    let last = values.len().saturating_sub(1);
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            Ok(proto::PartialResultSet {
                metadata: (i == 0).then(|| metadata(&[("n", proto::TypeCode::Int64)], false)),
                values: vec![string_value(&value.to_string())],
                resume_token: format!("row-{}", i).into_bytes(),
                stats: (i == last).then(|| row_count(values.len() as i64)),
                ..Default::default()
            })
        })
        .collect()
}

pub(crate) fn metadata(columns: &[(&str, proto::TypeCode)], begins: bool) -> proto::ResultSetMetadata {
    proto::ResultSetMetadata {
        row_type: Some(proto::StructType {
            fields: columns
                .iter()
                .map(|(name, code)| proto::struct_type::Field {
                    name: name.to_string(),
                    r#type: Some(proto::Type {
                        code: *code as i32,
                        ..Default::default()
                    }),
                })
                .collect(),
        }),
        transaction: begins.then(|| proto::Transaction {
            id: INLINE_TRANSACTION_ID.to_vec(),
            ..Default::default()
        }),
    }
}

pub(crate) fn row_count(count: i64) -> proto::ResultSetStats {
    proto::ResultSetStats {
        query_stats: None,
        row_count: Some(proto::result_set_stats::RowCount::RowCountExact(count)),
    }
}

pub(crate) fn string_value(value: &str) -> prost_types::Value {
    prost_types::Value {
        kind: Some(prost_types::value::Kind::StringValue(value.to_string())),
    }
}

pub(crate) fn precommit_token(seq_num: i32) -> proto::MultiplexedSessionPrecommitToken {
    proto::MultiplexedSessionPrecommitToken {
        precommit_token: format!("token-{}", seq_num).into_bytes(),
        seq_num,
    }
}

pub(crate) fn selector_of(
    selector: &Option<proto::TransactionSelector>,
) -> Option<&proto::transaction_selector::Selector> {
    selector.as_ref().and_then(|s| s.selector.as_ref())
}

#[async_trait]
impl Connection for MockConnection {
    async fn create_session(&self, multiplexed: bool) -> Result<proto::Session, Error> {
        self.record(Recorded::CreateSession { multiplexed });
        let mut script = self.script.lock();
        script.sessions += 1;
        Ok(proto::Session {
            name: format!(
                "projects/p/instances/i/databases/d/sessions/s{}",
                script.sessions
            ),
            multiplexed,
            ..Default::default()
        })
    }

    async fn begin_transaction(
        &self,
        request: proto::BeginTransactionRequest,
    ) -> Result<proto::Transaction, Error> {
        self.record(Recorded::Begin(request));
        let scripted = self.script.lock().begin.pop_front();
        scripted.unwrap_or_else(|| {
            Ok(proto::Transaction {
                id: BEGUN_TRANSACTION_ID.to_vec(),
                read_timestamp: Some(prost_types::Timestamp {
                    seconds: 1_600_000_000,
                    nanos: 0,
                }),
                precommit_token: None,
            })
        })
    }

    async fn commit(&self, request: proto::CommitRequest) -> Result<proto::CommitResponse, Error> {
        self.record(Recorded::Commit(request));
        let scripted = self.script.lock().commit.pop_front();
        scripted.unwrap_or_else(|| {
            Ok(proto::CommitResponse {
                commit_timestamp: Some(prost_types::Timestamp {
                    seconds: 1_700_000_000,
                    nanos: 0,
                }),
                ..Default::default()
            })
        })
    }

    async fn rollback(&self, request: proto::RollbackRequest) -> Result<(), Error> {
        self.record(Recorded::Rollback(request));
        let scripted = self.script.lock().rollback.pop_front();
        scripted.unwrap_or(Ok(()))
    }

    async fn execute_streaming_sql(
        &self,
        request: proto::ExecuteSqlRequest,
    ) -> Result<ResponseStream<proto::PartialResultSet>, Error> {
        let selector = request.transaction.clone();
        self.record(Recorded::ExecuteSql(request));
        self.stream(selector.as_ref()).await
    }

    async fn streaming_read(
        &self,
        request: proto::ReadRequest,
    ) -> Result<ResponseStream<proto::PartialResultSet>, Error> {
        let selector = request.transaction.clone();
        self.record(Recorded::Read(request));
        self.stream(selector.as_ref()).await
    }

    async fn execute_batch_dml(
        &self,
        request: proto::ExecuteBatchDmlRequest,
    ) -> Result<proto::ExecuteBatchDmlResponse, Error> {
        let statements = request.statements.len();
        let begins = matches!(
            selector_of(&request.transaction),
            Some(proto::transaction_selector::Selector::Begin(_))
        );
        self.record(Recorded::BatchDml(request));
        let scripted = self.script.lock().batch_dml.pop_front();
        scripted.unwrap_or_else(|| {
            Ok(proto::ExecuteBatchDmlResponse {
                result_sets: (0..statements)
                    .map(|i| proto::ResultSet {
                        metadata: Some(metadata(&[], begins && i == 0)),
                        stats: Some(row_count(1)),
                        ..Default::default()
                    })
                    .collect(),
                status: Some(Default::default()),
                precommit_token: None,
            })
        })
    }

    async fn batch_write(
        &self,
        request: proto::BatchWriteRequest,
    ) -> Result<ResponseStream<proto::BatchWriteResponse>, Error> {
        let groups = request.mutation_groups.len() as i32;
        self.record(Recorded::BatchWrite(request));
        let scripted = self.script.lock().batch_write.pop_front();
        let items = match scripted {
            Some(items) => items?,
            None => vec![Ok(proto::BatchWriteResponse {
                indexes: (0..groups).collect(),
                status: Some(Default::default()),
                commit_timestamp: Some(prost_types::Timestamp {
                    seconds: 1_700_000_000,
                    nanos: 0,
                }),
            })],
        };
        Ok(futures::stream::iter(items).boxed())
    }
}
