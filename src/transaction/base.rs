use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use parking_lot::Mutex;

use super::begin::{BeginQueue, Handoff};
use super::options::{DirectedReadOptions, IsolationLevel, TransactionOptions};
use super::ReadRequest;
use crate::error::{retry_decision, RetryDecision, RetrySite};
use crate::proto::google::spanner::v1 as proto;
use crate::result_set::{ResultSet, RowDecoder, RowStream, StreamSummary};
use crate::session::Session;
use crate::stream::{Event, PartialResultStream, Resume};
use crate::trace::{Span, Tracer};
use crate::{Error, Mutation, QueryOptions, RequestOptions, Row, Statement, StructType};

use proto::transaction_selector::Selector;

/// Client-wide settings every transaction reads.
#[derive(Clone, Debug)]
pub(crate) struct TransactionSettings {
    pub(crate) tracer: Arc<dyn Tracer>,
    pub(crate) database: String,
    pub(crate) default_isolation_level: IsolationLevel,
    pub(crate) directed_read_options: Option<DirectedReadOptions>,
    pub(crate) query_options: Option<QueryOptions>,
}

type EndListener = Box<dyn FnOnce() + Send>;

pub(crate) struct State {
    pub(crate) options: TransactionOptions,
    pub(crate) id: Option<Vec<u8>>,
    pub(crate) read_timestamp: Option<prost_types::Timestamp>,
    pub(crate) commit_timestamp: Option<prost_types::Timestamp>,
    seqno: i64,
    pub(crate) precommit_token: Option<proto::MultiplexedSessionPrecommitToken>,
    begin: BeginQueue,
    ended: bool,
    end_listeners: Vec<EndListener>,
    pub(crate) mutations: Vec<Mutation>,
    /// Sent with an explicit begin of a mutation-only transaction on a multiplexed session.
    pub(crate) mutation_key: Option<proto::Mutation>,
    pub(crate) use_in_runner: bool,
    /// Set once a commit has been retried with a fresh precommit token.
    pub(crate) retry_commit: bool,
    pub(crate) transaction_tag: Option<String>,
}

impl State {
    /// Keeps the token with the highest sequence number.
    fn update_precommit_token(&mut self, token: proto::MultiplexedSessionPrecommitToken) {
        let newer = match &self.precommit_token {
            Some(current) => token.seq_num > current.seq_num,
            None => true,
        };
        if newer {
            self.precommit_token = Some(token);
        }
    }
}

/// State and request plumbing shared by every kind of transaction.
#[doc(hidden)]
pub struct TransactionCore {
    session: Arc<Session>,
    settings: Arc<TransactionSettings>,
    state: Mutex<State>,
}

impl std::fmt::Debug for TransactionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionCore")
            .field("session", &self.session.name())
            .field("options", &state.options)
            .field("id", &state.id)
            .field("ended", &state.ended)
            .finish()
    }
}

/// Owns the right to begin the transaction. Dropping it without an id hands the right to
/// the next queued request.
pub(crate) struct BeginSlot {
    core: Arc<TransactionCore>,
    armed: bool,
}

impl BeginSlot {
    fn new(core: Arc<TransactionCore>) -> Self {
        Self { core, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for BeginSlot {
    fn drop(&mut self) {
        if self.armed {
            self.core.state.lock().begin.hand_off();
        }
    }
}

fn id_selector(id: Vec<u8>) -> proto::TransactionSelector {
    proto::TransactionSelector {
        selector: Some(Selector::Id(id)),
    }
}

pub(crate) fn ended_error() -> Error {
    Error::Client("transaction has already ended".to_string())
}

pub(crate) fn to_system_time(timestamp: &prost_types::Timestamp) -> Option<SystemTime> {
    let seconds = u64::try_from(timestamp.seconds).ok()?;
    let nanos = u32::try_from(timestamp.nanos).ok()?;
    UNIX_EPOCH.checked_add(Duration::new(seconds, nanos))
}

impl TransactionCore {
    pub(crate) fn new(
        session: Arc<Session>,
        settings: Arc<TransactionSettings>,
        options: TransactionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            settings,
            state: Mutex::new(State {
                options,
                id: None,
                read_timestamp: None,
                commit_timestamp: None,
                seqno: 1,
                precommit_token: None,
                begin: BeginQueue::default(),
                ended: false,
                end_listeners: Vec::new(),
                mutations: Vec::new(),
                mutation_key: None,
                use_in_runner: false,
                retry_commit: false,
                transaction_tag: None,
            }),
        })
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub(crate) fn settings(&self) -> &TransactionSettings {
        &self.settings
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub(crate) fn id(&self) -> Option<Vec<u8>> {
        self.state.lock().id.clone()
    }

    pub(crate) fn read_timestamp(&self) -> Option<SystemTime> {
        self.state
            .lock()
            .read_timestamp
            .as_ref()
            .and_then(to_system_time)
    }

    pub(crate) fn ended(&self) -> bool {
        self.state.lock().ended
    }

    pub(crate) fn in_runner(&self) -> bool {
        self.state.lock().use_in_runner
    }

    pub(crate) fn ensure_active(&self) -> Result<(), Error> {
        if self.ended() {
            return Err(ended_error());
        }
        Ok(())
    }

    pub(crate) fn next_seqno(&self) -> i64 {
        let mut state = self.state.lock();
        let seqno = state.seqno;
        state.seqno += 1;
        seqno
    }

    pub(crate) fn update_precommit_token(&self, token: proto::MultiplexedSessionPrecommitToken) {
        self.state.lock().update_precommit_token(token);
    }

    pub(crate) fn precommit_token(&self) -> Option<proto::MultiplexedSessionPrecommitToken> {
        self.state.lock().precommit_token.clone()
    }

    /// Registers `listener` to run when the transaction ends, or runs it now if it has.
    pub(crate) fn on_end(&self, listener: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        if state.ended {
            drop(state);
            listener();
        } else {
            state.end_listeners.push(Box::new(listener));
        }
    }

    /// Marks the transaction as ended. Only the first call has an effect.
    pub(crate) fn end(&self) {
        let listeners = {
            let mut state = self.state.lock();
            if state.ended {
                return;
            }
            state.ended = true;
            state.begin.close();
            state.mutations.clear();
            std::mem::take(&mut state.end_listeners)
        };
        for listener in listeners {
            listener();
        }
    }

    pub(crate) fn span(&self, name: &str) -> Span {
        let mut attributes = vec![("db.name", self.settings.database.clone())];
        if let Some(tag) = self.state.lock().transaction_tag.clone() {
            attributes.push(("transaction.tag", tag));
        }
        Span::start(self.settings.tracer.as_ref(), name, &attributes)
    }

    fn encode_options(&self, state: &State) -> proto::TransactionOptions {
        state
            .options
            .encode(self.settings.default_isolation_level)
    }

    pub(crate) fn request_options(
        &self,
        state: &State,
        request: Option<&RequestOptions>,
    ) -> Option<proto::RequestOptions> {
        let mut options = request.cloned().unwrap_or_default();
        if options.transaction_tag.is_none() && state.options.is_read_write() {
            options.transaction_tag = state.transaction_tag.clone();
        }
        (options != RequestOptions::default()).then(|| (&options).into())
    }

    fn directed_read(
        &self,
        state: &State,
        request: Option<&DirectedReadOptions>,
    ) -> Option<proto::DirectedReadOptions> {
        if !state.options.is_read_only() {
            return None;
        }
        request
            .or(self.settings.directed_read_options.as_ref())
            .map(Into::into)
    }

    /// The selector for the next request. A read-write transaction without an id begins
    /// inline through at most one request at a time; the others wait for its id.
    pub(crate) async fn acquire_selector(
        self: &Arc<Self>,
    ) -> Result<(proto::TransactionSelector, Option<BeginSlot>), Error> {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.ended {
                    return Err(ended_error());
                }
                if let Some(id) = &state.id {
                    return Ok((id_selector(id.clone()), None));
                }
                let options = self.encode_options(&state);
                if !state.options.is_read_write() {
                    let selector = proto::TransactionSelector {
                        selector: Some(Selector::SingleUse(options)),
                    };
                    return Ok((selector, None));
                }
                match state.begin.try_acquire() {
                    Ok(()) => {
                        let selector = proto::TransactionSelector {
                            selector: Some(Selector::Begin(options)),
                        };
                        return Ok((selector, Some(BeginSlot::new(self.clone()))));
                    }
                    Err(waiter) => waiter,
                }
            };
            match waiter.await {
                Ok(Handoff::Id(id)) => return Ok((id_selector(id), None)),
                Ok(Handoff::TakeOver) => {
                    let options = self.encode_options(&self.state.lock());
                    let selector = proto::TransactionSelector {
                        selector: Some(Selector::Begin(options)),
                    };
                    return Ok((selector, Some(BeginSlot::new(self.clone()))));
                }
                Err(_) => continue,
            }
        }
    }

    /// Records a transaction returned by the server, releasing queued requests once its id
    /// is known.
    pub(crate) fn on_transaction(&self, transaction: proto::Transaction, slot: Option<BeginSlot>) {
        let has_id = {
            let mut state = self.state.lock();
            if state.read_timestamp.is_none() {
                state.read_timestamp = transaction.read_timestamp;
            }
            if let Some(token) = transaction.precommit_token {
                state.update_precommit_token(token);
            }
            if !transaction.id.is_empty() && state.id.is_none() {
                state.begin.resolve(&transaction.id);
                state.id = Some(transaction.id);
            }
            state.id.is_some()
        };
        if let Some(mut slot) = slot {
            if has_id {
                slot.disarm();
            }
        }
    }

    /// Begins the transaction with an explicit `BeginTransaction`, unless it already has an
    /// id or another request is beginning it.
    pub(crate) async fn begin(self: &Arc<Self>) -> Result<Vec<u8>, Error> {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.ended {
                    return Err(ended_error());
                }
                if let Some(id) = &state.id {
                    return Ok(id.clone());
                }
                match state.begin.try_acquire() {
                    Ok(()) => None,
                    Err(waiter) => Some(waiter),
                }
            };
            match waiter {
                None => return self.begin_with(BeginSlot::new(self.clone())).await,
                Some(waiter) => match waiter.await {
                    Ok(Handoff::Id(id)) => return Ok(id),
                    Ok(Handoff::TakeOver) => {
                        return self.begin_with(BeginSlot::new(self.clone())).await
                    }
                    Err(_) => continue,
                },
            }
        }
    }

    pub(crate) async fn begin_with(self: &Arc<Self>, slot: BeginSlot) -> Result<Vec<u8>, Error> {
        let mut span = self.span("CloudSpanner.Snapshot.begin");
        span.add_event("Begin Transaction");
        let request = {
            let state = self.state.lock();
            proto::BeginTransactionRequest {
                session: self.session.name().to_string(),
                options: Some(self.encode_options(&state)),
                request_options: self.request_options(&state, None),
                mutation_key: state.mutation_key.clone(),
            }
        };

        let result = match self.session.begin_transaction(request).await {
            Ok(transaction) if transaction.id.is_empty() => Err(Error::Codec(
                "BeginTransaction returned no transaction id".to_string(),
            )),
            other => other,
        };
        match result {
            Ok(transaction) => {
                let id = transaction.id.clone();
                self.on_transaction(transaction, Some(slot));
                span.add_event("Transaction Creation Done");
                Ok(id)
            }
            Err(error) => {
                drop(slot);
                span.set_error(&error);
                Err(error)
            }
        }
    }

    pub(crate) fn run_stream(self: &Arc<Self>, statement: Statement) -> RowStream {
        let request = {
            let state = self.state.lock();
            let (params, param_types) = statement.encode_params();
            proto::ExecuteSqlRequest {
                session: self.session.name().to_string(),
                sql: statement.sql.clone(),
                params: Some(params),
                param_types,
                query_options: statement
                    .query_options
                    .as_ref()
                    .or(self.settings.query_options.as_ref())
                    .map(Into::into),
                request_options: self.request_options(&state, statement.request_options.as_ref()),
                directed_read_options: self
                    .directed_read(&state, statement.directed_read_options.as_ref()),
                ..Default::default()
            }
        };
        self.stream(Target::Sql(request), "CloudSpanner.Snapshot.runStream")
    }

    pub(crate) fn read_stream(self: &Arc<Self>, table: &str, request: ReadRequest) -> RowStream {
        let request = {
            let state = self.state.lock();
            proto::ReadRequest {
                session: self.session.name().to_string(),
                table: table.to_string(),
                index: request.index.clone().unwrap_or_default(),
                columns: request.columns.clone(),
                key_set: Some(request.key_set.clone().into()),
                limit: request.limit.unwrap_or(0),
                request_options: self.request_options(&state, request.request_options.as_ref()),
                directed_read_options: self
                    .directed_read(&state, request.directed_read_options.as_ref()),
                ..Default::default()
            }
        };
        self.stream(Target::Read(request), "CloudSpanner.Snapshot.createReadStream")
    }

    pub(crate) async fn run(self: &Arc<Self>, statement: Statement) -> Result<ResultSet, Error> {
        let mut span = self.span("CloudSpanner.Snapshot.run");
        let result = self.run_stream(statement).collect_result_set().await;
        if let Err(error) = &result {
            span.set_error(error);
        }
        result
    }

    pub(crate) async fn read(
        self: &Arc<Self>,
        table: &str,
        request: ReadRequest,
    ) -> Result<ResultSet, Error> {
        let mut span = self.span("CloudSpanner.Snapshot.read");
        let result = self.read_stream(table, request).collect_result_set().await;
        if let Err(error) = &result {
            span.set_error(error);
        }
        result
    }

    pub(crate) async fn run_update(self: &Arc<Self>, statement: Statement) -> Result<i64, Error> {
        let result_set = self.run(statement).await?;
        result_set
            .row_count()
            .ok_or_else(|| Error::Codec("DML result carries no row count".to_string()))
    }

    fn stream(self: &Arc<Self>, target: Target, span_name: &str) -> RowStream {
        let summary = Arc::new(Mutex::new(StreamSummary::default()));
        let state = RowStreamState {
            core: self.clone(),
            target: Some(target),
            results: None,
            slot: None,
            decoder: None,
            received_data: false,
            summary: summary.clone(),
            span: self.span(span_name),
            done: false,
        };
        let rows = futures::stream::unfold(state, RowStreamState::step).boxed();
        RowStream::new(rows, summary)
    }

    /// Applies the stream error policy: a runner transaction that has not begun yet and
    /// received nothing begins explicitly so that queued requests can proceed.
    pub(crate) async fn on_request_error(
        self: &Arc<Self>,
        error: &Error,
        slot: Option<BeginSlot>,
        received_data: bool,
        span: &mut Span,
    ) {
        self.session.observe(error);
        let site = RetrySite::Stream {
            received_data,
            has_id: self.id().is_some(),
            in_runner: self.in_runner(),
        };
        match retry_decision(site, error) {
            RetryDecision::BeginThenSurface => {
                span.add_event("Stream broken. Safe to retry");
                let begun = match slot {
                    Some(slot) => self.begin_with(slot).await,
                    None => self.begin().await,
                };
                if let Err(begin_error) = begun {
                    tracing::debug!(error = %begin_error, "explicit begin after a broken stream failed");
                }
            }
            _ => drop(slot),
        }
    }
}

impl Drop for TransactionCore {
    fn drop(&mut self) {
        self.end();
    }
}

#[derive(Clone)]
enum Target {
    Sql(proto::ExecuteSqlRequest),
    Read(proto::ReadRequest),
}

impl Target {
    fn selector_mut(&mut self) -> &mut Option<proto::TransactionSelector> {
        match self {
            Target::Sql(request) => &mut request.transaction,
            Target::Read(request) => &mut request.transaction,
        }
    }

    fn set_resume_token(&mut self, token: Vec<u8>) {
        match self {
            Target::Sql(request) => request.resume_token = token,
            Target::Read(request) => request.resume_token = token,
        }
    }
}

struct RowStreamState {
    core: Arc<TransactionCore>,
    target: Option<Target>,
    results: Option<PartialResultStream>,
    slot: Option<BeginSlot>,
    decoder: Option<RowDecoder>,
    received_data: bool,
    summary: Arc<Mutex<StreamSummary>>,
    span: Span,
    done: bool,
}

impl RowStreamState {
    async fn step(mut self) -> Option<(Result<Row, Error>, Self)> {
        if self.done {
            return None;
        }
        if self.results.is_none() {
            if let Err(error) = self.open().await {
                return Some((Err(self.fail(error).await), self));
            }
        }
        loop {
            let event = match self.results.as_mut() {
                Some(results) => results.next_event().await,
                None => None,
            };
            match event {
                Some(Ok(Event::Metadata(metadata))) => {
                    if let Some(transaction) = metadata.transaction {
                        self.core.on_transaction(transaction, self.slot.take());
                    }
                    if let Some(row_type) = metadata.row_type {
                        match StructType::try_from(&row_type) {
                            Ok(row_type) => {
                                let decoder = RowDecoder::new(row_type);
                                self.summary.lock().row_type = Some(decoder.row_type());
                                self.decoder = Some(decoder);
                            }
                            Err(error) => return Some((Err(self.fail(error).await), self)),
                        }
                    }
                }
                Some(Ok(Event::Row(values))) => {
                    self.received_data = true;
                    let row = match &self.decoder {
                        Some(decoder) => decoder.decode(values),
                        None => Err(Error::Codec("row received before metadata".to_string())),
                    };
                    return match row {
                        Ok(row) => Some((Ok(row), self)),
                        Err(error) => Some((Err(self.fail(error).await), self)),
                    };
                }
                Some(Ok(Event::Stats(stats))) => {
                    self.summary.lock().stats = Some(stats.into());
                }
                Some(Ok(Event::PrecommitToken(token))) => {
                    self.core.update_precommit_token(token);
                }
                Some(Err(error)) => return Some((Err(self.fail(error).await), self)),
                None => {
                    self.done = true;
                    drop(self.slot.take());
                    return None;
                }
            }
        }
    }

    async fn open(&mut self) -> Result<(), Error> {
        let (selector, slot) = self.core.acquire_selector().await?;
        self.slot = slot;
        let mut target = self
            .target
            .take()
            .ok_or_else(|| Error::Client("stream opened twice".to_string()))?;
        let begins = matches!(selector.selector, Some(Selector::Begin(_)));
        *target.selector_mut() = Some(selector);
        if let Target::Sql(request) = &mut target {
            request.seqno = self.core.next_seqno();
        }

        let core = self.core.clone();
        let resume: Resume = Box::new(move |token| {
            let mut request = target.clone();
            request.set_resume_token(token);
            // A resumed request must not begin a transaction the first attempt already began.
            if begins {
                if let Some(id) = core.id() {
                    *request.selector_mut() = Some(id_selector(id));
                }
            }
            let session = core.session.clone();
            Box::pin(async move {
                match request {
                    Target::Sql(request) => session.execute_streaming_sql(request).await,
                    Target::Read(request) => session.streaming_read(request).await,
                }
            })
        });
        self.results = Some(PartialResultStream::new(resume));
        Ok(())
    }

    async fn fail(&mut self, error: Error) -> Error {
        self.done = true;
        let slot = self.slot.take();
        self.core
            .on_request_error(&error, slot, self.received_data, &mut self.span)
            .await;
        self.span.set_error(&error);
        error
    }
}
