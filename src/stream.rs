//! Reassembly of `PartialResultSet` streams into rows.
//!
//! Values may be split across messages (`chunked_value`) and rows across values. Rows are
//! only released once a resume token covers them, so that a broken stream can be restarted
//! from the last token without yielding a row twice.

use std::collections::VecDeque;
use std::mem;

use futures::future::BoxFuture;
use futures::StreamExt;
use prost_types::value::Kind;
use tonic::Code;

use crate::connection::ResponseStream;
use crate::proto::google::spanner::v1 as proto;
use crate::Error;

const MAX_RESUMES: usize = 20;

/// Opens the stream again, starting after the given resume token.
pub(crate) type Resume = Box<
    dyn FnMut(Vec<u8>) -> BoxFuture<'static, Result<ResponseStream<proto::PartialResultSet>, Error>>
        + Send,
>;

#[derive(Debug)]
pub(crate) enum Event {
    Metadata(proto::ResultSetMetadata),
    Row(Vec<prost_types::Value>),
    Stats(proto::ResultSetStats),
    PrecommitToken(proto::MultiplexedSessionPrecommitToken),
}

#[derive(Clone, Default)]
struct Checkpoint {
    partial_row: Vec<prost_types::Value>,
    chunk: Option<prost_types::Value>,
}

pub(crate) struct PartialResultStream {
    resume: Resume,
    current: Option<ResponseStream<proto::PartialResultSet>>,
    resume_token: Vec<u8>,
    row_width: Option<usize>,
    partial_row: Vec<prost_types::Value>,
    chunk: Option<prost_types::Value>,
    checkpoint: Checkpoint,
    pending: VecDeque<Vec<prost_types::Value>>,
    events: VecDeque<Event>,
    released_rows: bool,
    resumes: usize,
    finished: bool,
}

impl PartialResultStream {
    pub(crate) fn new(resume: Resume) -> Self {
        Self {
            resume,
            current: None,
            resume_token: Vec::new(),
            row_width: None,
            partial_row: Vec::new(),
            chunk: None,
            checkpoint: Checkpoint::default(),
            pending: VecDeque::new(),
            events: VecDeque::new(),
            released_rows: false,
            resumes: 0,
            finished: false,
        }
    }

    pub(crate) async fn next_event(&mut self) -> Option<Result<Event, Error>> {
        loop {
            if let Some(event) = self.events.pop_front() {
                if matches!(event, Event::Row(_)) {
                    self.released_rows = true;
                }
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }

            if self.current.is_none() {
                match (self.resume)(self.resume_token.clone()).await {
                    Ok(stream) => self.current = Some(stream),
                    Err(error) => match self.restart_after(error) {
                        Ok(()) => continue,
                        Err(error) => return Some(Err(error)),
                    },
                }
            }
            let next = match self.current.as_mut() {
                Some(stream) => stream.next().await,
                None => continue,
            };

            match next {
                Some(Ok(message)) => {
                    if let Err(error) = self.accept(message) {
                        self.finished = true;
                        return Some(Err(error));
                    }
                }
                Some(Err(error)) => {
                    if let Err(error) = self.restart_after(error) {
                        return Some(Err(error));
                    }
                }
                None => {
                    self.finished = true;
                    if let Err(error) = self.flush() {
                        return Some(Err(error));
                    }
                }
            }
        }
    }

    /// Rewinds to the last resume token if the error allows it.
    fn restart_after(&mut self, error: Error) -> Result<(), Error> {
        let resumable = (!self.resume_token.is_empty() || !self.released_rows)
            && self.resumes < MAX_RESUMES
            && is_resumable(&error);
        if !resumable {
            self.finished = true;
            return Err(error);
        }
        self.resumes += 1;
        tracing::debug!(attempt = self.resumes, error = %error, "resuming result stream");
        self.current = None;
        self.pending.clear();
        let Checkpoint { partial_row, chunk } = self.checkpoint.clone();
        self.partial_row = partial_row;
        self.chunk = chunk;
        Ok(())
    }

    fn accept(&mut self, message: proto::PartialResultSet) -> Result<(), Error> {
        if let Some(metadata) = message.metadata {
            if self.row_width.is_none() {
                self.row_width = Some(
                    metadata
                        .row_type
                        .as_ref()
                        .map(|row_type| row_type.fields.len())
                        .unwrap_or(0),
                );
                self.events.push_back(Event::Metadata(metadata));
            }
        }
        if let Some(token) = message.precommit_token {
            self.events.push_back(Event::PrecommitToken(token));
        }

        let mut values = message.values.into_iter().peekable();
        while let Some(value) = values.next() {
            let value = match self.chunk.take() {
                Some(chunk) => merge(chunk, value)?,
                None => value,
            };
            if message.chunked_value && values.peek().is_none() {
                self.chunk = Some(value);
            } else {
                self.push_value(value);
            }
        }

        if !message.resume_token.is_empty() {
            self.resume_token = message.resume_token;
            self.checkpoint = Checkpoint {
                partial_row: self.partial_row.clone(),
                chunk: self.chunk.clone(),
            };
            self.release_pending();
        }
        if let Some(stats) = message.stats {
            self.release_pending();
            self.events.push_back(Event::Stats(stats));
        }
        Ok(())
    }

    fn push_value(&mut self, value: prost_types::Value) {
        let width = self.row_width.unwrap_or(0);
        if width == 0 {
            return;
        }
        self.partial_row.push(value);
        if self.partial_row.len() == width {
            self.pending.push_back(mem::take(&mut self.partial_row));
        }
    }

    fn release_pending(&mut self) {
        self.events
            .extend(self.pending.drain(..).map(Event::Row));
    }

    fn flush(&mut self) -> Result<(), Error> {
        if let Some(chunk) = self.chunk.take() {
            self.push_value(chunk);
        }
        self.release_pending();
        if !self.partial_row.is_empty() {
            return Err(Error::Codec(format!(
                "stream ended in the middle of a row ({} values left over)",
                self.partial_row.len()
            )));
        }
        Ok(())
    }
}

fn is_resumable(error: &Error) -> bool {
    match error.code() {
        Code::Unavailable => true,
        Code::Internal => {
            let message = error.message();
            message.contains("RST_STREAM") || message.contains("unexpected EOS")
        }
        _ => false,
    }
}

/// Merges a chunked value with the first value of the next message.
pub(crate) fn merge(
    head: prost_types::Value,
    tail: prost_types::Value,
) -> Result<prost_types::Value, Error> {
    let kind = match (head.kind, tail.kind) {
        (Some(Kind::StringValue(mut head)), Some(Kind::StringValue(tail))) => {
            head.push_str(&tail);
            Kind::StringValue(head)
        }
        (Some(Kind::ListValue(mut head)), Some(Kind::ListValue(tail))) => {
            let mut tail = tail.values.into_iter();
            match (head.values.pop(), tail.next()) {
                (Some(last), Some(first)) if can_merge(&last, &first) => {
                    head.values.push(merge(last, first)?);
                }
                (last, first) => {
                    head.values.extend(last);
                    head.values.extend(first);
                }
            }
            head.values.extend(tail);
            Kind::ListValue(head)
        }
        (head, tail) => {
            return Err(Error::Codec(format!(
                "cannot merge chunked values {:?} and {:?}",
                head, tail
            )))
        }
    };
    Ok(prost_types::Value { kind: Some(kind) })
}

fn can_merge(head: &prost_types::Value, tail: &prost_types::Value) -> bool {
    matches!(
        (&head.kind, &tail.kind),
        (Some(Kind::StringValue(_)), Some(Kind::StringValue(_)))
            | (Some(Kind::ListValue(_)), Some(Kind::ListValue(_)))
    )
}
