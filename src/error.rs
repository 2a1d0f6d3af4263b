use std::time::Duration;

use bb8::RunError;
use prost::Message;
use tonic::{Code, Status};

use crate::proto::google::rpc::RetryInfo;

const RETRY_INFO_KEY: &str = "google.rpc.retryinfo-bin";
const SESSION_NOT_FOUND: &str = "Session not found";
const UNEXPECTED_EOS: &str = "Received unexpected EOS on DATA frame from server";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("spanner client error: {0}")]
    Client(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("authentication error: {0}")]
    Auth(#[from] gcp_auth::Error),

    #[error("unexpected gRPC status: {0}")]
    Status(#[from] tonic::Status),

    /// A batch of DML statements failed part way through.
    ///
    /// `row_counts` holds the affected row count of every statement that succeeded before the
    /// failing one, in statement order.
    #[error("batch update failed after {} statement(s): {status}", .row_counts.len())]
    BatchUpdate { status: Status, row_counts: Vec<i64> },
}

impl Error {
    /// The gRPC code equivalent of this error.
    pub fn code(&self) -> Code {
        match self {
            Error::Status(status) | Error::BatchUpdate { status, .. } => status.code(),
            Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::TransportError(_) => Code::Unavailable,
            Error::Auth(_) => Code::Unauthenticated,
            Error::Config(_) => Code::FailedPrecondition,
            Error::Client(_) | Error::Codec(_) => Code::Internal,
        }
    }

    pub fn status(&self) -> Option<&Status> {
        match self {
            Error::Status(status) | Error::BatchUpdate { status, .. } => Some(status),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self.status() {
            Some(status) => status.message().to_string(),
            None => self.to_string(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.code() == Code::Aborted
    }

    pub fn is_session_not_found(&self) -> bool {
        self.code() == Code::NotFound && self.message().contains(SESSION_NOT_FOUND)
    }

    pub(crate) fn is_unexpected_eos(&self) -> bool {
        self.code() == Code::Unknown && self.message().contains(UNEXPECTED_EOS)
    }

    /// The delay requested by the server through `google.rpc.RetryInfo`, if any.
    pub fn retry_delay(&self) -> Option<Duration> {
        let value = self.status()?.metadata().get_bin(RETRY_INFO_KEY)?;
        let bytes = value.to_bytes().ok()?;
        let delay = RetryInfo::decode(bytes).ok()?.retry_delay?;
        Some(Duration::new(
            u64::try_from(delay.seconds).unwrap_or(0),
            u32::try_from(delay.nanos).unwrap_or(0),
        ))
    }

    /// Returns a copy of this error whose message has `hint` appended.
    /// The code, details and metadata are preserved.
    pub(crate) fn with_appended_message(self, hint: &str) -> Self {
        let append = |status: Status| {
            Status::with_details_and_metadata(
                status.code(),
                format!("{}{}", status.message(), hint),
                prost::bytes::Bytes::copy_from_slice(status.details()),
                status.metadata().clone(),
            )
        };
        match self {
            Error::Status(status) => Error::Status(append(status)),
            Error::BatchUpdate { status, row_counts } => Error::BatchUpdate {
                status: append(status),
                row_counts,
            },
            other => other,
        }
    }
}

impl From<RunError<Error>> for Error {
    fn from(value: RunError<Error>) -> Self {
        match value {
            RunError::User(error) => error,
            RunError::TimedOut => Error::Client("timeout while obtaining new session".to_string()),
        }
    }
}

impl From<derive_builder::UninitializedFieldError> for Error {
    fn from(value: derive_builder::UninitializedFieldError) -> Self {
        Error::Config(value.to_string())
    }
}

/// The call sites that may retry after a failure, each with its own rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RetrySite {
    /// A query or read stream broke inside a transaction.
    Stream {
        received_data: bool,
        has_id: bool,
        in_runner: bool,
    },
    /// The runner decides whether to run the user function again.
    Runner { multiplexed: bool },
    /// Acquiring a session (and beginning on it) for a snapshot or transaction.
    Acquire { multiplexed: bool },
    /// A batch write stream broke.
    BatchWrite { received_data: bool },
}

/// What to do after a failure at a given [`RetrySite`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    Surface,
    /// Explicitly begin the transaction so queued requests can proceed, then surface.
    BeginThenSurface,
    Retry,
    /// Retry with a freshly acquired session.
    RetryWithNewSession,
}

/// Single place deciding how every retrying call site reacts to an error.
pub(crate) fn retry_decision(site: RetrySite, error: &Error) -> RetryDecision {
    match site {
        RetrySite::Stream {
            received_data,
            has_id,
            in_runner,
        } => {
            if !received_data && !has_id && in_runner && !error.is_aborted() {
                RetryDecision::BeginThenSurface
            } else {
                RetryDecision::Surface
            }
        }
        RetrySite::Runner { multiplexed } => {
            if error.is_aborted() || error.is_unexpected_eos() {
                RetryDecision::Retry
            } else if !multiplexed && error.is_session_not_found() {
                RetryDecision::RetryWithNewSession
            } else {
                RetryDecision::Surface
            }
        }
        RetrySite::Acquire { multiplexed } => {
            if !multiplexed && error.is_session_not_found() {
                RetryDecision::RetryWithNewSession
            } else {
                RetryDecision::Surface
            }
        }
        RetrySite::BatchWrite { received_data } => {
            if !received_data && error.is_session_not_found() {
                RetryDecision::RetryWithNewSession
            } else {
                RetryDecision::Surface
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tonic::metadata::MetadataValue;

    fn session_not_found() -> Error {
        Error::Status(Status::not_found(
            "Session not found: projects/p/instances/i/databases/d/sessions/s",
        ))
    }

    #[test]
    fn test_classification() {
        assert!(Error::Status(Status::aborted("aborted")).is_aborted());
        assert!(session_not_found().is_session_not_found());
        assert!(!Error::Status(Status::not_found("Table not found")).is_session_not_found());
        assert_eq!(
            Error::InvalidArgument("empty".to_string()).code(),
            Code::InvalidArgument
        );
    }

    #[test]
    fn test_retry_delay_from_metadata() {
        let info = RetryInfo {
            retry_delay: Some(prost_types::Duration {
                seconds: 1,
                nanos: 500_000_000,
            }),
        };
        let mut status = Status::aborted("aborted");
        status.metadata_mut().insert_bin(
            RETRY_INFO_KEY,
            MetadataValue::from_bytes(&info.encode_to_vec()),
        );
        assert_eq!(
            Error::Status(status).retry_delay(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(Error::Status(Status::aborted("aborted")).retry_delay(), None);
    }

    #[test]
    fn test_appended_message_keeps_code() {
        let error = Error::Status(Status::failed_precondition("original"))
            .with_appended_message(" hint");
        assert_eq!(error.code(), Code::FailedPrecondition);
        assert_eq!(error.message(), "original hint");
    }

    #[test]
    fn test_stream_decision() {
        let unavailable = Error::Status(Status::unavailable("broken"));
        let stream = |received_data, has_id, in_runner| RetrySite::Stream {
            received_data,
            has_id,
            in_runner,
        };
        assert_eq!(
            retry_decision(stream(false, false, true), &unavailable),
            RetryDecision::BeginThenSurface
        );
        assert_eq!(
            retry_decision(stream(true, false, true), &unavailable),
            RetryDecision::Surface
        );
        assert_eq!(
            retry_decision(stream(false, true, true), &unavailable),
            RetryDecision::Surface
        );
        assert_eq!(
            retry_decision(stream(false, false, false), &unavailable),
            RetryDecision::Surface
        );
        assert_eq!(
            retry_decision(
                stream(false, false, true),
                &Error::Status(Status::aborted("aborted"))
            ),
            RetryDecision::Surface
        );
    }

    #[test]
    fn test_session_not_found_decisions() {
        let error = session_not_found();
        assert_eq!(
            retry_decision(RetrySite::Runner { multiplexed: false }, &error),
            RetryDecision::RetryWithNewSession
        );
        assert_eq!(
            retry_decision(RetrySite::Runner { multiplexed: true }, &error),
            RetryDecision::Surface
        );
        assert_eq!(
            retry_decision(RetrySite::Acquire { multiplexed: true }, &error),
            RetryDecision::Surface
        );
        assert_eq!(
            retry_decision(RetrySite::BatchWrite { received_data: false }, &error),
            RetryDecision::RetryWithNewSession
        );
        assert_eq!(
            retry_decision(RetrySite::BatchWrite { received_data: true }, &error),
            RetryDecision::Surface
        );
    }
}
