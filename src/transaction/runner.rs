use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use rand::Rng;
use tonic::Status;

use super::base::{TransactionCore, TransactionSettings};
use super::options::{ReadWriteOptions, TransactionOptions};
use super::read_write::{CommitOptions, Transaction};
use super::ReadContext;
use crate::error::{retry_decision, RetryDecision, RetrySite};
use crate::session::{SessionLease, SessionSource};
use crate::Error;

const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Delay before retry number `retries` (starting at 0) when the server did not ask for one.
fn backoff(retries: u32) -> Duration {
    let base = Duration::from_secs(1 << retries.min(MAX_BACKOFF_EXPONENT));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
    base + jitter
}

fn retry_delay(error: &Error, retries: u32) -> Duration {
    if let Some(delay) = error.retry_delay() {
        return delay;
    }
    if error.is_session_not_found() {
        return Duration::ZERO;
    }
    backoff(retries)
}

/// The retry loop shared by both runners.
struct Retrying {
    sessions: Arc<dyn SessionSource>,
    settings: Arc<TransactionSettings>,
    deadline: Duration,
    options: ReadWriteOptions,
}

impl Retrying {
    fn transaction(&self, lease: &SessionLease, previous_transaction_id: Option<Vec<u8>>) -> Transaction {
        let options = ReadWriteOptions {
            previous_transaction_id,
            ..self.options.clone()
        };
        let transaction = Transaction::new(TransactionCore::new(
            lease.session().clone(),
            self.settings.clone(),
            TransactionOptions::ReadWrite(options),
        ));
        transaction.use_in_runner();
        transaction
    }

    async fn run<T, F>(&self, mut work: F, commit: bool) -> Result<T, Error>
    where
        F: FnMut(Transaction) -> BoxFuture<'static, Result<T, Error>> + Send,
        T: Send,
    {
        let started = Instant::now();
        let mut lease = self.sessions.get_session_for_read_write().await?;
        let mut previous_transaction_id = None;
        let mut retries = 0;

        loop {
            let transaction = self.transaction(&lease, previous_transaction_id.take());
            let result = match work(transaction.clone()).await {
                Ok(value) if commit => transaction
                    .commit(CommitOptions::default())
                    .await
                    .map(|_| value),
                other => other,
            };
            let error = match result {
                Ok(value) => {
                    self.sessions.release(lease);
                    return Ok(value);
                }
                Err(error) => error,
            };

            let multiplexed = lease.session().is_multiplexed();
            let decision = retry_decision(RetrySite::Runner { multiplexed }, &error);
            if decision == RetryDecision::Surface {
                if transaction.id().is_some() && !transaction.ended() {
                    if let Err(rollback_error) = transaction.rollback().await {
                        tracing::warn!(error = %rollback_error, "failed to roll back transaction");
                    }
                }
                transaction.end();
                self.sessions.release(lease);
                return Err(error);
            }

            if started.elapsed() >= self.deadline {
                transaction.end();
                self.sessions.release(lease);
                return Err(Error::Status(Status::deadline_exceeded(format!(
                    "Deadline for Transaction exceeded. - {}",
                    error.message()
                ))));
            }

            let delay = retry_delay(&error, retries);
            retries += 1;
            tracing::debug!(attempt = retries, ?delay, error = %error, "retrying transaction");
            if multiplexed {
                previous_transaction_id = transaction.id();
            }
            transaction.end();
            if decision == RetryDecision::RetryWithNewSession {
                self.sessions.release(lease);
                lease = self.sessions.get_session_for_read_write().await?;
            }
            tokio::time::sleep(delay).await;
        }
    }
}

/// Runs a function in a read-write transaction and commits it, retrying the whole
/// function when the transaction aborts.
///
/// ```no_run
/// # use spanner_txn::*;
/// # async fn f(client: Client) -> Result<(), Error> {
/// client
///     .read_write()
///     .run(|tx| {
///         // this closure may be invoked more than once
///         Box::pin(async move {
///             let rs = tx.run(Statement::new("SELECT COUNT(*) FROM person")).await?;
///             tx.run_update(Statement::new("UPDATE person SET visits = visits + 1")).await?;
///             Ok(rs.len())
///         })
///     })
///     .await?;
/// # Ok(()) }
/// ```
pub struct TransactionRunner {
    retrying: Retrying,
}

impl TransactionRunner {
    pub(crate) fn new(
        sessions: Arc<dyn SessionSource>,
        settings: Arc<TransactionSettings>,
        deadline: Duration,
    ) -> Self {
        Self {
            retrying: Retrying {
                sessions,
                settings,
                deadline,
                options: ReadWriteOptions::default(),
            },
        }
    }

    pub fn options(mut self, options: ReadWriteOptions) -> Self {
        self.retrying.options = options;
        self
    }

    /// Stop retrying once this much time has passed since the first attempt.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.retrying.deadline = deadline;
        self
    }

    pub async fn run<T, F>(&self, work: F) -> Result<T, Error>
    where
        F: FnMut(Transaction) -> BoxFuture<'static, Result<T, Error>> + Send,
        T: Send,
    {
        self.retrying.run(work, true).await
    }
}

/// Like [`TransactionRunner`], but the function commits the transaction itself.
pub struct AsyncTransactionRunner {
    retrying: Retrying,
}

impl AsyncTransactionRunner {
    pub(crate) fn new(
        sessions: Arc<dyn SessionSource>,
        settings: Arc<TransactionSettings>,
        deadline: Duration,
    ) -> Self {
        Self {
            retrying: Retrying {
                sessions,
                settings,
                deadline,
                options: ReadWriteOptions::default(),
            },
        }
    }

    pub fn options(mut self, options: ReadWriteOptions) -> Self {
        self.retrying.options = options;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.retrying.deadline = deadline;
        self
    }

    pub async fn run<T, F>(&self, work: F) -> Result<T, Error>
    where
        F: FnMut(Transaction) -> BoxFuture<'static, Result<T, Error>> + Send,
        T: Send,
    {
        self.retrying.run(work, false).await
    }
}
