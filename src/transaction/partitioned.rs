use std::sync::Arc;

use async_trait::async_trait;

use super::base::TransactionCore;
use super::{Dml, ReadContext};
use crate::{Error, Statement};

/// Runs one DML statement as partitioned DML.
///
/// The transaction ends once the statement completes, successfully or not. It is never
/// retried here; see [`crate::Client::run_partitioned_update`].
#[derive(Clone, Debug)]
pub struct PartitionedDml {
    core: Arc<TransactionCore>,
}

impl PartitionedDml {
    pub(crate) fn new(core: Arc<TransactionCore>) -> Self {
        Self { core }
    }
}

impl ReadContext for PartitionedDml {
    fn core(&self) -> &Arc<TransactionCore> {
        &self.core
    }
}

#[async_trait]
impl Dml for PartitionedDml {
    /// Returns a lower bound of the number of modified rows.
    async fn run_update(&self, statement: Statement) -> Result<i64, Error> {
        let result = match self.core.begin().await {
            Ok(_) => self.core.run_update(statement).await,
            Err(error) => Err(error),
        };
        self.core.end();
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::mock::{selector_of, MockConnection, BEGUN_TRANSACTION_ID};
    use crate::proto::google::spanner::v1 as proto;
    use crate::trace::InMemoryTracer;
    use crate::transaction::base::test::{session, settings};
    use crate::TransactionOptions;
    use tonic::Status;

    fn partitioned(connection: &MockConnection) -> PartitionedDml {
        PartitionedDml::new(TransactionCore::new(
            session(connection, false),
            settings(&InMemoryTracer::new()),
            TransactionOptions::PartitionedDml {
                exclude_txn_from_change_streams: false,
            },
        ))
    }

    #[tokio::test]
    async fn test_run_update_begins_and_ends() {
        let connection = MockConnection::new();
        let dml = partitioned(&connection);
        assert_eq!(dml.run_update(Statement::new("DELETE FROM t WHERE true")).await.unwrap(), 1);
        assert!(dml.ended());

        let begin = &connection.begins()[0];
        assert!(matches!(
            begin.options.as_ref().and_then(|o| o.mode.as_ref()),
            Some(proto::transaction_options::Mode::PartitionedDml(_))
        ));
        assert_eq!(
            selector_of(&connection.queries()[0].transaction),
            Some(&proto::transaction_selector::Selector::Id(
                BEGUN_TRANSACTION_ID.to_vec()
            ))
        );
    }

    #[tokio::test]
    async fn test_failure_still_ends() {
        let connection = MockConnection::new();
        connection.fail_stream(crate::Error::Status(Status::aborted("aborted")));
        let dml = partitioned(&connection);
        let error = dml
            .run_update(Statement::new("DELETE FROM t WHERE true"))
            .await
            .unwrap_err();
        assert!(error.is_aborted());
        assert!(dml.ended());
    }
}
