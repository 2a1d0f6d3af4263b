use std::time::Duration;
use std::time::SystemTime;

use crate::proto::google::spanner::v1 as proto;

use proto::transaction_options as tx_options;

#[derive(Clone, Debug, PartialEq)]
pub enum TimestampBound {
    Strong,
    ReadTimestamp(SystemTime),
    MinReadTimestamp(SystemTime),
    ExactStaleness(Duration),
    MaxStaleness(Duration),
}

impl Default for TimestampBound {
    fn default() -> Self {
        TimestampBound::Strong
    }
}

impl From<TimestampBound> for tx_options::read_only::TimestampBound {
    fn from(value: TimestampBound) -> Self {
        use tx_options::read_only::TimestampBound as Bound;
        match value {
            TimestampBound::Strong => Bound::Strong(true),
            TimestampBound::ReadTimestamp(timestamp) => Bound::ReadTimestamp(timestamp.into()),
            TimestampBound::MinReadTimestamp(timestamp) => {
                Bound::MinReadTimestamp(timestamp.into())
            }
            TimestampBound::MaxStaleness(duration) => Bound::MaxStaleness(duration.into()),
            TimestampBound::ExactStaleness(duration) => Bound::ExactStaleness(duration.into()),
        }
    }
}

/// Isolation of a read-write transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Let the server decide (currently serializable).
    Unspecified,
    Serializable,
    RepeatableRead,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::Unspecified
    }
}

impl From<IsolationLevel> for tx_options::IsolationLevel {
    fn from(value: IsolationLevel) -> Self {
        match value {
            IsolationLevel::Unspecified => tx_options::IsolationLevel::Unspecified,
            IsolationLevel::Serializable => tx_options::IsolationLevel::Serializable,
            IsolationLevel::RepeatableRead => tx_options::IsolationLevel::RepeatableRead,
        }
    }
}

/// How a read-write transaction locks the rows it reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadLockMode {
    Unspecified,
    Pessimistic,
    Optimistic,
}

impl Default for ReadLockMode {
    fn default() -> Self {
        ReadLockMode::Unspecified
    }
}

impl From<ReadLockMode> for tx_options::read_write::ReadLockMode {
    fn from(value: ReadLockMode) -> Self {
        use tx_options::read_write::ReadLockMode as Mode;
        match value {
            ReadLockMode::Unspecified => Mode::Unspecified,
            ReadLockMode::Pessimistic => Mode::Pessimistic,
            ReadLockMode::Optimistic => Mode::Optimistic,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReadOnlyOptions {
    pub bound: TimestampBound,
    /// Ask the server for the timestamp the snapshot reads at.
    pub return_read_timestamp: bool,
}

impl Default for ReadOnlyOptions {
    fn default() -> Self {
        Self {
            bound: TimestampBound::Strong,
            return_read_timestamp: true,
        }
    }
}

impl From<TimestampBound> for ReadOnlyOptions {
    fn from(bound: TimestampBound) -> Self {
        Self {
            bound,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadWriteOptions {
    /// Falls back to the client's default isolation level when unset.
    pub isolation_level: Option<IsolationLevel>,
    pub read_lock_mode: ReadLockMode,
    pub exclude_txn_from_change_streams: bool,
    /// Id of the aborted attempt this transaction retries, on a multiplexed session.
    pub(crate) previous_transaction_id: Option<Vec<u8>>,
}

/// Options of [`crate::Client::partitioned_dml`] and [`crate::Client::run_partitioned_update`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartitionedDmlOptions {
    pub exclude_txn_from_change_streams: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransactionOptions {
    ReadOnly(ReadOnlyOptions),
    ReadWrite(ReadWriteOptions),
    PartitionedDml { exclude_txn_from_change_streams: bool },
}

impl TransactionOptions {
    pub(crate) fn partitioned_dml(options: &PartitionedDmlOptions) -> Self {
        TransactionOptions::PartitionedDml {
            exclude_txn_from_change_streams: options.exclude_txn_from_change_streams,
        }
    }

    pub(crate) fn is_read_only(&self) -> bool {
        matches!(self, TransactionOptions::ReadOnly(_))
    }

    pub(crate) fn is_read_write(&self) -> bool {
        matches!(self, TransactionOptions::ReadWrite(_))
    }

    pub(crate) fn encode(&self, default_isolation: IsolationLevel) -> proto::TransactionOptions {
        match self {
            TransactionOptions::ReadOnly(options) => proto::TransactionOptions {
                mode: Some(tx_options::Mode::ReadOnly(tx_options::ReadOnly {
                    return_read_timestamp: options.return_read_timestamp,
                    timestamp_bound: Some(options.bound.clone().into()),
                })),
                ..Default::default()
            },
            TransactionOptions::ReadWrite(options) => proto::TransactionOptions {
                mode: Some(tx_options::Mode::ReadWrite(tx_options::ReadWrite {
                    read_lock_mode: tx_options::read_write::ReadLockMode::from(
                        options.read_lock_mode,
                    ) as i32,
                    multiplexed_session_previous_transaction_id: options
                        .previous_transaction_id
                        .clone()
                        .unwrap_or_default(),
                })),
                exclude_txn_from_change_streams: options.exclude_txn_from_change_streams,
                isolation_level: tx_options::IsolationLevel::from(
                    options.isolation_level.unwrap_or(default_isolation),
                ) as i32,
            },
            TransactionOptions::PartitionedDml {
                exclude_txn_from_change_streams,
            } => proto::TransactionOptions {
                mode: Some(tx_options::Mode::PartitionedDml(
                    tx_options::PartitionedDml {},
                )),
                exclude_txn_from_change_streams: *exclude_txn_from_change_streams,
                ..Default::default()
            },
        }
    }
}

/// Type of replica a directed read may be routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaType {
    ReadWrite,
    ReadOnly,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplicaSelection {
    pub location: Option<String>,
    pub replica_type: Option<ReplicaType>,
}

/// Routes read-only requests to, or away from, particular replicas.
#[derive(Clone, Debug, PartialEq)]
pub enum DirectedReadOptions {
    Include {
        replicas: Vec<ReplicaSelection>,
        auto_failover_disabled: bool,
    },
    Exclude {
        replicas: Vec<ReplicaSelection>,
    },
}

impl From<&ReplicaSelection> for proto::directed_read_options::ReplicaSelection {
    fn from(value: &ReplicaSelection) -> Self {
        use proto::directed_read_options::replica_selection::Type;
        Self {
            location: value.location.clone().unwrap_or_default(),
            r#type: match value.replica_type {
                None => Type::Unspecified,
                Some(ReplicaType::ReadWrite) => Type::ReadWrite,
                Some(ReplicaType::ReadOnly) => Type::ReadOnly,
            } as i32,
        }
    }
}

impl From<&DirectedReadOptions> for proto::DirectedReadOptions {
    fn from(value: &DirectedReadOptions) -> Self {
        use proto::directed_read_options::{ExcludeReplicas, IncludeReplicas, Replicas};
        let replicas = match value {
            DirectedReadOptions::Include {
                replicas,
                auto_failover_disabled,
            } => Replicas::IncludeReplicas(IncludeReplicas {
                replica_selections: replicas.iter().map(Into::into).collect(),
                auto_failover_disabled: *auto_failover_disabled,
            }),
            DirectedReadOptions::Exclude { replicas } => {
                Replicas::ExcludeReplicas(ExcludeReplicas {
                    replica_selections: replicas.iter().map(Into::into).collect(),
                })
            }
        };
        proto::DirectedReadOptions {
            replicas: Some(replicas),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_read_write_falls_back_to_default_isolation() {
        let options = TransactionOptions::ReadWrite(ReadWriteOptions {
            read_lock_mode: ReadLockMode::Optimistic,
            ..Default::default()
        });
        let encoded = options.encode(IsolationLevel::RepeatableRead);
        assert_eq!(
            encoded.isolation_level,
            tx_options::IsolationLevel::RepeatableRead as i32
        );
        match encoded.mode {
            Some(tx_options::Mode::ReadWrite(rw)) => assert_eq!(
                rw.read_lock_mode,
                tx_options::read_write::ReadLockMode::Optimistic as i32
            ),
            other => panic!("unexpected mode {:?}", other),
        }

        let options = TransactionOptions::ReadWrite(ReadWriteOptions {
            isolation_level: Some(IsolationLevel::Serializable),
            ..Default::default()
        });
        assert_eq!(
            options.encode(IsolationLevel::RepeatableRead).isolation_level,
            tx_options::IsolationLevel::Serializable as i32
        );
    }

    #[test]
    fn test_read_only_returns_read_timestamp_by_default() {
        let encoded = TransactionOptions::ReadOnly(TimestampBound::Strong.into())
            .encode(IsolationLevel::Unspecified);
        match encoded.mode {
            Some(tx_options::Mode::ReadOnly(ro)) => {
                assert!(ro.return_read_timestamp);
                assert_eq!(
                    ro.timestamp_bound,
                    Some(tx_options::read_only::TimestampBound::Strong(true))
                );
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }
}
