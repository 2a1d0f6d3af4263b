use std::sync::Arc;
use std::time::SystemTime;

use super::base::TransactionCore;
use super::ReadContext;

/// A read-only transaction.
///
/// Reads run as single-use transactions until [`ReadContext::begin`] is called; after that,
/// every read observes the same snapshot of the database.
#[derive(Clone, Debug)]
pub struct Snapshot {
    core: Arc<TransactionCore>,
}

impl Snapshot {
    pub(crate) fn new(core: Arc<TransactionCore>) -> Self {
        Self { core }
    }

    /// The timestamp this snapshot reads at, once it has begun.
    pub fn read_timestamp(&self) -> Option<SystemTime> {
        self.core.read_timestamp()
    }
}

impl ReadContext for Snapshot {
    fn core(&self) -> &Arc<TransactionCore> {
        &self.core
    }
}
