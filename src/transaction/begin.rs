use std::collections::VecDeque;

use tokio::sync::oneshot;

/// What a queued request receives once the transaction it waits on is settled.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Handoff {
    /// The transaction has begun; use this id.
    Id(Vec<u8>),
    /// The previous attempt to begin failed without an id; this request begins instead.
    TakeOver,
}

/// Serializes inline begins of one transaction.
///
/// At most one request carries a `begin` selector at a time. Requests arriving meanwhile
/// wait in FIFO order and are released together once an id is known. When the request in
/// flight fails without producing an id, only the oldest waiter is released, to begin in
/// its place.
#[derive(Debug, Default)]
pub(crate) struct BeginQueue {
    in_flight: bool,
    waiters: VecDeque<oneshot::Sender<Handoff>>,
}

impl BeginQueue {
    /// Takes the begin slot, or returns a receiver to wait on when it is taken.
    pub(crate) fn try_acquire(&mut self) -> Result<(), oneshot::Receiver<Handoff>> {
        if !self.in_flight {
            self.in_flight = true;
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(tx);
        Err(rx)
    }

    /// Releases every waiter, in arrival order, with the transaction id.
    pub(crate) fn resolve(&mut self, id: &[u8]) {
        self.in_flight = false;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Handoff::Id(id.to_vec()));
        }
    }

    /// Passes the slot to the oldest waiter still listening, or frees it.
    pub(crate) fn hand_off(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(Handoff::TakeOver).is_ok() {
                return;
            }
        }
        self.in_flight = false;
    }

    /// Drops all waiters; they observe a closed channel.
    pub(crate) fn close(&mut self) {
        self.in_flight = false;
        self.waiters.clear();
    }

    pub(crate) fn waiting(&self) -> usize {
        self.waiters.len()
    }
}
