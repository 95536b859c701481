use std::{
    cmp::{Ordering, Reverse},
    collections::{binary_heap::PeekMut, BinaryHeap},
};

use tracing::{debug, trace, warn};

use super::{ClientId, Epoch};

/// What happened to a submitted command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Executed immediately, followed by `drained` buffered successors.
    Ready { drained: usize },
    /// Held until every earlier epoch of the same client has executed.
    Buffered,
    /// Already executed. Dropped without effect.
    Stale,
}

/// A command waiting for its turn, ordered by epoch only.
struct Pending<T> {
    epoch: Epoch,
    command: T,
}

impl<T> PartialEq for Pending<T> {
    fn eq(&self, other: &Self) -> bool {
        self.epoch == other.epoch
    }
}

impl<T> Eq for Pending<T> {}

impl<T> PartialOrd for Pending<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Pending<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch.cmp(&other.epoch)
    }
}

struct ClientQueue<T> {
    expected: Epoch,
    pending: BinaryHeap<Reverse<Pending<T>>>,
}

impl<T> ClientQueue<T> {
    fn new() -> Self {
        Self {
            expected: 0,
            pending: BinaryHeap::new(),
        }
    }
}

/// Turns an at-least-once, any-order stream of commands into exactly-once,
/// in-order execution for each client. Every client id has its own epoch
/// counter, so a gap in one client's sequence never holds back another
/// client.
///
/// There is no timeout: if an epoch never arrives, everything after it stays
/// buffered until the client id is reset.
pub struct ReorderBuffer<T> {
    clients: Vec<ClientQueue<T>>,
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            clients: (0..=ClientId::MAX).map(|_| ClientQueue::new()).collect(),
        }
    }

    /// Executes `command` if `epoch` is the next one expected from `client`,
    /// then drains any buffered commands that became ready. Later epochs are
    /// buffered, earlier ones are dropped.
    ///
    /// The epoch counter advances once per executed command whatever
    /// `execute` does with it, so a failing command never blocks its
    /// successors.
    pub fn submit<F>(
        &mut self,
        client: ClientId,
        epoch: Epoch,
        command: T,
        mut execute: F,
    ) -> Admission
    where
        F: FnMut(Epoch, T),
    {
        let queue = &mut self.clients[client as usize];

        match epoch.cmp(&queue.expected) {
            Ordering::Less => {
                trace!(client, epoch, expected = queue.expected, "dropping stale command");
                return Admission::Stale;
            }
            Ordering::Greater => {
                queue.pending.push(Reverse(Pending { epoch, command }));
                debug!(
                    client,
                    epoch,
                    expected = queue.expected,
                    buffered = queue.pending.len(),
                    "buffering out-of-order command"
                );
                return Admission::Buffered;
            }
            Ordering::Equal => {}
        }

        execute(epoch, command);
        queue.expected += 1;

        let mut drained = 0;
        while let Some(top) = queue.pending.peek_mut() {
            if top.0.epoch > queue.expected {
                break;
            }
            let Reverse(Pending { epoch, command }) = PeekMut::pop(top);
            if epoch < queue.expected {
                // a duplicate delivered while the original was still buffered
                trace!(client, epoch, "dropping duplicate buffered command");
                continue;
            }
            execute(epoch, command);
            queue.expected += 1;
            drained += 1;
        }

        if drained > 0 {
            trace!(client, drained, expected = queue.expected, "drained buffered commands");
        }
        Admission::Ready { drained }
    }

    /// Starts `client` over at epoch 0, discarding anything it left buffered.
    /// Returns the number of discarded commands.
    pub fn reset(&mut self, client: ClientId) -> usize {
        let queue = &mut self.clients[client as usize];
        let discarded = queue.pending.len();
        if discarded > 0 {
            warn!(
                client,
                discarded,
                expected = queue.expected,
                "discarding commands that never became ready"
            );
        }
        *queue = ClientQueue::new();
        discarded
    }

    pub fn expected(&self, client: ClientId) -> Epoch {
        self.clients[client as usize].expected
    }

    pub fn buffered(&self, client: ClientId) -> usize {
        self.clients[client as usize].pending.len()
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
