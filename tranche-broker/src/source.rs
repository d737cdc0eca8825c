//! Market data producers.
//!
//! Both polled replays and pushed channels look the same to the scheduler:
//! something it can drain without blocking.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tranche_core::MarketSnapshot;

/// Anything producing [`MarketSnapshot`]s.
pub trait SnapshotSource {
    /// Return the next available snapshot without blocking, or `None` when nothing is ready.
    fn next_snapshot(&mut self) -> Option<MarketSnapshot>;

    /// Whether the source will never produce another snapshot.
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// In-memory replay of recorded snapshots, yielded in insertion order.
#[derive(Clone, Debug, Default)]
pub struct ReplaySource {
    queue: VecDeque<MarketSnapshot>,
}

impl ReplaySource {
    pub fn new(snapshots: impl IntoIterator<Item = MarketSnapshot>) -> Self {
        Self {
            queue: snapshots.into_iter().collect(),
        }
    }

    pub fn push(&mut self, snapshot: MarketSnapshot) {
        self.queue.push_back(snapshot);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl SnapshotSource for ReplaySource {
    fn next_snapshot(&mut self) -> Option<MarketSnapshot> {
        self.queue.pop_front()
    }

    fn is_exhausted(&self) -> bool {
        self.queue.is_empty()
    }
}

impl SnapshotSource for mpsc::UnboundedReceiver<MarketSnapshot> {
    fn next_snapshot(&mut self) -> Option<MarketSnapshot> {
        self.try_recv().ok()
    }

    fn is_exhausted(&self) -> bool {
        self.is_closed() && self.is_empty()
    }
}

impl SnapshotSource for mpsc::Receiver<MarketSnapshot> {
    fn next_snapshot(&mut self) -> Option<MarketSnapshot> {
        self.try_recv().ok()
    }

    fn is_exhausted(&self) -> bool {
        self.is_closed() && self.is_empty()
    }
}
