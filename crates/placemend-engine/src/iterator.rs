//! Lazy, bounded iteration over workloads across shards
//!
//! Shards are visited in ascending id order and each shard is read in pages of
//! at most `batch_size` workloads, in ascending creation order. Nothing is
//! persisted between runs: a new iterator always starts from the beginning of
//! every shard.
//!
//! `max_count` is a charge against the workloads the caller actually acts on.
//! Every workload handed out by [`ShardedInstanceIterator::next`] is charged;
//! the caller hands the charge back with [`ShardedInstanceIterator::release`]
//! when it decided there was nothing to do. Repeated bounded runs therefore
//! keep making progress past workloads that are already correct.

use placemend_core::{PageMarker, ShardId, Workload, WorkloadFilter};
use placemend_clients::WorkloadStore;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Pagination state for the shard currently being read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardCursor {
    pub shard: ShardId,
    /// Last creation-order position fetched
    pub marker: Option<PageMarker>,
    /// Workloads handed out from this shard
    pub consumed: usize,
    exhausted: bool,
}

impl ShardCursor {
    fn new(shard: ShardId) -> Self {
        Self {
            shard,
            marker: None,
            consumed: 0,
            exhausted: false,
        }
    }
}

pub struct ShardedInstanceIterator<'a> {
    store: &'a dyn WorkloadStore,
    shards: Vec<ShardId>,
    filter: WorkloadFilter,
    batch_size: usize,
    max_count: Option<usize>,
    next_shard: usize,
    cursor: Option<ShardCursor>,
    buffer: VecDeque<Workload>,
    charged: usize,
    unreachable: Vec<ShardId>,
}

impl<'a> ShardedInstanceIterator<'a> {
    pub fn new(
        store: &'a dyn WorkloadStore,
        mut shards: Vec<ShardId>,
        filter: WorkloadFilter,
        batch_size: usize,
        max_count: Option<usize>,
    ) -> Self {
        shards.sort();
        shards.dedup();
        Self {
            store,
            shards,
            filter,
            batch_size: batch_size.max(1),
            max_count,
            next_shard: 0,
            cursor: None,
            buffer: VecDeque::new(),
            charged: 0,
            unreachable: Vec::new(),
        }
    }

    /// Next workload, or `None` when every shard is exhausted or the limit
    /// has been reached
    pub async fn next(&mut self) -> Option<Workload> {
        if self.limit_reached() {
            return None;
        }
        if !self.fill().await {
            return None;
        }
        let workload = self.buffer.pop_front()?;
        self.charged += 1;
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.consumed += 1;
        }
        Some(workload)
    }

    /// Refund the charge of the last workload handed out
    pub fn release(&mut self) {
        self.charged = self.charged.saturating_sub(1);
    }

    /// Whether `max_count` workloads are currently charged
    pub fn limit_reached(&self) -> bool {
        self.max_count.map_or(false, |max| self.charged >= max)
    }

    /// Whether unconsumed workloads remain, regardless of the limit
    pub async fn has_more(&mut self) -> bool {
        self.fill().await
    }

    /// Workloads currently charged against `max_count`
    pub fn charged(&self) -> usize {
        self.charged
    }

    /// Shards that could not be read, in visiting order
    pub fn unreachable_shards(&self) -> &[ShardId] {
        &self.unreachable
    }

    pub fn cursor(&self) -> Option<&ShardCursor> {
        self.cursor.as_ref()
    }

    /// Make sure the buffer holds a workload, fetching pages and moving to the
    /// next shard as needed. Returns false once everything is exhausted.
    async fn fill(&mut self) -> bool {
        while self.buffer.is_empty() {
            let cursor = match self.cursor.as_mut() {
                Some(cursor) if !cursor.exhausted => cursor,
                _ => {
                    let Some(shard) = self.shards.get(self.next_shard).copied() else {
                        return false;
                    };
                    self.next_shard += 1;
                    debug!(shard = %shard, "Moving to shard");
                    self.cursor.insert(ShardCursor::new(shard))
                }
            };

            match self
                .store
                .list_workloads(cursor.shard, &self.filter, cursor.marker, self.batch_size)
                .await
            {
                Ok(page) => {
                    if let Some(last) = page.workloads.last() {
                        cursor.marker = Some(last.marker());
                    }
                    cursor.exhausted = page.next.is_none() || page.workloads.is_empty();
                    self.buffer.extend(page.workloads);
                }
                Err(e) => {
                    warn!(shard = %cursor.shard, error = %e, "Shard unreachable, skipping");
                    cursor.exhausted = true;
                    self.unreachable.push(cursor.shard);
                }
            }
        }
        true
    }
}
