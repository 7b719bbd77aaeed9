use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::debug;

use crate::telegram::PostPayload;

/// A live post that arrived for a link while its backfill was running.
#[derive(Debug, Clone)]
pub struct QueuedPost {
    pub source_chat_id: i64,
    pub source_post_id: i64,
    pub payload: PostPayload,
}

#[derive(Default)]
struct Inner {
    active: HashSet<i64>,
    queues: HashMap<i64, Vec<QueuedPost>>,
}

/// Tracks which links are mid-migration and buffers their live traffic so
/// backfill and live delivery never interleave. All operations are cheap
/// and synchronous under one mutex.
#[derive(Default)]
pub struct MigrationQueue {
    inner: Mutex<Inner>,
}

impl MigrationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when a migration for this link is already running.
    pub fn start_migration(&self, link_id: i64) -> bool {
        let mut inner = self.inner.lock();
        if !inner.active.insert(link_id) {
            return false;
        }
        inner.queues.entry(link_id).or_default();
        debug!("migration started for link {}", link_id);
        true
    }

    pub fn stop_migration(&self, link_id: i64) {
        self.inner.lock().active.remove(&link_id);
        debug!("migration stopped for link {}", link_id);
    }

    pub fn is_migrating(&self, link_id: i64) -> bool {
        self.inner.lock().active.contains(&link_id)
    }

    /// Buffer a live post. Returns false (post not queued) when the link is
    /// not migrating; the caller should deliver it directly.
    pub fn enqueue(&self, link_id: i64, post: QueuedPost) -> bool {
        let mut inner = self.inner.lock();
        if !inner.active.contains(&link_id) {
            return false;
        }
        inner.queues.entry(link_id).or_default().push(post);
        true
    }

    /// Take everything buffered for a link, in arrival order.
    pub fn drain(&self, link_id: i64) -> Vec<QueuedPost> {
        self.inner
            .lock()
            .queues
            .remove(&link_id)
            .unwrap_or_default()
    }

    pub fn queued_len(&self, link_id: i64) -> usize {
        self.inner
            .lock()
            .queues
            .get(&link_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}
