use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::telegram::Post;

/// Receives a completed buffer: one part for standalone posts, all parts
/// for an album.
#[async_trait]
pub trait GroupSink: Send + Sync {
    async fn deliver(&self, parts: Vec<Post>);
}

struct GroupBuffer {
    parts: Vec<Post>,
    first_seen: Instant,
    generation: u64,
    timer: JoinHandle<()>,
}

struct Inner {
    sink: Arc<dyn GroupSink>,
    quiet_period: Duration,
    stale_after: Duration,
    groups: Mutex<HashMap<i64, GroupBuffer>>,
}

impl Inner {
    /// Take the buffer only if no part arrived after the timer asking for
    /// it was armed; a superseded timer must leave the parts in place for
    /// its successor.
    async fn flush_due(&self, group_id: i64, generation: u64) {
        let buffer = {
            let mut groups = self.groups.lock();
            match groups.get(&group_id) {
                Some(buffer) if buffer.generation == generation => groups.remove(&group_id),
                _ => None,
            }
        };
        let Some(buffer) = buffer else {
            return;
        };
        debug!(
            "media group {} flushed with {} parts",
            group_id,
            buffer.parts.len()
        );
        self.sink.deliver(buffer.parts).await;
    }
}

/// Debounces album parts: each new part of a media group restarts a quiet
/// timer, and the whole group is flushed once the timer fires. Posts with
/// no group id pass straight through.
#[derive(Clone)]
pub struct MediaGroupAggregator {
    inner: Arc<Inner>,
}

impl MediaGroupAggregator {
    pub fn new(sink: Arc<dyn GroupSink>, quiet_period: Duration, stale_after: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                quiet_period,
                stale_after,
                groups: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn submit(&self, post: Post) {
        let Some(group_id) = post.media_group_id else {
            self.inner.sink.deliver(vec![post]).await;
            return;
        };

        let mut groups = self.inner.groups.lock();
        match groups.get_mut(&group_id) {
            Some(buffer) => {
                buffer.timer.abort();
                buffer.parts.push(post);
                buffer.generation += 1;
                buffer.timer = self.spawn_flush_timer(group_id, buffer.generation);
                debug!(
                    "media group {} buffered part ({} so far)",
                    group_id,
                    buffer.parts.len()
                );
            }
            None => {
                let timer = self.spawn_flush_timer(group_id, 0);
                groups.insert(
                    group_id,
                    GroupBuffer {
                        parts: vec![post],
                        first_seen: Instant::now(),
                        generation: 0,
                        timer,
                    },
                );
                debug!("media group {} opened", group_id);
            }
        }
    }

    fn spawn_flush_timer(&self, group_id: i64, generation: u64) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.quiet_period).await;
            inner.flush_due(group_id, generation).await;
        })
    }

    /// Flush buffers whose timer never fired. Normally a no-op.
    pub async fn sweep_stale(&self) {
        let stale: Vec<(i64, Vec<Post>)> = {
            let mut groups = self.inner.groups.lock();
            let expired: Vec<i64> = groups
                .iter()
                .filter(|(_, buffer)| buffer.first_seen.elapsed() >= self.inner.stale_after)
                .map(|(id, _)| *id)
                .collect();
            expired
                .into_iter()
                .filter_map(|id| {
                    groups.remove(&id).map(|buffer| {
                        buffer.timer.abort();
                        (id, buffer.parts)
                    })
                })
                .collect()
        };

        for (group_id, parts) in stale {
            warn!(
                "media group {} went stale with {} parts, flushing",
                group_id,
                parts.len()
            );
            self.inner.sink.deliver(parts).await;
        }
    }

    pub async fn run_sweeper(&self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.sweep_stale().await;
        }
    }

    #[cfg(test)]
    fn buffered_groups(&self) -> usize {
        self.inner.groups.lock().len()
    }
}
