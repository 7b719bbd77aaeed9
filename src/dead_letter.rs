use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::DeadLetterConfig;
use crate::db::{DatabaseManager, DeadLetterEntry};
use crate::dispatch::Dispatcher;
use crate::telegram::TelegramSource;

/// Tracks permanently failed deliveries and re-drives them once their
/// backoff window has passed. Entries whose source post has since been
/// deleted are resolved without a send.
pub struct DeadLetterService {
    db: Arc<DatabaseManager>,
    max_retries: i32,
    retry_delay: Duration,
}

impl DeadLetterService {
    pub fn new(db: Arc<DatabaseManager>, config: &DeadLetterConfig) -> Self {
        Self {
            db,
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_mins * 60),
        }
    }

    /// Entries eligible for a retry right now, oldest failures first.
    pub async fn pending(&self, limit: i64) -> anyhow::Result<Vec<DeadLetterEntry>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retry_delay).unwrap_or(chrono::Duration::zero());
        let entries = self
            .db
            .dead_letter_store()
            .pending(self.max_retries, cutoff, limit)
            .await?;
        Ok(entries)
    }

    /// Re-attempt up to `limit` eligible entries through the normal
    /// dispatch path. Returns how many were resolved.
    pub async fn redrive(
        &self,
        dispatcher: &Dispatcher,
        source: &dyn TelegramSource,
        limit: i64,
    ) -> anyhow::Result<usize> {
        let entries = self.pending(limit).await?;
        if entries.is_empty() {
            return Ok(0);
        }
        info!("re-driving {} dead-lettered posts", entries.len());

        let mut resolved = 0;
        for entry in entries {
            let link = match self.db.link_store().link_by_id(entry.link_id).await? {
                Some(link) => link,
                None => {
                    // link was deleted, nothing left to deliver to
                    self.db.dead_letter_store().mark_resolved(entry.id).await?;
                    resolved += 1;
                    continue;
                }
            };

            let post = match source
                .post(link.telegram_chat_id, entry.source_post_id)
                .await
            {
                Ok(post) => post,
                Err(err) => {
                    warn!(
                        "fetching post {} from chat {} failed, keeping dead letter: {err}",
                        entry.source_post_id, link.telegram_chat_id
                    );
                    continue;
                }
            };

            let Some(post) = post else {
                debug!(
                    "post {} no longer exists in chat {}, resolving dead letter",
                    entry.source_post_id, link.telegram_chat_id
                );
                self.db.dead_letter_store().mark_resolved(entry.id).await?;
                resolved += 1;
                continue;
            };

            let delivered = dispatcher
                .dispatch(
                    post.chat_id,
                    post.id,
                    &post.payload,
                    Some(entry.link_id),
                )
                .await
                .unwrap_or(false);

            if delivered {
                self.db.dead_letter_store().mark_resolved(entry.id).await?;
                resolved += 1;
            } else {
                self.db.dead_letter_store().mark_retry(entry.id).await?;
            }
        }

        info!("dead letter re-drive resolved {resolved} entries");
        Ok(resolved)
    }
}
