use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::db::{DatabaseManager, DeliverySuccess};
use crate::max::{MaxApiError, MaxClient, SentMessage};
use crate::migration::queue::{MigrationQueue, QueuedPost};
use crate::resilience::{BreakerRegistry, CircuitBreakerError, RateLimiter, RetryPolicy};
use crate::telegram::{Post, PostPayload, album_from_parts};

pub use self::link_cache::LinkCache;
pub use self::media_group::{GroupSink, MediaGroupAggregator};
pub use self::outcome::{SendOutcome, SkipReason};

pub mod link_cache;
pub mod media_group;
pub mod outcome;

/// Fans one source post out to every destination channel linked to its
/// source chat: dedup check, pending record, guarded send, bookkeeping.
pub struct Dispatcher {
    db: Arc<DatabaseManager>,
    max_client: Arc<dyn MaxClient>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    link_cache: Arc<LinkCache>,
    migration_queue: Arc<MigrationQueue>,
    retry: RetryPolicy,
    send_timeout: Duration,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseManager>,
        max_client: Arc<dyn MaxClient>,
        limiter: Arc<RateLimiter>,
        breakers: Arc<BreakerRegistry>,
        link_cache: Arc<LinkCache>,
        migration_queue: Arc<MigrationQueue>,
        retry: RetryPolicy,
        send_timeout: Duration,
    ) -> Self {
        Self {
            db,
            max_client,
            limiter,
            breakers,
            link_cache,
            migration_queue,
            retry,
            send_timeout,
        }
    }

    pub fn migration_queue(&self) -> Arc<MigrationQueue> {
        self.migration_queue.clone()
    }

    pub fn link_cache(&self) -> Arc<LinkCache> {
        self.link_cache.clone()
    }

    /// Deliver one post to its linked channels. `scope` restricts delivery
    /// to a single link (migration and re-drive use this; scoped calls
    /// bypass the live-traffic queue and may target a disabled link).
    /// Returns whether at least one destination accepted the post.
    pub async fn dispatch(
        &self,
        source_chat_id: i64,
        source_post_id: i64,
        payload: &PostPayload,
        scope: Option<i64>,
    ) -> Result<bool> {
        if !payload.has_content() {
            debug!(
                "post {} in chat {} has no content, skipping",
                source_post_id, source_chat_id
            );
            return Ok(false);
        }

        let mut links = match scope {
            Some(link_id) => match self.db.link_store().link_by_id(link_id).await? {
                Some(link) => vec![link],
                None => {
                    warn!("dispatch scoped to unknown link {}", link_id);
                    return Ok(false);
                }
            },
            None => {
                let cached = self.link_cache.links_for_chat(source_chat_id).await?;
                cached.as_ref().clone()
            }
        };

        if scope.is_none() {
            // links mid-backfill get their live posts buffered instead
            links.retain(|link| {
                let queued = self.migration_queue.enqueue(
                    link.id,
                    QueuedPost {
                        source_chat_id,
                        source_post_id,
                        payload: payload.clone(),
                    },
                );
                if queued {
                    debug!(
                        "post {} queued behind migration of link {}",
                        source_post_id, link.id
                    );
                }
                !queued
            });
        }

        if links.is_empty() {
            return Ok(false);
        }

        let link_ids: Vec<i64> = links.iter().map(|l| l.id).collect();
        let delivered = self
            .db
            .delivery_store()
            .delivered_link_ids(&link_ids, source_post_id)
            .await?;
        links.retain(|link| !delivered.contains(&link.id));
        if links.is_empty() {
            debug!(
                "post {} already delivered to all links of chat {}",
                source_post_id, source_chat_id
            );
            return Ok(false);
        }

        let kind = payload.kind().as_str();
        let mut targets = Vec::with_capacity(links.len());
        for link in links {
            match self.ensure_pending(link.id, source_post_id, kind).await? {
                Some(record_id) => targets.push((link, record_id)),
                None => debug!(
                    "post {} already delivered through link {}",
                    source_post_id, link.id
                ),
            }
        }
        if targets.is_empty() {
            return Ok(false);
        }

        let sends = targets.iter().map(|(link, record_id)| async move {
            let outcome = self.send_payload_to_link(link, payload).await;
            (link, *record_id, outcome)
        });
        let results = join_all(sends).await;

        let mut successes = Vec::new();
        let mut any_success = false;
        for (link, record_id, outcome) in results {
            match outcome {
                SendOutcome::Delivered {
                    message_id,
                    latency_ms,
                } => {
                    info!(
                        "post {} delivered to channel {} as {} in {}ms",
                        source_post_id, link.max_channel_id, message_id, latency_ms
                    );
                    successes.push(DeliverySuccess {
                        record_id,
                        max_message_id: message_id,
                        latency_ms,
                        sent_at: Utc::now(),
                    });
                    any_success = true;
                }
                SendOutcome::Skipped(reason) => {
                    debug!(
                        "post {} skipped for link {}: {}",
                        source_post_id,
                        link.id,
                        reason.as_str()
                    );
                    self.db.delivery_store().delete_record(record_id).await?;
                }
                SendOutcome::Failed(reason) => {
                    warn!(
                        "post {} failed for channel {}: {}",
                        source_post_id, link.max_channel_id, reason
                    );
                    self.db
                        .delivery_store()
                        .mark_failed(record_id, &reason, None)
                        .await?;
                    self.db
                        .dead_letter_store()
                        .record_failure(link.id, source_post_id, &reason)
                        .await?;
                }
            }
        }

        if !successes.is_empty() {
            self.db.delivery_store().mark_delivered(&successes).await?;
        }

        Ok(any_success)
    }

    /// Pending record for this (link, post), reusing an earlier failed
    /// attempt's row when one exists. None means the post already went
    /// through.
    pub(crate) async fn ensure_pending(
        &self,
        link_id: i64,
        source_post_id: i64,
        kind: &str,
    ) -> Result<Option<i64>> {
        match self
            .db
            .delivery_store()
            .create_pending(link_id, source_post_id, kind)
            .await
        {
            Ok(record_id) => Ok(Some(record_id)),
            Err(create_err) => {
                match self
                    .db
                    .delivery_store()
                    .record_for(link_id, source_post_id)
                    .await?
                {
                    Some(record) if record.status == "success" => Ok(None),
                    Some(record) => Ok(Some(record.id)),
                    None => Err(create_err.into()),
                }
            }
        }
    }

    /// One guarded send: rate limiter, circuit breaker, timeout, retry.
    pub(crate) async fn send_payload_to_link(
        &self,
        link: &crate::db::Link,
        payload: &PostPayload,
    ) -> SendOutcome {
        if matches!(payload, PostPayload::Sticker { .. }) {
            return SendOutcome::Skipped(SkipReason::Unsupported);
        }

        let limiter_key = format!("max:{}", link.max_channel_id);
        let breaker = self.breakers.breaker_for("messages");
        let started = tokio::time::Instant::now();

        let limiter_key = &limiter_key;
        let breaker = &breaker;
        let result = self
            .retry
            .run(
                || async move {
                    self.limiter.wait_if_needed(limiter_key).await;
                    let call = breaker
                        .call(|| async move {
                            match tokio::time::timeout(
                                self.send_timeout,
                                self.send_once(&link.max_channel_id, payload),
                            )
                            .await
                            {
                                Ok(result) => result,
                                Err(_) => Err(MaxApiError::Timeout),
                            }
                        })
                        .await;
                    match call {
                        Ok(sent) => Ok(sent),
                        Err(CircuitBreakerError::Open) => Err(MaxApiError::CircuitOpen),
                        Err(CircuitBreakerError::Inner(err)) => Err(err),
                    }
                },
                MaxApiError::is_transient,
            )
            .await;

        match result {
            Ok(sent) => SendOutcome::Delivered {
                message_id: sent.message_id,
                latency_ms: started.elapsed().as_millis() as i64,
            },
            Err(err) => SendOutcome::from_error(&err),
        }
    }

    async fn send_once(
        &self,
        channel_id: &str,
        payload: &PostPayload,
    ) -> Result<SentMessage, MaxApiError> {
        match payload {
            PostPayload::Text { text } => self.max_client.send_text(channel_id, text).await,
            PostPayload::Photo { url, caption } => {
                self.max_client
                    .send_photo(channel_id, url, caption.as_deref())
                    .await
            }
            PostPayload::Video { url, caption } => {
                self.max_client
                    .send_video(channel_id, url, caption.as_deref())
                    .await
            }
            PostPayload::Document { url, caption } => {
                self.max_client
                    .send_document(channel_id, url, caption.as_deref())
                    .await
            }
            PostPayload::Album { parts, caption } => {
                let urls: Vec<String> = parts.iter().map(|p| p.url.clone()).collect();
                self.max_client
                    .send_album(channel_id, &urls, caption.as_deref())
                    .await
            }
            PostPayload::Sticker { .. } => {
                Err(MaxApiError::Unsupported("sticker".to_string()))
            }
        }
    }
}

#[async_trait]
impl GroupSink for Dispatcher {
    async fn deliver(&self, parts: Vec<Post>) {
        let Some(first) = parts.first() else {
            return;
        };
        let chat_id = first.chat_id;
        let post_id = first.id;

        let result = if parts.len() == 1 {
            let post = &parts[0];
            self.dispatch(post.chat_id, post.id, &post.payload, None)
                .await
        } else {
            match album_from_parts(&parts) {
                Some(album) => self.dispatch(chat_id, post_id, &album, None).await,
                None => {
                    debug!(
                        "media group of post {} had no sendable attachments",
                        post_id
                    );
                    return;
                }
            }
        };

        if let Err(err) = result {
            warn!("dispatch of post {} in chat {} failed: {:#}", post_id, chat_id, err);
        }
    }
}
