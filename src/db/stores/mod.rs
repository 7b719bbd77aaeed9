use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::DatabaseError;
use super::models::{
    DeadLetterEntry, DeliveredInsert, DeliveryRecord, DeliverySuccess, Link, NewLink,
};

#[async_trait]
pub trait LinkStore: Send + Sync {
    async fn link_by_id(&self, id: i64) -> Result<Option<Link>, DatabaseError>;
    async fn active_links_for_chat(&self, telegram_chat_id: i64)
    -> Result<Vec<Link>, DatabaseError>;
    async fn create_link(&self, link: &NewLink) -> Result<Link, DatabaseError>;
    async fn set_link_enabled(&self, id: i64, enabled: bool) -> Result<(), DatabaseError>;
    async fn delete_link(&self, id: i64) -> Result<(), DatabaseError>;
    async fn count_links(&self) -> Result<i64, DatabaseError>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert a pending record and return its id.
    async fn create_pending(
        &self,
        link_id: i64,
        source_post_id: i64,
        kind: &str,
    ) -> Result<i64, DatabaseError>;
    /// Which of the given links already delivered this post.
    async fn delivered_link_ids(
        &self,
        link_ids: &[i64],
        source_post_id: i64,
    ) -> Result<HashSet<i64>, DatabaseError>;
    /// All post ids ever delivered through a link.
    async fn delivered_post_ids(&self, link_id: i64) -> Result<HashSet<i64>, DatabaseError>;
    async fn mark_delivered(&self, successes: &[DeliverySuccess]) -> Result<(), DatabaseError>;
    async fn mark_failed(
        &self,
        record_id: i64,
        error: &str,
        latency_ms: Option<i64>,
    ) -> Result<(), DatabaseError>;
    async fn delete_record(&self, record_id: i64) -> Result<(), DatabaseError>;
    async fn insert_delivered_batch(
        &self,
        rows: &[DeliveredInsert],
    ) -> Result<(), DatabaseError>;
    async fn record_for(
        &self,
        link_id: i64,
        source_post_id: i64,
    ) -> Result<Option<DeliveryRecord>, DatabaseError>;
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Upsert on (link_id, source_post_id): a repeat failure refreshes the
    /// error text without resetting the retry counter.
    async fn record_failure(
        &self,
        link_id: i64,
        source_post_id: i64,
        error: &str,
    ) -> Result<(), DatabaseError>;
    async fn pending(
        &self,
        max_retries: i32,
        retried_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>, DatabaseError>;
    async fn mark_retry(&self, id: i64) -> Result<(), DatabaseError>;
    async fn mark_resolved(&self, id: i64) -> Result<(), DatabaseError>;
}
