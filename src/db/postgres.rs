use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;

use crate::db::manager::Pool;
use crate::db::schema::{crosspost_links, dead_letters, delivery_records};

use super::{
    DatabaseError,
    models::{DeadLetterEntry, DeliveredInsert, DeliveryRecord, DeliverySuccess, Link, NewLink},
};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crosspost_links)]
struct DbLink {
    id: i64,
    owner_id: i64,
    telegram_chat_id: i64,
    max_channel_id: String,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbLink> for Link {
    fn from(value: DbLink) -> Self {
        Self {
            id: value.id,
            owner_id: value.owner_id,
            telegram_chat_id: value.telegram_chat_id,
            max_channel_id: value.max_channel_id,
            enabled: value.enabled,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = crosspost_links)]
struct NewDbLink {
    owner_id: i64,
    telegram_chat_id: i64,
    max_channel_id: String,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = delivery_records)]
struct DbDeliveryRecord {
    id: i64,
    link_id: i64,
    source_post_id: i64,
    max_message_id: Option<String>,
    status: String,
    kind: Option<String>,
    error: Option<String>,
    latency_ms: Option<i64>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl From<DbDeliveryRecord> for DeliveryRecord {
    fn from(value: DbDeliveryRecord) -> Self {
        Self {
            id: value.id,
            link_id: value.link_id,
            source_post_id: value.source_post_id,
            max_message_id: value.max_message_id,
            status: value.status,
            kind: value.kind,
            error: value.error,
            latency_ms: value.latency_ms,
            created_at: value.created_at,
            sent_at: value.sent_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = delivery_records)]
struct NewDbDeliveryRecord {
    link_id: i64,
    source_post_id: i64,
    max_message_id: Option<String>,
    status: String,
    kind: Option<String>,
    latency_ms: Option<i64>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = dead_letters)]
struct DbDeadLetter {
    id: i64,
    link_id: i64,
    source_post_id: i64,
    error: String,
    retry_count: i32,
    last_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl From<DbDeadLetter> for DeadLetterEntry {
    fn from(value: DbDeadLetter) -> Self {
        Self {
            id: value.id,
            link_id: value.link_id,
            source_post_id: value.source_post_id,
            error: value.error,
            retry_count: value.retry_count,
            last_retry_at: value.last_retry_at,
            created_at: value.created_at,
            resolved_at: value.resolved_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = dead_letters)]
struct NewDbDeadLetter {
    link_id: i64,
    source_post_id: i64,
    error: String,
    retry_count: i32,
    created_at: DateTime<Utc>,
}

async fn with_connection<T, F>(pool: Pool, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

pub struct PostgresLinkStore {
    pool: Pool,
}

impl PostgresLinkStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::LinkStore for PostgresLinkStore {
    async fn link_by_id(&self, link_id: i64) -> Result<Option<Link>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            use crate::db::schema::crosspost_links::dsl::*;
            crosspost_links
                .filter(id.eq(link_id))
                .select(DbLink::as_select())
                .first::<DbLink>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn active_links_for_chat(&self, chat_id: i64) -> Result<Vec<Link>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            use crate::db::schema::crosspost_links::dsl::*;
            crosspost_links
                .filter(telegram_chat_id.eq(chat_id))
                .filter(enabled.eq(true))
                .order(id.asc())
                .select(DbLink::as_select())
                .load::<DbLink>(conn)
                .map(|links| links.into_iter().map(Into::into).collect())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn create_link(&self, link: &NewLink) -> Result<Link, DatabaseError> {
        let pool = self.pool.clone();
        let new_link = NewDbLink {
            owner_id: link.owner_id,
            telegram_chat_id: link.telegram_chat_id,
            max_channel_id: link.max_channel_id.clone(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        with_connection(pool, move |conn| {
            use crate::db::schema::crosspost_links::dsl::*;
            diesel::insert_into(crosspost_links)
                .values(&new_link)
                .get_result::<DbLink>(conn)
                .map(Into::into)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn set_link_enabled(&self, link_id: i64, value: bool) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            use crate::db::schema::crosspost_links::dsl::*;
            diesel::update(crosspost_links.filter(id.eq(link_id)))
                .set((enabled.eq(value), updated_at.eq(Utc::now())))
                .execute(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn delete_link(&self, link_id: i64) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            use crate::db::schema::crosspost_links::dsl::*;
            diesel::delete(crosspost_links.filter(id.eq(link_id)))
                .execute(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn count_links(&self) -> Result<i64, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            use crate::db::schema::crosspost_links::dsl::*;
            crosspost_links
                .count()
                .get_result(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}

pub struct PostgresDeliveryStore {
    pool: Pool,
}

impl PostgresDeliveryStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::DeliveryStore for PostgresDeliveryStore {
    async fn create_pending(
        &self,
        link: i64,
        post: i64,
        record_kind: &str,
    ) -> Result<i64, DatabaseError> {
        let pool = self.pool.clone();
        let new_record = NewDbDeliveryRecord {
            link_id: link,
            source_post_id: post,
            max_message_id: None,
            status: "pending".to_string(),
            kind: Some(record_kind.to_string()),
            latency_ms: None,
            created_at: Utc::now(),
            sent_at: None,
        };
        with_connection(pool, move |conn| {
            use crate::db::schema::delivery_records::dsl::*;
            diesel::insert_into(delivery_records)
                .values(&new_record)
                .returning(id)
                .get_result::<i64>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn delivered_link_ids(
        &self,
        links: &[i64],
        post: i64,
    ) -> Result<HashSet<i64>, DatabaseError> {
        let pool = self.pool.clone();
        let links = links.to_vec();
        with_connection(pool, move |conn| {
            use crate::db::schema::delivery_records::dsl::*;
            delivery_records
                .filter(link_id.eq_any(links))
                .filter(source_post_id.eq(post))
                .filter(status.eq("success"))
                .select(link_id)
                .load::<i64>(conn)
                .map(|ids| ids.into_iter().collect())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn delivered_post_ids(&self, link: i64) -> Result<HashSet<i64>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            use crate::db::schema::delivery_records::dsl::*;
            delivery_records
                .filter(link_id.eq(link))
                .filter(status.eq("success"))
                .select(source_post_id)
                .load::<i64>(conn)
                .map(|ids| ids.into_iter().collect())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn mark_delivered(&self, successes: &[DeliverySuccess]) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let successes = successes.to_vec();
        with_connection(pool, move |conn| {
            use crate::db::schema::delivery_records::dsl::*;
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                for success in &successes {
                    diesel::update(delivery_records.filter(id.eq(success.record_id)))
                        .set((
                            status.eq("success"),
                            max_message_id.eq(Some(success.max_message_id.clone())),
                            latency_ms.eq(Some(success.latency_ms)),
                            sent_at.eq(Some(success.sent_at)),
                        ))
                        .execute(conn)?;
                }
                Ok(())
            })
            .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn mark_failed(
        &self,
        record_id: i64,
        reason: &str,
        latency: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let reason = reason.to_string();
        with_connection(pool, move |conn| {
            use crate::db::schema::delivery_records::dsl::*;
            diesel::update(delivery_records.filter(id.eq(record_id)))
                .set((
                    status.eq("failed"),
                    error.eq(Some(reason)),
                    latency_ms.eq(latency),
                ))
                .execute(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn delete_record(&self, record_id: i64) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            use crate::db::schema::delivery_records::dsl::*;
            diesel::delete(delivery_records.filter(id.eq(record_id)))
                .execute(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn insert_delivered_batch(&self, rows: &[DeliveredInsert]) -> Result<(), DatabaseError> {
        if rows.is_empty() {
            return Ok(());
        }
        let pool = self.pool.clone();
        let new_rows: Vec<NewDbDeliveryRecord> = rows
            .iter()
            .map(|row| NewDbDeliveryRecord {
                link_id: row.link_id,
                source_post_id: row.source_post_id,
                max_message_id: Some(row.max_message_id.clone()),
                status: "success".to_string(),
                kind: Some(row.kind.clone()),
                latency_ms: Some(row.latency_ms),
                created_at: Utc::now(),
                sent_at: Some(row.sent_at),
            })
            .collect();
        with_connection(pool, move |conn| {
            use crate::db::schema::delivery_records::dsl::*;
            use diesel::upsert::excluded;
            // failed and pending rows from earlier attempts legitimately
            // persist; a re-run overwrites them instead of tripping the
            // (link_id, source_post_id) unique constraint
            diesel::insert_into(delivery_records)
                .values(&new_rows)
                .on_conflict((link_id, source_post_id))
                .do_update()
                .set((
                    status.eq(excluded(status)),
                    max_message_id.eq(excluded(max_message_id)),
                    kind.eq(excluded(kind)),
                    error.eq(None::<String>),
                    latency_ms.eq(excluded(latency_ms)),
                    sent_at.eq(excluded(sent_at)),
                ))
                .execute(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn record_for(
        &self,
        link: i64,
        post: i64,
    ) -> Result<Option<DeliveryRecord>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            use crate::db::schema::delivery_records::dsl::*;
            delivery_records
                .filter(link_id.eq(link))
                .filter(source_post_id.eq(post))
                .select(DbDeliveryRecord::as_select())
                .first::<DbDeliveryRecord>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}

pub struct PostgresDeadLetterStore {
    pool: Pool,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::DeadLetterStore for PostgresDeadLetterStore {
    async fn record_failure(
        &self,
        link: i64,
        post: i64,
        reason: &str,
    ) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let new_entry = NewDbDeadLetter {
            link_id: link,
            source_post_id: post,
            error: reason.to_string(),
            retry_count: 0,
            created_at: Utc::now(),
        };
        with_connection(pool, move |conn| {
            use crate::db::schema::dead_letters::dsl::*;
            diesel::insert_into(dead_letters)
                .values(&new_entry)
                .on_conflict((link_id, source_post_id))
                .do_update()
                .set((
                    error.eq(new_entry.error.clone()),
                    resolved_at.eq(None::<DateTime<Utc>>),
                ))
                .execute(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn pending(
        &self,
        max_retries: i32,
        retried_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            use crate::db::schema::dead_letters::dsl::*;
            dead_letters
                .filter(resolved_at.is_null())
                .filter(retry_count.lt(max_retries))
                .filter(last_retry_at.is_null().or(last_retry_at.lt(retried_before)))
                .order(created_at.asc())
                .limit(limit)
                .select(DbDeadLetter::as_select())
                .load::<DbDeadLetter>(conn)
                .map(|entries| entries.into_iter().map(Into::into).collect())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn mark_retry(&self, entry_id: i64) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            use crate::db::schema::dead_letters::dsl::*;
            diesel::update(dead_letters.filter(id.eq(entry_id)))
                .set((
                    retry_count.eq(retry_count + 1),
                    last_retry_at.eq(Some(Utc::now())),
                ))
                .execute(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn mark_resolved(&self, entry_id: i64) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            use crate::db::schema::dead_letters::dsl::*;
            diesel::update(dead_letters.filter(id.eq(entry_id)))
                .set(resolved_at.eq(Some(Utc::now())))
                .execute(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
    }
}
