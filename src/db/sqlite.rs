use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use crate::db::schema_sqlite::{crosspost_links, dead_letters, delivery_records};

use super::{
    DatabaseError,
    models::{DeadLetterEntry, DeliveredInsert, DeliveryRecord, DeliverySuccess, Link, NewLink},
};

// Helper function to convert DateTime to ISO string for SQLite
fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// Helper function to parse ISO string to DateTime
fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

fn establish_connection(path: &str) -> Result<SqliteConnection, DatabaseError> {
    SqliteConnection::establish(path).map_err(|e| DatabaseError::Connection(e.to_string()))
}

// SQLite uses i32 for INTEGER primary keys, but we keep i64 in our API
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crosspost_links)]
struct DbLink {
    id: i32,
    owner_id: i64,
    telegram_chat_id: i64,
    max_channel_id: String,
    enabled: bool,
    created_at: String,
    updated_at: String,
}

impl DbLink {
    fn to_link(&self) -> Result<Link, DatabaseError> {
        Ok(Link {
            id: self.id as i64,
            owner_id: self.owner_id,
            telegram_chat_id: self.telegram_chat_id,
            max_channel_id: self.max_channel_id.clone(),
            enabled: self.enabled,
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = crosspost_links)]
struct NewDbLink {
    owner_id: i64,
    telegram_chat_id: i64,
    max_channel_id: String,
    enabled: bool,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = delivery_records)]
struct DbDeliveryRecord {
    id: i32,
    link_id: i64,
    source_post_id: i64,
    max_message_id: Option<String>,
    status: String,
    kind: Option<String>,
    error: Option<String>,
    latency_ms: Option<i64>,
    created_at: String,
    sent_at: Option<String>,
}

impl DbDeliveryRecord {
    fn to_record(&self) -> Result<DeliveryRecord, DatabaseError> {
        Ok(DeliveryRecord {
            id: self.id as i64,
            link_id: self.link_id,
            source_post_id: self.source_post_id,
            max_message_id: self.max_message_id.clone(),
            status: self.status.clone(),
            kind: self.kind.clone(),
            error: self.error.clone(),
            latency_ms: self.latency_ms,
            created_at: string_to_datetime(&self.created_at)?,
            sent_at: self
                .sent_at
                .as_deref()
                .map(string_to_datetime)
                .transpose()?,
        })
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
    created_at: String,
    sent_at: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = dead_letters)]
struct DbDeadLetter {
    id: i32,
    link_id: i64,
    source_post_id: i64,
    error: String,
    retry_count: i32,
    last_retry_at: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

impl DbDeadLetter {
    fn to_entry(&self) -> Result<DeadLetterEntry, DatabaseError> {
        Ok(DeadLetterEntry {
            id: self.id as i64,
            link_id: self.link_id,
            source_post_id: self.source_post_id,
            error: self.error.clone(),
            retry_count: self.retry_count,
            last_retry_at: self
                .last_retry_at
                .as_deref()
                .map(string_to_datetime)
                .transpose()?,
            created_at: string_to_datetime(&self.created_at)?,
            resolved_at: self
                .resolved_at
                .as_deref()
                .map(string_to_datetime)
                .transpose()?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = dead_letters)]
struct NewDbDeadLetter {
    link_id: i64,
    source_post_id: i64,
    error: String,
    retry_count: i32,
    created_at: String,
}

pub struct SqliteLinkStore {
    db_path: Arc<String>,
}

impl SqliteLinkStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::LinkStore for SqliteLinkStore {
    async fn link_by_id(&self, link_id: i64) -> Result<Option<Link>, DatabaseError> {
        let target = link_id as i32;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::crosspost_links::dsl::*;
            crosspost_links
                .filter(id.eq(target))
                .select(DbLink::as_select())
                .first::<DbLink>(&mut conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(|l| l.to_link())
                .transpose()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn active_links_for_chat(&self, chat_id: i64) -> Result<Vec<Link>, DatabaseError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::crosspost_links::dsl::*;
            crosspost_links
                .filter(telegram_chat_id.eq(chat_id))
                .filter(enabled.eq(true))
                .order(id.asc())
                .select(DbLink::as_select())
                .load::<DbLink>(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .iter()
                .map(|l| l.to_link())
                .collect()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn create_link(&self, link: &NewLink) -> Result<Link, DatabaseError> {
        let db_path = self.db_path.clone();
        let new_link = NewDbLink {
            owner_id: link.owner_id,
            telegram_chat_id: link.telegram_chat_id,
            max_channel_id: link.max_channel_id.clone(),
            enabled: true,
            created_at: datetime_to_string(&Utc::now()),
            updated_at: datetime_to_string(&Utc::now()),
        };
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::crosspost_links::dsl::*;
            diesel::insert_into(crosspost_links)
                .values(&new_link)
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            crosspost_links
                .filter(telegram_chat_id.eq(new_link.telegram_chat_id))
                .filter(max_channel_id.eq(&new_link.max_channel_id))
                .select(DbLink::as_select())
                .first::<DbLink>(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .to_link()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn set_link_enabled(&self, link_id: i64, value: bool) -> Result<(), DatabaseError> {
        let target = link_id as i32;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::crosspost_links::dsl::*;
            diesel::update(crosspost_links.filter(id.eq(target)))
                .set((
                    enabled.eq(value),
                    updated_at.eq(datetime_to_string(&Utc::now())),
                ))
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn delete_link(&self, link_id: i64) -> Result<(), DatabaseError> {
        let target = link_id as i32;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::crosspost_links::dsl::*;
            diesel::delete(crosspost_links.filter(id.eq(target)))
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn count_links(&self) -> Result<i64, DatabaseError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::crosspost_links::dsl::*;
            crosspost_links
                .count()
                .get_result(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}

pub struct SqliteDeliveryStore {
    db_path: Arc<String>,
}

impl SqliteDeliveryStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::DeliveryStore for SqliteDeliveryStore {
    async fn create_pending(
        &self,
        link: i64,
        post: i64,
        record_kind: &str,
    ) -> Result<i64, DatabaseError> {
        let db_path = self.db_path.clone();
        let new_record = NewDbDeliveryRecord {
            link_id: link,
            source_post_id: post,
            max_message_id: None,
            status: "pending".to_string(),
            kind: Some(record_kind.to_string()),
            latency_ms: None,
            created_at: datetime_to_string(&Utc::now()),
            sent_at: None,
        };
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::delivery_records::dsl::*;
            diesel::insert_into(delivery_records)
                .values(&new_record)
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            delivery_records
                .filter(link_id.eq(new_record.link_id))
                .filter(source_post_id.eq(new_record.source_post_id))
                .select(id)
                .first::<i32>(&mut conn)
                .map(|record_id| record_id as i64)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn delivered_link_ids(
        &self,
        links: &[i64],
        post: i64,
    ) -> Result<HashSet<i64>, DatabaseError> {
        let links = links.to_vec();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::delivery_records::dsl::*;
            delivery_records
                .filter(link_id.eq_any(links))
                .filter(source_post_id.eq(post))
                .filter(status.eq("success"))
                .select(link_id)
                .load::<i64>(&mut conn)
                .map(|ids| ids.into_iter().collect())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn delivered_post_ids(&self, link: i64) -> Result<HashSet<i64>, DatabaseError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::delivery_records::dsl::*;
            delivery_records
                .filter(link_id.eq(link))
                .filter(status.eq("success"))
                .select(source_post_id)
                .load::<i64>(&mut conn)
                .map(|ids| ids.into_iter().collect())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn mark_delivered(&self, successes: &[DeliverySuccess]) -> Result<(), DatabaseError> {
        let successes = successes.to_vec();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::delivery_records::dsl::*;
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                for success in &successes {
                    diesel::update(delivery_records.filter(id.eq(success.record_id as i32)))
                        .set((
                            status.eq("success"),
                            max_message_id.eq(Some(success.max_message_id.clone())),
                            latency_ms.eq(Some(success.latency_ms)),
                            sent_at.eq(Some(datetime_to_string(&success.sent_at))),
                        ))
                        .execute(conn)?;
                }
                Ok(())
            })
            .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn mark_failed(
        &self,
        record_id: i64,
        reason: &str,
        latency: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let target = record_id as i32;
        let reason = reason.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::delivery_records::dsl::*;
            diesel::update(delivery_records.filter(id.eq(target)))
                .set((
                    status.eq("failed"),
                    error.eq(Some(reason)),
                    latency_ms.eq(latency),
                ))
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn delete_record(&self, record_id: i64) -> Result<(), DatabaseError> {
        let target = record_id as i32;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::delivery_records::dsl::*;
            diesel::delete(delivery_records.filter(id.eq(target)))
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn insert_delivered_batch(&self, rows: &[DeliveredInsert]) -> Result<(), DatabaseError> {
        if rows.is_empty() {
            return Ok(());
        }
        let new_rows: Vec<NewDbDeliveryRecord> = rows
            .iter()
            .map(|row| NewDbDeliveryRecord {
                link_id: row.link_id,
                source_post_id: row.source_post_id,
                max_message_id: Some(row.max_message_id.clone()),
                status: "success".to_string(),
                kind: Some(row.kind.clone()),
                latency_ms: Some(row.latency_ms),
                created_at: datetime_to_string(&Utc::now()),
                sent_at: Some(datetime_to_string(&row.sent_at)),
            })
            .collect();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::delivery_records::dsl::*;
            use diesel::upsert::excluded;
            // failed and pending rows from earlier attempts legitimately
            // persist; a re-run overwrites them instead of tripping the
            // (link_id, source_post_id) unique constraint
            // SQLite cannot combine a multi-row VALUES batch with ON CONFLICT
            // in diesel, so issue the upsert per row inside one transaction
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                for new_row in &new_rows {
                    diesel::insert_into(delivery_records)
                        .values(new_row)
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
                        .execute(conn)?;
                }
                Ok(())
            })
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn record_for(
        &self,
        link: i64,
        post: i64,
    ) -> Result<Option<DeliveryRecord>, DatabaseError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::delivery_records::dsl::*;
            delivery_records
                .filter(link_id.eq(link))
                .filter(source_post_id.eq(post))
                .select(DbDeliveryRecord::as_select())
                .first::<DbDeliveryRecord>(&mut conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(|r| r.to_record())
                .transpose()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}

pub struct SqliteDeadLetterStore {
    db_path: Arc<String>,
}

impl SqliteDeadLetterStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::DeadLetterStore for SqliteDeadLetterStore {
    async fn record_failure(
        &self,
        link: i64,
        post: i64,
        reason: &str,
    ) -> Result<(), DatabaseError> {
        let db_path = self.db_path.clone();
        let new_entry = NewDbDeadLetter {
            link_id: link,
            source_post_id: post,
            error: reason.to_string(),
            retry_count: 0,
            created_at: datetime_to_string(&Utc::now()),
        };
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::dead_letters::dsl::*;
            diesel::insert_into(dead_letters)
                .values(&new_entry)
                .on_conflict((link_id, source_post_id))
                .do_update()
                .set((
                    error.eq(new_entry.error.clone()),
                    resolved_at.eq(None::<String>),
                ))
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn pending(
        &self,
        max_retries: i32,
        retried_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>, DatabaseError> {
        let cutoff = datetime_to_string(&retried_before);
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::dead_letters::dsl::*;
            dead_letters
                .filter(resolved_at.is_null())
                .filter(retry_count.lt(max_retries))
                .filter(last_retry_at.is_null().or(last_retry_at.lt(cutoff)))
                .order(created_at.asc())
                .limit(limit)
                .select(DbDeadLetter::as_select())
                .load::<DbDeadLetter>(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .iter()
                .map(|e| e.to_entry())
                .collect()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn mark_retry(&self, entry_id: i64) -> Result<(), DatabaseError> {
        let target = entry_id as i32;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::dead_letters::dsl::*;
            diesel::update(dead_letters.filter(id.eq(target)))
                .set((
                    retry_count.eq(retry_count + 1),
                    last_retry_at.eq(Some(datetime_to_string(&Utc::now()))),
                ))
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn mark_resolved(&self, entry_id: i64) -> Result<(), DatabaseError> {
        let target = entry_id as i32;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::dead_letters::dsl::*;
            diesel::update(dead_letters.filter(id.eq(target)))
                .set(resolved_at.eq(Some(datetime_to_string(&Utc::now()))))
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}
