use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::MigrationConfig;
use crate::db::{DatabaseManager, DeliveredInsert, Link};
use crate::dispatch::{Dispatcher, SendOutcome, SkipReason};
use crate::telegram::{Post, PostPayload, TelegramSource, album_from_parts};

pub use self::queue::{MigrationQueue, QueuedPost};

pub mod queue;

#[derive(Debug, Clone, Default)]
pub struct MigrationStats {
    /// Items processed: albums count once, standalone posts once each.
    pub total: u64,
    pub success: u64,
    pub skipped: u64,
    pub skipped_empty: u64,
    pub skipped_duplicate: u64,
    pub skipped_unsupported: u64,
    pub failed: u64,
    pub duration: Duration,
    /// First bookkeeping error that halted the run, if any. Counts above
    /// reflect everything processed up to that point.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationProgress {
    pub processed: u64,
    pub success: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Backfills a link's entire source history into its destination channel:
/// albums first, then standalone posts oldest-to-newest, with bounded
/// parallel sends and ordered, batched bookkeeping. Live posts arriving
/// meanwhile are parked in the queue and replayed afterwards.
pub struct Migrator {
    source: Arc<dyn TelegramSource>,
    dispatcher: Arc<Dispatcher>,
    db: Arc<DatabaseManager>,
    queue: Arc<MigrationQueue>,
    config: MigrationConfig,
}

impl Migrator {
    pub fn new(
        source: Arc<dyn TelegramSource>,
        dispatcher: Arc<Dispatcher>,
        db: Arc<DatabaseManager>,
        queue: Arc<MigrationQueue>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            source,
            dispatcher,
            db,
            queue,
            config,
        }
    }

    pub async fn migrate_link(
        &self,
        link_id: i64,
        progress: Option<mpsc::Sender<MigrationProgress>>,
    ) -> anyhow::Result<MigrationStats> {
        if !self.queue.start_migration(link_id) {
            return Err(anyhow!("migration already running for link {link_id}"));
        }

        let result = self.run(link_id, progress).await;

        // stop before draining so replay cannot race a fresh enqueue
        self.queue.stop_migration(link_id);
        self.replay_queued(link_id).await;

        result
    }

    async fn run(
        &self,
        link_id: i64,
        progress: Option<mpsc::Sender<MigrationProgress>>,
    ) -> anyhow::Result<MigrationStats> {
        let link = self
            .db
            .link_store()
            .link_by_id(link_id)
            .await?
            .ok_or_else(|| anyhow!("link {link_id} not found"))?;

        let delivered = self
            .db
            .delivery_store()
            .delivered_post_ids(link_id)
            .await
            .context("loading delivered post ids")?;

        let mut posts = Vec::new();
        let mut history = self.source.channel_history(link.telegram_chat_id);
        while let Some(item) = history.next().await {
            posts.push(item.context("reading channel history")?);
        }
        drop(history);

        posts.sort_by_key(|p| (p.timestamp, p.id));
        if let Some(limit) = self.config.limit_last_posts {
            if posts.len() > limit {
                posts = posts.split_off(posts.len() - limit);
            }
        }

        info!(
            "migration of link {} starting: {} posts in chat {}",
            link_id,
            posts.len(),
            link.telegram_chat_id
        );

        let work = plan_work(posts);

        let started = tokio::time::Instant::now();
        let mut stats = MigrationStats::default();
        let mut reporter = ProgressReporter::new(
            progress,
            self.config.progress_every_posts,
            Duration::from_secs(self.config.progress_every_secs),
        );
        let mut batch: Vec<DeliveredInsert> = Vec::new();

        let target = &link;
        let already_delivered = &delivered;
        let mut flow = stream::iter(work)
            .map(|post| async move {
                if already_delivered.contains(&post.id) {
                    return (post, SendOutcome::Skipped(SkipReason::Duplicate));
                }
                if !post.payload.has_content() {
                    return (post, SendOutcome::Skipped(SkipReason::Empty));
                }
                let outcome = self.dispatcher.send_payload_to_link(target, &post.payload).await;
                (post, outcome)
            })
            .buffered(self.config.parallelism.max(1));

        while let Some((post, outcome)) = flow.next().await {
            stats.total += 1;
            match outcome {
                SendOutcome::Delivered {
                    message_id,
                    latency_ms,
                } => {
                    stats.success += 1;
                    batch.push(DeliveredInsert {
                        link_id,
                        source_post_id: post.id,
                        max_message_id: message_id,
                        kind: post.payload.kind().as_str().to_string(),
                        latency_ms,
                        sent_at: Utc::now(),
                    });
                    if batch.len() >= self.config.insert_batch_size {
                        if let Err(err) = self.flush_batch(&mut batch).await {
                            error!(
                                "migration of link {} halted mid-stream: {:#}",
                                link_id, err
                            );
                            stats.error = Some(format!("{err:#}"));
                            break;
                        }
                    }
                }
                SendOutcome::Skipped(reason) => {
                    stats.skipped += 1;
                    match reason {
                        SkipReason::Duplicate => stats.skipped_duplicate += 1,
                        SkipReason::Empty => stats.skipped_empty += 1,
                        SkipReason::Unsupported => stats.skipped_unsupported += 1,
                    }
                }
                SendOutcome::Failed(reason) => {
                    stats.failed += 1;
                    let kind = post.payload.kind().as_str();
                    if let Err(err) = self.record_failure(&link, post.id, kind, &reason).await {
                        error!(
                            "recording failure of post {} for link {} failed: {:#}",
                            post.id, link_id, err
                        );
                        if stats.error.is_none() {
                            stats.error = Some(format!("{err:#}"));
                        }
                    }
                }
            }
            reporter.report(&stats).await;
        }
        drop(flow);

        if stats.error.is_none() {
            if let Err(err) = self.flush_batch(&mut batch).await {
                error!(
                    "migration of link {} failed to persist final batch: {:#}",
                    link_id, err
                );
                stats.error = Some(format!("{err:#}"));
            }
        }
        reporter.finish(&stats).await;

        stats.duration = started.elapsed();
        info!(
            "migration of link {} finished: {} total, {} delivered, {} skipped, {} failed in {:?}",
            link_id, stats.total, stats.success, stats.skipped, stats.failed, stats.duration
        );
        Ok(stats)
    }

    async fn flush_batch(&self, batch: &mut Vec<DeliveredInsert>) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.db
            .delivery_store()
            .insert_delivered_batch(batch)
            .await
            .context("persisting delivered batch")?;
        debug!("persisted batch of {} delivered posts", batch.len());
        batch.clear();
        Ok(())
    }

    async fn record_failure(
        &self,
        link: &Link,
        post_id: i64,
        kind: &str,
        reason: &str,
    ) -> anyhow::Result<()> {
        if let Some(record_id) = self
            .dispatcher
            .ensure_pending(link.id, post_id, kind)
            .await?
        {
            self.db
                .delivery_store()
                .mark_failed(record_id, reason, None)
                .await?;
        }
        self.db
            .dead_letter_store()
            .record_failure(link.id, post_id, reason)
            .await?;
        Ok(())
    }

    /// Replay posts that arrived live while the backfill ran, in arrival
    /// order, through the normal dispatch path scoped to this link.
    async fn replay_queued(&self, link_id: i64) {
        let queued = self.queue.drain(link_id);
        if queued.is_empty() {
            return;
        }
        info!(
            "replaying {} posts queued during migration of link {}",
            queued.len(),
            link_id
        );
        for post in queued {
            if let Err(err) = self
                .dispatcher
                .dispatch(
                    post.source_chat_id,
                    post.source_post_id,
                    &post.payload,
                    Some(link_id),
                )
                .await
            {
                warn!(
                    "replay of queued post {} for link {} failed: {:#}",
                    post.source_post_id, link_id, err
                );
            }
        }
    }
}

/// Collapse media groups into single album items and put them ahead of
/// standalone posts. An album takes the id and timestamp of its first
/// part, which is also how its delivery record is keyed.
fn plan_work(posts: Vec<Post>) -> Vec<Post> {
    let mut groups: HashMap<i64, Vec<Post>> = HashMap::new();
    let mut standalone = Vec::new();
    for post in posts {
        match post.media_group_id {
            Some(group_id) => groups.entry(group_id).or_default().push(post),
            None => standalone.push(post),
        }
    }

    let mut albums: Vec<Post> = groups
        .into_values()
        .map(|parts| {
            let payload = album_from_parts(&parts).unwrap_or(PostPayload::Album {
                parts: Vec::new(),
                caption: None,
            });
            let first = &parts[0];
            Post {
                id: first.id,
                chat_id: first.chat_id,
                timestamp: first.timestamp,
                media_group_id: first.media_group_id,
                payload,
            }
        })
        .collect();
    albums.sort_by_key(|p| (p.timestamp, p.id));

    let mut work = albums;
    work.extend(standalone);
    work
}

struct ProgressReporter {
    sender: Option<mpsc::Sender<MigrationProgress>>,
    every_posts: u64,
    every_duration: Duration,
    last_processed: u64,
    last_report: tokio::time::Instant,
}

impl ProgressReporter {
    fn new(
        sender: Option<mpsc::Sender<MigrationProgress>>,
        every_posts: u64,
        every_duration: Duration,
    ) -> Self {
        Self {
            sender,
            every_posts: every_posts.max(1),
            every_duration,
            last_processed: 0,
            last_report: tokio::time::Instant::now(),
        }
    }

    async fn report(&mut self, stats: &MigrationStats) {
        if self.sender.is_none() {
            return;
        }
        let due_by_count = stats.total >= self.last_processed + self.every_posts;
        let due_by_time = self.last_report.elapsed() >= self.every_duration;
        if due_by_count || due_by_time {
            self.send(stats).await;
        }
    }

    async fn finish(&mut self, stats: &MigrationStats) {
        if self.sender.is_some() && stats.total > self.last_processed {
            self.send(stats).await;
        }
    }

    async fn send(&mut self, stats: &MigrationStats) {
        self.last_processed = stats.total;
        self.last_report = tokio::time::Instant::now();
        if let Some(sender) = &self.sender {
            let _ = sender
                .send(MigrationProgress {
                    processed: stats.total,
                    success: stats.success,
                    skipped: stats.skipped,
                    failed: stats.failed,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;

    use super::{MigrationQueue, Migrator};
    use crate::config::MigrationConfig;
    use crate::telegram::{Post, PostPayload};
    use crate::testkit::{FakeMaxClient, MemorySource, create_link, test_dispatcher, test_manager};

    fn post_at(id: i64, chat: i64, group: Option<i64>, payload: PostPayload) -> Post {
        Post {
            id,
            chat_id: chat,
            timestamp: Utc.timestamp_opt(1_700_000_000 + id, 0).single().expect("ts"),
            media_group_id: group,
            payload,
        }
    }

    fn text(id: i64, chat: i64) -> Post {
        post_at(
            id,
            chat,
            None,
            PostPayload::Text {
                text: format!("post {id}"),
            },
        )
    }

    fn photo(id: i64, chat: i64, group: Option<i64>) -> Post {
        post_at(
            id,
            chat,
            group,
            PostPayload::Photo {
                url: format!("https://cdn.example/{id}.jpg"),
                caption: None,
            },
        )
    }

    struct Env {
        db: Arc<crate::db::DatabaseManager>,
        client: Arc<FakeMaxClient>,
        source: Arc<MemorySource>,
        queue: Arc<MigrationQueue>,
        migrator: Migrator,
    }

    async fn env(file: &NamedTempFile, config: MigrationConfig) -> Env {
        let db = test_manager(file).await;
        let client = Arc::new(FakeMaxClient::default());
        let queue = Arc::new(MigrationQueue::new());
        let dispatcher = test_dispatcher(db.clone(), client.clone(), queue.clone());
        let source = Arc::new(MemorySource::default());
        let migrator = Migrator::new(
            source.clone(),
            dispatcher,
            db.clone(),
            queue.clone(),
            config,
        );
        Env {
            db,
            client,
            source,
            queue,
            migrator,
        }
    }

    #[tokio::test]
    async fn migrates_history_with_split_skip_counts() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let env = env(&file, MigrationConfig::default()).await;
        let link = create_link(&env.db, 100, "chan").await;

        for id in 1..=6 {
            env.source.add_post(text(id, 100));
        }
        env.source.add_post(post_at(
            7,
            100,
            None,
            PostPayload::Text {
                text: "  ".to_string(),
            },
        ));
        env.source.add_post(post_at(
            8,
            100,
            None,
            PostPayload::Sticker {
                url: "https://cdn.example/s.webp".to_string(),
            },
        ));
        // posts 1 and 2 were already delivered in an earlier run
        env.db
            .delivery_store()
            .insert_delivered_batch(&[
                crate::db::DeliveredInsert {
                    link_id: link.id,
                    source_post_id: 1,
                    max_message_id: "old.1".to_string(),
                    kind: "text".to_string(),
                    latency_ms: 5,
                    sent_at: Utc::now(),
                },
                crate::db::DeliveredInsert {
                    link_id: link.id,
                    source_post_id: 2,
                    max_message_id: "old.2".to_string(),
                    kind: "text".to_string(),
                    latency_ms: 5,
                    sent_at: Utc::now(),
                },
            ])
            .await
            .expect("seed delivered");

        let stats = env
            .migrator
            .migrate_link(link.id, None)
            .await
            .expect("migrate");

        assert_eq!(stats.total, 8);
        assert_eq!(stats.success, 4);
        assert_eq!(stats.skipped, 4);
        assert_eq!(stats.skipped_duplicate, 2);
        assert_eq!(stats.skipped_empty, 1);
        assert_eq!(stats.skipped_unsupported, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(env.client.call_count(), 4);

        let delivered = env
            .db
            .delivery_store()
            .delivered_post_ids(link.id)
            .await
            .expect("delivered ids");
        assert_eq!(delivered.len(), 6);
        assert!(!env.queue.is_migrating(link.id));
    }

    #[tokio::test]
    async fn media_groups_go_first_as_albums() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let env = env(&file, MigrationConfig::default()).await;
        let link = create_link(&env.db, 100, "chan").await;

        env.source.add_post(text(1, 100));
        env.source.add_post(photo(2, 100, Some(50)));
        env.source.add_post(photo(3, 100, Some(50)));
        env.source.add_post(text(4, 100));

        let stats = env
            .migrator
            .migrate_link(link.id, None)
            .await
            .expect("migrate");

        assert_eq!(stats.total, 3);
        assert_eq!(stats.success, 3);

        let albums = env.client.album_calls();
        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].1.len(), 2);

        // album recorded under its first part id
        let record = env
            .db
            .delivery_store()
            .record_for(link.id, 2)
            .await
            .expect("query")
            .expect("album record");
        assert_eq!(record.status, "success");
        assert_eq!(record.kind.as_deref(), Some("album"));
    }

    #[tokio::test]
    async fn migrates_150_posts_in_bounded_batches() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = MigrationConfig {
            parallelism: 10,
            insert_batch_size: 100,
            ..MigrationConfig::default()
        };
        let env = env(&file, config).await;
        let link = create_link(&env.db, 100, "chan").await;

        for id in 1..=150 {
            env.source.add_post(text(id, 100));
        }

        let stats = env
            .migrator
            .migrate_link(link.id, None)
            .await
            .expect("migrate");

        assert_eq!(stats.total, 150);
        assert_eq!(stats.success, 150);
        assert_eq!(stats.failed, 0);
        assert_eq!(env.client.call_count(), 150);

        let delivered = env
            .db
            .delivery_store()
            .delivered_post_ids(link.id)
            .await
            .expect("delivered ids");
        assert_eq!(delivered.len(), 150);
    }

    #[tokio::test]
    async fn concurrent_sends_keep_records_in_source_order() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = MigrationConfig {
            parallelism: 10,
            ..MigrationConfig::default()
        };
        let env = env(&file, config).await;
        let link = create_link(&env.db, 100, "chan").await;

        for id in 1..=40 {
            env.source.add_post(text(id, 100));
        }

        let stats = env
            .migrator
            .migrate_link(link.id, None)
            .await
            .expect("migrate");
        assert_eq!(stats.success, 40);

        let rows: Vec<(i64, Option<String>)> = {
            use crate::db::schema_sqlite::delivery_records::dsl::*;
            use diesel::prelude::*;
            let mut conn = diesel::sqlite::SqliteConnection::establish(
                file.path().to_str().expect("db path"),
            )
            .expect("connection");
            delivery_records
                .order(id.asc())
                .select((source_post_id, sent_at))
                .load(&mut conn)
                .expect("load records")
        };
        let source_ids: Vec<i64> = rows.iter().map(|(post, _)| *post).collect();
        assert_eq!(source_ids, (1..=40).collect::<Vec<i64>>());
        let sent: Vec<chrono::DateTime<chrono::FixedOffset>> = rows
            .iter()
            .map(|(_, at)| {
                chrono::DateTime::parse_from_rfc3339(at.as_deref().expect("sent_at"))
                    .expect("rfc3339 timestamp")
            })
            .collect();
        for pair in sent.windows(2) {
            assert!(pair[0] < pair[1], "sent_at out of order: {pair:?}");
        }
    }

    #[tokio::test]
    async fn limit_keeps_only_most_recent_posts() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = MigrationConfig {
            limit_last_posts: Some(30),
            ..MigrationConfig::default()
        };
        let env = env(&file, config).await;
        let link = create_link(&env.db, 100, "chan").await;

        for id in 1..=100 {
            env.source.add_post(text(id, 100));
        }

        let stats = env
            .migrator
            .migrate_link(link.id, None)
            .await
            .expect("migrate");
        assert_eq!(stats.total, 30);
        assert_eq!(stats.success, 30);

        let delivered = env
            .db
            .delivery_store()
            .delivered_post_ids(link.id)
            .await
            .expect("delivered ids");
        assert!(delivered.contains(&100));
        assert!(delivered.contains(&71));
        assert!(!delivered.contains(&70));
    }

    #[tokio::test]
    async fn failed_posts_are_recorded_and_pipeline_continues() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let env = env(&file, MigrationConfig::default()).await;
        let link = create_link(&env.db, 100, "bad-chan").await;
        env.client.fail_always(
            "bad-chan",
            || crate::max::MaxApiError::Status {
                status: 403,
                body: "forbidden".to_string(),
            },
        );

        for id in 1..=3 {
            env.source.add_post(text(id, 100));
        }

        let stats = env
            .migrator
            .migrate_link(link.id, None)
            .await
            .expect("migrate");
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.success, 0);

        let dead = env
            .db
            .dead_letter_store()
            .pending(3, Utc::now() + chrono::Duration::seconds(1), 10)
            .await
            .expect("dead letters");
        assert_eq!(dead.len(), 3);
    }

    #[tokio::test]
    async fn rerun_overwrites_previously_failed_rows() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let env = env(&file, MigrationConfig::default()).await;
        let link = create_link(&env.db, 100, "chan").await;

        for id in 1..=3 {
            env.source.add_post(text(id, 100));
        }
        // a failed row from an earlier attempt must not block the re-run
        let record_id = env
            .db
            .delivery_store()
            .create_pending(link.id, 2, "text")
            .await
            .expect("pending row");
        env.db
            .delivery_store()
            .mark_failed(record_id, "destination rejected", None)
            .await
            .expect("mark failed");

        let stats = env
            .migrator
            .migrate_link(link.id, None)
            .await
            .expect("migrate");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.success, 3);
        assert_eq!(stats.failed, 0);
        assert!(stats.error.is_none());

        let record = env
            .db
            .delivery_store()
            .record_for(link.id, 2)
            .await
            .expect("query")
            .expect("record");
        assert_eq!(record.status, "success");
        assert!(record.max_message_id.is_some());
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn store_failure_mid_stream_returns_best_effort_stats() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = MigrationConfig {
            insert_batch_size: 1,
            ..MigrationConfig::default()
        };
        let env = env(&file, config.clone()).await;
        let link = create_link(&env.db, 100, "chan").await;
        for id in 1..=3 {
            env.source.add_post(text(id, 100));
        }

        let gate = env.client.hold_next_call();
        let dispatcher = test_dispatcher(env.db.clone(), env.client.clone(), env.queue.clone());
        let migrator = Migrator::new(
            env.source.clone(),
            dispatcher,
            env.db.clone(),
            env.queue.clone(),
            config,
        );
        let migrate = tokio::spawn(async move { migrator.migrate_link(link.id, None).await });

        // wait until the first send is parked on the gate, then pull the
        // table out from under the bookkeeping
        while env.client.sends_started() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        {
            use diesel::prelude::*;
            let mut conn = diesel::sqlite::SqliteConnection::establish(
                file.path().to_str().expect("db path"),
            )
            .expect("connection");
            diesel::sql_query("DROP TABLE delivery_records")
                .execute(&mut conn)
                .expect("drop table");
        }
        gate.notify_one();

        let stats = migrate.await.expect("join").expect("migrate");
        assert!(stats.error.is_some(), "store failure must surface in stats");
        assert!(stats.total >= 1);
        assert_eq!(stats.success, stats.total);
        assert!(!env.queue.is_migrating(link.id));
    }

    #[tokio::test]
    async fn progress_events_are_emitted() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = MigrationConfig {
            progress_every_posts: 5,
            progress_every_secs: 3600,
            ..MigrationConfig::default()
        };
        let env = env(&file, config).await;
        let link = create_link(&env.db, 100, "chan").await;
        for id in 1..=12 {
            env.source.add_post(text(id, 100));
        }

        let (tx, mut rx) = mpsc::channel(32);
        let stats = env
            .migrator
            .migrate_link(link.id, Some(tx))
            .await
            .expect("migrate");
        assert_eq!(stats.success, 12);

        let mut processed = Vec::new();
        while let Some(event) = rx.recv().await {
            processed.push(event.processed);
        }
        assert_eq!(processed, vec![5, 10, 12]);
    }

    #[tokio::test]
    async fn concurrent_migration_of_same_link_is_rejected() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let env = env(&file, MigrationConfig::default()).await;
        let link = create_link(&env.db, 100, "chan").await;

        env.queue.start_migration(link.id);
        let result = env.migrator.migrate_link(link.id, None).await;
        assert!(result.is_err());
        // the failed attempt must not clear the holder's active flag
        assert!(env.queue.is_migrating(link.id));
    }

    #[tokio::test]
    async fn live_posts_queued_during_migration_are_replayed() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let env = env(&file, MigrationConfig::default()).await;
        let link = create_link(&env.db, 100, "chan").await;

        for id in 1..=3 {
            env.source.add_post(text(id, 100));
        }

        let gate = env.client.hold_next_call();
        let dispatcher = test_dispatcher(env.db.clone(), env.client.clone(), env.queue.clone());
        let migrator = Migrator::new(
            env.source.clone(),
            dispatcher.clone(),
            env.db.clone(),
            env.queue.clone(),
            MigrationConfig::default(),
        );

        let migrate = tokio::spawn(async move { migrator.migrate_link(link.id, None).await });

        // wait until the backfill is underway and parked on the gate
        while !env.queue.is_migrating(link.id) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let live_delivered = dispatcher
            .dispatch(
                100,
                99,
                &PostPayload::Text {
                    text: "live post".to_string(),
                },
                None,
            )
            .await
            .expect("live dispatch");
        assert!(!live_delivered);
        assert_eq!(env.queue.queued_len(link.id), 1);

        gate.notify_one();
        let stats = migrate.await.expect("join").expect("migrate");
        assert_eq!(stats.success, 3);

        // the queued live post went out after the backfill
        let record = env
            .db
            .delivery_store()
            .record_for(link.id, 99)
            .await
            .expect("query")
            .expect("replayed record");
        assert_eq!(record.status, "success");
        assert_eq!(env.queue.queued_len(link.id), 0);
        assert!(!env.queue.is_migrating(link.id));
    }
}
