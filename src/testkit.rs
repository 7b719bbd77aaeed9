//! Shared fakes and fixtures for the crate's tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::config::DatabaseConfig;
use crate::db::{DatabaseManager, Link, NewLink};
use crate::dispatch::{Dispatcher, LinkCache};
use crate::max::{MaxApiError, MaxClient, SentMessage};
use crate::migration::queue::MigrationQueue;
use crate::resilience::{BreakerRegistry, CircuitBreakerConfig, RateLimiter, RetryPolicy};
use crate::telegram::{Post, SourceError, TelegramSource};

pub(crate) async fn test_manager(file: &NamedTempFile) -> Arc<DatabaseManager> {
    let config = DatabaseConfig {
        url: None,
        conn_string: None,
        filename: Some(file.path().to_string_lossy().to_string()),
        max_connections: Some(1),
        min_connections: Some(1),
    };
    let manager = DatabaseManager::new(&config).await.expect("db manager");
    manager.migrate().await.expect("migrate");
    Arc::new(manager)
}

pub(crate) async fn create_link(db: &DatabaseManager, chat_id: i64, channel: &str) -> Link {
    db.link_store()
        .create_link(&NewLink {
            owner_id: 1,
            telegram_chat_id: chat_id,
            max_channel_id: channel.to_string(),
        })
        .await
        .expect("create link")
}

pub(crate) fn test_dispatcher(
    db: Arc<DatabaseManager>,
    client: Arc<FakeMaxClient>,
    queue: Arc<MigrationQueue>,
) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        db.clone(),
        client,
        Arc::new(RateLimiter::new(30, Duration::from_secs(1))),
        Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default())),
        Arc::new(LinkCache::new(db.link_store())),
        queue,
        RetryPolicy::default(),
        Duration::from_secs(5),
    ))
}

type ErrorFactory = Box<dyn Fn() -> MaxApiError + Send + Sync>;

/// Scriptable destination client: succeeds by default, can be told to fail
/// once or permanently per channel.
#[derive(Default)]
pub(crate) struct FakeMaxClient {
    counter: AtomicUsize,
    started: AtomicUsize,
    calls: Mutex<Vec<String>>,
    scripted: Mutex<HashMap<String, VecDeque<MaxApiError>>>,
    always_failing: Mutex<HashMap<String, ErrorFactory>>,
    albums: Mutex<Vec<(String, Vec<String>, Option<String>)>>,
    gate: Mutex<Option<Arc<tokio::sync::Notify>>>,
}

impl FakeMaxClient {
    /// Make the next send block until the returned handle is notified.
    pub fn hold_next_call(&self) -> Arc<tokio::sync::Notify> {
        let notify = Arc::new(tokio::sync::Notify::new());
        *self.gate.lock() = Some(notify.clone());
        notify
    }
    pub fn fail_next(&self, channel: &str, err: MaxApiError) {
        self.scripted
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn fail_always(
        &self,
        channel: &str,
        factory: impl Fn() -> MaxApiError + Send + Sync + 'static,
    ) {
        self.always_failing
            .lock()
            .insert(channel.to_string(), Box::new(factory));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Sends that entered the client, including one parked on a gate.
    pub fn sends_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, channel: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == channel).count()
    }

    pub fn album_calls(&self) -> Vec<(String, Vec<String>, Option<String>)> {
        self.albums.lock().clone()
    }

    async fn respond(&self, channel: &str) -> Result<SentMessage, MaxApiError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.calls.lock().push(channel.to_string());
        if let Some(factory) = self.always_failing.lock().get(channel) {
            return Err(factory());
        }
        if let Some(err) = self
            .scripted
            .lock()
            .get_mut(channel)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(SentMessage {
            message_id: format!("mid.{n}"),
        })
    }
}

#[async_trait]
impl MaxClient for FakeMaxClient {
    async fn send_text(&self, channel_id: &str, _text: &str) -> Result<SentMessage, MaxApiError> {
        self.respond(channel_id).await
    }

    async fn send_photo(
        &self,
        channel_id: &str,
        _url: &str,
        _caption: Option<&str>,
    ) -> Result<SentMessage, MaxApiError> {
        self.respond(channel_id).await
    }

    async fn send_video(
        &self,
        channel_id: &str,
        _url: &str,
        _caption: Option<&str>,
    ) -> Result<SentMessage, MaxApiError> {
        self.respond(channel_id).await
    }

    async fn send_document(
        &self,
        channel_id: &str,
        _url: &str,
        _caption: Option<&str>,
    ) -> Result<SentMessage, MaxApiError> {
        self.respond(channel_id).await
    }

    async fn send_album(
        &self,
        channel_id: &str,
        urls: &[String],
        caption: Option<&str>,
    ) -> Result<SentMessage, MaxApiError> {
        let result = self.respond(channel_id).await;
        if result.is_ok() {
            self.albums.lock().push((
                channel_id.to_string(),
                urls.to_vec(),
                caption.map(str::to_string),
            ));
        }
        result
    }
}

/// In-memory source platform: a map of chat id to posts.
#[derive(Default)]
pub(crate) struct MemorySource {
    posts: Mutex<HashMap<i64, Vec<Post>>>,
}

impl MemorySource {
    pub fn add_post(&self, post: Post) {
        self.posts.lock().entry(post.chat_id).or_default().push(post);
    }

    pub fn remove_post(&self, chat_id: i64, post_id: i64) {
        if let Some(posts) = self.posts.lock().get_mut(&chat_id) {
            posts.retain(|p| p.id != post_id);
        }
    }
}

#[async_trait]
impl TelegramSource for MemorySource {
    fn channel_history(&self, chat_id: i64) -> BoxStream<'static, Result<Post, SourceError>> {
        let posts = self
            .posts
            .lock()
            .get(&chat_id)
            .cloned()
            .unwrap_or_default();
        futures::stream::iter(posts.into_iter().map(Ok)).boxed()
    }

    async fn post(&self, chat_id: i64, post_id: i64) -> Result<Option<Post>, SourceError> {
        Ok(self
            .posts
            .lock()
            .get(&chat_id)
            .and_then(|posts| posts.iter().find(|p| p.id == post_id).cloned()))
    }
}
