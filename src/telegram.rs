use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single post as observed on a Telegram channel, either from the live
/// event feed or from a history stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub chat_id: i64,
    pub timestamp: DateTime<Utc>,
    /// Set when the post is one part of a multi-part album.
    pub media_group_id: Option<i64>,
    pub payload: PostPayload,
}

/// Renderable content of a post. One variant per destination send shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostPayload {
    Text {
        text: String,
    },
    Photo {
        url: String,
        caption: Option<String>,
    },
    Video {
        url: String,
        caption: Option<String>,
    },
    Document {
        url: String,
        caption: Option<String>,
    },
    Sticker {
        url: String,
    },
    Album {
        parts: Vec<AlbumPart>,
        caption: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbumPart {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostKind {
    Text,
    Photo,
    Video,
    Document,
    Sticker,
    Album,
}

impl PostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostKind::Text => "text",
            PostKind::Photo => "photo",
            PostKind::Video => "video",
            PostKind::Document => "document",
            PostKind::Sticker => "sticker",
            PostKind::Album => "album",
        }
    }
}

impl PostPayload {
    pub fn kind(&self) -> PostKind {
        match self {
            PostPayload::Text { .. } => PostKind::Text,
            PostPayload::Photo { .. } => PostKind::Photo,
            PostPayload::Video { .. } => PostKind::Video,
            PostPayload::Document { .. } => PostKind::Document,
            PostPayload::Sticker { .. } => PostKind::Sticker,
            PostPayload::Album { .. } => PostKind::Album,
        }
    }

    /// Whether the destination has anything to render for this payload.
    /// Service posts stripped of text and media come through as empty text.
    pub fn has_content(&self) -> bool {
        match self {
            PostPayload::Text { text } => !text.trim().is_empty(),
            PostPayload::Album { parts, .. } => !parts.is_empty(),
            _ => true,
        }
    }
}

/// Collapse the parts of one media group into a single album payload.
///
/// Photo and video parts contribute attachments; the album caption is the
/// first non-empty caption among the parts. Returns `None` when no part
/// carries an attachment the destination can put in an album.
pub fn album_from_parts(parts: &[Post]) -> Option<PostPayload> {
    let mut urls = Vec::new();
    let mut caption: Option<String> = None;

    for part in parts {
        match &part.payload {
            PostPayload::Photo { url, caption: c } | PostPayload::Video { url, caption: c } => {
                urls.push(AlbumPart { url: url.clone() });
                if caption.is_none() {
                    caption = c.clone().filter(|c| !c.trim().is_empty());
                }
            }
            PostPayload::Text { text } => {
                if caption.is_none() && !text.trim().is_empty() {
                    caption = Some(text.clone());
                }
            }
            _ => {}
        }
    }

    if urls.is_empty() {
        return None;
    }
    Some(PostPayload::Album {
        parts: urls,
        caption,
    })
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("channel {0} not found or not accessible")]
    ChannelNotFound(i64),
    #[error("source platform request failed: {0}")]
    Network(String),
    #[error("source client is not authorized")]
    Unauthorized,
}

/// Read access to the source platform. The MTProto session bootstrap and the
/// live event loop live outside this crate; they hand posts to the dispatch
/// pipeline and implement this trait for history access.
#[async_trait]
pub trait TelegramSource: Send + Sync {
    /// Full channel history, oldest first. The stream is restartable: each
    /// call starts over from the beginning of the channel.
    fn channel_history(&self, chat_id: i64) -> BoxStream<'static, Result<Post, SourceError>>;

    /// Fetch a single post, `None` when it has been deleted since.
    async fn post(&self, chat_id: i64, post_id: i64) -> Result<Option<Post>, SourceError>;
}
