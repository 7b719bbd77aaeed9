use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::db::{DatabaseError, Link, LinkStore};

/// Read-through cache of enabled links per source chat. Invalidated by the
/// link management surface whenever a link is created, toggled or removed.
pub struct LinkCache {
    store: Arc<dyn LinkStore>,
    by_chat: RwLock<HashMap<i64, Arc<Vec<Link>>>>,
}

impl LinkCache {
    pub fn new(store: Arc<dyn LinkStore>) -> Self {
        Self {
            store,
            by_chat: RwLock::new(HashMap::new()),
        }
    }

    pub async fn links_for_chat(&self, chat_id: i64) -> Result<Arc<Vec<Link>>, DatabaseError> {
        if let Some(links) = self.by_chat.read().get(&chat_id) {
            return Ok(links.clone());
        }

        let links = Arc::new(self.store.active_links_for_chat(chat_id).await?);
        debug!("link cache loaded chat={} links={}", chat_id, links.len());
        self.by_chat.write().insert(chat_id, links.clone());
        Ok(links)
    }

    pub fn invalidate(&self, chat_id: i64) {
        self.by_chat.write().remove(&chat_id);
    }

    pub fn clear(&self) {
        self.by_chat.write().clear();
    }
}
