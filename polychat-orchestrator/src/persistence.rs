//! Storage seam and an in-memory implementation.

use async_trait::async_trait;
use shared::models::{ImageAsset, Message, ModelStats, Session};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::trace;
use uuid::Uuid;

use crate::errors::OrchestratorResult;

/// Storage collaborator for sessions, messages, stats and image assets.
///
/// # Errors
/// Every method returns [`OrchestratorError::Persistence`](crate::OrchestratorError::Persistence)
/// when the backing store fails.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Loads a session.
    async fn get_session(&self, id: Uuid) -> OrchestratorResult<Option<Session>>;
    /// Inserts or replaces a session.
    async fn put_session(&self, session: &Session) -> OrchestratorResult<()>;

    /// Loads a message.
    async fn get_message(&self, id: Uuid) -> OrchestratorResult<Option<Message>>;
    /// Inserts or replaces a message.
    async fn put_message(&self, message: &Message) -> OrchestratorResult<()>;
    /// Messages of one model conversation, in insertion order.
    async fn messages_for(&self, session_id: Uuid, model_id: &str) -> OrchestratorResult<Vec<Message>>;
    /// Deletes the message and every image asset no other message references,
    /// as one atomic step. Returns `false` when the message did not exist.
    async fn delete_message_cascade(&self, id: Uuid) -> OrchestratorResult<bool>;

    /// Loads the running totals of one model.
    async fn get_stats(&self, session_id: Uuid, model_id: &str) -> OrchestratorResult<Option<ModelStats>>;
    /// Inserts or replaces running totals.
    async fn put_stats(&self, stats: &ModelStats) -> OrchestratorResult<()>;

    /// Loads an image asset by content hash.
    async fn get_image(&self, id: &str) -> OrchestratorResult<Option<ImageAsset>>;
    /// Inserts or replaces an image asset.
    async fn put_image(&self, asset: &ImageAsset) -> OrchestratorResult<()>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    sessions: HashMap<Uuid, Session>,
    messages: HashMap<Uuid, Message>,
    message_order: Vec<Uuid>,
    stats: HashMap<(Uuid, String), ModelStats>,
    images: HashMap<String, ImageAsset>,
}

/// In-process store used by the CLI and tests.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    inner: RwLock<MemoryInner>,
}

impl MemoryPersistence {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored image assets.
    pub async fn image_count(&self) -> usize {
        self.inner.read().await.images.len()
    }

    /// Number of stored messages.
    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn get_session(&self, id: Uuid) -> OrchestratorResult<Option<Session>> {
        Ok(self.inner.read().await.sessions.get(&id).cloned())
    }

    async fn put_session(&self, session: &Session) -> OrchestratorResult<()> {
        self.inner
            .write()
            .await
            .sessions
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> OrchestratorResult<Option<Message>> {
        Ok(self.inner.read().await.messages.get(&id).cloned())
    }

    async fn put_message(&self, message: &Message) -> OrchestratorResult<()> {
        let mut inner = self.inner.write().await;
        if inner.messages.insert(message.id, message.clone()).is_none() {
            inner.message_order.push(message.id);
        }
        trace!(message_id = %message.id, status = %message.status, "persisted message");
        Ok(())
    }

    async fn messages_for(&self, session_id: Uuid, model_id: &str) -> OrchestratorResult<Vec<Message>> {
        let inner = self.inner.read().await;
        Ok(inner
            .message_order
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .filter(|message| message.session_id == session_id && message.model_id == model_id)
            .cloned()
            .collect())
    }

    async fn delete_message_cascade(&self, id: Uuid) -> OrchestratorResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(removed) = inner.messages.remove(&id) else {
            return Ok(false);
        };
        inner.message_order.retain(|existing| *existing != id);

        let still_referenced: HashSet<&String> = inner
            .messages
            .values()
            .flat_map(|message| message.image_ids.iter())
            .collect();
        let orphaned: Vec<String> = removed
            .image_ids
            .iter()
            .filter(|image_id| !still_referenced.contains(image_id))
            .cloned()
            .collect();
        for image_id in &orphaned {
            inner.images.remove(image_id);
        }

        trace!(message_id = %id, orphaned = orphaned.len(), "deleted message");
        Ok(true)
    }

    async fn get_stats(&self, session_id: Uuid, model_id: &str) -> OrchestratorResult<Option<ModelStats>> {
        Ok(self
            .inner
            .read()
            .await
            .stats
            .get(&(session_id, model_id.to_string()))
            .cloned())
    }

    async fn put_stats(&self, stats: &ModelStats) -> OrchestratorResult<()> {
        self.inner
            .write()
            .await
            .stats
            .insert((stats.session_id, stats.model_id.clone()), stats.clone());
        Ok(())
    }

    async fn get_image(&self, id: &str) -> OrchestratorResult<Option<ImageAsset>> {
        Ok(self.inner.read().await.images.get(id).cloned())
    }

    async fn put_image(&self, asset: &ImageAsset) -> OrchestratorResult<()> {
        self.inner
            .write()
            .await
            .images
            .insert(asset.id.clone(), asset.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::models::{MessageRole, MessageStatus, Timestamp};

    fn asset(id: &str) -> ImageAsset {
        ImageAsset {
            id: id.to_string(),
            mime_type: "image/png".into(),
            width: 1,
            height: 1,
            bytes: vec![0],
            created_at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn streaming_message_round_trips_by_model() {
        let store = MemoryPersistence::new();
        let session = Session::new(vec!["m".into()]);
        let mut message = Message::streaming_placeholder(session.id, "m", Some(2));
        message.content = "partial answer".into();

        store.put_message(&message).await.unwrap();
        let other = Message::new(session.id, "other", MessageRole::User, "x", None);
        store.put_message(&other).await.unwrap();

        let loaded = store.messages_for(session.id, "m").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "partial answer");
        assert_eq!(loaded[0].run_index, Some(2));
        assert_eq!(loaded[0].status, MessageStatus::Streaming);
    }

    #[tokio::test]
    async fn messages_keep_insertion_order_across_updates() {
        let store = MemoryPersistence::new();
        let session_id = Uuid::new_v4();
        let mut first = Message::new(session_id, "m", MessageRole::User, "1", None);
        let second = Message::new(session_id, "m", MessageRole::Assistant, "2", None);

        store.put_message(&first).await.unwrap();
        store.put_message(&second).await.unwrap();
        first.content = "1 edited".into();
        store.put_message(&first).await.unwrap();

        let loaded = store.messages_for(session_id, "m").await.unwrap();
        let texts: Vec<_> = loaded.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["1 edited", "2"]);
    }

    #[tokio::test]
    async fn cascade_delete_keeps_shared_images() {
        let store = MemoryPersistence::new();
        let session_id = Uuid::new_v4();
        store.put_image(&asset("shared")).await.unwrap();
        store.put_image(&asset("own")).await.unwrap();

        let mut doomed = Message::new(session_id, "m", MessageRole::Assistant, "a", None);
        doomed.image_ids = vec!["shared".into(), "own".into()];
        let mut keeper = Message::new(session_id, "m", MessageRole::Assistant, "b", None);
        keeper.image_ids = vec!["shared".into()];
        store.put_message(&doomed).await.unwrap();
        store.put_message(&keeper).await.unwrap();

        assert!(store.delete_message_cascade(doomed.id).await.unwrap());
        assert!(!store.delete_message_cascade(doomed.id).await.unwrap());

        assert!(store.get_image("shared").await.unwrap().is_some());
        assert!(store.get_image("own").await.unwrap().is_none());
        assert_eq!(store.message_count().await, 1);
    }
}
