//! # State store
//!
//! Single owner of the in-memory session state. Every mutation is a
//! synchronous closure applied under a lock that is never held across an
//! `.await`; subscribers learn about changes through a broadcast channel.

use shared::models::{Message, ModelStats, Session, TokenUsage};
use std::{
    collections::{HashMap, HashSet},
    sync::{PoisonError, RwLock},
};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::cost::CostVerification;

const EVENT_CAPACITY: usize = 1024;

type ModelKey = (Uuid, String);

fn model_key(session_id: Uuid, model_id: &str) -> ModelKey {
    (session_id, model_id.to_string())
}

/// Change notifications published by the [`StateStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    /// A session was created or its aggregates changed.
    SessionUpdated {
        /// Affected session.
        session_id: Uuid,
    },
    /// A message was added or changed.
    MessageUpdated {
        /// Owning session.
        session_id: Uuid,
        /// Owning model conversation.
        model_id: String,
        /// Changed message.
        message_id: Uuid,
    },
    /// Messages were deleted.
    MessagesRemoved {
        /// Owning session.
        session_id: Uuid,
        /// Owning model conversation.
        model_id: String,
        /// Deleted messages.
        message_ids: Vec<Uuid>,
    },
    /// Running totals of a model changed.
    StatsUpdated {
        /// Owning session.
        session_id: Uuid,
        /// Model whose totals changed.
        model_id: String,
    },
    /// A model started or stopped streaming.
    StreamingChanged {
        /// Owning session.
        session_id: Uuid,
        /// Affected model.
        model_id: String,
        /// Whether any run of the model is streaming.
        streaming: bool,
    },
    /// The last error of a model was set or cleared.
    ModelError {
        /// Owning session.
        session_id: Uuid,
        /// Affected model.
        model_id: String,
        /// Error text; `None` once cleared.
        error: Option<String>,
    },
    /// Streamed and looked-up cost of a run were compared.
    CostVerified {
        /// Owning session.
        session_id: Uuid,
        /// Model of the run.
        model_id: String,
        /// Run index, `None` for single-run sends.
        run_index: Option<u32>,
        /// Comparison result.
        verification: CostVerification,
    },
}

#[derive(Debug, Default)]
struct StateInner {
    sessions: HashMap<Uuid, Session>,
    messages: HashMap<ModelKey, Vec<Message>>,
    stats: HashMap<ModelKey, ModelStats>,
    streaming: HashSet<ModelKey>,
    errors: HashMap<ModelKey, String>,
}

/// Sessions, messages, stats and streaming flags shared by every run.
#[derive(Debug)]
pub struct StateStore {
    inner: RwLock<StateInner>,
    events: broadcast::Sender<StateEvent>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(StateInner::default()),
            events,
        }
    }

    /// Receiver of every later event.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Publishes `event`. Having no subscriber is not an error.
    pub fn notify(&self, event: StateEvent) {
        let _ = self.events.send(event);
    }

    fn read<R>(&self, f: impl FnOnce(&StateInner) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<R>(&self, f: impl FnOnce(&mut StateInner) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Inserts or replaces a session.
    pub fn upsert_session(&self, session: Session) {
        let session_id = session.id;
        self.write(|inner| inner.sessions.insert(session_id, session));
        self.notify(StateEvent::SessionUpdated { session_id });
    }

    /// Snapshot of a session.
    #[must_use]
    pub fn session(&self, session_id: Uuid) -> Option<Session> {
        self.read(|inner| inner.sessions.get(&session_id).cloned())
    }

    /// Applies `f` to the session and returns its result, or `None` when the
    /// session is unknown.
    pub fn update_session<R>(&self, session_id: Uuid, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let result = self.write(|inner| inner.sessions.get_mut(&session_id).map(f));
        if result.is_some() {
            self.notify(StateEvent::SessionUpdated { session_id });
        }
        result
    }

    /// Messages of one model conversation, oldest first.
    #[must_use]
    pub fn messages(&self, session_id: Uuid, model_id: &str) -> Vec<Message> {
        self.read(|inner| {
            inner
                .messages
                .get(&model_key(session_id, model_id))
                .cloned()
                .unwrap_or_default()
        })
    }

    /// Snapshot of one message.
    #[must_use]
    pub fn message(&self, session_id: Uuid, model_id: &str, message_id: Uuid) -> Option<Message> {
        self.read(|inner| {
            inner
                .messages
                .get(&model_key(session_id, model_id))
                .and_then(|messages| messages.iter().find(|m| m.id == message_id))
                .cloned()
        })
    }

    /// Appends a message to its model conversation.
    pub fn push_message(&self, message: Message) {
        let event = StateEvent::MessageUpdated {
            session_id: message.session_id,
            model_id: message.model_id.clone(),
            message_id: message.id,
        };
        self.write(|inner| {
            inner
                .messages
                .entry(model_key(message.session_id, &message.model_id))
                .or_default()
                .push(message);
        });
        self.notify(event);
    }

    /// Read-modify-write of one message. Returns the updated snapshot.
    pub fn update_message(
        &self,
        session_id: Uuid,
        model_id: &str,
        message_id: Uuid,
        f: impl FnOnce(&mut Message),
    ) -> Option<Message> {
        let updated = self.write(|inner| {
            let message = inner
                .messages
                .get_mut(&model_key(session_id, model_id))?
                .iter_mut()
                .find(|m| m.id == message_id)?;
            f(message);
            message.touch();
            Some(message.clone())
        });
        if updated.is_some() {
            self.notify(StateEvent::MessageUpdated {
                session_id,
                model_id: model_id.to_string(),
                message_id,
            });
        }
        updated
    }

    /// Drops messages from a model conversation.
    pub fn remove_messages(&self, session_id: Uuid, model_id: &str, message_ids: &[Uuid]) {
        if message_ids.is_empty() {
            return;
        }
        self.write(|inner| {
            if let Some(messages) = inner.messages.get_mut(&model_key(session_id, model_id)) {
                messages.retain(|m| !message_ids.contains(&m.id));
            }
        });
        self.notify(StateEvent::MessagesRemoved {
            session_id,
            model_id: model_id.to_string(),
            message_ids: message_ids.to_vec(),
        });
    }

    /// Running totals of one model.
    #[must_use]
    pub fn stats(&self, session_id: Uuid, model_id: &str) -> Option<ModelStats> {
        self.read(|inner| inner.stats.get(&model_key(session_id, model_id)).cloned())
    }

    /// Folds one run's usage into the model's stats, creating them on first use.
    pub fn record_stats(
        &self,
        session_id: Uuid,
        model_id: &str,
        usage: TokenUsage,
        cost: Option<f64>,
    ) -> ModelStats {
        let stats = self.write(|inner| {
            let stats = inner
                .stats
                .entry(model_key(session_id, model_id))
                .or_insert_with(|| ModelStats::new(session_id, model_id));
            stats.record(usage, cost);
            stats.clone()
        });
        self.notify(StateEvent::StatsUpdated {
            session_id,
            model_id: model_id.to_string(),
        });
        stats
    }

    /// Marks the model as streaming or idle; notifies only on change.
    pub fn set_streaming(&self, session_id: Uuid, model_id: &str, streaming: bool) {
        let changed = self.write(|inner| {
            let key = model_key(session_id, model_id);
            if streaming {
                inner.streaming.insert(key)
            } else {
                inner.streaming.remove(&key)
            }
        });
        if changed {
            self.notify(StateEvent::StreamingChanged {
                session_id,
                model_id: model_id.to_string(),
                streaming,
            });
        }
    }

    /// Whether the model is marked as streaming.
    #[must_use]
    pub fn is_streaming(&self, session_id: Uuid, model_id: &str) -> bool {
        self.read(|inner| inner.streaming.contains(&model_key(session_id, model_id)))
    }

    /// Sets or clears the per-model error slot.
    pub fn set_model_error(&self, session_id: Uuid, model_id: &str, error: Option<String>) {
        let changed = self.write(|inner| {
            let key = model_key(session_id, model_id);
            match &error {
                Some(text) => inner.errors.insert(key, text.clone()).as_ref() != Some(text),
                None => inner.errors.remove(&key).is_some(),
            }
        });
        if changed {
            self.notify(StateEvent::ModelError {
                session_id,
                model_id: model_id.to_string(),
                error,
            });
        }
    }

    /// Last error of the model.
    #[must_use]
    pub fn model_error(&self, session_id: Uuid, model_id: &str) -> Option<String> {
        self.read(|inner| inner.errors.get(&model_key(session_id, model_id)).cloned())
    }

    /// Replaces the state of one session with what was loaded from storage.
    pub fn hydrate(&self, session: Session, messages: Vec<Message>, stats: Vec<ModelStats>) {
        let session_id = session.id;
        self.write(|inner| {
            inner.messages.retain(|(id, _), _| *id != session_id);
            inner.stats.retain(|(id, _), _| *id != session_id);
            for message in messages {
                inner
                    .messages
                    .entry(model_key(session_id, &message.model_id))
                    .or_default()
                    .push(message);
            }
            for entry in stats {
                inner
                    .stats
                    .insert(model_key(session_id, &entry.model_id), entry);
            }
            inner.sessions.insert(session_id, session);
        });
        self.notify(StateEvent::SessionUpdated { session_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::models::MessageRole;

    #[test]
    fn update_message_mutates_in_place_and_notifies() {
        let store = StateStore::new();
        let mut events = store.subscribe();
        let session = Session::new(vec!["m".into()]);
        let message = Message::streaming_placeholder(session.id, "m", None);
        let message_id = message.id;
        store.push_message(message);

        let updated = store
            .update_message(session.id, "m", message_id, |m| m.content.push_str("hi"))
            .expect("message exists");

        assert_eq!(updated.content, "hi");
        assert_eq!(store.messages(session.id, "m")[0].content, "hi");
        assert!(matches!(events.try_recv(), Ok(StateEvent::MessageUpdated { .. })));
        assert!(matches!(events.try_recv(), Ok(StateEvent::MessageUpdated { .. })));
        assert!(store.update_message(session.id, "other", message_id, |_| {}).is_none());
    }

    #[test]
    fn stats_are_created_lazily_and_accumulate() {
        let store = StateStore::new();
        let session_id = Uuid::new_v4();
        assert!(store.stats(session_id, "m").is_none());

        store.record_stats(session_id, "m", TokenUsage::new(10, 5), Some(0.5));
        let stats = store.record_stats(session_id, "m", TokenUsage::new(1, 1), None);

        assert_eq!((stats.input_tokens, stats.output_tokens), (11, 6));
        assert!((stats.cost - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn streaming_flag_and_error_slot_notify_only_on_change() {
        let store = StateStore::new();
        let mut events = store.subscribe();
        let session_id = Uuid::new_v4();

        store.set_streaming(session_id, "m", true);
        store.set_streaming(session_id, "m", true);
        store.set_model_error(session_id, "m", Some("boom".into()));
        store.set_model_error(session_id, "m", Some("boom".into()));
        store.set_model_error(session_id, "m", None);

        assert!(store.is_streaming(session_id, "m"));
        assert!(store.model_error(session_id, "m").is_none());
        let mut count = 0;
        while events.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn remove_and_hydrate() {
        let store = StateStore::new();
        let session = Session::new(vec!["m".into()]);
        let first = Message::new(session.id, "m", MessageRole::User, "a", None);
        let second = Message::new(session.id, "m", MessageRole::Assistant, "b", None);
        store.push_message(first.clone());
        store.push_message(second.clone());

        store.remove_messages(session.id, "m", &[second.id]);
        assert_eq!(store.messages(session.id, "m").len(), 1);

        store.hydrate(session.clone(), vec![second.clone()], Vec::new());
        let messages = store.messages(session.id, "m");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, second.id);
        assert_eq!(store.session(session.id), Some(session));
    }
}
