//! Thread Buffer
//!
//! Owns the message sequence for exactly one open conversation, ascending
//! by creation time and append-only for the life of a selection. Opening a
//! conversation registers a server-side filtered feed, then replaces the
//! buffer from a bulk read; events that landed while the read was in
//! flight are spliced onto the tail, since the snapshot predates their
//! commit. Live events are appended blind, on the feed's guarantee that
//! insert-order delivery matches creation order. No client-side re-sort.
//!
//! Every open bumps a generation counter. A bulk response or live event
//! carrying a superseded generation is discarded, so switching
//! conversations can never leak a stale message into the new buffer, and a
//! closed view is never mutated by an event still in flight.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::Message;
use crate::store::{ColumnFilter, ReadQuery, RemoteStore, SortOrder, MESSAGES_TABLE};

/// Capacity of the thread event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted by the thread buffer
///
/// [`Loaded`](Self::Loaded) and [`Appended`](Self::Appended) both change the
/// visible tail; the consuming view is expected to move viewport focus to
/// the newest entry on either. The buffer signals the side effect, it never
/// performs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadEvent {
    /// Buffer replaced wholesale by a bulk load
    Loaded {
        /// Conversation the buffer now holds
        conversation_id: String,
        /// Number of messages loaded
        messages: usize,
    },

    /// A live message was appended to the tail
    Appended {
        /// Conversation the buffer holds
        conversation_id: String,
    },

    /// Buffer cleared (conversation deselected or replaced)
    Cleared,
}

#[derive(Debug, Default)]
struct ThreadState {
    /// Conversation this buffer is open on, if any
    conversation_id: Option<String>,

    /// Messages in ascending creation order
    messages: Vec<Message>,

    /// Bumped on every open/close; stale work is discarded against it
    generation: u64,
}

/// Ordered message buffer for the open conversation
///
/// Single-writer state object: all mutations go through [`open`],
/// [`apply_insert`] and [`close`]. Each open owns one filtered feed
/// subscription, released when the selection changes or the buffer drops.
///
/// [`open`]: Self::open
/// [`apply_insert`]: Self::apply_insert
/// [`close`]: Self::close
pub struct ThreadBuffer {
    store: Arc<dyn RemoteStore>,
    state: Arc<RwLock<ThreadState>>,
    events: broadcast::Sender<ThreadEvent>,
    live: Option<JoinHandle<()>>,
}

impl ThreadBuffer {
    /// Create a closed buffer over a store
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            state: Arc::new(RwLock::new(ThreadState::default())),
            events,
            live: None,
        }
    }

    /// Subscribe to thread events
    pub fn events(&self) -> broadcast::Receiver<ThreadEvent> {
        self.events.subscribe()
    }

    /// Open a conversation: subscribe, bulk load, replace wholesale
    ///
    /// Always a full reset — any previous conversation's subscription is
    /// released and its messages discarded first. The feed is registered
    /// before the bulk read so no committed insert falls between the two.
    ///
    /// # Errors
    ///
    /// Returns an error if the bulk read fails; the feed is released and
    /// the buffer left closed, so no tail without history can build up. A
    /// subscription failure alone is degraded mode: the bulk snapshot is
    /// correct but receives no live updates until the conversation is
    /// reopened.
    pub async fn open(&mut self, conversation_id: &str) -> Result<()> {
        self.close().await;

        let generation = {
            let mut state = self.state.write().await;
            state.generation += 1;
            state.conversation_id = Some(conversation_id.to_string());
            state.generation
        };

        let filter = ColumnFilter::eq("conversation_id", conversation_id);
        match self.store.subscribe(MESSAGES_TABLE, Some(filter.clone())).await {
            Ok(mut handle) => {
                let state = Arc::clone(&self.state);
                let events = self.events.clone();
                self.live = Some(tokio::spawn(async move {
                    while let Some(row) = handle.recv().await {
                        append_event(&state, &events, generation, row).await;
                    }
                    debug!("thread insert feed closed");
                }));
            }
            Err(e) => {
                warn!(
                    "thread subscription failed for {}, continuing without live updates: {}",
                    conversation_id, e
                );
            }
        }

        let query = ReadQuery::new()
            .filter(filter)
            .order_by("created_at", SortOrder::Ascending);
        let rows = match self.store.bulk_read(MESSAGES_TABLE, query).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("thread bulk load failed for {}: {}", conversation_id, e);
                // Without history the feed would append onto an empty
                // buffer; release it and leave the buffer closed.
                if let Some(task) = self.live.take() {
                    task.abort();
                }
                let mut state = self.state.write().await;
                state.generation += 1;
                state.conversation_id = None;
                return Err(e);
            }
        };

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            match Message::from_row(row) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("skipping malformed message row: {}", e),
            }
        }

        let count;
        {
            let mut state = self.state.write().await;
            // A reselect may have superseded this load while it was in
            // flight; its response must not touch the new buffer.
            if state.generation != generation {
                debug!(
                    "discarding stale bulk load for {} (superseded)",
                    conversation_id
                );
                return Ok(());
            }
            // Live events may have landed while the read was in flight;
            // the snapshot predates their commit, so splice them onto the
            // tail instead of destroying them.
            let seen: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
            let appended: Vec<Message> = state
                .messages
                .drain(..)
                .filter(|m| !seen.contains(m.id.as_str()))
                .collect();
            messages.extend(appended);
            count = messages.len();
            state.messages = messages;
        }

        info!("thread {} loaded {} messages", conversation_id, count);
        let _ = self.events.send(ThreadEvent::Loaded {
            conversation_id: conversation_id.to_string(),
            messages: count,
        });
        Ok(())
    }

    /// Close the buffer, releasing the subscription and discarding state
    pub async fn close(&mut self) {
        if let Some(task) = self.live.take() {
            task.abort();
        }

        let mut state = self.state.write().await;
        state.generation += 1;
        let had_content = state.conversation_id.take().is_some() || !state.messages.is_empty();
        state.messages.clear();
        drop(state);

        if had_content {
            let _ = self.events.send(ThreadEvent::Cleared);
        }
    }

    /// Append one live insert event to the buffer
    ///
    /// Exposed for consumers that drive the feed themselves; never fails —
    /// malformed payloads are dropped, and an event for a superseded
    /// selection is discarded.
    pub async fn apply_insert(&self, row: Value) {
        let generation = self.state.read().await.generation;
        append_event(&self.state, &self.events, generation, row).await;
    }

    /// Snapshot of the buffered messages, ascending creation order
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    /// Conversation currently open, if any
    pub async fn conversation_id(&self) -> Option<String> {
        self.state.read().await.conversation_id.clone()
    }

    /// Number of buffered messages
    pub async fn len(&self) -> usize {
        self.state.read().await.messages.len()
    }

    /// Whether the buffer holds no messages
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.messages.is_empty()
    }
}

impl Drop for ThreadBuffer {
    fn drop(&mut self) {
        if let Some(task) = self.live.take() {
            task.abort();
        }
    }
}

/// Append an inserted row if the buffer is still on the same generation
async fn append_event(
    state: &Arc<RwLock<ThreadState>>,
    events: &broadcast::Sender<ThreadEvent>,
    generation: u64,
    row: Value,
) {
    let message = match Message::from_row(&row) {
        Ok(message) => message,
        Err(e) => {
            warn!("dropping malformed insert event: {}", e);
            return;
        }
    };

    let conversation_id = {
        let mut state = state.write().await;
        if state.generation != generation {
            debug!("dropping insert event for superseded thread view");
            return;
        }
        let Some(conversation_id) = state.conversation_id.clone() else {
            debug!("dropping insert event, no conversation open");
            return;
        };
        state.messages.push(message);
        conversation_id
    };

    let _ = events.send(ThreadEvent::Appended { conversation_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn message_row(id: &str, conversation_id: &str, created_at: &str) -> Value {
        json!({
            "id": id,
            "conversation_id": conversation_id,
            "sender_type": "user",
            "message": format!("body {}", id),
            "created_at": created_at
        })
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert(
                MESSAGES_TABLE,
                message_row("m2", "42", "2024-05-01T08:05:00Z"),
            )
            .await
            .unwrap();
        store
            .insert(
                MESSAGES_TABLE,
                message_row("m1", "42", "2024-05-01T08:00:00Z"),
            )
            .await
            .unwrap();
        store
            .insert(
                MESSAGES_TABLE,
                message_row("d1", "99", "2024-05-01T07:00:00Z"),
            )
            .await
            .unwrap();
        store
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_open_loads_ascending() {
        let mut buffer = ThreadBuffer::new(seeded_store().await);
        buffer.open("42").await.unwrap();

        assert_eq!(ids(&buffer.messages().await), vec!["m1", "m2"]);
        assert_eq!(buffer.conversation_id().await.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_open_emits_loaded_event() {
        let mut buffer = ThreadBuffer::new(seeded_store().await);
        let mut events = buffer.events();
        buffer.open("42").await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            ThreadEvent::Loaded {
                conversation_id: "42".to_string(),
                messages: 2
            }
        );
    }

    #[tokio::test]
    async fn test_apply_insert_appends_in_arrival_order() {
        let mut buffer = ThreadBuffer::new(seeded_store().await);
        buffer.open("42").await.unwrap();
        let mut events = buffer.events();

        buffer
            .apply_insert(message_row("m3", "42", "2024-05-01T08:10:00Z"))
            .await;

        assert_eq!(ids(&buffer.messages().await), vec!["m1", "m2", "m3"]);
        assert_eq!(
            events.recv().await.unwrap(),
            ThreadEvent::Appended {
                conversation_id: "42".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_events_into_empty_buffer_keep_arrival_order() {
        let store = Arc::new(MemoryStore::new());
        let mut buffer = ThreadBuffer::new(store);
        buffer.open("42").await.unwrap();

        for n in 0..5 {
            buffer
                .apply_insert(message_row(
                    &format!("m{}", n),
                    "42",
                    "2024-05-01T08:00:00Z",
                ))
                .await;
        }

        assert_eq!(
            ids(&buffer.messages().await),
            vec!["m0", "m1", "m2", "m3", "m4"]
        );
    }

    #[tokio::test]
    async fn test_switching_conversations_resets_buffer() {
        let store = seeded_store().await;
        let mut buffer = ThreadBuffer::new(store.clone());

        buffer.open("42").await.unwrap();
        buffer
            .apply_insert(message_row("m3", "42", "2024-05-01T08:10:00Z"))
            .await;

        buffer.open("99").await.unwrap();
        assert_eq!(ids(&buffer.messages().await), vec!["d1"]);

        // Back to "42": a fresh load, only committed history, no residue.
        buffer.open("42").await.unwrap();
        assert_eq!(ids(&buffer.messages().await), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_live_feed_honors_server_side_filter() {
        use std::time::Duration;

        let store = seeded_store().await;
        let mut buffer = ThreadBuffer::new(store.clone());
        buffer.open("42").await.unwrap();
        let mut events = buffer.events();

        // Wrong conversation first; it must never reach this buffer.
        store
            .insert(
                MESSAGES_TABLE,
                message_row("d2", "99", "2024-05-01T08:20:00Z"),
            )
            .await
            .unwrap();
        store
            .insert(
                MESSAGES_TABLE,
                message_row("m3", "42", "2024-05-01T08:25:00Z"),
            )
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for append")
            .unwrap();
        assert_eq!(
            event,
            ThreadEvent::Appended {
                conversation_id: "42".to_string()
            }
        );
        assert_eq!(ids(&buffer.messages().await), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_close_releases_subscription_and_clears() {
        let store = seeded_store().await;
        let mut buffer = ThreadBuffer::new(store.clone());
        buffer.open("42").await.unwrap();
        let mut events = buffer.events();

        buffer.close().await;
        assert!(buffer.is_empty().await);
        assert!(buffer.conversation_id().await.is_none());
        assert_eq!(events.recv().await.unwrap(), ThreadEvent::Cleared);

        // An event already decoded against the old generation is discarded.
        buffer
            .apply_insert(message_row("m9", "42", "2024-05-01T09:00:00Z"))
            .await;
        assert!(buffer.is_empty().await);
    }

    #[tokio::test]
    async fn test_reopen_releases_previous_subscription() {
        use std::time::Duration;

        let store = seeded_store().await;
        let mut buffer = ThreadBuffer::new(store.clone());
        buffer.open("42").await.unwrap();
        buffer.open("99").await.unwrap();

        // The "42" feed was released on reopen; give the aborted task a
        // moment to drop its handle.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_event_during_bulk_load_survives_replacement() {
        use std::sync::Mutex as StdMutex;
        use std::time::Duration;

        use crate::store::LiveHandle;
        use async_trait::async_trait;

        // Commits one extra row after taking the bulk snapshot and gives
        // the feed task time to append it before the snapshot is applied.
        struct LaggingStore {
            inner: MemoryStore,
            late: StdMutex<Option<Value>>,
        }

        #[async_trait]
        impl RemoteStore for LaggingStore {
            async fn bulk_read(&self, table: &str, query: ReadQuery) -> Result<Vec<Value>> {
                let rows = self.inner.bulk_read(table, query).await?;
                let late = self.late.lock().unwrap().take();
                if let Some(row) = late {
                    self.inner.insert(MESSAGES_TABLE, row).await?;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Ok(rows)
            }
            async fn point_read(&self, table: &str, id: &str) -> Result<Option<Value>> {
                self.inner.point_read(table, id).await
            }
            async fn subscribe(
                &self,
                table: &str,
                filter: Option<ColumnFilter>,
            ) -> Result<LiveHandle> {
                self.inner.subscribe(table, filter).await
            }
        }

        let inner = MemoryStore::new();
        inner
            .insert(
                MESSAGES_TABLE,
                message_row("m1", "42", "2024-05-01T08:00:00Z"),
            )
            .await
            .unwrap();
        inner
            .insert(
                MESSAGES_TABLE,
                message_row("m2", "42", "2024-05-01T08:05:00Z"),
            )
            .await
            .unwrap();
        let store = Arc::new(LaggingStore {
            inner,
            late: StdMutex::new(Some(message_row("m3", "42", "2024-05-01T08:10:00Z"))),
        });

        let mut buffer = ThreadBuffer::new(store);
        buffer.open("42").await.unwrap();

        // m3 committed after the snapshot was taken and arrived over the
        // feed while the load was in flight; it must survive the load.
        assert_eq!(ids(&buffer.messages().await), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_bulk_load_failure_releases_feed() {
        use std::time::Duration;

        use crate::store::LiveHandle;
        use async_trait::async_trait;

        struct NoHistoryStore {
            inner: MemoryStore,
        }

        #[async_trait]
        impl RemoteStore for NoHistoryStore {
            async fn bulk_read(&self, _table: &str, _query: ReadQuery) -> Result<Vec<Value>> {
                Err(crate::SyncError::store("injected failure"))
            }
            async fn point_read(&self, table: &str, id: &str) -> Result<Option<Value>> {
                self.inner.point_read(table, id).await
            }
            async fn subscribe(
                &self,
                table: &str,
                filter: Option<ColumnFilter>,
            ) -> Result<LiveHandle> {
                self.inner.subscribe(table, filter).await
            }
        }

        let store = Arc::new(NoHistoryStore {
            inner: MemoryStore::new(),
        });
        let mut buffer = ThreadBuffer::new(store.clone());
        assert!(buffer.open("42").await.is_err());
        assert!(buffer.conversation_id().await.is_none());

        // The subscription established before the failed read is released.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.inner.subscriber_count(), 0);

        // Anything the feed delivered before the release is discarded.
        buffer
            .apply_insert(message_row("m1", "42", "2024-05-01T08:00:00Z"))
            .await;
        assert!(buffer.is_empty().await);
    }

    #[tokio::test]
    async fn test_malformed_event_dropped() {
        let mut buffer = ThreadBuffer::new(seeded_store().await);
        buffer.open("42").await.unwrap();

        buffer.apply_insert(json!({"id": "m-bad"})).await;
        assert_eq!(ids(&buffer.messages().await), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_bulk_load_failure_propagates() {
        use crate::store::LiveHandle;
        use async_trait::async_trait;

        struct BrokenStore;

        #[async_trait]
        impl RemoteStore for BrokenStore {
            async fn bulk_read(&self, _table: &str, _query: ReadQuery) -> Result<Vec<Value>> {
                Err(crate::SyncError::store("injected failure"))
            }
            async fn point_read(&self, _table: &str, _id: &str) -> Result<Option<Value>> {
                Ok(None)
            }
            async fn subscribe(
                &self,
                _table: &str,
                _filter: Option<ColumnFilter>,
            ) -> Result<LiveHandle> {
                Err(crate::SyncError::subscription("injected failure"))
            }
        }

        let mut buffer = ThreadBuffer::new(Arc::new(BrokenStore));
        assert!(buffer.open("42").await.is_err());
        assert!(buffer.is_empty().await);
    }
}
