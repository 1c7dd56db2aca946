//! Conversation Index
//!
//! Owns the ranked sidebar state: the conversation sequence ordered by
//! descending last activity, and a cached most-recent message per
//! conversation. Both are folded together from two independent inputs — one
//! bulk load at attach time and a stream of live insert events — which may
//! complete in either order.
//!
//! Merge policy:
//! - The conversation sequence is replaced wholesale by a bulk load and
//!   re-sorted from current timestamps on every mutation; arrival order is
//!   never trusted for ranking.
//! - The last-message map is keyed state. A live event overwrites its entry
//!   unconditionally (the feed preserves insert order per conversation); a
//!   bulk-loaded entry only replaces one that is equal or older, so
//!   load-then-event and event-then-load commute.
//! - An insert event names a conversation the index cannot point-read
//!   (deleted, or not yet visible): the event is dropped, the sequence
//!   stays untouched, nothing retries. The next event or reload heals it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{Conversation, Message};
use crate::store::{
    ColumnFilter, ReadQuery, RemoteStore, SortOrder, CONVERSATIONS_TABLE, MESSAGES_TABLE,
};

/// Capacity of the index event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted by the conversation index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    /// The conversation sequence was replaced by a bulk load
    Loaded {
        /// Number of conversations now in the sequence
        conversations: usize,
    },

    /// The last-message map was populated after a bulk load
    PreviewsLoaded {
        /// Number of conversations with a cached last message
        previews: usize,
    },

    /// A live insert refreshed a conversation and re-ranked the sequence
    Reranked {
        /// Conversation the triggering message belongs to
        conversation_id: String,
    },

    /// A conversation was selected for the thread view
    Selected {
        /// Selected conversation ID
        conversation_id: String,
    },
}

#[derive(Debug, Default)]
struct IndexState {
    /// Ranked sequence, descending `last_message_at`
    conversations: Vec<Conversation>,

    /// Most recent message per conversation id
    last_messages: HashMap<String, Message>,

    /// Currently selected conversation, if any
    selected: Option<String>,
}

/// Ranked conversation list with live re-ranking
///
/// Single-writer state object: all mutations go through [`load`],
/// [`apply_insert`] and [`select`]. The index holds its live feed for the
/// lifetime of the owning view; dropping the index releases it.
///
/// [`load`]: Self::load
/// [`apply_insert`]: Self::apply_insert
/// [`select`]: Self::select
pub struct ConversationIndex {
    store: Arc<dyn RemoteStore>,
    state: Arc<RwLock<IndexState>>,
    events: broadcast::Sender<IndexEvent>,
    live: Option<JoinHandle<()>>,
}

impl ConversationIndex {
    /// Create an empty index over a store
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            state: Arc::new(RwLock::new(IndexState::default())),
            events,
            live: None,
        }
    }

    /// Subscribe to index events
    pub fn events(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    /// Bulk load: conversation sequence, then last-message previews
    ///
    /// The sequence is visible (and [`IndexEvent::Loaded`] fires) before the
    /// preview lookups finish, so a consumer can render progressively.
    pub async fn load(&self) -> Result<()> {
        self.load_conversations().await?;
        self.load_last_messages().await
    }

    /// Replace the conversation sequence from a bulk read
    ///
    /// On failure the sequence is left empty, never partially populated.
    pub async fn load_conversations(&self) -> Result<()> {
        let query = ReadQuery::new().order_by("last_message_at", SortOrder::Descending);
        let rows = match self.store.bulk_read(CONVERSATIONS_TABLE, query).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("conversation bulk load failed: {}", e);
                self.state.write().await.conversations.clear();
                return Err(e);
            }
        };

        let mut conversations = Vec::with_capacity(rows.len());
        for row in &rows {
            match Conversation::from_row(row) {
                Ok(conversation) => conversations.push(conversation),
                Err(e) => warn!("skipping malformed conversation row: {}", e),
            }
        }
        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));

        let count = conversations.len();
        self.state.write().await.conversations = conversations;
        info!("loaded {} conversations", count);
        let _ = self.events.send(IndexEvent::Loaded {
            conversations: count,
        });
        Ok(())
    }

    /// Populate the last-message map for every loaded conversation
    ///
    /// One limit-1 read per conversation, issued concurrently; result order
    /// does not matter because the map is keyed. A lookup that fails is
    /// logged and skipped — the sidebar just shows no preview for that row.
    pub async fn load_last_messages(&self) -> Result<()> {
        let ids: Vec<String> = {
            let state = self.state.read().await;
            state.conversations.iter().map(|c| c.id.clone()).collect()
        };

        let lookups = ids.into_iter().map(|id| {
            let store = Arc::clone(&self.store);
            async move {
                let query = ReadQuery::new()
                    .filter(ColumnFilter::eq("conversation_id", id.clone()))
                    .order_by("created_at", SortOrder::Descending)
                    .limit(1);
                match store.bulk_read(MESSAGES_TABLE, query).await {
                    Ok(rows) => rows.first().and_then(|row| match Message::from_row(row) {
                        Ok(message) => Some(message),
                        Err(e) => {
                            warn!("skipping malformed last message for {}: {}", id, e);
                            None
                        }
                    }),
                    Err(e) => {
                        warn!("last message lookup failed for {}: {}", id, e);
                        None
                    }
                }
            }
        });
        let results = join_all(lookups).await;

        let mut state = self.state.write().await;
        let mut previews = 0usize;
        for message in results.into_iter().flatten() {
            previews += 1;
            match state.last_messages.entry(message.conversation_id.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(message);
                }
                Entry::Occupied(mut entry) => {
                    // A live event may have landed while the load was in
                    // flight; only replace it with an equal or newer row.
                    if message.created_at >= entry.get().created_at {
                        entry.insert(message);
                    }
                }
            }
        }
        drop(state);

        debug!("populated {} last-message previews", previews);
        let _ = self.events.send(IndexEvent::PreviewsLoaded { previews });
        Ok(())
    }

    /// Attach the live insert feed for the lifetime of the index
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established; the
    /// bulk-loaded state stays correct but receives no live updates until
    /// the caller attaches again.
    pub async fn attach_live(&mut self) -> Result<()> {
        if let Some(task) = &self.live {
            // A feed that closed on its own leaves a finished task behind;
            // only a running feed blocks re-attachment.
            if !task.is_finished() {
                return Ok(());
            }
        }

        let mut handle = self.store.subscribe(MESSAGES_TABLE, None).await?;
        let store = Arc::clone(&self.store);
        let state = Arc::clone(&self.state);
        let events = self.events.clone();

        self.live = Some(tokio::spawn(async move {
            while let Some(row) = handle.recv().await {
                fold_insert(&store, &state, &events, row).await;
            }
            debug!("conversation insert feed closed");
        }));
        Ok(())
    }

    /// Detach the live feed, releasing the subscription
    pub fn detach_live(&mut self) {
        if let Some(task) = self.live.take() {
            task.abort();
        }
    }

    /// Fold one live insert event into the index
    ///
    /// Exposed for consumers that drive the feed themselves; never fails —
    /// malformed payloads and unreadable conversations are dropped.
    pub async fn apply_insert(&self, row: Value) {
        fold_insert(&self.store, &self.state, &self.events, row).await;
    }

    /// Snapshot of the ranked conversation sequence
    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.read().await.conversations.clone()
    }

    /// Cached most-recent message for a conversation, if any
    pub async fn last_message(&self, conversation_id: &str) -> Option<Message> {
        self.state
            .read()
            .await
            .last_messages
            .get(conversation_id)
            .cloned()
    }

    /// Filter the sequence by a search term
    ///
    /// Case-insensitive substring match on the contact name, plain substring
    /// match on the raw address. The result is re-sorted from current
    /// timestamps rather than relying on stored order. An empty term yields
    /// the full sequence.
    pub async fn filter(&self, term: &str) -> Vec<Conversation> {
        let needle = term.to_lowercase();
        let state = self.state.read().await;
        let mut matched: Vec<Conversation> = state
            .conversations
            .iter()
            .filter(|c| {
                c.contact_name
                    .as_ref()
                    .is_some_and(|name| name.to_lowercase().contains(&needle))
                    || c.phone_number.contains(term)
            })
            .cloned()
            .collect();
        drop(state);

        matched.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        matched
    }

    /// Select a conversation, handing its identity to the thread view
    ///
    /// Returns the conversation if it is present in the sequence; selecting
    /// an unknown id is a no-op.
    pub async fn select(&self, conversation_id: &str) -> Option<Conversation> {
        let mut state = self.state.write().await;
        let found = state
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned();
        if found.is_some() {
            state.selected = Some(conversation_id.to_string());
            let _ = self.events.send(IndexEvent::Selected {
                conversation_id: conversation_id.to_string(),
            });
        }
        found
    }

    /// Currently selected conversation id, if any
    pub async fn selected(&self) -> Option<String> {
        self.state.read().await.selected.clone()
    }
}

impl Drop for ConversationIndex {
    fn drop(&mut self) {
        self.detach_live();
    }
}

/// Fold one inserted message row into index state
///
/// Step 1 updates the last-message map unconditionally (last write wins by
/// arrival order). Step 2 point-reads the conversation, because the event
/// payload carries message fields only, not the refreshed activity
/// timestamp. If the read fails or finds nothing, the sequence is left
/// byte-for-byte unchanged.
async fn fold_insert(
    store: &Arc<dyn RemoteStore>,
    state: &Arc<RwLock<IndexState>>,
    events: &broadcast::Sender<IndexEvent>,
    row: Value,
) {
    let message = match Message::from_row(&row) {
        Ok(message) => message,
        Err(e) => {
            warn!("dropping malformed insert event: {}", e);
            return;
        }
    };
    let conversation_id = message.conversation_id.clone();

    state
        .write()
        .await
        .last_messages
        .insert(conversation_id.clone(), message);

    let refreshed = match store.point_read(CONVERSATIONS_TABLE, &conversation_id).await {
        Ok(Some(row)) => match Conversation::from_row(&row) {
            Ok(conversation) => conversation,
            Err(e) => {
                warn!("dropping insert event, conversation row malformed: {}", e);
                return;
            }
        },
        Ok(None) => {
            debug!(
                "conversation {} not visible, dropping insert event",
                conversation_id
            );
            return;
        }
        Err(e) => {
            warn!("conversation refresh failed for {}: {}", conversation_id, e);
            return;
        }
    };

    {
        let mut state = state.write().await;
        if let Some(pos) = state.conversations.iter().position(|c| c.id == refreshed.id) {
            // Last activity is monotonic: a stale refresh never regresses
            // the ranking an already-newer row established.
            if state.conversations[pos].last_message_at > refreshed.last_message_at {
                return;
            }
            state.conversations.remove(pos);
        }
        state.conversations.push(refreshed);
        state
            .conversations
            .sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
    }

    let _ = events.send(IndexEvent::Reranked { conversation_id });
}
