//! Chatline Sync Engine
//!
//! Realtime synchronization core for a two-pane messaging console: a ranked
//! conversation sidebar and a single open message thread, both kept
//! consistent with a remote relational store that pushes live row-insert
//! events independently of the initial bulk fetch.
//!
//! Two reconciliation engines share one [`store::RemoteStore`]:
//!
//! - [`ConversationIndex`] owns the sidebar — the conversation sequence
//!   ranked by descending last activity plus a cached most-recent message
//!   per conversation — and re-ranks it on every bulk load and live event.
//! - [`ThreadBuffer`] owns the ascending message sequence for exactly one
//!   selected conversation, reset wholesale on every selection change.
//!
//! Both consume the same insert feed but filter and fold it differently;
//! each holds its own subscription, released when the owning view goes
//! away. No failure is fatal: reads that fail degrade to the last known
//! good state, and a feed that cannot be established leaves an engine on
//! its bulk-loaded snapshot until it is re-attached.

pub mod index;
pub mod model;
pub mod store;
pub mod thread;

mod error;

pub use error::{Result, SyncError};
pub use index::{ConversationIndex, IndexEvent};
pub use model::{Conversation, Message, SenderKind, STATUS_SENT};
pub use store::{
    ColumnFilter, LiveHandle, MemoryStore, ReadQuery, RemoteStore, SortOrder,
    CONVERSATIONS_TABLE, MESSAGES_TABLE,
};
pub use thread::{ThreadBuffer, ThreadEvent};
