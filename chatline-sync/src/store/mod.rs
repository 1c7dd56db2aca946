//! Remote Store Abstraction
//!
//! Defines the capability the sync engines consume: one-shot bulk and point
//! reads over dynamically shaped rows, plus an insert-only live feed with an
//! optional single-column equality filter.
//!
//! Delivery ordering contract for the feed: for a single filter, events for
//! the same row key arrive in the order the underlying inserts committed. No
//! ordering is guaranteed across different filters or tables.
//!
//! [`MemoryStore`] is the in-process implementation used by the console
//! binary and the test suite.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

mod memory;

pub use memory::MemoryStore;

/// Table holding conversation rows
pub const CONVERSATIONS_TABLE: &str = "conversations";

/// Table holding message rows
pub const MESSAGES_TABLE: &str = "messages";

/// Sort direction for bulk reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Single-column equality predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFilter {
    /// Column name
    pub column: String,

    /// Value the column must equal
    pub value: String,
}

impl ColumnFilter {
    /// Create an equality filter on one column
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Parameters for a one-shot bulk read
///
/// # Examples
///
/// ```rust
/// use chatline_sync::store::{ColumnFilter, ReadQuery, SortOrder};
///
/// let query = ReadQuery::new()
///     .filter(ColumnFilter::eq("conversation_id", "42"))
///     .order_by("created_at", SortOrder::Descending)
///     .limit(1);
/// assert_eq!(query.limit, Some(1));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ReadQuery {
    /// Optional equality filter
    pub filter: Option<ColumnFilter>,

    /// Optional ordering column and direction
    pub order_by: Option<(String, SortOrder)>,

    /// Optional maximum number of rows
    pub limit: Option<usize>,
}

impl ReadQuery {
    /// Create an unconstrained query (all rows, store order)
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to rows where `filter.column == filter.value`
    pub fn filter(mut self, filter: ColumnFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Order results by a column
    pub fn order_by(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some((column.into(), order));
        self
    }

    /// Cap the number of returned rows
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Handle to a live insert feed
///
/// Receives newly committed rows for one table, optionally narrowed by a
/// server-side equality filter. Dropping (or explicitly closing) the handle
/// synchronously releases the subscription; the feed never delivers to a
/// released handle.
pub struct LiveHandle {
    rx: mpsc::UnboundedReceiver<Value>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LiveHandle {
    /// Build a handle from a row channel and a release action
    ///
    /// The release action runs exactly once, on [`close`](Self::close) or
    /// drop, and must deregister the subscription synchronously.
    pub fn new(rx: mpsc::UnboundedReceiver<Value>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            release: Some(Box::new(release)),
        }
    }

    /// Receive the next inserted row
    ///
    /// Returns `None` once the feed is closed and all buffered events have
    /// been drained.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Release the subscription
    ///
    /// Idempotent. Events already in flight before the release are still
    /// readable; nothing new is delivered afterwards.
    pub fn close(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        self.rx.close();
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for LiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveHandle")
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Remote relational store consumed by the sync engines
///
/// All calls are asynchronous I/O; none of them block the event loop. The
/// engines treat every failure as transient: prior state stays in place and
/// no retry is scheduled.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// One-shot query returning the matching rows at call time
    async fn bulk_read(&self, table: &str, query: ReadQuery) -> Result<Vec<Value>>;

    /// One-shot query returning a single row by identity, if present
    async fn point_read(&self, table: &str, id: &str) -> Result<Option<Value>>;

    /// Register for insert events on a table
    ///
    /// # Errors
    ///
    /// Returns an error if the feed cannot be established; callers degrade
    /// to bulk-loaded state in that case.
    async fn subscribe(&self, table: &str, filter: Option<ColumnFilter>) -> Result<LiveHandle>;
}
