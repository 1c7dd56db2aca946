//! In-Memory Remote Store
//!
//! Table rows live in insertion order behind an async lock; the live feed is
//! a subscriber registry keyed by handle id. [`MemoryStore::insert`] commits
//! the row first, then fans it out to every matching subscriber while the
//! registry lock is held, so events for the same row key always arrive in
//! commit order.
//!
//! The registry uses a `std::sync::Mutex` rather than the async lock on
//! purpose: releasing a [`LiveHandle`] must deregister synchronously from a
//! `Drop` impl, which cannot await.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

use super::{ColumnFilter, LiveHandle, ReadQuery, RemoteStore, SortOrder};
use crate::error::{Result, SyncError};

#[derive(Debug)]
struct Subscriber {
    table: String,
    filter: Option<ColumnFilter>,
    tx: mpsc::UnboundedSender<Value>,
}

/// In-process [`RemoteStore`] with live insert fan-out
///
/// # Examples
///
/// ```rust
/// use chatline_sync::store::{MemoryStore, ReadQuery, RemoteStore, MESSAGES_TABLE};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new();
/// store
///     .insert(MESSAGES_TABLE, json!({"id": "m1", "conversation_id": "42"}))
///     .await
///     .unwrap();
///
/// let rows = store.bulk_read(MESSAGES_TABLE, ReadQuery::new()).await.unwrap();
/// assert_eq!(rows.len(), 1);
/// # });
/// ```
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Vec<Value>>>,
    subscribers: Arc<Mutex<HashMap<u64, Subscriber>>>,
    next_handle: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit a row, then deliver it to matching subscribers
    ///
    /// # Errors
    ///
    /// Returns an error if the row is not a JSON object.
    pub async fn insert(&self, table: &str, row: Value) -> Result<()> {
        if !row.is_object() {
            return Err(SyncError::store("insert payload must be a JSON object"));
        }

        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .push(row.clone());

        // Fan out under the registry lock so deliveries keep commit order.
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.lock().expect("subscriber registry poisoned");
            for (id, subscriber) in subscribers.iter() {
                if subscriber.table != table {
                    continue;
                }
                if let Some(filter) = &subscriber.filter {
                    if !row_matches(&row, filter) {
                        continue;
                    }
                }
                if subscriber.tx.send(row.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.lock().expect("subscriber registry poisoned");
            for id in dead {
                subscribers.remove(&id);
            }
        }

        trace!("committed row into {}", table);
        Ok(())
    }

    /// Insert a row, or replace an existing row with the same `id`
    ///
    /// Replacements model in-place updates (a conversation's refreshed
    /// activity timestamp, for instance) and therefore do not fan out on the
    /// insert feed; only a genuinely new row does.
    ///
    /// # Errors
    ///
    /// Returns an error if the row is not a JSON object or has no string
    /// `id` to match on.
    pub async fn upsert(&self, table: &str, row: Value) -> Result<()> {
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::store("upsert payload must carry a string id"))?
            .to_string();

        let replaced = {
            let mut tables = self.tables.write().await;
            let rows = tables.entry(table.to_string()).or_default();
            match rows
                .iter_mut()
                .find(|existing| existing.get("id").and_then(Value::as_str) == Some(id.as_str()))
            {
                Some(existing) => {
                    *existing = row.clone();
                    true
                }
                None => false,
            }
        };

        if replaced {
            trace!("replaced row {} in {}", id, table);
            return Ok(());
        }
        self.insert(table, row).await
    }

    /// Number of live subscriptions currently registered
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .len()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn bulk_read(&self, table: &str, query: ReadQuery) -> Result<Vec<Value>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Value> = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| match &query.filter {
                        Some(filter) => row_matches(row, filter),
                        None => true,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some((column, order)) = &query.order_by {
            rows.sort_by(|a, b| {
                let ordering = compare_columns(a, b, column);
                match order {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                }
            });
        }

        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        Ok(rows)
    }

    async fn point_read(&self, table: &str, id: &str) -> Result<Option<Value>> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|rows| {
            rows.iter()
                .find(|row| row.get("id").and_then(Value::as_str) == Some(id))
                .cloned()
        }))
    }

    async fn subscribe(&self, table: &str, filter: Option<ColumnFilter>) -> Result<LiveHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_handle.fetch_add(1, AtomicOrdering::SeqCst);

        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .insert(
                id,
                Subscriber {
                    table: table.to_string(),
                    filter,
                    tx,
                },
            );

        debug!("subscription {} registered on {}", id, table);

        let registry = Arc::clone(&self.subscribers);
        Ok(LiveHandle::new(rx, move || {
            registry
                .lock()
                .expect("subscriber registry poisoned")
                .remove(&id);
            debug!("subscription {} released", id);
        }))
    }
}

fn row_matches(row: &Value, filter: &ColumnFilter) -> bool {
    match row.get(&filter.column) {
        Some(Value::String(s)) => s == &filter.value,
        Some(Value::Number(n)) => n.to_string() == filter.value,
        _ => false,
    }
}

fn compare_columns(a: &Value, b: &Value, column: &str) -> Ordering {
    match (a.get(column), b.get(column)) {
        (Some(Value::String(x)), Some(Value::String(y))) => compare_strings(x, y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

/// RFC3339 values with mixed sub-second precision do not order
/// lexicographically (`…00Z` sorts after `…00.5Z`), so values that parse
/// as timestamps are compared as instants, everything else as plain
/// strings.
fn compare_strings(x: &str, y: &str) -> Ordering {
    match (x.parse::<DateTime<Utc>>(), y.parse::<DateTime<Utc>>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => x.cmp(y),
    }
}
