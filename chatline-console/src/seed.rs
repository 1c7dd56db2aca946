//! Demo Seed Data
//!
//! Populates the in-memory store with a handful of conversations so the
//! console has something to rank and open, and simulates an inbound message
//! to exercise the live feeds.

use anyhow::Result;
use chatline_sync::{MemoryStore, RemoteStore, CONVERSATIONS_TABLE, MESSAGES_TABLE};
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

/// Seed a small set of conversations with message history
pub async fn seed_demo(store: &MemoryStore) -> Result<()> {
    let now = Utc::now();

    let contacts = [
        ("conv-ana", Some("Ana"), "+34600111222", 5i64),
        ("conv-bruno", Some("Bruno"), "+34600333444", 42),
        ("conv-unknown", None, "+34600999888", 180),
    ];

    for (id, name, number, minutes_ago) in contacts {
        let last = now - Duration::minutes(minutes_ago);
        let mut row = json!({
            "id": id,
            "phone_number": number,
            "last_message_at": last,
            "created_at": now - Duration::days(30),
        });
        if let Some(name) = name {
            row["contact_name"] = json!(name);
        }
        store.insert(CONVERSATIONS_TABLE, row).await?;

        for (offset, sender, body) in [
            (minutes_ago + 10, "user", "Hola, tengo una pregunta"),
            (minutes_ago + 5, "bot", "Un agente te responde en breve"),
            (minutes_ago, "agent", "Hola! Dime en que puedo ayudarte"),
        ] {
            store
                .insert(
                    MESSAGES_TABLE,
                    json!({
                        "id": Uuid::new_v4().to_string(),
                        "conversation_id": id,
                        "sender_type": sender,
                        "message": body,
                        "created_at": now - Duration::minutes(offset),
                        "status": "sent",
                    }),
                )
                .await?;
        }
    }

    Ok(())
}

/// Commit one inbound message on a conversation, refreshing its activity
///
/// Writes the conversation row first, then the message, matching the order
/// the remote store commits in: by the time the insert event fires, the
/// refreshed conversation is point-readable.
pub async fn simulate_inbound(store: &MemoryStore, conversation_id: &str, body: &str) -> Result<()> {
    let now = Utc::now();

    if let Some(mut row) = store.point_read(CONVERSATIONS_TABLE, conversation_id).await? {
        row["last_message_at"] = json!(now);
        store.upsert(CONVERSATIONS_TABLE, row).await?;
    }

    store
        .insert(
            MESSAGES_TABLE,
            json!({
                "id": Uuid::new_v4().to_string(),
                "conversation_id": conversation_id,
                "sender_type": "user",
                "message": body,
                "created_at": now,
            }),
        )
        .await?;

    Ok(())
}
