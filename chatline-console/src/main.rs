//! Chatline Console
//!
//! Headless two-pane messaging console: ranked conversation sidebar on the
//! left, open message thread on the right, both driven live by the sync
//! engines in `chatline-sync`. Runs against the in-memory store seeded with
//! demo data, then simulates an inbound message to show the live path.

mod config;
mod seed;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chatline_sync::{ConversationIndex, MemoryStore, Message, ThreadBuffer, ThreadEvent};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;

#[derive(Debug, Parser)]
#[command(name = "chatline", about = "Two-pane messaging console")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Conversation to open at startup (overrides the config)
    #[arg(long)]
    open: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting chatline console");

    let store = Arc::new(MemoryStore::new());
    seed::seed_demo(&store)
        .await
        .context("failed to seed demo data")?;

    let mut index = ConversationIndex::new(store.clone());
    index.load().await.context("initial sidebar load failed")?;
    if let Err(e) = index.attach_live().await {
        warn!("sidebar is running without live updates: {}", e);
    }

    print_sidebar(&index, config.console.preview_length).await;

    let open_id = match cli.open.or(config.console.open_conversation) {
        Some(id) => id,
        None => match index.conversations().await.first() {
            Some(top) => top.id.clone(),
            None => {
                info!("no conversations to open, exiting");
                return Ok(());
            }
        },
    };
    let selected = index
        .select(&open_id)
        .await
        .with_context(|| format!("unknown conversation: {}", open_id))?;

    let mut thread = ThreadBuffer::new(store.clone());
    let mut thread_events = thread.events();
    thread
        .open(&selected.id)
        .await
        .context("thread load failed")?;

    print_thread(&thread, selected.display_label()).await;

    // Exercise the live path: one inbound message flows through both feeds.
    seed::simulate_inbound(&store, &selected.id, "Gracias, ya me funciona!")
        .await
        .context("failed to commit inbound message")?;

    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), thread_events.recv())
            .await
            .context("timed out waiting for the live append")??;
        if matches!(event, ThreadEvent::Appended { .. }) {
            break;
        }
    }

    println!("\n-- live update --\n");
    print_sidebar(&index, config.console.preview_length).await;
    print_thread(&thread, selected.display_label()).await;

    Ok(())
}

/// Render the ranked sidebar with last-message previews
async fn print_sidebar(index: &ConversationIndex, preview_length: usize) {
    println!("== conversations ==");
    for conversation in index.conversations().await {
        let preview = match index.last_message(&conversation.id).await {
            Some(message) => preview_line(&message, preview_length),
            None => String::new(),
        };
        println!(
            "  {:<20} {}  {}",
            conversation.display_label(),
            conversation.last_message_at.to_rfc3339(),
            preview
        );
    }
}

/// One sidebar preview: sender tag, truncated body, delivery marker
fn preview_line(message: &Message, preview_length: usize) -> String {
    let mut text: String = message.body.chars().take(preview_length).collect();
    if message.body.chars().count() > preview_length {
        text.push('…');
    }
    let marker = if message.is_sent() { " ✓" } else { "" };
    format!("[{}] {}{}", message.sender.as_str(), text, marker)
}

/// Render the open thread, oldest first
async fn print_thread(thread: &ThreadBuffer, label: &str) {
    println!("== thread: {} ==", label);
    for message in thread.messages().await {
        println!(
            "  {} {:>6}: {}",
            message.created_at.to_rfc3339(),
            message.sender.as_str(),
            message.body
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatline_sync::SenderKind;
    use chrono::Utc;

    fn message(body: &str, status: Option<&str>) -> Message {
        Message {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            sender: SenderKind::Agent,
            body: body.to_string(),
            created_at: Utc::now(),
            status: status.map(str::to_string),
            media_url: None,
            metadata: None,
        }
    }

    #[test]
    fn test_preview_marks_sent_messages() {
        assert_eq!(
            preview_line(&message("hola", Some("sent")), 48),
            "[agent] hola ✓"
        );
        assert_eq!(preview_line(&message("hola", None), 48), "[agent] hola");
    }

    #[test]
    fn test_preview_truncates_long_bodies() {
        assert_eq!(preview_line(&message("abcdefgh", None), 4), "[agent] abcd…");
    }
}
