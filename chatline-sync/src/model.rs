//! Console Data Model
//!
//! The closed Conversation/Message shapes the sync engines operate on.
//!
//! The remote store hands back dynamically shaped JSON rows. Everything
//! crossing that boundary goes through [`Conversation::from_row`] or
//! [`Message::from_row`], which validate into these types and reject rows
//! that are missing identity fields or carry an unknown sender kind. Engine
//! state never holds a raw row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};

/// Delivery-status tag distinguished for display
pub const STATUS_SENT: &str = "sent";

/// Who authored a message
///
/// Closed set; rows with any other `sender_type` are rejected at the
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    /// The external contact (end user)
    User,
    /// An automated agent
    Bot,
    /// A human agent on the console side
    Agent,
}

impl SenderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bot => "bot",
            Self::Agent => "agent",
        }
    }
}

/// A persistent thread with one external contact address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Opaque conversation ID
    pub id: String,

    /// Contact name from the address book, if known
    #[serde(default)]
    pub contact_name: Option<String>,

    /// Raw contact address
    pub phone_number: String,

    /// Timestamp of the most recent message activity
    pub last_message_at: DateTime<Utc>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Parse a store row into a conversation
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MalformedRow`] if required fields are missing,
    /// empty, or have the wrong type.
    pub fn from_row(row: &Value) -> Result<Self> {
        let conversation: Conversation = serde_json::from_value(row.clone())
            .map_err(|e| SyncError::malformed_row(format!("conversation row: {}", e)))?;

        if conversation.id.is_empty() {
            return Err(SyncError::malformed_row("conversation row: empty id"));
        }

        Ok(conversation)
    }

    /// Display label: contact name, falling back to the raw address
    pub fn display_label(&self) -> &str {
        self.contact_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.phone_number)
    }
}

/// One unit of communication within a conversation
///
/// Holds a foreign reference to its conversation by id; a message does not
/// own the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Opaque message ID
    pub id: String,

    /// Owning conversation ID
    pub conversation_id: String,

    /// Sender classification
    #[serde(rename = "sender_type")]
    pub sender: SenderKind,

    /// Body text
    #[serde(rename = "message")]
    pub body: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Optional delivery-status tag (open ended, see [`STATUS_SENT`])
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Optional media reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,

    /// Optional free-form metadata, kept opaque
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    /// Parse a store row into a message
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MalformedRow`] if required fields are missing,
    /// empty, or have the wrong type (including an unknown `sender_type`).
    pub fn from_row(row: &Value) -> Result<Self> {
        let message: Message = serde_json::from_value(row.clone())
            .map_err(|e| SyncError::malformed_row(format!("message row: {}", e)))?;

        if message.id.is_empty() {
            return Err(SyncError::malformed_row("message row: empty id"));
        }
        if message.conversation_id.is_empty() {
            return Err(SyncError::malformed_row("message row: empty conversation_id"));
        }

        Ok(message)
    }

    /// Whether the message carries the distinguished "sent" status tag
    pub fn is_sent(&self) -> bool {
        self.status.as_deref() == Some(STATUS_SENT)
    }
}
