//! Message-type contracts published on the realtime link
//!
//! The connection manager never looks past the envelope `type`; these structs
//! exist for subscribers that want typed access via [`Message::decode_as`].
//!
//! [`Message::decode_as`]: crate::Message::decode_as

use serde::{Deserialize, Serialize};

/// Envelope `type` values used by the product
pub mod kinds {
    pub const PRESENCE: &str = "presence";
    pub const CALL: &str = "call";
    pub const RECORDING: &str = "recording";
    pub const CHAT_NOTIFICATION: &str = "chat-notification";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub email: String,
    pub status: PresenceStatus,
    #[serde(default)]
    pub name: Option<String>,
}

/// A user's presence changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user: PresenceUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallAction {
    Invite,
    Accept,
    Decline,
    End,
    #[serde(other)]
    Unknown,
}

/// Video-call orchestration signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignal {
    pub action: CallAction,
    pub call_id: String,
    pub from: String,
    #[serde(default)]
    pub room_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Started,
    Stopped,
    Ready,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Recording lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    pub recording_id: String,
    pub state: RecordingState,
    #[serde(default)]
    pub call_id: Option<String>,
}

/// New chat message notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatNotification {
    pub chat_id: String,
    pub from: String,
    #[serde(default)]
    pub preview: String,
}
