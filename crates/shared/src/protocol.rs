use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, MessageKind, ReactionSummary, RoomId, RoomKind, UserId};

/// Event name carried by a freshly persisted message on its room channel.
pub const MESSAGE_CREATED_EVENT: &str = "message_created";
/// Event name carried when a message's reaction set changes.
pub const REACTION_CHANGED_EVENT: &str = "reaction_changed";

const ROOM_CHANNEL_PREFIX: &str = "room:";

pub fn room_channel_name(room_id: RoomId) -> String {
    format!("{ROOM_CHANNEL_PREFIX}{}", room_id.0)
}

pub fn room_id_from_channel(channel: &str) -> Option<RoomId> {
    channel
        .strip_prefix(ROOM_CHANNEL_PREFIX)?
        .parse::<i64>()
        .ok()
        .map(RoomId)
}

/// Status reported by the pub/sub transport for one channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

/// A best-effort broadcast published on a named channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub channel: String,
    pub event: String,
    pub payload: serde_json::Value,
}

/// Frames the server pushes down a channel WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TransportFrame {
    Status {
        channel: String,
        status: ChannelStatus,
    },
    Event(BroadcastEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionChangedPayload {
    pub id: MessageId,
    pub room_id: RoomId,
    pub reactions: Vec<ReactionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub user_id: UserId,
    pub channel_id: RoomId,
    pub last_read_message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDmRequest {
    pub user_id: UserId,
    pub target_user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub user_id: UserId,
    pub name: String,
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionRequest {
    pub user_id: UserId,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCreatedResponse {
    pub room_id: RoomId,
    pub kind: RoomKind,
    pub created: bool,
}
