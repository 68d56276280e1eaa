use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ChannelId, MessageId, PinId, SystemMessageId, TabId, UserId};

/// Closed set of inbound event tags. `join_channel`/`leave_channel` are
/// outbound-only and never appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewMessage,
    MessageUpdated,
    MessageDeleted,
    UnreadCountChanged,
    PinCreated,
    PinDeleted,
    SystemMessageCreated,
    Ack,
    Error,
}

/// Outer wire shape of every inbound frame. Only the tag is validated here;
/// the payload stays raw JSON and is validated by whichever listener
/// consumes it. A frame whose tag is not in [`EventKind`] fails to parse and
/// is dropped by the connection layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
}

/// Outbound actions, serialized as `{type, payload}`. `Ping` carries no
/// payload and is generated internally by the connection heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientAction {
    JoinChannel {
        channel_id: ChannelId,
    },
    LeaveChannel {
        channel_id: ChannelId,
    },
    PostMessage {
        channel_id: ChannelId,
        body: String,
    },
    Typing {
        channel_id: ChannelId,
    },
    UpdateReadState {
        channel_id: ChannelId,
        last_read_message_id: MessageId,
    },
    Ping,
}

/// The single message shape carried on the cross-tab leadership bus. The
/// claiming tab's id is included only so a tab can ignore its own claim;
/// the portable contract is the type tag alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TabMessage {
    LeaderClaimed { tab_id: TabId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub system_message_id: SystemMessageId,
    pub channel_id: ChannelId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub body: String,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MessageDelete {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnreadCount {
    pub channel_id: ChannelId,
    pub unread_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    pub pin_id: PinId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// One entry in a conversation's timeline. User and system messages live in
/// separate id spaces; a timeline never treats one as a duplicate of the
/// other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineItem {
    User { user_message: UserMessage },
    System { system_message: SystemMessage },
}

impl TimelineItem {
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            TimelineItem::User { user_message } => user_message.created_at,
            TimelineItem::System { system_message } => system_message.created_at,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        match self {
            TimelineItem::User { user_message } => user_message.channel_id,
            TimelineItem::System { system_message } => system_message.channel_id,
        }
    }
}
