//! JSON frames exchanged over the relay socket.
//!
//! Every frame is an object tagged by `type`. Field names are camelCase on the
//! wire. `content` and `time` are opaque: whatever JSON the client sent is
//! relayed untouched, and an absent value stays absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-supplied timestamp, passed through untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub Value);

impl From<i64> for Timestamp {
    fn from(ms: i64) -> Self {
        Self(ms.into())
    }
}

impl From<&str> for Timestamp {
    fn from(text: &str) -> Self {
        Self(text.into())
    }
}

/// One guest in a host's allowed or pending list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PermissionEntry {
    /// Guest id.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

impl PermissionEntry {
    pub fn new(id: impl Into<String>, nickname: Option<String>) -> Self {
        Self {
            id: id.into(),
            nickname,
        }
    }
}

/// A host's `{allowed, pending}` pair.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionSnapshot {
    pub allowed: Vec<PermissionEntry>,
    pub pending: Vec<PermissionEntry>,
}

impl PermissionSnapshot {
    pub fn is_allowed(&self, guest_id: &str) -> bool {
        self.allowed.iter().any(|g| g.id == guest_id)
    }

    pub fn is_pending(&self, guest_id: &str) -> bool {
        self.pending.iter().any(|g| g.id == guest_id)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    #[default]
    Message,
}

/// A guest message buffered for an offline host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MailboxMessage {
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    pub from: String,
    #[serde(rename = "guestId", default, skip_serializing_if = "Option::is_none")]
    pub guest_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// Frames a client may send.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Inbound {
    VerifyRequest {
        #[serde(rename = "guestId")]
        guest_id: String,
        from: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        time: Option<Timestamp>,
        to: String,
    },
    AllowGuest {
        #[serde(rename = "guestId")]
        guest_id: String,
        #[serde(default)]
        nickname: Option<String>,
    },
    RejectGuest {
        #[serde(rename = "guestId")]
        guest_id: String,
    },
    RemoveGuest {
        #[serde(rename = "guestId")]
        guest_id: String,
    },
    Message {
        #[serde(rename = "guestId", default)]
        guest_id: Option<String>,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        time: Option<Timestamp>,
        #[serde(default)]
        to: Option<String>,
    },
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire name of the frame, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VerifyRequest { .. } => "verifyRequest",
            Self::AllowGuest { .. } => "allowGuest",
            Self::RejectGuest { .. } => "rejectGuest",
            Self::RemoveGuest { .. } => "removeGuest",
            Self::Message { .. } => "message",
        }
    }
}

/// Frames the relay sends.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Outbound {
    LoginFail {
        reason: String,
    },
    OfflineMessages {
        messages: Vec<MailboxMessage>,
    },
    PermissionsList {
        allowed: Vec<PermissionEntry>,
        pending: Vec<PermissionEntry>,
    },
    VerifyRequest {
        #[serde(rename = "guestId")]
        guest_id: String,
        from: String,
        #[serde(skip_serializing_if = "Value::is_null")]
        content: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        time: Option<Timestamp>,
    },
    VerifyPass,
    VerifyReject,
    Message {
        from: String,
        #[serde(rename = "guestId", skip_serializing_if = "Option::is_none")]
        guest_id: Option<String>,
        #[serde(skip_serializing_if = "Value::is_null")]
        content: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        time: Option<Timestamp>,
    },
    Error {
        message: String,
    },
    PermissionDenied {
        #[serde(rename = "guestId")]
        guest_id: String,
    },
}

impl Outbound {
    pub fn permissions(snapshot: PermissionSnapshot) -> Self {
        Self::PermissionsList {
            allowed: snapshot.allowed,
            pending: snapshot.pending,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}
