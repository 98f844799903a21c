// mp-protocol: Pairing platform wire types and serialization.
//
// All WebSocket messages carry a top-level `type` field used for
// discriminated deserialization.  Client-to-server and server-to-client
// vocabularies overlap in tag names (`chat:message` travels both ways with
// different payloads), so each direction gets its own tagged union.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// The kind of session a client wants to be paired for.
///
/// One wait queue exists per modality; pairing never crosses modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Video,
    Audio,
    Text,
}

impl Modality {
    pub const ALL: [Modality; 3] = [Modality::Video, Modality::Audio, Modality::Text];

    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Video => "video",
            Modality::Audio => "audio",
            Modality::Text => "text",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Client -> Server messages
// ---------------------------------------------------------------------------

/// First message on every connection.  The server answers with
/// `auth:success` or `auth:error` and closes the socket on the latter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}

/// Ask to be placed in the wait queue for one modality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJoin {
    pub session_type: Modality,
}

/// Leave the wait queue for one modality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueLeave {
    pub session_type: Modality,
}

/// WebRTC offer relayed verbatim to the session partner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOffer {
    /// Opaque SDP blob; never inspected by the server.
    pub sdp: serde_json::Value,
}

/// WebRTC answer relayed verbatim to the session partner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAnswer {
    pub sdp: serde_json::Value,
}

/// ICE candidate relayed verbatim to the session partner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallIce {
    pub candidate: serde_json::Value,
}

/// In-session text message.  Bodies are relayed, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSend {
    pub text: String,
}

/// Direct call request to a friend, bypassing the wait queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendCall {
    pub friend_id: String,
    pub session_type: Modality,
}

/// Report another user.  The core records the report and nothing more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportUser {
    pub reported_user_id: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// All client-to-server message kinds.
///
/// ```json
/// { "type": "queue:join", "sessionType": "video" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "auth")]
    Auth(AuthRequest),
    #[serde(rename = "queue:join")]
    QueueJoin(QueueJoin),
    #[serde(rename = "queue:leave")]
    QueueLeave(QueueLeave),
    #[serde(rename = "match:next")]
    MatchNext,
    #[serde(rename = "call:offer")]
    CallOffer(CallOffer),
    #[serde(rename = "call:answer")]
    CallAnswer(CallAnswer),
    #[serde(rename = "call:ice")]
    CallIce(CallIce),
    #[serde(rename = "call:end")]
    CallEnd,
    #[serde(rename = "chat:message")]
    ChatMessage(ChatSend),
    #[serde(rename = "chat:typing")]
    ChatTyping,
    #[serde(rename = "chat:stop_typing")]
    ChatStopTyping,
    #[serde(rename = "friend:call")]
    FriendCall(FriendCall),
    #[serde(rename = "report:user")]
    ReportUser(ReportUser),
}

// ---------------------------------------------------------------------------
// Server -> Client messages
// ---------------------------------------------------------------------------

/// Successful handshake reply.  The client learns its own identity and the
/// server-assigned socket id here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccess {
    pub socket_id: String,
    pub user_id: String,
    pub username: String,
}

/// 1-based place in the wait queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePosition {
    pub position: usize,
}

/// A pairing was made.  Both endpoints receive one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchFound {
    pub session_id: String,
    pub partner_id: String,
    pub partner_username: String,
    pub session_type: Modality,
}

/// The partner left the session.
///
/// | Reason       | Meaning                                    |
/// |--------------|--------------------------------------------|
/// | `skip`       | partner asked for the next stranger        |
/// | `disconnect` | partner's last socket closed               |
/// | `shutdown`   | this instance is going down                |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDisconnected {
    pub reason: String,
}

/// In-session text message as delivered to the partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDeliver {
    pub sender_id: String,
    pub text: String,
    /// Server receive time, epoch milliseconds.
    pub timestamp: i64,
}

/// Confirmation that a report was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportReceived {
    pub report_id: String,
}

/// Connected-client count for this instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCount {
    pub n: usize,
}

/// Subsystem-scoped error payload (`queue:error`, `match:error`,
/// `call:error`, `auth:error`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedError {
    pub message: String,
}

/// General typed error.  `code` is one of the frozen codes below; clients
/// may retry when `retryable` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// All server-to-client message kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "auth:success")]
    AuthSuccess(AuthSuccess),
    #[serde(rename = "auth:error")]
    AuthError(ScopedError),
    #[serde(rename = "queue:position")]
    QueuePosition(QueuePosition),
    #[serde(rename = "queue:error")]
    QueueError(ScopedError),
    #[serde(rename = "match:found")]
    MatchFound(MatchFound),
    #[serde(rename = "match:disconnected")]
    MatchDisconnected(MatchDisconnected),
    #[serde(rename = "match:error")]
    MatchError(ScopedError),
    #[serde(rename = "call:offer")]
    CallOffer(CallOffer),
    #[serde(rename = "call:answer")]
    CallAnswer(CallAnswer),
    #[serde(rename = "call:ice")]
    CallIce(CallIce),
    #[serde(rename = "call:end")]
    CallEnd,
    #[serde(rename = "call:error")]
    CallError(ScopedError),
    #[serde(rename = "chat:message")]
    ChatMessage(ChatDeliver),
    #[serde(rename = "chat:typing")]
    ChatTyping,
    #[serde(rename = "chat:stop_typing")]
    ChatStopTyping,
    #[serde(rename = "report:received")]
    ReportReceived(ReportReceived),
    #[serde(rename = "user:count")]
    UserCount(UserCount),
    #[serde(rename = "error")]
    Error(ErrorMessage),
}

/// Frozen error codes.
pub mod error_codes {
    pub const AUTH_INVALID: &str = "AUTH_INVALID";
    pub const BANNED: &str = "BANNED";
    pub const VALIDATION: &str = "VALIDATION";
    pub const ALREADY_QUEUED: &str = "ALREADY_QUEUED";
    pub const NOT_IN_QUEUE: &str = "NOT_IN_QUEUE";
    pub const ALREADY_IN_SESSION: &str = "ALREADY_IN_SESSION";
    pub const NOT_IN_SESSION: &str = "NOT_IN_SESSION";
    pub const PARTNER_UNAVAILABLE: &str = "PARTNER_UNAVAILABLE";
    pub const STORE_UNAVAILABLE: &str = "STORE_UNAVAILABLE";
    pub const OVERLOADED: &str = "OVERLOADED";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Reasons carried by `match:disconnected`.
pub mod disconnect_reasons {
    pub const SKIP: &str = "skip";
    pub const DISCONNECT: &str = "disconnect";
    pub const SHUTDOWN: &str = "shutdown";
    pub const ENDED: &str = "ended";
}
