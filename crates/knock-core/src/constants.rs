//! Wire-level constants shared by the server and its clients.

/// WebSocket close code sent after a failed host login (policy violation).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Reason carried by `loginFail` and the close frame on a password mismatch.
pub const LOGIN_FAIL_REASON: &str = "密码错误";

/// Body of the `error` notification for payloads that cannot be handled.
pub const MALFORMED_PAYLOAD: &str = "消息格式错误";

/// Body of the 400 response for a handshake missing `id` or `role`.
pub const MISSING_HANDSHAKE_PARAMS: &str = "缺少ID或角色参数";

/// Body of the 400 response for a handshake with an unknown `role`.
pub const UNKNOWN_ROLE: &str = "未知角色参数";

/// Plain-HTTP banner for non-upgrade requests.
pub const BANNER: &str = "信令服务器运行中";

/// `from` field stamped on messages originating from a host.
pub const HOST_SENDER: &str = "i";
