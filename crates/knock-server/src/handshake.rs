//! Query-string validation done before the WebSocket upgrade.

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use knock_core::constants::{MISSING_HANDSHAKE_PARAMS, UNKNOWN_ROLE};
use knock_core::{Role, UserId};
use secrecy::SecretString;
use serde::Deserialize;

/// Raw `?id=&role=&pwd=` parameters.
#[derive(Clone, Default, Deserialize)]
pub struct HandshakeParams {
    pub id: Option<String>,
    pub role: Option<String>,
    pub pwd: Option<String>,
}

/// Validated identity for a new connection.
#[derive(Debug)]
pub struct Handshake {
    pub user_id: UserId,
    pub role: Role,
    pub password: Option<SecretString>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("missing id or role")]
    MissingParams,
    #[error("unknown role {0:?}")]
    UnknownRole(String),
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        let body = match self {
            Self::MissingParams => MISSING_HANDSHAKE_PARAMS,
            Self::UnknownRole(_) => UNKNOWN_ROLE,
        };
        (StatusCode::BAD_REQUEST, body).into_response()
    }
}

impl HandshakeParams {
    /// Empty values count as missing. An empty `pwd` means no password.
    pub fn validate(self) -> Result<Handshake, HandshakeError> {
        let id = self.id.filter(|s| !s.is_empty());
        let role = self.role.filter(|s| !s.is_empty());
        let (Some(id), Some(role)) = (id, role) else {
            return Err(HandshakeError::MissingParams);
        };
        let role: Role = role
            .parse()
            .map_err(|e: knock_core::ids::UnknownRole| HandshakeError::UnknownRole(e.0))?;
        Ok(Handshake {
            user_id: UserId::from_raw(id),
            role,
            password: self.pwd.filter(|p| !p.is_empty()).map(SecretString::from),
        })
    }
}

/// Whether the request asks for a WebSocket upgrade.
pub fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}
