
use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::transport::{HttpTransport, TransportError, method_url};

const GET_LONG_POLL_SERVER: &str = "groups.getLongPollServer";

/// Errors raised while acquiring a long-poll session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// VK refused the call, usually a bad token or group id.
    #[error("Failed to get long poll server: {0}")]
    Credentials(String),
    /// The call did not get a usable answer.
    #[error("Failed to reach the VK API: {0}")]
    Transport(#[from] TransportError),
    /// The response lacked a usable server, key or cursor.
    #[error("Malformed long poll server response: {0}")]
    Malformed(String),
}

type Result<T> = std::result::Result<T, SessionError>;

/// What is needed to call group-scoped VK API methods.
#[derive(Clone)]
pub struct Credentials {
    /// Base URL of the VK method API, e.g. `https://api.vk.com/method/`.
    pub api_url: String,
    /// The community the bot acts for.
    pub group_id: u64,
    /// The community access token.
    pub access_token: String,
    /// The `v` parameter sent with every method call.
    pub api_version: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_url", &self.api_url)
            .field("group_id", &self.group_id)
            .field("access_token", &"<redacted>")
            .field("api_version", &self.api_version)
            .finish()
    }
}

/// A long-poll session: the server to poll, its access key and the read
/// cursor.
///
/// The triple is only ever replaced as a whole. Advancing the cursor yields a
/// new value through [`LongPollSession::with_cursor`].
#[derive(Clone, PartialEq, Eq)]
pub struct LongPollSession {
    server: String,
    key: String,
    ts: u64,
}

#[derive(Deserialize)]
struct ServerResponse {
    key: String,
    server: String,
    ts: Value,
}

impl LongPollSession {
    /// Creates a session, rejecting an empty server or key.
    pub fn new(server: impl Into<String>, key: impl Into<String>, ts: u64) -> Result<Self> {
        let server = server.into();
        let key = key.into();
        if server.is_empty() || key.is_empty() {
            return Err(SessionError::Malformed("empty server or key".to_string()));
        }
        Ok(Self { server, key, ts })
    }

    /// Requests a fresh session from `groups.getLongPollServer`.
    pub async fn acquire(
        transport: &dyn HttpTransport,
        credentials: &Credentials,
    ) -> Result<Self> {
        let url = method_url(&credentials.api_url, GET_LONG_POLL_SERVER)?;
        let params = vec![
            ("group_id".to_string(), credentials.group_id.to_string()),
            ("access_token".to_string(), credentials.access_token.clone()),
            ("v".to_string(), credentials.api_version.clone()),
        ];

        tracing::debug!("Requesting long poll server for group {}", credentials.group_id);
        let mut body = transport.get_json(&url, &params).await?;

        let Some(response) = body.get_mut("response").map(Value::take) else {
            return Err(SessionError::Credentials(describe_api_error(&body)));
        };

        let response: ServerResponse = serde_json::from_value(response)
            .map_err(|e| SessionError::Malformed(e.to_string()))?;
        let ts = parse_cursor(&response.ts)
            .ok_or_else(|| SessionError::Malformed(format!("invalid ts: {}", response.ts)))?;

        let session = Self::new(response.server, response.key, ts)?;
        tracing::info!("Acquired long poll session on {} at ts {}", session.server, session.ts);
        Ok(session)
    }

    /// The long-poll server URL.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// The session key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The cursor of the next poll.
    pub fn ts(&self) -> u64 {
        self.ts
    }

    /// Returns the same session positioned at `ts`. A cursor older than the
    /// current one is ignored.
    #[must_use]
    pub fn with_cursor(self, ts: u64) -> Self {
        if ts < self.ts {
            tracing::warn!("Ignoring cursor {ts} older than current cursor {}", self.ts);
            return self;
        }
        Self { ts, ..self }
    }
}

impl fmt::Debug for LongPollSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongPollSession")
            .field("server", &self.server)
            .field("key", &"<redacted>")
            .field("ts", &self.ts)
            .finish()
    }
}

/// Decodes a `ts` value, which VK sends either as a string or as a number.
pub(crate) fn parse_cursor(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn describe_api_error(body: &Value) -> String {
    body.get("error")
        .and_then(|e| e.get("error_msg"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}
