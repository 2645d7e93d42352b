
use std::{
    sync::{
        Arc,
        atomic::{AtomicI32, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use backoff::{Error as BackoffError, ExponentialBackoff, future::retry};
use mockall::automock;
use serde_json::Value;
use thiserror::Error;

use crate::{
    session::Credentials,
    transport::{HttpTransport, TransportError, method_url},
};

const MESSAGES_SEND: &str = "messages.send";

// VK error codes worth retrying: too many requests per second, internal
// server error.
const RETRYABLE_API_ERRORS: [i64; 2] = [6, 10];

/// Errors raised while sending a message.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// The request did not get a usable answer.
    #[error("Failed to reach the VK API: {0}")]
    Transport(#[from] TransportError),
    /// VK answered with an error object.
    #[error("VK API rejected the message: {0}")]
    Api(String),
}

type Result<T> = std::result::Result<T, MessagingError>;

/// Trait for sending messages to users.
#[automock]
#[async_trait]
pub trait MessagingService: Send + Sync {
    /// Sends `text` to the user `recipient_id`.
    async fn send_message(&self, recipient_id: i64, text: &str) -> Result<()>;
}

/// Sends messages through the VK `messages.send` method.
pub struct VkMessagingService {
    transport: Arc<dyn HttpTransport>,
    credentials: Credentials,
    next_random_id: AtomicI32,
}

impl VkMessagingService {
    /// Creates a new `VkMessagingService` instance.
    pub fn new(transport: Arc<dyn HttpTransport>, credentials: Credentials) -> Self {
        // Seeded from the clock so ids do not repeat across restarts.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as i32)
            .unwrap_or(1);
        Self { transport, credentials, next_random_id: AtomicI32::new(seed.max(1)) }
    }

    /// Re-usable configuration for exponential backoff.
    fn backoff_config() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            // Sends run inline in the poll loop, so a VK outage must not
            // hold it for long.
            max_elapsed_time: Some(Duration::from_secs(5)),
            multiplier: 2.0,
            ..Default::default()
        }
    }

    // Non-zero so VK deduplicates a retried send.
    fn random_id(&self) -> i32 {
        let id = self.next_random_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 { self.next_random_id.fetch_add(1, Ordering::Relaxed) } else { id }
    }

    fn check_api_error(body: &Value) -> std::result::Result<(), BackoffError<MessagingError>> {
        let Some(error) = body.get("error") else {
            return Ok(());
        };

        let code = error.get("error_code").and_then(Value::as_i64);
        let msg = error
            .get("error_msg")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());

        if code.is_some_and(|c| RETRYABLE_API_ERRORS.contains(&c)) {
            tracing::warn!("Retryable VK API error on send: {msg}. Retrying...");
            Err(BackoffError::transient(MessagingError::Api(msg)))
        } else {
            Err(BackoffError::permanent(MessagingError::Api(msg)))
        }
    }
}

#[async_trait]
impl MessagingService for VkMessagingService {
    async fn send_message(&self, recipient_id: i64, text: &str) -> Result<()> {
        let url = method_url(&self.credentials.api_url, MESSAGES_SEND)?;
        let params = vec![
            ("user_id".to_string(), recipient_id.to_string()),
            ("message".to_string(), text.to_string()),
            ("random_id".to_string(), self.random_id().to_string()),
            ("access_token".to_string(), self.credentials.access_token.clone()),
            ("v".to_string(), self.credentials.api_version.clone()),
        ];

        let operation = || async {
            let body = self.transport.get_json(&url, &params).await.map_err(|e| {
                if e.is_transient() {
                    tracing::warn!("Network error sending message: {e}. Retrying...");
                    BackoffError::transient(MessagingError::from(e))
                } else {
                    BackoffError::permanent(MessagingError::from(e))
                }
            })?;
            Self::check_api_error(&body)
        };

        let result = retry(Self::backoff_config(), operation).await;
        match &result {
            Ok(()) => tracing::debug!("Sent message to {recipient_id}"),
            Err(e) => tracing::error!("Failed to send message to {recipient_id}: {e}"),
        }
        result
    }
}
