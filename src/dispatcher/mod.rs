
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use mockall::automock;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    client::{MESSAGE_NEW, RawEvent},
    messaging::MessagingError,
};

/// Why a handler failed on an update.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The reply could not be sent.
    #[error("Failed to send message: {0}")]
    Messaging(#[from] MessagingError),
    /// The handler panicked; carries the panic message.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// The kinds of update the bot understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// A new incoming message.
    MessageNew,
}

/// A typed event ready for the bot logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    /// What happened.
    pub kind: UpdateKind,
    /// The user who sent the message.
    pub sender_id: i64,
    /// Message text, empty for attachments-only messages.
    pub text: String,
    /// Message id within the conversation.
    pub message_id: i64,
}

/// Business logic invoked for every update.
#[automock]
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    /// Reacts to a single update.
    async fn handle(&self, update: &Update) -> Result<(), HandlerError>;
}

#[derive(Deserialize)]
struct MessageNewObject {
    message: MessageNewBody,
}

#[derive(Deserialize)]
struct MessageNewBody {
    from_id: i64,
    #[serde(default)]
    text: String,
    id: i64,
}

/// Turns raw events into [`Update`]s and routes them to the handler.
pub struct UpdateDispatcher {
    handler: Arc<dyn UpdateHandler>,
}

impl UpdateDispatcher {
    /// Creates a dispatcher routing every update to `handler`.
    pub fn new(handler: Arc<dyn UpdateHandler>) -> Self {
        Self { handler }
    }

    /// Projects `events` and hands each resulting update to the handler in
    /// order. Handler failures are logged and never abort the batch.
    pub async fn dispatch(&self, events: Vec<RawEvent>) -> Vec<Update> {
        let updates: Vec<Update> = events.into_iter().filter_map(Self::project).collect();

        for update in &updates {
            let outcome = AssertUnwindSafe(self.handler.handle(update)).catch_unwind().await;
            let result = outcome.unwrap_or_else(|panic| Err(panic_to_error(panic)));

            if let Err(e) = result {
                tracing::error!(
                    "Handler failed for message {} from {}: {e}",
                    update.message_id,
                    update.sender_id
                );
            }
        }

        updates
    }

    /// Projects a single event, returning `None` for unknown kinds and
    /// malformed payloads.
    pub fn project(event: RawEvent) -> Option<Update> {
        if event.kind != MESSAGE_NEW {
            tracing::warn!("No projection for event kind {}", event.kind);
            return None;
        }

        match serde_json::from_value::<MessageNewObject>(event.payload) {
            Ok(object) => Some(Update {
                kind: UpdateKind::MessageNew,
                sender_id: object.message.from_id,
                text: object.message.text,
                message_id: object.message.id,
            }),
            Err(e) => {
                tracing::warn!("Dropping malformed {MESSAGE_NEW} event: {e}");
                None
            }
        }
    }
}

fn panic_to_error(panic: Box<dyn Any + Send>) -> HandlerError {
    let msg = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    HandlerError::Panicked(msg)
}
