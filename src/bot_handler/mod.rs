
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    dispatcher::{HandlerError, Update, UpdateHandler, UpdateKind},
    messaging::MessagingService,
};

/// The bot logic: answers a trigger phrase with a fixed reply.
pub struct BotHandler {
    messaging_service: Arc<dyn MessagingService>,
    // Compared case-insensitively against the whole message text.
    trigger: String,
    reply: String,
}

impl BotHandler {
    /// Creates a new `BotHandler` instance.
    pub fn new(
        messaging_service: Arc<dyn MessagingService>,
        trigger: impl Into<String>,
        reply: impl Into<String>,
    ) -> Self {
        Self { messaging_service, trigger: trigger.into().to_lowercase(), reply: reply.into() }
    }

    fn is_trigger(&self, text: &str) -> bool {
        text.to_lowercase() == self.trigger
    }
}

#[async_trait]
impl UpdateHandler for BotHandler {
    async fn handle(&self, update: &Update) -> Result<(), HandlerError> {
        match update.kind {
            UpdateKind::MessageNew => {
                if !self.is_trigger(&update.text) {
                    tracing::debug!(
                        "Ignoring message {} from {}",
                        update.message_id,
                        update.sender_id
                    );
                    return Ok(());
                }
                self.messaging_service.send_message(update.sender_id, &self.reply).await?;
                Ok(())
            }
        }
    }
}
