#![warn(missing_docs)]
//! A VK community bot driven by the Bots Long Poll API.
//!
//! A single background task long-polls VK for new events, turns them into
//! typed updates and hands them to the bot logic, recovering from network
//! failures and expired poll sessions until it is stopped.

/// The bot logic reacting to incoming messages.
pub mod bot_handler;
/// The long-poll client issuing one poll request at a time.
pub mod client;
/// The configuration for the application.
pub mod config;
/// The dispatcher for turning raw events into updates and routing them.
pub mod dispatcher;
/// The service for sending messages to users.
pub mod messaging;
/// The poller owning the long-poll loop task.
pub mod poller;
/// The long-poll session and its acquisition.
pub mod session;
/// The HTTP transport used for every VK call.
pub mod transport;

use std::sync::Arc;

use crate::{
    bot_handler::BotHandler,
    config::Config,
    dispatcher::UpdateDispatcher,
    messaging::VkMessagingService,
    poller::{Poller, PollerSettings},
    transport::ReqwestTransport,
};

/// Runs the bot until Ctrl-C.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    let credentials = config.credentials();
    let settings = PollerSettings::from(&config);
    tracing::debug!("Loaded configuration for group {}", config.vk_group_id);

    let transport = Arc::new(ReqwestTransport::new(config.request_timeout())?);
    let messaging_service =
        Arc::new(VkMessagingService::new(transport.clone(), credentials.clone()));
    let handler =
        Arc::new(BotHandler::new(messaging_service, config.bot_trigger, config.bot_reply));
    let dispatcher = Arc::new(UpdateDispatcher::new(handler));

    let poller = Poller::new(transport, credentials, dispatcher, settings);
    poller.start().await?;

    let shutdown = tokio::signal::ctrl_c().await;
    poller.stop().await;
    shutdown?;

    Ok(())
}
