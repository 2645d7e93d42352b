use std::{
    env::{self, VarError},
    time::Duration,
};

use thiserror::Error;

use crate::session::Credentials;

const DEFAULT_VK_API_URL: &str = "https://api.vk.com/method/";
const DEFAULT_VK_API_VERSION: &str = "5.131";
const DEFAULT_LONG_POLL_WAIT: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT: u64 = 35;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;
const DEFAULT_STOP_GRACE_PERIOD: u64 = 5;
const DEFAULT_FAILURE_WARN_THRESHOLD: u32 = 10;
const DEFAULT_BOT_TRIGGER: &str = "kek";
const DEFAULT_BOT_REPLY: &str = "Pupupu";

/// Errors raised while reading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("Missing environment variable {name}: {source}")]
    Missing { name: &'static str, source: VarError },
    /// A variable is set to a value that cannot be used.
    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Represents the application configuration.
#[derive(Debug)]
pub struct Config {
    /// The VK community access token.
    pub vk_token: String,
    /// The VK community id.
    pub vk_group_id: u64,
    /// The base URL of the VK method API.
    pub vk_api_url: String,
    /// The VK API version sent with every call.
    pub vk_api_version: String,
    /// The long-poll hold time in seconds.
    pub long_poll_wait: u64,
    /// The outer timeout in seconds for a single request.
    pub request_timeout: u64,
    /// The pause in milliseconds after a failed poll.
    pub retry_backoff_ms: u64,
    /// How long in seconds `stop` waits for the poll loop before aborting it.
    pub stop_grace_period: u64,
    /// The number of consecutive failures after which the loop logs an error.
    pub failure_warn_threshold: u32,
    /// The message text the bot reacts to.
    pub bot_trigger: String,
    /// The bot's reply to the trigger.
    pub bot_reply: String,
}

impl Config {
    /// Creates a new `Config` instance from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vk_group_id = required("VK_GROUP_ID")?;
        let vk_group_id = vk_group_id
            .parse()
            .map_err(|_| ConfigError::Invalid { name: "VK_GROUP_ID", value: vk_group_id })?;

        let long_poll_wait = parsed_or("LONG_POLL_WAIT", DEFAULT_LONG_POLL_WAIT);
        let request_timeout = parsed_or("REQUEST_TIMEOUT", DEFAULT_REQUEST_TIMEOUT);
        // An idle long poll is held for the full wait, so the request timeout
        // must outlast it or every quiet poll ends in a timeout.
        if request_timeout <= long_poll_wait {
            return Err(ConfigError::Invalid {
                name: "REQUEST_TIMEOUT",
                value: format!("{request_timeout} (must exceed LONG_POLL_WAIT={long_poll_wait})"),
            });
        }

        Ok(Self {
            vk_token: required("VK_TOKEN")?,
            vk_group_id,
            vk_api_url: env::var("VK_API_URL").unwrap_or_else(|_| DEFAULT_VK_API_URL.to_string()),
            vk_api_version: env::var("VK_API_VERSION")
                .unwrap_or_else(|_| DEFAULT_VK_API_VERSION.to_string()),
            long_poll_wait,
            request_timeout,
            retry_backoff_ms: parsed_or("RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS),
            stop_grace_period: parsed_or("STOP_GRACE_PERIOD", DEFAULT_STOP_GRACE_PERIOD),
            failure_warn_threshold: parsed_or(
                "FAILURE_WARN_THRESHOLD",
                DEFAULT_FAILURE_WARN_THRESHOLD,
            ),
            bot_trigger: env::var("BOT_TRIGGER")
                .unwrap_or_else(|_| DEFAULT_BOT_TRIGGER.to_string()),
            bot_reply: env::var("BOT_REPLY").unwrap_or_else(|_| DEFAULT_BOT_REPLY.to_string()),
        })
    }

    /// The credentials used for every VK method call.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            api_url: self.vk_api_url.clone(),
            group_id: self.vk_group_id,
            access_token: self.vk_token.clone(),
            api_version: self.vk_api_version.clone(),
        }
    }

    /// The outer timeout for a single request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// The pause after a failed poll.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// How long `stop` waits before aborting the poll loop.
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period)
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|source| ConfigError::Missing { name, source })
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
