
use std::{fmt::Display, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{LongPollClient, PollOutcome},
    config::Config,
    dispatcher::UpdateDispatcher,
    session::{Credentials, LongPollSession, SessionError},
    transport::{HttpTransport, TransportError},
};

/// Errors returned by [`Poller::start`].
#[derive(Debug, Error)]
pub enum PollerError {
    /// The first `groups.getLongPollServer` call failed.
    #[error("Failed to acquire the initial long poll session: {0}")]
    Credentials(#[from] SessionError),
    /// `stop` was called before the first session was acquired.
    #[error("Poller was stopped while starting")]
    Cancelled,
}

type Result<T> = std::result::Result<T, PollerError>;

/// Timing knobs of the poll loop.
#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    /// Long-poll hold time in seconds.
    pub long_poll_wait: u64,
    /// Outer bound on a single request.
    pub request_timeout: Duration,
    /// Pause after a failed poll or acquisition.
    pub retry_backoff: Duration,
    /// How long `stop` waits for the loop before aborting it.
    pub stop_grace_period: Duration,
    /// Consecutive failures after which a failure is logged as an error.
    pub failure_warn_threshold: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            long_poll_wait: 30,
            request_timeout: Duration::from_secs(35),
            retry_backoff: Duration::from_secs(1),
            stop_grace_period: Duration::from_secs(5),
            failure_warn_threshold: 10,
        }
    }
}

impl From<&Config> for PollerSettings {
    fn from(config: &Config) -> Self {
        Self {
            long_poll_wait: config.long_poll_wait,
            request_timeout: config.request_timeout(),
            retry_backoff: config.retry_backoff(),
            stop_grace_period: config.stop_grace_period(),
            failure_warn_threshold: config.failure_warn_threshold,
        }
    }
}

enum PollerState {
    Stopped,
    // The initial session is being acquired without the state lock held.
    Starting { cancel: CancellationToken },
    Running { cancel: CancellationToken, handle: JoinHandle<()> },
}

/// Owns the background task that long-polls VK and dispatches updates.
///
/// The state lock is never held across a network call: `start` releases it
/// while acquiring the first session, so `stop` and `is_running` stay prompt
/// during startup. While `stop` holds the lock the poller is stopping, and a
/// concurrent `start` waits for it to finish.
pub struct Poller {
    transport: Arc<dyn HttpTransport>,
    credentials: Credentials,
    dispatcher: Arc<UpdateDispatcher>,
    settings: PollerSettings,
    state: Mutex<PollerState>,
}

impl Poller {
    /// Create a new Poller.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credentials: Credentials,
        dispatcher: Arc<UpdateDispatcher>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            transport,
            credentials,
            dispatcher,
            settings,
            state: Mutex::new(PollerState::Stopped),
        }
    }

    /// Acquires a session and spawns the poll loop. Does nothing if the loop
    /// is already running or starting. A failed initial acquisition is
    /// returned to the caller and leaves the poller stopped, as does a `stop`
    /// that arrives before the session is acquired.
    pub async fn start(&self) -> Result<()> {
        let cancel = {
            let mut state = self.state.lock().await;
            match &*state {
                PollerState::Starting { .. } => {
                    tracing::debug!("Poller is already starting");
                    return Ok(());
                }
                PollerState::Running { handle, .. } if !handle.is_finished() => {
                    tracing::debug!("Poller is already running");
                    return Ok(());
                }
                PollerState::Running { .. } => {
                    tracing::warn!("Poll loop exited unexpectedly, restarting");
                }
                PollerState::Stopped => {}
            }
            let cancel = CancellationToken::new();
            *state = PollerState::Starting { cancel: cancel.clone() };
            cancel
        };

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            acquired = acquire_session(
                self.transport.as_ref(),
                &self.credentials,
                self.settings.request_timeout,
            ) => Some(acquired),
        };

        let mut state = self.state.lock().await;
        // A cancelled token means `stop` already reset the state, and a newer
        // `start` may own it by now.
        if cancel.is_cancelled() {
            tracing::info!("Poller stopped before it started");
            return Err(PollerError::Cancelled);
        }
        let session = match acquired {
            Some(Ok(session)) => session,
            Some(Err(e)) => {
                *state = PollerState::Stopped;
                tracing::error!("Cannot start poller: {e}");
                return Err(e.into());
            }
            None => return Err(PollerError::Cancelled),
        };

        let poll_loop = PollLoop {
            client: LongPollClient::new(
                self.transport.clone(),
                self.settings.long_poll_wait,
                self.settings.request_timeout,
            ),
            transport: self.transport.clone(),
            credentials: self.credentials.clone(),
            dispatcher: self.dispatcher.clone(),
            settings: self.settings,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(poll_loop.run(session));
        *state = PollerState::Running { cancel, handle };

        tracing::info!("Poller started");
        Ok(())
    }

    /// Signals the loop to stop and waits for it, aborting it once the grace
    /// period elapses. Cancels a `start` that is still acquiring the first
    /// session. Does nothing if the poller is not running.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let (cancel, mut handle) = match std::mem::replace(&mut *state, PollerState::Stopped) {
            PollerState::Stopped => {
                tracing::debug!("Poller is not running");
                return;
            }
            PollerState::Starting { cancel } => {
                tracing::info!("Cancelling poller startup");
                cancel.cancel();
                return;
            }
            PollerState::Running { cancel, handle } => (cancel, handle),
        };

        tracing::info!("Stopping poller");
        cancel.cancel();

        let grace = self.settings.stop_grace_period;
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => tracing::info!("Poller stopped"),
            Ok(Err(e)) => tracing::error!("Poll loop ended abnormally: {e}"),
            Err(_) => {
                tracing::warn!("Poll loop did not stop within {grace:?}, aborting it");
                handle.abort();
                match handle.await {
                    Err(e) if !e.is_cancelled() => {
                        tracing::error!("Poll loop ended abnormally: {e}")
                    }
                    _ => tracing::info!("Poller aborted"),
                }
            }
        }
    }

    /// Whether the poll loop is currently running. A poller that is still
    /// acquiring its first session is not running yet.
    pub async fn is_running(&self) -> bool {
        match &*self.state.lock().await {
            PollerState::Running { handle, .. } => !handle.is_finished(),
            PollerState::Starting { .. } | PollerState::Stopped => false,
        }
    }
}

async fn acquire_session(
    transport: &dyn HttpTransport,
    credentials: &Credentials,
    timeout: Duration,
) -> std::result::Result<LongPollSession, SessionError> {
    tokio::time::timeout(timeout, LongPollSession::acquire(transport, credentials))
        .await
        .unwrap_or(Err(SessionError::Transport(TransportError::Timeout(timeout))))
}

/// The state moved into the spawned task. The session lives on this task's
/// stack, so the loop is its only writer.
struct PollLoop {
    client: LongPollClient,
    transport: Arc<dyn HttpTransport>,
    credentials: Credentials,
    dispatcher: Arc<UpdateDispatcher>,
    settings: PollerSettings,
    cancel: CancellationToken,
}

impl PollLoop {
    async fn run(self, session: LongPollSession) {
        tracing::debug!("Starting VK long poll loop");

        let mut session = Some(session);
        let mut failures: u32 = 0;

        while !self.cancel.is_cancelled() {
            let current = match session.take() {
                Some(current) => current,
                None => {
                    let acquired = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        acquired = acquire_session(
                            self.transport.as_ref(),
                            &self.credentials,
                            self.settings.request_timeout,
                        ) => acquired,
                    };
                    match acquired {
                        Ok(fresh) => fresh,
                        Err(e) => {
                            failures = failures.saturating_add(1);
                            self.report_failure(failures, &e);
                            if !self.backoff().await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                outcome = self.client.poll(&current) => outcome,
            };

            match outcome {
                PollOutcome::Continue { ts, events } => {
                    failures = 0;
                    session = Some(current.with_cursor(ts));
                    if !events.is_empty() {
                        let updates = self.dispatcher.dispatch(events).await;
                        tracing::debug!("Dispatched {} updates", updates.len());
                    }
                }
                PollOutcome::SoftExpired { ts } => {
                    failures = 0;
                    tracing::info!("Long poll history is outdated, moving cursor to {ts}");
                    session = Some(current.with_cursor(ts));
                }
                PollOutcome::HardExpired => {
                    failures = 0;
                    tracing::info!("Long poll key expired, re-acquiring session");
                }
                PollOutcome::TransportError(e) => {
                    failures = failures.saturating_add(1);
                    self.report_failure(failures, &e);
                    session = Some(current);
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }

        tracing::info!("VK long poll loop stopped");
    }

    fn report_failure(&self, failures: u32, error: &dyn Display) {
        let threshold = self.settings.failure_warn_threshold.max(1);
        if failures % threshold == 0 {
            tracing::error!(
                "Long poll has failed {failures} times in a row, last error: {error}. Still \
                 retrying."
            );
        } else {
            tracing::warn!(
                "Long poll failed: {error}. Retrying in {:?}",
                self.settings.retry_backoff
            );
        }
    }

    /// Sleeps for the retry backoff. Returns `false` if cancelled meanwhile.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.settings.retry_backoff) => true,
        }
    }
}
