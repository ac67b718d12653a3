//! Single logical broker connection with background reconnect.
//!
//! `connect()` blocks until the first session is up. A supervisor task then watches the
//! session and re-establishes it with exponential backoff whenever the broker closes it.
//! Every new session bumps the generation so queues know their cached channel is stale.

use crate::metrics::metrics;
use crate::retry::{RetryBackoff, RetrySettings};
use crate::transport::runtime::sleep_with_shutdown;
use crate::transport::{BrokerChannel, BrokerDriver, BrokerError, BrokerSession};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub reconnect: RetrySettings,
    pub publish_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect: RetrySettings::new(Duration::from_secs(5), Duration::from_secs(300), 2.0),
            publish_timeout: Some(Duration::from_secs(10)),
        }
    }
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    driver: Arc<dyn BrokerDriver>,
    options: ConnectionOptions,
    session: Mutex<Option<Arc<dyn BrokerSession>>>,
    state: watch::Sender<ConnectionState>,
    generation: watch::Sender<u64>,
    shutdown: CancellationToken,
    supervisor: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(driver: Arc<dyn BrokerDriver>, options: ConnectionOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(ConnectionInner {
                driver,
                options,
                session: Mutex::new(None),
                state,
                generation,
                shutdown: CancellationToken::new(),
                supervisor: AsyncMutex::new(None),
            }),
        }
    }

    pub fn driver_name(&self) -> &'static str {
        self.inner.driver.name()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Incremented each time a new session is established.
    pub fn generation(&self) -> u64 {
        *self.inner.generation.borrow()
    }

    pub fn publish_timeout(&self) -> Option<Duration> {
        self.inner.options.publish_timeout
    }

    /// Establishes the first session, retrying until it succeeds, then hands reconnects over
    /// to a background task. Calling it again once connected is a no-op; concurrent callers
    /// wait for the first one.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        let mut supervisor = self.inner.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        let Some(session) = self.establish().await else {
            return Err(BrokerError::Closed);
        };

        let connection = self.clone();
        *supervisor = Some(tokio::spawn(async move { connection.supervise(session).await }));
        Ok(())
    }

    /// Opens a channel on the current session, tagged with the session generation.
    pub async fn channel(&self) -> Result<(u64, Arc<dyn BrokerChannel>), BrokerError> {
        let session = self.current_session().ok_or(BrokerError::Closed)?;
        let generation = self.generation();
        let channel = session.create_channel().await?;
        Ok((generation, channel))
    }

    /// Waits until a session is up. Returns `false` if `shutdown` fires first or the
    /// connection has been closed.
    pub async fn wait_connected(&self, shutdown: &CancellationToken) -> bool {
        let mut state = self.subscribe();
        loop {
            if *state.borrow_and_update() == ConnectionState::Connected {
                return true;
            }
            if self.inner.shutdown.is_cancelled() {
                return false;
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = shutdown.cancelled() => return false,
                _ = self.inner.shutdown.cancelled() => return false,
            }
        }
    }

    /// Stops reconnecting and closes the current session.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();

        let handle = self.inner.supervisor.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let session = self
            .inner
            .session
            .lock()
            .expect("connection session lock poisoned")
            .take();
        if let Some(session) = session {
            if let Err(err) = session.close().await {
                tracing::debug!(
                    target: "refresher::connection",
                    event = "close_failed",
                    error = %err
                );
            }
        }

        self.inner.state.send_replace(ConnectionState::Disconnected);
        tracing::info!(
            target: "refresher::connection",
            event = "closed",
            driver = self.driver_name()
        );
    }

    fn current_session(&self) -> Option<Arc<dyn BrokerSession>> {
        self.inner
            .session
            .lock()
            .expect("connection session lock poisoned")
            .clone()
    }

    async fn establish(&self) -> Option<Arc<dyn BrokerSession>> {
        let mut backoff = RetryBackoff::new(self.inner.options.reconnect.clone());
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            self.inner.state.send_replace(ConnectionState::Connecting);

            match self.inner.driver.connect().await {
                Ok(session) => {
                    *self
                        .inner
                        .session
                        .lock()
                        .expect("connection session lock poisoned") = Some(session.clone());
                    self.inner.generation.send_modify(|generation| *generation += 1);
                    self.inner.state.send_replace(ConnectionState::Connected);
                    tracing::info!(
                        target: "refresher::connection",
                        event = "connected",
                        driver = self.driver_name(),
                        attempt = attempt,
                        generation = self.generation()
                    );
                    return Some(session);
                }
                Err(err) => {
                    let delay = backoff.on_failure();
                    tracing::warn!(
                        target: "refresher::connection",
                        event = "connect_failed",
                        driver = self.driver_name(),
                        attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err
                    );
                    if sleep_with_shutdown(delay, &self.inner.shutdown).await {
                        self.inner.state.send_replace(ConnectionState::Disconnected);
                        return None;
                    }
                }
            }
        }
    }

    async fn supervise(self, mut session: Arc<dyn BrokerSession>) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = session.closed() => {}
            }

            *self
                .inner
                .session
                .lock()
                .expect("connection session lock poisoned") = None;
            self.inner.state.send_replace(ConnectionState::Disconnected);
            metrics().inc_reconnects();
            tracing::warn!(
                target: "refresher::connection",
                event = "disconnected",
                driver = self.driver_name(),
                generation = self.generation()
            );

            match self.establish().await {
                Some(next) => session = next,
                None => return,
            }
        }
    }
}
