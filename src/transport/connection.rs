//! Connection Manager: sole owner of the broker connection and its shared channel
//!
//! Every transition (`connect`, loss notification, reconnect) is serialized
//! through one session lock. Readers calling [`ConnectionManager::ensure_connected`]
//! while a reconnect is in flight queue on that lock instead of starting a
//! second reconnect.
//!
//! ```text
//! Disconnected ─connect─▶ Connecting ─▶ Connected ─loss─▶ Recovering ─▶ Connected
//!                              │                               │
//!                              └──────── retries exhausted ────┴─▶ Failed
//! ```
//!
//! `Failed` is sticky: dependent operations fail fast with a connection error
//! until the caller invokes [`ConnectionManager::connect`] again.

use super::backoff::{BackoffPolicy, RetryDecision};
use super::{Broker, BrokerChannel, BrokerConnection, BrokerError, ExchangeSpec};
use crate::error::{sanitize_error_message, SwarmError, SwarmResult};
use crate::observability::MessagingMetrics;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Process-wide connection state, owned by the Connection Manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connection lost (reason); reconnect scheduled or in progress
    Recovering(String),
    /// Reconnect attempts exhausted (last error)
    Failed(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Recovering(reason) => write!(f, "recovering ({reason})"),
            ConnectionState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

#[derive(Default)]
struct Session {
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

pub struct ConnectionManager {
    me: Weak<ConnectionManager>,
    broker: Arc<dyn Broker>,
    policy: BackoffPolicy,
    topology: Vec<ExchangeSpec>,
    session: Mutex<Session>,
    state_tx: watch::Sender<ConnectionState>,
    /// Bumped on every new session; close callbacks from older sessions are ignored
    generation: AtomicU64,
    recovery_scheduled: AtomicBool,
    runtime: OnceCell<Handle>,
    metrics: Arc<MessagingMetrics>,
}

impl ConnectionManager {
    /// `topology` lists exchanges declared on every session establishment
    pub fn new(
        broker: Arc<dyn Broker>,
        policy: BackoffPolicy,
        topology: Vec<ExchangeSpec>,
        metrics: Arc<MessagingMetrics>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            broker,
            policy,
            topology,
            session: Mutex::new(Session::default()),
            state_tx,
            generation: AtomicU64::new(0),
            recovery_scheduled: AtomicBool::new(false),
            runtime: OnceCell::new(),
            metrics,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Establish connection and shared channel. No-op when already connected.
    pub async fn connect(&self) -> SwarmResult<()> {
        self.capture_runtime();
        let mut session = self.session.lock().await;
        if self.live_channel(&session).is_some() {
            debug!("connect() called while connected, nothing to do");
            return Ok(());
        }
        self.establish(&mut session).await.map(|_| ())
    }

    /// Shared channel for short broker-facing operations, reconnecting first if needed
    pub async fn ensure_connected(&self) -> SwarmResult<Arc<dyn BrokerChannel>> {
        self.capture_runtime();
        let mut session = self.session.lock().await;
        if let Some(channel) = self.live_channel(&session) {
            return Ok(channel);
        }

        match self.state() {
            ConnectionState::Failed(reason) => {
                return Err(SwarmError::connection(format!(
                    "connection failed ({reason}); call connect() to retry"
                )));
            }
            ConnectionState::Connected => {
                if let Some(channel) = self.reopen_shared_channel(&mut session).await {
                    return Ok(channel);
                }
            }
            _ => {}
        }

        self.establish(&mut session).await
    }

    /// Dedicated channel (consumers, passive inspection) on the managed connection
    pub async fn open_channel(&self) -> SwarmResult<Arc<dyn BrokerChannel>> {
        self.ensure_connected().await?;
        let connection = {
            let session = self.session.lock().await;
            session.connection.clone()
        };
        let connection = connection.ok_or_else(|| SwarmError::connection("no broker connection"))?;

        connection.open_channel().await.map_err(|e| {
            SwarmError::connection(format!("failed to open channel: {}", e.detail()))
        })
    }

    /// Transport reported the connection or shared channel closed.
    /// Moves to `Recovering` and schedules one reconnect.
    pub fn on_channel_closed(&self, reason: &str) {
        self.handle_close(self.generation.load(Ordering::SeqCst), reason);
    }

    /// Close the session; state becomes `Disconnected` and no recovery runs
    pub async fn disconnect(&self) -> SwarmResult<()> {
        let mut session = self.session.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.transition(ConnectionState::Disconnected);

        if let Some(channel) = session.channel.take() {
            if channel.is_open() {
                let _ = channel.close().await;
            }
        }
        if let Some(connection) = session.connection.take() {
            if connection.is_open() {
                connection
                    .close()
                    .await
                    .map_err(|e| SwarmError::connection(e.detail()))?;
            }
        }
        info!("Disconnected from broker {}", self.broker.describe());
        Ok(())
    }

    fn capture_runtime(&self) {
        if self.runtime.get().is_none() {
            if let Ok(handle) = Handle::try_current() {
                let _ = self.runtime.set(handle);
            }
        }
    }

    fn live_channel(&self, session: &Session) -> Option<Arc<dyn BrokerChannel>> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        let connection_open = session.connection.as_ref().is_some_and(|c| c.is_open());
        match &session.channel {
            Some(channel) if connection_open && channel.is_open() => Some(channel.clone()),
            _ => None,
        }
    }

    /// Connection alive but shared channel closed (e.g. a channel-level error)
    async fn reopen_shared_channel(
        &self,
        session: &mut Session,
    ) -> Option<Arc<dyn BrokerChannel>> {
        let connection = session.connection.clone().filter(|c| c.is_open())?;
        match connection.open_channel().await {
            Ok(channel) => {
                info!("Reopened shared channel on existing connection");
                session.channel = Some(channel.clone());
                Some(channel)
            }
            Err(e) => {
                warn!("Failed to reopen shared channel: {}", e.detail());
                None
            }
        }
    }

    async fn establish(&self, session: &mut Session) -> SwarmResult<Arc<dyn BrokerChannel>> {
        let loss_reason = match self.state() {
            ConnectionState::Recovering(reason) => Some(reason),
            ConnectionState::Connected => Some("connection closed".to_string()),
            _ => None,
        };

        session.channel = None;
        if let Some(stale) = session.connection.take() {
            if stale.is_open() {
                let _ = stale.close().await;
            }
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            self.transition(match &loss_reason {
                Some(reason) => ConnectionState::Recovering(reason.clone()),
                None => ConnectionState::Connecting,
            });
            self.metrics.connection_attempt();

            match self.open_session().await {
                Ok((connection, channel)) => {
                    session.connection = Some(connection);
                    session.channel = Some(channel.clone());
                    self.recovery_scheduled.store(false, Ordering::SeqCst);
                    self.metrics.connection_established();
                    self.transition(ConnectionState::Connected);
                    return Ok(channel);
                }
                Err(e) => {
                    self.metrics.connection_failed();
                    let detail = sanitize_error_message(&e.detail());

                    match self.policy.decide(attempts) {
                        RetryDecision::Retry { attempt, delay } => {
                            warn!(
                                "Broker {} connection attempt {} failed: {}; attempt {} in {:?}",
                                self.broker.describe(),
                                attempts,
                                detail,
                                attempt,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp { attempts } => {
                            self.recovery_scheduled.store(false, Ordering::SeqCst);
                            self.transition(ConnectionState::Failed(detail.clone()));
                            return Err(SwarmError::connection(format!(
                                "broker {} unreachable after {} attempt(s): {}",
                                self.broker.describe(),
                                attempts,
                                detail
                            )));
                        }
                    }
                }
            }
        }
    }

    async fn open_session(
        &self,
    ) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>), BrokerError> {
        let connection = self.broker.connect().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let me = self.me.clone();
        connection.on_close(Box::new(move |reason| {
            if let Some(manager) = me.upgrade() {
                manager.handle_close(generation, &reason);
            }
        }));

        let channel = match self.prepare_channel(connection.as_ref()).await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close().await;
                return Err(e);
            }
        };

        Ok((connection, channel))
    }

    async fn prepare_channel(
        &self,
        connection: &dyn BrokerConnection,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = connection.open_channel().await?;
        for exchange in &self.topology {
            channel.declare_exchange(exchange).await?;
        }
        Ok(channel)
    }

    fn handle_close(&self, generation: u64, reason: &str) {
        if generation != self.generation.load(Ordering::SeqCst) {
            debug!("Ignoring close notification from superseded session: {}", reason);
            return;
        }

        let reason = sanitize_error_message(reason);
        let mut previous = None;
        let transitioned = self.state_tx.send_if_modified(|state| match state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                previous = Some(state.clone());
                *state = ConnectionState::Recovering(reason.clone());
                true
            }
            _ => false,
        });

        if !transitioned {
            debug!("Close notification in state {}: {}", self.state(), reason);
            return;
        }

        if let Some(previous) = previous {
            log_state_transition(&previous, &ConnectionState::Recovering(reason.clone()));
        }
        self.metrics.connection_lost();
        self.schedule_recovery();
    }

    fn schedule_recovery(&self) {
        if self.recovery_scheduled.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already scheduled");
            return;
        }

        let Some(handle) = self.runtime.get() else {
            warn!("No runtime available for background reconnect; next operation will reconnect");
            self.recovery_scheduled.store(false, Ordering::SeqCst);
            return;
        };

        let me = self.me.clone();
        handle.spawn(async move {
            if let Some(manager) = me.upgrade() {
                manager.recover().await;
            }
        });
    }

    async fn recover(&self) {
        let mut session = self.session.lock().await;

        if self.live_channel(&session).is_some() {
            debug!("Connection already restored by another caller");
            self.recovery_scheduled.store(false, Ordering::SeqCst);
            return;
        }
        if !matches!(self.state(), ConnectionState::Recovering(_)) {
            self.recovery_scheduled.store(false, Ordering::SeqCst);
            return;
        }

        if let Err(e) = self.establish(&mut session).await {
            error!("Background reconnect gave up: {}", e);
        }
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            log_state_transition(&previous, &next);
        }
    }
}

fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("Broker connection established");
        }
        (ConnectionState::Connected, ConnectionState::Recovering(reason)) => {
            warn!("Broker connection lost: {}", reason);
        }
        (ConnectionState::Recovering(_), ConnectionState::Connected) => {
            info!("Broker connection recovered");
        }
        (_, ConnectionState::Failed(reason)) => {
            error!("Broker connection failed permanently: {}", reason);
        }
        _ => {
            info!("Broker connection state: {} -> {}", from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBroker;
    use std::time::Duration;

    fn manager(broker: &MemoryBroker, max_attempts: u32) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            Arc::new(broker.clone()),
            BackoffPolicy::new(Duration::from_millis(5), 2.0, Duration::from_millis(20), max_attempts),
            vec![ExchangeSpec::durable_topic("agent_exchange")],
            Arc::new(MessagingMetrics::new()),
        )
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Failed("boom".to_string()).to_string(),
            "failed (boom)"
        );
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 3);

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(broker.connect_attempts(), 1);
        assert!(broker.exchange_exists("agent_exchange"));
    }

    #[tokio::test]
    async fn test_connect_fails_after_exhausting_attempts() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let manager = manager(&broker, 3);

        let error = manager.connect().await.unwrap_err();

        assert!(error.is_connection_error());
        assert_eq!(broker.connect_attempts(), 3);
        assert!(matches!(manager.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_failed_state_is_sticky_until_explicit_connect() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let manager = manager(&broker, 2);
        assert!(manager.connect().await.is_err());

        broker.set_available(true);
        let attempts_before = broker.connect_attempts();
        assert!(manager.ensure_connected().await.is_err());
        assert_eq!(broker.connect_attempts(), attempts_before);

        manager.connect().await.unwrap();
        assert!(manager.ensure_connected().await.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_connected_connects_lazily() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 3);

        let channel = manager.ensure_connected().await.unwrap();
        assert!(channel.is_open());
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_does_not_trigger_recovery() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 3);
        manager.connect().await.unwrap();

        manager.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_stale_close_notifications_are_ignored() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 3);
        manager.connect().await.unwrap();

        manager.handle_close(0, "old session");
        assert_eq!(manager.state(), ConnectionState::Connected);
    }
}
