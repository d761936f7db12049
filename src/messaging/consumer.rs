//! Consumer Supervisor
//!
//! One tokio task per agent consumes from that agent's queue on its own
//! channel. Each delivery is decoded, handed to the caller's handler with
//! bounded retries, and then settled with the broker exactly once:
//!
//! - handler succeeded: ack
//! - retries exhausted or payload unparseable: ack (discard) or reject without
//!   requeue (dead-letter), depending on [`PoisonPolicy`]
//!
//! Handler panics are caught per invocation and count as failed attempts, so a
//! faulty handler can never take down its own loop, another agent's loop, or
//! the Connection Manager.
//!
//! ```text
//! Idle ─▶ Consuming ⇄ Retrying
//!             │  ▲
//!  stream lost│  │reopened
//!             ▼  │
//!          Restarting ──exhausted──▶ Failed
//!
//! stop(): ... ─▶ Stopping ─▶ Stopped   (after the in-flight message settles)
//! ```

use crate::agent::{AgentRegistry, RegisteredAgent};
use crate::error::{SwarmError, SwarmResult};
use crate::observability::MessagingMetrics;
use crate::protocol::{normalize_agent_name, InboundMessage, MessageEnvelope};
use crate::transport::{
    BackoffPolicy, BoxError, BrokerChannel, ConnectionManager, DeliveryStream, RawDelivery,
    RetryDecision,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

pub type HandlerResult = Result<(), BoxError>;

/// Caller-supplied processing for one agent's messages.
///
/// The same message may be passed more than once when earlier attempts fail;
/// handlers with side effects should be idempotent.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &InboundMessage) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: &InboundMessage) -> HandlerResult {
        (self)(message.clone()).await
    }
}

/// What happens to a message that cannot be processed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoisonPolicy {
    /// Acknowledge and log; the message is gone
    #[default]
    Discard,
    /// Reject without requeue so the broker routes it to the dead-letter exchange
    DeadLetter,
}

impl PoisonPolicy {
    pub fn dead_letters(&self) -> bool {
        matches!(self, PoisonPolicy::DeadLetter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    /// Total handler invocations per delivery
    pub max_retries: u32,
    /// Unacknowledged deliveries held by the consumer at once
    pub prefetch: u16,
    pub poison_policy: PoisonPolicy,
    /// Delays between handler attempts; `max_retries` bounds the attempts
    pub backoff: BackoffPolicy,
    /// Applied when the consumer's channel or delivery stream is lost
    pub restart: BackoffPolicy,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            prefetch: 1,
            poison_policy: PoisonPolicy::Discard,
            backoff: BackoffPolicy {
                base_delay_ms: 1000,
                factor: 2.0,
                max_delay_ms: 10_000,
                max_attempts: 3,
            },
            restart: BackoffPolicy {
                base_delay_ms: 5000,
                factor: 1.0,
                max_delay_ms: 15_000,
                max_attempts: 3,
            },
        }
    }
}

impl ConsumerOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries == 0 {
            return Err("consumer.max_retries must be at least 1".to_string());
        }
        self.backoff
            .validate()
            .map_err(|e| format!("consumer.backoff: {e}"))?;
        self.restart
            .validate()
            .map_err(|e| format!("consumer.restart: {e}"))
    }

    /// Backoff schedule bounded by `max_retries`
    pub fn retry_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_retries,
            ..self.backoff.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerState {
    Idle,
    Consuming,
    /// Handler failed; waiting before attempt number `attempt`
    Retrying { attempt: u32 },
    /// Delivery stream lost; reopening (restart number `attempt`)
    Restarting { attempt: u32 },
    Stopping,
    Stopped,
    /// Restart attempts exhausted (last error)
    Failed(String),
}

impl ConsumerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Stopped | ConsumerState::Failed(_))
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::Idle => write!(f, "idle"),
            ConsumerState::Consuming => write!(f, "consuming"),
            ConsumerState::Retrying { attempt } => write!(f, "retrying (attempt {attempt})"),
            ConsumerState::Restarting { attempt } => write!(f, "restarting ({attempt})"),
            ConsumerState::Stopping => write!(f, "stopping"),
            ConsumerState::Stopped => write!(f, "stopped"),
            ConsumerState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// How a message that could not be processed was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Acknowledged,
    DeadLettered,
    /// Settlement failed; the broker will redeliver
    Unsettled,
}

/// Caller-visible failures and lifecycle notices from consumer loops
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    /// Handler failed on every attempt
    HandlerFailed {
        agent: String,
        attempts: u32,
        error: String,
        disposition: Disposition,
    },
    /// Payload could not be decoded as an envelope
    PoisonMessage {
        agent: String,
        error: String,
        disposition: Disposition,
    },
    /// Consumption could not be restored
    ConsumerFailed { agent: String, error: String },
    Stopped { agent: String },
}

impl ConsumerEvent {
    pub fn agent(&self) -> &str {
        match self {
            ConsumerEvent::HandlerFailed { agent, .. }
            | ConsumerEvent::PoisonMessage { agent, .. }
            | ConsumerEvent::ConsumerFailed { agent, .. }
            | ConsumerEvent::Stopped { agent } => agent,
        }
    }

    /// The error this event reports, if any
    pub fn to_error(&self) -> Option<SwarmError> {
        match self {
            ConsumerEvent::HandlerFailed {
                agent,
                attempts,
                error,
                ..
            } => Some(SwarmError::handler(agent.clone(), *attempts, error)),
            ConsumerEvent::PoisonMessage { agent, error, .. } => Some(SwarmError::handler(
                agent.clone(),
                0,
                format!("undecodable message: {error}"),
            )),
            ConsumerEvent::ConsumerFailed { agent, error } => Some(SwarmError::connection(
                format!("consumer for agent '{agent}' failed: {error}"),
            )),
            ConsumerEvent::Stopped { .. } => None,
        }
    }
}

struct ConsumerHandle {
    stop_tx: watch::Sender<bool>,
    state_tx: Arc<watch::Sender<ConsumerState>>,
    /// Taken by the first `stop()`
    task: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
            && !self.state_tx.borrow().is_terminal()
    }
}

pub struct ConsumerSupervisor {
    connection: Arc<ConnectionManager>,
    registry: Arc<AgentRegistry>,
    metrics: Arc<MessagingMetrics>,
    events: broadcast::Sender<ConsumerEvent>,
    consumers: Mutex<HashMap<String, ConsumerHandle>>,
}

impl ConsumerSupervisor {
    pub fn new(
        connection: Arc<ConnectionManager>,
        registry: Arc<AgentRegistry>,
        metrics: Arc<MessagingMetrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connection,
            registry,
            metrics,
            events,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Begin consuming the agent's queue. Returns once the broker has accepted
    /// the consumer; later failures are reported through [`Self::events`].
    pub async fn start(
        &self,
        agent_name: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumerOptions,
    ) -> SwarmResult<watch::Receiver<ConsumerState>> {
        options.validate().map_err(|e| {
            SwarmError::Config(crate::config::ConfigError::InvalidConfig(e))
        })?;
        let agent = self.registry.resolve(agent_name)?;
        if options.poison_policy.dead_letters() && agent.dead_letter_queue.is_none() {
            // Rejecting without requeue on a queue with no dead-letter exchange drops the message
            return Err(SwarmError::Config(crate::config::ConfigError::InvalidConfig(
                format!(
                    "agent '{}' was registered without a dead-letter route; \
                     the dead_letter poison policy requires one",
                    agent.name
                ),
            )));
        }
        let key = normalize_agent_name(&agent.name);

        if self.lock().get(&key).is_some_and(ConsumerHandle::is_active) {
            return Err(SwarmError::ConsumerAlreadyRunning { agent: agent.name });
        }

        let worker = Worker {
            agent: agent.clone(),
            consumer_tag: format!("swarmq-{key}-{}", Uuid::new_v4().simple()),
            handler,
            options,
            connection: self.connection.clone(),
            metrics: self.metrics.clone(),
            events: self.events.clone(),
            state_tx: Arc::new(watch::channel(ConsumerState::Idle).0),
        };
        let session = worker.open_session().await?;

        let mut consumers = self.lock();
        if consumers.get(&key).is_some_and(ConsumerHandle::is_active) {
            // Another start() won the race; drop our channel, requeueing anything prefetched
            let (channel, _) = session;
            tokio::spawn(async move {
                let _ = channel.close().await;
            });
            return Err(SwarmError::ConsumerAlreadyRunning { agent: agent.name });
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let state_tx = worker.state_tx.clone();
        let state_rx = state_tx.subscribe();
        worker.set_state(ConsumerState::Consuming);

        let span = crate::consumer_span!(agent = %agent.name, queue = %agent.queue_name);
        let task = tokio::spawn(worker.run(session, stop_rx).instrument(span));

        consumers.insert(
            key,
            ConsumerHandle {
                stop_tx,
                state_tx,
                task: Some(task),
            },
        );
        info!("Started consumer for agent '{}' on {}", agent.name, agent.queue_name);
        Ok(state_rx)
    }

    /// Ask the agent's loop to finish its in-flight message and exit, and wait
    /// until it has. A no-op when no consumer is running.
    pub async fn stop(&self, agent_name: &str) -> SwarmResult<()> {
        let agent = self.registry.resolve(agent_name)?;
        self.stop_consumer(&normalize_agent_name(&agent.name), &agent.name)
            .await;
        Ok(())
    }

    /// Stop every running consumer
    pub async fn stop_all(&self) {
        let keys: Vec<String> = self.lock().keys().cloned().collect();
        for key in keys {
            self.stop_consumer(&key, &key).await;
        }
    }

    async fn stop_consumer(&self, key: &str, display_name: &str) {
        let stopping = {
            let mut consumers = self.lock();
            consumers.get_mut(key).and_then(|handle| {
                let task = handle.task.take()?;
                handle.state_tx.send_if_modified(|state| {
                    if state.is_terminal() {
                        return false;
                    }
                    *state = ConsumerState::Stopping;
                    true
                });
                let _ = handle.stop_tx.send(true);
                Some((task, handle.state_tx.clone()))
            })
        };

        let Some((task, state_tx)) = stopping else {
            debug!("No consumer running for agent '{}'", display_name);
            return;
        };

        if let Err(e) = task.await {
            error!(
                "Consumer task for agent '{}' ended abnormally: {}",
                display_name, e
            );
            state_tx.send_replace(ConsumerState::Stopped);
        }
        info!("Stopped consumer for agent '{}'", display_name);
    }

    pub fn state(&self, agent_name: &str) -> Option<ConsumerState> {
        self.lock()
            .get(&normalize_agent_name(agent_name))
            .map(|h| h.state_tx.borrow().clone())
    }

    /// Observe one consumer's state transitions
    pub fn subscribe(&self, agent_name: &str) -> Option<watch::Receiver<ConsumerState>> {
        self.lock()
            .get(&normalize_agent_name(agent_name))
            .map(|h| h.state_tx.subscribe())
    }

    /// Error and lifecycle events from every consumer
    pub fn events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }

    /// Normalized names of agents with a live consumer loop
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, h)| h.is_active())
            .map(|(k, _)| k.clone())
            .collect();
        names.sort();
        names
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ConsumerHandle>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type Session = (Arc<dyn BrokerChannel>, DeliveryStream);

enum LoopExit {
    Stopped,
    StreamLost(String),
}

/// Everything one consumer loop owns
struct Worker {
    agent: RegisteredAgent,
    consumer_tag: String,
    handler: Arc<dyn MessageHandler>,
    options: ConsumerOptions,
    connection: Arc<ConnectionManager>,
    metrics: Arc<MessagingMetrics>,
    events: broadcast::Sender<ConsumerEvent>,
    state_tx: Arc<watch::Sender<ConsumerState>>,
}

impl Worker {
    async fn open_session(&self) -> SwarmResult<Session> {
        let channel = self.connection.open_channel().await?;
        let stream = match channel.set_prefetch(self.options.prefetch).await {
            Ok(()) => {
                channel
                    .consume(&self.agent.queue_name, &self.consumer_tag)
                    .await
            }
            Err(e) => Err(e),
        };

        match stream {
            Ok(stream) => Ok((channel, stream)),
            Err(e) => {
                let _ = channel.close().await;
                Err(SwarmError::connection(format!(
                    "cannot consume from {}: {}",
                    self.agent.queue_name,
                    e.detail()
                )))
            }
        }
    }

    async fn run(self, initial: Session, mut stop_rx: watch::Receiver<bool>) {
        let mut session = Some(initial);
        let mut restarts = 0u32;

        loop {
            let (channel, stream) = match session.take() {
                Some(session) => session,
                None => match self.open_session().await {
                    Ok(session) => {
                        info!("Consumer for agent '{}' resumed", self.agent.name);
                        restarts = 0;
                        self.set_state(ConsumerState::Consuming);
                        session
                    }
                    Err(e) => {
                        restarts += 1;
                        match self.options.restart.decide(restarts) {
                            RetryDecision::Retry { delay, .. } => {
                                warn!(
                                    "Consumer for agent '{}' could not resume: {}; retrying in {:?}",
                                    self.agent.name, e, delay
                                );
                                self.metrics.consumer_restarted();
                                self.set_state(ConsumerState::Restarting { attempt: restarts });
                                tokio::select! {
                                    _ = tokio::time::sleep(delay) => continue,
                                    _ = stop_requested(&mut stop_rx) => break,
                                }
                            }
                            RetryDecision::GiveUp { attempts } => {
                                let reason = format!("gave up after {attempts} restart(s): {e}");
                                error!("Consumer for agent '{}' {}", self.agent.name, reason);
                                self.set_state(ConsumerState::Failed(reason.clone()));
                                self.emit(ConsumerEvent::ConsumerFailed {
                                    agent: self.agent.name.clone(),
                                    error: reason,
                                });
                                return;
                            }
                        }
                    }
                },
            };

            match self.consume(channel.as_ref(), stream, &mut stop_rx).await {
                LoopExit::Stopped => {
                    let _ = channel.close().await;
                    break;
                }
                LoopExit::StreamLost(reason) => {
                    warn!(
                        "Delivery stream for agent '{}' lost: {}",
                        self.agent.name, reason
                    );
                    let _ = channel.close().await;
                }
            }
        }

        self.state_tx.send_replace(ConsumerState::Stopped);
        self.emit(ConsumerEvent::Stopped {
            agent: self.agent.name.clone(),
        });
    }

    async fn consume(
        &self,
        channel: &dyn BrokerChannel,
        mut stream: DeliveryStream,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> LoopExit {
        loop {
            let next = tokio::select! {
                biased;
                _ = stop_requested(stop_rx) => return LoopExit::Stopped,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(channel, delivery).await,
                Some(Err(e)) => return LoopExit::StreamLost(e.detail()),
                None => return LoopExit::StreamLost("delivery stream closed".to_string()),
            }
        }
    }

    async fn process(&self, channel: &dyn BrokerChannel, delivery: RawDelivery) {
        self.metrics.message_received();
        let tag = delivery.delivery_tag;

        let envelope = match MessageEnvelope::from_slice(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.poison_message();
                let disposition = self.give_up(channel, tag).await;
                error!(
                    "Unparseable message {} for agent '{}' ({:?}): {}",
                    tag, self.agent.name, disposition, e
                );
                self.emit(ConsumerEvent::PoisonMessage {
                    agent: self.agent.name.clone(),
                    error: e.to_string(),
                    disposition,
                });
                return;
            }
        };

        let message = InboundMessage {
            agent: self.agent.name.clone(),
            envelope,
            delivery_tag: tag,
            redelivered: delivery.redelivered,
            received_at: Utc::now(),
        };
        debug!(
            "Delivery {} for agent '{}' (redelivered: {})",
            tag, self.agent.name, message.redelivered
        );

        match self.invoke_with_retries(&message).await {
            Ok(attempts) => {
                match channel.ack(tag).await {
                    Ok(()) => self.metrics.message_acked(),
                    Err(e) => warn!(
                        "Ack of message {} for agent '{}' failed, broker will redeliver: {}",
                        tag,
                        self.agent.name,
                        e.detail()
                    ),
                }
                debug!(
                    "Message {} for agent '{}' handled after {} attempt(s)",
                    tag, self.agent.name, attempts
                );
            }
            Err((attempts, failure)) => {
                self.metrics.handler_failed();
                let disposition = self.give_up(channel, tag).await;
                let error = SwarmError::handler(self.agent.name.clone(), attempts, &failure);
                error!("{} ({:?})", error, disposition);
                self.emit(ConsumerEvent::HandlerFailed {
                    agent: self.agent.name.clone(),
                    attempts,
                    error: failure,
                    disposition,
                });
            }
        }
        self.set_state(ConsumerState::Consuming);
    }

    /// Invoke the handler until it succeeds or the retry policy gives up.
    /// Returns the number of attempts made.
    async fn invoke_with_retries(&self, message: &InboundMessage) -> Result<u32, (u32, String)> {
        let policy = self.options.retry_policy();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let started = Instant::now();
            let outcome = AssertUnwindSafe(self.handler.handle(message))
                .catch_unwind()
                .await;
            self.metrics
                .record_handler_time(&self.agent.name, started.elapsed());

            let failure = match outcome {
                Ok(Ok(())) => return Ok(attempts),
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
            };

            match policy.decide(attempts) {
                RetryDecision::Retry { attempt, delay } => {
                    warn!(
                        "Handler for agent '{}' failed on attempt {}/{}: {}; retrying in {:?}",
                        self.agent.name, attempts, policy.max_attempts, failure, delay
                    );
                    self.metrics.handler_retried();
                    self.set_state(ConsumerState::Retrying { attempt });
                    sleep_unless_zero(delay).await;
                }
                RetryDecision::GiveUp { attempts } => return Err((attempts, failure)),
            }
        }
    }

    /// Settle a message that will not be processed, per the poison policy
    async fn give_up(&self, channel: &dyn BrokerChannel, tag: u64) -> Disposition {
        let result = match self.options.poison_policy {
            PoisonPolicy::Discard => channel.ack(tag).await.map(|_| Disposition::Acknowledged),
            PoisonPolicy::DeadLetter => channel
                .reject(tag, false)
                .await
                .map(|_| Disposition::DeadLettered),
        };

        match result {
            Ok(Disposition::Acknowledged) => {
                self.metrics.message_acked();
                Disposition::Acknowledged
            }
            Ok(disposition) => {
                self.metrics.message_dead_lettered();
                disposition
            }
            Err(e) => {
                warn!(
                    "Could not settle message {} for agent '{}': {}",
                    tag,
                    self.agent.name,
                    e.detail()
                );
                Disposition::Unsettled
            }
        }
    }

    /// Publish a state unless a pending stop has already been announced
    fn set_state(&self, next: ConsumerState) {
        self.state_tx.send_if_modified(|state| {
            let stopping = matches!(state, ConsumerState::Stopping);
            let resumable = matches!(
                next,
                ConsumerState::Consuming
                    | ConsumerState::Retrying { .. }
                    | ConsumerState::Restarting { .. }
            );
            if *state == next || (stopping && resumable) {
                return false;
            }
            *state = next;
            true
        });
    }

    fn emit(&self, event: ConsumerEvent) {
        // No subscribers is fine; failures are also logged
        let _ = self.events.send(event);
    }
}

async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    // A dropped sender means the supervisor is gone; treat it as a stop
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

async fn sleep_unless_zero(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
