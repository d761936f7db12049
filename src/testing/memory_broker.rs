//! In-process broker implementing the transport traits
//!
//! Models the parts of an AMQP broker the messaging layer relies on: durable
//! queues, topic/direct/fanout bindings, mandatory publishing, per-channel
//! prefetch, acknowledgment, requeue of unacknowledged deliveries when a
//! channel dies, and dead-lettering on reject. Fault injection lets tests
//! take the broker away, sever live connections, or nack publishes.

use crate::transport::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, CloseCallback, DeliveryStream,
    ExchangeKind, ExchangeSpec, OutboundMessage, QueueInfo, QueueSpec, RawDelivery,
};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    core: Mutex<Core>,
    unavailable: AtomicBool,
    fail_publishes: AtomicBool,
    channel_open_budget: Mutex<Option<usize>>,
    connect_attempts: AtomicU64,
    successful_connects: AtomicU64,
}

#[derive(Default)]
struct Core {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    connections: Vec<Arc<ConnectionShared>>,
    channels: HashMap<u64, ChannelEntry>,
    prefetch: HashMap<u64, u16>,
    next_id: u64,
    next_delivery_tag: u64,
    published: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct ChannelEntry {
    connection_id: u64,
    open: Arc<AtomicBool>,
}

struct MemoryQueue {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<u64, Unacked>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    message: StoredMessage,
    channel_id: u64,
}

struct ConsumerEntry {
    channel_id: u64,
    sender: mpsc::UnboundedSender<Result<RawDelivery, BrokerError>>,
}

struct ConnectionShared {
    id: u64,
    open: AtomicBool,
    callbacks: Mutex<Vec<CloseCallback>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable, `connect` fails as if the broker were unreachable
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make every publish come back negatively acknowledged
    pub fn fail_publishes(&self, fail: bool) {
        self.state.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Allow only `remaining` more channel opens across all connections;
    /// `None` lifts the limit
    pub fn limit_channel_opens(&self, remaining: Option<usize>) {
        *lock(&self.state.channel_open_budget) = remaining;
    }

    /// Drop every open connection as a network failure would, firing close callbacks
    pub fn sever_connections(&self, reason: &str) {
        let severed: Vec<Arc<ConnectionShared>> = {
            let mut core = self.core();
            let open: Vec<Arc<ConnectionShared>> = core
                .connections
                .iter()
                .filter(|c| c.open.load(Ordering::SeqCst))
                .cloned()
                .collect();
            for connection in &open {
                core.close_connection(connection);
            }
            open
        };

        for connection in severed {
            let callbacks = std::mem::take(&mut *lock(&connection.callbacks));
            for callback in callbacks {
                callback(reason.to_string());
            }
        }
    }

    /// Put raw bytes straight onto a queue, bypassing exchanges
    pub fn enqueue_raw(&self, queue: &str, payload: &[u8]) -> bool {
        let mut core = self.core();
        let Some(target) = core.queues.get_mut(queue) else {
            return false;
        };
        target.ready.push_back(StoredMessage {
            routing_key: queue.to_string(),
            payload: payload.to_vec(),
            redelivered: false,
        });
        core.dispatch(queue);
        true
    }

    pub fn connect_attempts(&self) -> u64 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn successful_connections(&self) -> u64 {
        self.state.successful_connects.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.core()
            .connections
            .iter()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .count()
    }

    pub fn published_count(&self) -> u64 {
        self.core().published
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.core().exchanges.contains_key(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.core().queues.contains_key(name)
    }

    pub fn queue_spec(&self, name: &str) -> Option<QueueSpec> {
        self.core().queues.get(name).map(|q| q.spec.clone())
    }

    pub fn binding_exists(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.core().bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        })
    }

    /// Ready (undelivered) messages
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.core().queues.get(name).map(|q| q.ready.len())
    }

    /// Delivered but not yet acknowledged messages
    pub fn unacked_count(&self, name: &str) -> Option<usize> {
        self.core().queues.get(name).map(|q| q.unacked.len())
    }

    /// Payloads waiting on a queue, oldest first
    pub fn ready_payloads(&self, name: &str) -> Vec<Vec<u8>> {
        self.core()
            .queues
            .get(name)
            .map(|q| q.ready.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        lock(&self.state.core)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Core {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn in_flight_by_channel(&self) -> HashMap<u64, usize> {
        let mut counts = HashMap::new();
        for queue in self.queues.values() {
            for unacked in queue.unacked.values() {
                *counts.entry(unacked.channel_id).or_insert(0) += 1;
            }
        }
        counts
    }

    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let in_flight = self.in_flight_by_channel();
            let Core {
                queues,
                prefetch,
                next_delivery_tag,
                ..
            } = self;
            let Some(queue) = queues.get_mut(queue_name) else {
                return;
            };

            queue.consumers.retain(|c| !c.sender.is_closed());
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&idx| {
                    let channel_id = queue.consumers[idx].channel_id;
                    match prefetch.get(&channel_id).copied().unwrap_or(0) {
                        0 => true,
                        limit => in_flight.get(&channel_id).copied().unwrap_or(0) < limit as usize,
                    }
                });
            let Some(idx) = chosen else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            queue.next_consumer = (idx + 1) % count;
            *next_delivery_tag += 1;
            let delivery_tag = *next_delivery_tag;
            let channel_id = queue.consumers[idx].channel_id;

            let delivery = RawDelivery {
                delivery_tag,
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                payload: message.payload.clone(),
            };

            if queue.consumers[idx].sender.unbounded_send(Ok(delivery)).is_err() {
                queue.ready.push_front(message);
                queue.consumers.remove(idx);
                continue;
            }

            queue.unacked.insert(
                delivery_tag,
                Unacked {
                    message,
                    channel_id,
                },
            );
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let spec = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::NotFound(format!("exchange '{exchange}'")))?;

        let mut targets = Vec::new();
        let mut seen = HashSet::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match spec.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matched && seen.insert(binding.queue.clone()) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, targets: &[String], routing_key: &str, payload: &[u8]) {
        for target in targets {
            if let Some(queue) = self.queues.get_mut(target) {
                queue.ready.push_back(StoredMessage {
                    routing_key: routing_key.to_string(),
                    payload: payload.to_vec(),
                    redelivered: false,
                });
            }
        }
        for target in targets {
            self.dispatch(target);
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(entry) = self.channels.remove(&channel_id) else {
            return;
        };
        entry.open.store(false, Ordering::SeqCst);
        self.prefetch.remove(&channel_id);

        let mut affected = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);

            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.channel_id == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            if tags.is_empty() {
                continue;
            }
            for tag in tags.into_iter().rev() {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
            affected.push(name.clone());
        }

        for name in affected {
            self.dispatch(&name);
        }
    }

    fn close_connection(&mut self, connection: &ConnectionShared) {
        connection.open.store(false, Ordering::SeqCst);
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, entry)| entry.connection_id == connection.id)
            .map(|(id, _)| *id)
            .collect();
        for id in channel_ids {
            self.close_channel(id);
        }
    }

    fn take_unacked(&mut self, channel_id: u64, delivery_tag: u64) -> Option<(String, Unacked)> {
        for (name, queue) in self.queues.iter_mut() {
            if queue
                .unacked
                .get(&delivery_tag)
                .is_some_and(|u| u.channel_id == channel_id)
            {
                return queue
                    .unacked
                    .remove(&delivery_tag)
                    .map(|unacked| (name.clone(), unacked));
            }
        }
        None
    }

    fn queue_info(&self, name: &str) -> Option<QueueInfo> {
        self.queues.get(name).map(|queue| QueueInfo {
            name: name.to_string(),
            message_count: queue.ready.len() as u32,
            consumer_count: queue
                .consumers
                .iter()
                .filter(|c| !c.sender.is_closed())
                .count() as u32,
        })
    }
}

/// AMQP topic matching: `*` matches one word, `#` zero or more
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

#[async_trait]
impl Broker for MemoryBroker {
    fn describe(&self) -> String {
        "memory://local".to_string()
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::connection_failed(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory broker unavailable",
            )));
        }

        let shared = {
            let mut core = self.core();
            let shared = Arc::new(ConnectionShared {
                id: core.allocate_id(),
                open: AtomicBool::new(true),
                callbacks: Mutex::new(Vec::new()),
            });
            core.connections.retain(|c| c.open.load(Ordering::SeqCst));
            core.connections.push(shared.clone());
            shared
        };
        self.state.successful_connects.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            shared,
        }))
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    shared: Arc<ConnectionShared>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn on_close(&self, callback: CloseCallback) {
        lock(&self.shared.callbacks).push(callback);
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::ChannelClosed("connection is closed".to_string()));
        }
        if let Some(remaining) = lock(&self.broker.state.channel_open_budget).as_mut() {
            if *remaining == 0 {
                return Err(BrokerError::ChannelClosed(
                    "channel limit reached on memory broker".to_string(),
                ));
            }
            *remaining -= 1;
        }

        let mut core = self.broker.core();
        let id = core.allocate_id();
        let open = Arc::new(AtomicBool::new(true));
        core.channels.insert(
            id,
            ChannelEntry {
                connection_id: self.shared.id,
                open: open.clone(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            connection: self.shared.clone(),
            open,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.core().close_connection(&self.shared);
        lock(&self.shared.callbacks).clear();
        Ok(())
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    connection: Arc<ConnectionShared>,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed(format!("channel {} is closed", self.id)))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection.open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut core = self.broker.core();
        match core.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(BrokerError::PreconditionFailed(format!(
                "exchange '{}' exists with different settings",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                core.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, BrokerError> {
        self.check_open()?;
        let mut core = self.broker.core();
        if let Some(existing) = core.queues.get(&spec.name) {
            if &existing.spec != spec {
                return Err(BrokerError::PreconditionFailed(format!(
                    "queue '{}' exists with different settings",
                    spec.name
                )));
            }
        } else {
            core.queues.insert(
                spec.name.clone(),
                MemoryQueue {
                    spec: spec.clone(),
                    ready: VecDeque::new(),
                    unacked: BTreeMap::new(),
                    consumers: Vec::new(),
                    next_consumer: 0,
                },
            );
        }

        core.queue_info(&spec.name)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{}'", spec.name)))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut core = self.broker.core();
        if !core.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue '{queue}'")));
        }
        if !core.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !core.bindings.contains(&binding) {
            core.bindings.push(binding);
        }
        Ok(())
    }

    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo, BrokerError> {
        self.check_open()?;
        let mut core = self.broker.core();
        match core.queue_info(queue) {
            Some(info) => Ok(info),
            None => {
                // A failed passive declare is a channel-level exception
                core.close_channel(self.id);
                Err(BrokerError::NotFound(format!("queue '{queue}'")))
            }
        }
    }

    async fn delete_queue(&self, queue: &str, if_empty: bool) -> Result<u32, BrokerError> {
        self.check_open()?;
        let mut core = self.broker.core();
        let Some(existing) = core.queues.get(queue) else {
            return Ok(0);
        };

        let held = existing.ready.len() + existing.unacked.len();
        if if_empty && held > 0 {
            return Err(BrokerError::PreconditionFailed(format!(
                "queue '{queue}' holds {held} message(s)"
            )));
        }

        core.queues.remove(queue);
        core.bindings.retain(|b| b.queue != queue);
        Ok(held as u32)
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        self.check_open()?;
        if self.broker.state.fail_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::Nacked);
        }

        let mut core = self.broker.core();
        let targets = core.route(&message.exchange, &message.routing_key)?;
        if targets.is_empty() && message.mandatory {
            return Err(BrokerError::Unroutable {
                exchange: message.exchange,
                routing_key: message.routing_key,
            });
        }

        core.published += 1;
        core.enqueue(&targets, &message.routing_key, &message.payload);
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.check_open()?;
        self.broker.core().prefetch.insert(self.id, count);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.check_open()?;
        let mut core = self.broker.core();
        let (sender, receiver) = mpsc::unbounded();
        let target = core
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;
        target.consumers.push(ConsumerEntry {
            channel_id: self.id,
            sender,
        });
        core.dispatch(queue);
        Ok(receiver.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut core = self.broker.core();
        let (queue, _) = core.take_unacked(self.id, delivery_tag).ok_or_else(|| {
            BrokerError::PreconditionFailed(format!("unknown delivery tag {delivery_tag}"))
        })?;
        core.dispatch(&queue);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut core = self.broker.core();
        let (queue, unacked) = core.take_unacked(self.id, delivery_tag).ok_or_else(|| {
            BrokerError::PreconditionFailed(format!("unknown delivery tag {delivery_tag}"))
        })?;

        if requeue {
            if let Some(target) = core.queues.get_mut(&queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                target.ready.push_front(message);
            }
        } else {
            let dead_letter_exchange = core
                .queues
                .get(&queue)
                .and_then(|q| q.spec.dead_letter_exchange.clone());
            if let Some(exchange) = dead_letter_exchange {
                let routing_key = unacked.message.routing_key.clone();
                if let Ok(targets) = core.route(&exchange, &routing_key) {
                    core.enqueue(&targets, &routing_key, &unacked.message.payload);
                }
            }
        }

        core.dispatch(&queue);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.core().close_channel(self.id);
        Ok(())
    }
}
