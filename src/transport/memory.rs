//! In-process broker with AMQP-like semantics: durable named queues, per-channel prefetch,
//! manual ack/nack, redelivery of unacked messages when a session drops, and per-queue
//! message TTL with dead-lettering. Used for local runs (`memory://` broker URL) and tests.

use crate::transport::{
    BrokerChannel, BrokerDriver, BrokerError, BrokerSession, DeliveryStream, Headers,
    QueueDeclaration, RawDelivery,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    changed: Notify,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    sessions: HashMap<u64, CancellationToken>,
    next_session: u64,
    next_channel: u64,
    next_message: u64,
    next_tag: u64,
    refuse_connections: u32,
    stats: BrokerStats,
}

struct QueueState {
    declaration: QueueDeclaration,
    ready: VecDeque<StoredMessage>,
}

struct ChannelState {
    session: u64,
    prefetch: u16,
    unacked: HashMap<u64, (String, StoredMessage)>,
}

/// A message sitting in a queue.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub id: u64,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections: u64,
    pub refused: u64,
    pub published: u64,
    pub unroutable: u64,
    pub acked: u64,
    pub nacked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats.clone()
    }

    /// Number of messages ready for delivery on `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|state| state.ready.len())
            .unwrap_or(0)
    }

    /// Snapshot of the ready messages on `queue`, head first.
    pub fn peek(&self, queue: &str) -> Vec<StoredMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|state| state.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliveries handed out but not yet acked or nacked, across all channels.
    pub fn unacked(&self) -> usize {
        self.lock()
            .channels
            .values()
            .map(|channel| channel.unacked.len())
            .sum()
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refuse_next_connections(&self, count: u32) {
        self.lock().refuse_connections = count;
    }

    /// Drops every open session as if the broker restarted. Unacked deliveries are requeued.
    pub fn sever_connections(&self) {
        let sessions: Vec<u64> = self.lock().sessions.keys().copied().collect();
        for session in sessions {
            self.close_session(session);
        }
    }

    /// Publishes without going through a channel, e.g. to simulate a foreign producer.
    pub fn inject(&self, queue: &str, body: &[u8], headers: Headers) {
        let ttl = {
            let mut state = self.lock();
            Self::enqueue_locked(&mut state, queue, body.to_vec(), headers)
        };
        self.after_enqueue(queue, ttl);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.inner.state.lock().expect("memory broker lock poisoned")
    }

    fn notify(&self) {
        self.inner.changed.notify_waiters();
    }

    fn close_session(&self, session: u64) {
        {
            let mut state = self.lock();
            let Some(token) = state.sessions.remove(&session) else {
                return;
            };
            token.cancel();

            let channel_ids: Vec<u64> = state
                .channels
                .iter()
                .filter(|(_, channel)| channel.session == session)
                .map(|(id, _)| *id)
                .collect();

            for id in channel_ids {
                if let Some(channel) = state.channels.remove(&id) {
                    let mut pending: Vec<_> = channel.unacked.into_iter().collect();
                    pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
                    for (_, (queue, mut message)) in pending {
                        message.redelivered = true;
                        state.stats.requeued += 1;
                        if let Some(target) = state.queues.get_mut(&queue) {
                            target.ready.push_front(message);
                        }
                    }
                }
            }
        }
        self.notify();
    }

    /// Returns the queue TTL and message id when the message needs a dead-letter timer.
    fn enqueue_locked(
        state: &mut BrokerState,
        queue: &str,
        body: Vec<u8>,
        headers: Headers,
    ) -> Option<(std::time::Duration, u64)> {
        state.next_message += 1;
        let id = state.next_message;

        let Some(target) = state.queues.get_mut(queue) else {
            state.stats.unroutable += 1;
            return None;
        };

        target.ready.push_back(StoredMessage {
            id,
            headers,
            body,
            redelivered: false,
        });
        let ttl = target.declaration.arguments.message_ttl;
        state.stats.published += 1;
        ttl.map(|ttl| (ttl, id))
    }

    fn after_enqueue(&self, queue: &str, ttl: Option<(std::time::Duration, u64)>) {
        self.notify();
        if let Some((ttl, id)) = ttl {
            let broker = self.clone();
            let queue = queue.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                broker.expire(&queue, id);
            });
        }
    }

    fn expire(&self, queue: &str, id: u64) {
        let ttl = {
            let mut state = self.lock();
            let Some(source) = state.queues.get_mut(queue) else {
                return;
            };
            let Some(position) = source.ready.iter().position(|message| message.id == id) else {
                return;
            };
            let Some(message) = source.ready.remove(position) else {
                return;
            };
            let Some(target) = source.declaration.arguments.dead_letter_to.clone() else {
                return;
            };
            state.stats.dead_lettered += 1;
            Self::enqueue_locked(&mut state, &target, message.body, message.headers)
                .map(|ttl| (target, ttl))
        };

        match ttl {
            Some((target, ttl)) => self.after_enqueue(&target, Some(ttl)),
            None => self.notify(),
        }
    }

    fn check_session(&self, session: u64) -> Result<(), BrokerError> {
        if self.lock().sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(BrokerError::Closed)
        }
    }
}

#[async_trait]
impl BrokerDriver for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let mut state = self.lock();
        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            state.stats.refused += 1;
            return Err(BrokerError::Connect("connection refused".to_string()));
        }

        state.next_session += 1;
        let id = state.next_session;
        let token = CancellationToken::new();
        state.sessions.insert(id, token.clone());
        state.stats.connections += 1;

        Ok(Arc::new(MemorySession {
            broker: self.clone(),
            id,
            token,
        }))
    }
}

struct MemorySession {
    broker: MemoryBroker,
    id: u64,
    token: CancellationToken,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.broker.lock();
        if !state.sessions.contains_key(&self.id) {
            return Err(BrokerError::Closed);
        }
        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.insert(
            id,
            ChannelState {
                session: self.id,
                prefetch: 0,
                unacked: HashMap::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            session: self.id,
            id,
        }))
    }

    async fn closed(&self) {
        self.token.cancelled().await;
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.close_session(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    session: u64,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.lock().channels.contains_key(&self.id)
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let channel = state.channels.get_mut(&self.id).ok_or(BrokerError::Closed)?;
        channel.prefetch = prefetch;
        Ok(())
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), BrokerError> {
        self.broker.check_session(self.session)?;
        let mut state = self.broker.lock();
        match state.queues.get(&declaration.name) {
            Some(existing) if existing.declaration != *declaration => Err(BrokerError::Declare {
                queue: declaration.name.clone(),
                reason: "inequivalent arguments for existing queue".to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    declaration.name.clone(),
                    QueueState {
                        declaration: declaration.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), BrokerError> {
        self.broker.check_session(self.session)?;
        let ttl = {
            let mut state = self.broker.lock();
            MemoryBroker::enqueue_locked(&mut state, queue, body.to_vec(), headers.clone())
        };
        self.broker.after_enqueue(queue, ttl);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        self.broker.check_session(self.session)?;
        if !self.broker.is_declared(queue) {
            return Err(BrokerError::Consume {
                queue: queue.to_string(),
                reason: "no such queue".to_string(),
            });
        }

        let token = self
            .broker
            .lock()
            .sessions
            .get(&self.session)
            .cloned()
            .ok_or(BrokerError::Closed)?;

        Ok(Box::new(MemoryDeliveryStream {
            broker: self.broker.clone(),
            channel: self.id,
            queue: queue.to_string(),
            token,
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        {
            let mut state = self.broker.lock();
            let channel = state.channels.get_mut(&self.id).ok_or(BrokerError::Closed)?;
            if channel.unacked.remove(&delivery_tag).is_none() {
                return Err(BrokerError::Settle {
                    delivery_tag,
                    reason: "unknown delivery tag".to_string(),
                });
            }
            state.stats.acked += 1;
        }
        self.broker.notify();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let ttl = {
            let mut state = self.broker.lock();
            let channel = state.channels.get_mut(&self.id).ok_or(BrokerError::Closed)?;
            let Some((queue, mut message)) = channel.unacked.remove(&delivery_tag) else {
                return Err(BrokerError::Settle {
                    delivery_tag,
                    reason: "unknown delivery tag".to_string(),
                });
            };
            state.stats.nacked += 1;

            if requeue {
                message.redelivered = true;
                state.stats.requeued += 1;
                if let Some(target) = state.queues.get_mut(&queue) {
                    target.ready.push_front(message);
                }
                None
            } else {
                let dead_letter = state
                    .queues
                    .get(&queue)
                    .and_then(|source| source.declaration.arguments.dead_letter_to.clone());
                match dead_letter {
                    Some(target) => {
                        state.stats.dead_lettered += 1;
                        MemoryBroker::enqueue_locked(
                            &mut state,
                            &target,
                            message.body,
                            message.headers,
                        )
                        .map(|ttl| (target, ttl))
                    }
                    None => None,
                }
            }
        };

        match ttl {
            Some((target, ttl)) => self.broker.after_enqueue(&target, Some(ttl)),
            None => self.broker.notify(),
        }
        Ok(())
    }
}

struct MemoryDeliveryStream {
    broker: MemoryBroker,
    channel: u64,
    queue: String,
    token: CancellationToken,
}

impl MemoryDeliveryStream {
    fn try_take(&self) -> Result<Option<RawDelivery>, BrokerError> {
        let mut state = self.broker.lock();
        let channel = state.channels.get(&self.channel).ok_or(BrokerError::Closed)?;
        if channel.prefetch > 0 && channel.unacked.len() >= channel.prefetch as usize {
            return Ok(None);
        }

        let Some(message) = state
            .queues
            .get_mut(&self.queue)
            .and_then(|queue| queue.ready.pop_front())
        else {
            return Ok(None);
        };

        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        let delivery = RawDelivery {
            delivery_tag,
            routing_key: self.queue.clone(),
            redelivered: message.redelivered,
            headers: message.headers.clone(),
            body: message.body.clone(),
        };

        if let Some(channel) = state.channels.get_mut(&self.channel) {
            channel
                .unacked
                .insert(delivery_tag, (self.queue.clone(), message));
        }

        Ok(Some(delivery))
    }
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Result<Option<RawDelivery>, BrokerError> {
        loop {
            let notified = self.broker.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.token.is_cancelled() {
                return Err(BrokerError::Closed);
            }
            if let Some(delivery) = self.try_take()? {
                return Ok(Some(delivery));
            }

            tokio::select! {
                _ = notified => {}
                _ = self.token.cancelled() => return Err(BrokerError::Closed),
            }
        }
    }
}
