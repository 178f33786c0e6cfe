//! In-process broker
//!
//! Behaves like a single broker node with the semantics the crawler relies
//! on: per-consumer prefetch limits, explicit ack/nack with requeue, priority
//! ordering, unacked messages returning to the queue when their connection
//! dies, plus test controls to sever connections and fail dials.

use crate::transport::{
    Acker, Broker, BrokerChannel, BrokerConnection, ConnectionEvent, Delivery, DeliveryStream,
    TransportError, TransportResult,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// A message as it was published, kept for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub priority: u8,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Message {
    seq: u64,
    priority: u8,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: Vec<Message>,
    published: Vec<PublishedMessage>,
    acked: usize,
    nacked: usize,
}

impl QueueState {
    /// Highest priority first, then publish order
    fn pop(&mut self) -> Option<Message> {
        let index = self
            .ready
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|(index, _)| index)?;
        Some(self.ready.remove(index))
    }
}

struct Unacked {
    connection: u64,
    channel: u64,
    queue: String,
    message: Message,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    connections: HashMap<u64, Arc<ConnectionShared>>,
    channels: HashMap<u64, OpenChannel>,
    next_seq: u64,
    next_tag: u64,
    next_connection: u64,
    next_channel: u64,
    dials: u32,
    failing_dials: u32,
}

impl State {
    fn requeue(&mut self, queue: String, mut message: Message) {
        message.redelivered = true;
        self.queues.entry(queue).or_default().ready.push(message);
    }

    fn release_connection(&mut self, id: u64) {
        self.connections.remove(&id);
        self.channels.retain(|_, channel| channel.connection != id);
        self.requeue_unacked(|unacked| unacked.connection == id);
    }

    fn release_channel(&mut self, id: u64) {
        if let Some(channel) = self.channels.remove(&id) {
            channel.closed.cancel();
        }
        self.requeue_unacked(|unacked| unacked.channel == id);
    }

    fn requeue_unacked(&mut self, owned: impl Fn(&Unacked) -> bool) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| owned(*unacked))
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked.queue, unacked.message);
            }
        }
    }
}

struct OpenChannel {
    connection: u64,
    closed: CancellationToken,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // State stays consistent across a panicking test thread
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct ConnectionShared {
    id: u64,
    closed: CancellationToken,
    events: UnboundedSender<ConnectionEvent>,
}

/// In-process broker with test controls
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Makes the next `count` dial attempts fail
    pub fn fail_next_dials(&self, count: u32) {
        self.shared.lock().failing_dials = count;
    }

    /// Total dial attempts, failed ones included
    pub fn dials(&self) -> u32 {
        self.shared.lock().dials
    }

    /// Number of open connections
    pub fn open_connections(&self) -> usize {
        self.shared.lock().connections.len()
    }

    /// Drops every open connection as if the broker went away
    ///
    /// Watchers receive a `Closed` event and unacked messages are requeued.
    pub fn sever(&self, reason: &str) {
        let mut state = self.shared.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            if let Some(connection) = state.connections.get(&id).cloned() {
                connection.closed.cancel();
                let _ = connection.events.send(ConnectionEvent::Closed {
                    reason: reason.to_string(),
                });
            }
            state.release_connection(id);
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Closes every open channel while keeping the connections up
    ///
    /// Mirrors a broker-side channel exception: consumers on those channels
    /// stop, their unacked messages are requeued and further calls fail.
    pub fn close_channels(&self) {
        let mut state = self.shared.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.release_channel(id);
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Sends a blocked/unblocked notification to every open connection
    pub fn notify_all(&self, event: ConnectionEvent) {
        let state = self.shared.lock();
        for connection in state.connections.values() {
            let _ = connection.events.send(event.clone());
        }
    }

    /// Enqueues a message directly, bypassing any connection
    pub fn inject(&self, queue: &str, body: Vec<u8>, priority: u8) {
        push(&self.shared, queue, body, priority);
    }

    /// Every message ever published to `queue`, in publish order
    pub fn published(&self, queue: &str) -> Vec<PublishedMessage> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.published.clone())
            .unwrap_or_default()
    }

    /// Messages waiting in `queue`, excluding unacked deliveries
    pub fn ready(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Deliveries handed out but not yet settled, across all queues
    pub fn unacked(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    /// Number of acked deliveries from `queue`
    pub fn acked(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.acked)
            .unwrap_or(0)
    }

    /// Number of nacked deliveries from `queue`
    pub fn nacked(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.nacked)
            .unwrap_or(0)
    }
}

fn push(shared: &Shared, queue: &str, body: Vec<u8>, priority: u8) {
    let mut state = shared.lock();
    let seq = state.next_seq;
    state.next_seq += 1;

    let entry = state.queues.entry(queue.to_string()).or_default();
    entry.published.push(PublishedMessage {
        priority,
        body: body.clone(),
    });
    entry.ready.push(Message {
        seq,
        priority,
        body,
        redelivered: false,
    });
    drop(state);
    shared.notify.notify_waiters();
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn dial(&self) -> TransportResult<Arc<dyn BrokerConnection>> {
        let mut state = self.shared.lock();
        state.dials += 1;
        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(TransportError::Dial("connection refused".to_string()));
        }

        let id = state.next_connection;
        state.next_connection += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ConnectionShared {
            id,
            closed: CancellationToken::new(),
            events: tx,
        });
        state.connections.insert(id, Arc::clone(&connection));

        Ok(Arc::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            connection,
            events: Mutex::new(Some(rx)),
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    connection: Arc<ConnectionShared>,
    events: Mutex<Option<UnboundedReceiver<ConnectionEvent>>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> TransportResult<Arc<dyn BrokerChannel>> {
        if self.connection.closed.is_cancelled() {
            return Err(TransportError::Channel("connection closed".to_string()));
        }

        // Closing the connection closes its channels too
        let closed = self.connection.closed.child_token();
        let id = {
            let mut state = self.shared.lock();
            let id = state.next_channel;
            state.next_channel += 1;
            state.channels.insert(
                id,
                OpenChannel {
                    connection: self.connection.id,
                    closed: closed.clone(),
                },
            );
            id
        };

        Ok(Arc::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            connection: Arc::clone(&self.connection),
            id,
            closed,
            prefetch: AtomicU16::new(0),
        }))
    }

    fn take_events(&self) -> Option<UnboundedReceiver<ConnectionEvent>> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }

    async fn close(&self) -> TransportResult<()> {
        self.connection.closed.cancel();
        self.shared.lock().release_connection(self.connection.id);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    connection: Arc<ConnectionShared>,
    id: u64,
    closed: CancellationToken,
    prefetch: AtomicU16,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), String> {
        if self.connection.closed.is_cancelled() {
            Err("connection closed".to_string())
        } else if self.closed.is_cancelled() {
            Err(format!("channel {} closed by broker", self.id))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn set_prefetch(&self, count: u16) -> TransportResult<()> {
        self.ensure_open().map_err(TransportError::Channel)?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> TransportResult<()> {
        self.ensure_open().map_err(TransportError::Channel)?;
        self.shared
            .lock()
            .queues
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>, priority: u8) -> TransportResult<()> {
        self.ensure_open().map_err(TransportError::Publish)?;
        push(&self.shared, queue, payload, priority);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> TransportResult<DeliveryStream> {
        self.ensure_open().map_err(TransportError::Consume)?;

        let permits = match self.prefetch.load(Ordering::SeqCst) {
            0 => Semaphore::MAX_PERMITS,
            count => count as usize,
        };

        let subscription = Subscription {
            shared: Arc::clone(&self.shared),
            connection: self.connection.id,
            channel: self.id,
            closed: self.closed.clone(),
            queue: queue.to_string(),
            permits: Arc::new(Semaphore::new(permits)),
        };

        Ok(futures::stream::unfold(subscription, |subscription| async move {
            let delivery = subscription.next_delivery().await?;
            Some((Ok(delivery), subscription))
        })
        .boxed())
    }

    fn is_open(&self) -> bool {
        self.ensure_open().is_ok()
    }
}

struct Subscription {
    shared: Arc<Shared>,
    connection: u64,
    channel: u64,
    closed: CancellationToken,
    queue: String,
    permits: Arc<Semaphore>,
}

impl Subscription {
    /// Waits for a prefetch slot and a message; `None` once the channel dies
    async fn next_delivery(&self) -> Option<Delivery> {
        let permit = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok()?,
        };

        loop {
            // Registered before checking so a concurrent push cannot be missed
            let notified = self.shared.notify.notified();

            if self.closed.is_cancelled() {
                return None;
            }

            if let Some(delivery) = self.take() {
                return Some(delivery.finish(permit));
            }

            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    fn take(&self) -> Option<PendingDelivery> {
        let mut state = self.shared.lock();
        let message = state.queues.get_mut(&self.queue)?.pop()?;

        let tag = state.next_tag;
        state.next_tag += 1;
        state.unacked.insert(
            tag,
            Unacked {
                connection: self.connection,
                channel: self.channel,
                queue: self.queue.clone(),
                message: message.clone(),
            },
        );

        Some(PendingDelivery {
            shared: Arc::clone(&self.shared),
            tag,
            message,
        })
    }
}

struct PendingDelivery {
    shared: Arc<Shared>,
    tag: u64,
    message: Message,
}

impl PendingDelivery {
    fn finish(self, permit: OwnedSemaphorePermit) -> Delivery {
        let acker = MemoryAcker {
            shared: self.shared,
            tag: self.tag,
            _permit: permit,
        };
        Delivery::new(self.message.body, self.message.redelivered, Box::new(acker))
    }
}

/// Settles one delivery; releases its prefetch slot when dropped
struct MemoryAcker {
    shared: Arc<Shared>,
    tag: u64,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> TransportResult<()> {
        let mut state = self.shared.lock();
        let unacked = state
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| TransportError::Ack(format!("unknown delivery tag {}", self.tag)))?;
        state.queues.entry(unacked.queue).or_default().acked += 1;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> TransportResult<()> {
        let mut state = self.shared.lock();
        let unacked = state
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| TransportError::Ack(format!("unknown delivery tag {}", self.tag)))?;
        state.queues.entry(unacked.queue.clone()).or_default().nacked += 1;
        if requeue {
            state.requeue(unacked.queue, unacked.message);
        }
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}
