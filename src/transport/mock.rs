//! Mock transport implementation for testing.
//!
//! Behaves like a single in-memory broker with direct-exchange routing.
//! Every channel operation is recorded, any operation can be made to fail,
//! connection notifications can be fired by hand, and messages can be
//! delivered straight to a queue's consumer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{
    ConnectionEvent, ConnectionEventKind, ConnectionListener, Delivery, DeliveryCallback,
    ExchangeKind, PublishOptions, Transport, TransportChannel, TransportConnection,
    TransportError,
};
use crate::config::ConnectionConfig;

/// Channel operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    OpenChannel,
    DeclareExchange,
    DeclareQueue,
    BindQueue,
    Send,
    Consume,
    Acknowledge,
}

/// A broker operation as observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOperation {
    DeclareExchange {
        name: String,
        kind: ExchangeKind,
    },
    DeclareQueue {
        name: String,
    },
    BindQueue {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Send {
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        options: PublishOptions,
    },
    Consume {
        queue: String,
    },
    Acknowledge {
        delivery_tag: u64,
    },
}

#[derive(Default)]
struct MockQueue {
    pending: VecDeque<Delivery>,
    consumers: Vec<DeliveryCallback>,
    next_consumer: usize,
}

impl MockQueue {
    fn next_consumer(&mut self) -> Option<DeliveryCallback> {
        if self.consumers.is_empty() {
            return None;
        }
        let consumer = self.consumers[self.next_consumer % self.consumers.len()].clone();
        self.next_consumer = self.next_consumer.wrapping_add(1);
        Some(consumer)
    }
}

#[derive(Default)]
struct MockState {
    connect_attempts: usize,
    fail_next_connects: usize,
    always_fail_connect: bool,
    failures: HashMap<MockOperation, TransportError>,
    operations: Vec<RecordedOperation>,
    channels_opened: usize,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MockQueue>,
    bindings: Vec<(String, String, String)>,
    returned: Vec<Delivery>,
    next_delivery_tag: u64,
    fire_on_connect: Option<ConnectionEvent>,
}

impl MockState {
    fn check(&self, op: MockOperation) -> Result<(), TransportError> {
        match self.failures.get(&op) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn next_tag(&mut self) -> u64 {
        self.next_delivery_tag += 1;
        self.next_delivery_tag
    }
}

type SharedState = Arc<Mutex<MockState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock broker transport for testing.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: SharedState,
    connections: Arc<Mutex<Vec<Arc<MockConnection>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every connection attempt fail.
    pub fn set_fail_on_connect(&self, fail: bool) {
        lock(&self.state).always_fail_connect = fail;
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        lock(&self.state).fail_next_connects = count;
    }

    /// Raise `event` on the next opened connection before it is handed out,
    /// as a broker that drops the connection right after the handshake would.
    pub fn fire_on_next_connect(&self, event: ConnectionEvent) {
        lock(&self.state).fire_on_connect = Some(event);
    }

    /// Make `op` fail with `error` on every channel until cleared.
    pub fn fail_operation(&self, op: MockOperation, error: TransportError) {
        lock(&self.state).failures.insert(op, error);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    pub fn connect_attempts(&self) -> usize {
        lock(&self.state).connect_attempts
    }

    pub fn channels_opened(&self) -> usize {
        lock(&self.state).channels_opened
    }

    pub fn operations(&self) -> Vec<RecordedOperation> {
        lock(&self.state).operations.clone()
    }

    /// Messages sent with `mandatory` that matched no binding.
    pub fn returned_messages(&self) -> Vec<Delivery> {
        lock(&self.state).returned.clone()
    }

    /// Delivery tags acknowledged so far, in order.
    pub fn acknowledged(&self) -> Vec<u64> {
        lock(&self.state)
            .operations
            .iter()
            .filter_map(|op| match op {
                RecordedOperation::Acknowledge { delivery_tag } => Some(*delivery_tag),
                _ => None,
            })
            .collect()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Messages sitting in `queue` with no consumer to take them.
    pub fn pending_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    /// Most recently opened connection.
    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Deliver `data` to the next consumer of `queue` and wait for the
    /// consumer callback to finish.
    ///
    /// Returns the delivery tag, or `None` if the queue had no consumer (the
    /// message is then kept pending).
    pub async fn deliver(&self, queue: &str, routing_key: &str, data: &[u8]) -> Option<u64> {
        let (delivery, consumer) = {
            let mut state = lock(&self.state);
            let delivery = Delivery {
                delivery_tag: state.next_tag(),
                routing_key: routing_key.to_string(),
                data: data.to_vec(),
            };
            let queue = state.queues.entry(queue.to_string()).or_default();
            match queue.next_consumer() {
                Some(consumer) => (delivery, consumer),
                None => {
                    queue.pending.push_back(delivery);
                    return None;
                }
            }
        };
        let tag = delivery.delivery_tag;
        consumer(delivery).await;
        Some(tag)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_connection(
        &self,
        _config: &ConnectionConfig,
    ) -> Result<Arc<dyn TransportConnection>, TransportError> {
        {
            let mut state = lock(&self.state);
            state.connect_attempts += 1;
            let attempt = state.connect_attempts;
            if state.always_fail_connect || state.fail_next_connects > 0 {
                state.fail_next_connects = state.fail_next_connects.saturating_sub(1);
                return Err(TransportError::new(format!(
                    "connection refused (attempt {})",
                    attempt
                )));
            }
        }

        let connection = Arc::new(MockConnection {
            state: self.state.clone(),
            listeners: Mutex::new(HashMap::new()),
            fired: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let early_event = lock(&self.state).fire_on_connect.take();
        if let Some(event) = early_event {
            connection.fire(event);
        }
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(connection.clone());
        Ok(connection)
    }
}

/// Connection handle produced by [`MockTransport`].
pub struct MockConnection {
    state: SharedState,
    listeners: Mutex<HashMap<ConnectionEventKind, Vec<ConnectionListener>>>,
    fired: Mutex<HashMap<ConnectionEventKind, ConnectionEvent>>,
    closed: AtomicBool,
}

impl MockConnection {
    /// Raise a lifecycle notification, as the broker would.
    ///
    /// Each kind fires at most once; repeats are ignored. Listeners
    /// registered after a kind fired receive it on registration.
    pub fn fire(&self, event: ConnectionEvent) {
        let kind = event.kind();
        let mut fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        if fired.contains_key(&kind) {
            return;
        }
        fired.insert(kind, event.clone());
        if matches!(event, ConnectionEvent::Closed | ConnectionEvent::Error(_)) {
            self.closed.store(true, Ordering::SeqCst);
        }
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.get(&kind).into_iter().flatten() {
            listener(event.clone());
        }
    }

    pub fn listener_count(&self, kind: ConnectionEventKind) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnection for MockConnection {
    fn register_listener(&self, kind: ConnectionEventKind, listener: ConnectionListener) {
        let fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(event) = fired.get(&kind).cloned() {
            drop(fired);
            listener(event);
            return;
        }
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(listener);
    }

    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::new("connection is closed"));
        }
        let mut state = lock(&self.state);
        state.check(MockOperation::OpenChannel)?;
        state.channels_opened += 1;
        Ok(Arc::new(MockChannel {
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.fire(ConnectionEvent::Closed);
        Ok(())
    }
}

/// Channel produced by [`MockConnection`].
pub struct MockChannel {
    state: SharedState,
}

#[async_trait]
impl TransportChannel for MockChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.check(MockOperation::DeclareExchange)?;
        state.operations.push(RecordedOperation::DeclareExchange {
            name: name.to_string(),
            kind,
        });
        state.exchanges.insert(name.to_string(), kind);
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.check(MockOperation::DeclareQueue)?;
        state.operations.push(RecordedOperation::DeclareQueue {
            name: name.to_string(),
        });
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.check(MockOperation::BindQueue)?;
        if !state.queues.contains_key(queue) {
            return Err(TransportError::new(format!("no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::new(format!("no exchange '{}'", exchange)));
        }
        state.operations.push(RecordedOperation::BindQueue {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        let binding = (
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        );
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        let mut dispatch = Vec::new();
        {
            let mut state = lock(&self.state);
            state.check(MockOperation::Send)?;
            if !state.exchanges.contains_key(exchange) {
                return Err(TransportError::new(format!("no exchange '{}'", exchange)));
            }
            state.operations.push(RecordedOperation::Send {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
                options,
            });

            let targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|(_, ex, key)| ex == exchange && key == routing_key)
                .map(|(queue, _, _)| queue.clone())
                .collect();

            if targets.is_empty() {
                if options.mandatory {
                    let delivery = Delivery {
                        delivery_tag: 0,
                        routing_key: routing_key.to_string(),
                        data: payload.to_vec(),
                    };
                    state.returned.push(delivery);
                }
                return Ok(());
            }

            for name in targets {
                let delivery = Delivery {
                    delivery_tag: state.next_tag(),
                    routing_key: routing_key.to_string(),
                    data: payload.to_vec(),
                };
                let queue = state.queues.entry(name).or_default();
                match queue.next_consumer() {
                    Some(consumer) => dispatch.push((consumer, delivery)),
                    None => queue.pending.push_back(delivery),
                }
            }
        }

        for (consumer, delivery) in dispatch {
            tokio::spawn(consumer(delivery));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        on_message: DeliveryCallback,
    ) -> Result<(), TransportError> {
        let backlog = {
            let mut state = lock(&self.state);
            state.check(MockOperation::Consume)?;
            if !state.queues.contains_key(queue) {
                return Err(TransportError::new(format!("no queue '{}'", queue)));
            }
            state.operations.push(RecordedOperation::Consume {
                queue: queue.to_string(),
            });
            let queue = state.queues.entry(queue.to_string()).or_default();
            queue.consumers.push(on_message.clone());
            std::mem::take(&mut queue.pending)
        };

        if !backlog.is_empty() {
            tokio::spawn(async move {
                for delivery in backlog {
                    on_message(delivery).await;
                }
            });
        }
        Ok(())
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.check(MockOperation::Acknowledge)?;
        state.operations.push(RecordedOperation::Acknowledge {
            delivery_tag: delivery.delivery_tag,
        });
        Ok(())
    }
}
