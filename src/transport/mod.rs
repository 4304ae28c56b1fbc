//! Broker transport abstraction.
//!
//! This module contains:
//! - `Transport` trait: opens connections to a broker
//! - `TransportConnection` trait: a live connection handle with lifecycle notifications
//! - `TransportChannel` trait: a session used for declarations, publishing and consuming
//! - Implementations: AMQP (RabbitMQ), Mock

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::config::ConnectionConfig;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use mock::MockTransport;

// ============================================================================
// Errors
// ============================================================================

/// Fault reported by the broker transport.
///
/// Cloneable so the same fault can be surfaced to a caller and recorded by
/// a listener at the same time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for TransportError {
    fn from(e: lapin::Error) -> Self {
        Self::new(e.to_string())
    }
}

// ============================================================================
// Connection notifications
// ============================================================================

/// Lifecycle notification raised by a connection handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection was closed (by either side).
    Closed,
    /// The connection failed.
    Error(String),
    /// The broker stopped accepting publishes on this connection.
    Blocked(String),
}

impl ConnectionEvent {
    pub fn kind(&self) -> ConnectionEventKind {
        match self {
            ConnectionEvent::Closed => ConnectionEventKind::Closed,
            ConnectionEvent::Error(_) => ConnectionEventKind::Error,
            ConnectionEvent::Blocked(_) => ConnectionEventKind::Blocked,
        }
    }
}

/// Discriminator used when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ConnectionEventKind {
    Closed,
    Error,
    Blocked,
}

impl ConnectionEventKind {
    /// Every kind a managed connection listens for.
    pub const ALL: [ConnectionEventKind; 3] = [
        ConnectionEventKind::Closed,
        ConnectionEventKind::Error,
        ConnectionEventKind::Blocked,
    ];
}

/// Callback invoked when a connection notification fires.
///
/// Called from whatever context the transport raises notifications in, so it
/// must not block.
pub type ConnectionListener = Box<dyn Fn(ConnectionEvent) + Send + Sync>;

// ============================================================================
// Channel operations
// ============================================================================

/// Exchange routing kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes on exact routing-key equality.
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
        }
    }
}

/// Delivery options attached to a published message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to persist the message.
    pub persistent: bool,
    /// Ask the broker to return the message if no queue is bound for it.
    pub mandatory: bool,
}

/// A message handed to a consumer by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned tag used for acknowledgement.
    pub delivery_tag: u64,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Raw message body.
    pub data: Vec<u8>,
}

/// Callback invoked for each delivery on a consumer.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

// ============================================================================
// Traits
// ============================================================================

/// Opens connections to a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a new connection using `config`.
    async fn open_connection(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn TransportConnection>, TransportError>;
}

/// A live connection to the broker.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Register a callback for one kind of lifecycle notification.
    ///
    /// Each kind fires at most once per connection.
    fn register_listener(&self, kind: ConnectionEventKind, listener: ConnectionListener);

    /// Open a new channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, TransportError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A session over a connection used to issue broker operations.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Declare an exchange; succeeds if it already exists with the same kind.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind)
        -> Result<(), TransportError>;

    /// Declare a queue; succeeds if it already exists.
    async fn declare_queue(&self, name: &str) -> Result<(), TransportError>;

    /// Bind `queue` to `exchange` under `routing_key`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Publish `payload` to `exchange` with `routing_key`.
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<(), TransportError>;

    /// Start consuming `queue`, invoking `on_message` for every delivery.
    ///
    /// Returns once the consumer is registered; deliveries are handled in the
    /// background for the lifetime of the channel.
    async fn consume(&self, queue: &str, on_message: DeliveryCallback)
        -> Result<(), TransportError>;

    /// Positively acknowledge a delivery.
    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), TransportError>;
}
