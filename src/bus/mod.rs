//! Event bus for routing-key based publish/subscribe.
//!
//! This module contains:
//! - `EventBus`: publishes integration events and registers subscribers
//! - `EventHandler` trait: For processing consumed payloads
//! - `IntegrationEvent`: the unit of publication
//! - Bus error types
//!
//! All buses address one direct exchange, [`EXCHANGE_NAME`]. Publishing sends
//! the event data as JSON under the event type as routing key; subscribing
//! binds the bus queue under a routing key and consumes it.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, Instrument};

use crate::config::BusConfig;
use crate::connection::ManagedConnection;
#[cfg(feature = "amqp")]
use crate::transport::AmqpTransport;
use crate::transport::{
    Delivery, DeliveryCallback, ExchangeKind, PublishOptions, Transport, TransportChannel,
    TransportError,
};

/// Exchange shared by every event bus in the process.
pub const EXCHANGE_NAME: &str = "event_bus";

/// Options every event is published with.
pub const PUBLISH_OPTIONS: PublishOptions = PublishOptions {
    persistent: true,
    mandatory: true,
};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Error returned by an event handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Broker operation performed on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolOperation {
    DeclareExchange,
    DeclareQueue,
    BindQueue,
    Publish,
    Consume,
}

impl fmt::Display for ProtocolOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolOperation::DeclareExchange => "declare exchange",
            ProtocolOperation::DeclareQueue => "declare queue",
            ProtocolOperation::BindQueue => "bind queue",
            ProtocolOperation::Publish => "publish message",
            ProtocolOperation::Consume => "start consumer",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(#[source] TransportError),

    #[error("No broker connections are available to perform this action")]
    NotConnected,

    #[error("Failed to open channel: {0}")]
    Channel(#[source] TransportError),

    #[error("Failed to {operation}: {source}")]
    Protocol {
        operation: ProtocolOperation,
        source: TransportError,
    },

    #[error("Failed to serialize event payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    fn protocol(operation: ProtocolOperation) -> impl FnOnce(TransportError) -> BusError {
        move |source| BusError::Protocol { operation, source }
    }

    /// The transport fault behind this error, if there is one.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            BusError::Connection(e) | BusError::Channel(e) => Some(e),
            BusError::Protocol { source, .. } => Some(source),
            BusError::NotConnected | BusError::Serialization(_) => None,
        }
    }
}

/// Failure while processing one consumed message.
///
/// Logged and suppressed; the message is acknowledged regardless.
#[derive(Debug, thiserror::Error)]
pub enum HandlingError {
    #[error("Failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Handler failed: {0}")]
    Handler(HandlerError),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

// ============================================================================
// Events and handlers
// ============================================================================

/// An event published on the bus.
///
/// `event_type` is the routing key; only `data` travels as the message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationEvent<T = Value> {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: T,
}

impl<T> IntegrationEvent<T> {
    pub fn new(event_type: impl Into<String>, data: T) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

/// Handler for payloads consumed from the bus.
pub trait EventHandler: Send + Sync {
    /// Process a decoded JSON payload.
    fn handle(&self, payload: Value) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, payload: Value) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin(self(payload))
    }
}

/// Adapts a handler taking `T` to one taking raw JSON.
struct TypedHandler<T, F> {
    inner: F,
    _payload: std::marker::PhantomData<fn() -> T>,
}

impl<T, F, Fut> EventHandler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, payload: Value) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        match serde_json::from_value::<T>(payload) {
            Ok(typed) => Box::pin((self.inner)(typed)),
            Err(e) => Box::pin(futures::future::ready(Err(HandlerError::from(e)))),
        }
    }
}

// ============================================================================
// Event bus
// ============================================================================

/// Publish/subscribe over a managed broker connection.
///
/// Each call lazily connects, opens a fresh channel and declares the
/// exchange before doing its work. Channels are never reused.
pub struct EventBus {
    connection: ManagedConnection,
    queue: String,
}

impl EventBus {
    /// Create a bus whose subscriptions consume `queue`.
    pub fn new(connection: ManagedConnection, queue: impl Into<String>) -> Self {
        Self {
            connection,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn connection(&self) -> &ManagedConnection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Publish an integration event.
    ///
    /// The data is sent as JSON to [`EXCHANGE_NAME`] under the event type as
    /// routing key, persistent and mandatory.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(routing_key = %event.event_type))]
    pub async fn publish<T>(&self, event: &IntegrationEvent<T>) -> Result<()>
    where
        T: Serialize + Sync,
    {
        self.ensure_connected().await?;

        info!("Creating channel to publish event");
        let channel = self.connection.open_channel().await?;

        info!("Declaring exchange to publish event");
        declare_exchange(channel.as_ref()).await?;

        let payload = serde_json::to_vec(&event.data)?;

        info!("Publishing event");
        channel
            .send(EXCHANGE_NAME, &event.event_type, &payload, PUBLISH_OPTIONS)
            .await
            .map_err(BusError::protocol(ProtocolOperation::Publish))?;

        debug!(
            exchange = EXCHANGE_NAME,
            bytes = payload.len(),
            "Published event"
        );
        Ok(())
    }

    /// Subscribe to events published under `routing_key`.
    ///
    /// Returns once the consumer is registered. Every delivery is decoded
    /// and handed to `handler`; decode failures, handler errors and handler
    /// panics are logged, and the delivery is acknowledged in every case.
    #[tracing::instrument(name = "bus.subscribe", skip_all, fields(queue = %self.queue, routing_key = %routing_key))]
    pub async fn subscribe<H>(&self, routing_key: &str, handler: H) -> Result<()>
    where
        H: EventHandler + 'static,
    {
        self.ensure_connected().await?;

        info!("Creating channel to subscribe event");
        let channel = self.connection.open_channel().await?;

        info!("Declaring exchange to subscribe event");
        declare_exchange(channel.as_ref()).await?;

        info!("Declaring queue to subscribe event");
        channel
            .declare_queue(&self.queue)
            .await
            .map_err(BusError::protocol(ProtocolOperation::DeclareQueue))?;

        channel
            .bind_queue(&self.queue, EXCHANGE_NAME, routing_key)
            .await
            .map_err(BusError::protocol(ProtocolOperation::BindQueue))?;

        info!(
            queue = %self.queue,
            routing_key = %routing_key,
            "Bound queue to exchange"
        );

        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        let ack_channel = Arc::clone(&channel);
        let on_message: DeliveryCallback = Arc::new(move |delivery: Delivery| {
            let channel = Arc::clone(&ack_channel);
            let handler = Arc::clone(&handler);
            let span = tracing::info_span!("bus.consume", routing_key = %delivery.routing_key);
            async move { process_delivery(channel.as_ref(), handler.as_ref(), delivery).await }
                .instrument(span)
                .boxed()
        });

        info!("Consuming events");
        channel
            .consume(&self.queue, on_message)
            .await
            .map_err(BusError::protocol(ProtocolOperation::Consume))?;

        Ok(())
    }

    /// Subscribe with a handler that takes a typed payload.
    ///
    /// Payloads that do not deserialize into `T` are logged and
    /// acknowledged like any other handler failure.
    pub async fn subscribe_typed<T, F, Fut>(&self, routing_key: &str, handler: F) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let handler = TypedHandler {
            inner: handler,
            _payload: std::marker::PhantomData,
        };
        self.subscribe(routing_key, handler).await
    }

    async fn ensure_connected(&self) -> Result<()> {
        if !self.connection.is_connected() {
            self.connection.connect().await?;
        }
        Ok(())
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize an event bus over RabbitMQ.
///
/// The bus connects lazily on its first publish or subscribe. The retry mode
/// comes from [`BusConfig::retry_policy`].
#[cfg(feature = "amqp")]
pub fn init_event_bus(config: &BusConfig) -> EventBus {
    init_event_bus_with_transport(Arc::new(AmqpTransport::new()), config)
}

/// Initialize an event bus over an arbitrary transport.
pub fn init_event_bus_with_transport(
    transport: Arc<dyn Transport>,
    config: &BusConfig,
) -> EventBus {
    let policy = config.retry_policy();
    let connection = ManagedConnection::new(transport, config.connection.clone(), policy);
    info!(
        queue = %config.queue,
        retry_policy = ?policy,
        "Event bus initialized"
    );
    EventBus::new(connection, config.queue.clone())
}

async fn declare_exchange(channel: &dyn TransportChannel) -> Result<()> {
    channel
        .declare_exchange(EXCHANGE_NAME, ExchangeKind::Direct)
        .await
        .map_err(BusError::protocol(ProtocolOperation::DeclareExchange))
}

/// Handle one delivery, then acknowledge it no matter what happened.
async fn process_delivery(
    channel: &dyn TransportChannel,
    handler: &dyn EventHandler,
    delivery: Delivery,
) {
    if let Err(e) = handle_delivery(handler, &delivery).await {
        error!(
            error = %e,
            routing_key = %delivery.routing_key,
            delivery_tag = delivery.delivery_tag,
            "Failed to handle event"
        );
    }

    if let Err(e) = channel.acknowledge(&delivery).await {
        error!(error = %e, delivery_tag = delivery.delivery_tag, "Failed to ack message");
    }
}

async fn handle_delivery(
    handler: &dyn EventHandler,
    delivery: &Delivery,
) -> std::result::Result<(), HandlingError> {
    let payload: Value = serde_json::from_slice(&delivery.data)?;

    debug!(routing_key = %delivery.routing_key, "Received event");

    match AssertUnwindSafe(async move { handler.handle(payload).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result.map_err(HandlingError::Handler),
        Err(panic) => Err(HandlingError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests;
