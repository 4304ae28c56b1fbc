//! rabbit-event-bus - RabbitMQ event bus
//!
//! A managed broker connection with bounded retry, and a publish/subscribe
//! event bus routing on exact routing keys through one direct exchange.
//!
//! ```ignore
//! let config = BusConfig::load(None)?;
//! let bus = init_event_bus(&config);
//!
//! bus.subscribe("user.created", |payload: serde_json::Value| async move {
//!     tracing::info!(%payload, "user created");
//!     Ok(())
//! })
//! .await?;
//!
//! bus.publish(&IntegrationEvent::new("user.created", json!({"id": 42})))
//!     .await?;
//! ```

pub mod bus;
pub mod config;
pub mod connection;
pub mod transport;
pub mod utils;

// Re-exports
#[cfg(feature = "amqp")]
pub use bus::init_event_bus;
pub use bus::{
    init_event_bus_with_transport, BusError, EventBus, EventHandler, HandlerError,
    IntegrationEvent, EXCHANGE_NAME,
};
pub use config::{BusConfig, ConnectionConfig};
pub use connection::{ManagedConnection, RetryPolicy};
