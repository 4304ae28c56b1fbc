//! event-bus-tail: Logging subscriber
//!
//! Binds the configured queue to one routing key on the `event_bus`
//! exchange and logs every payload it receives. Useful for watching event
//! flow while debugging.
//!
//! ## Architecture
//! ```text
//! [publisher] --(event_bus, routing key)--> [queue] --> [event-bus-tail]
//!                                                             |
//!                                                             v
//!                                                          tracing
//! ```
//!
//! ## Configuration
//! - EVENT_BUS_CONFIG: Path to a YAML config file (optional)
//! - EVENT_BUS__CONNECTION__HOST etc.: Overrides for individual settings
//! - EVENT_BUS_ROUTING_KEY: Routing key to bind (or pass as first argument)
//! - EVENT_BUS_LOG: Log filter (default: info)
//!
//! The subscription is re-established with backoff whenever the broker
//! connection drops.

use std::time::Duration;

use serde_json::Value;
use tracing::info;

use rabbit_event_bus::config::BusConfig;
use rabbit_event_bus::utils::bootstrap::{init_tracing, keep_subscribed};
use rabbit_event_bus::{init_event_bus, HandlerError};

const ROUTING_KEY_ENV_VAR: &str = "EVENT_BUS_ROUTING_KEY";
const CONNECTION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

async fn log_payload(payload: Value) -> Result<(), HandlerError> {
    info!(payload = %payload, "Event received");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let routing_key = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(ROUTING_KEY_ENV_VAR).ok())
        .ok_or("usage: event-bus-tail <routing-key> (or set EVENT_BUS_ROUTING_KEY)")?;

    let config = BusConfig::load(None)?;
    let bus = init_event_bus(&config);

    info!(
        host = %config.connection.host,
        queue = %config.queue,
        routing_key = %routing_key,
        "event-bus-tail started"
    );

    tokio::select! {
        _ = keep_subscribed(
            &bus,
            || bus.subscribe(&routing_key, log_payload),
            CONNECTION_CHECK_INTERVAL,
        ) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    bus.connection().close().await?;
    Ok(())
}
