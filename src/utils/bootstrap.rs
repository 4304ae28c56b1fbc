//! Bootstrap utilities for event bus binaries.
//!
//! Shared initialization code and long-running subscription supervision.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::{self, EventBus};
use crate::config::LOG_ENV_VAR;

const RESUBSCRIBE_MIN_DELAY: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);

/// Initialize tracing with EVENT_BUS_LOG environment variable.
///
/// Defaults to "info" level if EVENT_BUS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Backoff between resubscription attempts.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Jitter enabled
pub fn resubscribe_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(RESUBSCRIBE_MIN_DELAY)
        .with_max_delay(RESUBSCRIBE_MAX_DELAY)
        .with_jitter()
}

/// Keep a subscription alive for as long as the future is polled.
///
/// `subscribe` is called again until it succeeds, and again whenever `bus`
/// loses its connection afterwards. Failures are retried with exponential
/// backoff and jitter, including failures after the connection itself was
/// established; the backoff resets after every successful subscription.
/// Connection state is checked every `check_interval`.
pub async fn keep_subscribed<F, Fut>(bus: &EventBus, mut subscribe: F, check_interval: Duration)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bus::Result<()>>,
{
    let backoff_builder = resubscribe_backoff();
    let mut backoff_iter = backoff_builder.build();
    let mut subscribed = false;

    loop {
        if !subscribed || !bus.is_connected() {
            match subscribe().await {
                Ok(()) => {
                    info!(queue = %bus.queue(), "Subscription established");
                    subscribed = true;
                    backoff_iter = backoff_builder.build();
                }
                Err(e) => {
                    subscribed = false;
                    let delay = backoff_iter.next().unwrap_or(RESUBSCRIBE_MAX_DELAY);
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        queue = %bus.queue(),
                        "Failed to subscribe, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
        }
        tokio::time::sleep(check_interval).await;
    }
}
