//! Managed broker connection.
//!
//! Owns a single logical connection handle and the state machine around it:
//! Disconnected (initial) and Connected. The handle is dropped back to
//! Disconnected whenever the transport reports the connection closed, failed
//! or blocked. Reconnection is lazy; the next caller of [`ManagedConnection::connect`]
//! re-establishes it, closing the dropped handle first. A blocked connection
//! is still open on the broker until then.
//!
//! There is no lock held across `connect()`. Callers are expected to
//! serialize reconnects on one instance; concurrent callers racing a
//! reconnect may each open a connection, and the last one stored wins.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tracing::{debug, error, info, warn};

use crate::bus::{BusError, Result};
use crate::config::{ConnectionConfig, DEFAULT_RETRY_COUNT};
use crate::transport::{
    ConnectionEvent, ConnectionEventKind, Transport, TransportChannel, TransportConnection,
};

/// How failed connection attempts are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Propagate the first failure. No budget is kept.
    Disabled,
    /// Retry immediately while the instance-wide budget lasts.
    ///
    /// The budget is decremented on every failed attempt and never
    /// replenished, so once it reaches zero every later failure propagates
    /// after a single attempt.
    Bounded(u32),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Bounded(DEFAULT_RETRY_COUNT)
    }
}

#[derive(Default)]
struct Slot {
    handle: Option<Arc<dyn TransportConnection>>,
    /// Bumped every time a handle is stored, so notifications from a
    /// replaced handle can be told apart from the current one.
    generation: u64,
    /// Handles dropped by a notification, waiting to be closed.
    retired: Vec<Arc<dyn TransportConnection>>,
}

type SharedSlot = Arc<RwLock<Slot>>;

fn read_slot(slot: &RwLock<Slot>) -> RwLockReadGuard<'_, Slot> {
    slot.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_slot(slot: &RwLock<Slot>) -> RwLockWriteGuard<'_, Slot> {
    slot.write().unwrap_or_else(PoisonError::into_inner)
}

/// A broker connection that reconnects on demand with a bounded retry budget.
pub struct ManagedConnection {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    policy: RetryPolicy,
    retries_left: AtomicU32,
    slot: SharedSlot,
}

impl ManagedConnection {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        policy: RetryPolicy,
    ) -> Self {
        let budget = match policy {
            RetryPolicy::Disabled => 0,
            RetryPolicy::Bounded(n) => n,
        };
        Self {
            transport,
            config,
            policy,
            retries_left: AtomicU32::new(budget),
            slot: Arc::new(RwLock::new(Slot::default())),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Retries still available, or `None` when retry is disabled.
    pub fn remaining_retries(&self) -> Option<u32> {
        match self.policy {
            RetryPolicy::Disabled => None,
            RetryPolicy::Bounded(_) => Some(self.retries_left.load(Ordering::SeqCst)),
        }
    }

    /// True iff a usable connection handle is held.
    pub fn is_connected(&self) -> bool {
        read_slot(&self.slot).handle.is_some()
    }

    /// Establish the connection, retrying per the retry policy.
    ///
    /// Succeeds immediately if already connected. On final failure the fault
    /// from the last attempt is returned and the connection stays
    /// disconnected.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        self.close_retired().await;

        loop {
            info!(
                host = %self.config.host,
                port = self.config.port,
                "Broker client is trying to connect"
            );

            match self.transport.open_connection(&self.config).await {
                Ok(handle) => {
                    self.install(handle);
                    info!(host = %self.config.host, "Connected to broker");
                    return Ok(());
                }
                Err(e) => {
                    if !self.take_retry() {
                        error!(error = %e, host = %self.config.host, "Failed to connect to broker");
                        return Err(BusError::Connection(e));
                    }
                    warn!(
                        error = %e,
                        retries_left = self.retries_left.load(Ordering::SeqCst),
                        "Failed to connect to broker, retrying..."
                    );
                }
            }
        }
    }

    /// Open a fresh channel on the current connection.
    ///
    /// Never connects; fails with [`BusError::NotConnected`] when there is
    /// no usable connection.
    pub async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        let handle = read_slot(&self.slot)
            .handle
            .clone()
            .ok_or(BusError::NotConnected)?;

        handle.open_channel().await.map_err(BusError::Channel)
    }

    /// Close the current connection, if any.
    pub async fn close(&self) -> Result<()> {
        self.close_retired().await;
        let handle = write_slot(&self.slot).handle.take();
        match handle {
            Some(handle) => handle.close().await.map_err(BusError::Connection),
            None => Ok(()),
        }
    }

    async fn close_retired(&self) {
        let retired = std::mem::take(&mut write_slot(&self.slot).retired);
        for handle in retired {
            if let Err(e) = handle.close().await {
                debug!(error = %e, "Dropped broker connection was already closed");
            }
        }
    }

    /// Consume one retry from the budget. False when none is left.
    fn take_retry(&self) -> bool {
        match self.policy {
            RetryPolicy::Disabled => false,
            RetryPolicy::Bounded(_) => self
                .retries_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok(),
        }
    }

    fn install(&self, handle: Arc<dyn TransportConnection>) {
        let generation = {
            let mut slot = write_slot(&self.slot);
            slot.generation += 1;
            slot.handle = Some(handle.clone());
            slot.generation
        };

        for kind in ConnectionEventKind::ALL {
            let slot = Arc::downgrade(&self.slot);
            handle.register_listener(
                kind,
                Box::new(move |event: ConnectionEvent| {
                    on_notification(&slot, generation, event)
                }),
            );
        }
    }
}

fn on_notification(slot: &Weak<RwLock<Slot>>, generation: u64, event: ConnectionEvent) {
    match &event {
        ConnectionEvent::Closed => info!("Broker connection is closing"),
        ConnectionEvent::Error(reason) => error!(error = %reason, "Broker connection failed"),
        ConnectionEvent::Blocked(reason) => warn!(reason = %reason, "Broker connection blocked"),
    }

    let Some(slot) = slot.upgrade() else {
        return;
    };
    let mut slot = write_slot(&slot);
    if slot.generation == generation {
        if let Some(handle) = slot.handle.take() {
            slot.retired.push(handle);
        }
    }
}
