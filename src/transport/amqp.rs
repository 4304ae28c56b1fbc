//! AMQP (RabbitMQ) transport implementation.
//!
//! Wraps a `lapin` connection and its channels behind the transport traits.
//! Lifecycle notifications come from two sources: lapin's error callback and
//! a status watcher that notices the broker blocking or closing the
//! connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties, ConnectionStatus,
};
use tracing::{debug, error, info, warn};

use super::{
    ConnectionEvent, ConnectionEventKind, ConnectionListener, Delivery, DeliveryCallback,
    ExchangeKind, PublishOptions, Transport, TransportChannel, TransportConnection,
    TransportError,
};
use crate::config::ConnectionConfig;

/// How often the status watcher checks for blocked or closed connections.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Content type attached to every published message.
const CONTENT_TYPE: &str = "application/json";

/// AMQP 0-9-1 delivery mode for persistent messages.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Reply code sent when closing a connection normally.
const REPLY_SUCCESS: u16 = 200;

/// Transport that talks to RabbitMQ over AMQP 0-9-1.
#[derive(Clone, Debug, Default)]
pub struct AmqpTransport {
    connection_name: Option<String>,
}

impl AmqpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for connections in the broker's management UI.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    fn properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }
}

/// Build the broker URI from connection settings.
fn amqp_uri(config: &ConnectionConfig) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.vhost.clone(),
        query: Default::default(),
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn open_connection(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn TransportConnection>, TransportError> {
        let connection = Connection::connect_uri(amqp_uri(config), self.properties()).await?;

        info!(
            host = %config.host,
            port = config.port,
            vhost = %config.vhost,
            "Connected to AMQP"
        );

        Ok(Arc::new(AmqpConnection::new(connection)))
    }
}

/// Fan-out for lifecycle notifications; each kind fires at most once.
///
/// lapin starts reporting as soon as the connection exists, before anyone
/// has registered, so a listener for a kind that already fired is called
/// right away with the recorded event.
#[derive(Default)]
struct Notifier {
    listeners: Mutex<HashMap<ConnectionEventKind, Vec<ConnectionListener>>>,
    fired: Mutex<HashMap<ConnectionEventKind, ConnectionEvent>>,
}

impl Notifier {
    fn register(&self, kind: ConnectionEventKind, listener: ConnectionListener) {
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

    fn notify(&self, event: ConnectionEvent) {
        let mut fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        if fired.contains_key(&event.kind()) {
            return;
        }
        fired.insert(event.kind(), event.clone());

        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.get(&event.kind()).into_iter().flatten() {
            listener(event.clone());
        }
    }
}

/// A live `lapin` connection.
pub struct AmqpConnection {
    connection: Connection,
    notifier: Arc<Notifier>,
}

impl AmqpConnection {
    fn new(connection: Connection) -> Self {
        let notifier = Arc::new(Notifier::default());

        let on_error = Arc::downgrade(&notifier);
        connection.on_error(move |e: lapin::Error| {
            if let Some(notifier) = on_error.upgrade() {
                notifier.notify(ConnectionEvent::Error(e.to_string()));
            }
        });

        watch_status(connection.status().clone(), Arc::downgrade(&notifier));

        Self {
            connection,
            notifier,
        }
    }
}

/// Poll the connection status until it closes or the handle is dropped.
///
/// A blocked connection stays open here; the owner of the handle decides
/// whether to close it.
fn watch_status(status: ConnectionStatus, notifier: Weak<Notifier>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_POLL_INTERVAL);
        loop {
            interval.tick().await;
            let Some(notifier) = notifier.upgrade() else {
                break;
            };
            if status.blocked() {
                notifier.notify(ConnectionEvent::Blocked(
                    "broker blocked the connection".to_string(),
                ));
            }
            if status.closed() || status.errored() {
                notifier.notify(ConnectionEvent::Closed);
                break;
            }
        }
    });
}

#[async_trait]
impl TransportConnection for AmqpConnection {
    fn register_listener(&self, kind: ConnectionEventKind, listener: ConnectionListener) {
        self.notifier.register(kind, listener);
    }

    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, TransportError> {
        let channel = self.connection.create_channel().await?;

        // Publisher confirms let unroutable mandatory messages be reported
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self.connection.close(REPLY_SUCCESS, "closing").await;
        self.notifier.notify(ConnectionEvent::Closed);
        result.map_err(TransportError::from)
    }
}

/// A `lapin` channel.
pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl TransportChannel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), TransportError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        let mut properties = BasicProperties::default().with_content_type(CONTENT_TYPE.into());
        if options.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    ..Default::default()
                },
                payload,
                properties,
            )
            .await?;

        match confirm.await? {
            Confirmation::Nack(_) => Err(TransportError::new(format!(
                "broker rejected message for routing key '{}'",
                routing_key
            ))),
            Confirmation::Ack(Some(returned)) => {
                warn!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    reply_code = returned.reply_code,
                    reply_text = %returned.reply_text.as_str(),
                    "Message returned by broker, no queue bound for routing key"
                );
                Ok(())
            }
            Confirmation::Ack(None) | Confirmation::NotRequested => {
                debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
                Ok(())
            }
        }
    }

    async fn consume(
        &self,
        queue: &str,
        on_message: DeliveryCallback,
    ) -> Result<(), TransportError> {
        let consumer_tag = format!("{}-{}", queue, uuid::Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        on_message(Delivery {
                            delivery_tag: delivery.delivery_tag,
                            routing_key: delivery.routing_key.as_str().to_string(),
                            data: delivery.data,
                        })
                        .await;
                    }
                    Err(e) => {
                        error!(error = %e, queue = %queue, "Consumer delivery error");
                        break;
                    }
                }
            }
            info!(queue = %queue, consumer_tag = %consumer_tag, "Consumer stream ended");
        });

        Ok(())
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }
}
