use super::*;
use crate::config::ConnectionConfig;
use crate::connection::RetryPolicy;
use crate::transport::mock::{MockOperation, MockTransport, RecordedOperation};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;

const QUEUE: &str = "my_queue";

fn make_bus(transport: &MockTransport) -> EventBus {
    make_bus_with_policy(transport, RetryPolicy::default())
}

fn make_bus_with_policy(transport: &MockTransport, policy: RetryPolicy) -> EventBus {
    let connection = ManagedConnection::new(
        Arc::new(transport.clone()),
        ConnectionConfig::default(),
        policy,
    );
    EventBus::new(connection, QUEUE)
}

/// Handler that records every payload it receives.
fn recording_handler(sink: Arc<Mutex<Vec<Value>>>) -> impl EventHandler {
    move |payload: Value| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(payload);
            Ok::<(), HandlerError>(())
        }
    }
}

fn exchange_declared() -> RecordedOperation {
    RecordedOperation::DeclareExchange {
        name: EXCHANGE_NAME.to_string(),
        kind: ExchangeKind::Direct,
    }
}

// ============================================================================
// publish
// ============================================================================

#[tokio::test]
async fn test_publish_connects_if_not_connected() {
    let transport = MockTransport::new();
    let bus = make_bus(&transport);
    assert!(!bus.is_connected());

    bus.publish(&IntegrationEvent::new("foo", json!("data")))
        .await
        .unwrap();

    assert!(bus.is_connected());
    assert_eq!(transport.connect_attempts(), 1);
}

#[tokio::test]
async fn test_publish_sends_json_payload() {
    let transport = MockTransport::new();
    let bus = make_bus(&transport);

    bus.publish(&IntegrationEvent::new("bar", json!({"foo": "bar"})))
        .await
        .unwrap();

    assert_eq!(
        transport.operations(),
        vec![
            exchange_declared(),
            RecordedOperation::Send {
                exchange: "event_bus".to_string(),
                routing_key: "bar".to_string(),
                payload: br#"{"foo":"bar"}"#.to_vec(),
                options: PublishOptions {
                    persistent: true,
                    mandatory: true,
                },
            },
        ]
    );
}

#[tokio::test]
async fn test_publish_typed_data() {
    #[derive(Serialize)]
    struct OrderPlaced {
        order_id: u32,
        total: f64,
    }

    let transport = MockTransport::new();
    let bus = make_bus(&transport);

    let event = IntegrationEvent::new(
        "order.placed",
        OrderPlaced {
            order_id: 7,
            total: 12.5,
        },
    );
    bus.publish(&event).await.unwrap();

    let sent = transport
        .operations()
        .into_iter()
        .find_map(|op| match op {
            RecordedOperation::Send { payload, .. } => Some(payload),
            _ => None,
        })
        .unwrap();
    let decoded: Value = serde_json::from_slice(&sent).unwrap();
    assert_eq!(decoded, json!({"order_id": 7, "total": 12.5}));
}

#[tokio::test]
async fn test_publish_opens_fresh_channel_per_call() {
    let transport = MockTransport::new();
    let bus = make_bus(&transport);

    bus.publish(&IntegrationEvent::new("a", json!(1))).await.unwrap();
    bus.publish(&IntegrationEvent::new("b", json!(2))).await.unwrap();

    assert_eq!(transport.channels_opened(), 2);
    assert_eq!(transport.connect_attempts(), 1);
}

#[tokio::test]
async fn test_publish_reconnects_after_disconnect() {
    let transport = MockTransport::new();
    let bus = make_bus(&transport);
    bus.publish(&IntegrationEvent::new("a", json!(1))).await.unwrap();

    transport
        .last_connection()
        .unwrap()
        .fire(crate::transport::ConnectionEvent::Closed);
    assert!(!bus.is_connected());

    bus.publish(&IntegrationEvent::new("a", json!(2))).await.unwrap();

    assert!(bus.is_connected());
    assert_eq!(transport.connect_attempts(), 2);
}

#[tokio::test]
async fn test_publish_connection_failure_propagates() {
    let transport = MockTransport::new();
    transport.set_fail_on_connect(true);
    let bus = make_bus_with_policy(&transport, RetryPolicy::Disabled);

    let result = bus.publish(&IntegrationEvent::new("a", json!(1))).await;

    assert!(matches!(result, Err(BusError::Connection(_))));
    assert!(transport.operations().is_empty());
}

#[tokio::test]
async fn test_publish_fails_if_channel_fails() {
    let transport = MockTransport::new();
    let fault = TransportError::new("channel refused");
    transport.fail_operation(MockOperation::OpenChannel, fault.clone());
    let bus = make_bus(&transport);

    let result = bus.publish(&IntegrationEvent::new("a", json!(1))).await;

    let err = result.unwrap_err();
    assert!(matches!(err, BusError::Channel(_)));
    assert_eq!(err.transport_error(), Some(&fault));
}

#[tokio::test]
async fn test_publish_fails_if_exchange_declare_fails() {
    let transport = MockTransport::new();
    let fault = TransportError::new("access refused");
    transport.fail_operation(MockOperation::DeclareExchange, fault.clone());
    let bus = make_bus(&transport);

    let result = bus.publish(&IntegrationEvent::new("bar", json!("baz"))).await;

    let err = result.unwrap_err();
    assert!(matches!(
        err,
        BusError::Protocol {
            operation: ProtocolOperation::DeclareExchange,
            ..
        }
    ));
    assert_eq!(err.transport_error(), Some(&fault));
    assert!(transport.operations().is_empty());
}

#[tokio::test]
async fn test_publish_fails_if_send_fails() {
    let transport = MockTransport::new();
    let fault = TransportError::new("channel closed");
    transport.fail_operation(MockOperation::Send, fault.clone());
    let bus = make_bus(&transport);

    let result = bus.publish(&IntegrationEvent::new("bar", json!("baz"))).await;

    let err = result.unwrap_err();
    assert!(matches!(
        err,
        BusError::Protocol {
            operation: ProtocolOperation::Publish,
            ..
        }
    ));
    assert_eq!(err.transport_error(), Some(&fault));
    // No retry at this layer
    assert_eq!(transport.channels_opened(), 1);
    assert_eq!(transport.operations(), vec![exchange_declared()]);
}

#[tokio::test]
async fn test_publish_serialization_failure() {
    let transport = MockTransport::new();
    let bus = make_bus(&transport);
    let mut data = HashMap::new();
    data.insert((1u8, 2u8), "tuple keys are not JSON object keys");

    let result = bus.publish(&IntegrationEvent::new("bar", data)).await;

    assert!(matches!(result, Err(BusError::Serialization(_))));
    assert_eq!(transport.operations(), vec![exchange_declared()]);
}

#[test]
fn test_integration_event_uses_type_field() {
    let event = IntegrationEvent::new("user.created", json!({"id": 1}));

    let encoded = serde_json::to_value(&event).unwrap();

    assert_eq!(encoded, json!({"type": "user.created", "data": {"id": 1}}));
}

// ============================================================================
// subscribe
// ============================================================================

#[tokio::test]
async fn test_subscribe_connects_if_not_connected() {
    let transport = MockTransport::new();
    let bus = make_bus(&transport);

    bus.subscribe("foo", recording_handler(Arc::default()))
        .await
        .unwrap();

    assert!(bus.is_connected());
    assert_eq!(transport.connect_attempts(), 1);
}

#[tokio::test]
async fn test_subscribe_declares_binds_and_consumes() {
    let transport = MockTransport::new();
    let bus = make_bus(&transport);

    bus.subscribe("foo", recording_handler(Arc::default()))
        .await
        .unwrap();

    assert_eq!(
        transport.operations(),
        vec![
            exchange_declared(),
            RecordedOperation::DeclareQueue {
                name: QUEUE.to_string(),
            },
            RecordedOperation::BindQueue {
                queue: QUEUE.to_string(),
                exchange: EXCHANGE_NAME.to_string(),
                routing_key: "foo".to_string(),
            },
            RecordedOperation::Consume {
                queue: QUEUE.to_string(),
            },
        ]
    );
    assert_eq!(transport.consumer_count(QUEUE), 1);
}

#[tokio::test]
async fn test_subscribe_delivers_payload_and_acks() {
    let transport = MockTransport::new();
    let bus = make_bus(&transport);
    let received = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("foo", recording_handler(received.clone()))
        .await
        .unwrap();

    let tag = transport
        .deliver(QUEUE, "foo", br#"{"bar":"baz"}"#)
        .await
        .unwrap();

    assert_eq!(*received.lock().unwrap(), vec![json!({"bar": "baz"})]);
    assert_eq!(transport.acknowledged(), vec![tag]);
}

#[tokio::test]
async fn test_subscribe_acks_when_handler_fails() {
    let transport = MockTransport::new();
    let bus = make_bus(&transport);
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    bus.subscribe("foo", move |_payload: Value| {
        let counter = counter.clone();
        async move {
            *counter.lock().unwrap() += 1;
            Err::<(), HandlerError>("projection store unavailable".into())
        }
    })
    .await
    .unwrap();

    let tag = transport
        .deliver(QUEUE, "foo", br#"{"bar":"baz"}"#)
        .await
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(transport.acknowledged(), vec![tag]);
}

#[tokio::test]
async fn test_subscribe_acks_when_handler_panics() {
    let transport = MockTransport::new();
    let bus = make_bus(&transport);
    bus.subscribe("foo", |_payload: Value| async move {
        if true {
            panic!("handler bug");
        }
        Ok::<(), HandlerError>(())
    })
    .await
    .unwrap();

    let tag = transport.deliver(QUEUE, "foo", b"{}").await.unwrap();

    assert_eq!(transport.acknowledged(), vec![tag]);
}

#[tokio::test]
async fn test_subscribe_acks_malformed_payload_without_calling_handler() {
    let transport = MockTransport::new();
    let bus = make_bus(&transport);
    let received = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("foo", recording_handler(received.clone()))
        .await
        .unwrap();

    let tag = transport.deliver(QUEUE, "foo", b"not json").await.unwrap();

    assert!(received.lock().unwrap().is_empty());
    assert_eq!(transport.acknowledged(), vec![tag]);
}

#[tokio::test]
async fn test_subscribe_keeps_consuming_after_failure() {
    let transport = MockTransport::new();
    let bus = make_bus(&transport);
    let received = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("foo", recording_handler(received.clone()))
        .await
        .unwrap();

    let first = transport.deliver(QUEUE, "foo", b"{broken").await.unwrap();
    let second = transport.deliver(QUEUE, "foo", b"42").await.unwrap();

    assert_eq!(*received.lock().unwrap(), vec![json!(42)]);
    assert_eq!(transport.acknowledged(), vec![first, second]);
}

#[tokio::test]
async fn test_subscribe_survives_ack_failure() {
    let transport = MockTransport::new();
    let bus = make_bus(&transport);
    let received = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("foo", recording_handler(received.clone()))
        .await
        .unwrap();
    transport.fail_operation(
        MockOperation::Acknowledge,
        TransportError::new("unknown delivery tag"),
    );

    transport.deliver(QUEUE, "foo", b"1").await.unwrap();
    transport.clear_failures();
    let tag = transport.deliver(QUEUE, "foo", b"2").await.unwrap();

    assert_eq!(*received.lock().unwrap(), vec![json!(1), json!(2)]);
    assert_eq!(transport.acknowledged(), vec![tag]);
}

#[tokio::test]
async fn test_subscribe_typed_decodes_payload() {
    #[derive(Deserialize)]
    struct Greeting {
        name: String,
    }

    let transport = MockTransport::new();
    let bus = make_bus(&transport);
    let names = Arc::new(Mutex::new(Vec::new()));
    let sink = names.clone();
    bus.subscribe_typed("hello", move |greeting: Greeting| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(greeting.name);
            Ok::<(), HandlerError>(())
        }
    })
    .await
    .unwrap();

    let first = transport
        .deliver(QUEUE, "hello", br#"{"name":"ada"}"#)
        .await
        .unwrap();
    let second = transport
        .deliver(QUEUE, "hello", br#"{"nom":"grace"}"#)
        .await
        .unwrap();

    assert_eq!(*names.lock().unwrap(), vec!["ada".to_string()]);
    assert_eq!(transport.acknowledged(), vec![first, second]);
}

#[tokio::test]
async fn test_subscribe_connection_failure_propagates() {
    let transport = MockTransport::new();
    transport.set_fail_on_connect(true);
    let bus = make_bus_with_policy(&transport, RetryPolicy::Bounded(1));

    let result = bus.subscribe("foo", recording_handler(Arc::default())).await;

    assert!(matches!(result, Err(BusError::Connection(_))));
    assert_eq!(transport.connect_attempts(), 2);
}

#[tokio::test]
async fn test_subscribe_protocol_failures_propagate() {
    let cases = [
        (MockOperation::DeclareExchange, ProtocolOperation::DeclareExchange),
        (MockOperation::DeclareQueue, ProtocolOperation::DeclareQueue),
        (MockOperation::BindQueue, ProtocolOperation::BindQueue),
        (MockOperation::Consume, ProtocolOperation::Consume),
    ];

    for (failing, expected) in cases {
        let transport = MockTransport::new();
        let fault = TransportError::new(format!("{:?} refused", failing));
        transport.fail_operation(failing, fault.clone());
        let bus = make_bus(&transport);

        let result = bus.subscribe("foo", recording_handler(Arc::default())).await;

        match result {
            Err(BusError::Protocol { operation, source }) => {
                assert_eq!(operation, expected);
                assert_eq!(source, fault);
            }
            other => panic!("expected protocol error for {:?}, got {:?}", failing, other),
        }
        assert_eq!(transport.consumer_count(QUEUE), 0);
        assert!(transport.acknowledged().is_empty());
    }
}

#[test]
fn test_protocol_error_display() {
    let err = BusError::Protocol {
        operation: ProtocolOperation::BindQueue,
        source: TransportError::new("NOT_FOUND - no exchange"),
    };
    assert_eq!(err.to_string(), "Failed to bind queue: NOT_FOUND - no exchange");
}

#[test]
fn test_not_connected_has_no_transport_error() {
    assert!(BusError::NotConnected.transport_error().is_none());
}

// ============================================================================
// factory
// ============================================================================

#[tokio::test]
async fn test_init_event_bus_with_default_retry() {
    let transport = MockTransport::new();
    transport.set_fail_on_connect(true);
    let config = crate::config::BusConfig::new(ConnectionConfig::default(), "orders");

    let bus = init_event_bus_with_transport(Arc::new(transport.clone()), &config);
    let result = bus.publish(&IntegrationEvent::new("a", json!(1))).await;

    assert_eq!(bus.queue(), "orders");
    assert!(result.is_err());
    assert_eq!(transport.connect_attempts(), 4);
}

#[tokio::test]
async fn test_init_event_bus_without_retry() {
    let transport = MockTransport::new();
    transport.set_fail_on_connect(true);
    let config =
        crate::config::BusConfig::new(ConnectionConfig::default(), "orders").without_retry();

    let bus = init_event_bus_with_transport(Arc::new(transport.clone()), &config);
    let result = bus.subscribe("a", recording_handler(Arc::default())).await;

    assert!(result.is_err());
    assert_eq!(transport.connect_attempts(), 1);
    assert_eq!(bus.connection().retry_policy(), RetryPolicy::Disabled);
}
