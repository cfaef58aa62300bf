//! Integration Tests with Real MQTT Broker
//!
//! These tests validate:
//! - Connection to a real broker and clean disconnect
//! - Ordered delivery on a subscription channel
//! - Unsubscribe isolation between topics on one connection
//! - The role-level messaging surface
//!
//! They need a broker at localhost:1883 and are ignored by default.


use bytes::Bytes;
use cb_sdk::prelude::*;
use cb_sdk::transport::mqtt::{MqttError, DISCONNECT_QUIESCE};
use mqtt_integration_helpers::{connect, sdk_config, unique_topic};
use std::time::Duration;
use tokio::time::timeout;

const RECEIVE_WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
#[ignore = "requires MQTT broker at localhost:1883"]
async fn test_connect_and_disconnect() {
    // Arrange & Act
    let connection = connect().await;

    // Assert
    assert!(connection.is_connected());
    assert_eq!(connection.client_id().len(), 20);

    connection.disconnect(DISCONNECT_QUIESCE).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Closed);

    // Operations after close fail instead of hanging
    let err = connection
        .publish("a/b", Bytes::from_static(b"x"), QoS::AtMostOnce, false)
        .await
        .unwrap_err();
    assert!(matches!(err, MqttError::NotConnected { .. }));
}

#[tokio::test]
#[ignore = "requires MQTT broker at localhost:1883"]
async fn test_three_messages_arrive_in_order() {
    // Arrange
    let connection = connect().await;
    let topic = unique_topic("ordering");
    let mut records = connection
        .subscribe(&topic, QoS::AtLeastOnce)
        .await
        .unwrap();

    // Act
    for payload in ["one", "two", "three"] {
        connection
            .publish(&topic, Bytes::from(payload), QoS::AtLeastOnce, false)
            .await
            .unwrap();
    }

    // Assert
    let mut received = Vec::new();
    for _ in 0..3 {
        let record = timeout(RECEIVE_WAIT, records.recv())
            .await
            .expect("message should arrive")
            .expect("channel should stay open");
        assert_eq!(record.topic.whole, topic);
        received.push(String::from_utf8(record.payload.to_vec()).unwrap());
    }
    assert_eq!(received, vec!["one", "two", "three"]);

    connection.disconnect(DISCONNECT_QUIESCE).await.unwrap();
}

#[tokio::test]
#[ignore = "requires MQTT broker at localhost:1883"]
async fn test_unsubscribe_closes_only_that_channel() {
    // Arrange
    let connection = connect().await;
    let dropped = unique_topic("dropped");
    let kept = unique_topic("kept");
    let mut dropped_rx = connection.subscribe(&dropped, QoS::AtLeastOnce).await.unwrap();
    let mut kept_rx = connection.subscribe(&kept, QoS::AtLeastOnce).await.unwrap();

    // Act
    connection.unsubscribe(&dropped).await.unwrap();
    connection
        .publish(&dropped, Bytes::from_static(b"late"), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    connection
        .publish(&kept, Bytes::from_static(b"still here"), QoS::AtLeastOnce, false)
        .await
        .unwrap();

    // Assert: the unsubscribed channel is closed, not stalled
    let closed = timeout(RECEIVE_WAIT, dropped_rx.recv()).await.unwrap();
    assert!(closed.is_none());

    let record = timeout(RECEIVE_WAIT, kept_rx.recv()).await.unwrap().unwrap();
    assert_eq!(&record.payload[..], b"still here");
    assert_eq!(connection.subscription_count().await, 1);

    connection.disconnect(DISCONNECT_QUIESCE).await.unwrap();
}

#[tokio::test]
#[ignore = "requires MQTT broker at localhost:1883"]
async fn test_wildcard_subscription_receives_matching_topics() {
    let connection = connect().await;
    let base = unique_topic("wildcard");
    let mut records = connection
        .subscribe(&format!("{base}/+/temp"), QoS::AtMostOnce)
        .await
        .unwrap();

    connection
        .publish(&format!("{base}/a/humidity"), Bytes::from_static(b"50"), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    connection
        .publish(&format!("{base}/a/temp"), Bytes::from_static(b"21"), QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let record = timeout(RECEIVE_WAIT, records.recv()).await.unwrap().unwrap();
    assert_eq!(record.topic.whole, format!("{base}/a/temp"));

    connection.disconnect(DISCONNECT_QUIESCE).await.unwrap();
}

#[tokio::test]
#[ignore = "requires MQTT broker at localhost:1883"]
async fn test_role_messaging_lifecycle() {
    // Arrange
    let user = UserClient::with_token(sdk_config(), "sys", "sec", "user@example.com", "utok")
        .unwrap();
    let topic = unique_topic("role");

    // Act
    user.initialize_mqtt(MqttInit::new().without_auto_reconnect())
        .await
        .unwrap();
    let mut records = user.subscribe(&topic, QoS::ExactlyOnce).await.unwrap();
    user.publish(&topic, Bytes::from_static(b"hello"), QoS::ExactlyOnce)
        .await
        .unwrap();

    // Assert
    let record = timeout(RECEIVE_WAIT, records.recv()).await.unwrap().unwrap();
    assert_eq!(&record.payload[..], b"hello");
    assert_eq!(user.mqtt_state().await, ConnectionState::Connected);

    user.disconnect().await.unwrap();
    assert_eq!(user.mqtt_state().await, ConnectionState::Unconnected);
    // Channels close with the connection
    let closed = timeout(RECEIVE_WAIT, records.recv()).await.unwrap();
    assert!(closed.is_none());

    let err = user
        .publish(&topic, Bytes::from_static(b"x"), QoS::AtMostOnce)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
#[ignore = "requires MQTT broker at localhost:1883"]
async fn test_connect_callback_fires() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let connects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connects);
    let user = UserClient::with_token(sdk_config(), "sys", "sec", "user@example.com", "utok")
        .unwrap();

    user.initialize_mqtt(MqttInit::new().callbacks(ConnectionCallbacks::default().on_connect(
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    )))
    .await
    .unwrap();

    assert_eq!(connects.load(Ordering::SeqCst), 1);
    user.disconnect().await.unwrap();
}
