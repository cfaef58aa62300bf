//! Impure I/O operations for the MQTT connection manager
//!
//! This module owns the broker-library client and its event loop task, and
//! coordinates publish/subscribe callers with the acknowledgments and
//! messages the event loop routes back.

use super::connection::{
    configure_mqtt_options, configure_network_options, ConnectOptions, ConnectionCallbacks, ConnectionState, MqttError,
};
use super::message_handler::{AckKind, AckStatus, AckTracker, EventRoute, MessageHandler};
use super::subscriptions::{
    validate_filter, validate_topic_name, PublishRecord, SubscriptionRegistry,
};
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectionError, EventLoop, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Wait for SUBACK before handing the channel back anyway
pub const SUBSCRIBE_ACK_WAIT: Duration = Duration::from_secs(1);
/// Wait for UNSUBACK
pub const UNSUBSCRIBE_ACK_WAIT: Duration = Duration::from_secs(1);
/// Grace period for in-flight work on disconnect
pub const DISCONNECT_QUIESCE: Duration = Duration::from_millis(250);

const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Shared state handed to the event loop task
struct EventLoopContext {
    client: Arc<Mutex<AsyncClient>>,
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: Arc<SubscriptionRegistry>,
    acks: Arc<Mutex<AckTracker>>,
    callbacks: ConnectionCallbacks,
    auto_reconnect: bool,
    broker: String,
}

/// One live broker connection shared by every subscription opened through it
pub struct MqttConnection {
    // The mutex doubles as the request gate that keeps ack pairing in order
    client: Arc<Mutex<AsyncClient>>,
    // Ungated handle so closing never waits behind a stalled request
    control: AsyncClient,
    broker_addr: String,
    client_id: String,
    state_rx: watch::Receiver<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Arc<SubscriptionRegistry>,
    acks: Arc<Mutex<AckTracker>>,
    ack_timeout: Duration,
}

impl MqttConnection {
    /// Open a connection and wait for CONNACK, bounded by `connect_timeout`
    pub async fn connect(options: ConnectOptions) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(&options)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        event_loop.set_network_options(configure_network_options(&options));

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            Self::setup_connection_channels();
        let control = client.clone();
        let client = Arc::new(Mutex::new(client));
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let acks = Arc::new(Mutex::new(AckTracker::new()));

        info!(
            broker = %options.broker_url(),
            auto_reconnect = options.auto_reconnect,
            tls = options.tls.is_some(),
            "Connecting to MQTT broker"
        );
        let _ = state_tx.send(ConnectionState::Connecting);

        let context = EventLoopContext {
            client: client.clone(),
            state_tx: state_tx.clone(),
            subscriptions: subscriptions.clone(),
            acks: acks.clone(),
            callbacks: options.callbacks.clone(),
            auto_reconnect: options.auto_reconnect,
            broker: options.broker_addr.clone(),
        };
        let handle = tokio::spawn(Self::run_event_loop(event_loop, context, shutdown_rx));

        let connection = MqttConnection {
            client,
            control,
            broker_addr: options.broker_addr.clone(),
            client_id: options.client_id.clone(),
            state_rx: state_rx.clone(),
            state_tx,
            shutdown_tx,
            event_loop_handle: Mutex::new(Some(handle)),
            subscriptions,
            acks,
            ack_timeout: options.ack_timeout,
        };

        if let Err(e) =
            Self::wait_for_connection_confirmation(state_rx, options.connect_timeout).await
        {
            if !connection.state().is_terminal() {
                let _ = connection
                    .state_tx
                    .send(ConnectionState::Disconnected(e.to_string()));
            }
            // Dropping the connection stops the event loop
            return Err(e);
        }

        Ok(connection)
    }

    /// Create connection state and shutdown channels
    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Unconnected);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::Closed => return Err(MqttError::ConnectionClosed),
                    ConnectionState::Unconnected
                    | ConnectionState::Connecting
                    | ConnectionState::Reconnecting(_) => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::timeout("connection acknowledgment", timeout)),
        }
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        context: EventLoopContext,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!(broker = %context.broker, "Starting MQTT event loop");
        let mut reconnect_attempts = 0u32;
        let mut has_connected = false;

        loop {
            tokio::select! {
                // Check for shutdown signal first (higher priority)
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping MQTT event loop");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            if !Self::process_event_route(
                                route,
                                &context,
                                &mut reconnect_attempts,
                                &mut has_connected,
                            )
                            .await
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            if !Self::handle_event_loop_error(
                                e,
                                &context,
                                has_connected,
                                &mut reconnect_attempts,
                                shutdown_rx.clone(),
                            )
                            .await
                            {
                                break;
                            }
                        }
                    }
                }
            }
        }

        debug!(broker = %context.broker, "MQTT event loop stopped");
    }

    /// Process routed MQTT event. Returns true to continue the loop.
    async fn process_event_route(
        route: EventRoute,
        context: &EventLoopContext,
        reconnect_attempts: &mut u32,
        has_connected: &mut bool,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let _ = context.state_tx.send(ConnectionState::Connected);
                if *has_connected {
                    info!(broker = %context.broker, "Reconnected to MQTT broker");
                    let filters = context.subscriptions.filters().await;
                    if !filters.is_empty() {
                        tokio::spawn(Self::resubscribe_to_topics(
                            context.client.clone(),
                            context.acks.clone(),
                            filters,
                        ));
                    }
                } else {
                    info!(broker = %context.broker, "Connected to MQTT broker");
                }
                *has_connected = true;
                *reconnect_attempts = 0;
                context.callbacks.fire_connect();
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                qos,
                retain,
            } => {
                tracing::debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", topic);
                let record = PublishRecord::new(&topic, payload, qos, retain);
                context.subscriptions.dispatch(&record).await;
                true
            }
            EventRoute::RequestSent { kind, packet_id } => {
                context.acks.lock().await.on_request_sent(kind, packet_id);
                true
            }
            EventRoute::Acknowledged {
                kind,
                packet_id,
                status,
            } => {
                context
                    .acks
                    .lock()
                    .await
                    .on_acknowledged(kind, packet_id, status);
                true
            }
            EventRoute::PublishReceived { packet_id } => {
                context.acks.lock().await.on_publish_received(packet_id);
                true
            }
            EventRoute::Disconnected => {
                warn!(broker = %context.broker, "Broker sent DISCONNECT");
                true
            }
            EventRoute::DisconnectSent => {
                // Our own DISCONNECT: nothing left to do once closing
                let closing = matches!(*context.state_tx.borrow(), ConnectionState::Closed);
                !closing
            }
            EventRoute::InfrastructureEvent(event_str) => {
                tracing::debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Handle event loop error. Returns true to keep polling (which makes the
    /// broker library reconnect).
    async fn handle_event_loop_error(
        error: ConnectionError,
        context: &EventLoopContext,
        has_connected: bool,
        reconnect_attempts: &mut u32,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        let reason = error.to_string();

        if matches!(*context.state_tx.borrow(), ConnectionState::Closed) || *shutdown_rx.borrow()
        {
            debug!(error = %reason, "MQTT event loop error during shutdown");
            return false;
        }

        if !has_connected {
            error!(broker = %context.broker, error = %reason, "MQTT connection attempt failed");
            let _ = context
                .state_tx
                .send(ConnectionState::Disconnected(reason));
            return false;
        }

        let was_connected = context.state_tx.borrow().is_connected();
        if was_connected {
            error!(broker = %context.broker, error = %reason, "MQTT connection lost");
            context.acks.lock().await.fail_pending(&reason);
            context.callbacks.fire_connection_lost(&reason);
        }

        if !context.auto_reconnect {
            context.subscriptions.close_all().await;
            context.acks.lock().await.close(&reason);
            let _ = context
                .state_tx
                .send(ConnectionState::Disconnected(reason));
            return false;
        }

        *reconnect_attempts += 1;
        let _ = context
            .state_tx
            .send(ConnectionState::Reconnecting(*reconnect_attempts));
        warn!(
            broker = %context.broker,
            attempt = *reconnect_attempts,
            "Attempting reconnection after {}ms delay",
            RECONNECT_PAUSE.as_millis()
        );

        Self::interruptible_sleep(shutdown_rx, RECONNECT_PAUSE).await
    }

    /// Perform interruptible sleep with shutdown monitoring.
    /// Returns true if sleep completed, false if shutdown requested.
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(delay) => {
                true
            }
        }
    }

    /// Helper to resubscribe to topics after reconnection
    async fn resubscribe_to_topics(
        client: Arc<Mutex<AsyncClient>>,
        acks: Arc<Mutex<AckTracker>>,
        filters: Vec<(String, QoS)>,
    ) {
        let client_guard = client.lock().await;
        for (filter, qos) in filters {
            acks.lock()
                .await
                .enqueue_untracked(AckKind::Subscribe, qos);
            if let Err(e) = client_guard.subscribe(&filter, qos).await {
                acks.lock().await.discard_newest();
                error!("Failed to re-subscribe to {}: {}", filter, e);
            } else {
                tracing::debug!(target: "mqtt_transport", "Re-subscribed to: {}", filter);
            }
        }
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), MqttError> {
        let current_state = self.state();
        if !current_state.is_connected() {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    async fn wait_for_ack(
        ack: oneshot::Receiver<AckStatus>,
        wait: Duration,
        operation: &'static str,
    ) -> Result<AckStatus, MqttError> {
        match tokio::time::timeout(wait, ack).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(MqttError::ConnectionClosed),
            Err(_) => Err(MqttError::timeout(operation, wait)),
        }
    }

    /// Publish and wait for the QoS-dependent acknowledgment
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.check_connection_state()?;
        validate_topic_name(topic)?;
        let payload = payload.into();
        let size = payload.len();

        let ack = {
            let client = self.client.lock().await;
            let ack = self.acks.lock().await.enqueue(AckKind::Publish, qos);
            if let Err(e) = client.publish_bytes(topic, qos, retain, payload).await {
                self.acks.lock().await.discard_newest();
                return Err(MqttError::PublishFailed(Box::new(e)));
            }
            ack
        };

        match Self::wait_for_ack(ack, self.ack_timeout, "publish acknowledgment").await? {
            AckStatus::Acknowledged => {
                debug!(topic = %topic, ?qos, retain, size, "Published message");
                Ok(())
            }
            AckStatus::Rejected => Err(MqttError::PublishFailed(
                format!("broker rejected publish to {topic}").into(),
            )),
            AckStatus::ConnectionLost(reason) => Err(MqttError::ConnectionLost(reason)),
        }
    }

    /// Subscribe to a filter and return its delivery channel.
    ///
    /// The channel is registered before SUBSCRIBE goes out so nothing the
    /// broker sends right after SUBACK is lost. A missing SUBACK after
    /// [`SUBSCRIBE_ACK_WAIT`] is logged and the channel is still returned.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
    ) -> Result<mpsc::Receiver<PublishRecord>, MqttError> {
        self.check_connection_state()?;
        validate_filter(filter)?;

        let receiver = self.subscriptions.register(filter, qos).await;

        let ack = {
            let client = self.client.lock().await;
            let ack = self.acks.lock().await.enqueue(AckKind::Subscribe, qos);
            if let Err(e) = client.subscribe(filter, qos).await {
                self.acks.lock().await.discard_newest();
                self.subscriptions.remove(filter).await;
                return Err(MqttError::SubscriptionFailed(Box::new(e)));
            }
            ack
        };

        match Self::wait_for_ack(ack, SUBSCRIBE_ACK_WAIT, "subscribe acknowledgment").await {
            Ok(AckStatus::Acknowledged) => {
                info!(filter = %filter, ?qos, "Subscribed");
                Ok(receiver)
            }
            Ok(AckStatus::Rejected) => {
                self.subscriptions.remove(filter).await;
                Err(MqttError::SubscriptionFailed(
                    format!("broker rejected subscription to {filter}").into(),
                ))
            }
            Ok(AckStatus::ConnectionLost(reason)) => {
                self.subscriptions.remove(filter).await;
                Err(MqttError::ConnectionLost(reason))
            }
            Err(MqttError::Timeout { .. }) => {
                warn!(
                    filter = %filter,
                    "No SUBACK within {}ms, keeping subscription",
                    SUBSCRIBE_ACK_WAIT.as_millis()
                );
                Ok(receiver)
            }
            Err(e) => {
                self.subscriptions.remove(filter).await;
                Err(e)
            }
        }
    }

    /// Close the filter's channel, then ask the broker to stop delivery
    pub async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        if !self.subscriptions.remove(filter).await {
            debug!(filter = %filter, "Unsubscribing from a filter with no local channel");
        }
        self.check_connection_state()?;

        let ack = {
            let client = self.client.lock().await;
            let ack = self
                .acks
                .lock()
                .await
                .enqueue(AckKind::Unsubscribe, QoS::AtMostOnce);
            if let Err(e) = client.unsubscribe(filter).await {
                self.acks.lock().await.discard_newest();
                return Err(MqttError::SubscriptionFailed(Box::new(e)));
            }
            ack
        };

        match Self::wait_for_ack(ack, UNSUBSCRIBE_ACK_WAIT, "unsubscribe acknowledgment").await {
            Ok(AckStatus::ConnectionLost(reason)) => Err(MqttError::ConnectionLost(reason)),
            Ok(_) => {
                info!(filter = %filter, "Unsubscribed");
                Ok(())
            }
            Err(MqttError::Timeout { .. }) => {
                warn!(filter = %filter, "No UNSUBACK received, channel already closed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Graceful close: send DISCONNECT, give in-flight work `quiesce` to
    /// finish, then stop the event loop and close every channel
    pub async fn disconnect(&self, quiesce: Duration) -> Result<(), MqttError> {
        if matches!(self.state(), ConnectionState::Closed) {
            return Ok(());
        }
        let _ = self.state_tx.send(ConnectionState::Closed);

        if let Err(e) = self.control.try_disconnect() {
            debug!("DISCONNECT not sent: {}", e);
        }

        if let Some(mut handle) = self.event_loop_handle.lock().await.take() {
            match tokio::time::timeout(quiesce, &mut handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    debug!("Event loop still busy after quiesce period, aborting");
                    let _ = self.shutdown_tx.send(true);
                    handle.abort();
                }
            }
        }

        self.subscriptions.close_all().await;
        self.acks.lock().await.close("connection closed");
        info!(broker = %self.broker_addr, "MQTT connection closed");
        Ok(())
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch state transitions
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn broker_addr(&self) -> &str {
        &self.broker_addr
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.len().await
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        // Signal shutdown to the event loop if it's still running
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.event_loop_handle.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for MqttConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConnection")
            .field("broker_addr", &self.broker_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
