//! Pure message routing and acknowledgment tracking for MQTT events
//!
//! `MessageHandler` maps raw broker-library events onto [`EventRoute`]s, and
//! [`AckTracker`] pairs outgoing requests with the acknowledgments the
//! broker sends back.

use bytes::Bytes;
use rumqttc::{Event, Outgoing, Packet, QoS, SubscribeReasonCode};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Kind of request that expects an acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Outcome delivered to the caller waiting on a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckStatus {
    Acknowledged,
    /// Broker refused the request (SUBACK failure code)
    Rejected,
    /// The connection dropped before the acknowledgment arrived
    ConnectionLost(String),
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// Request handed to the network, packet id assigned
    RequestSent { kind: AckKind, packet_id: u16 },
    /// Broker acknowledged a request
    Acknowledged {
        kind: AckKind,
        packet_id: u16,
        status: AckStatus,
    },
    /// PUBREC for a QoS 2 publish; the release step is still pending
    PublishReceived { packet_id: u16 },
    /// Broker sent DISCONNECT
    Disconnected,
    /// Our DISCONNECT went out
    DisconnectSent,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                    retain: publish.retain,
                },
                Packet::PubAck(ack) => EventRoute::Acknowledged {
                    kind: AckKind::Publish,
                    packet_id: ack.pkid,
                    status: AckStatus::Acknowledged,
                },
                Packet::PubComp(comp) => EventRoute::Acknowledged {
                    kind: AckKind::Publish,
                    packet_id: comp.pkid,
                    status: AckStatus::Acknowledged,
                },
                Packet::PubRec(rec) => EventRoute::PublishReceived {
                    packet_id: rec.pkid,
                },
                Packet::SubAck(suback) => EventRoute::Acknowledged {
                    kind: AckKind::Subscribe,
                    packet_id: suback.pkid,
                    status: Self::subscription_status(&suback.return_codes),
                },
                Packet::UnsubAck(unsuback) => EventRoute::Acknowledged {
                    kind: AckKind::Unsubscribe,
                    packet_id: unsuback.pkid,
                    status: AckStatus::Acknowledged,
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => EventRoute::RequestSent {
                    kind: AckKind::Publish,
                    packet_id: *pkid,
                },
                Outgoing::Subscribe(pkid) => EventRoute::RequestSent {
                    kind: AckKind::Subscribe,
                    packet_id: *pkid,
                },
                Outgoing::Unsubscribe(pkid) => EventRoute::RequestSent {
                    kind: AckKind::Unsubscribe,
                    packet_id: *pkid,
                },
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }

    /// Validate subscription success from SubAck return codes (pure function)
    pub fn subscription_status(return_codes: &[SubscribeReasonCode]) -> AckStatus {
        if return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            AckStatus::Rejected
        } else {
            AckStatus::Acknowledged
        }
    }
}

struct QueuedRequest {
    kind: AckKind,
    qos: QoS,
    waiter: Option<oneshot::Sender<AckStatus>>,
}

/// Pairs requests with their acknowledgments.
///
/// The broker library assigns packet ids when a request leaves the event loop,
/// in the order requests were submitted. Callers enqueue under the request
/// gate right before submitting, so the n-th `RequestSent` of a kind belongs
/// to the n-th queued request of that kind.
#[derive(Default)]
pub struct AckTracker {
    queued: VecDeque<QueuedRequest>,
    awaiting: HashMap<(AckKind, u16), Option<oneshot::Sender<AckStatus>>>,
    // Requests the library will send again after a reconnect; their
    // RequestSent events must not consume queued entries.
    replayed: HashSet<(AckKind, u16)>,
    // QoS 2 publishes past PUBREC; a reconnect resends PUBREL for these,
    // not the PUBLISH
    released: HashSet<u16>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request whose caller waits for the acknowledgment
    pub fn enqueue(&mut self, kind: AckKind, qos: QoS) -> oneshot::Receiver<AckStatus> {
        let (sender, receiver) = oneshot::channel();
        self.queued.push_back(QueuedRequest {
            kind,
            qos,
            waiter: Some(sender),
        });
        receiver
    }

    /// Queue a request nobody waits for (re-subscription after reconnect)
    pub fn enqueue_untracked(&mut self, kind: AckKind, qos: QoS) {
        self.queued.push_back(QueuedRequest {
            kind,
            qos,
            waiter: None,
        });
    }

    /// Undo the most recent enqueue when the request never reached the library
    pub fn discard_newest(&mut self) {
        self.queued.pop_back();
    }

    /// A request left the event loop with `packet_id`
    pub fn on_request_sent(&mut self, kind: AckKind, packet_id: u16) {
        if self.replayed.remove(&(kind, packet_id)) {
            debug!(?kind, packet_id, "Replayed request sent after reconnect");
            return;
        }

        let Some(position) = self.queued.iter().position(|request| request.kind == kind) else {
            debug!(?kind, packet_id, "Untracked request sent");
            return;
        };
        let Some(request) = self.queued.remove(position) else {
            return;
        };

        // QoS 0 publishes are complete once written
        if kind == AckKind::Publish && request.qos == QoS::AtMostOnce {
            if let Some(waiter) = request.waiter {
                let _ = waiter.send(AckStatus::Acknowledged);
            }
            return;
        }

        self.awaiting.insert((kind, packet_id), request.waiter);
    }

    /// PUBREC arrived for a QoS 2 publish
    pub fn on_publish_received(&mut self, packet_id: u16) {
        if self.awaiting.contains_key(&(AckKind::Publish, packet_id)) {
            self.released.insert(packet_id);
        }
    }

    /// The broker acknowledged `packet_id`
    pub fn on_acknowledged(&mut self, kind: AckKind, packet_id: u16, status: AckStatus) {
        if kind == AckKind::Publish {
            self.released.remove(&packet_id);
        }
        match self.awaiting.remove(&(kind, packet_id)) {
            Some(Some(waiter)) => {
                // Receiver gone means the caller already timed out
                if waiter.send(status).is_err() {
                    debug!(?kind, packet_id, "Late acknowledgment after caller gave up");
                }
            }
            Some(None) => {
                if status == AckStatus::Rejected {
                    warn!(?kind, packet_id, "Broker rejected re-subscription");
                }
            }
            None => debug!(?kind, packet_id, "Acknowledgment for unknown packet"),
        }
    }

    /// The connection dropped but may come back: fail every waiter, keep
    /// the bookkeeping the library will replay.
    ///
    /// Only in-flight PUBLISH packets are resent on reconnect. SUBSCRIBE and
    /// UNSUBSCRIBE ids are free for reuse as soon as the connection drops.
    pub fn fail_pending(&mut self, reason: &str) {
        for (key, waiter) in self.awaiting.drain() {
            if let Some(waiter) = waiter {
                let _ = waiter.send(AckStatus::ConnectionLost(reason.to_string()));
            }
            if key.0 == AckKind::Publish && !self.released.contains(&key.1) {
                self.replayed.insert(key);
            }
        }
        self.released.clear();
        for request in self.queued.iter_mut() {
            if let Some(waiter) = request.waiter.take() {
                let _ = waiter.send(AckStatus::ConnectionLost(reason.to_string()));
            }
        }
    }

    /// The connection is gone for good: fail everything and forget it
    pub fn close(&mut self, reason: &str) {
        self.fail_pending(reason);
        self.queued.clear();
        self.replayed.clear();
    }

    /// Number of requests still queued or awaiting acknowledgment
    pub fn pending(&self) -> usize {
        self.queued.len() + self.awaiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, PubAck, PubRec, Publish, SubAck, UnsubAck};

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::ConnectionAcknowledged
        );
    }

    #[test]
    fn test_route_publish() {
        let mut publish = Publish::new("topic/x", QoS::AtLeastOnce, "hello");
        publish.retain = true;
        let event = Event::Incoming(Packet::Publish(publish));

        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::MessageReceived {
                topic,
                payload,
                qos,
                retain,
            } => {
                assert_eq!(topic, "topic/x");
                assert_eq!(payload, Bytes::from_static(b"hello"));
                assert_eq!(qos, QoS::AtLeastOnce);
                assert!(retain);
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn test_route_acknowledgments() {
        let event = Event::Incoming(Packet::PubAck(PubAck::new(7)));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::Acknowledged {
                kind: AckKind::Publish,
                packet_id: 7,
                status: AckStatus::Acknowledged,
            }
        );

        let event = Event::Incoming(Packet::SubAck(SubAck::new(
            3,
            vec![SubscribeReasonCode::Failure],
        )));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::Acknowledged {
                kind: AckKind::Subscribe,
                packet_id: 3,
                status: AckStatus::Rejected,
            }
        );

        let event = Event::Incoming(Packet::UnsubAck(UnsubAck::new(4)));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::Acknowledged {
                kind: AckKind::Unsubscribe,
                packet_id: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_route_outgoing() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Subscribe(9))),
            EventRoute::RequestSent {
                kind: AckKind::Subscribe,
                packet_id: 9,
            }
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PubRec(PubRec::new(4)))),
            EventRoute::PublishReceived { packet_id: 4 }
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
    }

    #[test]
    fn test_subscription_status() {
        assert_eq!(
            MessageHandler::subscription_status(&[SubscribeReasonCode::Success(QoS::AtLeastOnce)]),
            AckStatus::Acknowledged
        );
        assert_eq!(
            MessageHandler::subscription_status(&[
                SubscribeReasonCode::Success(QoS::AtMostOnce),
                SubscribeReasonCode::Failure,
            ]),
            AckStatus::Rejected
        );
    }

    #[tokio::test]
    async fn test_acks_pair_in_submission_order() {
        let mut tracker = AckTracker::new();
        let first = tracker.enqueue(AckKind::Publish, QoS::AtLeastOnce);
        let second = tracker.enqueue(AckKind::Publish, QoS::AtLeastOnce);

        tracker.on_request_sent(AckKind::Publish, 1);
        tracker.on_request_sent(AckKind::Publish, 2);

        tracker.on_acknowledged(AckKind::Publish, 2, AckStatus::Acknowledged);
        tracker.on_acknowledged(AckKind::Publish, 1, AckStatus::Acknowledged);

        assert_eq!(first.await.unwrap(), AckStatus::Acknowledged);
        assert_eq!(second.await.unwrap(), AckStatus::Acknowledged);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_kinds_are_tracked_independently() {
        let mut tracker = AckTracker::new();
        let publish = tracker.enqueue(AckKind::Publish, QoS::AtLeastOnce);
        let subscribe = tracker.enqueue(AckKind::Subscribe, QoS::AtLeastOnce);

        tracker.on_request_sent(AckKind::Subscribe, 1);
        tracker.on_request_sent(AckKind::Publish, 1);
        tracker.on_acknowledged(AckKind::Subscribe, 1, AckStatus::Rejected);
        tracker.on_acknowledged(AckKind::Publish, 1, AckStatus::Acknowledged);

        assert_eq!(subscribe.await.unwrap(), AckStatus::Rejected);
        assert_eq!(publish.await.unwrap(), AckStatus::Acknowledged);
    }

    #[tokio::test]
    async fn test_qos0_publish_completes_when_sent() {
        let mut tracker = AckTracker::new();
        let waiter = tracker.enqueue(AckKind::Publish, QoS::AtMostOnce);
        tracker.on_request_sent(AckKind::Publish, 0);

        assert_eq!(waiter.await.unwrap(), AckStatus::Acknowledged);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_fail_pending_keeps_pairing_aligned() {
        let mut tracker = AckTracker::new();
        let in_flight = tracker.enqueue(AckKind::Publish, QoS::AtLeastOnce);
        tracker.on_request_sent(AckKind::Publish, 5);
        let queued = tracker.enqueue(AckKind::Publish, QoS::AtLeastOnce);

        tracker.fail_pending("network down");
        assert!(matches!(in_flight.await.unwrap(), AckStatus::ConnectionLost(_)));
        assert!(matches!(queued.await.unwrap(), AckStatus::ConnectionLost(_)));

        // After reconnect: the library replays 5, then sends the queued one as 6
        let fresh = tracker.enqueue(AckKind::Publish, QoS::AtLeastOnce);
        tracker.on_request_sent(AckKind::Publish, 5);
        tracker.on_request_sent(AckKind::Publish, 6);
        tracker.on_request_sent(AckKind::Publish, 7);
        tracker.on_acknowledged(AckKind::Publish, 7, AckStatus::Acknowledged);

        assert_eq!(fresh.await.unwrap(), AckStatus::Acknowledged);
    }

    #[tokio::test]
    async fn test_subscribe_in_flight_at_drop_does_not_shadow_reused_id() {
        // Arrange: a subscribe is on the wire when the link drops
        let mut tracker = AckTracker::new();
        let lost = tracker.enqueue(AckKind::Subscribe, QoS::AtLeastOnce);
        tracker.on_request_sent(AckKind::Subscribe, 5);
        tracker.fail_pending("network down");
        assert!(matches!(lost.await.unwrap(), AckStatus::ConnectionLost(_)));

        // Act: after reconnect new subscribes reuse id 5, then take 6
        let fresh = tracker.enqueue(AckKind::Subscribe, QoS::AtLeastOnce);
        let next = tracker.enqueue(AckKind::Subscribe, QoS::AtLeastOnce);
        tracker.on_request_sent(AckKind::Subscribe, 5);
        tracker.on_acknowledged(AckKind::Subscribe, 5, AckStatus::Acknowledged);
        tracker.on_request_sent(AckKind::Subscribe, 6);
        tracker.on_acknowledged(AckKind::Subscribe, 6, AckStatus::Rejected);

        // Assert: each SUBACK reaches its own caller
        assert_eq!(fresh.await.unwrap(), AckStatus::Acknowledged);
        assert_eq!(next.await.unwrap(), AckStatus::Rejected);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_released_qos2_publish_is_not_replayed() {
        let mut tracker = AckTracker::new();
        let lost = tracker.enqueue(AckKind::Publish, QoS::ExactlyOnce);
        tracker.on_request_sent(AckKind::Publish, 3);
        tracker.on_publish_received(3);
        tracker.fail_pending("network down");
        assert!(matches!(lost.await.unwrap(), AckStatus::ConnectionLost(_)));

        // Only PUBREL goes out again, so a new publish may take id 3
        let fresh = tracker.enqueue(AckKind::Publish, QoS::AtLeastOnce);
        tracker.on_request_sent(AckKind::Publish, 3);
        tracker.on_acknowledged(AckKind::Publish, 3, AckStatus::Acknowledged);

        assert_eq!(fresh.await.unwrap(), AckStatus::Acknowledged);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_in_flight_at_drop_is_forgotten() {
        let mut tracker = AckTracker::new();
        let _lost = tracker.enqueue(AckKind::Unsubscribe, QoS::AtMostOnce);
        tracker.on_request_sent(AckKind::Unsubscribe, 2);
        tracker.fail_pending("network down");

        let fresh = tracker.enqueue(AckKind::Unsubscribe, QoS::AtMostOnce);
        tracker.on_request_sent(AckKind::Unsubscribe, 2);
        tracker.on_acknowledged(AckKind::Unsubscribe, 2, AckStatus::Acknowledged);

        assert_eq!(fresh.await.unwrap(), AckStatus::Acknowledged);
    }

    #[tokio::test]
    async fn test_close_clears_everything() {
        let mut tracker = AckTracker::new();
        let waiter = tracker.enqueue(AckKind::Unsubscribe, QoS::AtMostOnce);
        tracker.enqueue_untracked(AckKind::Subscribe, QoS::AtLeastOnce);

        tracker.close("closed");
        assert!(matches!(waiter.await.unwrap(), AckStatus::ConnectionLost(_)));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_discard_newest() {
        let mut tracker = AckTracker::new();
        let _first = tracker.enqueue(AckKind::Publish, QoS::AtLeastOnce);
        let _second = tracker.enqueue(AckKind::Publish, QoS::AtLeastOnce);
        tracker.discard_newest();
        assert_eq!(tracker.pending(), 1);
    }
}
