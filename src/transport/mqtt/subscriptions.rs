//! Topic subscription multiplexer
//!
//! Turns the single inbound publish stream of a broker connection into one
//! bounded channel per subscribed topic filter. Removing a filter drops its
//! sender, so consumers observe channel closure instead of a silent stall.

use super::connection::MqttError;
use bytes::Bytes;
use rumqttc::QoS;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Capacity of every per-subscription delivery channel
pub const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 50;

/// A topic split into its levels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPath {
    pub whole: String,
    pub levels: Vec<String>,
    pub has_wildcard: bool,
}

impl TopicPath {
    pub fn parse(topic: &str) -> Self {
        let levels: Vec<String> = topic.split('/').map(str::to_string).collect();
        let has_wildcard = levels.iter().any(|level| level == "+" || level == "#");
        Self {
            whole: topic.to_string(),
            levels,
            has_wildcard,
        }
    }
}

impl std::fmt::Display for TopicPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.whole)
    }
}

/// One inbound message, as delivered on a subscription channel
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    pub topic: TopicPath,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishRecord {
    pub fn new(topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Self {
        Self {
            topic: TopicPath::parse(topic),
            payload,
            qos,
            retain,
        }
    }
}

/// Check a subscription filter: `+` must fill a whole level, `#` must be the
/// whole last level
pub fn validate_filter(filter: &str) -> Result<(), MqttError> {
    let invalid = |reason: &str| MqttError::InvalidTopic {
        topic: filter.to_string(),
        reason: reason.to_string(),
    };

    if filter.is_empty() {
        return Err(invalid("topic filter is empty"));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != last) {
            return Err(invalid("'#' must occupy the whole last level"));
        }
        if level.contains('+') && *level != "+" {
            return Err(invalid("'+' must occupy a whole level"));
        }
    }

    Ok(())
}

/// Check a publish topic: non-empty and free of wildcards
pub fn validate_topic_name(topic: &str) -> Result<(), MqttError> {
    if topic.is_empty() {
        return Err(MqttError::InvalidTopic {
            topic: topic.to_string(),
            reason: "topic is empty".to_string(),
        });
    }
    if topic.contains(['+', '#']) {
        return Err(MqttError::InvalidTopic {
            topic: topic.to_string(),
            reason: "wildcards are not allowed when publishing".to_string(),
        });
    }
    Ok(())
}

/// MQTT filter matching. Topics starting with `$` are not matched by a
/// leading wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscription {
    qos: QoS,
    sender: mpsc::Sender<PublishRecord>,
}

/// Lock-protected filter → channel map shared by every subscription of one
/// connection
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter and return its receiving end. A previous channel for
    /// the same filter is replaced and closes.
    pub async fn register(&self, filter: &str, qos: QoS) -> mpsc::Receiver<PublishRecord> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
        let mut entries = self.entries.write().await;
        if entries
            .insert(filter.to_string(), Subscription { qos, sender })
            .is_some()
        {
            debug!(filter = %filter, "Replaced existing subscription channel");
        }
        receiver
    }

    /// Remove a filter, closing its channel. Returns whether it was registered.
    pub async fn remove(&self, filter: &str) -> bool {
        self.entries.write().await.remove(filter).is_some()
    }

    /// Drop every channel
    pub async fn close_all(&self) {
        let mut entries = self.entries.write().await;
        if !entries.is_empty() {
            debug!(count = entries.len(), "Closing all subscription channels");
        }
        entries.clear();
    }

    /// Push a record into every matching channel without blocking.
    /// Returns the number of channels that accepted it.
    pub async fn dispatch(&self, record: &PublishRecord) -> usize {
        let entries = self.entries.read().await;
        let mut delivered = 0;

        for (filter, subscription) in entries.iter() {
            if !topic_matches(filter, &record.topic.whole) {
                continue;
            }
            match subscription.sender.try_send(record.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        filter = %filter,
                        topic = %record.topic,
                        "Subscription channel full, dropping message"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(filter = %filter, "Subscriber went away, dropping message");
                }
            }
        }

        if delivered == 0 && entries.is_empty() {
            debug!(topic = %record.topic, "Message received with no active subscriptions");
        }
        delivered
    }

    /// Snapshot of registered filters for re-subscription
    pub async fn filters(&self) -> Vec<(String, QoS)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(filter, subscription)| (filter.clone(), subscription.qos))
            .collect()
    }

    pub async fn contains(&self, filter: &str) -> bool {
        self.entries.read().await.contains_key(filter)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(topic: &str, payload: &'static str) -> PublishRecord {
        PublishRecord::new(topic, Bytes::from_static(payload.as_bytes()), QoS::AtLeastOnce, false)
    }

    #[test]
    fn test_topic_path_parse() {
        let path = TopicPath::parse("sensors/+/temp");
        assert_eq!(path.levels, vec!["sensors", "+", "temp"]);
        assert!(path.has_wildcard);
        assert_eq!(path.to_string(), "sensors/+/temp");

        let path = TopicPath::parse("topic/x");
        assert!(!path.has_wildcard);
        assert_eq!(path.levels.len(), 2);
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("topic/x", "topic/x"));
        assert!(!topic_matches("topic/x", "topic/y"));
        assert!(topic_matches("topic/+", "topic/x"));
        assert!(!topic_matches("topic/+", "topic/x/y"));
        assert!(topic_matches("topic/#", "topic/x/y"));
        assert!(topic_matches("topic/#", "topic"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(topic_matches("+/+", "a/b"));
        assert!(!topic_matches("topic/x/y", "topic/x"));
    }

    #[test]
    fn test_dollar_topics_skip_leading_wildcards() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(!topic_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_validate_filter() {
        assert!(validate_filter("topic/x").is_ok());
        assert!(validate_filter("topic/+/x").is_ok());
        assert!(validate_filter("topic/#").is_ok());
        assert!(validate_filter("#").is_ok());
        assert!(validate_filter("").is_err());
        assert!(validate_filter("topic/#/x").is_err());
        assert!(validate_filter("topic/x#").is_err());
        assert!(validate_filter("topic/a+").is_err());
    }

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("topic/x").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("topic/+").is_err());
    }

    #[tokio::test]
    async fn test_dispatch_delivers_in_order() {
        let registry = SubscriptionRegistry::new();
        let mut rx = registry.register("topic/x", QoS::AtLeastOnce).await;

        for payload in ["one", "two", "three"] {
            assert_eq!(registry.dispatch(&record("topic/x", payload)).await, 1);
        }

        for expected in ["one", "two", "three"] {
            let received = rx.recv().await.unwrap();
            assert_eq!(received.topic.whole, "topic/x");
            assert_eq!(received.payload, Bytes::from_static(expected.as_bytes()));
        }
    }

    #[tokio::test]
    async fn test_remove_closes_channel_and_isolates_others() {
        let registry = SubscriptionRegistry::new();
        let mut rx_a = registry.register("topic/a", QoS::AtMostOnce).await;
        let mut rx_b = registry.register("topic/b", QoS::AtMostOnce).await;

        assert!(registry.remove("topic/a").await);
        assert!(!registry.remove("topic/a").await);
        assert!(rx_a.recv().await.is_none());

        assert_eq!(registry.dispatch(&record("topic/a", "late")).await, 0);
        assert_eq!(registry.dispatch(&record("topic/b", "still here")).await, 1);
        assert_eq!(rx_b.recv().await.unwrap().payload, Bytes::from_static(b"still here"));
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let registry = SubscriptionRegistry::new();
        let mut rx = registry.register("topic/x", QoS::AtMostOnce).await;

        for _ in 0..SUBSCRIPTION_CHANNEL_CAPACITY {
            assert_eq!(registry.dispatch(&record("topic/x", "fill")).await, 1);
        }
        assert_eq!(registry.dispatch(&record("topic/x", "overflow")).await, 0);

        let mut count = 0;
        while let Ok(received) = rx.try_recv() {
            assert_eq!(received.payload, Bytes::from_static(b"fill"));
            count += 1;
        }
        assert_eq!(count, SUBSCRIPTION_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn test_register_replaces_previous_channel() {
        let registry = SubscriptionRegistry::new();
        let mut first = registry.register("topic/x", QoS::AtMostOnce).await;
        let mut second = registry.register("topic/x", QoS::ExactlyOnce).await;

        assert!(first.recv().await.is_none());
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.filters().await, vec![("topic/x".to_string(), QoS::ExactlyOnce)]);

        registry.dispatch(&record("topic/x", "fresh")).await;
        assert!(second.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_wildcard_and_exact_both_receive() {
        let registry = SubscriptionRegistry::new();
        let mut exact = registry.register("sensors/1/temp", QoS::AtMostOnce).await;
        let mut wildcard = registry.register("sensors/+/temp", QoS::AtMostOnce).await;

        assert_eq!(registry.dispatch(&record("sensors/1/temp", "21.5")).await, 2);
        assert!(exact.recv().await.is_some());
        assert!(wildcard.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = SubscriptionRegistry::new();
        let mut rx = registry.register("a", QoS::AtMostOnce).await;
        registry.register("b", QoS::AtMostOnce).await;

        registry.close_all().await;
        assert!(registry.is_empty().await);
        assert!(rx.recv().await.is_none());
    }

    proptest! {
        #[test]
        fn prop_exact_filter_matches_itself(levels in prop::collection::vec("[a-z0-9]{1,8}", 1..6)) {
            let topic = levels.join("/");
            prop_assert!(topic_matches(&topic, &topic));
            prop_assert!(topic_matches("#", &topic));
        }

        #[test]
        fn prop_single_level_wildcard_matches_any_level(
            levels in prop::collection::vec("[a-z0-9]{1,8}", 1..6),
            index in any::<prop::sample::Index>(),
        ) {
            let topic = levels.join("/");
            let position = index.index(levels.len());
            let mut filter_levels = levels.clone();
            filter_levels[position] = "+".to_string();
            let filter = filter_levels.join("/");

            prop_assert!(validate_filter(&filter).is_ok());
            prop_assert!(topic_matches(&filter, &topic));

            let longer = format!("{topic}/extra");
            prop_assert!(!topic_matches(&filter, &longer));
        }
    }
}
