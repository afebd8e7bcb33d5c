// Change Event wire format + SharedLog pub/sub abstraction
// The real transport (Kafka, Redis Streams, ...) is an at-least-once primitive
// behind the SharedLog trait; MemoryLog is the in-process implementation used
// by the CLI simulation and tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::store::Property;

/// Topic every region publishes to and consumes from.
pub const PROPERTY_UPDATES_TOPIC: &str = "property-updates";

/// Post-write state of a property as it travels between regions.
///
/// One event per committed local write. `region_origin` is stamped with the
/// producing region's identity so consumers can discard their own echoes;
/// `updated_at` is carried verbatim and feeds the lag estimate downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: i64,
    pub price: f64,
    pub bedrooms: i64,
    pub bathrooms: i64,
    pub region_origin: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Build the event for a freshly committed row, stamped with the
    /// producing region's identity.
    pub fn from_committed(row: &Property, region: &str) -> Self {
        Self {
            id: row.id,
            price: row.price,
            bedrooms: row.bedrooms,
            bathrooms: row.bathrooms,
            region_origin: region.to_string(),
            version: row.version,
            updated_at: row.updated_at,
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("shared log unavailable: {0}")]
    Unavailable(String),

    #[error("shared log disconnected")]
    Disconnected,

    #[error("event serialization failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// An at-least-once pub/sub log shared by all regions.
///
/// `key` exists so transports that partition can keep per-id ordering; the
/// trait itself promises only at-least-once delivery. Payloads are opaque
/// bytes: decoding happens (and fails) per message on the consumer side.
pub trait SharedLog: Send + Sync {
    fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), LogError>;

    fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, LogError>;
}

/// A blocking handle onto one consumer group's message stream.
pub struct Subscription {
    receiver: Receiver<Vec<u8>>,
}

impl Subscription {
    /// Block until the next message arrives. A closed channel means the log
    /// connection is gone, which callers must treat as fatal.
    pub fn recv(&self) -> Result<Vec<u8>, LogError> {
        self.receiver.recv().map_err(|_| LogError::Disconnected)
    }
}

/// In-process fan-out log. Every subscriber group sees every message on the
/// topic; there is a single logical partition, so arrival order is delivery
/// order for all subscribers.
#[derive(Default)]
pub struct MemoryLog {
    topics: Mutex<HashMap<String, Vec<Sender<Vec<u8>>>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedLog for MemoryLog {
    fn publish(&self, topic: &str, _key: &str, payload: &[u8]) -> Result<(), LogError> {
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(subscribers) = topics.get_mut(topic) {
            // Drop subscribers whose receiving side went away
            subscribers.retain(|tx| tx.send(payload.to_vec()).is_ok());
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, _group: &str) -> Result<Subscription, LogError> {
        let (tx, rx) = mpsc::channel();
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        topics.entry(topic.to_string()).or_default().push(tx);
        Ok(Subscription { receiver: rx })
    }
}

/// Subscribe with a bounded number of fixed-delay attempts.
///
/// Exhausting the attempts is fatal to startup: a region without a log
/// subscription cannot replicate, and replication is not optional.
pub fn connect_with_retry(
    log: &dyn SharedLog,
    topic: &str,
    group: &str,
    attempts: u32,
    delay: Duration,
) -> Result<Subscription, LogError> {
    let mut last_error = None;
    for attempt in 1..=attempts {
        match log.subscribe(topic, group) {
            Ok(subscription) => {
                info!(topic, group, attempt, "subscribed to shared log");
                return Ok(subscription);
            }
            Err(e) => {
                error!(topic, attempt, attempts, error = %e, "shared log connection failed");
                last_error = Some(e);
                if attempt < attempts {
                    std::thread::sleep(delay);
                }
            }
        }
    }
    Err(LogError::Unavailable(format!(
        "giving up on topic '{topic}' after {attempts} attempts: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_event(id: i64, version: i64, region: &str) -> ChangeEvent {
        ChangeEvent {
            id,
            price: 1_000_000.0,
            bedrooms: 3,
            bathrooms: 2,
            region_origin: region.to_string(),
            version,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_event_payload_is_flat_json() {
        let event = test_event(500, 2, "us");
        let payload = event.to_payload().unwrap();

        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["id"], 500);
        assert_eq!(value["version"], 2);
        assert_eq!(value["region_origin"], "us");
        assert!(value["updated_at"].is_string());

        let decoded = ChangeEvent::from_payload(&payload).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_memory_log_fans_out_to_all_groups() {
        let log = MemoryLog::new();
        let us = log.subscribe(PROPERTY_UPDATES_TOPIC, "properties-group-us").unwrap();
        let eu = log.subscribe(PROPERTY_UPDATES_TOPIC, "properties-group-eu").unwrap();

        log.publish(PROPERTY_UPDATES_TOPIC, "500", b"payload").unwrap();

        assert_eq!(us.recv().unwrap(), b"payload");
        assert_eq!(eu.recv().unwrap(), b"payload");
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let log = MemoryLog::new();
        log.publish(PROPERTY_UPDATES_TOPIC, "500", b"payload").unwrap();
    }

    #[test]
    fn test_subscription_reports_disconnect() {
        let log = MemoryLog::new();
        let sub = log.subscribe(PROPERTY_UPDATES_TOPIC, "properties-group-us").unwrap();
        drop(log);

        assert!(matches!(sub.recv(), Err(LogError::Disconnected)));
    }

    #[test]
    fn test_connect_with_retry_succeeds_first_attempt() {
        let log = MemoryLog::new();
        let sub = connect_with_retry(
            &log,
            PROPERTY_UPDATES_TOPIC,
            "properties-group-us",
            5,
            Duration::from_millis(1),
        );
        assert!(sub.is_ok());
    }
}
