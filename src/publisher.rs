// Change Publisher - emits committed writes onto the shared log
// Post-commit and best-effort: the local write is already durable and the
// client already has its answer by the time this runs

use std::sync::Arc;
use tracing::{debug, warn};

use crate::events::{ChangeEvent, LogError, SharedLog, PROPERTY_UPDATES_TOPIC};
use crate::store::Property;

pub struct ChangePublisher {
    log: Arc<dyn SharedLog>,
    region: String,
}

impl ChangePublisher {
    pub fn new(log: Arc<dyn SharedLog>, region: &str) -> Self {
        Self {
            log,
            region: region.to_string(),
        }
    }

    /// Publish a committed row, swallowing failures.
    ///
    /// A failure here leaves a durable local write that never replicates.
    /// That gap is the accepted tradeoff of publishing outside the write
    /// transaction: it is logged, never retried, and never surfaced to the
    /// client whose request already committed.
    pub fn publish_committed(&self, row: &Property) {
        match self.try_publish(row) {
            Ok(()) => debug!(id = row.id, version = row.version, "change event published"),
            Err(e) => warn!(
                id = row.id,
                version = row.version,
                error = %e,
                "change event publish failed; write is committed but unreplicated"
            ),
        }
    }

    /// Publish a committed row, reporting the outcome to the caller.
    pub fn try_publish(&self, row: &Property) -> Result<(), LogError> {
        let event = ChangeEvent::from_committed(row, &self.region);
        let payload = event.to_payload()?;
        // Keyed by id so partitioned transports keep per-property ordering
        self.log
            .publish(PROPERTY_UPDATES_TOPIC, &event.id.to_string(), &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryLog;
    use chrono::Utc;

    fn committed_row() -> Property {
        Property {
            id: 500,
            price: 2_000_000.0,
            bedrooms: 3,
            bathrooms: 2,
            region_origin: "eu".to_string(),
            version: 2,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_event_is_stamped_with_publisher_region() {
        let log = Arc::new(MemoryLog::new());
        let sub = log.subscribe(PROPERTY_UPDATES_TOPIC, "properties-group-eu").unwrap();
        let publisher = ChangePublisher::new(log, "us");

        // Stored row still says "eu" (a previous remote merge won); the event
        // must carry the region that produced this write
        publisher.publish_committed(&committed_row());

        let event = ChangeEvent::from_payload(&sub.recv().unwrap()).unwrap();
        assert_eq!(event.region_origin, "us");
        assert_eq!(event.id, 500);
        assert_eq!(event.version, 2);
        assert_eq!(event.price, 2_000_000.0);
    }

    #[test]
    fn test_publish_failure_does_not_propagate() {
        struct FailingLog;
        impl SharedLog for FailingLog {
            fn publish(&self, _: &str, _: &str, _: &[u8]) -> Result<(), LogError> {
                Err(LogError::Unavailable("broker down".to_string()))
            }
            fn subscribe(
                &self,
                _: &str,
                _: &str,
            ) -> Result<crate::events::Subscription, LogError> {
                Err(LogError::Unavailable("broker down".to_string()))
            }
        }

        let publisher = ChangePublisher::new(Arc::new(FailingLog), "us");
        // Must not panic or propagate; the write already committed
        publisher.publish_committed(&committed_row());
    }
}
