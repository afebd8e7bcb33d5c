// Remote Merge Consumer - applies change events from every region
// Last-writer-wins by version number, enforced by one atomic guarded upsert

use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::events::{connect_with_retry, ChangeEvent, LogError, SharedLog, Subscription, PROPERTY_UPDATES_TOPIC};
use crate::lag::LagTracker;

/// Consumer lifecycle. `Consuming` is the steady state; there is no degraded
/// mode below it, a lost subscription is fatal to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Subscribed,
    Consuming,
}

/// What the merge guard decided for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Row inserted or overwritten: the event carried a strictly newer version.
    Applied,
    /// Stored version was equal or newer; the event was a silent no-op.
    Stale,
    /// Our own echo from the shared log, discarded before touching storage.
    SelfOrigin,
}

/// Merge one remote event into local storage.
///
/// The guard is the `WHERE properties.version < excluded.version` clause of a
/// single upsert, never a read followed by a write. Equal versions lose: ties
/// go to whichever write reached this region's log first, and redelivery of
/// an already-applied event is a no-op, which is what makes at-least-once
/// delivery safe without a dedup table.
pub fn apply_remote_event(
    conn: &Connection,
    region: &str,
    event: &ChangeEvent,
) -> Result<MergeOutcome, rusqlite::Error> {
    if event.region_origin == region {
        return Ok(MergeOutcome::SelfOrigin);
    }

    let changed = conn.execute(
        "INSERT INTO properties (id, price, bedrooms, bathrooms, region_origin, version, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
             price = excluded.price,
             bedrooms = excluded.bedrooms,
             bathrooms = excluded.bathrooms,
             region_origin = excluded.region_origin,
             version = excluded.version,
             updated_at = excluded.updated_at
         WHERE properties.version < excluded.version",
        params![
            event.id,
            event.price,
            event.bedrooms,
            event.bathrooms,
            event.region_origin,
            event.version,
            event.updated_at.to_rfc3339(),
        ],
    )?;

    Ok(if changed > 0 {
        MergeOutcome::Applied
    } else {
        MergeOutcome::Stale
    })
}

/// One region's single consumer of the shared property-updates topic.
pub struct MergeConsumer {
    db: Arc<Mutex<Connection>>,
    lag: Arc<LagTracker>,
    region: String,
    state: ConsumerState,
}

impl MergeConsumer {
    pub fn new(db: Arc<Mutex<Connection>>, lag: Arc<LagTracker>, region: &str) -> Self {
        Self {
            db,
            lag,
            region: region.to_string(),
            state: ConsumerState::Disconnected,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Subscribe to the shared log with bounded retries. Exhaustion bubbles
    /// up as `LogError::Unavailable`, which callers treat as fatal.
    pub fn connect(
        &mut self,
        log: &dyn SharedLog,
        attempts: u32,
        delay: Duration,
    ) -> Result<Subscription, LogError> {
        self.state = ConsumerState::Connecting;
        let group = format!("properties-group-{}", self.region);
        let subscription =
            connect_with_retry(log, PROPERTY_UPDATES_TOPIC, &group, attempts, delay)
                .inspect_err(|_| self.state = ConsumerState::Disconnected)?;
        self.state = ConsumerState::Subscribed;
        Ok(subscription)
    }

    /// Consume until the subscription dies. Each message is fully durable
    /// before the next one is pulled; per-message failures are logged and
    /// skipped, but losing the subscription itself returns the error so the
    /// process can die rather than run without replication.
    pub fn run(&mut self, subscription: &Subscription) -> Result<(), LogError> {
        info!(region = %self.region, "merge consumer started");
        loop {
            let payload = match subscription.recv() {
                Ok(payload) => payload,
                Err(e) => {
                    self.state = ConsumerState::Disconnected;
                    return Err(e);
                }
            };
            self.state = ConsumerState::Consuming;
            self.handle_message(&payload);
        }
    }

    /// Process one raw message. Never returns an error: a malformed payload
    /// or a storage failure affects only this message.
    pub fn handle_message(&self, payload: &[u8]) {
        let event = match ChangeEvent::from_payload(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(region = %self.region, error = %e, "skipping malformed change event");
                return;
            }
        };

        // Lag tracks the feed itself, so this happens before self-filtering
        // and regardless of what the merge guard decides
        self.lag.record(event.updated_at);

        let conn = self
            .db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match apply_remote_event(&conn, &self.region, &event) {
            Ok(MergeOutcome::Applied) => debug!(
                region = %self.region,
                id = event.id,
                version = event.version,
                origin = %event.region_origin,
                "remote event merged"
            ),
            Ok(MergeOutcome::Stale) => debug!(
                region = %self.region,
                id = event.id,
                version = event.version,
                "remote event ignored, stored version is newer or equal"
            ),
            Ok(MergeOutcome::SelfOrigin) => {}
            Err(e) => warn!(
                region = %self.region,
                id = event.id,
                error = %e,
                "merge failed, skipping event"
            ),
        }
    }
}
