// Region wiring - one handle owning a region's store, log, consumer, and lag state

use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{error, info};

use crate::config::RegionConfig;
use crate::consumer::MergeConsumer;
use crate::events::{LogError, SharedLog};
use crate::lag::LagTracker;
use crate::publisher::ChangePublisher;
use crate::store::Property;
use crate::writes::{conditional_write, WriteError, WriteRequest};

/// Everything one region needs: the entity store, the shared log handle, the
/// publisher stamped with this region's identity, and the lag tracker fed by
/// the consumer. Long-lived handles are injected here once at construction,
/// never reached for as ambient globals.
pub struct Region {
    config: RegionConfig,
    db: Arc<Mutex<Connection>>,
    log: Arc<dyn SharedLog>,
    lag: Arc<LagTracker>,
    publisher: ChangePublisher,
}

impl Region {
    pub fn new(config: RegionConfig, db: Arc<Mutex<Connection>>, log: Arc<dyn SharedLog>) -> Self {
        let publisher = ChangePublisher::new(Arc::clone(&log), &config.region);
        Self {
            config,
            db,
            log,
            lag: Arc::new(LagTracker::new()),
            publisher,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.region
    }

    pub fn db(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    /// Run the conditional write alone. The request boundary uses this when
    /// it wants to respond to the client before publication happens.
    pub fn write(&self, request: &WriteRequest) -> Result<Property, WriteError> {
        let mut conn = self
            .db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        conditional_write(&mut conn, request)
    }

    /// Best-effort publication of an already-committed row.
    pub fn publish_committed(&self, row: &Property) {
        self.publisher.publish_committed(row);
    }

    /// Conditional write followed by best-effort publication, for callers
    /// with no separate response step.
    pub fn handle_write(&self, request: &WriteRequest) -> Result<Property, WriteError> {
        let updated = self.write(request)?;
        self.publish_committed(&updated);
        Ok(updated)
    }

    pub fn lag_seconds(&self) -> f64 {
        self.lag.lag_seconds()
    }

    /// Subscribe to the shared log and start this region's single merge
    /// consumer on its own thread.
    ///
    /// Subscription happens here, not on the thread, so exhausted connect
    /// retries fail startup instead of leaving a region that silently never
    /// replicates. If the consumer loop ever returns, the thread logs the
    /// error and takes the process down with it.
    pub fn spawn_consumer(&self) -> Result<JoinHandle<()>, LogError> {
        let mut consumer = MergeConsumer::new(
            Arc::clone(&self.db),
            Arc::clone(&self.lag),
            &self.config.region,
        );
        let subscription = consumer.connect(
            self.log.as_ref(),
            self.config.log_connect_attempts,
            self.config.log_connect_delay,
        )?;

        let region = self.config.region.clone();
        let handle = thread::spawn(move || {
            if let Err(e) = consumer.run(&subscription) {
                error!(region = %region, error = %e, "merge consumer lost the shared log");
                std::process::exit(1);
            }
        });
        info!(region = %self.config.region, "merge consumer running");
        Ok(handle)
    }

    /// Consumer thread for in-process runs (tests, the CLI simulation) where
    /// losing the log should end the thread, not the process.
    pub fn spawn_consumer_local(&self) -> Result<JoinHandle<Result<(), LogError>>, LogError> {
        let mut consumer = MergeConsumer::new(
            Arc::clone(&self.db),
            Arc::clone(&self.lag),
            &self.config.region,
        );
        let subscription = consumer.connect(
            self.log.as_ref(),
            self.config.log_connect_attempts,
            self.config.log_connect_delay,
        )?;
        Ok(thread::spawn(move || {
            match consumer.run(&subscription) {
                // Log dropped: normal end of an in-process run
                Err(LogError::Disconnected) => Ok(()),
                other => other,
            }
        }))
    }
}
