// Property Sync - Core Library
// Active-active replication of property listings across regions: each region
// takes local writes under optimistic concurrency and merges everyone else's
// writes from a shared event log, last-writer-wins by version.

pub mod config;
pub mod store;      // Entity rows + idempotency ledger over SQLite
pub mod writes;     // Idempotency guard + conditional write engine
pub mod events;     // Change event wire format + shared log abstraction
pub mod publisher;  // Post-commit, best-effort event publication
pub mod consumer;   // Remote merge consumer (LWW by version)
pub mod lag;        // Replication lag derived from consumed events
pub mod region;     // Per-region wiring of the above

// Re-export commonly used types
pub use config::RegionConfig;
pub use store::{
    count_properties, get_property, insert_property, open_database, property_from_row,
    seed_demo_properties, setup_database, Property, PROPERTY_COLUMNS,
};
pub use writes::{conditional_write, purge_idempotency_keys, WriteError, WriteRequest};
pub use events::{
    connect_with_retry, ChangeEvent, LogError, MemoryLog, SharedLog, Subscription,
    PROPERTY_UPDATES_TOPIC,
};
pub use publisher::ChangePublisher;
pub use consumer::{apply_remote_event, ConsumerState, MergeConsumer, MergeOutcome};
pub use lag::LagTracker;
pub use region::Region;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
