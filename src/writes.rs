// Conditional Write Engine + Idempotency Guard
// One transaction per request: record the request id, then compare-and-swap on version

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use crate::store::{property_from_row, Property, PROPERTY_COLUMNS};

/// A price update from the request boundary.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub id: i64,
    /// Caller-supplied idempotency token, globally unique per logical attempt.
    pub request_id: String,
    pub price: f64,
    /// Version the caller last observed; the update only applies if it still matches.
    pub expected_version: i64,
}

/// Local write path failures. Each maps to a distinct status at the request
/// boundary; all of them roll back the transaction.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("duplicate request: {0}")]
    DuplicateRequest(String),

    #[error("property {0} not found")]
    NotFound(i64),

    #[error("version conflict on property {id}: expected {expected}")]
    VersionConflict { id: i64, expected: i64 },

    #[error("storage unavailable: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Apply a conditional price update inside a single transaction.
///
/// Of N concurrent requests presenting the same expected version, exactly one
/// commits: the guard is the `WHERE version = ?` clause of one atomic UPDATE,
/// never a read followed by a write. The stored `region_origin` is left
/// untouched here; the outgoing change event is stamped by the publisher.
pub fn conditional_write(conn: &mut Connection, request: &WriteRequest) -> Result<Property, WriteError> {
    let tx = conn.transaction()?;
    let now = Utc::now();

    // Idempotency guard: the primary key constraint is the duplicate check,
    // so two racing retries cannot both pass a lookup.
    let inserted = tx.execute(
        "INSERT INTO idempotency_keys (key, created_at) VALUES (?1, ?2)",
        params![request.request_id, now.to_rfc3339()],
    );
    match inserted {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
            // Dropping the transaction rolls it back
            return Err(WriteError::DuplicateRequest(request.request_id.clone()));
        }
        Err(e) => return Err(e.into()),
    }

    // Compare-and-swap on the caller's expected version
    let affected = tx.execute(
        "UPDATE properties
         SET price = ?1, version = version + 1, updated_at = ?2
         WHERE id = ?3 AND version = ?4",
        params![request.price, now.to_rfc3339(), request.id, request.expected_version],
    )?;

    if affected == 0 {
        // Distinguish "no such property" from "someone got there first"
        let exists = tx
            .query_row(
                "SELECT 1 FROM properties WHERE id = ?1",
                params![request.id],
                |_| Ok(()),
            )
            .optional()?;
        return Err(match exists {
            Some(_) => WriteError::VersionConflict {
                id: request.id,
                expected: request.expected_version,
            },
            None => WriteError::NotFound(request.id),
        });
    }

    let updated = tx.query_row(
        &format!("SELECT {PROPERTY_COLUMNS} FROM properties WHERE id = ?1"),
        params![request.id],
        property_from_row,
    )?;

    tx.commit()?;
    debug!(
        id = request.id,
        version = updated.version,
        "conditional write committed"
    );
    Ok(updated)
}

/// Delete idempotency records older than `retention`.
///
/// The ledger itself is append-only and unbounded; callers that want a bound
/// run this sweep on their own schedule. A token purged here would accept a
/// very late retry as a fresh request, so the retention window must exceed
/// the longest plausible client retry horizon.
pub fn purge_idempotency_keys(conn: &Connection, retention: Duration) -> Result<usize, WriteError> {
    let horizon = Utc::now() - retention;
    let deleted = conn.execute(
        "DELETE FROM idempotency_keys WHERE created_at < ?1",
        params![horizon.to_rfc3339()],
    )?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{get_property, insert_property, setup_database};
    use chrono::Utc;
    use std::sync::{Arc, Mutex};
    use std::thread;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        insert_property(
            &conn,
            &Property {
                id: 500,
                price: 1_500_000.0,
                bedrooms: 3,
                bathrooms: 2,
                region_origin: "us".to_string(),
                version: 1,
                updated_at: Utc::now(),
            },
        )
        .unwrap();
        conn
    }

    fn request(request_id: &str, price: f64, expected_version: i64) -> WriteRequest {
        WriteRequest {
            id: 500,
            request_id: request_id.to_string(),
            price,
            expected_version,
        }
    }

    #[test]
    fn test_successful_write_increments_version() {
        let mut conn = setup();

        let updated = conditional_write(&mut conn, &request("req-1", 2_000_000.0, 1)).unwrap();
        assert_eq!(updated.id, 500);
        assert_eq!(updated.price, 2_000_000.0);
        assert_eq!(updated.version, 2);
        // Local writes do not reassign the stored origin
        assert_eq!(updated.region_origin, "us");
    }

    #[test]
    fn test_duplicate_request_id_rejected_and_state_unchanged() {
        let mut conn = setup();

        conditional_write(&mut conn, &request("req-1", 2_000_000.0, 1)).unwrap();

        // Retry with the same token: different payload, must still be rejected
        let err = conditional_write(&mut conn, &request("req-1", 9_999_999.0, 2)).unwrap_err();
        assert!(matches!(err, WriteError::DuplicateRequest(_)));

        let stored = get_property(&conn, 500).unwrap().unwrap();
        assert_eq!(stored.price, 2_000_000.0);
        assert_eq!(stored.version, 2);
    }

    #[test]
    fn test_version_conflict() {
        let mut conn = setup();

        conditional_write(&mut conn, &request("req-1", 2_000_000.0, 1)).unwrap();

        let err = conditional_write(&mut conn, &request("req-2", 2_100_000.0, 1)).unwrap_err();
        assert!(matches!(
            err,
            WriteError::VersionConflict { id: 500, expected: 1 }
        ));

        // The losing request's token was rolled back with everything else,
        // so the client may retry it with a refreshed version
        let retried = conditional_write(&mut conn, &request("req-2", 2_100_000.0, 2)).unwrap();
        assert_eq!(retried.version, 3);
    }

    #[test]
    fn test_not_found() {
        let mut conn = setup();

        let missing = WriteRequest {
            id: 999,
            request_id: "req-404".to_string(),
            price: 100.0,
            expected_version: 1,
        };
        let err = conditional_write(&mut conn, &missing).unwrap_err();
        assert!(matches!(err, WriteError::NotFound(999)));
    }

    #[test]
    fn test_concurrent_writers_exactly_one_wins() {
        let conn = Arc::new(Mutex::new(setup()));
        let writers = 8;

        let handles: Vec<_> = (0..writers)
            .map(|i| {
                let conn = Arc::clone(&conn);
                thread::spawn(move || {
                    let req = request(&format!("req-{i}"), 2_000_000.0 + i as f64, 1);
                    let mut conn = conn.lock().unwrap();
                    conditional_write(&mut conn, &req)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(WriteError::VersionConflict { .. })))
            .count();

        assert_eq!(successes, 1, "exactly one writer must win the CAS");
        assert_eq!(conflicts, writers - 1);

        let stored = get_property(&conn.lock().unwrap(), 500).unwrap().unwrap();
        assert_eq!(stored.version, 2, "version advances by exactly 1");
    }

    #[test]
    fn test_purge_removes_only_expired_tokens() {
        let conn = setup();

        let old = (Utc::now() - Duration::days(10)).to_rfc3339();
        conn.execute(
            "INSERT INTO idempotency_keys (key, created_at) VALUES ('stale-token', ?1)",
            params![old],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO idempotency_keys (key, created_at) VALUES ('fresh-token', ?1)",
            params![Utc::now().to_rfc3339()],
        )
        .unwrap();

        let deleted = purge_idempotency_keys(&conn, Duration::days(7)).unwrap();
        assert_eq!(deleted, 1);

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM idempotency_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
        let key: String = conn
            .query_row("SELECT key FROM idempotency_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(key, "fresh-token");
    }
}
