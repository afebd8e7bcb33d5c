// Entity Store - transactional storage for property rows and the idempotency ledger
// SQLite stands in for any relational store with BEGIN/COMMIT and conditional UPDATE

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A replicated property row.
///
/// `price` is the only field the local write path mutates; `bedrooms` and
/// `bathrooms` are carried through replication untouched. `version` is
/// strictly increasing for a given id, whether the change came from a local
/// write or a remote merge. `region_origin` names the region whose write
/// most recently won.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: i64,
    pub price: f64,
    pub bedrooms: i64,
    pub bathrooms: i64,
    pub region_origin: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Open the database at `path`, or an in-memory database when `path` is None.
pub fn open_database(path: Option<&Path>) -> Result<Connection> {
    let conn = match path {
        Some(p) => Connection::open(p).with_context(|| format!("failed to open database at {:?}", p))?,
        None => Connection::open_in_memory().context("failed to open in-memory database")?,
    };
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL mode for crash recovery (no-op on in-memory databases)
    let _ = conn.pragma_update(None, "journal_mode", "WAL");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS properties (
            id INTEGER PRIMARY KEY,
            price REAL NOT NULL,
            bedrooms INTEGER NOT NULL,
            bathrooms INTEGER NOT NULL,
            region_origin TEXT NOT NULL,
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // Append-only ledger of accepted request ids. created_at exists solely to
    // support the retention sweep in writes::purge_idempotency_keys.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS idempotency_keys (
            key TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_idempotency_created_at ON idempotency_keys(created_at)",
        [],
    )?;

    Ok(())
}

/// Map a row selected with [`PROPERTY_COLUMNS`] into a [`Property`].
pub fn property_from_row(row: &Row<'_>) -> rusqlite::Result<Property> {
    let updated_at_str: String = row.get(6)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at_str)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);

    Ok(Property {
        id: row.get(0)?,
        price: row.get(1)?,
        bedrooms: row.get(2)?,
        bathrooms: row.get(3)?,
        region_origin: row.get(4)?,
        version: row.get(5)?,
        updated_at,
    })
}

/// Column list matching [`property_from_row`]'s indices.
pub const PROPERTY_COLUMNS: &str =
    "id, price, bedrooms, bathrooms, region_origin, version, updated_at";

pub fn get_property(conn: &Connection, id: i64) -> Result<Option<Property>> {
    let row = conn
        .query_row(
            &format!("SELECT {PROPERTY_COLUMNS} FROM properties WHERE id = ?1"),
            params![id],
            property_from_row,
        )
        .optional()
        .context("failed to load property")?;
    Ok(row)
}

pub fn count_properties(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM properties", [], |row| row.get(0))?;
    Ok(count)
}

/// Insert a row directly, bypassing the write path. Used for seeding and tests.
pub fn insert_property(conn: &Connection, property: &Property) -> Result<()> {
    conn.execute(
        "INSERT INTO properties (id, price, bedrooms, bathrooms, region_origin, version, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            property.id,
            property.price,
            property.bedrooms,
            property.bathrooms,
            property.region_origin,
            property.version,
            property.updated_at.to_rfc3339(),
        ],
    )
    .context("failed to insert property")?;
    Ok(())
}

/// Seed the demo listing set every region starts from. Skipped when the table
/// already has rows, so restarting a region keeps its replicated state.
pub fn seed_demo_properties(conn: &Connection, region: &str) -> Result<usize> {
    if count_properties(conn)? > 0 {
        return Ok(0);
    }

    let now = Utc::now();
    let listings: [(i64, f64, i64, i64); 3] = [
        (500, 1_500_000.0, 3, 2),
        (501, 750_000.0, 2, 1),
        (502, 2_400_000.0, 5, 4),
    ];

    for (id, price, bedrooms, bathrooms) in listings {
        insert_property(
            conn,
            &Property {
                id,
                price,
                bedrooms,
                bathrooms,
                region_origin: region.to_string(),
                version: 1,
                updated_at: now,
            },
        )?;
    }

    Ok(listings.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_property(id: i64, version: i64) -> Property {
        Property {
            id,
            price: 100_000.0,
            bedrooms: 2,
            bathrooms: 1,
            region_origin: "us".to_string(),
            version,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_get_roundtrip() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let property = test_property(42, 1);
        insert_property(&conn, &property).unwrap();

        let loaded = get_property(&conn, 42).unwrap().unwrap();
        assert_eq!(loaded.id, 42);
        assert_eq!(loaded.price, 100_000.0);
        assert_eq!(loaded.region_origin, "us");
        assert_eq!(loaded.version, 1);
        // RFC 3339 text keeps sub-second precision, so timestamps survive
        assert_eq!(loaded.updated_at, property.updated_at);
    }

    #[test]
    fn test_get_missing_property_is_none() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        assert!(get_property(&conn, 999).unwrap().is_none());
    }

    #[test]
    fn test_seed_is_idempotent_across_restarts() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let seeded = seed_demo_properties(&conn, "us").unwrap();
        assert_eq!(seeded, 3);
        assert_eq!(count_properties(&conn).unwrap(), 3);

        // Second seed must not touch existing (possibly replicated) rows
        let seeded_again = seed_demo_properties(&conn, "us").unwrap();
        assert_eq!(seeded_again, 0);
        assert_eq!(count_properties(&conn).unwrap(), 3);
    }
}
