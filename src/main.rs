// Property Sync - CLI
// `seed` prepares a region database, `simulate` runs two in-process regions
// against a shared in-memory log and shows them converging.

use anyhow::Result;
use rusqlite::Connection;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use property_sync::{
    get_property, open_database, seed_demo_properties, setup_database, MemoryLog, Region,
    RegionConfig, WriteError, WriteRequest,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("seed") => run_seed(),
        Some("simulate") => run_simulate(),
        _ => {
            eprintln!("Usage: property-sync <seed|simulate>");
            eprintln!("  seed      create the schema and demo listings (REGION, DATABASE_PATH)");
            eprintln!("  simulate  run a two-region replication demo in-process");
            std::process::exit(1);
        }
    }
}

fn run_seed() -> Result<()> {
    let config = RegionConfig::from_env()?;
    let conn = open_database(config.database_path.as_deref())?;
    setup_database(&conn)?;
    let seeded = seed_demo_properties(&conn, &config.region)?;

    println!("✓ Database ready for region '{}'", config.region);
    println!("✓ Seeded {} listings", seeded);
    Ok(())
}

fn run_simulate() -> Result<()> {
    println!("Property Sync - two-region convergence demo");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let log = Arc::new(MemoryLog::new());
    let region_us = demo_region("us", Arc::clone(&log))?;
    let region_eu = demo_region("eu", Arc::clone(&log))?;

    let _us_consumer = region_us.spawn_consumer_local()?;
    let _eu_consumer = region_eu.spawn_consumer_local()?;

    // 1. Local write in us: version 1 -> 2
    println!("\n[us] PUT /us/properties/500 price=2,000,000 version=1");
    let updated = region_us.handle_write(&WriteRequest {
        id: 500,
        request_id: uuid::Uuid::new_v4().to_string(),
        price: 2_000_000.0,
        expected_version: 1,
    })?;
    println!("✓ 200 OK: version={} price={}", updated.version, updated.price);

    // 2. Two writes race on the same expected version: one must lose
    println!("\n[us] two writes race with version=2");
    for price in [2_200_000.0, 2_300_000.0] {
        let result = region_us.handle_write(&WriteRequest {
            id: 500,
            request_id: uuid::Uuid::new_v4().to_string(),
            price,
            expected_version: 2,
        });
        match result {
            Ok(p) => println!("✓ 200 OK: version={} price={}", p.version, p.price),
            Err(WriteError::VersionConflict { .. }) => println!("✓ 409 Conflict (lost the race)"),
            Err(e) => return Err(e.into()),
        }
    }

    // 3. eu converges on the winning write
    print!("\n[eu] waiting for replication...");
    let deadline = Instant::now() + Duration::from_secs(5);
    let replicated = loop {
        let found = {
            let conn = region_eu.db();
            let conn = conn.lock().unwrap();
            get_property(&conn, 500)?
        };
        match found {
            Some(p) if p.version >= 3 => break p,
            _ if Instant::now() > deadline => anyhow::bail!("eu never converged"),
            _ => std::thread::sleep(Duration::from_millis(10)),
        }
    };
    println!(
        " done\n✓ [eu] id=500 version={} price={} origin={}",
        replicated.version, replicated.price, replicated.region_origin
    );
    println!("✓ [eu] replication lag: {:.3}s", region_eu.lag_seconds());

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Regions converged");
    Ok(())
}

fn demo_region(name: &str, log: Arc<MemoryLog>) -> Result<Region> {
    let conn = Connection::open_in_memory()?;
    setup_database(&conn)?;
    seed_demo_properties(&conn, name)?;
    Ok(Region::new(
        RegionConfig::new(name),
        Arc::new(Mutex::new(conn)),
        log,
    ))
}
