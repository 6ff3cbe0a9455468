use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use contracts::AssetInfo;
use holdings_api::{serve, AppState, SqliteStore};
use holdings_core::{
    AssetCatalog, LedgerStore, ManualClock, MemoryStore, StoreError, SystemClock,
    TransactionEngine,
};
use serde_json::json;

fn print_usage() {
    println!("holdings-cli <command>");
    println!("commands:");
    println!("  serve [addr] [sqlite_path]");
    println!("    default addr: 127.0.0.1:8080");
    println!("  seed [sqlite_path] [count]");
    println!("    inserts <count> map assets (default 120), skipping existing ones");
    println!("  add-user <id> <display_name> [sqlite_path]");
    println!("  demo");
    println!("    scripted purchase/claim/upgrade/sell walkthrough on an in-memory store");
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_socket_addr(value: Option<&String>) -> Result<SocketAddr, String> {
    let raw = value.map(String::as_str).unwrap_or("127.0.0.1:8080");
    raw.parse::<SocketAddr>()
        .map_err(|_| format!("invalid addr: {raw}"))
}

fn default_sqlite_path() -> String {
    std::env::var("HOLDINGS_SQLITE_PATH")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "holdings.sqlite".to_string())
}

fn parse_sqlite_path(value: Option<&String>) -> String {
    value
        .map(String::to_string)
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(default_sqlite_path)
}

/// Asset generator matching the map client's expectations: a grid of small
/// rectangular parcels offset from a base coordinate, with price and yield
/// derived from the parcel index.
fn seed_asset(i: i64) -> AssetInfo {
    const BASE_LNG: f64 = 12.6371;
    const BASE_LAT: f64 = 43.7267;
    const STEP_LNG: f64 = 0.00012;
    const STEP_LAT: f64 = 0.00009;

    let dx = (i % 10) as f64 * STEP_LNG;
    let dy = (i / 10) as f64 * STEP_LAT;
    let west = BASE_LNG + dx;
    let south = BASE_LAT + dy;
    let east = west + STEP_LNG;
    let north = south + STEP_LAT;

    AssetInfo {
        id: format!("parcel-{:03}", i + 1),
        name: format!("Parcel {:03}", i + 1),
        base_price: 900 + i * 7,
        hourly_yield: 20 + (i % 9),
        geometry: json!({
            "type": "Polygon",
            "coordinates": [[
                [west, south],
                [east, south],
                [east, north],
                [west, north],
                [west, south],
            ]],
        }),
    }
}

fn run_seed(args: &[String]) -> Result<(), String> {
    let sqlite_path = parse_sqlite_path(args.get(2));
    let count = args
        .get(3)
        .map(|value| {
            value
                .parse::<i64>()
                .map_err(|_| format!("invalid count: {value}"))
        })
        .transpose()?
        .unwrap_or(120);

    let store =
        SqliteStore::open(&sqlite_path).map_err(|err| format!("failed to open store: {err}"))?;

    let mut inserted = 0;
    let mut skipped = 0;
    for i in 0..count {
        match store.insert_asset(&seed_asset(i)) {
            Ok(()) => inserted += 1,
            Err(StoreError::AssetExists(_)) => skipped += 1,
            Err(err) => return Err(format!("failed to insert asset {i}: {err}")),
        }
    }

    println!("seeded inserted={inserted} skipped={skipped} sqlite={sqlite_path}");
    Ok(())
}

fn run_add_user(args: &[String]) -> Result<(), String> {
    let user_id = args.get(2).ok_or_else(|| "missing id".to_string())?;
    let display_name = args
        .get(3)
        .ok_or_else(|| "missing display_name".to_string())?;
    let sqlite_path = parse_sqlite_path(args.get(4));

    let store =
        SqliteStore::open(&sqlite_path).map_err(|err| format!("failed to open store: {err}"))?;
    let account = store
        .create_user(user_id, display_name)
        .map_err(|err| format!("failed to create user: {err}"))?;

    println!(
        "created user id={} name={} balance={} sqlite={}",
        account.id, account.display_name, account.balance, sqlite_path
    );
    Ok(())
}

/// Offline walkthrough of the four operations against an in-memory store,
/// with a manual clock so the yield window is deterministic.
fn run_demo() -> Result<(), String> {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = TransactionEngine::new(store.clone(), clock.clone());

    store
        .create_user("demo", "Demo Player")
        .map_err(|err| err.to_string())?;
    store
        .insert_asset(&seed_asset(0))
        .map_err(|err| err.to_string())?;
    let asset_id = "parcel-001";

    engine
        .purchase("demo", asset_id)
        .map_err(|err| err.to_string())?;
    let balance = |label: &str| -> Result<(), String> {
        let account = store
            .user("demo")
            .map_err(|err| err.to_string())?
            .ok_or_else(|| "demo user vanished".to_string())?;
        println!("{label}: balance={}", account.balance);
        Ok(())
    };
    balance("purchased parcel-001 for 900")?;

    clock.advance_secs(3600);
    let earned = engine
        .claim_yield("demo", asset_id)
        .map_err(|err| err.to_string())?;
    println!("claimed one hour of yield: earned={earned}");
    balance("after claim")?;

    let new_level = engine
        .upgrade("demo", asset_id)
        .map_err(|err| err.to_string())?;
    println!("upgraded to level {new_level}");
    balance("after upgrade")?;

    clock.advance_secs(3600);
    let earned = engine
        .claim_yield("demo", asset_id)
        .map_err(|err| err.to_string())?;
    println!("claimed one hour at level {new_level}: earned={earned}");

    let amount = engine
        .sell("demo", asset_id)
        .map_err(|err| err.to_string())?;
    println!("sold parcel-001 for {amount}");
    balance("final")?;

    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str);

    match command {
        Some("serve") => {
            let addr = match parse_socket_addr(args.get(2)) {
                Ok(addr) => addr,
                Err(err) => {
                    eprintln!("error: {err}");
                    print_usage();
                    std::process::exit(2);
                }
            };
            let sqlite_path = parse_sqlite_path(args.get(3));

            let store = match SqliteStore::open(&sqlite_path) {
                Ok(store) => Arc::new(store),
                Err(err) => {
                    eprintln!("failed to open store at {sqlite_path}: {err}");
                    std::process::exit(1);
                }
            };
            let state = AppState::new(store, Arc::new(SystemClock));

            println!("serving holdings api on http://{addr} (sqlite={sqlite_path})");
            if let Err(err) = serve(addr, state).await {
                eprintln!("server error: {err}");
                std::process::exit(1);
            }
        }
        Some("seed") => {
            if let Err(err) = run_seed(&args) {
                eprintln!("error: {err}");
                print_usage();
                std::process::exit(2);
            }
        }
        Some("add-user") => {
            if let Err(err) = run_add_user(&args) {
                eprintln!("error: {err}");
                print_usage();
                std::process::exit(2);
            }
        }
        Some("demo") => {
            if let Err(err) = run_demo() {
                eprintln!("demo failed: {err}");
                std::process::exit(1);
            }
        }
        _ => {
            print_usage();
        }
    }
}
