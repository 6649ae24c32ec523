//! Basic usage example of the query cache.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use swr_kit::{error::Result, IsEmpty, QueryCache, QueryOptions, Signal};

/// Example data: Employment
#[derive(Clone, Serialize, Deserialize, Debug)]
struct Employment {
    id: String,
    employer_name: String,
    salary: f64,
}

impl IsEmpty for Employment {}

/// Mock repository that simulates slow database access
async fn fetch_employment(id: &str) -> std::result::Result<Employment, String> {
    println!("  [DB] Fetching employment: {}", id);
    tokio::time::sleep(Duration::from_millis(50)).await;

    match id {
        "emp_001" => Ok(Employment {
            id: id.to_string(),
            employer_name: "Acme Corp".to_string(),
            salary: 75000.0,
        }),
        "emp_002" => Ok(Employment {
            id: id.to_string(),
            employer_name: "Tech Inc".to_string(),
            salary: 95000.0,
        }),
        _ => Err(format!("employment {} not found", id)),
    }
}

fn fetcher(
    id: &'static str,
) -> impl Fn() -> futures::future::BoxFuture<'static, std::result::Result<Employment, String>>
       + Send
       + Sync
       + 'static {
    use futures::FutureExt;
    move || fetch_employment(id).boxed()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== SWR Kit - Basic Example ===\n");

    // 1. Create the cache
    println!("1. Creating query cache...");
    let cache: QueryCache<Employment, String> = QueryCache::from_env()?;
    println!("   ✓ Cache ready ({:?})\n", cache.config());

    // 2. First subscriber - empty entry, fetch starts in the background
    println!("2. First subscriber for emp_001:");
    let first = cache.subscribe(
        "emp_001",
        fetcher("emp_001"),
        QueryOptions::new().on_update(|emp: &Employment| {
            println!("   → update: {} (${:.2})", emp.employer_name, emp.salary)
        }),
    )?;
    println!("   loading: {}", first.is_loading());
    tokio::time::sleep(Duration::from_millis(100)).await;
    if let Some(emp) = first.data() {
        println!("   ✓ Employment loaded: {} from {}\n", emp.employer_name, emp.id);
    }

    // 3. Second subscriber - served from cache, no new fetch inside the dedupe window
    println!("3. Second subscriber for the same key:");
    let second = cache.subscribe("emp_001", fetcher("emp_001"), QueryOptions::new())?;
    if let Some(emp) = second.data() {
        println!("   ✓ Served from cache: {} (${:.2})\n", emp.employer_name, emp.salary);
    }

    // 4. Errors stay in the entry
    println!("4. Subscriber for a missing employment:");
    let missing = cache.subscribe("emp_404", fetcher("emp_404"), QueryOptions::new())?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("   ✓ Error kept in state: {:?}\n", missing.error());

    // 5. Reactive key - switch entries without re-subscribing
    println!("5. Reactive key:");
    let key = Signal::new(Some("emp_001".to_string()));
    let source = key.clone();
    let reactive = cache.subscribe(
        &key,
        move || {
            let id = source.get().unwrap_or_default();
            async move { fetch_employment(&id).await }
        },
        QueryOptions::new().with_deduping_interval(Duration::ZERO),
    )?;
    println!("   key: {:?}, data: {:?}", reactive.key(), reactive.data().map(|e| e.id));
    key.set(Some("emp_002".to_string()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!(
        "   ✓ Switched to {:?}: {:?}\n",
        reactive.key(),
        reactive.data().map(|e| e.employer_name)
    );

    // 6. Inspect the cache
    println!("6. Cache contents:");
    let mut keys = cache.keys();
    keys.sort();
    for key in keys {
        if let Some(snapshot) = cache.snapshot(&key) {
            println!(
                "   {} → data: {}, error: {}, listeners: {}",
                key,
                snapshot.data.is_some(),
                snapshot.error.is_some(),
                snapshot.listener_count
            );
        }
    }

    println!("\n=== Example Complete ===\n");

    Ok(())
}
