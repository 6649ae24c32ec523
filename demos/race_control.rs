//! Race control example: only the latest run of a request settles.

use std::time::Duration;
use swr_kit::{error::Result, Request, RequestOptions, Signal};

/// Mock search endpoint; shorter queries take longer to answer.
async fn search(query: String) -> std::result::Result<Vec<String>, String> {
    let delay = 200u64.saturating_sub(query.len() as u64 * 40);
    println!("  [API] Searching {:?} ({}ms)", query, delay);
    tokio::time::sleep(Duration::from_millis(delay)).await;

    if query.is_empty() {
        return Err("empty query".to_string());
    }
    Ok(vec![format!("{} one", query), format!("{} two", query)])
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== SWR Kit - Race Control Example ===\n");

    // 1. Manual request
    println!("1. Creating manual search request...");
    let request = Request::new(
        search,
        RequestOptions::new()
            .on_success(|hits: &Vec<String>| println!("   → success: {:?}", hits))
            .on_error(|err: &String| println!("   → error: {}", err))
            .on_finally(|| println!("   → finally")),
    )?;
    println!("   ✓ Request ready\n");

    // 2. Type-ahead: each keystroke supersedes the previous run
    println!("2. Typing \"rus\" (three runs, only the last settles):");
    let slow = tokio::spawn(request.run("r".to_string()));
    let slower = tokio::spawn(request.run("ru".to_string()));
    let hits = request.run("rus".to_string()).await;
    println!("   ✓ Latest result: {:?}", hits);
    tokio::time::sleep(Duration::from_millis(250)).await;
    println!(
        "   ✓ Superseded runs still pending: {}\n",
        !slow.is_finished() && !slower.is_finished()
    );
    slow.abort();
    slower.abort();

    // 3. Cancel
    println!("3. Cancelling an in-flight run:");
    let pending = tokio::spawn(request.run("cancel me".to_string()));
    request.cancel();
    tokio::time::sleep(Duration::from_millis(250)).await;
    println!("   ✓ loading: {}, data unchanged: {:?}\n", request.loading(), request.data());
    pending.abort();

    // 4. Ready-gated automatic runs
    println!("4. Auto-run gated on a ready signal:");
    let ready = Signal::new(false);
    let gated = Request::new(
        search,
        RequestOptions::new()
            .manual(false)
            .with_ready(ready.clone())
            .with_default_params("tokio".to_string()),
    )?;
    println!("   not ready yet, loading: {}", gated.loading());
    ready.set(true);
    tokio::time::sleep(Duration::from_millis(250)).await;
    println!("   ✓ Ran once ready: {:?}\n", gated.data());

    println!("=== Example Complete ===\n");

    Ok(())
}
