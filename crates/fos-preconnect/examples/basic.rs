//! Example: Pre-connecting a page's subresource hosts
//!
//! Loads a page twice against a local listener. The first load teaches the
//! history which host the page fetches from, the second pre-connects to it.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fos_preconnect::{
    HistoryRegistry, IdleConnectionCache, JsonFileStore, PreconnectConfig, PreconnectManager,
    WorkerSlots,
};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .init();

    let config = PreconnectConfig::from_env();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(JsonFileStore::new(dir.path().join("preconnect.json")));
    let registry = HistoryRegistry::new(store, config.history);
    let pool = Arc::new(IdleConnectionCache::default());
    let workers = WorkerSlots::new(config.max_workers);

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let cdn = listener.local_addr()?.to_string();

    let mut tab = PreconnectManager::new(&registry, Arc::clone(&workers), pool.clone(), config);

    for load in 1..=2 {
        tab.on_load_started("http://example.com/");
        for _ in 0..3 {
            tab.on_resource_load(&format!("http://{}/asset.js", cdn));
        }

        thread::sleep(Duration::from_millis(200));
        tab.on_load_finished();

        println!("Load {}: {} pre-connected connections idle", load, pool.len());
    }

    tab.on_destroy();
    workers.shutdown();

    println!("fOS Pre-connect v{} done", fos_preconnect::VERSION);
    Ok(())
}
