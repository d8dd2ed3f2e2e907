pub mod cli;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tracing::info;

use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let app = build_app(settings);
    if let Some(addr) = app.settings.metrics_listen {
        let path = "/metrics".to_string();
        tokio::spawn(async move {
            info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, path).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }
    let served = app.clone();
    let result = tokio::select! {
        result = proxy::run(served) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("shutdown requested");
            Ok(())
        }
    };
    release_cache(&app);
    result
}

/// Drops every cached entry. In-flight fetches without readers stop at their next append.
pub fn release_cache(app: &proxy::AppContext) {
    if let Some(store) = app.cache.as_ref() {
        let entries = store.len();
        let resident = store.total_size();
        store.clear();
        info!(entries, resident, "response cache released");
    }
}

/// Builds the shared application state and starts the cache sweeper when caching is enabled.
pub fn build_app(settings: Settings) -> proxy::AppContext {
    let settings = Arc::new(settings);
    let cache = if settings.cache_enabled {
        let store = Arc::new(proxy::cache::CacheStore::new(
            settings.cache_total_capacity,
        ));
        proxy::cache::spawn_sweeper(
            store.clone(),
            settings.cache_sweeper_interval(),
            settings.sweep_policy(),
        );
        info!(
            capacity = settings.cache_total_capacity,
            max_entry_size = settings.cache_max_entry_size,
            evict_percent = settings.cache_evict_percent,
            "response cache enabled"
        );
        Some(store)
    } else {
        info!("response cache disabled");
        None
    };
    let limiter = Arc::new(Semaphore::new(settings.max_connections));
    proxy::AppContext::new(settings, cache, limiter)
}
