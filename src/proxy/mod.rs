pub mod cache;
pub mod forward_error;
pub mod headers;
pub mod http;
pub mod listener;
pub mod request;
pub mod upstream;

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::settings::Settings;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    /// `None` when caching is disabled; every request then goes straight to the origin.
    pub cache: Option<Arc<cache::CacheStore>>,
    pub limiter: Arc<Semaphore>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        cache: Option<Arc<cache::CacheStore>>,
        limiter: Arc<Semaphore>,
    ) -> Self {
        Self {
            settings,
            cache,
            limiter,
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
