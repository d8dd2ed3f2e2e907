use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use fanout_proxy::{
    build_app,
    cli::LogFormat,
    proxy::{self, cache::CacheStore},
    settings::Settings,
};

fn default_test_settings(listen: SocketAddr) -> Settings {
    let mut settings = Settings::with_defaults(listen);
    settings.log = LogFormat::Text;
    settings.client_timeout = 5;
    settings.upstream_connect_timeout = 2;
    settings.upstream_timeout = 5;
    settings.cache_max_entry_size = 10 * 1024 * 1024;
    settings.cache_total_capacity = 64 * 1024 * 1024;
    settings.cache_sweeper_interval = 300;
    settings
}

pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    pub cache: Option<Arc<CacheStore>>,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    /// Opens a connection and sends `request` on it.
    pub async fn send(&self, request: &str) -> Result<TcpStream> {
        let mut stream = self.connect().await?;
        stream.write_all(request.as_bytes()).await?;
        Ok(stream)
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        self.cache.as_ref().expect("harness started with caching enabled")
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

#[derive(Default)]
pub struct ProxyHarnessBuilder {
    settings_override: Option<Box<dyn FnOnce(&mut Settings) + Send>>,
}

impl ProxyHarnessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.settings_override = Some(Box::new(func));
        self
    }

    pub async fn spawn(mut self) -> Result<ProxyHarness> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;

        let mut settings = default_test_settings(addr);
        if let Some(override_fn) = self.settings_override.take() {
            override_fn(&mut settings);
        }
        settings.listen = addr;
        settings.validate()?;

        let app = build_app(settings);
        let settings = app.settings.clone();
        let cache = app.cache.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = proxy::listener::serve(listener, app).await {
                tracing::error!(error = ?err, "proxy listener failed");
            }
        });

        Ok(ProxyHarness {
            addr,
            settings,
            cache,
            handle,
        })
    }
}
