use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use deskpool::config::{Config, StorageTarget};
use deskpool::engine::Engine;
use deskpool::http::{self, AppState, RouterOptions};
use deskpool::image::{DownloadUrlTemplate, HttpImageSink, ImageSink, MemoryImageSink};
use deskpool::store::{MemoryStore, PgStore, Store};
use deskpool::{loader, observability, reaper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("loading configuration")?;
    observability::init(config.metrics_port)?;

    let mut background = Vec::new();
    let store: Arc<dyn Store> = match &config.storage {
        StorageTarget::Postgres(url) => Arc::new(
            PgStore::connect(url, config.db_max_connections)
                .await
                .context("connecting to postgres")?,
        ),
        StorageTarget::Memory => Arc::new(MemoryStore::new()),
        StorageTarget::Wal(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            }
            let memory = Arc::new(
                MemoryStore::open(path).with_context(|| format!("opening WAL at {}", path.display()))?,
            );
            background.push(tokio::spawn(reaper::run_compactor(memory.clone(), config.compact_threshold)));
            memory
        }
    };
    let engine = Arc::new(Engine::new(store));

    if let Some(path) = &config.fixtures {
        loader::load_file(&engine, path).await?;
    }

    if config.reaper_enabled {
        background.push(tokio::spawn(reaper::run_reaper(engine.clone(), config.reaper_period)));
    }

    let images: Arc<dyn ImageSink> = match &config.image_sink.upload_url {
        Some(url) => Arc::new(
            HttpImageSink::new(url.clone(), config.image_sink.token.clone()).context("building image sink client")?,
        ),
        None => Arc::new(MemoryImageSink::new()),
    };
    let state = AppState {
        engine: engine.clone(),
        images,
        download_url: DownloadUrlTemplate::new(config.image_sink.download_template.clone()),
    };
    let app = http::router(
        state,
        RouterOptions {
            request_timeout: config.request_timeout,
            max_in_flight: config.max_in_flight,
        },
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!("deskpool listening on {}", config.listen_addr);
    info!("  storage: {}", redacted(&config.storage));
    info!("  reaper: {}", if config.reaper_enabled { format!("every {:?}", config.reaper_period) } else { "disabled".into() });
    info!("  max_in_flight: {}", config.max_in_flight);

    // Stop accepting on SIGTERM/ctrl-c; axum drains in-flight requests.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    for task in background {
        task.abort();
    }
    engine.close().await;
    info!("deskpool stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::error!("failed to register SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
    info!("shutdown signal received");
}

/// Storage target for logs without the connection password.
fn redacted(target: &StorageTarget) -> String {
    match target {
        StorageTarget::Postgres(url) => match url.split_once('@') {
            Some((_, host)) => format!("postgres://…@{host}"),
            None => url.clone(),
        },
        StorageTarget::Memory => "memory".into(),
        StorageTarget::Wal(path) => format!("wal:{}", path.display()),
    }
}
