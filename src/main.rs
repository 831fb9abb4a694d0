use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::Method;
use dotenvy::dotenv;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadenza::config::{Config, StorageMode};
use cadenza::handlers::{self, AppState};
use cadenza::services::backend::MediaBackend;
use cadenza::services::downloads::DownloadCoordinator;
use cadenza::services::library::LibraryIndex;
use cadenza::services::playlists::PlaylistWriter;
use cadenza::services::providers;
use cadenza::services::search::SearchService;
use cadenza::services::sweeper::CacheSweeper;
use cadenza::services::tagger::MetadataTagger;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // A hard configuration error is a non-zero exit; everything else
    // degrades with a warning.
    let config = Arc::new(Config::from_env().context("configuration error")?);

    std::fs::create_dir_all(&config.library_root).with_context(|| {
        format!("library root {} is not usable", config.library_root.display())
    })?;

    let provider = providers::create_provider(&config);
    info!("using provider '{}'", provider.name());

    let backend = match &config.backend_url {
        Some(url) => {
            let backend = Arc::new(MediaBackend::new(url.clone(), config.backend_kind));
            match backend.probe().await {
                Ok(()) => info!("media backend at {} is reachable", url),
                Err(e) => warn!("media backend at {} is not responding ({}); continuing provider-only", url, e),
            }
            Some(backend)
        }
        None => {
            warn!("no BACKEND_URL configured; serving the provider catalog only");
            None
        }
    };

    let library = Arc::new(LibraryIndex::new(config.library_root.clone()));
    let tagger = Arc::new(MetadataTagger::new());
    let downloads = Arc::new(DownloadCoordinator::new(
        provider.clone(),
        library.clone(),
        tagger,
        config.clone(),
    ));
    let search = Arc::new(SearchService::new(
        provider.clone(),
        backend.clone(),
        config.explicit_filter,
    ));
    let playlists = Arc::new(PlaylistWriter::new(
        config.playlists_dir.clone(),
        config.library_root.clone(),
    ));

    if config.storage_mode == StorageMode::Cache {
        Arc::new(CacheSweeper::new(library.clone(), config.cache_ttl_hours)).spawn();
    }

    if !provider.is_available().await {
        warn!("provider '{}' failed its availability check; downloads may not work", provider.name());
    }

    let state = AppState {
        config: config.clone(),
        provider,
        backend,
        library,
        downloads,
        search,
        playlists,
    };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
        .allow_origin(Any);

    let app = handlers::router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    );

    let address = format!("{}:{}", config.server_host, config.server_port);
    info!("cadenza listening on {}", address);

    let listener = tokio::net::TcpListener::bind(&address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
