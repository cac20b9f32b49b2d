use std::{net::IpAddr, str::FromStr, sync::Arc, time::Duration};

use axum::{
    extract::MatchedPath,
    http::Request,
    response::{Redirect, Response},
    routing::get,
    Router,
};
use client::setup_client_router;
use plugin::setup_plugin_router;
use stowage_common::MetadataStore;
use stowage_config::Config;
use stowage_core::{build_drivers, DaemonConfig, RootLock, Runtime};
use stowage_object_storage::{BackupStore, BackupTargets};
use tower_http::{classify::ServerErrorsFailureClass, trace::TraceLayer};
use tracing::{info_span, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa_scalar::{Scalar, Servable};

mod client;
mod error;
mod plugin;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

const STOWAGE_VERSION: &str = env!("CARGO_PKG_VERSION");

fn set_api_docs_info(mut openapi: utoipa::openapi::OpenApi) -> utoipa::openapi::OpenApi {
    openapi.info.title = "Stowage API".to_string();
    openapi.info.version = STOWAGE_VERSION.to_string();
    openapi.info.description = Some("Volume, snapshot and backup management".to_string());

    openapi
}

#[tokio::main(worker_threads = 8)]
async fn main() -> anyhow::Result<()> {
    let config: &Config = &stowage_config::CONFIG;
    setup_tracing(config);

    // Held until the server has drained and the last writer is done.
    let lock = RootLock::acquire(&config.root)?;
    let daemon = DaemonConfig::load_or_init(&config.root, &config.driver_list())?;
    let metadata = Arc::new(MetadataStore::open(&daemon.root)?);
    let backups = Arc::new(BackupStore::new(
        Arc::new(BackupTargets::new()),
        config.backup_chunk_size,
    ));
    let registry = build_drivers(config, &daemon, metadata.clone(), backups.clone()).await?;
    let runtime = Arc::new(
        Runtime::open(&daemon.root, metadata, registry, backups)
            .map_err(|e| anyhow::anyhow!("Failed to start: {}", e))?,
    );

    let (client_router, api_docs) = setup_client_router();
    let api_docs = set_api_docs_info(api_docs);

    let router = client_router
        .merge(setup_plugin_router())
        .merge(Scalar::with_url("/scalar/", api_docs.clone()))
        .route("/scalar", get(|| async { Redirect::to("/scalar/") }))
        .route(
            "/api/openapi.json",
            get(move || {
                let docs = api_docs.clone();
                async move { axum::Json(docs) }
            }),
        );
    let router = trace_layer(router).with_state(runtime.clone());

    let addr = std::net::SocketAddr::new(
        IpAddr::from_str(&config.host)
            .map_err(|e| anyhow::anyhow!("Failed to parse IP address from config: {}", e))?,
        config.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to address {}: {}", addr, e))?;

    tracing::info!(root = %daemon.root.display(), drivers = ?daemon.drivers, "listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server failed: {}", e))?;

    runtime.shutdown().await;
    drop(lock);
    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

fn setup_tracing(config: &Config) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // axum logs rejections from built-in extractors with the `axum::rejection`
                // target, at `TRACE` level.
                format!(
                    "stowage={},tower_http=debug,axum::rejection=trace",
                    config.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn trace_layer<T>(router: Router<T>) -> Router<T>
where
    T: Send + Sync + Clone + 'static,
{
    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &Request<_>| {
                // Matched route with placeholders left in.
                let matched_path = request
                    .extensions()
                    .get::<MatchedPath>()
                    .map(MatchedPath::as_str);

                info_span!("http_request", method = ?request.method(), matched_path)
            })
            .on_request(|_request: &Request<_>, _span: &Span| {
                tracing::debug!("Request Received.");
            })
            .on_response(|response: &Response, latency: Duration, _span: &Span| {
                tracing::info!(status = %response.status(), "Response Completed. Duration: {:?}", latency);
            })
            .on_failure(
                |error: ServerErrorsFailureClass, _latency: Duration, _span: &Span| {
                    tracing::error!(%error, "Request failed..")
                },
            ),
    )
}
