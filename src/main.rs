use std::sync::Arc;

use anyhow::Context;
use axum::{extract::DefaultBodyLimit, Extension, Router};
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::{limit::RequestBodyLimitLayer, services::ServeDir};

use board_sync::{
    config::Config,
    db::SqliteStore,
    realtime::Hub,
    routes,
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().init();

    let cfg = Config::from_env()?;
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&cfg.database_url)
        .await
        .with_context(|| format!("opening {}", cfg.database_url))?;

    let hub = Hub::new();
    let store = SqliteStore::new(pool, &cfg.sync).with_change_feed(hub.clone());
    store.bootstrap().await?;

    let app_state = AppState { store: Arc::new(store), hub: hub.clone(), sync: cfg.sync.clone() };

    let app = Router::new()
        .merge(routes::router())
        .fallback_service(ServeDir::new(&cfg.static_dir))
        .layer(Extension(app_state))
        .layer(DefaultBodyLimit::max(cfg.body_limit))
        .layer(RequestBodyLimitLayer::new(cfg.body_limit));

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    tracing::info!(addr = %cfg.bind_addr, "board listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;
    tracing::info!("board stopped");
    Ok(())
}

/// Ctrl-C ends the server; live viewers see their channel close.
async fn shutdown_signal(hub: Hub) {
    let _ = tokio::signal::ctrl_c().await;
    hub.shutdown();
}
