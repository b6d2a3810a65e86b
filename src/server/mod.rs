//! drift-server: process wiring for the HTTP/WebSocket surface.
//!
//! Owns startup and shutdown: configuration, the database, the shared
//! component graph, the background maintenance tasks, and the listener.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod tasks;
pub mod utils;

use std::net::SocketAddr;

use clap::Parser;

use crate::dlog;
use crate::storage::Storage;

use config::{Cli, Config};
use state::AppState;

/// Entry point: parse CLI, open storage, start the server.
pub async fn run() {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    crate::logging::init();

    dlog!("drift-server starting");
    dlog!("  data directory: {}", config.data_dir.display());

    let db_path = config.data_dir.join("drift.db");
    let storage = Storage::open(&db_path).expect("failed to open database");
    dlog!("  database: {}", db_path.display());

    let media_dir = config.data_dir.join("media");
    std::fs::create_dir_all(&media_dir).expect("failed to create media directory");

    let state = AppState::new(storage, media_dir);

    tokio::spawn(tasks::rollup_loop(state.chat.clone()));
    tokio::spawn(tasks::idle_sweep_loop(state.chat.clone()));

    let app = router::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    dlog!("drift-server listening on http://{}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        dlog!("drift-server shutting down");
    })
    .await
    .expect("server error");
}
