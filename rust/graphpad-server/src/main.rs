//! graphpad-server binary.
//!
//! Usage:
//!   cargo run -p graphpad-server
//!   # Listens on ws://127.0.0.1:9040
//!
//! Configuration comes from GRAPHPAD_* environment variables; see
//! `config.rs` for the full list and defaults.

use std::sync::Arc;

use log::info;
use tokio::net::TcpListener;

use graphpad_server::compress::Compression;
use graphpad_server::db::Database;
use graphpad_server::{CollabServer, Config, net};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Arc::new(Config::from_env());
    info!(
        "graphpad-server starting: bind={}, protocol_version={}, db={}, max_rooms={}, max_clients_per_room={}",
        config.bind_addr,
        config.protocol_version,
        config.db_path,
        config.max_rooms,
        config.max_clients_per_room
    );

    let db = Arc::new(Database::open(&config.db_path).expect("Failed to open database"));
    let compression = Arc::new(Compression::lz4(config.compression_threshold));
    let server = CollabServer::new(config.clone(), db, compression);
    server.start_maintenance();

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind");
    info!("graphpad-server listening on ws://{}", config.bind_addr);

    tokio::select! {
        _ = net::serve(listener, server.clone()) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received");
        }
    }

    // final dirty snapshots are written as rooms dispose
    server.shutdown();
}
