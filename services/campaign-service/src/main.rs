mod app;
mod db;
mod error;
mod handlers;
mod models;
mod service;
mod state;
mod store;
mod template;
mod transport;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use outreach_common::{bind_listener, env_or, init_tracing, shutdown_signal};
use tokio_postgres::NoTls;

use crate::db::PgStore;
use crate::state::AppState;
use crate::store::{MemStore, Store};
use crate::transport::{HttpTransport, LogTransport, Transport};

#[tokio::main]
async fn main() {
    let _guards = init_tracing("campaign-service");

    let port = env_or("PORT", 8080u16);
    let stream_interval = env_or("LIVE_UPDATE_INTERVAL_MS", 5000u64);
    let process_interval = env_or("PROCESS_INTERVAL_SECS", 60u64);
    let batch_size = env_or("QUEUE_BATCH_SIZE", 50i64);
    let send_delay = env_or("SEND_DELAY_MS", 200u64);
    let send_timeout = env_or("SEND_TIMEOUT_MS", 15_000u64);

    let store = build_store().await;
    let transport = build_transport();

    let (updates, _) = tokio::sync::broadcast::channel(32);
    let state = AppState {
        store,
        transport,
        updates,
        stream_interval: Duration::from_millis(stream_interval),
        batch_size,
        send_delay: Duration::from_millis(send_delay),
        send_timeout: Duration::from_millis(send_timeout),
    };

    tokio::spawn(worker::run(
        state.clone(),
        Duration::from_secs(process_interval),
    ));

    let app = app::build_router(state);
    let listener = bind_listener(port).await;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("serve");
}

async fn build_store() -> Arc<dyn Store> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        tracing::warn!("DATABASE_URL not set, using in-memory store");
        return Arc::new(MemStore::new());
    };

    let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
        .await
        .expect("connect db");
    tokio::spawn(async move {
        // Drive the connection in the background.
        if let Err(err) = connection.await {
            tracing::error!(error = %err, "database connection error");
        }
    });

    db::init_schema(&client).await.expect("init schema");
    Arc::new(PgStore::new(client))
}

fn build_transport() -> Arc<dyn Transport> {
    match HttpTransport::from_env() {
        Some(transport) => Arc::new(transport),
        None => {
            tracing::warn!("MAIL_API_URL not set, deliveries are dry-run only");
            Arc::new(LogTransport)
        }
    }
}
