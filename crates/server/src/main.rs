use std::{net::SocketAddr, sync::Arc};

use axum::{
    routing::{get, post},
    Router,
};
use pubsub::InProcessBroker;
use server_api::ApiContext;
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod http;
mod ws;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let broker = InProcessBroker::new();
    let api = ApiContext::new(storage, Arc::new(broker.clone()));
    let state = AppState {
        api,
        broker,
        transport_capacity: settings.transport_capacity,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(http::healthz))
        .route("/login", post(http::http_login))
        .route("/rooms", get(http::http_list_rooms))
        .route("/rooms/:room_id/messages", get(http::http_list_messages))
        .route(
            "/rooms/:room_id/participants",
            get(http::http_list_participants),
        )
        .route("/messages", post(http::http_send_message))
        .route("/messages/:message_id/thread", get(http::http_list_thread))
        .route(
            "/messages/:message_id/reactions",
            post(http::http_add_reaction).delete(http::http_remove_reaction),
        )
        .route("/read_state", post(http::http_mark_read))
        .route("/unread", get(http::http_unread_counts))
        .route("/dms", post(http::http_create_dm))
        .route("/groups", post(http::http_create_group))
        .route("/ws", get(ws::ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
