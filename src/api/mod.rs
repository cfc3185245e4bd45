pub mod error;
mod handlers;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::broker::Broker;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
}

/// Build the broker's HTTP surface: a liveness probe and the WebSocket
/// terminal endpoint. Tests construct a [`Broker`] directly and call this;
/// nothing here reaches for globals.
pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/ws", get(handlers::ws_terminal))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { broker })
}
