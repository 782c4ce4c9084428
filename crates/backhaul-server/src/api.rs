//! HTTP control plane
//!
//! Form-encoded endpoints that drive the [`ServiceRegistry`]:
//!
//! | route | result |
//! |-------|--------|
//! | `POST /expose/listen` (`service`, `port`) | token |
//! | `POST /expose/revoke` (`token`) | `ok` |
//! | `GET /expose/port?port=N` | `"<token>\n<name>\n"`, or 204 |
//! | `GET /expose/services` | JSON list of live services |
//! | `GET /-/healthz` | `ok` |

use crate::registry::{ServiceInfo, ServiceRegistry};
use axum::{
    extract::{Form, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<ServiceRegistry>,
}

#[derive(Debug, Deserialize)]
pub struct ListenForm {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub port: String,
}

#[derive(Debug, Deserialize)]
pub struct RevokeForm {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct PortQuery {
    #[serde(default)]
    pub port: String,
}

type ApiError = (StatusCode, String);

/// Parse a public port; anything outside 1..=65535 is rejected
fn parse_port(raw: &str) -> Option<u16> {
    raw.trim().parse::<u16>().ok().filter(|port| *port > 0)
}

/// Build the control plane router
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/expose/listen", post(listen))
        .route("/expose/revoke", post(revoke))
        .route("/expose/port", get(lookup_port))
        .route("/expose/services", get(list_services))
        .route("/-/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the control plane until the listener fails
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Control API listening on http://{}", addr);
    }
    axum::serve(listener, create_app(state)).await
}

async fn listen(
    State(state): State<Arc<AppState>>,
    Form(form): Form<ListenForm>,
) -> Result<String, ApiError> {
    let Some(port) = parse_port(&form.port) else {
        return Err((StatusCode::BAD_REQUEST, "invalid port".to_string()));
    };

    info!(service = %form.service, port, "Listen requested");

    match state.registry.listen(&form.service, port).await {
        Ok(service) => Ok(service.token().to_string()),
        Err(e) => {
            error!(service = %form.service, port, "Listen failed: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

async fn revoke(State(state): State<Arc<AppState>>, Form(form): Form<RevokeForm>) -> &'static str {
    state.registry.revoke(&form.token, true).await;
    "ok"
}

async fn lookup_port(State(state): State<Arc<AppState>>, Query(query): Query<PortQuery>) -> Response {
    let found = parse_port(&query.port).and_then(|port| state.registry.lookup_port(port));
    match found {
        Some((token, name)) => format!("{}\n{}\n", token, name).into_response(),
        None => {
            debug!(port = %query.port, "Nothing listening on port");
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

async fn list_services(State(state): State<Arc<AppState>>) -> Json<Vec<ServiceInfo>> {
    Json(state.registry.services())
}

async fn healthz() -> &'static str {
    "ok"
}
