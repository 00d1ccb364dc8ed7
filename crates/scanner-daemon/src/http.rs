use crate::core::DaemonEvent;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use scanner_proto::protocol::{Command, DaemonState};
use scanner_proto::state::StateManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state_manager, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(state_manager: Arc<StateManager>, event_tx: mpsc::Sender<DaemonEvent>) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/feeds/:idx", post(select_feed))
        .route("/api/scanner/toggle", post(scanner_toggle))
        .route("/api/scanner/volume/:value", post(scanner_volume))
        .route("/api/ambient/mode/:mode", post(switch_mode))
        .route("/api/ambient/toggle", post(ambient_toggle))
        .route("/api/ambient/next", post(ambient_next))
        .route("/api/ambient/prev", post(ambient_prev))
        .route("/api/ambient/volume/:value", post(ambient_volume))
        .route("/api/shutdown", post(shutdown))
        // The UI page is served from elsewhere.
        .layer(CorsLayer::permissive())
        .with_state(HttpState {
            state_manager,
            event_tx,
        })
}

async fn send(state: &HttpState, event: DaemonEvent) -> StatusCode {
    if state.event_tx.send(event).await.is_err() {
        error!("HTTP API: daemon event channel closed");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

async fn command(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    send(state, DaemonEvent::ClientCommand(cmd)).await
}

async fn get_state(State(state): State<HttpState>) -> Json<DaemonState> {
    Json(state.state_manager.get_state().await)
}

async fn select_feed(State(state): State<HttpState>, Path(idx): Path<usize>) -> StatusCode {
    command(&state, Command::SelectFeed { index: idx }).await
}

async fn scanner_toggle(State(state): State<HttpState>) -> StatusCode {
    command(&state, Command::TogglePlayback).await
}

async fn scanner_volume(State(state): State<HttpState>, Path(value): Path<u32>) -> StatusCode {
    let value = value.min(100) as u8;
    command(&state, Command::ScannerVolume { value }).await
}

async fn switch_mode(State(state): State<HttpState>, Path(mode): Path<String>) -> StatusCode {
    command(&state, Command::SwitchMode { mode }).await
}

async fn ambient_toggle(State(state): State<HttpState>) -> StatusCode {
    command(&state, Command::AmbientToggle).await
}

async fn ambient_next(State(state): State<HttpState>) -> StatusCode {
    command(&state, Command::AmbientNext).await
}

async fn ambient_prev(State(state): State<HttpState>) -> StatusCode {
    command(&state, Command::AmbientPrev).await
}

async fn ambient_volume(State(state): State<HttpState>, Path(value): Path<u32>) -> StatusCode {
    let value = value.min(100) as u8;
    command(&state, Command::AmbientVolume { value }).await
}

async fn shutdown(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: shutdown");
    send(&state, DaemonEvent::Shutdown).await
}
