//! Thin external HTTP/SSE boundary (component K). Consumes the bus like
//! any other subscriber; no aggregation or session-lifecycle logic lives
//! here.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bus::{EventBus, Mode};
use crate::config::Config;
use crate::model::{Message, TOPIC_ACCIDENTS_CLOSE, TOPIC_ACCIDENTS_OPEN};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
}

pub async fn run_server(config: Arc<Config>, bus: Arc<EventBus>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.bind_ip, config.server.web_port);
    let state = AppState { config, bus };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/config", get(config_handler))
        .route("/events/:camera_id", get(events_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(%addr, "starting HTTP boundary");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct ConfigResponse {
    cameras: Vec<String>,
    target_fps: f64,
    batch_size: usize,
    decision_threshold: f32,
}

async fn config_handler(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        cameras: state.config.camera_ids().map(str::to_string).collect(),
        target_fps: state.config.resampler.target_fps,
        batch_size: state.config.engine.batch_size,
        decision_threshold: state.config.engine.decision_threshold,
    })
}

/// Forwards `accidents.open:{camera_id}` / `accidents.close:{camera_id}`
/// as server-sent events, serialized bit-exact to the event shape.
async fn events_handler(
    Path(camera_id): Path<String>,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let topics = [
        format!("{TOPIC_ACCIDENTS_OPEN}:{camera_id}"),
        format!("{TOPIC_ACCIDENTS_CLOSE}:{camera_id}"),
    ];
    let (sub, guard) = state
        .bus
        .subscribe_many(&[topics[0].as_str(), topics[1].as_str()], Mode::Fifo, 64);

    let stream = stream::unfold((sub, guard), |(sub, guard)| async move {
        loop {
            match sub.recv().await {
                Some(Message::AccidentOpen(event)) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    return Some((Ok(Event::default().event("accident_open").data(data)), (sub, guard)));
                }
                Some(Message::AccidentClose(event)) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    return Some((Ok(Event::default().event("accident_close").data(data)), (sub, guard)));
                }
                Some(Message::Eos) | None => return None,
                Some(_) => continue,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
