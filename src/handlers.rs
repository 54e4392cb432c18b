use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{trace, warn};

use crate::config::ServerConfig;
use crate::errors::Result;
use crate::frame_store::FrameView;
use crate::stream;
use crate::transcoder::FrameTranscoder;
use crate::AppState;

const PLACEHOLDER_WIDTH: u32 = 640;
const PLACEHOLDER_HEIGHT: u32 = 480;

pub fn router(state: AppState, cors_allow_origin: Option<&str>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/video_feed/:camera", get(video_feed_handler))
        .route("/api/cameras", get(cameras_handler))
        .layer(cors_layer(cors_allow_origin))
        .with_state(state)
}

pub fn cors_layer(origin: Option<&str>) -> CorsLayer {
    match origin {
        None | Some("*") => CorsLayer::permissive(),
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(origin_header) => CorsLayer::new()
                .allow_origin(origin_header)
                .allow_methods(Any)
                .allow_headers(Any),
            Err(_) => {
                warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                CorsLayer::permissive()
            }
        },
    }
}

/// JPEG served while a camera has no frame: the configured image file, or
/// a generated one.
pub fn load_placeholder(server: &ServerConfig) -> Result<Bytes> {
    match &server.placeholder_image {
        Some(path) => Ok(Bytes::from(std::fs::read(path)?)),
        None => FrameTranscoder::new(80).placeholder(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, "Waiting for camera"),
    }
}

pub async fn index_handler(State(state): State<AppState>) -> Html<String> {
    trace!("Index page requested");
    let mut page = String::from(
        "<html>\n  <head>\n    <title>Motion Detection</title>\n  </head>\n  <body>\n    <h1>Motion Detection</h1>\n",
    );
    for camera in state.cameras.iter() {
        page.push_str(&format!(
            "    <h2>{}</h2><br /><img src=\"/video_feed/{}\">\n",
            escape_html(&camera.description),
            escape_html(&camera.name)
        ));
    }
    page.push_str("  </body>\n</html>\n");
    Html(page)
}

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    view: Option<String>,
}

pub async fn video_feed_handler(
    Path(camera_id): Path<String>,
    Query(query): Query<FeedQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(camera) = state.cameras.iter().find(|c| c.name == camera_id) else {
        return (StatusCode::NOT_FOUND, "Camera not found").into_response();
    };

    let view = match query.view.as_deref() {
        None => FrameView::Annotated,
        Some(value) => match FrameView::parse(value) {
            Some(view) => view,
            None => return (StatusCode::BAD_REQUEST, format!("Unknown view '{}'", value)).into_response(),
        },
    };

    let view_enabled = match view {
        FrameView::Annotated => true,
        FrameView::Delta => camera.debug_views.frame_delta,
        FrameView::Threshold => camera.debug_views.threshold,
    };
    if !view_enabled {
        return (StatusCode::NOT_FOUND, format!("View '{}' is not enabled for this camera", view.as_str())).into_response();
    }

    let body = stream::frame_stream(
        state.store.clone(),
        camera.name.clone(),
        view,
        state.frame_interval,
        state.placeholder.clone(),
        state.shutdown.clone(),
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, stream::content_type())
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CameraStatus {
    pub name: String,
    pub description: String,
    pub has_frame: bool,
}

pub async fn cameras_handler(State(state): State<AppState>) -> Json<Vec<CameraStatus>> {
    let mut cameras = Vec::with_capacity(state.cameras.len());
    for camera in state.cameras.iter() {
        cameras.push(CameraStatus {
            name: camera.name.clone(),
            description: camera.description.clone(),
            has_frame: state.store.get(&camera.name).await.is_some(),
        });
    }
    Json(cameras)
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
