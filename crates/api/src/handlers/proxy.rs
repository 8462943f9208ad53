//! Passthrough of everything the relay does not handle itself.
//!
//! HTTP requests are forwarded to the backend with the caller's method,
//! path, query, headers and body, and the backend response is streamed
//! back. `/ws` is bridged frame by frame to the backend's `/ws`.

use axum::body::Body;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, RawQuery, Request, State};
use axum::http::{HeaderMap, HeaderName};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as BackendMessage;

use crate::error::{AppError, AppResult};
use crate::middleware::api_key::{key_matches, RequireApiKey, API_KEY_HEADER};
use crate::state::AppState;

/// Largest request body forwarded to the backend.
const MAX_FORWARD_BODY: usize = 256 * 1024 * 1024;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request headers dropped in addition to the hop-by-hop set.
const STRIPPED_REQUEST_HEADERS: &[&str] = &["host", "content-length", API_KEY_HEADER];

/// Fallback for any path/method: forward verbatim to the backend.
pub async fn passthrough(
    _key: RequireApiKey,
    State(state): State<AppState>,
    request: Request,
) -> AppResult<Response> {
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    forward(&state, request, &target).await
}

/// POST /upload
///
/// Forwards the multipart body unchanged to the backend's image upload.
pub async fn upload(
    _key: RequireApiKey,
    State(state): State<AppState>,
    request: Request,
) -> AppResult<Response> {
    forward(&state, request, "/upload/image").await
}

async fn forward(state: &AppState, request: Request, target: &str) -> AppResult<Response> {
    let (parts, body) = request.into_parts();
    let url = format!("{}{}", state.config.comfy_base_url, target);

    let body = axum::body::to_bytes(body, MAX_FORWARD_BODY)
        .await
        .map_err(|e| AppError::BadRequest(format!("Failed to read request body: {e}")))?;

    let upstream = state
        .http
        .request(parts.method.clone(), &url)
        .headers(forwardable(&parts.headers, STRIPPED_REQUEST_HEADERS))
        .body(body)
        .send()
        .await
        .map_err(|e| AppError::BadGateway(format!("Backend request failed: {e}")))?;

    tracing::debug!(
        method = %parts.method,
        url = %url,
        status = upstream.status().as_u16(),
        "Forwarded request to backend",
    );

    let mut response = Response::builder().status(upstream.status());
    if let Some(headers) = response.headers_mut() {
        headers.extend(forwardable(upstream.headers(), &[]));
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| AppError::InternalError(format!("Failed to build proxied response: {e}")))
}

/// Copy `headers` minus hop-by-hop headers and `extra`.
fn forwardable(headers: &HeaderMap, extra: &[&str]) -> HeaderMap {
    let dropped = |name: &HeaderName| {
        let name = name.as_str();
        HOP_BY_HOP.contains(&name) || extra.contains(&name)
    };

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !dropped(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// WebSocket bridge
// ---------------------------------------------------------------------------

/// GET /ws?token=<key>
///
/// Query parameters other than `token` are passed on to the backend. A
/// bad token closes the socket with code 1008 (policy violation).
pub async fn ws_passthrough(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let token = params
        .iter()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.as_str());
    let authorized = key_matches(&state.config, token);

    let target = match raw_query.as_deref().map(without_token).filter(|q| !q.is_empty()) {
        Some(query) => format!("{}/ws?{query}", state.config.comfy_ws_url),
        None => format!("{}/ws", state.config.comfy_ws_url),
    };

    ws.on_upgrade(move |socket| async move {
        if authorized {
            bridge(socket, target).await;
        } else {
            reject(socket).await;
        }
    })
}

/// Drop `token=...` pairs from a raw query string.
fn without_token(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| !pair.is_empty() && pair.split('=').next() != Some("token"))
        .collect::<Vec<_>>()
        .join("&")
}

async fn reject(mut socket: WebSocket) {
    tracing::warn!("Rejected WebSocket passthrough: invalid token");
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: "Invalid token".into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Relay frames both ways until either side closes.
async fn bridge(mut client: WebSocket, target: String) {
    let upstream = match connect_async(target.as_str()).await {
        Ok((upstream, _response)) => upstream,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to open backend WebSocket");
            let _ = client.send(Message::Close(None)).await;
            return;
        }
    };
    tracing::info!("WebSocket passthrough connected");

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let to_backend = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let forwarded = match msg {
                Message::Text(text) => BackendMessage::Text(text.as_str().to_owned()),
                Message::Binary(data) => BackendMessage::Binary(data.to_vec()),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if upstream_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let forwarded = match msg {
                BackendMessage::Text(text) => Message::Text(text.into()),
                BackendMessage::Binary(data) => Message::Binary(data.into()),
                BackendMessage::Close(_) => break,
                _ => continue,
            };
            if client_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        () = to_backend => tracing::debug!("Client side of passthrough closed"),
        () = to_client => tracing::debug!("Backend side of passthrough closed"),
    }
    tracing::info!("WebSocket passthrough disconnected");
}
