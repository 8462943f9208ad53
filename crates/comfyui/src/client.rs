//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the WebSocket URL and the process-lifetime
//! client id. Every (re)connection uses the same id so that the backend
//! keeps addressing events for already-submitted prompts to this relay.
//! [`EventConnector`] is the seam the multiplexer connects through.

use async_trait::async_trait;
use futures::future;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Text frames of one live event connection. The stream ends when the
/// connection closes or fails.
pub type FrameStream = BoxStream<'static, String>;

/// Something that can open the backend event stream.
#[async_trait]
pub trait EventConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<FrameStream, ComfyUIClientError>;
}

/// Connection handle for a ComfyUI instance's `/ws` endpoint.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    client_id: String,
}

impl ComfyUIClient {
    /// * `ws_url`    - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `client_id` - id sent as the `clientId` query parameter.
    pub fn new(ws_url: String, client_id: String) -> Self {
        Self {
            ws_url: ws_url.trim_end_matches('/').to_string(),
            client_id,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn endpoint(&self) -> String {
        format!("{}/ws?clientId={}", self.ws_url, self.client_id)
    }
}

#[async_trait]
impl EventConnector for ComfyUIClient {
    /// Connect to `/ws?clientId=...` and expose the text frames.
    ///
    /// Binary frames (preview images) are dropped. Close frames and
    /// receive errors end the stream.
    async fn connect(&self) -> Result<FrameStream, ComfyUIClientError> {
        let (ws_stream, _response) = connect_async(self.endpoint()).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %self.client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        let frames = ws_stream
            .take_while(|msg| {
                let open = match msg {
                    Ok(Message::Close(frame)) => {
                        tracing::info!(?frame, "ComfyUI WebSocket closed");
                        false
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "WebSocket receive error");
                        false
                    }
                    Ok(_) => true,
                };
                future::ready(open)
            })
            .filter_map(|msg| {
                let text = match msg {
                    Ok(Message::Text(text)) => Some(text),
                    Ok(Message::Binary(_)) => {
                        tracing::trace!("Ignoring binary message (preview image)");
                        None
                    }
                    _ => None,
                };
                future::ready(text)
            })
            .boxed();

        Ok(frames)
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_carries_client_id() {
        let client = ComfyUIClient::new("ws://localhost:8188/".into(), "relay-1".into());
        assert_eq!(client.endpoint(), "ws://localhost:8188/ws?clientId=relay-1");
        assert_eq!(client.client_id(), "relay-1");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let client = ComfyUIClient::new("ws://127.0.0.1:9".into(), "relay-1".into());
        let err = client.connect().await.err().unwrap();
        assert!(matches!(err, ComfyUIClientError::Connection(_)));
    }
}
