use std::{future::Future, net::SocketAddr, num::NonZeroUsize, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    Router,
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    backend::BackendClient,
    registry::{Connection, Frame, Registry},
    router::EventRouter,
};

pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_OUTBOUND_BUFFER: NonZeroUsize = match NonZeroUsize::new(64) {
    Some(size) => size,
    None => NonZeroUsize::MIN,
};

/// Runtime settings for a relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub backend_url: Url,
    pub backend_timeout: Duration,
    /// Frames buffered per connection before fan-out starts dropping.
    pub outbound_buffer: NonZeroUsize,
    /// Send `{"type":"error"}` frames back to senders of failed events.
    pub error_frames: bool,
}

impl RelayConfig {
    pub fn new(backend_url: Url) -> Self {
        Self {
            backend_url,
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            error_frames: false,
        }
    }
}

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

struct RelayState {
    registry: Arc<Registry>,
    router: EventRouter,
    outbound_buffer: usize,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let backend = BackendClient::new(config.backend_url, config.backend_timeout)?;
        let router = EventRouter::new(Arc::clone(&registry), backend, config.error_frames);

        Ok(Self {
            listener,
            state: Arc::new(RelayState {
                registry,
                router,
                outbound_buffer: config.outbound_buffer.get(),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.state.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Relay { listener, state } = self;
        let registry = Arc::clone(&state.registry);
        let app = build_router(state);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                handle_shutdown(&registry);
            })
            .await?;

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn build_router(state: Arc<RelayState>) -> Router {
    Router::new().route("/", get(connect)).with_state(state)
}

fn handle_shutdown(registry: &Registry) {
    let closed = registry.close_all(close_code::AWAY, "relay shutting down");
    info!(connections = closed, "relay shutting down");
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
}

impl ConnectParams {
    fn identify(self) -> Result<(String, String), &'static str> {
        let user_id = self.user_id.filter(|id| !id.is_empty());
        let device_id = self.device_id.filter(|id| !id.is_empty());
        match (user_id, device_id) {
            (Some(user_id), Some(device_id)) => Ok((user_id, device_id)),
            (None, _) => Err("missing userId query parameter"),
            (_, None) => Err("missing deviceId query parameter"),
        }
    }
}

async fn connect(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    match params.identify() {
        Ok((user_id, device_id)) => {
            ws.on_upgrade(move |socket| handle_connection(socket, state, user_id, device_id))
        }
        Err(reason) => {
            warn!(reason, "rejecting connection");
            ws.on_upgrade(move |mut socket| async move {
                let frame = CloseFrame {
                    code: close_code::POLICY,
                    reason: reason.into(),
                };
                if let Err(err) = socket.send(Message::Close(Some(frame))).await {
                    debug!(?err, "failed to send rejection close frame");
                }
            })
        }
    }
}

async fn handle_connection(
    socket: WebSocket,
    state: Arc<RelayState>,
    user_id: String,
    device_id: String,
) {
    let (sink, mut stream) = socket.split();
    let (outbound, queue) = mpsc::channel(state.outbound_buffer);

    let connection = Connection::new(state.registry.next_id(), user_id, device_id, outbound);
    let registration = state.registry.register(connection.clone());
    info!(
        connection = connection.id(),
        user_id = connection.user_id(),
        device_id = connection.device_id(),
        "client connected"
    );

    let writer = tokio::spawn(write_frames(sink, queue));

    // Frames from one client are routed in arrival order.
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => state.router.handle(&connection, text.as_bytes()).await,
            Ok(Message::Binary(bytes)) => state.router.handle(&connection, &bytes).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(err) => {
                debug!(device_id = connection.device_id(), ?err, "websocket receive failed");
                break;
            }
        }
    }

    drop(registration);
    info!(
        connection = connection.id(),
        user_id = connection.user_id(),
        device_id = connection.device_id(),
        "client disconnected"
    );
    writer.abort();
}

async fn write_frames(mut sink: SplitSink<WebSocket, Message>, mut queue: mpsc::Receiver<Frame>) {
    while let Some(frame) = queue.recv().await {
        let (message, last) = match frame {
            Frame::Text(text) => (Message::Text(text), false),
            Frame::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };

        if let Err(err) = sink.send(message).await {
            debug!(?err, "failed to deliver frame to client");
            break;
        }
        if last {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(user_id: Option<&str>, device_id: Option<&str>) -> ConnectParams {
        ConnectParams {
            user_id: user_id.map(str::to_string),
            device_id: device_id.map(str::to_string),
        }
    }

    #[test]
    fn connect_params_require_both_identifiers() {
        assert_eq!(
            params(Some("u1"), Some("d1")).identify(),
            Ok(("u1".to_string(), "d1".to_string()))
        );
        assert!(params(None, Some("d1")).identify().is_err());
        assert!(params(Some("u1"), None).identify().is_err());
        assert!(params(Some(""), Some("d1")).identify().is_err());
    }

    #[test]
    fn config_defaults() {
        let config = RelayConfig::new("http://127.0.0.1:9/api".parse().expect("valid url"));
        assert_eq!(config.backend_timeout, Duration::from_secs(10));
        assert_eq!(config.outbound_buffer.get(), 64);
        assert!(!config.error_frames);
    }
}
