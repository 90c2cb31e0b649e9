//! Signaling server: WebSocket endpoint, admission control, wire messages
//!
//! One WebSocket per viewer carries JSON signaling in both directions:
//! - server → viewer: `camera_list` on open, then `offer`, `candidate`
//!   (null candidate terminates gathering), and `error`
//! - viewer → server: `answer`, `candidate`, `request_stream`
//!
//! The server assigns each connection a `client_<N>` id; viewers never
//! choose their own. A connection arriving while `max_clients` viewers are
//! tracked gets an `error` message and an immediate close, before any peer
//! state is created.

mod peers;
mod session;

pub use peers::PeerManager;
pub use session::PeerSession;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, CameraConfig};

/// Camera metadata advertised to viewers in `camera_list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraInfo {
    pub id: String,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl From<&CameraConfig> for CameraInfo {
    fn from(cam: &CameraConfig) -> Self {
        Self {
            id: cam.id.clone(),
            name: cam.name.clone(),
            width: cam.width,
            height: cam.height,
            fps: cam.fps,
        }
    }
}

/// Messages the server sends to a viewer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerSignal {
    CameraList {
        cameras: Vec<CameraInfo>,
    },
    Offer {
        sdp: String,
    },
    Candidate {
        /// `None` is the end-of-candidates sentinel
        candidate: Option<String>,
        #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
    },
    Error {
        message: String,
    },
}

/// Messages a viewer sends to the server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientSignal {
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: Option<String>,
        #[serde(rename = "sdpMid", default)]
        sdp_mid: Option<String>,
    },
    RequestStream,
    /// Unrecognized type; logged with a warning and otherwise ignored
    #[serde(other)]
    Unknown,
}

struct SignalingState {
    config: Arc<AppConfig>,
    peers: Arc<PeerManager>,
    next_client_id: AtomicU64,
    /// Outbound channels of currently tracked connections, by client id
    clients: RwLock<HashMap<String, mpsc::UnboundedSender<ServerSignal>>>,
}

/// WebSocket signaling front end over one `PeerManager`.
#[derive(Clone)]
pub struct Signaling {
    state: Arc<SignalingState>,
}

impl Signaling {
    pub fn new(config: Arc<AppConfig>, peers: Arc<PeerManager>) -> Self {
        Self {
            state: Arc::new(SignalingState {
                config,
                peers,
                next_client_id: AtomicU64::new(0),
                clients: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Serve the signaling endpoint on an already-bound listener until the
    /// task is aborted.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let app = Router::new()
            .route("/ws", get(ws_upgrade))
            .layer(tower_http::cors::CorsLayer::permissive())
            .with_state(Arc::clone(&self.state));

        info!(
            "signaling server listening on ws://{}/ws",
            listener.local_addr().context("listener has no local addr")?
        );
        axum::serve(listener, app)
            .await
            .context("signaling server terminated")
    }

    /// Push one message to every tracked connection.
    pub async fn broadcast(&self, msg: ServerSignal) {
        let clients = self.state.clients.read().await;
        for (client_id, tx) in clients.iter() {
            if tx.send(msg.clone()).is_err() {
                debug!(client = %client_id, "skipping broadcast to closed connection");
            }
        }
    }

    pub async fn client_count(&self) -> usize {
        self.state.clients.read().await.len()
    }
}

async fn ws_upgrade(
    State(state): State<Arc<SignalingState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<SignalingState>) {
    let client_id = format!(
        "client_{}",
        state.next_client_id.fetch_add(1, Ordering::SeqCst) + 1
    );
    info!(client = %client_id, "viewer connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();

    // Admission control happens before any peer state exists
    let admitted = {
        let mut clients = state.clients.write().await;
        if clients.len() >= state.config.webrtc.max_clients {
            false
        } else {
            clients.insert(client_id.clone(), out_tx.clone());
            true
        }
    };
    if !admitted {
        warn!(
            client = %client_id,
            max = state.config.webrtc.max_clients,
            "max clients reached, rejecting viewer"
        );
        let reject = ServerSignal::Error {
            message: format!(
                "server is full, maximum {} clients",
                state.config.webrtc.max_clients
            ),
        };
        if let Ok(text) = serde_json::to_string(&reject) {
            let _ = ws_tx.send(Message::Text(text.into())).await;
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }

    // Outbound pump: serialize queued signals onto the socket
    let pump_client = client_id.clone();
    let mut pump = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    error!(client = %pump_client, error = %e, "failed to encode signal");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let cameras = state.config.cameras.iter().map(CameraInfo::from).collect();
    let _ = out_tx.send(ServerSignal::CameraList { cameras });

    if let Err(e) = state.peers.create_peer(&client_id, out_tx.clone()).await {
        error!(client = %client_id, error = %e, "failed to create peer");
        let _ = out_tx.send(ServerSignal::Error {
            message: e.to_string(),
        });
        state.clients.write().await.remove(&client_id);
        drop(out_tx);
        let _ = pump.await;
        return;
    }

    loop {
        tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    state.peers.handle_signaling(&client_id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary/ping/pong: nothing to do
                Some(Err(e)) => {
                    warn!(client = %client_id, error = %e, "websocket error");
                    break;
                }
            },
            _ = &mut pump => break,
        }
    }

    info!(client = %client_id, "viewer disconnected");
    state.clients.write().await.remove(&client_id);
    state.peers.remove_peer(&client_id).await;
}
