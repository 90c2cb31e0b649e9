//! Peer session manager: one WebRTC session per connected viewer

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use super::session::PeerSession;
use super::ServerSignal;
use crate::capture::CaptureSource;
use crate::config::AppConfig;

pub struct PeerManager {
    config: Arc<AppConfig>,
    sources: Vec<Arc<CaptureSource>>,
    peers: RwLock<HashMap<String, Arc<PeerSession>>>,
}

impl PeerManager {
    pub fn new(config: Arc<AppConfig>, sources: Vec<Arc<CaptureSource>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            sources,
            peers: RwLock::new(HashMap::new()),
        })
    }

    /// Build a session for a new viewer and start negotiation.
    ///
    /// Refuses when the server is already at its `max_clients` ceiling.
    /// The session is registered in the peer map before the offer goes out,
    /// so an answer can never race an unknown client id.
    pub async fn create_peer(
        self: &Arc<Self>,
        client_id: &str,
        outbound: mpsc::UnboundedSender<ServerSignal>,
    ) -> Result<()> {
        let max_clients = self.config.webrtc.max_clients;
        if self.peer_count().await >= max_clients {
            anyhow::bail!("server is full, maximum {max_clients} clients");
        }

        let session = PeerSession::new(
            client_id,
            outbound,
            &self.config,
            &self.sources,
            Arc::downgrade(self),
        )
        .await
        .context("failed to build peer session")?;

        {
            let mut peers = self.peers.write().await;
            if peers.len() >= max_clients {
                drop(peers);
                session.teardown().await;
                anyhow::bail!("server is full, maximum {max_clients} clients");
            }
            peers.insert(client_id.to_string(), Arc::clone(&session));
        }

        if let Err(e) = session.send_offer().await {
            self.remove_peer(client_id).await;
            return Err(e);
        }
        Ok(())
    }

    /// Route one raw signaling message to the owning session. Parse errors
    /// are logged and the connection stays up.
    pub async fn handle_signaling(&self, client_id: &str, raw: &str) {
        let session = { self.peers.read().await.get(client_id).cloned() };
        let Some(session) = session else {
            warn!(client = %client_id, "signaling message for unknown peer");
            return;
        };
        match serde_json::from_str(raw) {
            Ok(signal) => session.handle_signal(signal).await,
            Err(e) => warn!(client = %client_id, error = %e, "malformed signaling message"),
        }
    }

    /// Tear down one viewer's session: unsubscribe its frame callbacks,
    /// close the peer connection, and forget it. No-op for unknown ids.
    pub async fn remove_peer(&self, client_id: &str) {
        let session = { self.peers.write().await.remove(client_id) };
        if let Some(session) = session {
            info!(client = %client_id, "removing peer");
            session.teardown().await;
        }
    }

    /// Tear down every session; used at server shutdown.
    pub async fn remove_all(&self) {
        let drained: Vec<_> = { self.peers.write().await.drain().collect() };
        for (client_id, session) in drained {
            info!(client = %client_id, "removing peer");
            session.teardown().await;
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}
