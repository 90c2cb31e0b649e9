//! Per-viewer WebRTC session: negotiation, tracks, frame forwarding
//!
//! One session per signaling client. Every camera gets its own SendOnly
//! H.264 track; frames reach the track through a small bounded channel so a
//! slow transport drops frames instead of stalling the shared capture
//! thread. Teardown unregisters every frame subscription before closing the
//! peer connection, so in-flight dispatches never see a dead track.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use super::peers::PeerManager;
use super::{ClientSignal, ServerSignal};
use crate::capture::CaptureSource;
use crate::config::AppConfig;
use crate::frame::EncodedFrame;
use crate::rtp::{RtpStream, RTP_CLOCK_RATE};

/// SSRC of camera index 0; camera i uses BASE_SSRC + i
const BASE_SSRC: u32 = 1000;
/// Payload type of camera index 0; camera i uses BASE_PAYLOAD_TYPE + i
const BASE_PAYLOAD_TYPE: u8 = 96;
/// Media stream id shared by all of a session's tracks
const STREAM_ID: &str = "millview";
/// Frames queued per track before the capture-side handoff starts dropping
const FRAME_QUEUE_DEPTH: usize = 16;

const H264_FMTP: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Bridge between a capture subscription and one track's forwarding task.
///
/// The subscription callback holds only a `Weak` to this; once the session
/// drops it, promotion fails and the callback degrades to a no-op, so a
/// capture source can never keep a dead session alive.
struct TrackStream {
    camera_id: String,
    tx: mpsc::Sender<EncodedFrame>,
}

pub struct PeerSession {
    client_id: String,
    pc: Arc<RTCPeerConnection>,
    outbound: mpsc::UnboundedSender<ServerSignal>,
    started_at: Instant,
    /// Keeps the per-track bridges alive; one entry per camera
    tracks: Vec<Arc<TrackStream>>,
    /// (source, subscription id) pairs to unregister at teardown
    subscriptions: Mutex<Vec<(Arc<CaptureSource>, u64)>>,
    /// Candidates gathered before the offer went out; `None` once flushed
    pending_candidates: Arc<Mutex<Option<Vec<ServerSignal>>>>,
    offer_sent: AtomicBool,
    ready: AtomicBool,
    torn_down: AtomicBool,
}

impl PeerSession {
    /// Build the peer connection with one SendOnly track per camera and
    /// subscribe to every capture source. Handlers are installed here,
    /// before any negotiation is triggered; the offer itself is sent by
    /// `send_offer` once the session is registered with its manager.
    pub(crate) async fn new(
        client_id: &str,
        outbound: mpsc::UnboundedSender<ServerSignal>,
        config: &AppConfig,
        sources: &[Arc<CaptureSource>],
        manager: Weak<PeerManager>,
    ) -> Result<Arc<Self>> {
        info!(client = %client_id, "creating peer connection");

        let mut media_engine = MediaEngine::default();
        for i in 0..sources.len() {
            media_engine
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: h264_capability(),
                        payload_type: BASE_PAYLOAD_TYPE + i as u8,
                        ..Default::default()
                    },
                    RTPCodecType::Video,
                )
                .context("failed to register H264 codec")?;
        }

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .context("failed to register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: match &config.webrtc.stun_server {
                Some(url) => vec![RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                }],
                None => Vec::new(),
            },
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .context("failed to create peer connection")?,
        );

        // Handlers must be in place before negotiation starts: candidates
        // gathered after set_local_description would otherwise be lost.
        // Candidates that race the offer are parked until it has been sent.
        let pending_candidates = Arc::new(Mutex::new(Some(Vec::new())));
        install_connection_handlers(&pc, client_id, &outbound, &pending_candidates, manager);

        let started_at = Instant::now();
        let mut tracks = Vec::with_capacity(sources.len());
        let mut subscriptions = Vec::with_capacity(sources.len());

        for (i, source) in sources.iter().enumerate() {
            let camera = source.config();
            let ssrc = BASE_SSRC + i as u32;
            let payload_type = BASE_PAYLOAD_TYPE + i as u8;

            let track = Arc::new(TrackLocalStaticRTP::new(
                h264_capability(),
                camera.id.clone(),
                STREAM_ID.to_string(),
            ));
            pc.add_transceiver_from_track(
                Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .with_context(|| format!("failed to add track for camera '{}'", camera.id))?;

            let (tx, rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
            let stream = Arc::new(TrackStream {
                camera_id: camera.id.clone(),
                tx,
            });
            tokio::spawn(forward_frames(
                rx,
                track,
                RtpStream::new(ssrc, payload_type, config.webrtc.mtu),
                started_at,
                client_id.to_string(),
            ));

            let weak = Arc::downgrade(&stream);
            let sub_id = source.subscribe(move |frame: &EncodedFrame| {
                // Promote the weak ref; a torn-down session makes this a no-op
                let Some(stream) = weak.upgrade() else {
                    return Ok(());
                };
                match stream.tx.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Slow transport: drop rather than block the producer
                        debug!(camera = %stream.camera_id, "track queue full, dropping frame");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
                Ok(())
            });
            subscriptions.push((Arc::clone(source), sub_id));

            info!(
                client = %client_id,
                camera = %camera.id,
                ssrc,
                payload_type,
                "added video track"
            );
            tracks.push(stream);
        }

        Ok(Arc::new(Self {
            client_id: client_id.to_string(),
            pc,
            outbound,
            started_at,
            tracks,
            subscriptions: Mutex::new(subscriptions),
            pending_candidates,
            offer_sent: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// True once the remote answer has been accepted
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Generate the local offer and push it down the signaling channel.
    pub(crate) async fn send_offer(&self) -> Result<()> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .context("failed to create offer")?;
        self.pc
            .set_local_description(offer)
            .await
            .context("failed to set local description")?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| anyhow!("local description missing after offer"))?;

        info!(client = %self.client_id, bytes = local.sdp.len(), "sending SDP offer");
        self.offer_sent.store(true, Ordering::SeqCst);
        self.outbound
            .send(ServerSignal::Offer { sdp: local.sdp })
            .map_err(|_| anyhow!("signaling channel closed before offer"))?;

        // Release any candidates that were gathered while the offer was in
        // flight; from here on they go straight to the viewer.
        let parked = self.pending_candidates.lock().take();
        for candidate in parked.into_iter().flatten() {
            let _ = self.outbound.send(candidate);
        }
        Ok(())
    }

    /// Handle one parsed message from the viewer.
    pub(crate) async fn handle_signal(&self, signal: ClientSignal) {
        match signal {
            ClientSignal::Answer { sdp } => {
                if !self.offer_sent.load(Ordering::SeqCst) {
                    warn!(client = %self.client_id, "answer received before any offer was sent, ignoring");
                    return;
                }
                let answer = match RTCSessionDescription::answer(sdp) {
                    Ok(answer) => answer,
                    Err(e) => {
                        error!(client = %self.client_id, error = %e, "invalid SDP answer");
                        return;
                    }
                };
                match self.pc.set_remote_description(answer).await {
                    Ok(()) => {
                        self.ready.store(true, Ordering::SeqCst);
                        info!(client = %self.client_id, "remote answer accepted");
                    }
                    Err(e) => {
                        error!(client = %self.client_id, error = %e, "failed to set remote description");
                    }
                }
            }
            ClientSignal::Candidate {
                candidate: Some(candidate),
                sdp_mid,
            } => {
                debug!(client = %self.client_id, "adding remote ICE candidate");
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index: None,
                    username_fragment: None,
                };
                if let Err(e) = self.pc.add_ice_candidate(init).await {
                    error!(client = %self.client_id, error = %e, "failed to add remote candidate");
                }
            }
            ClientSignal::Candidate {
                candidate: None, ..
            } => {
                debug!(client = %self.client_id, "end of remote candidates");
            }
            ClientSignal::RequestStream => {
                debug!(client = %self.client_id, "stream requested (tracks already negotiated)");
            }
            ClientSignal::Unknown => {
                warn!(client = %self.client_id, "unknown signaling message type");
            }
        }
    }

    /// Unregister every frame subscription, then close the peer connection.
    /// Idempotent; the ordering guarantees no dispatch can reach a track
    /// that is being released.
    pub(crate) async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        debug!(
            client = %self.client_id,
            count = subscriptions.len(),
            "unregistering frame subscriptions"
        );
        for (source, id) in subscriptions {
            source.unsubscribe(id);
        }
        if let Err(e) = self.pc.close().await {
            warn!(client = %self.client_id, error = %e, "error closing peer connection");
        }
    }
}

fn h264_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_owned(),
        clock_rate: RTP_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: H264_FMTP.to_owned(),
        rtcp_feedback: Vec::new(),
    }
}

/// Wire ICE-candidate relay and failure-driven teardown to the peer
/// connection. Installed before negotiation is triggered.
fn install_connection_handlers(
    pc: &Arc<RTCPeerConnection>,
    client_id: &str,
    outbound: &mpsc::UnboundedSender<ServerSignal>,
    pending_candidates: &Arc<Mutex<Option<Vec<ServerSignal>>>>,
    manager: Weak<PeerManager>,
) {
    let out = outbound.clone();
    let cid = client_id.to_string();
    let pending = Arc::clone(pending_candidates);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let out = out.clone();
        let cid = cid.clone();
        let pending = Arc::clone(&pending);
        Box::pin(async move {
            let msg = match candidate {
                Some(c) => match c.to_json() {
                    Ok(init) => ServerSignal::Candidate {
                        candidate: Some(init.candidate),
                        sdp_mid: init.sdp_mid,
                    },
                    Err(e) => {
                        warn!(client = %cid, error = %e, "failed to serialize ICE candidate");
                        return;
                    }
                },
                // Gathering complete: null candidate terminates the exchange
                None => {
                    debug!(client = %cid, "ICE gathering complete");
                    ServerSignal::Candidate {
                        candidate: None,
                        sdp_mid: None,
                    }
                }
            };
            // Candidates never overtake the offer on the signaling channel
            let mut parked = pending.lock();
            match parked.as_mut() {
                Some(queue) => queue.push(msg),
                None => {
                    let _ = out.send(msg);
                }
            }
        })
    }));

    let cid = client_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let cid = cid.clone();
        let manager = manager.clone();
        Box::pin(async move {
            info!(client = %cid, state = %state, "peer connection state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                if let Some(manager) = manager.upgrade() {
                    manager.remove_peer(&cid).await;
                }
            }
        })
    }));
}

/// Per-track forwarding task: drains the handoff queue, packetizes each
/// access unit against the session clock, and writes the packets to the
/// track. Send failures drop the frame and never propagate upstream.
async fn forward_frames(
    mut rx: mpsc::Receiver<EncodedFrame>,
    track: Arc<TrackLocalStaticRTP>,
    mut rtp: RtpStream,
    started_at: Instant,
    client_id: String,
) {
    while let Some(frame) = rx.recv().await {
        let packets = match rtp.packetize(&frame.payload, started_at.elapsed()) {
            Ok(packets) => packets,
            Err(e) => {
                warn!(client = %client_id, track = %track.id(), error = %e, "failed to packetize access unit");
                continue;
            }
        };
        for packet in &packets {
            if let Err(e) = track.write_rtp(packet).await {
                debug!(client = %client_id, track = %track.id(), error = %e, "track send failed, dropping frame");
                break;
            }
        }
    }
    debug!(client = %client_id, track = %track.id(), "track forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, CameraKind, EncoderKind, WebRtcConfig};

    fn test_config(cameras: Vec<CameraConfig>) -> AppConfig {
        AppConfig {
            server: Default::default(),
            cameras,
            webrtc: WebRtcConfig {
                stun_server: None,
                max_clients: 4,
                mtu: 1200,
            },
        }
    }

    fn camera(id: &str) -> CameraConfig {
        CameraConfig {
            id: id.to_string(),
            name: id.to_string(),
            kind: CameraKind::Test,
            uri: String::new(),
            width: 640,
            height: 480,
            fps: 30,
            bitrate: 1000,
            encoder: EncoderKind::Software,
        }
    }

    fn sources(config: &AppConfig) -> Vec<Arc<CaptureSource>> {
        config
            .cameras
            .iter()
            .cloned()
            .map(|c| Arc::new(CaptureSource::new(c)))
            .collect()
    }

    #[tokio::test]
    async fn test_session_creates_one_track_per_camera() {
        let config = test_config(vec![camera("cam0"), camera("cam1")]);
        let sources = sources(&config);
        let (tx, _rx) = mpsc::unbounded_channel();

        let session = PeerSession::new("client_1", tx, &config, &sources, Weak::new())
            .await
            .unwrap();

        assert_eq!(session.tracks.len(), 2);
        assert_eq!(session.tracks[0].camera_id, "cam0");
        assert_eq!(session.tracks[1].camera_id, "cam1");
        for source in &sources {
            assert_eq!(source.subscriber_count(), 1);
        }
        session.teardown().await;
    }

    #[tokio::test]
    async fn test_offer_contains_a_media_section_per_camera() {
        let config = test_config(vec![camera("cam0"), camera("cam1")]);
        let sources = sources(&config);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let session = PeerSession::new("client_1", tx, &config, &sources, Weak::new())
            .await
            .unwrap();
        session.send_offer().await.unwrap();

        let sdp = match rx.recv().await.expect("offer on signaling channel") {
            ServerSignal::Offer { sdp } => sdp,
            other => panic!("expected offer, got {other:?}"),
        };
        assert!(sdp.starts_with("v=0"));
        assert_eq!(sdp.matches("m=video").count(), 2);
        session.teardown().await;
    }

    #[tokio::test]
    async fn test_teardown_unregisters_every_subscription() {
        let config = test_config(vec![camera("cam0"), camera("cam1")]);
        let sources = sources(&config);
        let (tx, _rx) = mpsc::unbounded_channel();

        let session = PeerSession::new("client_1", tx, &config, &sources, Weak::new())
            .await
            .unwrap();
        assert!(sources.iter().all(|s| s.subscriber_count() == 1));

        session.teardown().await;
        assert!(sources.iter().all(|s| s.subscriber_count() == 0));

        // Idempotent
        session.teardown().await;
    }

    #[tokio::test]
    async fn test_answer_before_offer_is_ignored() {
        let config = test_config(vec![camera("cam0")]);
        let sources = sources(&config);
        let (tx, _rx) = mpsc::unbounded_channel();

        let session = PeerSession::new("client_1", tx, &config, &sources, Weak::new())
            .await
            .unwrap();
        session
            .handle_signal(ClientSignal::Answer {
                sdp: "v=0\r\n".to_string(),
            })
            .await;
        assert!(!session.is_ready());
        session.teardown().await;
    }

    #[tokio::test]
    async fn test_dropped_session_degrades_callback_to_noop() {
        let config = test_config(vec![camera("cam0")]);
        let srcs = sources(&config);
        let (tx, _rx) = mpsc::unbounded_channel();

        let session = PeerSession::new("client_1", tx, &config, &srcs, Weak::new())
            .await
            .unwrap();
        session.teardown().await;
        drop(session);

        // No subscription is left behind, and dispatching frames is harmless
        assert_eq!(srcs[0].subscriber_count(), 0);
    }
}
