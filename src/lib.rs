//! Millview - multi-camera H.264 to WebRTC streaming for industrial floors
//!
//! Millview publishes every configured camera as its own video track inside
//! a single WebRTC peer connection per viewer. Viewers come and go without
//! disturbing each other or the capture pipelines; cameras that fail are
//! restarted autonomously with exponential backoff.
//!
//! # Architecture
//!
//! Three modules form the core, in dependency order:
//!
//! 1. **Capture** - one GStreamer pipeline per camera, a monitor thread
//!    that hides transient failures, and a fan-out registry multiplexing
//!    encoded frames to subscribers
//! 2. **RTP** - packetization of H.264 access units against a per-session
//!    90 kHz clock
//! 3. **Server** - WebSocket signaling with admission control, and one
//!    peer session per viewer binding cameras to SendOnly tracks
//!
//! Data flows one way: capture → fan-out → peer session → RTP → viewer.
//! Signaling (SDP offer/answer, ICE candidates) flows both ways as JSON
//! over the viewer's WebSocket.
//!
//! # Example
//!
//! ```ignore
//! use millview::{AppConfig, CaptureSource, PeerManager, Signaling};
//!
//! let config = Arc::new(AppConfig::load("config.yaml")?);
//! let sources: Vec<_> = config.cameras.iter().cloned()
//!     .map(|cam| Arc::new(CaptureSource::new(cam)))
//!     .collect();
//! for source in &sources {
//!     source.start();
//! }
//!
//! let peers = PeerManager::new(config.clone(), sources.clone());
//! let signaling = Signaling::new(config, peers);
//! let listener = TcpListener::bind(("0.0.0.0", 8443)).await?;
//! signaling.serve(listener).await?;
//! ```

pub mod capture;
pub mod config;
pub mod frame;
pub mod rtp;
pub mod server;
pub mod shutdown;

// Re-exports for convenience
pub use capture::{CaptureSource, FanoutRegistry};
pub use config::{AppConfig, CameraConfig, CameraKind, EncoderKind, ServerConfig, WebRtcConfig};
pub use frame::EncodedFrame;
pub use server::{CameraInfo, ClientSignal, PeerManager, PeerSession, ServerSignal, Signaling};
pub use shutdown::Shutdown;
