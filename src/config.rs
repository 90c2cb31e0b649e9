//! YAML configuration: server socket, camera inventory, WebRTC limits

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

/// Top-level application configuration, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
}

/// Signaling server socket settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

/// Where a camera's video comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    /// Network camera already producing H.264 over RTSP
    Rtsp,
    /// Raw V4L2 device that needs local encoding
    Usb,
    /// Synthetic test pattern for development without hardware
    Test,
}

impl CameraKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraKind::Rtsp => "rtsp",
            CameraKind::Usb => "usb",
            CameraKind::Test => "test",
        }
    }
}

/// H.264 encoder used for sources that need local encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    #[default]
    Software,
    Vaapi,
}

impl EncoderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderKind::Software => "software",
            EncoderKind::Vaapi => "vaapi",
        }
    }
}

/// Immutable per-camera configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Stable unique id; doubles as the track id on the wire
    pub id: String,
    /// Human-readable name shown to viewers
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CameraKind,
    /// RTSP URL or V4L2 device path; unused for test sources
    #[serde(default)]
    pub uri: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Target bitrate in kbit/s for locally encoded sources
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    #[serde(default)]
    pub encoder: EncoderKind,
}

/// WebRTC negotiation and admission settings
#[derive(Debug, Clone, Deserialize)]
pub struct WebRtcConfig {
    /// Optional STUN server URL, e.g. "stun:stun.l.google.com:19302"
    #[serde(default)]
    pub stun_server: Option<String>,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// RTP packetization MTU in bytes
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_server: None,
            max_clients: default_max_clients(),
            mtu: default_mtu(),
        }
    }
}

fn default_port() -> u16 {
    8443
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_fps() -> u32 {
    30
}

fn default_bitrate() -> u32 {
    2000
}

fn default_max_clients() -> usize {
    4
}

fn default_mtu() -> usize {
    1200
}

/// Payload types are assigned 96 + camera index, so the camera count is
/// bounded by the dynamic payload-type range (96..=127).
pub const MAX_CAMERAS: usize = 32;

impl AppConfig {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading configuration from {}", path.display());

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;

        info!(
            "configuration loaded: {} cameras, port {}, max {} clients",
            config.cameras.len(),
            config.server.port,
            config.webrtc.max_clients
        );
        for cam in &config.cameras {
            info!(
                "  camera [{}] '{}' type={} encoder={} uri={} {}x{}@{}fps",
                cam.id,
                cam.name,
                cam.kind.as_str(),
                cam.encoder.as_str(),
                cam.uri,
                cam.width,
                cam.height,
                cam.fps
            );
        }

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            anyhow::bail!("no cameras configured");
        }
        if self.cameras.len() > MAX_CAMERAS {
            anyhow::bail!(
                "too many cameras configured ({}); payload-type range allows at most {}",
                self.cameras.len(),
                MAX_CAMERAS
            );
        }
        for (i, cam) in self.cameras.iter().enumerate() {
            if cam.id.is_empty() {
                anyhow::bail!("camera #{i} has an empty id");
            }
            if self.cameras[..i].iter().any(|other| other.id == cam.id) {
                anyhow::bail!("duplicate camera id '{}'", cam.id);
            }
            if cam.kind != CameraKind::Test && cam.uri.is_empty() {
                anyhow::bail!("camera '{}' has no uri", cam.id);
            }
        }
        if self.webrtc.max_clients == 0 {
            anyhow::bail!("webrtc.max_clients must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
server:
  port: 9000
  bind: 127.0.0.1
cameras:
  - id: cam0
    name: Furnace north
    type: rtsp
    uri: rtsp://10.0.0.10/stream1
    width: 1920
    height: 1080
    fps: 25
    bitrate: 4000
  - id: cam1
    name: Loading bay
    type: usb
    uri: /dev/video0
    encoder: vaapi
webrtc:
  stun_server: stun:stun.l.google.com:19302
  max_clients: 2
  mtu: 1400
"#;

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = serde_yaml::from_str(FULL).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.cameras.len(), 2);
        assert_eq!(config.cameras[0].kind, CameraKind::Rtsp);
        assert_eq!(config.cameras[0].fps, 25);
        assert_eq!(config.cameras[1].encoder, EncoderKind::Vaapi);
        assert_eq!(config.webrtc.max_clients, 2);
        assert_eq!(config.webrtc.mtu, 1400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_camera_defaults() {
        let yaml = r#"
cameras:
  - id: cam0
    name: Test
    type: test
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        let cam = &config.cameras[0];
        assert_eq!((cam.width, cam.height, cam.fps, cam.bitrate), (1280, 720, 30, 2000));
        assert_eq!(cam.encoder, EncoderKind::Software);
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.webrtc.max_clients, 4);
        assert!(config.webrtc.stun_server.is_none());
    }

    #[test]
    fn test_unknown_camera_type_rejected() {
        let yaml = r#"
cameras:
  - id: cam0
    name: Bad
    type: firewire
"#;
        assert!(serde_yaml::from_str::<AppConfig>(yaml).is_err());
    }

    #[test]
    fn test_no_cameras_rejected() {
        let config: AppConfig = serde_yaml::from_str("server:\n  port: 8000\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_camera_id_rejected() {
        let yaml = r#"
cameras:
  - { id: cam0, name: A, type: test }
  - { id: cam0, name: B, type: test }
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_usb_camera_requires_uri() {
        let yaml = r#"
cameras:
  - { id: cam0, name: A, type: usb }
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.cameras.len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(AppConfig::load("/nonexistent/config.yaml").is_err());
    }
}
