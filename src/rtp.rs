//! RTP packetization of H.264 access units for one outbound track
//!
//! The payloader splits each Annex-B access unit into RTP payloads
//! (single-NAL or FU-A fragments) at the configured MTU; this module wraps
//! it with header construction: SSRC and payload type fixed per track, a
//! wrapping sequence counter, the marker bit on an access unit's final
//! fragment, and a 90 kHz timestamp derived from wall-clock time elapsed
//! since the session started.
//!
//! Capture PTS is deliberately ignored for RTP timestamping: RTSP sources
//! may jump, pause, or reset their clock across restarts, while viewers
//! only need a monotonic session-local clock.

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use webrtc::rtp::codecs::h264::H264Payloader;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Payloader;

/// H.264 RTP clock rate (RFC 6184)
pub const RTP_CLOCK_RATE: u32 = 90_000;

/// 90 kHz RTP timestamp for a point `elapsed` after the session origin,
/// modulo 2^32.
pub fn rtp_timestamp(elapsed: Duration) -> u32 {
    (elapsed.as_micros() * 90 / 1000) as u32
}

/// Packetization state for one (session, camera) track.
pub struct RtpStream {
    ssrc: u32,
    payload_type: u8,
    mtu: usize,
    sequence: u16,
    payloader: H264Payloader,
}

impl RtpStream {
    pub fn new(ssrc: u32, payload_type: u8, mtu: usize) -> Self {
        Self {
            ssrc,
            payload_type,
            mtu,
            sequence: 0,
            payloader: H264Payloader::default(),
        }
    }

    /// Split one access unit into RTP packets stamped with the given
    /// session-elapsed time. All packets of one access unit share a
    /// timestamp; only the last carries the marker bit.
    pub fn packetize(&mut self, access_unit: &Bytes, elapsed: Duration) -> Result<Vec<Packet>> {
        let timestamp = rtp_timestamp(elapsed);
        let payloads = self.payloader.payload(self.mtu, access_unit)?;
        let last = payloads.len().saturating_sub(1);

        Ok(payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                self.sequence = self.sequence.wrapping_add(1);
                Packet {
                    header: Header {
                        version: 2,
                        marker: i == last,
                        payload_type: self.payload_type,
                        sequence_number: self.sequence,
                        timestamp,
                        ssrc: self.ssrc,
                        ..Default::default()
                    },
                    payload,
                }
            })
            .collect())
    }
}
