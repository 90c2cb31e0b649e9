//! Encoded frame type passed from capture pipelines to peer sessions

use bytes::Bytes;

/// A single H.264 access unit in Annex-B byte-stream form.
///
/// Produced by a capture pipeline and handed to subscribers by shared
/// reference. Subscribers must not hold onto the reference beyond the
/// callback invocation; cloning is cheap (`Bytes` is reference-counted)
/// when a copy is needed.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Access unit payload, including Annex-B start codes
    pub payload: Bytes,
    /// Presentation timestamp in nanoseconds from the capture clock.
    /// Monotonically non-decreasing within one pipeline incarnation.
    pub pts_ns: u64,
    /// True iff the access unit contains an IDR slice
    pub is_keyframe: bool,
}

impl EncodedFrame {
    pub fn new(payload: Bytes, pts_ns: u64, is_keyframe: bool) -> Self {
        Self {
            payload,
            pts_ns,
            is_keyframe,
        }
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_construction() {
        let frame = EncodedFrame::new(Bytes::from_static(&[0, 0, 0, 1, 0x65]), 40_000_000, true);
        assert_eq!(frame.len(), 5);
        assert!(frame.is_keyframe);
        assert_eq!(frame.pts_ns, 40_000_000);
    }

    #[test]
    fn test_frame_clone_shares_payload() {
        let frame = EncodedFrame::new(Bytes::from(vec![0xAB; 1024]), 0, false);
        let copy = frame.clone();
        // Bytes clones share the same backing allocation
        assert_eq!(copy.payload.as_ptr(), frame.payload.as_ptr());
    }
}
