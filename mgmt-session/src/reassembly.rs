//! Reassembly of plain management frames from link notifications

use mgmt_codec::nmp;
use mgmt_core::{MgmtError, MgmtResult};
use std::time::Duration;
use tokio::time::Instant;

/// Accumulates notification payloads into complete management frames
///
/// A frame may span several notifications, and one notification may carry
/// the end of one frame and the start of the next. The header's length
/// field delimits frames.
///
/// # Limits
/// - The buffer is capped (64 KiB by default); exceeding it drops the
///   partial data.
/// - A partial frame older than the timeout (5 s by default) is discarded
///   when the next chunk arrives.
#[derive(Debug)]
pub struct FrameReassembler {
    buffer: Vec<u8>,
    timeout: Duration,
    last_receive_time: Option<Instant>,
    max_buffer_size: usize,
}

impl FrameReassembler {
    /// Create a reassembler with the default buffer cap and stale timeout
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            timeout: Duration::from_secs(5),
            last_receive_time: None,
            max_buffer_size: 64 * 1024,
        }
    }

    /// Set how long a partial frame may sit idle before it is discarded
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the cap on buffered bytes
    pub fn with_max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    /// Add one notification payload
    ///
    /// # Returns
    /// Every frame completed by this chunk, in order.
    ///
    /// # Errors
    /// `MgmtError::InvalidData` if the buffered data would exceed the cap;
    /// the reassembler is reset.
    pub fn push(&mut self, chunk: &[u8]) -> MgmtResult<Vec<Vec<u8>>> {
        if self.is_timeout() {
            log::warn!(
                "Discarding {} bytes of stale partial frame",
                self.buffer.len()
            );
            self.reset();
        }

        if self.buffer.len() + chunk.len() > self.max_buffer_size {
            let size = self.buffer.len() + chunk.len();
            self.reset();
            return Err(MgmtError::InvalidData(format!(
                "Fragmented frame too large: {} bytes (max: {})",
                size, self.max_buffer_size
            )));
        }
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(len) = nmp::frame_len(&self.buffer) {
            if self.buffer.len() < len {
                break;
            }
            let rest = self.buffer.split_off(len);
            frames.push(std::mem::replace(&mut self.buffer, rest));
        }

        self.last_receive_time = if self.buffer.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        Ok(frames)
    }

    /// Check if a partial frame has waited longer than the timeout
    pub fn is_timeout(&self) -> bool {
        self.last_receive_time
            .is_some_and(|last| last.elapsed() > self.timeout)
    }

    /// Check if a partial frame is buffered
    pub fn is_active(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Discard any partial frame
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_receive_time = None;
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgmt_codec::{NmpMsg, NmpOp};

    fn frame(seq: u8, body_len: usize) -> Vec<u8> {
        NmpMsg::new(NmpOp::ReadRsp, 0, 0, seq, vec![0xa0; body_len])
            .unwrap()
            .encode()
            .unwrap()
    }

    #[test]
    fn test_single_notification() {
        let mut r = FrameReassembler::new();
        let f = frame(1, 4);
        assert_eq!(r.push(&f).unwrap(), vec![f]);
        assert!(!r.is_active());
    }

    #[test]
    fn test_split_header_and_body() {
        let mut r = FrameReassembler::new();
        let f = frame(2, 30);
        assert!(r.push(&f[..5]).unwrap().is_empty());
        assert!(r.push(&f[5..20]).unwrap().is_empty());
        assert!(r.is_active());
        assert_eq!(r.push(&f[20..]).unwrap(), vec![f]);
        assert!(!r.is_active());
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let mut r = FrameReassembler::new();
        let a = frame(1, 2);
        let b = frame(2, 3);
        let mut chunk = a.clone();
        chunk.extend_from_slice(&b[..4]);

        assert_eq!(r.push(&chunk).unwrap(), vec![a]);
        assert_eq!(r.push(&b[4..]).unwrap(), vec![b]);
    }

    #[test]
    fn test_overflow_resets() {
        let mut r = FrameReassembler::new().with_max_buffer_size(16);
        let f = frame(1, 40);
        assert!(r.push(&f[..10]).unwrap().is_empty());
        assert!(matches!(r.push(&f[10..20]), Err(MgmtError::InvalidData(_))));
        assert!(!r.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_partial_discarded() {
        let mut r = FrameReassembler::new().with_timeout(Duration::from_secs(1));
        let stale = frame(1, 10);
        assert!(r.push(&stale[..3]).unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(r.is_timeout());

        let fresh = frame(2, 1);
        assert_eq!(r.push(&fresh).unwrap(), vec![fresh]);
    }
}
