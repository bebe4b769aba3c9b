use log::{debug, warn};

use crate::models::Reading;

use super::payload::decode_payload;

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// Buffer limit while a frame has started but not terminated.
pub const MAX_UNTERMINATED_BYTES: usize = 500;
/// Buffer limit while no frame has started at all.
pub const MAX_UNFRAMED_BYTES: usize = 256;

/// Incremental STX/ETX frame decoder.
///
/// Bytes may arrive at any granularity, interleaved with noise or truncated
/// frames. The decoder only ever holds a bounded amount of unframed data.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Next decoded reading, stamped now with a fresh id.
    pub fn next_reading(&mut self) -> Option<Reading> {
        self.next_weight().map(Reading::new)
    }

    /// Extracts the frame between the first STX and the first ETX after it.
    ///
    /// Returns `None` when no complete frame is buffered or when the extracted
    /// frame fails to decode. A failed frame is still consumed, so callers can
    /// keep calling while [`buffered_len`](Self::buffered_len) shrinks.
    pub fn next_weight(&mut self) -> Option<f64> {
        let Some(start) = self.buffer.iter().position(|&b| b == STX) else {
            if self.buffer.len() > MAX_UNFRAMED_BYTES {
                warn!(
                    "no frame start in {} buffered bytes, discarding",
                    self.buffer.len()
                );
                self.buffer.clear();
            }
            return None;
        };

        // An ETX ahead of the first STX can never close a frame.
        let Some(end) = self.buffer[start..]
            .iter()
            .position(|&b| b == ETX)
            .map(|offset| start + offset)
        else {
            self.trim_unterminated();
            return None;
        };

        let payload: Vec<u8> = self.buffer[start + 1..end].to_vec();
        self.buffer.drain(..=end);
        debug!("frame payload {:?}", String::from_utf8_lossy(&payload));

        match decode_payload(&payload) {
            Ok(weight) => Some(weight),
            Err(err) => {
                warn!("dropping undecodable frame: {err:#}");
                None
            }
        }
    }

    fn trim_unterminated(&mut self) {
        if self.buffer.len() <= MAX_UNTERMINATED_BYTES {
            return;
        }

        warn!(
            "frame not terminated after {} bytes, trimming buffer",
            self.buffer.len()
        );
        if let Some(last_start) = self.buffer.iter().rposition(|&b| b == STX) {
            self.buffer.drain(..last_start);
        }
        if self.buffer.len() > MAX_UNTERMINATED_BYTES {
            self.buffer.clear();
        }
    }
}

/// Builds one framed transmission: STX, the weight field, the indicator
/// digit, ETX.
pub fn encode_frame(weight_field: &str, indicator: u8) -> Vec<u8> {
    let mut frame = Vec::with_capacity(weight_field.len() + 3);
    frame.push(STX);
    frame.extend_from_slice(weight_field.as_bytes());
    frame.push(b'0' + indicator);
    frame.push(ETX);
    frame
}
