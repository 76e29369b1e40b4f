//! Frame codec and receiver state machine.

use chroma_common::consts::{FRAME_CRC_LEN, FRAME_MAX_PAYLOAD, FRAME_START};
use thiserror::Error;

/// Error type for frame encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Payload longer than a single frame can carry.
    #[error("payload of {0} bytes exceeds the {FRAME_MAX_PAYLOAD}-byte frame limit")]
    PayloadTooLarge(usize),
    /// Frames must carry at least one payload byte.
    #[error("empty payload")]
    EmptyPayload,
}

/// CRC-32 (IEEE 802.3): reflected, init and xor-out `0xFFFF_FFFF`.
pub fn crc32_ieee(bytes: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &b in bytes {
        crc ^= b as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Encode a payload into a complete frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::EmptyPayload);
    }
    if payload.len() > FRAME_MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(3 + payload.len() + FRAME_CRC_LEN);
    out.extend_from_slice(&FRAME_START);
    out.push((payload.len() + FRAME_CRC_LEN) as u8);
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc32_ieee(payload).to_be_bytes());
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    WaitStart1,
    WaitStart2,
    Len,
    Payload,
}

/// Byte-at-a-time frame receiver.
///
/// Feed raw bytes with [`FrameDecoder::push`]; a completed, CRC-verified
/// frame yields its payload (CRC stripped). Anything malformed resets
/// the state machine without producing output, per the drop-silently
/// error policy.
#[derive(Debug)]
pub struct FrameDecoder {
    state: RxState,
    expected: usize,
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: RxState::WaitStart1,
            expected: 0,
            buf: Vec::with_capacity(FRAME_MAX_PAYLOAD + FRAME_CRC_LEN),
        }
    }

    /// True while a frame is partially received.
    pub fn mid_frame(&self) -> bool {
        self.state != RxState::WaitStart1
    }

    /// Abandon any partial frame.
    pub fn reset(&mut self) {
        self.state = RxState::WaitStart1;
        self.buf.clear();
    }

    /// Consume one byte; returns a verified payload when a frame completes.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.state {
            RxState::WaitStart1 => {
                if byte == FRAME_START[0] {
                    self.state = RxState::WaitStart2;
                }
                None
            }
            RxState::WaitStart2 => {
                self.state = if byte == FRAME_START[1] {
                    RxState::Len
                } else {
                    RxState::WaitStart1
                };
                None
            }
            RxState::Len => {
                let len = byte as usize;
                // LEN counts payload + CRC, so anything that cannot hold
                // a CRC and at least one payload byte is invalid.
                if len <= FRAME_CRC_LEN {
                    self.state = RxState::WaitStart1;
                    return None;
                }
                self.expected = len;
                self.buf.clear();
                self.state = RxState::Payload;
                None
            }
            RxState::Payload => {
                self.buf.push(byte);
                if self.buf.len() < self.expected {
                    return None;
                }
                self.state = RxState::WaitStart1;
                let payload_len = self.expected - FRAME_CRC_LEN;
                let (payload, crc_bytes) = self.buf.split_at(payload_len);
                let received = u32::from_be_bytes([
                    crc_bytes[0],
                    crc_bytes[1],
                    crc_bytes[2],
                    crc_bytes[3],
                ]);
                if crc32_ieee(payload) == received {
                    Some(payload.to_vec())
                } else {
                    None
                }
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
