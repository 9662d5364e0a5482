//! WaveDAC frame decoder.
//!
//! The board streams one reading per 4-byte frame:
//!
//! ```text
//! offset 0: START_BYTE = 0xA0
//! offset 1: DATA_MSB
//! offset 2: DATA_LSB
//! offset 3: END_BYTE   = 0xC0
//! ```
//!
//! [`FrameDecoder`] is a byte-at-a-time state machine with no I/O, so it can be
//! driven from a serial read loop or from synthetic byte sequences alike.
//!
//! # Resynchronization
//!
//! While seeking, the decoder restarts a frame on the very next `0xA0` it sees,
//! wherever that byte comes from. If a corrupted stream carries `0xA0` as a
//! payload byte, the decoder can lock onto it and misalign until the trailer
//! check rejects the frame and the next coincidental `0xA0` shows up. This
//! greedy behavior is kept on purpose for parity with the firmware's host
//! tools; there is no checksum on the wire to do better.

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// First byte of every frame.
pub const START_BYTE: u8 = 0xA0;

/// Last byte of every frame.
pub const END_BYTE: u8 = 0xC0;

/// Size of a complete frame on the wire.
pub const FRAME_LEN: usize = 4;

/// Bytes collected after the start byte: MSB, LSB and trailer.
const PAYLOAD_LEN: usize = FRAME_LEN - 1;

/// Full-scale ADC reading.
const FULL_SCALE: f64 = 65535.0;

/// Voltage reported for a full-scale reading.
pub const REFERENCE_VOLTS: f64 = 5.0;

// ============================================================================
// Data Types
// ============================================================================

/// Where the decoder is within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DecoderState {
    /// Discarding bytes until a start byte shows up.
    #[default]
    SeekingStart,
    /// Start byte seen, collecting MSB, LSB and trailer.
    ReadingPayload,
}

/// Outcome of feeding a single byte.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodeEvent {
    /// Byte consumed, nothing to report yet.
    NoOp,
    /// Byte discarded while seeking a start byte.
    Skipped,
    /// A complete frame decoded to this voltage.
    SampleReady(f64),
    /// Three payload bytes collected but the trailer was not `END_BYTE`.
    InvalidFrame,
    /// Byte discarded, and the current run of skipped bytes just reached the
    /// configured maximum. Only produced by decoders built with
    /// [`FrameDecoder::with_max_skip`].
    Desynchronized { skipped: u64 },
}

impl DecodeEvent {
    /// The decoded voltage, if this event carries one.
    pub fn sample(self) -> Option<f64> {
        match self {
            DecodeEvent::SampleReady(v) => Some(v),
            _ => None,
        }
    }

    /// Whether the byte that produced this event was thrown away while seeking.
    pub fn is_skip(self) -> bool {
        matches!(self, DecodeEvent::Skipped | DecodeEvent::Desynchronized { .. })
    }
}

/// Running totals kept across resets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderStats {
    /// Frames that decoded to a sample.
    pub samples: u64,
    /// Frames rejected because of a bad trailer.
    pub invalid_frames: u64,
    /// Bytes discarded while seeking.
    pub skipped_bytes: u64,
    /// Number of `Desynchronized` diagnostics raised.
    pub desyncs: u64,
}

// ============================================================================
// Conversions
// ============================================================================

/// Convert the two data bytes of a frame into volts (0..=5 V).
#[inline]
pub fn sample_from_bytes(msb: u8, lsb: u8) -> f64 {
    let raw = (((msb as u32) << 8) & 0xFFFF) | lsb as u32;
    raw as f64 / FULL_SCALE * REFERENCE_VOLTS
}

/// Build the frame the board sends for a raw 16-bit reading.
#[inline]
pub fn encode_frame(raw: u16) -> [u8; FRAME_LEN] {
    [START_BYTE, (raw >> 8) as u8, (raw & 0xFF) as u8, END_BYTE]
}

// ============================================================================
// Decoder
// ============================================================================

/// Byte-oriented state machine that turns a WaveDAC stream into samples.
///
/// # Example
/// ```
/// use _core::{DecodeEvent, FrameDecoder};
///
/// let mut decoder = FrameDecoder::new();
/// let samples: Vec<f64> = decoder
///     .feed_slice(&[0x00, 0xA0, 0xFF, 0xFF, 0xC0])
///     .filter_map(DecodeEvent::sample)
///     .collect();
/// assert_eq!(samples.len(), 1);
/// assert!((samples[0] - 5.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    state: DecoderState,
    payload: [u8; PAYLOAD_LEN],
    filled: usize,
    skip_count: u64,
    max_skip: Option<u64>,
    stats: DecoderStats,
}

impl FrameDecoder {
    /// Decoder without a skip threshold.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that reports `Desynchronized` once `max_skip` consecutive bytes
    /// have been discarded. A threshold of zero disables the diagnostic.
    pub fn with_max_skip(max_skip: u64) -> Self {
        Self {
            max_skip: (max_skip > 0).then_some(max_skip),
            ..Self::default()
        }
    }

    /// Consume one byte.
    pub fn feed(&mut self, byte: u8) -> DecodeEvent {
        match self.state {
            DecoderState::SeekingStart => {
                if byte == START_BYTE {
                    self.state = DecoderState::ReadingPayload;
                    self.filled = 0;
                    return DecodeEvent::NoOp;
                }

                self.skip_count += 1;
                self.stats.skipped_bytes += 1;
                if self.max_skip == Some(self.skip_count) {
                    self.stats.desyncs += 1;
                    return DecodeEvent::Desynchronized {
                        skipped: self.skip_count,
                    };
                }
                DecodeEvent::Skipped
            }
            DecoderState::ReadingPayload => {
                self.payload[self.filled] = byte;
                self.filled += 1;
                if self.filled < PAYLOAD_LEN {
                    return DecodeEvent::NoOp;
                }

                let [msb, lsb, trailer] = self.payload;
                self.state = DecoderState::SeekingStart;
                self.filled = 0;

                if trailer == END_BYTE {
                    self.skip_count = 0;
                    self.stats.samples += 1;
                    DecodeEvent::SampleReady(sample_from_bytes(msb, lsb))
                } else {
                    self.stats.invalid_frames += 1;
                    DecodeEvent::InvalidFrame
                }
            }
        }
    }

    /// Feed a chunk, yielding one event per byte in order.
    pub fn feed_slice<'a>(&'a mut self, bytes: &'a [u8]) -> impl Iterator<Item = DecodeEvent> + 'a {
        bytes.iter().map(move |&b| self.feed(b))
    }

    /// Drop any partial frame and start seeking again. Totals in
    /// [`stats`](Self::stats) are kept.
    pub fn reset(&mut self) {
        self.state = DecoderState::SeekingStart;
        self.payload = [0; PAYLOAD_LEN];
        self.filled = 0;
        self.skip_count = 0;
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Bytes discarded since the last valid frame or reset.
    pub fn skip_count(&self) -> u64 {
        self.skip_count
    }

    /// Payload bytes held for the frame in progress.
    pub fn pending(&self) -> usize {
        self.filled
    }

    pub fn max_skip(&self) -> Option<u64> {
        self.max_skip
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }
}
