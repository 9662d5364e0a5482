//! Single-byte commands understood by the WaveDAC firmware.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DriverError;

/// Substring the board includes in its answer to [`Command::Probe`]
/// (the firmware replies `"Wave Kivy $$$"`).
pub const PROBE_ACK: &[u8] = b"$$$";

/// A control command, sent to the board as one ASCII byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Ask the board to identify itself. Also resets it to its defaults
    /// (not streaming, large range, sine wave).
    Probe,
    StartStreaming,
    StopStreaming,
    WaveSine,
    WaveTriangle,
    RangeSmall,
    RangeLarge,
}

impl Command {
    pub fn as_byte(self) -> u8 {
        match self {
            Command::Probe => b'v',
            Command::StartStreaming => b'b',
            Command::StopStreaming => b's',
            Command::WaveSine => b'e',
            Command::WaveTriangle => b'f',
            Command::RangeSmall => b't',
            Command::RangeLarge => b'y',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        let cmd = match byte {
            b'v' => Command::Probe,
            b'b' => Command::StartStreaming,
            b's' => Command::StopStreaming,
            b'e' => Command::WaveSine,
            b'f' => Command::WaveTriangle,
            b't' => Command::RangeSmall,
            b'y' => Command::RangeLarge,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Whether a probe response carries the board's acknowledgment.
pub fn is_probe_ack(response: &[u8]) -> bool {
    response.windows(PROBE_ACK.len()).any(|w| w == PROBE_ACK)
}

/// Waveform generated by the board's DAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Wave {
    #[default]
    Sine,
    Triangle,
}

impl Wave {
    pub fn command(self) -> Command {
        match self {
            Wave::Sine => Command::WaveSine,
            Wave::Triangle => Command::WaveTriangle,
        }
    }
}

impl FromStr for Wave {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SINE" => Ok(Wave::Sine),
            "TRIANGLE" => Ok(Wave::Triangle),
            other => Err(DriverError::InvalidArgument(format!(
                "unknown wave {other:?}, expected SINE or TRIANGLE"
            ))),
        }
    }
}

impl fmt::Display for Wave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wave::Sine => f.write_str("SINE"),
            Wave::Triangle => f.write_str("TRIANGLE"),
        }
    }
}

/// Output range of the board's DAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Range {
    /// 1 V full scale.
    Small,
    /// 4 V full scale.
    #[default]
    Large,
}

impl Range {
    pub fn command(self) -> Command {
        match self {
            Range::Small => Command::RangeSmall,
            Range::Large => Command::RangeLarge,
        }
    }

    /// Peak output voltage for this range.
    pub fn full_scale_volts(self) -> f64 {
        match self {
            Range::Small => 1.0,
            Range::Large => 4.0,
        }
    }
}

impl FromStr for Range {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SMALL" => Ok(Range::Small),
            "LARGE" => Ok(Range::Large),
            other => Err(DriverError::InvalidArgument(format!(
                "unknown range {other:?}, expected SMALL or LARGE"
            ))),
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Range::Small => f.write_str("SMALL"),
            Range::Large => f.write_str("LARGE"),
        }
    }
}
