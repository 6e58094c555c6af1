use crate::constants::SPECTRUM_HEADER_SIZE;
use crate::error::DecodeError;
use crate::reply::PayloadReader;
use std::fmt;
use std::time::Duration;
use zerocopy::byteorder::little_endian::{F32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Upper bound on decoded channels; guards against run-length bombs.
pub const MAX_SPECTRUM_CHANNELS: usize = 8192;

/// Quadratic channel-to-energy mapping, keV.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EnergyCalibration {
    pub a0: f32,
    pub a1: f32,
    pub a2: f32,
}

impl EnergyCalibration {
    pub fn new(a0: f32, a1: f32, a2: f32) -> Self {
        Self { a0, a1, a2 }
    }

    /// `a0 + a1*ch + a2*ch^2`
    pub fn channel_to_energy(&self, channel: usize) -> f64 {
        let ch = channel as f64;
        self.a0 as f64 + self.a1 as f64 * ch + self.a2 as f64 * ch * ch
    }

    pub fn is_finite(&self) -> bool {
        self.a0.is_finite() && self.a1.is_finite() && self.a2.is_finite()
    }

    pub fn to_bytes(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.a0.to_le_bytes());
        out[4..8].copy_from_slice(&self.a1.to_le_bytes());
        out[8..12].copy_from_slice(&self.a2.to_le_bytes());
        out
    }
}

impl fmt::Display for EnergyCalibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E(ch) = {} + {}*ch + {}*ch^2 keV", self.a0, self.a1, self.a2)
    }
}

/// How the channel counts following the header are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SpectrumFormat {
    /// One u32 per channel.
    #[default]
    Plain,
    /// Run-length groups of zero, absolute or delta-coded values.
    Compressed,
}

impl TryFrom<u32> for SpectrumFormat {
    type Error = DecodeError;

    fn try_from(version: u32) -> Result<Self, Self::Error> {
        match version {
            0 => Ok(SpectrumFormat::Plain),
            1 => Ok(SpectrumFormat::Compressed),
            other => Err(DecodeError::UnsupportedFormat(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SpectrumHeaderRaw {
    pub duration_s: U32,
    pub a0: F32,
    pub a1: F32,
    pub a2: F32,
}

/// A spectrum snapshot as reported by the device.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Spectrum {
    /// Accumulation time since the last spectrum reset.
    pub duration: Duration,
    /// Coefficients valid for this snapshot.
    pub calibration: EnergyCalibration,
    pub counts: Vec<u32>,
}

impl Spectrum {
    /// An all-zero histogram of `channels` bins.
    pub fn empty(channels: usize, calibration: EnergyCalibration) -> Self {
        Self {
            duration: Duration::ZERO,
            calibration,
            counts: vec![0; channels],
        }
    }

    pub fn channel_count(&self) -> usize {
        self.counts.len()
    }

    pub fn total_counts(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }

    pub fn channel_to_energy(&self, channel: usize) -> f64 {
        self.calibration.channel_to_energy(channel)
    }

    /// Energy of every channel, keV.
    pub fn energies(&self) -> Vec<f64> {
        (0..self.counts.len()).map(|ch| self.channel_to_energy(ch)).collect()
    }

    /// Average counts per second over the accumulation time.
    pub fn count_rate(&self) -> Option<f64> {
        let secs = self.duration.as_secs_f64();
        (secs > 0.0).then(|| self.total_counts() as f64 / secs)
    }
}

impl fmt::Display for Spectrum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} channels, {} counts in {} s, {}",
            self.counts.len(),
            self.total_counts(),
            self.duration.as_secs(),
            self.calibration
        )
    }
}

/// Decode the contents of the `Spectrum` / `SpecAccum` virtual strings.
///
/// The channel count comes from the data length, not from a constant.
pub fn decode_spectrum(data: &[u8], format: SpectrumFormat) -> Result<Spectrum, DecodeError> {
    let (header, tail) = SpectrumHeaderRaw::read_from_prefix(data).map_err(|_| DecodeError::Truncated {
        record: "spectrum",
        needed: SPECTRUM_HEADER_SIZE,
        available: data.len(),
    })?;

    let counts = match format {
        SpectrumFormat::Plain => decode_counts_plain(tail)?,
        SpectrumFormat::Compressed => decode_counts_compressed(tail)?,
    };

    Ok(Spectrum {
        duration: Duration::from_secs(header.duration_s.get() as u64),
        calibration: EnergyCalibration {
            a0: header.a0.get(),
            a1: header.a1.get(),
            a2: header.a2.get(),
        },
        counts,
    })
}

fn decode_counts_plain(tail: &[u8]) -> Result<Vec<u32>, DecodeError> {
    if tail.len() % 4 != 0 {
        return Err(DecodeError::Inconsistent {
            record: "spectrum",
            message: format!("{} count bytes is not a multiple of 4", tail.len()),
        });
    }
    if tail.len() / 4 > MAX_SPECTRUM_CHANNELS {
        return Err(too_many_channels(tail.len() / 4));
    }
    Ok(tail
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn decode_counts_compressed(tail: &[u8]) -> Result<Vec<u32>, DecodeError> {
    let mut r = PayloadReader::new("compressed spectrum", tail);
    let mut counts = Vec::new();
    let mut last: i64 = 0;

    while r.remaining() > 0 {
        let control = r.u16()?;
        let run = (control >> 4) as usize & 0x0FFF;
        let width = (control & 0x0F) as u8;

        if counts.len() + run > MAX_SPECTRUM_CHANNELS {
            return Err(too_many_channels(counts.len() + run));
        }

        for _ in 0..run {
            let value: i64 = match width {
                0 => 0,
                1 => r.u8()? as i64,
                2 => last + r.i8()? as i64,
                3 => last + r.i16()? as i64,
                4 => {
                    let lo = r.u8()? as i32;
                    let mid = r.u8()? as i32;
                    let hi = r.i8()? as i32;
                    last + ((hi << 16) | (mid << 8) | lo) as i64
                }
                5 => last + r.i32()? as i64,
                other => return Err(DecodeError::UnsupportedWidth(other)),
            };
            let count = u32::try_from(value).map_err(|_| DecodeError::Inconsistent {
                record: "compressed spectrum",
                message: format!("channel {} decodes to {value}", counts.len()),
            })?;
            last = value;
            counts.push(count);
        }
    }

    Ok(counts)
}

fn too_many_channels(channels: usize) -> DecodeError {
    DecodeError::Inconsistent {
        record: "spectrum",
        message: format!("{channels} channels exceeds {MAX_SPECTRUM_CHANNELS}"),
    }
}
