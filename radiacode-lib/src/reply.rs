//! Decoders for the fixed-shape replies: acknowledgements, versions, serials,
//! calibration and register reads.

use crate::constants::RETCODE_OK;
use crate::error::DecodeError;
use crate::spectrum::EnergyCalibration;
use bytes::{Buf, Bytes};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Bounds-checked little-endian reader over a reply payload.
pub(crate) struct PayloadReader<'a> {
    record: &'static str,
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(record: &'static str, buf: &'a [u8]) -> Self {
        Self { record, buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, needed: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                record: self.record,
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn i8(&mut self) -> Result<i8, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_i8())
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub(crate) fn i16(&mut self) -> Result<i16, DecodeError> {
        self.need(2)?;
        Ok(self.buf.get_i16_le())
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub(crate) fn i32(&mut self) -> Result<i32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub(crate) fn f32(&mut self) -> Result<f32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_f32_le())
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// A string prefixed with its length as a single byte.
    pub(crate) fn short_string(&mut self) -> Result<String, DecodeError> {
        let len = self.u8()? as usize;
        let raw = self.bytes(len)?;
        Ok(String::from_utf8_lossy(raw).trim_end_matches('\0').to_string())
    }

    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        if self.buf.has_remaining() {
            return Err(DecodeError::Inconsistent {
                record: self.record,
                message: format!("{} unexpected trailing byte(s)", self.buf.remaining()),
            });
        }
        Ok(())
    }
}

fn check_retcode(code: u32) -> Result<(), DecodeError> {
    if code != RETCODE_OK {
        return Err(DecodeError::ReturnCode(code));
    }
    Ok(())
}

/// Reply to `RdVirtString`: return code, declared length, data.
pub fn decode_virt_string(payload: &Bytes) -> Result<Bytes, DecodeError> {
    let mut r = PayloadReader::new("virtual string", payload);
    check_retcode(r.u32()?)?;
    let len = r.u32()? as usize;
    let available = r.remaining();
    // Some firmware revisions append a NUL beyond the declared length.
    let tolerated = available == len + 1 && payload.last() == Some(&0);
    if available != len && !tolerated {
        return Err(DecodeError::Inconsistent {
            record: "virtual string",
            message: format!("declared {len} bytes, carried {available}"),
        });
    }
    let start = payload.len() - available;
    Ok(payload.slice(start..start + len))
}

/// Reply to `WrVirtSfr` / `WrVirtString`: a bare return code.
pub fn decode_write_ack(payload: &[u8]) -> Result<(), DecodeError> {
    let mut r = PayloadReader::new("write acknowledgement", payload);
    check_retcode(r.u32()?)?;
    r.finish()
}

/// Reply to `RdVirtSfrBatch`: one 32-bit word per requested register.
pub fn decode_sfr_batch(payload: &[u8], count: usize) -> Result<Vec<u32>, DecodeError> {
    let mut r = PayloadReader::new("register batch", payload);
    let values = (0..count).map(|_| r.u32()).collect::<Result<Vec<_>, _>>()?;
    r.finish()?;
    Ok(values)
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub date: String,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} ({})", self.major, self.minor, self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FirmwareVersion {
    pub boot: Version,
    pub target: Version,
}

impl FirmwareVersion {
    pub fn at_least(&self, major: u16, minor: u16) -> bool {
        (self.target.major, self.target.minor) >= (major, minor)
    }
}

/// Reply to `GetVersion`: boot then target, each `minor u16, major u16, string`.
pub fn decode_firmware_version(payload: &[u8]) -> Result<FirmwareVersion, DecodeError> {
    let mut r = PayloadReader::new("firmware version", payload);
    let mut version = || -> Result<Version, DecodeError> {
        let minor = r.u16()?;
        let major = r.u16()?;
        let date = r.short_string()?;
        Ok(Version { major, minor, date })
    };
    let boot = version()?;
    let target = version()?;
    r.finish()?;
    Ok(FirmwareVersion { boot, target })
}

/// Reply to `GetSerial`: byte length then 32-bit groups, shown as `XXXXXXXX-XXXXXXXX`.
pub fn decode_hw_serial(payload: &[u8]) -> Result<String, DecodeError> {
    let mut r = PayloadReader::new("hardware serial", payload);
    let len = r.u32()? as usize;
    if len % 4 != 0 {
        return Err(DecodeError::Inconsistent {
            record: "hardware serial",
            message: format!("length {len} not a multiple of 4"),
        });
    }
    let groups = (0..len / 4)
        .map(|_| r.u32().map(|v| format!("{v:08X}")))
        .collect::<Result<Vec<_>, _>>()?;
    r.finish()?;
    Ok(groups.join("-"))
}

/// Reply to `GetStatus`: a flag word.
pub fn decode_status(payload: &[u8]) -> Result<u32, DecodeError> {
    let mut r = PayloadReader::new("status", payload);
    let flags = r.u32()?;
    r.finish()?;
    Ok(flags)
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FirmwareSignature {
    pub signature: u32,
    pub file_name: String,
    pub id_string: String,
}

impl fmt::Display for FirmwareSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Signature: {:08X}, FileName=\"{}\", IdString=\"{}\"",
            self.signature, self.file_name, self.id_string
        )
    }
}

pub fn decode_fw_signature(payload: &[u8]) -> Result<FirmwareSignature, DecodeError> {
    let mut r = PayloadReader::new("firmware signature", payload);
    Ok(FirmwareSignature {
        signature: r.u32()?,
        file_name: r.short_string()?,
        id_string: r.short_string()?,
    })
}

/// Contents of the `EnergyCalib` virtual string: a0, a1, a2 as f32.
pub fn decode_energy_calibration(data: &[u8]) -> Result<EnergyCalibration, DecodeError> {
    let mut r = PayloadReader::new("energy calibration", data);
    Ok(EnergyCalibration {
        a0: r.f32()?,
        a1: r.f32()?,
        a2: r.f32()?,
    })
}

/// Text virtual strings are cp1251 on the device; non-ASCII is replaced.
pub fn decode_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).trim_end_matches('\0').to_string()
}

/// `SpecFormatVersion=<n>` line of the configuration dump, if present.
pub fn spectrum_format_from_config(config: &str) -> Option<u32> {
    config
        .lines()
        .find_map(|line| line.trim().strip_prefix("SpecFormatVersion"))
        .and_then(|rest| rest.trim_start().strip_prefix('='))
        .and_then(|value| value.trim().parse().ok())
}
