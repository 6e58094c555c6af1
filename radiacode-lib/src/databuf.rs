//! The device data buffer: a stream of timestamped records of mixed kinds
//! (real-time rates, dose summaries, log events) read through `Vs::DataBuf`.

use crate::constants::{DATA_RECORD_HEADER_SIZE, TICK};
use crate::error::DecodeError;
use chrono::{DateTime, TimeDelta, Utc};
use num_enum::{FromPrimitive, IntoPrimitive};
use std::fmt;
use strum_macros::Display;
use tracing::{trace, warn};
use zerocopy::byteorder::little_endian::{F32, I32, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RecordHeaderRaw {
    pub seq: u8,
    pub eid: u8,
    pub gid: u8,
    /// Device clock, 10 ms ticks.
    pub ticks: I32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RealTimeDataRaw {
    pub count_rate: F32,
    pub dose_rate: F32,
    pub count_rate_err: U16, // 0.1 %
    pub dose_rate_err: U16,  // 0.1 %
    pub flags: U16,
    pub rt_flags: u8,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RawDataRaw {
    pub count_rate: F32,
    pub dose_rate: F32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DoseRateDbRaw {
    pub count: U32,
    pub count_rate: F32,
    pub dose_rate: F32,
    pub dose_rate_err: U16, // 0.1 %
    pub flags: U16,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RareDataRaw {
    pub duration_s: U32,
    pub dose: F32,
    pub temperature: U16,  // (°C * 100) + 2000
    pub charge_level: U16, // 0.01 %
    pub flags: U16,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct EventRaw {
    pub event: u8,
    pub param: u8,
    pub flags: U16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SampleKind {
    /// Filtered rate with error estimates.
    #[strum(to_string = "filtered")]
    Filtered,
    /// Unfiltered instantaneous rate.
    #[strum(to_string = "raw")]
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RealTimeSample {
    pub ticks: i32,
    pub timestamp: DateTime<Utc>,
    pub kind: SampleKind,
    /// Counts per second.
    pub count_rate: f32,
    /// Dose rate in device units (multiply by 10000 for µSv/h).
    pub dose_rate: f32,
    /// Relative error, percent. Only filtered samples carry it.
    pub count_rate_err: Option<f32>,
    pub dose_rate_err: Option<f32>,
    pub flags: u16,
    pub real_time_flags: u8,
}

impl fmt::Display for RealTimeSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {:.2} cps, {:.3} µSv/h",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.kind,
            self.count_rate,
            self.dose_rate * 10_000.0
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DoseRateEntry {
    pub ticks: i32,
    pub timestamp: DateTime<Utc>,
    pub count: u32,
    pub count_rate: f32,
    pub dose_rate: f32,
    pub dose_rate_err: f32,
    pub flags: u16,
}

/// Periodic status record: accumulated dose, temperature and battery.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RareData {
    pub ticks: i32,
    pub timestamp: DateTime<Utc>,
    pub duration_s: u32,
    pub dose: f32,
    pub temperature_c: f32,
    pub charge_percent: f32,
    pub flags: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum EventKind {
    PowerOff = 0,
    PowerOn = 1,
    ToggleSignal = 3,
    DoseReset = 4,
    BatteryFull = 7,
    ChargeStop = 8,
    DoseRateAlarm1 = 9,
    DoseRateAlarm2 = 10,
    DoseAlarm1 = 12,
    DoseAlarm2 = 13,
    TextMessage = 17,
    SpectrumReset = 19,
    CountRateAlarm1 = 20,
    CountRateAlarm2 = 21,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// One entry of the on-device append-only event log.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceEvent {
    pub ticks: i32,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub param: u8,
    pub flags: u16,
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (param {}, flags {:#06x})",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.kind,
            self.param,
            self.flags
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataRecord {
    Sample(RealTimeSample),
    DoseRate(DoseRateEntry),
    Rare(RareData),
    Event(DeviceEvent),
}

impl DataRecord {
    pub fn ticks(&self) -> i32 {
        match self {
            DataRecord::Sample(s) => s.ticks,
            DataRecord::DoseRate(d) => d.ticks,
            DataRecord::Rare(r) => r.ticks,
            DataRecord::Event(e) => e.ticks,
        }
    }
}

/// Records decoded from one data buffer read.
///
/// A truncated trailing record does not discard the ones before it; the
/// problem is reported in `error` instead.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataBuffer {
    pub records: Vec<DataRecord>,
    pub error: Option<DecodeError>,
}

/// Convert device ticks to wall-clock time against the session's base time.
pub fn ticks_to_time(base_time: DateTime<Utc>, ticks: i32) -> DateTime<Utc> {
    base_time + TimeDelta::milliseconds(ticks as i64 * TICK.as_millis() as i64)
}

fn body<T: FromBytes>(record: &'static str, data: &[u8]) -> Result<(T, usize), DecodeError> {
    let needed = std::mem::size_of::<T>();
    T::read_from_prefix(data)
        .map(|(value, _)| (value, needed))
        .map_err(|_| DecodeError::Truncated {
            record,
            needed,
            available: data.len(),
        })
}

/// Bytes to skip for groups the engine does not interpret.
fn skipped_len(eid: u8, gid: u8, data: &[u8]) -> Result<Option<usize>, DecodeError> {
    let fixed = match (eid, gid) {
        (0, 4) | (0, 5) => 16, // user data, schedule data
        (0, 6) => 6,           // accelerometer
        (0, 8) | (0, 9) => 6,  // raw count rate, raw dose rate
        (1, 1..=3) => {
            if data.len() < 6 {
                return Err(DecodeError::Truncated {
                    record: "sample block",
                    needed: 6,
                    available: data.len(),
                });
            }
            let samples = u16::from_le_bytes([data[0], data[1]]) as usize;
            let width = match gid {
                1 => 8,
                2 => 16,
                _ => 14,
            };
            6 + samples * width
        }
        _ => return Ok(None),
    };
    if data.len() < fixed {
        return Err(DecodeError::Truncated {
            record: "skipped group",
            needed: fixed,
            available: data.len(),
        });
    }
    Ok(Some(fixed))
}

pub fn decode_data_buffer(data: &[u8], base_time: DateTime<Utc>) -> DataBuffer {
    let mut out = DataBuffer::default();
    let mut rest = data;
    let mut next_seq: Option<u8> = None;

    while rest.len() >= DATA_RECORD_HEADER_SIZE {
        let Ok((header, tail)) = RecordHeaderRaw::read_from_prefix(rest) else {
            break;
        };
        if let Some(expected) = next_seq {
            if expected != header.seq {
                warn!(expected, got = header.seq, "Sequence jump in data buffer, dropping remainder");
                break;
            }
        }
        next_seq = Some(header.seq.wrapping_add(1));

        let ticks = header.ticks.get();
        let timestamp = ticks_to_time(base_time, ticks);

        let decoded: Result<(Option<DataRecord>, usize), DecodeError> = match (header.eid, header.gid) {
            (0, 0) => body::<RealTimeDataRaw>("real-time data", tail).map(|(raw, n)| {
                let sample = RealTimeSample {
                    ticks,
                    timestamp,
                    kind: SampleKind::Filtered,
                    count_rate: raw.count_rate.get(),
                    dose_rate: raw.dose_rate.get(),
                    count_rate_err: Some(raw.count_rate_err.get() as f32 / 10.0),
                    dose_rate_err: Some(raw.dose_rate_err.get() as f32 / 10.0),
                    flags: raw.flags.get(),
                    real_time_flags: raw.rt_flags,
                };
                (Some(DataRecord::Sample(sample)), n)
            }),
            (0, 1) => body::<RawDataRaw>("raw data", tail).map(|(raw, n)| {
                let sample = RealTimeSample {
                    ticks,
                    timestamp,
                    kind: SampleKind::Raw,
                    count_rate: raw.count_rate.get(),
                    dose_rate: raw.dose_rate.get(),
                    count_rate_err: None,
                    dose_rate_err: None,
                    flags: 0,
                    real_time_flags: 0,
                };
                (Some(DataRecord::Sample(sample)), n)
            }),
            (0, 2) => body::<DoseRateDbRaw>("dose rate entry", tail).map(|(raw, n)| {
                let entry = DoseRateEntry {
                    ticks,
                    timestamp,
                    count: raw.count.get(),
                    count_rate: raw.count_rate.get(),
                    dose_rate: raw.dose_rate.get(),
                    dose_rate_err: raw.dose_rate_err.get() as f32 / 10.0,
                    flags: raw.flags.get(),
                };
                (Some(DataRecord::DoseRate(entry)), n)
            }),
            (0, 3) => body::<RareDataRaw>("rare data", tail).map(|(raw, n)| {
                let rare = RareData {
                    ticks,
                    timestamp,
                    duration_s: raw.duration_s.get(),
                    dose: raw.dose.get(),
                    temperature_c: (raw.temperature.get() as f32 - 2000.0) / 100.0,
                    charge_percent: raw.charge_level.get() as f32 / 100.0,
                    flags: raw.flags.get(),
                };
                (Some(DataRecord::Rare(rare)), n)
            }),
            (0, 7) => body::<EventRaw>("event", tail).map(|(raw, n)| {
                let event = DeviceEvent {
                    ticks,
                    timestamp,
                    kind: EventKind::from_primitive(raw.event),
                    param: raw.param,
                    flags: raw.flags.get(),
                };
                (Some(DataRecord::Event(event)), n)
            }),
            (eid, gid) => match skipped_len(eid, gid, tail) {
                Ok(Some(n)) => {
                    trace!(eid, gid, len = n, "Skipping uninterpreted data buffer group");
                    Ok((None, n))
                }
                Ok(None) => {
                    warn!(eid, gid, "Unknown data buffer group, dropping remainder");
                    break;
                }
                Err(e) => Err(e),
            },
        };

        match decoded {
            Ok((record, consumed)) => {
                out.records.extend(record);
                rest = &tail[consumed..];
            }
            Err(e) => {
                out.error = Some(e);
                break;
            }
        }
    }

    out
}
