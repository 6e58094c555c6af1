use crate::constants::{DISPLAY_OFF_TIMEOUTS, MAX_BRIGHTNESS};
use crate::error::Error;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDateTime, Timelike};
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};
use std::str::FromStr;
use strum_macros::Display;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Command opcodes understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive, Display)]
#[repr(u16)]
pub enum Opcode {
    GetStatus = 0x0005,
    SetExchange = 0x0007,
    GetVersion = 0x000A,
    GetSerial = 0x000B,
    FwImageGetInfo = 0x0012,
    FwSignature = 0x0101,
    RdHwConfig = 0x0807,
    RdFlash = 0x081C,
    RdVirtSfr = 0x0824,
    WrVirtSfr = 0x0825,
    RdVirtString = 0x0826,
    WrVirtString = 0x0827,
    RdVirtSfrBatch = 0x082A,
    WrVirtSfrBatch = 0x082B,
    SetTime = 0x0A04,

    #[num_enum(catch_all)]
    Unknown(u16),
}

impl Opcode {
    /// Whether executing this opcode may change state on the device.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Opcode::SetExchange | Opcode::WrVirtSfr | Opcode::WrVirtString | Opcode::WrVirtSfrBatch | Opcode::SetTime
        )
    }
}

/// Virtual strings: variable-length device objects read with `RdVirtString`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, Display)]
#[repr(u32)]
pub enum Vs {
    Configuration = 0x002,
    FwDescriptor = 0x003,
    SerialNumber = 0x008,
    TextMessage = 0x00F,
    MemSnapshot = 0x0E0,
    DataBuf = 0x100,
    SfrFile = 0x101,
    Spectrum = 0x200,
    EnergyCalib = 0x202,
    SpecAccum = 0x205,
    SpecDiff = 0x206,
    SpecReset = 0x207,
}

/// Virtual special function registers: 32-bit device settings and readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, Display)]
#[repr(u32)]
pub enum Vsfr {
    DeviceCtrl = 0x0500,
    DeviceLang = 0x0502,
    DeviceOn = 0x0503,
    DeviceTime = 0x0504,

    DispCtrl = 0x0510,
    DispBrt = 0x0511,
    DispContr = 0x0512,
    DispOffTime = 0x0513,
    DispOn = 0x0514,
    DispDir = 0x0515,
    DispBackltOn = 0x0516,

    SoundCtrl = 0x0520,
    SoundVol = 0x0521,
    SoundOn = 0x0522,
    SoundButton = 0x0523,

    VibroCtrl = 0x0530,
    VibroOn = 0x0531,

    AlarmMode = 0x05E0,
    PlaySignal = 0x05E1,

    BleTxPwr = 0x0700,

    DrLev1UrH = 0x8000,
    DrLev2UrH = 0x8001,
    DsLev1Ur100 = 0x8002,
    DsLev2Ur100 = 0x8003,
    DsUnits = 0x8004,
    CpsFilter = 0x8005,
    RawFilter = 0x8006,
    DoseReset = 0x8007,
    CrLev1Cp10s = 0x8008,
    CrLev2Cp10s = 0x8009,
    UseNsvH = 0x800C,

    ChnToKevA0 = 0x8010,
    ChnToKevA1 = 0x8011,
    ChnToKevA2 = 0x8012,
    CrUnits = 0x8013,

    Cps = 0x8020,
    DrUrH = 0x8021,
    DsUr = 0x8022,
    TempDegC = 0x8024,
    AccX = 0x8025,
    AccY = 0x8026,
    AccZ = 0x8027,
    Opt = 0x8028,

    SysMcuId0 = 0xFFFF_0000,
    SysMcuId1 = 0xFFFF_0001,
    SysMcuId2 = 0xFFFF_0002,
    SysDeviceId = 0xFFFF_0005,
    SysSignature = 0xFFFF_0006,
    SysRxSize = 0xFFFF_0007,
    SysTxSize = 0xFFFF_0008,
    SysBootVersion = 0xFFFF_0009,
    SysTargetVersion = 0xFFFF_000A,
    SysStatus = 0xFFFF_000B,
    SysMcuVref = 0xFFFF_000C,
    SysMcuTemp = 0xFFFF_000D,
}

/// Events that can trigger a sound or vibration alert.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertControl {
    pub buttons: bool,
    pub clicks: bool,
    pub dose_rate_alarm_1: bool,
    pub dose_rate_alarm_2: bool,
    pub dose_rate_out_of_scale: bool,
    pub dose_alarm_1: bool,
    pub dose_alarm_2: bool,
    pub dose_out_of_scale: bool,
}

impl AlertControl {
    pub fn bits(&self) -> u32 {
        self.into_bytes()[0] as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Language {
    #[strum(to_string = "ru")]
    Russian,
    #[strum(to_string = "en")]
    English,
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ru" => Ok(Language::Russian),
            "en" => Ok(Language::English),
            other => Err(Error::Validation(format!(
                "unsupported language {other:?}, use \"ru\" or \"en\""
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum DisplayDirection {
    Auto = 0,
    Right = 1,
    Left = 2,
}

/// One request to the device. Built per call and consumed by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    opcode: Opcode,
    payload: Bytes,
}

impl Command {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn bare(opcode: Opcode) -> Self {
        Self::new(opcode, Bytes::new())
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_mutating(&self) -> bool {
        self.opcode.is_mutating()
    }

    pub fn set_exchange(args: &[u8]) -> Self {
        Self::new(Opcode::SetExchange, Bytes::copy_from_slice(args))
    }

    /// `SetTime` takes day, month, year-2000, 0, second, minute, hour, 0.
    pub fn set_time(dt: NaiveDateTime) -> Self {
        let year = (dt.year() - 2000).clamp(0, u8::MAX as i32) as u8;
        let payload = [
            dt.day() as u8,
            dt.month() as u8,
            year,
            0,
            dt.second() as u8,
            dt.minute() as u8,
            dt.hour() as u8,
            0,
        ];
        Self::new(Opcode::SetTime, Bytes::copy_from_slice(&payload))
    }

    pub fn read_string(id: Vs) -> Self {
        Self::new(Opcode::RdVirtString, Bytes::copy_from_slice(&u32::from(id).to_le_bytes()))
    }

    pub fn write_string(id: Vs, data: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(8 + data.len());
        payload.put_u32_le(id.into());
        payload.put_u32_le(data.len() as u32);
        payload.extend_from_slice(data);
        Self::new(Opcode::WrVirtString, payload.freeze())
    }

    pub fn write_sfr(id: Vsfr, value: Option<u32>) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32_le(id.into());
        if let Some(value) = value {
            payload.put_u32_le(value);
        }
        Self::new(Opcode::WrVirtSfr, payload.freeze())
    }

    pub fn read_sfr_batch(ids: &[Vsfr]) -> Self {
        let mut payload = BytesMut::with_capacity(4 * ids.len());
        for id in ids {
            payload.put_u32_le((*id).into());
        }
        Self::new(Opcode::RdVirtSfrBatch, payload.freeze())
    }
}

/// Checked brightness level, `0..=9`.
pub fn brightness_value(level: u8) -> Result<u32, Error> {
    if level > MAX_BRIGHTNESS {
        return Err(Error::Validation(format!(
            "brightness {level} outside 0..={MAX_BRIGHTNESS}"
        )));
    }
    Ok(level as u32)
}

/// Wire value for a display auto-off timeout: 5, 10, 15, 30 s map to 0..=3.
pub fn display_off_value(seconds: u32) -> Result<u32, Error> {
    DISPLAY_OFF_TIMEOUTS
        .iter()
        .position(|&s| s == seconds)
        .map(|i| i as u32)
        .ok_or_else(|| {
            Error::Validation(format!(
                "display off timeout {seconds}s not one of {DISPLAY_OFF_TIMEOUTS:?}"
            ))
        })
}
