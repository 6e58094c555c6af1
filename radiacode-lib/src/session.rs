//! Per-connection state: negotiated parameters, calibration, cached
//! accumulators and the cursors over the device's data stream.

use crate::command::{Command, Opcode, Vs, Vsfr};
use crate::config::ClientConfig;
use crate::constants::{DEVICE_CLOCK_OFFSET, MAX_PENDING_EVENTS, MIN_FIRMWARE, SET_EXCHANGE_PAYLOAD};
use crate::databuf::{DataBuffer, DataRecord, DeviceEvent, RareData, RealTimeSample, SampleKind, decode_data_buffer};
use crate::dispatcher::Dispatcher;
use crate::error::{DecodeError, Error};
use crate::reply::{
    FirmwareVersion, decode_energy_calibration, decode_firmware_version, decode_sfr_batch, decode_text,
    decode_virt_string, decode_write_ack, spectrum_format_from_config,
};
use crate::spectrum::{EnergyCalibration, Spectrum, SpectrumFormat, decode_spectrum};
use crate::transport::Transport;
use bytes::Bytes;
use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use strum_macros::Display;
use tracing::{debug, info, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Ready,
    /// Too many timeouts or a transport failure; only reconnect or disconnect help.
    Degraded,
}

/// What the handshake learned about the device.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    pub serial_number: String,
    pub firmware: FirmwareVersion,
    pub spectrum_format: SpectrumFormat,
    /// Wall-clock time corresponding to device tick 0.
    pub base_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AccumulatedDose {
    /// Dose since the last reset, in device units.
    pub dose: f32,
    /// Accumulation time, when the device has reported it.
    pub duration: Option<Duration>,
    /// The device reported a value it cannot represent.
    pub overload: bool,
}

impl AccumulatedDose {
    pub fn zero() -> Self {
        Self {
            dose: 0.0,
            duration: Some(Duration::ZERO),
            overload: false,
        }
    }

    fn from_rare(rare: &RareData) -> Self {
        Self {
            dose: rare.dose,
            duration: Some(Duration::from_secs(rare.duration_s as u64)),
            overload: !rare.dose.is_finite() || rare.dose < 0.0,
        }
    }
}

/// Position in the session's event log up to which events have been handled.
///
/// Events are numbered in arrival order, so events sharing a device tick stay
/// distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventCursor(u64);

/// Events not yet acknowledged, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub events: Vec<DeviceEvent>,
    /// Pass to `acknowledge_events` once the batch has been handled.
    pub cursor: Option<EventCursor>,
}

pub struct Session<T: Transport> {
    dispatcher: Dispatcher<T>,
    command_timeout: Duration,
    info: DeviceInfo,
    calibration: EnergyCalibration,
    spectrum: Option<Spectrum>,
    dose: Option<AccumulatedDose>,
    rare: Option<RareData>,
    samples: VecDeque<Result<RealTimeSample, DecodeError>>,
    last_filtered: Option<i32>,
    last_raw: Option<i32>,
    /// Unacknowledged events with their arrival number, capped at `MAX_PENDING_EVENTS`.
    events: VecDeque<(u64, DeviceEvent)>,
    events_received: u64,
    event_cursor: Option<EventCursor>,
}

impl<T: Transport> Session<T> {
    /// Run the start-up exchange on a freshly opened transport.
    ///
    /// The transport is closed again if the handshake fails.
    pub async fn handshake(transport: T, config: &ClientConfig) -> Result<Self, Error> {
        let mut dispatcher = Dispatcher::new(transport, config.degrade_threshold);
        match negotiate(&mut dispatcher, config).await {
            Ok((info, calibration)) => {
                info!(
                    serial = %info.serial_number,
                    firmware = %info.firmware.target,
                    format = ?info.spectrum_format,
                    "Session ready"
                );
                Ok(Self {
                    dispatcher,
                    command_timeout: config.command_timeout,
                    info,
                    calibration,
                    spectrum: None,
                    dose: None,
                    rare: None,
                    samples: VecDeque::new(),
                    last_filtered: None,
                    last_raw: None,
                    events: VecDeque::new(),
                    events_received: 0,
                    event_cursor: None,
                })
            }
            Err(e) => {
                if let Err(close_err) = dispatcher.close().await {
                    warn!(error = %close_err, "Failed to close transport after handshake error");
                }
                match e {
                    Error::IncompatibleFirmware { .. } => Err(e),
                    other => Err(Error::Handshake(Box::new(other))),
                }
            }
        }
    }

    pub fn state(&self) -> SessionState {
        if self.dispatcher.is_degraded() {
            SessionState::Degraded
        } else {
            SessionState::Ready
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.dispatcher.is_degraded()
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn calibration(&self) -> EnergyCalibration {
        self.calibration
    }

    pub fn cached_spectrum(&self) -> Option<&Spectrum> {
        self.spectrum.as_ref()
    }

    pub fn cached_dose(&self) -> Option<AccumulatedDose> {
        self.dose
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        self.dispatcher.close().await
    }

    pub async fn execute(&mut self, command: &Command) -> Result<Bytes, Error> {
        self.dispatcher.execute(command, self.command_timeout).await
    }

    pub async fn read_string(&mut self, id: Vs) -> Result<Bytes, Error> {
        read_string(&mut self.dispatcher, self.command_timeout, id).await
    }

    pub async fn write_string(&mut self, id: Vs, data: &[u8]) -> Result<(), Error> {
        let reply = self.execute(&Command::write_string(id, data)).await?;
        decode_write_ack(&reply).map_err(|e| rejected(Opcode::WrVirtString, e))
    }

    pub async fn write_sfr(&mut self, id: Vsfr, value: Option<u32>) -> Result<(), Error> {
        write_sfr(&mut self.dispatcher, self.command_timeout, id, value).await
    }

    pub async fn read_sfrs(&mut self, ids: &[Vsfr]) -> Result<Vec<u32>, Error> {
        if ids.is_empty() {
            return Err(Error::Validation("no registers requested".to_string()));
        }
        let reply = self.execute(&Command::read_sfr_batch(ids)).await?;
        Ok(decode_sfr_batch(&reply, ids.len())?)
    }

    /// Read the current (resettable) or the accumulated spectrum.
    pub async fn spectrum(&mut self, accumulated: bool) -> Result<Spectrum, Error> {
        let id = if accumulated { Vs::SpecAccum } else { Vs::Spectrum };
        let data = self.read_string(id).await?;
        let spectrum = decode_spectrum(&data, self.info.spectrum_format)?;
        self.calibration = spectrum.calibration;

        if !accumulated {
            if let Some(previous) = &self.spectrum {
                if spectrum.duration < previous.duration {
                    warn!(
                        previous = previous.duration.as_secs(),
                        now = spectrum.duration.as_secs(),
                        "Spectrum duration went backwards; reset outside this session?"
                    );
                }
            }
            self.spectrum = Some(spectrum.clone());
        }
        Ok(spectrum)
    }

    pub async fn reset_spectrum(&mut self) -> Result<(), Error> {
        self.write_string(Vs::Spectrum, &[]).await?;
        let calibration = self.calibration;
        self.spectrum = self
            .spectrum
            .as_ref()
            .map(|s| Spectrum::empty(s.channel_count(), calibration));
        debug!("Spectrum reset acknowledged");
        Ok(())
    }

    pub async fn reset_dose(&mut self) -> Result<(), Error> {
        self.write_sfr(Vsfr::DoseReset, None).await?;
        self.dose = Some(AccumulatedDose::zero());
        self.rare = None;
        debug!("Dose reset acknowledged");
        Ok(())
    }

    pub async fn energy_calibration(&mut self) -> Result<EnergyCalibration, Error> {
        self.calibration = read_calibration(&mut self.dispatcher, self.command_timeout).await?;
        Ok(self.calibration)
    }

    pub async fn set_energy_calibration(&mut self, calibration: EnergyCalibration) -> Result<(), Error> {
        self.write_string(Vs::EnergyCalib, &calibration.to_bytes()).await?;
        self.calibration = calibration;
        Ok(())
    }

    pub async fn accumulated_dose(&mut self) -> Result<AccumulatedDose, Error> {
        let values = self.read_sfrs(&[Vsfr::DsUr]).await?;
        let dose = f32::from_bits(values[0]);
        let result = AccumulatedDose {
            dose,
            duration: self.rare.map(|r| Duration::from_secs(r.duration_s as u64)),
            overload: !dose.is_finite() || dose < 0.0,
        };
        self.dose = Some(result);
        Ok(result)
    }

    /// Read and decode the device data buffer, folding it into the session caches.
    pub async fn poll_data_buffer(&mut self) -> Result<DataBuffer, Error> {
        let data = self.read_string(Vs::DataBuf).await?;
        let buffer = decode_data_buffer(&data, self.info.base_time);
        if let Some(e) = &buffer.error {
            warn!(error = %e, decoded = buffer.records.len(), "Data buffer ended in a damaged record");
        }
        for record in &buffer.records {
            match record {
                DataRecord::Rare(rare) => {
                    self.rare = Some(*rare);
                    self.dose = Some(AccumulatedDose::from_rare(rare));
                }
                DataRecord::Event(event) => self.record_event(*event),
                DataRecord::Sample(_) | DataRecord::DoseRate(_) => {}
            }
        }
        Ok(buffer)
    }

    fn record_event(&mut self, event: DeviceEvent) {
        if self.events.len() >= MAX_PENDING_EVENTS {
            if let Some((_, dropped)) = self.events.pop_front() {
                warn!(
                    ticks = dropped.ticks,
                    kind = %dropped.kind,
                    limit = MAX_PENDING_EVENTS,
                    "Too many unacknowledged events, dropping the oldest"
                );
            }
        }
        self.events_received += 1;
        self.events.push_back((self.events_received, event));
    }

    /// Queue the real-time samples of `buffer`, enforcing increasing ticks per kind.
    fn queue_samples(&mut self, buffer: &DataBuffer) {
        for record in &buffer.records {
            let DataRecord::Sample(sample) = record else {
                continue;
            };
            let last = match sample.kind {
                SampleKind::Filtered => &mut self.last_filtered,
                SampleKind::Raw => &mut self.last_raw,
            };
            match *last {
                Some(previous) if sample.ticks <= previous => {
                    warn!(previous, got = sample.ticks, kind = %sample.kind, "Out-of-order sample");
                    self.samples.push_back(Err(DecodeError::OutOfOrder {
                        previous,
                        got: sample.ticks,
                    }));
                }
                _ => {
                    *last = Some(sample.ticks);
                    self.samples.push_back(Ok(*sample));
                }
            }
        }
        if let Some(e) = &buffer.error {
            self.samples.push_back(Err(e.clone()));
        }
    }

    /// Forget samples queued for an earlier stream so the next pull polls the device.
    pub fn start_samples(&mut self) {
        if !self.samples.is_empty() {
            debug!(dropped = self.samples.len(), "Discarding samples of a previous stream");
            self.samples.clear();
        }
    }

    /// Next real-time sample, polling the device once if none is queued.
    ///
    /// `None` means the poll produced nothing.
    pub async fn next_sample(&mut self) -> Option<Result<RealTimeSample, Error>> {
        if self.samples.is_empty() {
            match self.poll_data_buffer().await {
                Ok(buffer) => self.queue_samples(&buffer),
                Err(e) => return Some(Err(e)),
            }
        }
        self.samples.pop_front().map(|item| item.map_err(Error::from))
    }

    /// Poll once and return every event not yet acknowledged.
    pub async fn read_events(&mut self) -> Result<EventBatch, Error> {
        let buffer = self.poll_data_buffer().await?;
        self.queue_samples(&buffer);
        Ok(EventBatch {
            events: self.events.iter().map(|(_, event)| *event).collect(),
            cursor: self.events.back().map(|(n, _)| EventCursor(*n)).or(self.event_cursor),
        })
    }

    pub fn acknowledge_events(&mut self, cursor: EventCursor) {
        if self.event_cursor.is_some_and(|current| cursor <= current) {
            return;
        }
        self.events.retain(|(n, _)| *n > cursor.0);
        self.event_cursor = Some(cursor);
    }

    pub async fn set_local_time(&mut self, time: NaiveDateTime) -> Result<(), Error> {
        self.execute(&Command::set_time(time)).await?;
        Ok(())
    }
}

async fn read_string<T: Transport>(dispatcher: &mut Dispatcher<T>, timeout: Duration, id: Vs) -> Result<Bytes, Error> {
    let reply = dispatcher.execute(&Command::read_string(id), timeout).await?;
    decode_virt_string(&reply).map_err(|e| rejected(Opcode::RdVirtString, e))
}

async fn write_sfr<T: Transport>(
    dispatcher: &mut Dispatcher<T>,
    timeout: Duration,
    id: Vsfr,
    value: Option<u32>,
) -> Result<(), Error> {
    let reply = dispatcher.execute(&Command::write_sfr(id, value), timeout).await?;
    decode_write_ack(&reply).map_err(|e| rejected(Opcode::WrVirtSfr, e))
}

async fn read_calibration<T: Transport>(
    dispatcher: &mut Dispatcher<T>,
    timeout: Duration,
) -> Result<EnergyCalibration, Error> {
    let data = read_string(dispatcher, timeout, Vs::EnergyCalib).await?;
    Ok(decode_energy_calibration(&data)?)
}

fn rejected(opcode: Opcode, error: DecodeError) -> Error {
    match error {
        DecodeError::ReturnCode(code) => Error::Rejected { opcode, code },
        other => Error::Decode(other),
    }
}

async fn negotiate<T: Transport>(
    dispatcher: &mut Dispatcher<T>,
    config: &ClientConfig,
) -> Result<(DeviceInfo, EnergyCalibration), Error> {
    let timeout = config.command_timeout;

    dispatcher.execute(&Command::set_exchange(&SET_EXCHANGE_PAYLOAD), timeout).await?;
    dispatcher
        .execute(&Command::set_time(Local::now().naive_local()), timeout)
        .await?;
    write_sfr(dispatcher, timeout, Vsfr::DeviceTime, Some(0)).await?;
    let base_time = Utc::now() + TimeDelta::from_std(DEVICE_CLOCK_OFFSET).unwrap_or_default();

    let reply = dispatcher.execute(&Command::bare(Opcode::GetVersion), timeout).await?;
    let firmware = decode_firmware_version(&reply)?;
    debug!(boot = %firmware.boot, target = %firmware.target, "Firmware version");
    let (major, minor) = MIN_FIRMWARE;
    if !firmware.at_least(major, minor) {
        if config.check_firmware {
            return Err(Error::IncompatibleFirmware {
                major: firmware.target.major,
                minor: firmware.target.minor,
            });
        }
        warn!(version = %firmware.target, "Firmware older than supported, continuing anyway");
    }

    let configuration = decode_text(&read_string(dispatcher, timeout, Vs::Configuration).await?);
    let spectrum_format = match spectrum_format_from_config(&configuration) {
        Some(version) => SpectrumFormat::try_from(version)?,
        None => SpectrumFormat::default(),
    };

    let serial_number = decode_text(&read_string(dispatcher, timeout, Vs::SerialNumber).await?);
    let calibration = read_calibration(dispatcher, timeout).await?;

    Ok((
        DeviceInfo {
            serial_number,
            firmware,
            spectrum_format,
            base_time,
        },
        calibration,
    ))
}
