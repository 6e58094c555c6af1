use crate::command::{
    AlertControl, Command, DisplayDirection, Language, Opcode, Vs, Vsfr, brightness_value, display_off_value,
};
use crate::config::ClientConfig;
use crate::databuf::{DataBuffer, RealTimeSample};
use crate::error::Error;
use crate::reply::{
    FirmwareSignature, FirmwareVersion, decode_fw_signature, decode_hw_serial, decode_status, decode_text,
};
use crate::session::{AccumulatedDose, DeviceInfo, EventBatch, EventCursor, Session, SessionState};
use crate::spectrum::{EnergyCalibration, Spectrum};
use crate::transport::{Channel, Target, Transport};
use chrono::NaiveDateTime;
use futures_lite::stream::{self, Stream};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{info, warn};

/// A RadiaCode detector.
///
/// All methods take `&self`; share the client between tasks with an `Arc`.
/// Commands are serialized: one request is on the wire at any time.
pub struct RadiaCode<T: Transport = Channel> {
    session: Mutex<Option<Session<T>>>,
    handshaking: AtomicBool,
    config: ClientConfig,
    target: Option<Target>,
}

impl RadiaCode<Channel> {
    /// Open `target` and perform the handshake.
    pub async fn connect(target: Target, config: ClientConfig) -> Result<Self, Error> {
        let transport = Channel::open(&target).await?;
        let mut client = Self::with_transport(transport, config).await?;
        client.target = Some(target);
        Ok(client)
    }

    /// Connect with the default configuration for the kind of target.
    pub async fn connect_default(target: Target) -> Result<Self, Error> {
        let config = ClientConfig::for_target(&target);
        Self::connect(target, config).await
    }

    /// Reopen the original target and start a new session.
    ///
    /// Allowed from any state; the old channel is closed first.
    pub async fn reconnect(&self) -> Result<(), Error> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| Error::Connect("client was not created from a target".to_string()))?;
        let mut guard = self.session.lock().await;
        close_session(&mut guard).await;
        let transport = Channel::open(target).await?;
        self.establish(&mut guard, transport).await
    }
}

impl<T: Transport> RadiaCode<T> {
    /// Handshake over an already opened transport.
    pub async fn with_transport(transport: T, config: ClientConfig) -> Result<Self, Error> {
        let client = Self {
            session: Mutex::new(None),
            handshaking: AtomicBool::new(false),
            config,
            target: None,
        };
        {
            let mut guard = client.session.lock().await;
            client.establish(&mut guard, transport).await?;
        }
        Ok(client)
    }

    /// Replace the channel with `transport` and start a new session.
    pub async fn reconnect_with(&self, transport: T) -> Result<(), Error> {
        let mut guard = self.session.lock().await;
        close_session(&mut guard).await;
        self.establish(&mut guard, transport).await
    }

    async fn establish(&self, slot: &mut Option<Session<T>>, transport: T) -> Result<(), Error> {
        self.handshaking.store(true, Ordering::SeqCst);
        let result = Session::handshake(transport, &self.config).await;
        self.handshaking.store(false, Ordering::SeqCst);
        *slot = Some(result?);
        Ok(())
    }

    /// Close the channel. Further calls fail with `NotConnected` until a reconnect.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let mut guard = self.session.lock().await;
        match guard.take() {
            Some(mut session) => {
                session.close().await?;
                info!("Disconnected");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub async fn state(&self) -> SessionState {
        if self.handshaking.load(Ordering::SeqCst) {
            return SessionState::Handshaking;
        }
        match self.session.lock().await.as_ref() {
            Some(session) => session.state(),
            None => SessionState::Disconnected,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn session(&self) -> Result<MappedMutexGuard<'_, Session<T>>, Error> {
        let guard = self.session.lock().await;
        MutexGuard::try_map(guard, |slot| slot.as_mut()).map_err(|_| Error::NotConnected)
    }

    async fn ready(&self) -> Result<MappedMutexGuard<'_, Session<T>>, Error> {
        let session = self.session().await?;
        if session.is_degraded() {
            return Err(Error::ReconnectRequired);
        }
        Ok(session)
    }

    pub async fn device_info(&self) -> Result<DeviceInfo, Error> {
        Ok(self.session().await?.info().clone())
    }

    /// Serial number read during the handshake.
    pub async fn get_serial_number(&self) -> Result<String, Error> {
        Ok(self.ready().await?.info().serial_number.clone())
    }

    pub async fn firmware_version(&self) -> Result<FirmwareVersion, Error> {
        Ok(self.session().await?.info().firmware.clone())
    }

    pub async fn get_hw_serial_number(&self) -> Result<String, Error> {
        let reply = self.ready().await?.execute(&Command::bare(Opcode::GetSerial)).await?;
        Ok(decode_hw_serial(&reply)?)
    }

    pub async fn get_status(&self) -> Result<u32, Error> {
        let reply = self.ready().await?.execute(&Command::bare(Opcode::GetStatus)).await?;
        Ok(decode_status(&reply)?)
    }

    pub async fn get_fw_signature(&self) -> Result<FirmwareSignature, Error> {
        let reply = self.ready().await?.execute(&Command::bare(Opcode::FwSignature)).await?;
        Ok(decode_fw_signature(&reply)?)
    }

    /// The device's configuration dump, `key=value` per line.
    pub async fn get_configuration(&self) -> Result<String, Error> {
        self.read_text(Vs::Configuration).await
    }

    pub async fn get_text_message(&self) -> Result<String, Error> {
        self.read_text(Vs::TextMessage).await
    }

    /// Register description table published by the firmware.
    pub async fn get_sfr_file(&self) -> Result<String, Error> {
        self.read_text(Vs::SfrFile).await
    }

    async fn read_text(&self, id: Vs) -> Result<String, Error> {
        let data = self.ready().await?.read_string(id).await?;
        Ok(decode_text(&data))
    }

    /// Current spectrum since the last reset. Also refreshes the cached spectrum
    /// and the session calibration.
    pub async fn get_spectrum(&self) -> Result<Spectrum, Error> {
        self.ready().await?.spectrum(false).await
    }

    /// Spectrum accumulated since the device was first calibrated; not resettable.
    pub async fn get_accumulated_spectrum(&self) -> Result<Spectrum, Error> {
        self.ready().await?.spectrum(true).await
    }

    pub async fn reset_spectrum(&self) -> Result<(), Error> {
        self.ready().await?.reset_spectrum().await
    }

    pub async fn cached_spectrum(&self) -> Result<Option<Spectrum>, Error> {
        Ok(self.session().await?.cached_spectrum().cloned())
    }

    pub async fn get_energy_calibration(&self) -> Result<EnergyCalibration, Error> {
        self.ready().await?.energy_calibration().await
    }

    pub async fn set_energy_calibration(&self, calibration: EnergyCalibration) -> Result<(), Error> {
        if !calibration.is_finite() {
            return Err(Error::Validation(format!("calibration {calibration} is not finite")));
        }
        self.ready().await?.set_energy_calibration(calibration).await
    }

    pub async fn get_accumulated_dose(&self) -> Result<AccumulatedDose, Error> {
        self.ready().await?.accumulated_dose().await
    }

    pub async fn reset_dose(&self) -> Result<(), Error> {
        self.ready().await?.reset_dose().await
    }

    pub async fn cached_dose(&self) -> Result<Option<AccumulatedDose>, Error> {
        Ok(self.session().await?.cached_dose())
    }

    /// Real-time samples in device order.
    ///
    /// Each pull returns a buffered sample or polls the device once. The stream
    /// ends after a poll that produced nothing, or after a command failure; a
    /// damaged or out-of-order record is yielded as an error item and the stream
    /// continues. A new stream starts with a fresh poll: samples a dropped
    /// stream left unread are discarded.
    pub fn get_real_time_samples(&self) -> impl Stream<Item = Result<RealTimeSample, Error>> + '_ {
        stream::unfold(Some((self, true)), |state| async move {
            let (client, first) = state?;
            let item = match client.ready().await {
                Ok(mut session) => {
                    if first {
                        session.start_samples();
                    }
                    session.next_sample().await?
                }
                Err(e) => Err(e),
            };
            let next = match &item {
                Ok(_) | Err(Error::Decode(_)) => Some((client, false)),
                Err(_) => None,
            };
            Some((item, next))
        })
    }

    /// One raw data buffer read. Samples returned here are not queued for the
    /// sample stream; events and dose records still update the session.
    pub async fn read_data_buffer(&self) -> Result<DataBuffer, Error> {
        self.ready().await?.poll_data_buffer().await
    }

    /// Every device event not yet acknowledged, after polling the device once.
    pub async fn read_events(&self) -> Result<EventBatch, Error> {
        self.ready().await?.read_events().await
    }

    /// Mark events up to `cursor` as handled; they will not be returned again.
    pub async fn acknowledge_events(&self, cursor: EventCursor) -> Result<(), Error> {
        self.session().await?.acknowledge_events(cursor);
        Ok(())
    }

    pub async fn read_vsfrs(&self, ids: &[Vsfr]) -> Result<Vec<u32>, Error> {
        self.ready().await?.read_sfrs(ids).await
    }

    /// Brightness level, `0..=9`.
    pub async fn set_display_brightness(&self, level: u8) -> Result<(), Error> {
        let value = brightness_value(level)?;
        self.write_register(Vsfr::DispBrt, value).await
    }

    /// Display auto-off delay: 5, 10, 15 or 30 seconds.
    pub async fn set_display_off_timeout(&self, seconds: u32) -> Result<(), Error> {
        let value = display_off_value(seconds)?;
        self.write_register(Vsfr::DispOffTime, value).await
    }

    pub async fn set_display_direction(&self, direction: DisplayDirection) -> Result<(), Error> {
        self.write_register(Vsfr::DispDir, direction.into()).await
    }

    /// `"ru"` or `"en"`.
    pub async fn set_language(&self, language: &str) -> Result<(), Error> {
        let language: Language = language.parse()?;
        self.write_register(Vsfr::DeviceLang, u32::from(language == Language::English))
            .await
    }

    pub async fn set_sound_enabled(&self, on: bool) -> Result<(), Error> {
        self.write_register(Vsfr::SoundOn, u32::from(on)).await
    }

    pub async fn set_vibration_enabled(&self, on: bool) -> Result<(), Error> {
        self.write_register(Vsfr::VibroOn, u32::from(on)).await
    }

    pub async fn set_device_on(&self, on: bool) -> Result<(), Error> {
        self.write_register(Vsfr::DeviceOn, u32::from(on)).await
    }

    /// Which events sound an alert.
    pub async fn set_sound_alerts(&self, alerts: AlertControl) -> Result<(), Error> {
        self.write_register(Vsfr::SoundCtrl, alerts.bits()).await
    }

    /// Which events vibrate. Clicks cannot vibrate.
    pub async fn set_vibration_alerts(&self, alerts: AlertControl) -> Result<(), Error> {
        if alerts.clicks() {
            return Err(Error::Validation("clicks cannot trigger vibration".to_string()));
        }
        self.write_register(Vsfr::VibroCtrl, alerts.bits()).await
    }

    pub async fn set_local_time(&self, time: NaiveDateTime) -> Result<(), Error> {
        self.ready().await?.set_local_time(time).await
    }

    async fn write_register(&self, id: Vsfr, value: u32) -> Result<(), Error> {
        self.ready().await?.write_sfr(id, Some(value)).await
    }
}

async fn close_session<T: Transport>(slot: &mut Option<Session<T>>) {
    if let Some(mut old) = slot.take() {
        if let Err(e) = old.close().await {
            warn!(error = %e, "Failed to close previous channel");
        }
    }
}
