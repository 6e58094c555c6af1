mod common;

use common::*;
use futures_lite::StreamExt;
use radiacode_lib::command::{Opcode, Vs, Vsfr};
use radiacode_lib::constants::MAX_PENDING_EVENTS;
use radiacode_lib::{
    AlertControl, ClientConfig, DataRecord, DisplayDirection, EnergyCalibration, Error, EventKind, RadiaCode,
    SessionState,
};
use std::sync::Arc;
use std::time::Duration;

async fn connected() -> (RadiaCode<FakeDevice>, FakeHandle) {
    let (device, handle) = FakeDevice::new();
    let client = RadiaCode::with_transport(device, ClientConfig::usb()).await.unwrap();
    (client, handle)
}

#[tokio::test(start_paused = true)]
async fn repeated_timeouts_degrade_until_reconnect() {
    let (client, handle) = connected().await;
    handle.lock().unwrap().mute_all = true;

    for _ in 0..3 {
        let err = client.get_status().await.unwrap_err();
        assert!(
            matches!(err, Error::Timeout { opcode: Opcode::GetStatus, state_unknown: false, .. }),
            "{err}"
        );
    }
    assert_eq!(client.state().await, SessionState::Degraded);

    let sent = handle.lock().unwrap().frames_received;
    assert!(matches!(client.get_status().await, Err(Error::ReconnectRequired)));
    assert!(matches!(client.get_spectrum().await, Err(Error::ReconnectRequired)));
    assert_eq!(handle.lock().unwrap().frames_received, sent);

    let (fresh, fresh_handle) = FakeDevice::new();
    client.reconnect_with(fresh).await.unwrap();
    assert_eq!(client.state().await, SessionState::Ready);
    assert_eq!(handle.lock().unwrap().closes, 1);
    assert_eq!(client.get_status().await.unwrap(), 3);
    assert_eq!(fresh_handle.lock().unwrap().closes, 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_on_setting_reports_unknown_state() {
    let (client, handle) = connected().await;
    handle.lock().unwrap().mute.insert(Opcode::WrVirtSfr.into());

    let err = client.set_sound_enabled(true).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { state_unknown: true, .. }), "{err}");
    // One timeout is below the threshold.
    assert_eq!(client.state().await, SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn custom_threshold_and_timeout() {
    let (device, handle) = FakeDevice::new();
    let config = ClientConfig::usb()
        .with_degrade_threshold(1)
        .with_command_timeout(Duration::from_millis(500));
    let client = RadiaCode::with_transport(device, config).await.unwrap();
    handle.lock().unwrap().mute_all = true;

    let started = tokio::time::Instant::now();
    let err = client.get_status().await.unwrap_err();
    assert!(matches!(err, Error::Timeout { after, .. } if after == Duration::from_millis(500)));
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(client.state().await, SessionState::Degraded);
}

#[tokio::test(start_paused = true)]
async fn replies_survive_noise_and_fragmentation() {
    let (device, handle) = FakeDevice::new();
    let device = device.with_chunk(3);
    handle.lock().unwrap().noise = vec![0x00, 0xA5, 0x13, 0x37];
    handle
        .lock()
        .unwrap()
        .strings
        .insert(Vs::Spectrum.into(), spectrum_bytes(10, (1.0, 2.0, 0.0), &[4, 0, 6]));

    let client = RadiaCode::with_transport(device, ClientConfig::usb()).await.unwrap();
    let spectrum = client.get_spectrum().await.unwrap();
    assert_eq!(spectrum.counts, vec![4, 0, 6]);
    assert_eq!(client.get_serial_number().await.unwrap(), SERIAL);
}

#[tokio::test(start_paused = true)]
async fn old_firmware_is_refused() {
    let (device, handle) = FakeDevice::new();
    handle.lock().unwrap().firmware = (4, 7);

    let err = RadiaCode::with_transport(device, ClientConfig::usb())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::IncompatibleFirmware { major: 4, minor: 7 }), "{err}");
    assert!(err.is_connect_error());
    assert_eq!(handle.lock().unwrap().closes, 1);

    let (device, handle) = FakeDevice::new();
    handle.lock().unwrap().firmware = (4, 7);
    let client = RadiaCode::with_transport(device, ClientConfig::usb().with_firmware_check(false))
        .await
        .unwrap();
    assert_eq!(client.firmware_version().await.unwrap().target.minor, 7);
}

#[tokio::test(start_paused = true)]
async fn silent_device_fails_handshake() {
    let (device, handle) = FakeDevice::new();
    handle.lock().unwrap().mute_all = true;

    let err = RadiaCode::with_transport(device, ClientConfig::usb())
        .await
        .err()
        .unwrap();
    let Error::Handshake(inner) = &err else {
        panic!("expected handshake failure, got {err}");
    };
    assert!(matches!(**inner, Error::Timeout { opcode: Opcode::SetExchange, .. }));
    assert_eq!(handle.lock().unwrap().frames_received, 1);
    assert_eq!(handle.lock().unwrap().closes, 1);
}

#[tokio::test(start_paused = true)]
async fn device_info_from_handshake() {
    let (client, _handle) = connected().await;
    let info = client.device_info().await.unwrap();
    assert_eq!(info.serial_number, SERIAL);
    assert_eq!((info.firmware.target.major, info.firmware.target.minor), (4, 12));
    assert_eq!(info.firmware.target.date, "Mar 14 2024");

    assert_eq!(client.get_hw_serial_number().await.unwrap(), "00123456-89ABCDEF");
    let signature = client.get_fw_signature().await.unwrap();
    assert_eq!(signature.signature, 0xDEAD_BEEF);
    assert_eq!(signature.file_name, "rc-102.bin");
    assert!(client.get_configuration().await.unwrap().contains("SpecFormatVersion=0"));
}

#[tokio::test(start_paused = true)]
async fn events_are_redelivered_until_acknowledged() {
    let (client, handle) = connected().await;
    {
        let mut buffer = event_record(0, 100, 4, 0);
        buffer.extend(event_record(1, 200, 19, 0));
        handle.lock().unwrap().data_buffers.push_back(buffer);
    }

    let batch = client.read_events().await.unwrap();
    assert_eq!(batch.events.len(), 2);
    assert_eq!(batch.events[0].kind, EventKind::DoseReset);
    assert_eq!(batch.events[1].kind, EventKind::SpectrumReset);

    // Not acknowledged: the same events come back.
    let again = client.read_events().await.unwrap();
    assert_eq!(again.events, batch.events);

    client.acknowledge_events(batch.cursor.unwrap()).await.unwrap();
    assert!(client.read_events().await.unwrap().events.is_empty());

    // A later event on the acknowledged tick and two identical records are all new.
    {
        let mut buffer = event_record(0, 200, 19, 0);
        buffer.extend(event_record(1, 300, 1, 0));
        buffer.extend(event_record(2, 300, 1, 0));
        handle.lock().unwrap().data_buffers.push_back(buffer);
    }
    let batch = client.read_events().await.unwrap();
    let ticks: Vec<i32> = batch.events.iter().map(|e| e.ticks).collect();
    assert_eq!(ticks, vec![200, 300, 300]);
    assert_eq!(batch.events[1], batch.events[2]);
    assert_eq!(batch.events[2].kind, EventKind::PowerOn);
}

#[tokio::test(start_paused = true)]
async fn pending_events_are_bounded_when_nobody_reads_them() {
    let (client, handle) = connected().await;
    let polls = MAX_PENDING_EVENTS + 44;
    {
        let mut state = handle.lock().unwrap();
        for i in 1..=polls as i32 {
            let mut buffer = realtime_record(0, i * 10, 5.0, 0.00001);
            buffer.extend(event_record(1, i * 10, 4, 0));
            state.data_buffers.push_back(buffer);
        }
    }

    let samples: Vec<_> = client.get_real_time_samples().collect().await;
    assert_eq!(samples.len(), polls);

    let batch = client.read_events().await.unwrap();
    assert_eq!(batch.events.len(), MAX_PENDING_EVENTS);
    assert_eq!(batch.events[0].ticks, 450);
    assert_eq!(batch.events.last().unwrap().ticks, polls as i32 * 10);
}

#[tokio::test(start_paused = true)]
async fn new_sample_stream_polls_instead_of_replaying_leftovers() {
    let (client, handle) = connected().await;
    {
        let mut buffer = realtime_record(0, 100, 10.0, 0.00001);
        buffer.extend(realtime_record(1, 200, 11.0, 0.00001));
        handle.lock().unwrap().data_buffers.push_back(buffer);
    }
    {
        let mut samples = std::pin::pin!(client.get_real_time_samples());
        assert_eq!(samples.next().await.unwrap().unwrap().ticks, 100);
    }

    handle
        .lock()
        .unwrap()
        .data_buffers
        .push_back(realtime_record(0, 300, 12.0, 0.00002));
    let reads = || {
        let state = handle.lock().unwrap();
        state.opcodes_received.iter().filter(|op| **op == Opcode::RdVirtString).count()
    };
    let before = reads();

    let mut samples = std::pin::pin!(client.get_real_time_samples());
    assert_eq!(samples.next().await.unwrap().unwrap().ticks, 300);
    assert_eq!(reads(), before + 1);
}

#[tokio::test(start_paused = true)]
async fn channel_failure_mid_session_requires_reconnect() {
    let (client, handle) = connected().await;
    handle.lock().unwrap().fail_reads = true;

    let err = client.get_status().await.unwrap_err();
    assert!(err.is_channel_error(), "{err}");
    assert_eq!(client.state().await, SessionState::Degraded);

    handle.lock().unwrap().fail_reads = false;
    let sent = handle.lock().unwrap().frames_received;
    assert!(matches!(client.get_serial_number().await, Err(Error::ReconnectRequired)));
    assert!(matches!(client.set_display_brightness(3).await, Err(Error::ReconnectRequired)));
    assert_eq!(handle.lock().unwrap().frames_received, sent);
}

#[tokio::test(start_paused = true)]
async fn state_is_handshaking_while_reconnecting() {
    let (client, handle) = connected().await;
    let client = Arc::new(client);
    let (silent, silent_handle) = FakeDevice::new();
    silent_handle.lock().unwrap().mute_all = true;

    let task = {
        let client = client.clone();
        tokio::spawn(async move { client.reconnect_with(silent).await })
    };
    // Let the reconnect run up to its first unanswered command.
    tokio::task::yield_now().await;
    assert_eq!(client.state().await, SessionState::Handshaking);

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Handshake(_)), "{err}");
    assert_eq!(client.state().await, SessionState::Disconnected);
    assert_eq!(handle.lock().unwrap().closes, 1);
    assert_eq!(silent_handle.lock().unwrap().closes, 1);
}

#[tokio::test(start_paused = true)]
async fn dose_cache_changes_only_after_acknowledged_reset() {
    let (client, handle) = connected().await;
    handle
        .lock()
        .unwrap()
        .data_buffers
        .push_back(rare_record(0, 50, 7200, 2.5));

    let buffer = client.read_data_buffer().await.unwrap();
    assert!(matches!(buffer.records[0], DataRecord::Rare(ref r) if r.temperature_c == 22.0));
    let cached = client.cached_dose().await.unwrap().unwrap();
    assert_eq!(cached.dose, 2.5);
    assert_eq!(cached.duration, Some(Duration::from_secs(7200)));

    handle.lock().unwrap().refuse.insert(register(Vsfr::DoseReset));
    let err = client.reset_dose().await.unwrap_err();
    assert!(matches!(err, Error::Rejected { opcode: Opcode::WrVirtSfr, code: 0 }), "{err}");
    assert_eq!(client.cached_dose().await.unwrap().unwrap().dose, 2.5);

    handle.lock().unwrap().refuse.clear();
    client.reset_dose().await.unwrap();
    assert_eq!(client.cached_dose().await.unwrap().unwrap().dose, 0.0);
    assert_eq!(
        handle.lock().unwrap().register_writes.last(),
        Some(&(register(Vsfr::DoseReset), None))
    );
}

#[tokio::test(start_paused = true)]
async fn accumulated_dose_from_register() {
    let (client, handle) = connected().await;
    handle
        .lock()
        .unwrap()
        .registers
        .insert(register(Vsfr::DsUr), 1.25f32.to_bits());

    let dose = client.get_accumulated_dose().await.unwrap();
    assert_eq!(dose.dose, 1.25);
    assert_eq!(dose.duration, None);
    assert!(!dose.overload);

    handle
        .lock()
        .unwrap()
        .registers
        .insert(register(Vsfr::DsUr), f32::INFINITY.to_bits());
    assert!(client.get_accumulated_dose().await.unwrap().overload);
}

#[tokio::test(start_paused = true)]
async fn spectrum_reset_clears_cache() {
    let (client, handle) = connected().await;
    handle
        .lock()
        .unwrap()
        .strings
        .insert(Vs::Spectrum.into(), spectrum_bytes(30, (0.0, 3.0, 0.0), &[1, 2, 3, 4]));

    client.get_spectrum().await.unwrap();
    client.reset_spectrum().await.unwrap();

    let cached = client.cached_spectrum().await.unwrap().unwrap();
    assert_eq!(cached.counts, vec![0; 4]);
    assert_eq!(cached.duration, Duration::ZERO);
    assert_eq!(
        handle.lock().unwrap().string_writes.last(),
        Some(&(u32::from(Vs::Spectrum), Vec::new()))
    );
}

#[tokio::test(start_paused = true)]
async fn energy_calibration_round_trip() {
    let (client, _handle) = connected().await;
    assert_eq!(
        client.get_energy_calibration().await.unwrap(),
        EnergyCalibration::new(0.0, 3.0, 0.0)
    );

    let updated = EnergyCalibration::new(-2.0, 2.9, 0.0003);
    client.set_energy_calibration(updated).await.unwrap();
    assert_eq!(client.get_energy_calibration().await.unwrap(), updated);

    let err = client
        .set_energy_calibration(EnergyCalibration::new(f32::NAN, 1.0, 0.0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test(start_paused = true)]
async fn settings_write_expected_registers() {
    let (client, handle) = connected().await;

    client.set_vibration_enabled(true).await.unwrap();
    client.set_sound_enabled(false).await.unwrap();
    client.set_display_off_timeout(30).await.unwrap();
    client.set_display_off_timeout(5).await.unwrap();
    client.set_language("en").await.unwrap();
    client.set_display_direction(DisplayDirection::Left).await.unwrap();
    client.set_device_on(true).await.unwrap();
    client
        .set_sound_alerts(AlertControl::new().with_clicks(true).with_dose_alarm_1(true))
        .await
        .unwrap();

    let writes = handle.lock().unwrap().register_writes.clone();
    let tail = &writes[writes.len() - 8..];
    assert_eq!(
        tail,
        &[
            (register(Vsfr::VibroOn), Some(1)),
            (register(Vsfr::SoundOn), Some(0)),
            (register(Vsfr::DispOffTime), Some(3)),
            (register(Vsfr::DispOffTime), Some(0)),
            (register(Vsfr::DeviceLang), Some(1)),
            (register(Vsfr::DispDir), Some(2)),
            (register(Vsfr::DeviceOn), Some(1)),
            (register(Vsfr::SoundCtrl), Some(0b0010_0010)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_settings_are_rejected_before_io() {
    let (client, handle) = connected().await;
    let before = handle.lock().unwrap().frames_received;

    assert!(matches!(client.set_display_off_timeout(20).await, Err(Error::Validation(_))));
    assert!(matches!(client.set_language("de").await, Err(Error::Validation(_))));
    assert!(matches!(
        client.set_vibration_alerts(AlertControl::new().with_clicks(true)).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(client.read_vsfrs(&[]).await, Err(Error::Validation(_))));

    assert_eq!(handle.lock().unwrap().frames_received, before);
}

#[tokio::test(start_paused = true)]
async fn batch_register_read() {
    let (client, handle) = connected().await;
    {
        let mut state = handle.lock().unwrap();
        state.registers.insert(register(Vsfr::Cps), 42);
        state.registers.insert(register(Vsfr::DispBrt), 6);
    }
    let values = client.read_vsfrs(&[Vsfr::Cps, Vsfr::DispBrt, Vsfr::DeviceOn]).await.unwrap();
    assert_eq!(values, vec![42, 6, 0]);
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_client() {
    let (client, handle) = connected().await;
    let client = std::sync::Arc::new(client);

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.get_status().await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 3);
    }
    let state = handle.lock().unwrap();
    let statuses = state.opcodes_received.iter().filter(|op| **op == Opcode::GetStatus).count();
    assert_eq!(statuses, 4);
}
