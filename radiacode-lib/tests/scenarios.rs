mod common;

use common::*;
use futures_lite::StreamExt;
use radiacode_lib::command::{Opcode, Vs, Vsfr};
use radiacode_lib::{ClientConfig, DecodeError, Error, RadiaCode, SampleKind, SessionState};

#[tokio::test(start_paused = true)]
async fn connect_read_serial_disconnect() {
    init_logging();
    let (device, handle) = FakeDevice::new();
    let client = RadiaCode::with_transport(device, ClientConfig::usb()).await.unwrap();
    assert_eq!(client.state().await, SessionState::Ready);

    {
        let state = handle.lock().unwrap();
        assert_eq!(
            &state.opcodes_received[..3],
            &[Opcode::SetExchange, Opcode::SetTime, Opcode::WrVirtSfr]
        );
        assert_eq!(state.register_writes[0], (register(Vsfr::DeviceTime), Some(0)));
    }

    assert_eq!(client.get_serial_number().await.unwrap(), SERIAL);

    client.disconnect().await.unwrap();
    client.disconnect().await.unwrap();
    assert_eq!(handle.lock().unwrap().closes, 1);
    assert_eq!(client.state().await, SessionState::Disconnected);
    assert!(matches!(client.get_serial_number().await, Err(Error::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn spectrum_snapshot_with_calibration() {
    let (device, handle) = FakeDevice::new();
    let mut counts = vec![5u32; 1000];
    counts.resize(1024, 0);
    handle
        .lock()
        .unwrap()
        .strings
        .insert(Vs::Spectrum.into(), spectrum_bytes(120, (0.0, 3.0, 0.0), &counts));

    let client = RadiaCode::with_transport(device, ClientConfig::usb()).await.unwrap();
    let spectrum = client.get_spectrum().await.unwrap();

    assert_eq!(spectrum.duration.as_secs(), 120);
    assert_eq!(spectrum.channel_count(), 1024);
    assert_eq!(spectrum.total_counts(), 5000);
    assert_eq!(spectrum.channel_to_energy(100), 300.0);
    assert_eq!(client.cached_spectrum().await.unwrap(), Some(spectrum));
}

#[tokio::test(start_paused = true)]
async fn real_time_samples_follow_device_order() {
    let (device, handle) = FakeDevice::new();
    {
        let mut state = handle.lock().unwrap();
        state.data_buffers.push_back(realtime_record(0, 100, 12.0, 0.00001));
        state.data_buffers.push_back(realtime_record(0, 200, 13.0, 0.00002));
        // An older sample turning up late.
        state.data_buffers.push_back(realtime_record(0, 150, 11.0, 0.00001));
    }
    let client = RadiaCode::with_transport(device, ClientConfig::usb()).await.unwrap();

    let items: Vec<_> = client.get_real_time_samples().collect().await;
    assert_eq!(items.len(), 3, "{items:?}");

    let first = items[0].as_ref().unwrap();
    let second = items[1].as_ref().unwrap();
    assert_eq!(first.kind, SampleKind::Filtered);
    assert_eq!(first.count_rate, 12.0);
    assert!(second.timestamp > first.timestamp);
    assert!(matches!(
        items[2],
        Err(Error::Decode(DecodeError::OutOfOrder { previous: 200, got: 150 }))
    ));

    // The late sample did not move the watermark; a later one is still accepted.
    handle
        .lock()
        .unwrap()
        .data_buffers
        .push_back(realtime_record(0, 300, 14.0, 0.00002));
    let items: Vec<_> = client.get_real_time_samples().collect().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap().ticks, 300);
}

#[tokio::test(start_paused = true)]
async fn brightness_out_of_range_writes_nothing() {
    let (device, handle) = FakeDevice::new();
    let client = RadiaCode::with_transport(device, ClientConfig::usb()).await.unwrap();
    let before = handle.lock().unwrap().frames_received;

    let err = client.set_display_brightness(15).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err}");
    assert_eq!(handle.lock().unwrap().frames_received, before);

    client.set_display_brightness(9).await.unwrap();
    assert_eq!(
        handle.lock().unwrap().register_writes.last(),
        Some(&(register(Vsfr::DispBrt), Some(9)))
    );
}
