use super::Transport;
use crate::error::Error;
use bytes::Bytes;
use nusb::Interface;
use nusb::transfer::RequestBuffer;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

// Constants for USB device identification
pub const VID: u16 = 0x0483;
pub const PID: u16 = 0xF123;
pub const ENDPOINT_OUT: u8 = 0x01;
pub const ENDPOINT_IN: u8 = 0x81;

/// Bulk IN request size
pub const USB_MAX_PACKET: usize = 256;

/// Largest frame accepted over USB (spectra and data buffers fit comfortably)
pub const USB_MAX_FRAME: usize = 64 * 1024;

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// RadiaCode devices currently attached over USB.
pub fn list_devices() -> Result<Vec<nusb::DeviceInfo>, Error> {
    Ok(nusb::list_devices()?
        .filter(|d| d.vendor_id() == VID && d.product_id() == PID)
        .collect())
}

pub struct UsbTransport {
    interface: Option<Interface>,
}

impl UsbTransport {
    /// Find the device (optionally by serial number), claim interface 0 and
    /// discard anything left in the IN endpoint from a previous session.
    pub async fn open(serial_number: Option<&str>) -> Result<Self, Error> {
        info!("Searching for RadiaCode over USB...");
        let device_info = list_devices()?
            .into_iter()
            .find(|d| serial_number.is_none_or(|wanted| d.serial_number() == Some(wanted)))
            .ok_or(Error::DeviceNotFound)?;

        info!(
            bus = device_info.bus_number(),
            addr = device_info.device_address(),
            serial = device_info.serial_number().unwrap_or("<none>"),
            "Found device"
        );

        let device = device_info.open()?;
        let interface = device.detach_and_claim_interface(0)?;
        info!("Interface claimed successfully.");

        let mut transport = Self {
            interface: Some(interface),
        };
        transport.drain().await?;
        Ok(transport)
    }

    async fn drain(&mut self) -> Result<(), Error> {
        let mut discarded = 0;
        loop {
            let chunk = self.read(USB_MAX_PACKET, DRAIN_TIMEOUT).await?;
            if chunk.is_empty() {
                break;
            }
            discarded += chunk.len();
        }
        if discarded > 0 {
            debug!(discarded, "Drained stale USB input");
        }
        Ok(())
    }

    fn interface(&self) -> Result<&Interface, Error> {
        self.interface
            .as_ref()
            .ok_or_else(|| Error::Channel("USB interface already released".to_string()))
    }
}

impl Transport for UsbTransport {
    fn max_packet_len(&self) -> usize {
        USB_MAX_PACKET
    }

    fn max_frame_len(&self) -> usize {
        USB_MAX_FRAME
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        debug!(bytes = hex::encode(data), "USB Write");
        let transfer = self.interface()?.bulk_out(ENDPOINT_OUT, data.to_vec());
        let completion = timeout(WRITE_TIMEOUT, transfer)
            .await
            .map_err(|_| Error::Channel(format!("USB write not accepted within {WRITE_TIMEOUT:?}")))?;
        completion.into_result()?;
        Ok(())
    }

    async fn read(&mut self, max_len: usize, wait: Duration) -> Result<Bytes, Error> {
        let transfer = self.interface()?.bulk_in(ENDPOINT_IN, RequestBuffer::new(max_len));
        match timeout(wait, transfer).await {
            // Dropping the transfer future cancels the pending request.
            Err(_) => Ok(Bytes::new()),
            Ok(completion) => {
                let data = completion.into_result()?;
                debug!(bytes = hex::encode(&data), "USB Read");
                Ok(Bytes::from(data))
            }
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        if self.interface.take().is_some() {
            info!("USB interface released");
        }
        Ok(())
    }
}
