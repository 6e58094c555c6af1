//! Byte-stream channels to the device.
//!
//! The engine only needs a half-duplex pipe: write a request, read chunks until
//! a whole response frame has arrived. `Transport` captures that; `Channel`
//! picks one of the concrete realizations at runtime.

pub mod bluetooth;
pub mod usb;

use crate::error::Error;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::time::Duration;

pub use bluetooth::BluetoothTransport;
pub use usb::UsbTransport;

pub trait Transport: Send {
    /// Largest chunk a single read may return.
    fn max_packet_len(&self) -> usize;

    /// Largest complete frame accepted on this link.
    fn max_frame_len(&self) -> usize;

    fn write(&mut self, data: &[u8]) -> impl Future<Output = Result<(), Error>> + Send;

    /// Read up to `max_len` bytes. Returns an empty buffer when nothing arrived
    /// within `timeout`.
    fn read(&mut self, max_len: usize, timeout: Duration) -> impl Future<Output = Result<Bytes, Error>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Which device to talk to, and over what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// First matching USB device, or the one with this serial number.
    Usb { serial_number: Option<String> },
    /// RFCOMM serial port bound to the device, e.g. `/dev/rfcomm0` or `COM5`.
    Bluetooth { port: String },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Usb { serial_number: Some(serial) } => write!(f, "usb:{serial}"),
            Target::Usb { serial_number: None } => write!(f, "usb"),
            Target::Bluetooth { port } => write!(f, "bluetooth:{port}"),
        }
    }
}

/// A transport chosen at runtime.
pub enum Channel {
    Usb(UsbTransport),
    Bluetooth(BluetoothTransport),
}

impl Channel {
    pub async fn open(target: &Target) -> Result<Self, Error> {
        match target {
            Target::Usb { serial_number } => Ok(Channel::Usb(UsbTransport::open(serial_number.as_deref()).await?)),
            Target::Bluetooth { port } => Ok(Channel::Bluetooth(BluetoothTransport::open(port).await?)),
        }
    }
}

impl Transport for Channel {
    fn max_packet_len(&self) -> usize {
        match self {
            Channel::Usb(t) => t.max_packet_len(),
            Channel::Bluetooth(t) => t.max_packet_len(),
        }
    }

    fn max_frame_len(&self) -> usize {
        match self {
            Channel::Usb(t) => t.max_frame_len(),
            Channel::Bluetooth(t) => t.max_frame_len(),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        match self {
            Channel::Usb(t) => t.write(data).await,
            Channel::Bluetooth(t) => t.write(data).await,
        }
    }

    async fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Bytes, Error> {
        match self {
            Channel::Usb(t) => t.read(max_len, timeout).await,
            Channel::Bluetooth(t) => t.read(max_len, timeout).await,
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        match self {
            Channel::Usb(t) => t.close().await,
            Channel::Bluetooth(t) => t.close().await,
        }
    }
}
