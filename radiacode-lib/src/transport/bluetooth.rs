use super::Transport;
use crate::error::Error;
use bytes::Bytes;
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::{debug, info};

pub const BAUD_RATE: u32 = 115_200;

/// Largest write the device's Bluetooth bridge accepts in one go
pub const BT_MAX_WRITE: usize = 217;

pub const BT_MAX_PACKET: usize = 512;

pub const BT_MAX_FRAME: usize = 64 * 1024;

const OPEN_TIMEOUT: Duration = Duration::from_millis(100);

/// Bluetooth link through an RFCOMM serial port already bound by the OS
/// (`rfcomm bind` on Linux, an outgoing COM port on Windows).
///
/// Port I/O is blocking and runs on tokio's blocking pool.
pub struct BluetoothTransport {
    port: Option<Box<dyn SerialPort>>,
    name: String,
}

impl BluetoothTransport {
    pub async fn open(name: &str) -> Result<Self, Error> {
        info!(port = name, "Opening RadiaCode Bluetooth port...");
        let path = name.to_string();
        let port = tokio::task::spawn_blocking(move || serialport::new(path, BAUD_RATE).timeout(OPEN_TIMEOUT).open())
            .await
            .map_err(|e| Error::Connect(format!("Bluetooth open task failed: {e}")))?
            .map_err(|e| Error::Connect(format!("cannot open {name}: {e}")))?;
        info!(port = name, "Bluetooth port open");

        Ok(Self {
            port: Some(port),
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run blocking port I/O off the async runtime, handing the port back afterwards.
    async fn with_port<R, F>(&mut self, f: F) -> Result<R, Error>
    where
        R: Send + 'static,
        F: FnOnce(&mut Box<dyn SerialPort>) -> Result<R, Error> + Send + 'static,
    {
        let mut port = self
            .port
            .take()
            .ok_or_else(|| Error::Channel(format!("Bluetooth port {} is closed", self.name)))?;
        let (port, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut port);
            (port, result)
        })
        .await
        .map_err(|e| Error::Channel(format!("Bluetooth I/O task failed: {e}")))?;
        self.port = Some(port);
        result
    }
}

impl Transport for BluetoothTransport {
    fn max_packet_len(&self) -> usize {
        BT_MAX_PACKET
    }

    fn max_frame_len(&self) -> usize {
        BT_MAX_FRAME
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        debug!(bytes = hex::encode(data), "Bluetooth Write");
        let data = data.to_vec();
        self.with_port(move |port| {
            for chunk in data.chunks(BT_MAX_WRITE) {
                port.write_all(chunk)?;
            }
            port.flush()?;
            Ok(())
        })
        .await
    }

    async fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Bytes, Error> {
        let data = self
            .with_port(move |port| {
                port.set_timeout(timeout)?;
                let mut buf = vec![0u8; max_len];
                match port.read(&mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        Ok(buf)
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => Ok(Vec::new()),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        if !data.is_empty() {
            debug!(bytes = hex::encode(&data), "Bluetooth Read");
        }
        Ok(Bytes::from(data))
    }

    async fn close(&mut self) -> Result<(), Error> {
        if self.port.take().is_some() {
            info!(port = %self.name, "Bluetooth port closed");
        }
        Ok(())
    }
}
