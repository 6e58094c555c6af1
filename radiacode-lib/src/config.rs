use crate::constants::{BLUETOOTH_COMMAND_TIMEOUT, DEFAULT_DEGRADE_THRESHOLD, USB_COMMAND_TIMEOUT};
use crate::transport::Target;
use std::time::Duration;

/// Tunables for a client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long to wait for the reply to a single command.
    pub command_timeout: Duration,
    /// Consecutive timeouts after which the session is degraded.
    pub degrade_threshold: u32,
    /// Refuse firmware older than 4.8 during the handshake.
    pub check_firmware: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::usb()
    }
}

impl ClientConfig {
    pub fn usb() -> Self {
        Self {
            command_timeout: USB_COMMAND_TIMEOUT,
            degrade_threshold: DEFAULT_DEGRADE_THRESHOLD,
            check_firmware: true,
        }
    }

    /// The Bluetooth link is much slower; large reads need the longer timeout.
    pub fn bluetooth() -> Self {
        Self {
            command_timeout: BLUETOOTH_COMMAND_TIMEOUT,
            ..Self::usb()
        }
    }

    pub fn for_target(target: &Target) -> Self {
        match target {
            Target::Usb { .. } => Self::usb(),
            Target::Bluetooth { .. } => Self::bluetooth(),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_degrade_threshold(mut self, threshold: u32) -> Self {
        self.degrade_threshold = threshold;
        self
    }

    pub fn with_firmware_check(mut self, check: bool) -> Self {
        self.check_firmware = check;
        self
    }
}
