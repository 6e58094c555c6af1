// Protocol constants for RadiaCode 10x devices

use std::time::Duration;

/// Start-of-frame marker preceding every frame in both directions
pub const FRAME_MARKER: [u8; 2] = [0xA5, 0x5A];

/// Size of the little-endian length field that follows the marker
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Size of the command header (opcode u16, reserved u8, sequence u8)
pub const HEADER_SIZE: usize = 4;

/// Size of the trailing Fletcher-16 checksum
pub const CHECKSUM_SIZE: usize = 2;

/// Bytes a frame carries in addition to its payload
pub const FRAME_OVERHEAD: usize = FRAME_MARKER.len() + LENGTH_FIELD_SIZE + HEADER_SIZE + CHECKSUM_SIZE;

/// High bit set on every request sequence number
pub const SEQ_REQUEST_FLAG: u8 = 0x80;

/// Request sequence numbers cycle modulo this value
pub const SEQ_MODULUS: u8 = 32;

/// Return code the firmware uses for a successful virtual register/string access
pub const RETCODE_OK: u32 = 1;

/// Payload of the exchange-setup command sent first during the handshake
pub const SET_EXCHANGE_PAYLOAD: [u8; 4] = [0x01, 0xFF, 0x12, 0xFF];

/// Oldest target firmware the engine speaks to (major, minor)
pub const MIN_FIRMWARE: (u16, u16) = (4, 8);

/// Device ticks are 10 ms each
pub const TICK: Duration = Duration::from_millis(10);

/// Device clock origin relative to the moment DEVICE_TIME is zeroed
pub const DEVICE_CLOCK_OFFSET: Duration = Duration::from_secs(128);

/// Size of the record header in the data buffer (seq, eid, gid, ticks)
pub const DATA_RECORD_HEADER_SIZE: usize = 7;

/// Size of the spectrum header (duration u32, a0, a1, a2 f32)
pub const SPECTRUM_HEADER_SIZE: usize = 16;

/// Brightness levels accepted by the display
pub const MAX_BRIGHTNESS: u8 = 9;

/// Display auto-off timeouts the firmware understands, in seconds
pub const DISPLAY_OFF_TIMEOUTS: [u32; 4] = [5, 10, 15, 30];

/// Unacknowledged device events kept per session; the oldest are dropped beyond this
pub const MAX_PENDING_EVENTS: usize = 256;

/// Consecutive timeouts after which a session is marked degraded
pub const DEFAULT_DEGRADE_THRESHOLD: u32 = 3;

/// Default per-command timeout over USB
pub const USB_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Default per-command timeout over Bluetooth
pub const BLUETOOTH_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
