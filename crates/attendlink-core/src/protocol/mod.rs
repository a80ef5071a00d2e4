//! Serial Protocol Communication
//!
//! Implements the line-oriented ASCII protocol spoken by the attendance
//! controller (fingerprint sensor + GSM modem on a microcontroller).
//!
//! Outbound commands are `\n` terminated, inbound responses arrive `\r\n`
//! terminated. Only SMS dispatch requires a terminal acknowledgement from the
//! device before the next SMS may be sent.

pub mod codec;
pub mod commands;
mod error;
pub mod events;
pub mod serial;
pub mod stream;

pub use codec::LineCodec;
pub use commands::{decode_name, encode_name, Command, CommandKind, SmsRecipient, SmsStatus};
pub use error::ProtocolError;
pub use events::{classify, EnrollStage, InboundEvent, SmsOutcome};
pub use serial::{list_ports, open_port, scan_ports, PortInfo, TargetMatcher};
pub use stream::{Channel, DeviceLink, SerialLink, Transport};

/// Default baud rate of the controller's USB serial link
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Interval between discovery polls while no device is found
pub const DISCOVERY_RETRY_MS: u64 = 5000;

/// Delay before re-scanning after a known-good device was lost
pub const RECONNECT_DELAY_MS: u64 = 3000;

/// Wait for the ready marker after a port opens. The firmware boot
/// (sensor check plus GSM init) takes about 6s.
pub const READY_TIMEOUT_MS: u64 = 15_000;

/// Ceiling the firmware waits for a modem result before reporting a timeout
pub const FIRMWARE_SMS_TIMEOUT_MS: u64 = 30_000;

/// Host-side ack watchdog. Sits above the firmware timeout plus its 5s
/// post-send pause so it only fires when the terminal event itself was lost.
pub const DEFAULT_ACK_WATCHDOG_MS: u64 = 45_000;

/// Maximum accepted length of a single inbound line
pub const MAX_LINE_LENGTH: usize = 1024;

/// Marker the firmware prints once boot completes
pub const READY_MARKER: &str = "ARDUINO_READY";
