//! # AttendLink Core Library
//!
//! Host side of the serial link to the fingerprint/GSM attendance controller.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Line-oriented serial protocol (commands, inbound events, framing)
//! - Device discovery and reconnection
//! - Single-flight SMS command queue
//! - Session state and status observers
//! - A simulated controller for tests and demos
//! - Roster helpers for enrollment and SMS batches
//!
//! ## Example
//!
//! ```rust,ignore
//! use attendlink_core::prelude::*;
//!
//! let bridge = Bridge::new(BridgeConfig::default(), Box::new(SerialLink::new()));
//! let _status = bridge.subscribe_status(|s| println!("{:?}: {}", s.state, s.message));
//! let handle = bridge.spawn();
//!
//! handle.start_attendance().await?;
//! handle
//!     .send_sms_batch(vec![SmsRecipient::new(SmsStatus::Present, "Alice", "+919000000001")])
//!     .await?;
//! ```

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod firmware;
pub mod observers;
pub mod protocol;
pub mod roster;
pub mod session;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bridge::{Bridge, BridgeHandle, BridgeSnapshot, ResponseEvent};
    pub use crate::config::BridgeConfig;
    pub use crate::coordinator::Coordinator;
    pub use crate::firmware::{FirmwareMode, SimulatedLink, SimulatorConfig, SimulatorHandle};
    pub use crate::observers::{Observers, Subscription};
    pub use crate::protocol::{
        Command, InboundEvent, ProtocolError, SerialLink, SmsOutcome, SmsRecipient, SmsStatus,
    };
    pub use crate::roster::{AttendanceSheet, StudentRecord};
    pub use crate::session::{DeviceStatus, SessionState};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
