//! Controller firmware model
//!
//! [`FirmwareModel`] mirrors the device's operating mode on the host side,
//! derived from the commands written and the events received. The
//! [`simulator`] module contains an executable device that speaks the wire
//! protocol, used for tests and `--simulate` runs.

pub mod simulator;

use serde::{Deserialize, Serialize};

use crate::protocol::{Command, InboundEvent};

pub use simulator::{SimulatedFirmware, SimulatedLink, SimulatorConfig, SimulatorHandle, SmsBehavior};

/// Operating mode of the controller as seen from the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FirmwareMode {
    /// Waiting for a command
    Idle,
    /// Matching fingerprints and reporting scans
    AttendanceScanning,
    /// Running the enrollment sequence for sensor slot `id`
    Enrolling { id: u32 },
    /// Blocked on the GSM modem
    SendingSms { recipient: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Busy {
    Enrolling(u32),
    SendingSms(String),
}

/// Host-side mirror of the firmware state
#[derive(Debug, Clone, Default)]
pub struct FirmwareModel {
    scanning: bool,
    busy: Option<Busy>,
}

impl FirmwareModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> FirmwareMode {
        match &self.busy {
            Some(Busy::Enrolling(id)) => FirmwareMode::Enrolling { id: *id },
            Some(Busy::SendingSms(recipient)) => FirmwareMode::SendingSms {
                recipient: recipient.clone(),
            },
            None if self.scanning => FirmwareMode::AttendanceScanning,
            None => FirmwareMode::Idle,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Forget everything; the device just (re)booted
    pub fn reset(&mut self) {
        self.scanning = false;
        self.busy = None;
    }

    /// Update after `cmd` was written to the device
    pub fn on_command_sent(&mut self, cmd: &Command) {
        match cmd {
            Command::StartAttendance => self.scanning = true,
            Command::EndAttendance => self.scanning = false,
            Command::EnrollFinger { id } => {
                // Enrollment suspends scanning and the firmware does not resume it
                self.scanning = false;
                self.busy = Some(Busy::Enrolling(*id));
            }
            Command::SendSms { name, .. } => {
                self.busy = Some(Busy::SendingSms(name.clone()));
            }
            Command::Raw { .. } => {}
        }
    }

    /// Update after an inbound event
    pub fn on_event(&mut self, event: &InboundEvent) {
        match event {
            InboundEvent::Ready => self.reset(),
            InboundEvent::EnrollResult { .. } => {
                if matches!(self.busy, Some(Busy::Enrolling(_))) {
                    self.busy = None;
                }
            }
            InboundEvent::SmsResult { .. } => {
                if matches!(self.busy, Some(Busy::SendingSms(_))) {
                    self.busy = None;
                }
            }
            InboundEvent::ScanResult { fingerprint_id } if !self.scanning => {
                tracing::debug!(
                    "Scan result #{} while attendance mode is off",
                    fingerprint_id
                );
            }
            _ => {}
        }
    }
}
