//! Inbound events
//!
//! Every line the controller prints is classified into exactly one
//! [`InboundEvent`]. Lines that match no known marker are kept as
//! [`InboundEvent::Info`] so nothing the device says is lost.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::commands::decode_name;
use super::READY_MARKER;

const FINGER_SCANNED: &str = "FINGER_SCANNED,";
const ENROLL_START: &str = "ENROLL_START,";
const ENROLL_INFO: &str = "ENROLL_INFO,";
const ENROLL_SUCCESS: &str = "ENROLL_SUCCESS,";
const ENROLL_FAIL: &str = "ENROLL_FAIL,";
const SMS_SENT_OK: &str = "SMS_SENT_OK,";
const SMS_SENT_FAIL: &str = "SMS_SENT_FAIL,";
const SMS_TIMEOUT: &str = "ERR:Timeout_for_";
const SMS_REJECTED: &str = "ERR:Invalid_SMS_command_format";
const INFO: &str = "INFO:";
const ERR: &str = "ERR:";

/// Step of the on-device enrollment sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum EnrollStage {
    /// Enrollment began for sensor slot `id`
    Started { id: u32 },
    /// Waiting for the first finger placement
    PlaceFinger,
    /// Waiting for the finger to be lifted
    RemoveFinger,
    /// Waiting for the same finger again
    PlaceAgain,
    /// Progress text the host does not recognize
    Other { text: String },
}

/// Terminal outcome of an SMS dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmsOutcome {
    /// Modem reported OK
    Sent,
    /// Modem reported ERROR/FAIL
    Failed,
    /// No modem result within the firmware's 30s ceiling
    TimedOut,
    /// Firmware refused the frame (missing phone field)
    Rejected,
}

/// A classified line received from the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Device finished booting and accepts commands
    Ready,

    /// Unsolicited fingerprint match while in attendance mode
    ScanResult { fingerprint_id: u32 },

    /// Enrollment progress marker
    EnrollProgress { stage: EnrollStage },

    /// Enrollment finished; `id` is only known on success
    EnrollResult {
        id: Option<u32>,
        success: bool,
        reason: Option<String>,
    },

    /// Terminal event of an SMS command. `recipient` is the display name the
    /// firmware echoes back; it is empty for [`SmsOutcome::Rejected`].
    SmsResult {
        recipient: String,
        outcome: SmsOutcome,
    },

    /// Diagnostic text, or any line that matched no marker
    Info { text: String },

    /// Diagnostic error text
    Error { text: String },
}

impl InboundEvent {
    /// Check if this event resolves an outstanding ack-requiring command
    pub fn is_terminal(&self) -> bool {
        matches!(self, InboundEvent::SmsResult { .. })
    }

    /// SMS success flag, if this is an SMS terminal event
    pub fn sms_success(&self) -> Option<bool> {
        match self {
            InboundEvent::SmsResult { outcome, .. } => Some(*outcome == SmsOutcome::Sent),
            _ => None,
        }
    }
}

impl fmt::Display for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundEvent::Ready => write!(f, "Attendance system ready"),
            InboundEvent::ScanResult { fingerprint_id } => {
                write!(f, "Fingerprint #{} scanned", fingerprint_id)
            }
            InboundEvent::EnrollProgress { stage } => match stage {
                EnrollStage::Started { id } => write!(f, "Enrolling ID #{}", id),
                EnrollStage::PlaceFinger => write!(f, "Place finger on sensor"),
                EnrollStage::RemoveFinger => write!(f, "Remove finger"),
                EnrollStage::PlaceAgain => write!(f, "Place same finger again"),
                EnrollStage::Other { text } => write!(f, "{}", text),
            },
            InboundEvent::EnrollResult {
                id: Some(id),
                success: true,
                ..
            } => write!(f, "Enrollment successful (ID #{})", id),
            InboundEvent::EnrollResult { reason, .. } => write!(
                f,
                "Enrollment failed: {}",
                reason.as_deref().unwrap_or("unknown reason")
            ),
            InboundEvent::SmsResult { recipient, outcome } => match outcome {
                SmsOutcome::Sent => write!(f, "SMS sent to {}", recipient),
                SmsOutcome::Failed => write!(f, "SMS to {} failed", recipient),
                SmsOutcome::TimedOut => write!(f, "SMS to {} timed out", recipient),
                SmsOutcome::Rejected => write!(f, "SMS command rejected by device"),
            },
            InboundEvent::Info { text } => write!(f, "{}", text),
            InboundEvent::Error { text } => write!(f, "Error: {}", text),
        }
    }
}

/// Classify one inbound line.
///
/// Returns `None` only for lines that are empty after trimming.
pub fn classify(line: &str) -> Option<InboundEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let event = if line.contains(READY_MARKER) {
        InboundEvent::Ready
    } else if let Some(rest) = line.strip_prefix(FINGER_SCANNED) {
        match parse_id(rest) {
            Some(fingerprint_id) => InboundEvent::ScanResult { fingerprint_id },
            None => unrecognized(line),
        }
    } else if let Some(rest) = line.strip_prefix(ENROLL_START) {
        match parse_id(rest) {
            Some(id) => InboundEvent::EnrollProgress {
                stage: EnrollStage::Started { id },
            },
            None => unrecognized(line),
        }
    } else if let Some(rest) = line.strip_prefix(ENROLL_INFO) {
        InboundEvent::EnrollProgress {
            stage: enroll_stage(rest),
        }
    } else if let Some(rest) = line.strip_prefix(ENROLL_SUCCESS) {
        InboundEvent::EnrollResult {
            id: parse_id(rest),
            success: true,
            reason: None,
        }
    } else if let Some(rest) = line.strip_prefix(ENROLL_FAIL) {
        InboundEvent::EnrollResult {
            id: None,
            success: false,
            reason: Some(decode_name(rest.trim())),
        }
    } else if let Some(rest) = line.strip_prefix(SMS_SENT_OK) {
        sms_result(rest, SmsOutcome::Sent)
    } else if let Some(rest) = line.strip_prefix(SMS_SENT_FAIL) {
        sms_result(rest, SmsOutcome::Failed)
    } else if let Some(rest) = line.strip_prefix(SMS_TIMEOUT) {
        sms_result(rest, SmsOutcome::TimedOut)
    } else if line.starts_with(SMS_REJECTED) {
        InboundEvent::SmsResult {
            recipient: String::new(),
            outcome: SmsOutcome::Rejected,
        }
    } else if let Some(rest) = line.strip_prefix(INFO) {
        InboundEvent::Info {
            text: decode_name(rest.trim()),
        }
    } else if let Some(rest) = line.strip_prefix(ERR) {
        InboundEvent::Error {
            text: decode_name(rest.trim()),
        }
    } else {
        unrecognized(line)
    };

    Some(event)
}

fn parse_id(field: &str) -> Option<u32> {
    field.trim().parse().ok()
}

fn sms_result(rest: &str, outcome: SmsOutcome) -> InboundEvent {
    InboundEvent::SmsResult {
        recipient: decode_name(rest.trim()),
        outcome,
    }
}

fn enroll_stage(text: &str) -> EnrollStage {
    let lower = text.to_ascii_lowercase();
    if lower.contains("again") {
        EnrollStage::PlaceAgain
    } else if lower.contains("remove") {
        EnrollStage::RemoveFinger
    } else if lower.contains("place") {
        EnrollStage::PlaceFinger
    } else {
        EnrollStage::Other {
            text: decode_name(text.trim()),
        }
    }
}

fn unrecognized(line: &str) -> InboundEvent {
    tracing::debug!("unrecognized device line: {:?}", line);
    InboundEvent::Info {
        text: line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scan_result() {
        assert_eq!(
            classify("FINGER_SCANNED,7"),
            Some(InboundEvent::ScanResult { fingerprint_id: 7 })
        );
        assert_eq!(
            classify("FINGER_SCANNED,7\r"),
            Some(InboundEvent::ScanResult { fingerprint_id: 7 })
        );
    }

    #[test]
    fn test_ready_marker() {
        assert_eq!(classify("ARDUINO_READY"), Some(InboundEvent::Ready));
        // Boot noise on the same line still counts
        assert_eq!(classify("\u{0}\u{7f}ARDUINO_READY"), Some(InboundEvent::Ready));
    }

    #[test]
    fn test_enroll_sequence() {
        let lines = [
            "ENROLL_START,5",
            "ENROLL_INFO,Place_finger_on_sensor",
            "ENROLL_INFO,Remove_finger",
            "ENROLL_INFO,Place_same_finger_again",
            "ENROLL_SUCCESS,5",
        ];
        let events: Vec<InboundEvent> = lines.iter().filter_map(|l| classify(l)).collect();
        assert_eq!(
            events,
            vec![
                InboundEvent::EnrollProgress {
                    stage: EnrollStage::Started { id: 5 }
                },
                InboundEvent::EnrollProgress {
                    stage: EnrollStage::PlaceFinger
                },
                InboundEvent::EnrollProgress {
                    stage: EnrollStage::RemoveFinger
                },
                InboundEvent::EnrollProgress {
                    stage: EnrollStage::PlaceAgain
                },
                InboundEvent::EnrollResult {
                    id: Some(5),
                    success: true,
                    reason: None
                },
            ]
        );
    }

    #[test]
    fn test_enroll_failure() {
        assert_eq!(
            classify("ENROLL_FAIL,Could_not_create_model"),
            Some(InboundEvent::EnrollResult {
                id: None,
                success: false,
                reason: Some("Could not create model".to_string())
            })
        );
    }

    #[test]
    fn test_sms_terminal_events() {
        let ok = classify("SMS_SENT_OK,Alice Smith").unwrap();
        assert!(ok.is_terminal());
        assert_eq!(ok.sms_success(), Some(true));
        assert_eq!(
            ok,
            InboundEvent::SmsResult {
                recipient: "Alice Smith".to_string(),
                outcome: SmsOutcome::Sent
            }
        );

        let fail = classify("SMS_SENT_FAIL,Bob").unwrap();
        assert_eq!(fail.sms_success(), Some(false));

        let timeout = classify("ERR:Timeout_for_Cara Jones").unwrap();
        assert_eq!(
            timeout,
            InboundEvent::SmsResult {
                recipient: "Cara Jones".to_string(),
                outcome: SmsOutcome::TimedOut
            }
        );

        let rejected = classify("ERR:Invalid_SMS_command_format.").unwrap();
        assert!(rejected.is_terminal());
    }

    #[test]
    fn test_diagnostics() {
        assert_eq!(
            classify("INFO:Biometric_attendance_started"),
            Some(InboundEvent::Info {
                text: "Biometric attendance started".to_string()
            })
        );
        assert_eq!(
            classify("ERR:Invalid_command_format._Skipping."),
            Some(InboundEvent::Error {
                text: "Invalid command format. Skipping.".to_string()
            })
        );
        assert!(!classify("ERR:Did_not_find_fingerprint_sensor")
            .unwrap()
            .is_terminal());
    }

    #[test]
    fn test_unrecognized_lines_are_kept() {
        assert_eq!(
            classify("garbage 123"),
            Some(InboundEvent::Info {
                text: "garbage 123".to_string()
            })
        );
        assert_eq!(
            classify("FINGER_SCANNED,x"),
            Some(InboundEvent::Info {
                text: "FINGER_SCANNED,x".to_string()
            })
        );
    }

    #[test]
    fn test_empty_lines_discarded() {
        assert_eq!(classify(""), None);
        assert_eq!(classify(" \r"), None);
    }

    #[test]
    fn test_display_text() {
        let ev = classify("SMS_SENT_OK,Alice").unwrap();
        assert_eq!(ev.to_string(), "SMS sent to Alice");
        let ev = classify("ENROLL_SUCCESS,3").unwrap();
        assert_eq!(ev.to_string(), "Enrollment successful (ID #3)");
    }
}
