//! JSON-lines messages exchanged with the dashboard

use attendlink_core::bridge::{BridgeHandle, BridgeSnapshot, ResponseEvent};
use attendlink_core::firmware::SimulatorHandle;
use attendlink_core::protocol::SmsRecipient;
use attendlink_core::session::DeviceStatus;
use serde::{Deserialize, Serialize};

/// Request read from stdin
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Raw { command: String },
    Enroll { id: u32 },
    StartAttendance,
    EndAttendance,
    SmsBatch { students: Vec<SmsRecipient> },
    Snapshot,
    /// Press a finger on the simulated sensor (`--simulate` only)
    SimulateScan { id: u32 },
}

/// Message written to stdout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Status(DeviceStatus),
    Response(ResponseEvent),
    Snapshot(BridgeSnapshot),
    SmsQueued { count: usize },
    Error { message: String },
}

impl Message {
    pub fn error(message: impl ToString) -> Self {
        Message::Error {
            message: message.to_string(),
        }
    }
}

pub fn parse_request(line: &str) -> Result<Request, serde_json::Error> {
    serde_json::from_str(line)
}

/// Run one request against the bridge. Returns the reply to print, if any.
pub async fn dispatch(
    handle: &BridgeHandle,
    simulator: Option<&SimulatorHandle>,
    request: Request,
) -> Option<Message> {
    let result = match request {
        Request::Raw { command } => handle.send_raw(&command).await,
        Request::Enroll { id } => handle.enroll(id).await,
        Request::StartAttendance => handle.start_attendance().await,
        Request::EndAttendance => handle.end_attendance().await,
        Request::SmsBatch { students } => {
            return Some(match handle.send_sms_batch(students).await {
                Ok(count) => Message::SmsQueued { count },
                Err(e) => Message::error(e),
            });
        }
        Request::Snapshot => {
            return Some(match handle.snapshot().await {
                Ok(snapshot) => Message::Snapshot(snapshot),
                Err(e) => Message::error(e),
            });
        }
        Request::SimulateScan { id } => {
            return match simulator {
                Some(sim) => {
                    sim.press_finger(id);
                    None
                }
                None => Some(Message::error("simulate_scan requires --simulate")),
            };
        }
    };
    result.err().map(Message::error)
}
