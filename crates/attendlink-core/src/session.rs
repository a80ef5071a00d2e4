//! Device session state
//!
//! [`SessionMachine`] tracks the connection lifecycle across reconnects.
//! [`DeviceSession`] owns one open transport together with its command
//! coordinator and firmware mirror; dropping it discards both.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use uuid::Uuid;

use crate::coordinator::{Coordinator, InFlight, QueueStats};
use crate::firmware::{FirmwareMode, FirmwareModel};
use crate::protocol::{classify, Command, InboundEvent, LineCodec, PortInfo, ProtocolError, Transport};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No device open; discovery is polling
    Disconnected,
    /// Port open, waiting for the readiness marker
    Connecting,
    /// Device booted and accepting commands
    Ready,
    /// Transport failed; the session is being torn down
    Degraded,
}

impl SessionState {
    /// Check if moving to `to` is a legal transition
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Ready)
                | (Connecting, Degraded)
                | (Ready, Degraded)
                | (_, Disconnected)
        )
    }

    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Ready)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Connection status broadcast to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// True while a port is open (Connecting or Ready)
    pub connected: bool,
    /// Human readable status line
    pub message: String,
    /// Lifecycle state the status was produced in
    pub state: SessionState,
}

impl DeviceStatus {
    /// Status for `state`, deriving `connected` from it
    pub fn new(state: SessionState, message: impl Into<String>) -> Self {
        Self {
            connected: state.is_connected(),
            message: message.into(),
            state,
        }
    }

    /// Disconnected status with `message`
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(SessionState::Disconnected, message)
    }
}

/// Enforces the legal session transitions
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    since: DateTime<Utc>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            since: Utc::now(),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// When the current state was entered
    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    /// Move to `to`, producing the status to broadcast
    pub fn transition(
        &mut self,
        to: SessionState,
        message: impl Into<String>,
    ) -> Result<DeviceStatus, ProtocolError> {
        let from = self.state;
        if !from.can_transition(to) {
            tracing::warn!("Rejected session transition {} -> {}", from, to);
            return Err(ProtocolError::InvalidTransition { from, to });
        }
        let status = DeviceStatus::new(to, message);
        tracing::info!("Session {} -> {}: {}", from, to, status.message);
        self.state = to;
        self.since = Utc::now();
        Ok(status)
    }

    /// Error a caller request gets in the current state, if any
    pub fn check_ready(&self) -> Result<(), ProtocolError> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Connecting => Err(ProtocolError::NotReady),
            SessionState::Disconnected | SessionState::Degraded => Err(ProtocolError::NotConnected),
        }
    }
}

/// Result of feeding one inbound line to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    /// Classified event
    pub event: InboundEvent,
    /// Commands released by the event that must be written now
    pub release: Vec<Command>,
}

type LineReader = FramedRead<ReadHalf<Transport>, LineCodec>;
type LineWriter = FramedWrite<WriteHalf<Transport>, LineCodec>;

/// One live connection to the controller
pub struct DeviceSession {
    id: Uuid,
    port: PortInfo,
    reader: LineReader,
    writer: LineWriter,
    coordinator: Coordinator,
    firmware: FirmwareModel,
    opened_at: DateTime<Utc>,
    last_event_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("port", &self.port.name)
            .field("coordinator", &self.coordinator)
            .field("firmware", &self.firmware)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Wrap an opened transport
    pub fn new(transport: Transport, port: PortInfo, ack_watchdog: Option<Duration>) -> Self {
        let (r, w) = tokio::io::split(transport);
        let id = Uuid::new_v4();
        tracing::debug!("Session {} opened on {}", id, port.name);
        Self {
            id,
            port,
            reader: FramedRead::new(r, LineCodec::new()),
            writer: FramedWrite::new(w, LineCodec::new()),
            coordinator: Coordinator::new(ack_watchdog),
            firmware: FirmwareModel::new(),
            opened_at: Utc::now(),
            last_event_at: None,
        }
    }

    /// Unique id of this connection
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Port the session was opened on
    pub fn port(&self) -> &PortInfo {
        &self.port
    }

    /// Port name
    pub fn path(&self) -> &str {
        &self.port.name
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Time of the last classified inbound line
    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.last_event_at
    }

    pub fn firmware_mode(&self) -> FirmwareMode {
        self.firmware.mode()
    }

    /// Coordinator counters
    pub fn queue_stats(&self) -> QueueStats {
        self.coordinator.stats()
    }

    /// SMS awaiting its terminal event
    pub fn in_flight(&self) -> Option<&InFlight> {
        self.coordinator.in_flight()
    }

    /// When the ack watchdog fires, if armed
    pub fn watchdog_deadline(&self) -> Option<Instant> {
        self.coordinator.watchdog_deadline()
    }

    /// Next inbound line; `None` once the device hung up
    pub async fn next_line(&mut self) -> Option<Result<String, ProtocolError>> {
        self.reader.next().await
    }

    /// Classify a line and update the firmware mirror and queue
    pub fn ingest(&mut self, line: &str) -> Option<Ingested> {
        let event = classify(line)?;
        self.last_event_at = Some(Utc::now());
        self.firmware.on_event(&event);

        let release = match &event {
            InboundEvent::Ready => {
                let dropped = self.coordinator.reset();
                if dropped > 0 {
                    tracing::warn!(
                        "Device (re)booted, discarded {} queued command(s)",
                        dropped
                    );
                }
                Vec::new()
            }
            e if e.is_terminal() => self.coordinator.on_ack_event(e),
            _ => Vec::new(),
        };

        Some(Ingested { event, release })
    }

    /// Queue `cmd` and write whatever the coordinator releases
    pub async fn submit(&mut self, cmd: Command) -> Result<(), ProtocolError> {
        let release = self.coordinator.enqueue(cmd);
        self.transmit(release).await
    }

    /// Drop queued commands, keeping an outstanding ack gated
    pub fn clear_pending(&mut self) -> usize {
        self.coordinator.clear_pending()
    }

    /// Release the queue if the ack watchdog expired
    pub async fn check_watchdog(&mut self) -> Result<(), ProtocolError> {
        let release = self.coordinator.on_watchdog(Instant::now());
        self.transmit(release).await
    }

    /// Write commands in order
    pub async fn transmit(&mut self, cmds: Vec<Command>) -> Result<(), ProtocolError> {
        for cmd in cmds {
            tracing::info!("-> {}", cmd);
            self.firmware.on_command_sent(&cmd);
            if let Err(e) = self.writer.send(cmd).await {
                self.coordinator.on_write_failed();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Describe what is lost when this session is torn down
    pub fn abandon(mut self, reason: &str) {
        let pending: Vec<String> = self.coordinator.pending().map(Command::to_line).collect();
        let in_flight = self.coordinator.in_flight().map(|f| f.command.to_line());
        if in_flight.is_some() || !pending.is_empty() {
            tracing::warn!(
                "Session {} lost ({}); in flight: {:?}, discarded: {:?}",
                self.id,
                reason,
                in_flight,
                pending
            );
        }
        self.coordinator.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SmsOutcome, SmsStatus};
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn test_transitions() {
        let mut m = SessionMachine::new();
        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(matches!(m.check_ready(), Err(ProtocolError::NotConnected)));

        let status = m.transition(SessionState::Connecting, "Connecting to COM3").unwrap();
        assert_eq!(
            status,
            DeviceStatus {
                connected: false,
                message: "Connecting to COM3".to_string(),
                state: SessionState::Connecting,
            }
        );
        assert!(matches!(m.check_ready(), Err(ProtocolError::NotReady)));

        assert!(m.transition(SessionState::Ready, "ready").unwrap().connected);
        assert!(m.check_ready().is_ok());
        m.transition(SessionState::Degraded, "I/O error").unwrap();
        m.transition(SessionState::Disconnected, "Disconnected. Re-scanning...").unwrap();
    }

    #[test]
    fn test_invalid_transitions() {
        let mut m = SessionMachine::new();
        assert!(matches!(
            m.transition(SessionState::Ready, "x"),
            Err(ProtocolError::InvalidTransition {
                from: SessionState::Disconnected,
                to: SessionState::Ready
            })
        ));
        assert!(m.transition(SessionState::Degraded, "x").is_err());
        assert_eq!(m.state(), SessionState::Disconnected);

        m.transition(SessionState::Connecting, "x").unwrap();
        assert!(m.transition(SessionState::Connecting, "x").is_err());
        m.transition(SessionState::Degraded, "open lost").unwrap();
        assert!(m.transition(SessionState::Ready, "x").is_err());
    }

    #[test]
    fn test_any_state_to_disconnected() {
        for path in [
            vec![],
            vec![SessionState::Connecting],
            vec![SessionState::Connecting, SessionState::Ready],
            vec![SessionState::Connecting, SessionState::Ready, SessionState::Degraded],
        ] {
            let mut m = SessionMachine::new();
            for s in path {
                m.transition(s, "").unwrap();
            }
            assert!(m.transition(SessionState::Disconnected, "shutdown").is_ok());
        }
    }

    fn sms(name: &str) -> Command {
        Command::sms(SmsStatus::Present, name, "9000000001", "").unwrap()
    }

    #[tokio::test]
    async fn test_session_gates_sms_writes() {
        let (host, device) = tokio::io::duplex(1024);
        let mut session = DeviceSession::new(Box::new(host), PortInfo::bare("mem"), None);
        let (device_r, mut device_w) = tokio::io::split(device);
        let mut device_lines = BufReader::new(device_r).lines();

        session.submit(sms("A")).await.unwrap();
        session.submit(sms("B")).await.unwrap();
        session.submit(Command::StartAttendance).await.unwrap();

        assert_eq!(device_lines.next_line().await.unwrap().unwrap(), "P,A,9000000001");
        assert_eq!(device_lines.next_line().await.unwrap().unwrap(), "START_ATTENDANCE");
        assert_eq!(session.firmware_mode(), FirmwareMode::SendingSms { recipient: "A".into() });

        device_w.write_all(b"SMS_SENT_OK,A\r\n").await.unwrap();
        let line = session.next_line().await.unwrap().unwrap();
        let ingested = session.ingest(&line).unwrap();
        assert_eq!(
            ingested.event,
            InboundEvent::SmsResult {
                recipient: "A".to_string(),
                outcome: SmsOutcome::Sent,
            }
        );
        assert_eq!(ingested.release, vec![sms("B")]);
        assert!(session.last_event_at().is_some());

        session.transmit(ingested.release).await.unwrap();
        assert_eq!(device_lines.next_line().await.unwrap().unwrap(), "P,B,9000000001");
    }

    #[tokio::test]
    async fn test_ready_marker_resets_queue() {
        let (host, _device) = tokio::io::duplex(1024);
        let mut session = DeviceSession::new(Box::new(host), PortInfo::bare("mem"), None);
        session.submit(sms("A")).await.unwrap();
        session.submit(sms("B")).await.unwrap();
        assert_eq!(session.queue_stats().pending, 1);

        let ingested = session.ingest("ARDUINO_READY").unwrap();
        assert_eq!(ingested.event, InboundEvent::Ready);
        assert!(ingested.release.is_empty());
        assert_eq!(session.queue_stats(), QueueStats {
            pending: 0,
            in_flight: false,
            ready_for_next_ack: true,
        });
        assert_eq!(session.firmware_mode(), FirmwareMode::Idle);
        assert!(session.ingest("   ").is_none());
    }
}
