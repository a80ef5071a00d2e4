//! Bridge runtime
//!
//! A single task owns the device session. It runs discovery, reconnects after
//! the device is lost, routes caller requests to the session's coordinator
//! and broadcasts connection status and every inbound line.
//!
//! ```rust,ignore
//! use attendlink_core::prelude::*;
//!
//! let bridge = Bridge::new(BridgeConfig::default(), Box::new(SerialLink::new()));
//! let _status = bridge.subscribe_status(|s| println!("{}", s.message));
//! let handle = bridge.spawn();
//! handle.start_attendance().await?;
//! ```

use std::future::pending;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::firmware::FirmwareMode;
use crate::observers::{Observers, Subscription};
use crate::protocol::{
    Command, DeviceLink, InboundEvent, PortInfo, ProtocolError, SmsRecipient, TargetMatcher,
    Transport, READY_MARKER,
};
use crate::session::{DeviceSession, DeviceStatus, SessionMachine, SessionState};

const REQUEST_QUEUE: usize = 64;

const MSG_NOT_FOUND: &str = "Device not found. Please connect it.";
const MSG_READY: &str = "Attendance system ready";
const MSG_RESCANNING: &str = "Disconnected. Re-scanning...";
const MSG_STOPPED: &str = "Bridge stopped";

/// One inbound line with its classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEvent {
    /// Line as received, terminator stripped
    pub line: String,
    /// Classification, `None` for blank lines
    pub event: Option<InboundEvent>,
    /// Host time the line was read
    pub received_at: DateTime<Utc>,
}

/// Read-only view of the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSnapshot {
    /// Session lifecycle state
    pub state: SessionState,
    /// Last published status
    pub status: DeviceStatus,
    /// Open port, if any
    pub path: Option<String>,
    /// Id of the live session
    pub session_id: Option<Uuid>,
    /// Commands queued behind the gate
    pub pending: usize,
    /// Wire line of the SMS awaiting its terminal event
    pub in_flight: Option<String>,
    /// Controller mode as mirrored by the host
    pub firmware_mode: Option<FirmwareMode>,
    /// Time of the last classified line
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Request sent to the bridge task
#[derive(Debug)]
pub enum BridgeRequest {
    /// Queue a command on the live session
    Send {
        command: Command,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    /// Replace queued SMS with a new batch
    SmsBatch {
        recipients: Vec<SmsRecipient>,
        reply: oneshot::Sender<Result<usize, ProtocolError>>,
    },
    Snapshot {
        reply: oneshot::Sender<BridgeSnapshot>,
    },
}

/// What woke the connected loop
enum Step {
    Stop(&'static str),
    Lost(String),
    Line(String),
    Request(BridgeRequest),
    Watchdog,
    ReadyTimeout(Duration),
}

/// Why a connected session ended
enum SessionEnd {
    Lost,
    Shutdown,
}

/// Bridge task, configured but not yet running
pub struct Bridge {
    config: BridgeConfig,
    matcher: TargetMatcher,
    link: Arc<Mutex<Box<dyn DeviceLink>>>,
    /// Port that last opened but never reported ready
    unresponsive: Option<String>,
    machine: SessionMachine,
    rx: mpsc::Receiver<BridgeRequest>,
    tx: Option<mpsc::Sender<BridgeRequest>>,
    cancel: CancellationToken,
    status: Arc<Mutex<DeviceStatus>>,
    status_observers: Observers<DeviceStatus>,
    response_observers: Observers<ResponseEvent>,
}

impl Bridge {
    /// Configure a bridge over `link`. Nothing runs until [`spawn`](Self::spawn).
    pub fn new(config: BridgeConfig, link: Box<dyn DeviceLink>) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        Self {
            matcher: config.matcher(),
            config,
            link: Arc::new(Mutex::new(link)),
            unresponsive: None,
            machine: SessionMachine::new(),
            rx,
            tx: Some(tx),
            cancel: CancellationToken::new(),
            status: Arc::new(Mutex::new(DeviceStatus::disconnected("Not connected"))),
            status_observers: Observers::new(),
            response_observers: Observers::new(),
        }
    }

    /// Observe connection status changes and failed discovery polls
    pub fn subscribe_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DeviceStatus) + Send + Sync + 'static,
    {
        self.status_observers.subscribe(callback)
    }

    /// Observe every line received from the device
    pub fn subscribe_responses<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ResponseEvent) + Send + Sync + 'static,
    {
        self.response_observers.subscribe(callback)
    }

    /// Start the bridge task
    pub fn spawn(mut self) -> BridgeHandle {
        // The task keeps no sender, so dropping the last handle ends it
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => mpsc::channel(1).0,
        };
        let cancel = self.cancel.clone();
        let status = Arc::clone(&self.status);
        let country_code = self.config.country_code.clone();
        let status_observers = self.status_observers.clone();
        let response_observers = self.response_observers.clone();

        BridgeHandle {
            tx,
            cancel,
            status,
            country_code,
            status_observers,
            response_observers,
            task: Some(tokio::spawn(self.run())),
        }
    }

    async fn run(mut self) {
        tracing::info!("Bridge started (baud {})", self.config.baud_rate);

        while let Some(session) = self.discover().await {
            match self.serve(session).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost => {
                    if !self.idle_wait(self.config.reconnect_delay()).await {
                        break;
                    }
                }
            }
        }

        if self.machine.state() != SessionState::Disconnected {
            self.transition(SessionState::Disconnected, MSG_STOPPED);
        }
        tracing::info!("Bridge stopped");
    }

    /// Poll for the controller until it opens. `None` on shutdown.
    async fn discover(&mut self) -> Option<DeviceSession> {
        loop {
            match self.try_open().await {
                Ok(Some(session)) => return Some(session),
                Ok(None) => self.publish(DeviceStatus::disconnected(MSG_NOT_FOUND)),
                Err(e) => {
                    tracing::warn!("Discovery failed: {}", e);
                    self.publish(DeviceStatus::disconnected(format!("Connection error: {}", e)));
                }
            }
            if !self.idle_wait(self.config.discovery_interval()).await {
                return None;
            }
        }
    }

    async fn try_open(&mut self) -> Result<Option<DeviceSession>, ProtocolError> {
        let Some((port, transport)) = self.scan_and_open().await? else {
            return Ok(None);
        };
        let session = DeviceSession::new(transport, port, self.config.ack_watchdog());
        self.transition(
            SessionState::Connecting,
            format!("Connecting to {}...", session.path()),
        );
        Ok(Some(session))
    }

    /// Scan and open on the blocking pool; port enumeration and open are
    /// synchronous system calls.
    async fn scan_and_open(&self) -> Result<Option<(PortInfo, Transport)>, ProtocolError> {
        let link = Arc::clone(&self.link);
        let matcher = self.matcher.clone();
        let avoid = self.unresponsive.clone();
        let baud_rate = self.config.baud_rate;

        tokio::task::spawn_blocking(move || -> Result<_, ProtocolError> {
            let mut link = link.lock().unwrap_or_else(|e| e.into_inner());
            let ports = link.scan()?;
            let Some(port) = matcher.find_avoiding(&ports, avoid.as_deref()).cloned() else {
                tracing::debug!("No controller among {} port(s)", ports.len());
                return Ok(None);
            };
            let transport = link.open(&port, baud_rate)?;
            Ok(Some((port, transport)))
        })
        .await
        .map_err(|e| ProtocolError::ConnectionFailed(format!("discovery task failed: {}", e)))?
    }

    /// Sleep while answering requests without a session.
    /// Returns false if the bridge should stop.
    async fn idle_wait(&mut self, duration: Duration) -> bool {
        let wake = sleep(duration);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut wake => return true,
                req = self.rx.recv() => match req {
                    Some(req) => self.answer_idle(req),
                    None => return false,
                },
            }
        }
    }

    fn answer_idle(&self, req: BridgeRequest) {
        let err = || self.machine.check_ready().err().unwrap_or(ProtocolError::NotConnected);
        match req {
            BridgeRequest::Send { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            BridgeRequest::SmsBatch { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            BridgeRequest::Snapshot { reply } => {
                let _ = reply.send(self.snapshot(None));
            }
        }
    }

    async fn serve(&mut self, mut session: DeviceSession) -> SessionEnd {
        let ready_timeout = self.config.ready_timeout();
        let ready_by = ready_timeout.map(|t| Instant::now() + t);

        loop {
            let deadline = session.watchdog_deadline();
            let watchdog = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => pending::<()>().await,
                }
            };
            let ready_deadline = match self.machine.state() {
                SessionState::Connecting => ready_by.zip(ready_timeout),
                _ => None,
            };
            let ready_timer = async move {
                match ready_deadline {
                    Some((at, timeout)) => {
                        sleep_until(at).await;
                        timeout
                    }
                    None => pending::<Duration>().await,
                }
            };

            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Stop("shutdown"),
                line = session.next_line() => match line {
                    Some(Ok(line)) => Step::Line(line),
                    Some(Err(e)) => Step::Lost(e.to_string()),
                    None => Step::Lost("device disconnected".to_string()),
                },
                req = self.rx.recv() => match req {
                    Some(req) => Step::Request(req),
                    None => Step::Stop("all handles dropped"),
                },
                _ = watchdog => Step::Watchdog,
                timeout = ready_timer => Step::ReadyTimeout(timeout),
            };

            let result = match step {
                Step::Stop(reason) => {
                    session.abandon(reason);
                    return SessionEnd::Shutdown;
                }
                Step::Lost(reason) => Err(reason),
                Step::Line(line) => self.on_line(&mut session, line).await,
                Step::Request(req) => self.handle_request(&mut session, req).await,
                Step::Watchdog => session.check_watchdog().await.map_err(|e| e.to_string()),
                Step::ReadyTimeout(timeout) => {
                    self.unresponsive = Some(session.path().to_string());
                    Err(format!("no {} within {}s", READY_MARKER, timeout.as_secs()))
                }
            };

            if let Err(reason) = result {
                self.lose(session, &reason);
                return SessionEnd::Lost;
            }
        }
    }

    async fn on_line(&mut self, session: &mut DeviceSession, line: String) -> Result<(), String> {
        tracing::debug!("<- {}", line);
        let ingested = session.ingest(&line);
        let event = ingested.as_ref().map(|i| i.event.clone());

        self.response_observers.emit(&ResponseEvent {
            line,
            event: event.clone(),
            received_at: Utc::now(),
        });

        if event == Some(InboundEvent::Ready) {
            match self.machine.state() {
                SessionState::Connecting => {
                    self.unresponsive = None;
                    self.transition(SessionState::Ready, MSG_READY);
                }
                state => tracing::warn!("Device rebooted while {}, session reset", state),
            }
        }

        match ingested {
            Some(i) => session.transmit(i.release).await.map_err(|e| e.to_string()),
            None => Ok(()),
        }
    }

    async fn handle_request(
        &mut self,
        session: &mut DeviceSession,
        req: BridgeRequest,
    ) -> Result<(), String> {
        match req {
            BridgeRequest::Send { command, reply } => {
                if let Err(e) = self.machine.check_ready() {
                    let _ = reply.send(Err(e));
                    return Ok(());
                }
                match session.submit(command).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        Ok(())
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        let _ = reply.send(Err(e));
                        Err(reason)
                    }
                }
            }
            BridgeRequest::SmsBatch { recipients, reply } => {
                if let Err(e) = self.machine.check_ready() {
                    let _ = reply.send(Err(e));
                    return Ok(());
                }
                let commands: Result<Vec<Command>, ProtocolError> = recipients
                    .iter()
                    .map(|r| r.to_command(&self.config.country_code))
                    .collect();
                let commands = match commands {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return Ok(());
                    }
                };

                let replaced = session.clear_pending();
                if replaced > 0 {
                    tracing::warn!("New SMS batch replaces {} queued message(s)", replaced);
                }
                let count = commands.len();
                tracing::info!("Queueing {} SMS", count);
                for cmd in commands {
                    if let Err(e) = session.submit(cmd).await {
                        let reason = e.to_string();
                        let _ = reply.send(Err(e));
                        return Err(reason);
                    }
                }
                let _ = reply.send(Ok(count));
                Ok(())
            }
            BridgeRequest::Snapshot { reply } => {
                let _ = reply.send(self.snapshot(Some(&*session)));
                Ok(())
            }
        }
    }

    fn lose(&mut self, session: DeviceSession, reason: &str) {
        tracing::warn!("Lost connection to {}: {}", session.path(), reason);
        self.transition(SessionState::Degraded, format!("Connection lost: {}", reason));
        session.abandon(reason);
        self.transition(SessionState::Disconnected, MSG_RESCANNING);
    }

    fn transition(&mut self, to: SessionState, message: impl Into<String>) {
        if let Ok(status) = self.machine.transition(to, message) {
            self.publish(status);
        }
    }

    fn publish(&self, status: DeviceStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status.clone();
        self.status_observers.emit(&status);
    }

    fn snapshot(&self, session: Option<&DeviceSession>) -> BridgeSnapshot {
        let status = self
            .status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        BridgeSnapshot {
            state: self.machine.state(),
            status,
            path: session.map(|s| s.path().to_string()),
            session_id: session.map(DeviceSession::id),
            pending: session.map_or(0, |s| s.queue_stats().pending),
            in_flight: session
                .and_then(|s| s.in_flight())
                .map(|f| f.command.to_line()),
            firmware_mode: session.map(DeviceSession::firmware_mode),
            last_event_at: session.and_then(DeviceSession::last_event_at),
        }
    }
}

/// Caller side of a running bridge
#[derive(Debug)]
pub struct BridgeHandle {
    tx: mpsc::Sender<BridgeRequest>,
    cancel: CancellationToken,
    status: Arc<Mutex<DeviceStatus>>,
    country_code: String,
    status_observers: Observers<DeviceStatus>,
    response_observers: Observers<ResponseEvent>,
    task: Option<JoinHandle<()>>,
}

impl BridgeHandle {
    pub fn subscribe_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DeviceStatus) + Send + Sync + 'static,
    {
        self.status_observers.subscribe(callback)
    }

    pub fn subscribe_responses<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ResponseEvent) + Send + Sync + 'static,
    {
        self.response_observers.subscribe(callback)
    }

    /// Last published status
    pub fn status(&self) -> DeviceStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Country code stripped from SMS phone numbers
    pub fn country_code(&self) -> &str {
        &self.country_code
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> BridgeRequest,
    ) -> Result<T, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ProtocolError::Shutdown)?;
        rx.await.map_err(|_| ProtocolError::Shutdown)
    }

    /// Send a line typed by the caller. Lines shaped like a known command
    /// are sent as that command.
    pub async fn send_raw(&self, line: &str) -> Result<(), ProtocolError> {
        self.send_command(Command::parse(line)?).await
    }

    /// Queue a structured command
    pub async fn send_command(&self, command: Command) -> Result<(), ProtocolError> {
        self.request(|reply| BridgeRequest::Send { command, reply })
            .await?
    }

    /// Start enrollment into sensor slot `id`
    pub async fn enroll(&self, id: u32) -> Result<(), ProtocolError> {
        self.send_command(Command::EnrollFinger { id }).await
    }

    /// Put the controller in scanning mode
    pub async fn start_attendance(&self) -> Result<(), ProtocolError> {
        self.send_command(Command::StartAttendance).await
    }

    /// Leave scanning mode
    pub async fn end_attendance(&self) -> Result<(), ProtocolError> {
        self.send_command(Command::EndAttendance).await
    }

    /// Validate and queue an SMS batch, replacing whatever is still queued.
    /// Returns the number of messages queued.
    pub async fn send_sms_batch(
        &self,
        recipients: Vec<SmsRecipient>,
    ) -> Result<usize, ProtocolError> {
        self.request(|reply| BridgeRequest::SmsBatch { recipients, reply })
            .await?
    }

    /// Read-only view of the bridge and its session
    pub async fn snapshot(&self) -> Result<BridgeSnapshot, ProtocolError> {
        self.request(|reply| BridgeRequest::Snapshot { reply }).await
    }

    /// Stop the bridge and wait for its task to finish
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Bridge task failed: {}", e);
            }
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
