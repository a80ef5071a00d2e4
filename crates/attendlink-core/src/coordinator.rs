//! Command queue coordinator
//!
//! Single-flight dispatcher in front of the controller. Commands that need an
//! acknowledgement (SMS dispatch) are queued and released one at a time; the
//! next one only goes out after the firmware reports a terminal event for the
//! previous one. Everything else is passed straight through.
//!
//! The coordinator does no I/O. Each method returns the commands the caller
//! must write, in order.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::protocol::{Command, InboundEvent};

/// The ack-requiring command currently awaiting its terminal event
#[derive(Debug, Clone)]
pub struct InFlight {
    /// Command that was transmitted
    pub command: Command,
    /// When it was handed to the writer
    pub sent_at: Instant,
}

/// Queue statistics for snapshots and logs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Commands waiting for their turn
    pub pending: usize,
    /// An SMS is awaiting its terminal event
    pub in_flight: bool,
    /// The next ack-requiring command may be written
    pub ready_for_next_ack: bool,
}

/// Per-session single-flight command queue
#[derive(Debug)]
pub struct Coordinator {
    pending: VecDeque<Command>,
    in_flight: Option<InFlight>,
    ready_for_next_ack: bool,
    watchdog: Option<Duration>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Coordinator {
    /// Create an empty coordinator; `watchdog` bounds how long an ack may
    /// stay outstanding before the gate is forced open.
    pub fn new(watchdog: Option<Duration>) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            ready_for_next_ack: true,
            watchdog,
        }
    }

    /// Submit a command. Returns what must be written now.
    pub fn enqueue(&mut self, cmd: Command) -> Vec<Command> {
        if !cmd.requires_ack() {
            return vec![cmd];
        }
        self.pending.push_back(cmd);
        self.drain()
    }

    /// Release queued commands while the ack gate is open
    pub fn drain(&mut self) -> Vec<Command> {
        let mut out = Vec::new();
        while self.ready_for_next_ack {
            let Some(cmd) = self.pending.pop_front() else {
                break;
            };
            if cmd.requires_ack() {
                if let Some(prev) = &self.in_flight {
                    tracing::error!(
                        "Protocol desync: sending '{}' while '{}' is unacknowledged",
                        cmd,
                        prev.command
                    );
                }
                self.ready_for_next_ack = false;
                self.in_flight = Some(InFlight {
                    command: cmd.clone(),
                    sent_at: Instant::now(),
                });
            }
            out.push(cmd);
        }
        out
    }

    /// Feed a classified inbound event. Terminal events open the gate and
    /// release the next queued command.
    pub fn on_ack_event(&mut self, event: &InboundEvent) -> Vec<Command> {
        let InboundEvent::SmsResult { recipient, outcome } = event else {
            return Vec::new();
        };

        match self.in_flight.as_ref().and_then(|f| f.command.recipient()) {
            None => {
                tracing::warn!(
                    "SMS result ({:?}) for '{}' with nothing in flight",
                    outcome,
                    recipient
                );
            }
            Some(expected) if !recipient.is_empty() && expected != recipient => {
                tracing::warn!(
                    "SMS result for '{}' but '{}' was in flight",
                    recipient,
                    expected
                );
            }
            Some(_) => {}
        }

        self.release();
        self.drain()
    }

    /// Drop every queued command and open the gate.
    /// Returns the number of commands discarded, in-flight included.
    pub fn reset(&mut self) -> usize {
        let dropped = self.pending.len() + usize::from(self.in_flight.is_some());
        self.pending.clear();
        self.release();
        dropped
    }

    /// Drop queued commands but keep an outstanding ack gated
    pub fn clear_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// The write of the in-flight command failed; nothing will acknowledge it
    pub fn on_write_failed(&mut self) {
        self.release();
    }

    /// Instant at which the outstanding ack is considered lost
    pub fn watchdog_deadline(&self) -> Option<Instant> {
        let watchdog = self.watchdog?;
        self.in_flight.as_ref().map(|f| f.sent_at + watchdog)
    }

    /// Force the gate open if the watchdog deadline has passed at `now`
    pub fn on_watchdog(&mut self, now: Instant) -> Vec<Command> {
        match self.watchdog_deadline() {
            Some(deadline) if now >= deadline => {
                if let Some(f) = &self.in_flight {
                    tracing::warn!(
                        "No terminal event for '{}' after {:?}, releasing queue",
                        f.command,
                        now - f.sent_at
                    );
                }
                self.release();
                self.drain()
            }
            _ => Vec::new(),
        }
    }

    /// Command awaiting its terminal event
    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    /// Queued commands, oldest first
    pub fn pending(&self) -> impl Iterator<Item = &Command> {
        self.pending.iter()
    }

    /// Number of queued commands
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_ready_for_next_ack(&self) -> bool {
        self.ready_for_next_ack
    }

    /// Current counters
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending.len(),
            in_flight: self.in_flight.is_some(),
            ready_for_next_ack: self.ready_for_next_ack,
        }
    }

    fn release(&mut self) {
        self.ready_for_next_ack = true;
        self.in_flight = None;
    }
}
