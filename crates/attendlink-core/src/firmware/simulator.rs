//! Simulated attendance controller
//!
//! Runs the device side of the protocol over an in-memory duplex stream.
//! Like the real firmware it handles one command at a time: while an
//! enrollment or SMS is in progress nothing else is read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    decode_name, DeviceLink, LineCodec, PortInfo, ProtocolError, Transport,
    FIRMWARE_SMS_TIMEOUT_MS, READY_MARKER,
};

/// Port name the simulated controller appears under
pub const SIMULATED_PORT: &str = "sim://attendance";

/// USB descriptors reported for the simulated controller (Arduino Uno)
const SIM_VID: u16 = 0x2341;
const SIM_PID: u16 = 0x0043;

const DUPLEX_CAPACITY: usize = 4096;

/// What the modem does with an SMS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmsBehavior {
    /// `SMS_SENT_OK`, followed by the post-send pause
    #[default]
    Deliver,
    /// `SMS_SENT_FAIL`
    Fail,
    /// No modem answer; `ERR:Timeout_for_` after the firmware ceiling
    Timeout,
    /// The terminal event is lost on the wire
    Silent,
}

/// Timing and outcome knobs for [`SimulatedFirmware`]
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Delay before the boot banner and readiness marker
    pub boot_delay: Duration,
    /// Time for each finger placement during enrollment
    pub enroll_step: Duration,
    /// Pause between "remove finger" and "place again"
    pub enroll_hold: Duration,
    /// Whether enrollment produces a model
    pub enroll_succeeds: bool,
    /// Modem latency before a delivered/failed result
    pub modem_delay: Duration,
    /// Upper bound of random extra modem latency
    pub modem_jitter: Duration,
    /// Pause after a delivered SMS before the next command is read
    pub sms_success_pause: Duration,
    /// Firmware ceiling for a modem answer
    pub sms_timeout: Duration,
    /// Seed for the jitter source; entropy when unset
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            boot_delay: Duration::from_millis(1500),
            enroll_step: Duration::from_secs(1),
            enroll_hold: Duration::from_secs(2),
            enroll_succeeds: true,
            modem_delay: Duration::from_secs(3),
            modem_jitter: Duration::ZERO,
            sms_success_pause: Duration::from_secs(5),
            sms_timeout: Duration::from_millis(FIRMWARE_SMS_TIMEOUT_MS),
            seed: None,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    present: bool,
    opens: usize,
    fail_opens: usize,
    received: Vec<String>,
    sent: Vec<String>,
    default_sms: SmsBehavior,
    sms_overrides: HashMap<String, SmsBehavior>,
    presses: Option<mpsc::UnboundedSender<u32>>,
    cancel: Option<CancellationToken>,
}

/// Test and demo control over a simulated controller.
///
/// Cloning shares the same device.
#[derive(Debug, Clone, Default)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatorHandle {
    /// Handle for a device that starts plugged in
    pub fn new() -> Self {
        let handle = Self::default();
        handle.lock().present = true;
        handle
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the device visible to port scans
    pub fn plug_in(&self) {
        self.lock().present = true;
    }

    /// Remove the device: it disappears from scans and any open link
    /// reaches end-of-stream.
    pub fn unplug(&self) {
        let mut state = self.lock();
        state.present = false;
        state.presses = None;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
    }

    pub fn is_present(&self) -> bool {
        self.lock().present
    }

    /// Make the next `n` open attempts fail
    pub fn fail_next_opens(&self, n: usize) {
        self.lock().fail_opens = n;
    }

    /// Number of successful opens so far
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Put a finger on the sensor. Reported only while attendance mode is on.
    pub fn press_finger(&self, id: u32) {
        if let Some(tx) = &self.lock().presses {
            let _ = tx.send(id);
        }
    }

    pub fn set_default_sms_behavior(&self, behavior: SmsBehavior) {
        self.lock().default_sms = behavior;
    }

    /// Override the modem result for one recipient (display name)
    pub fn set_sms_behavior(&self, recipient: &str, behavior: SmsBehavior) {
        self.lock()
            .sms_overrides
            .insert(recipient.to_string(), behavior);
    }

    /// Lines the device has read, in order
    pub fn received(&self) -> Vec<String> {
        self.lock().received.clone()
    }

    /// Lines the device has printed, in order
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    fn sms_behavior(&self, recipient: &str) -> SmsBehavior {
        let state = self.lock();
        state
            .sms_overrides
            .get(recipient)
            .copied()
            .unwrap_or(state.default_sms)
    }
}

/// Device side of one simulated connection
pub struct SimulatedFirmware {
    config: SimulatorConfig,
    handle: SimulatorHandle,
    writer: WriteHalf<DuplexStream>,
    rng: StdRng,
    scanning: bool,
}

impl SimulatedFirmware {
    /// Start the firmware on `device`, the far end of a duplex stream.
    /// The task ends when the host hangs up or the handle unplugs it.
    pub fn spawn(
        config: SimulatorConfig,
        handle: SimulatorHandle,
        device: DuplexStream,
    ) -> JoinHandle<()> {
        let (reader, writer) = tokio::io::split(device);
        let (press_tx, press_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        {
            let mut state = handle.lock();
            state.presses = Some(press_tx);
            if let Some(old) = state.cancel.replace(cancel.clone()) {
                old.cancel();
            }
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let firmware = Self {
            config,
            handle,
            writer,
            rng,
            scanning: false,
        };
        tokio::spawn(firmware.run(FramedRead::new(reader, LineCodec::new()), press_rx, cancel))
    }

    async fn run(
        mut self,
        mut lines: FramedRead<tokio::io::ReadHalf<DuplexStream>, LineCodec>,
        mut presses: mpsc::UnboundedReceiver<u32>,
        cancel: CancellationToken,
    ) {
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            r = self.serve(&mut lines, &mut presses) => r,
        };
        if let Err(e) = result {
            tracing::debug!("Simulated firmware stopped: {}", e);
        }
        let _ = self.writer.shutdown().await;
    }

    async fn serve(
        &mut self,
        lines: &mut FramedRead<tokio::io::ReadHalf<DuplexStream>, LineCodec>,
        presses: &mut mpsc::UnboundedReceiver<u32>,
    ) -> Result<(), ProtocolError> {
        tokio::time::sleep(self.config.boot_delay).await;
        self.print("INFO:Fingerprint_sensor_found").await?;
        self.print("INFO:GSM_module_initialized.").await?;
        self.print(READY_MARKER).await?;

        loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(line) => self.execute(&line?).await?,
                    None => return Ok(()),
                },
                Some(id) = presses.recv() => {
                    if self.scanning {
                        self.print(&format!("FINGER_SCANNED,{}", id)).await?;
                    }
                }
            }
        }
    }

    async fn execute(&mut self, line: &str) -> Result<(), ProtocolError> {
        self.handle.lock().received.push(line.to_string());

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        match fields.as_slice() {
            ["START_ATTENDANCE"] => {
                self.scanning = true;
                self.print("INFO:Biometric_attendance_started").await
            }
            ["END_ATTENDANCE"] => {
                self.scanning = false;
                self.print("INFO:Biometric_attendance_ended").await
            }
            ["ENROLL_FINGER", id] => match id.parse::<u32>() {
                Ok(id) => self.enroll(id).await,
                Err(_) => self.print("ERR:Invalid_command_format._Skipping.").await,
            },
            // Extra fields are ignored; only a missing phone number is rejected
            ["P" | "A", rest @ ..] => match rest {
                [name, phone, ..] if !phone.is_empty() => self.send_sms(name).await,
                _ => self.print("ERR:Invalid_SMS_command_format.").await,
            },
            _ => self.print("ERR:Invalid_command_format._Skipping.").await,
        }
    }

    async fn enroll(&mut self, id: u32) -> Result<(), ProtocolError> {
        self.scanning = false;
        self.print(&format!("ENROLL_START,{}", id)).await?;
        self.print("ENROLL_INFO,Place_finger_on_sensor").await?;
        tokio::time::sleep(self.config.enroll_step).await;
        self.print("ENROLL_INFO,Remove_finger").await?;
        tokio::time::sleep(self.config.enroll_hold).await;
        self.print("ENROLL_INFO,Place_same_finger_again").await?;
        tokio::time::sleep(self.config.enroll_step).await;

        if self.config.enroll_succeeds {
            self.print(&format!("ENROLL_SUCCESS,{}", id)).await
        } else {
            self.print("ENROLL_FAIL,Could_not_create_model").await
        }
    }

    async fn send_sms(&mut self, wire_name: &str) -> Result<(), ProtocolError> {
        let name = decode_name(wire_name);
        self.print(&format!("INFO:Sending_SMS_to_{}", wire_name)).await?;

        match self.handle.sms_behavior(&name) {
            SmsBehavior::Deliver => {
                tokio::time::sleep(self.modem_latency()).await;
                self.print(&format!("SMS_SENT_OK,{}", name)).await?;
                tokio::time::sleep(self.config.sms_success_pause).await;
            }
            SmsBehavior::Fail => {
                tokio::time::sleep(self.modem_latency()).await;
                self.print(&format!("SMS_SENT_FAIL,{}", name)).await?;
            }
            SmsBehavior::Timeout => {
                tokio::time::sleep(self.config.sms_timeout).await;
                self.print(&format!("ERR:Timeout_for_{}", name)).await?;
            }
            SmsBehavior::Silent => {
                tokio::time::sleep(self.modem_latency()).await;
            }
        }
        Ok(())
    }

    fn modem_latency(&mut self) -> Duration {
        let jitter_ms = self.config.modem_jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            self.rng.gen_range(0..=jitter_ms)
        };
        self.config.modem_delay + Duration::from_millis(extra)
    }

    async fn print(&mut self, line: &str) -> Result<(), ProtocolError> {
        self.handle.lock().sent.push(line.to_string());
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// [`DeviceLink`] backed by [`SimulatedFirmware`]
#[derive(Debug, Clone)]
pub struct SimulatedLink {
    config: SimulatorConfig,
    handle: SimulatorHandle,
}

impl SimulatedLink {
    /// Link to the device controlled by `handle`
    pub fn new(config: SimulatorConfig, handle: SimulatorHandle) -> Self {
        Self { config, handle }
    }

    pub fn handle(&self) -> &SimulatorHandle {
        &self.handle
    }

    /// The port the simulated controller reports
    pub fn port() -> PortInfo {
        PortInfo {
            name: SIMULATED_PORT.to_string(),
            vid: Some(SIM_VID),
            pid: Some(SIM_PID),
            manufacturer: Some("Arduino (www.arduino.cc)".to_string()),
            product: Some("Arduino Uno".to_string()),
            serial_number: None,
        }
    }
}

impl DeviceLink for SimulatedLink {
    fn scan(&mut self) -> Result<Vec<PortInfo>, ProtocolError> {
        // A descriptor-less port is always present and never matches
        let mut ports = vec![PortInfo::bare("sim://ttyS0")];
        if self.handle.is_present() {
            ports.insert(0, Self::port());
        }
        Ok(ports)
    }

    fn open(&mut self, port: &PortInfo, _baud_rate: u32) -> Result<Transport, ProtocolError> {
        {
            let mut state = self.handle.lock();
            if port.name != SIMULATED_PORT || !state.present {
                return Err(ProtocolError::ConnectionFailed(format!(
                    "{}: no such device",
                    port.name
                )));
            }
            if state.fail_opens > 0 {
                state.fail_opens -= 1;
                return Err(ProtocolError::ConnectionFailed(format!(
                    "{}: device busy",
                    port.name
                )));
            }
            state.opens += 1;
        }

        let (host, device) = tokio::io::duplex(DUPLEX_CAPACITY);
        SimulatedFirmware::spawn(self.config.clone(), self.handle.clone(), device);
        Ok(Box::new(host))
    }
}
