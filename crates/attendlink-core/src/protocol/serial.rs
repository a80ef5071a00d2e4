//! Serial port discovery
//!
//! Enumerates serial ports and picks out the attendance controller by its
//! USB vendor signature.

use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, SerialPortInfo, SerialPortType, StopBits};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::ProtocolError;

/// Arduino SA vendor ID
const ARDUINO_VID: u16 = 0x2341;

/// Vendor IDs of the USB-serial bridge chips found on clone boards
/// (QinHeng CH340, Silicon Labs CP210x, FTDI)
const BRIDGE_CHIP_VIDS: [u16; 3] = [0x1a86, 0x10c4, 0x0403];

/// Substrings identifying a likely controller in descriptor strings
const DEFAULT_PATTERNS: [&str; 6] = [
    "vid_2341",
    "arduino",
    "usb-serial",
    "ch340",
    "cp210",
    "ftdi",
];

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

impl PortInfo {
    /// Port with no USB descriptors
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// Check if the OS reported any USB descriptors for this port
    pub fn is_usb(&self) -> bool {
        self.vid.is_some()
    }

    /// Pnp-style hardware id, e.g. `usb\vid_2341&pid_0043 Arduino Uno 7573`
    pub fn hardware_id(&self) -> String {
        let mut id = match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => format!("usb\\vid_{:04x}&pid_{:04x}", vid, pid),
            (Some(vid), None) => format!("usb\\vid_{:04x}", vid),
            _ => String::new(),
        };
        for extra in [&self.product, &self.serial_number].into_iter().flatten() {
            if !id.is_empty() {
                id.push(' ');
            }
            id.push_str(extra);
        }
        id
    }

    /// Human-readable one-line description
    pub fn describe(&self) -> String {
        match (&self.manufacturer, &self.product) {
            (Some(m), Some(p)) => format!("{} ({} {})", self.name, m, p),
            (Some(m), None) => format!("{} ({})", self.name, m),
            (None, Some(p)) => format!("{} ({})", self.name, p),
            (None, None) => self.name.clone(),
        }
    }
}

/// Heuristic that decides whether a port is the attendance controller.
///
/// Best effort: ports without USB descriptors never match, so an unknown
/// device is reported as "not found" instead of being opened blindly.
#[derive(Debug, Clone)]
pub struct TargetMatcher {
    /// Lowercase substrings searched in manufacturer, product and hardware id
    patterns: Vec<String>,
    /// Vendor IDs accepted outright
    vids: Vec<u16>,
    /// Explicit port name that overrides the heuristic
    pinned: Option<String>,
}

impl Default for TargetMatcher {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
            vids: std::iter::once(ARDUINO_VID)
                .chain(BRIDGE_CHIP_VIDS)
                .collect(),
            pinned: None,
        }
    }
}

impl TargetMatcher {
    /// Add extra case-insensitive descriptor patterns
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.patterns.extend(
            patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty()),
        );
        self
    }

    /// Only accept the port with exactly this name
    pub fn pinned(mut self, name: Option<String>) -> Self {
        self.pinned = name;
        self
    }

    /// Check a single port against the rules
    pub fn matches(&self, port: &PortInfo) -> bool {
        if let Some(pinned) = &self.pinned {
            return &port.name == pinned;
        }
        if !port.is_usb() {
            return false;
        }
        if port.vid.is_some_and(|vid| self.vids.contains(&vid)) {
            return true;
        }

        let haystack = [
            port.manufacturer.as_deref().unwrap_or_default(),
            port.product.as_deref().unwrap_or_default(),
            &port.hardware_id(),
        ]
        .join(" ")
        .to_lowercase();
        self.patterns.iter().any(|p| haystack.contains(p.as_str()))
    }

    /// First matching port in list order
    pub fn find<'a>(&self, ports: &'a [PortInfo]) -> Option<&'a PortInfo> {
        ports.iter().find(|p| self.matches(p))
    }

    /// Like [`find`](Self::find), but passes over the port named `avoid`
    /// when another match exists
    pub fn find_avoiding<'a>(
        &self,
        ports: &'a [PortInfo],
        avoid: Option<&str>,
    ) -> Option<&'a PortInfo> {
        let mut matching = ports.iter().filter(|p| self.matches(p));
        let first = matching.next()?;
        match avoid {
            Some(name) if first.name == name => matching.next().or(Some(first)),
            _ => Some(first),
        }
    }
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// Sort ports deterministically, de-duplicating by name
pub(crate) fn sort_ports(ports: impl IntoIterator<Item = PortInfo>) -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for p in ports {
        // Keep the entry that carries USB descriptors
        match map.get(&p.name) {
            Some(existing) if existing.is_usb() => {}
            _ => {
                map.insert(p.name.clone(), p);
            }
        }
    }
    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Enumerate ports through the serialport API, surfacing errors
pub fn scan_ports() -> Result<Vec<PortInfo>, ProtocolError> {
    let ports = serialport::available_ports()?;
    Ok(sort_ports(ports.into_iter().map(PortInfo::from)))
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();

    // Linux-only: Add /dev/ttyACM* and /dev/ttyUSB* entries if present but not found by API
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    ports.push(PortInfo::bare(format!("/dev/{}", fname)));
                }
            }
        }
    }

    sort_ports(ports)
}

/// Open a port as an async stream, 8N1 without flow control
pub fn open_port(name: &str, baud_rate: u32) -> Result<SerialStream, ProtocolError> {
    tokio_serial::new(name, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()
        .map_err(|e| ProtocolError::ConnectionFailed(format!("{}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn usb(name: &str, vid: u16, pid: u16, manufacturer: Option<&str>, product: Option<&str>) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: Some(vid),
            pid: Some(pid),
            manufacturer: manufacturer.map(str::to_string),
            product: product.map(str::to_string),
            serial_number: None,
        }
    }

    #[test]
    fn test_list_ports() {
        // This test just ensures the function doesn't panic
        let ports = list_ports();
        for port in &ports {
            println!("Found port: {}", port.describe());
        }
    }

    #[test]
    fn test_port_sorting() {
        let names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        let ports = sort_ports(names.into_iter().map(PortInfo::bare));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_sort_prefers_usb_descriptor() {
        let ports = sort_ports(vec![
            PortInfo::bare("/dev/ttyACM0"),
            usb("/dev/ttyACM0", 0x2341, 0x0043, Some("Arduino (www.arduino.cc)"), None),
            PortInfo::bare("/dev/ttyACM0"),
        ]);
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].vid, Some(0x2341));
    }

    #[test]
    fn test_hardware_id() {
        let mut port = usb("COM3", 0x1a86, 0x7523, None, Some("USB-SERIAL CH340"));
        port.serial_number = Some("A1".to_string());
        assert_eq!(port.hardware_id(), "usb\\vid_1a86&pid_7523 USB-SERIAL CH340 A1");
        assert_eq!(PortInfo::bare("COM1").hardware_id(), "");
    }

    #[test]
    fn test_matcher_rules() {
        let matcher = TargetMatcher::default();
        assert!(matcher.matches(&usb("/dev/ttyACM0", 0x2341, 0x0043, None, None)));
        assert!(matcher.matches(&usb("COM4", 0x1a86, 0x7523, None, None)));
        assert!(matcher.matches(&usb("COM5", 0x9999, 0x0001, Some("ARDUINO LLC"), None)));
        assert!(matcher.matches(&usb(
            "/dev/ttyUSB0",
            0x9999,
            0x0002,
            None,
            Some("CP2102 USB to UART Bridge Controller")
        )));
        assert!(matcher.matches(&usb("COM6", 0x9999, 0x0003, Some("FTDI"), None)));

        // Unknown USB device and descriptor-less ports are rejected
        assert!(!matcher.matches(&usb("COM7", 0x046d, 0xc52b, Some("Logitech"), Some("Receiver"))));
        assert!(!matcher.matches(&PortInfo::bare("/dev/ttyS0")));
    }

    #[test]
    fn test_matcher_extra_patterns_and_pinning() {
        let port = usb("COM8", 0x2e8a, 0x000a, Some("Raspberry Pi"), Some("Pico"));
        assert!(!TargetMatcher::default().matches(&port));
        assert!(TargetMatcher::default()
            .with_patterns(["  PICO "])
            .matches(&port));

        let pinned = TargetMatcher::default().pinned(Some("/dev/ttyS0".to_string()));
        assert!(pinned.matches(&PortInfo::bare("/dev/ttyS0")));
        assert!(!pinned.matches(&usb("/dev/ttyACM0", 0x2341, 0x0043, None, None)));
    }

    #[test]
    fn test_find_returns_first_match() {
        let ports = vec![
            PortInfo::bare("/dev/ttyS0"),
            usb("/dev/ttyUSB0", 0x0403, 0x6001, None, None),
            usb("/dev/ttyUSB1", 0x2341, 0x0043, None, None),
        ];
        let found = TargetMatcher::default().find(&ports).map(|p| p.name.as_str());
        assert_eq!(found, Some("/dev/ttyUSB0"));
    }

    #[test]
    fn test_find_avoiding_prefers_other_match() {
        let ports = vec![
            usb("/dev/ttyUSB0", 0x0403, 0x6001, None, None),
            PortInfo::bare("/dev/ttyS0"),
            usb("/dev/ttyUSB1", 0x2341, 0x0043, None, None),
        ];
        let matcher = TargetMatcher::default();
        let name = |p: Option<&PortInfo>| p.map(|p| p.name.clone());

        assert_eq!(
            name(matcher.find_avoiding(&ports, Some("/dev/ttyUSB0"))),
            Some("/dev/ttyUSB1".to_string())
        );
        assert_eq!(
            name(matcher.find_avoiding(&ports, Some("/dev/ttyUSB1"))),
            Some("/dev/ttyUSB0".to_string())
        );
        assert_eq!(
            name(matcher.find_avoiding(&ports, None)),
            Some("/dev/ttyUSB0".to_string())
        );

        // The only candidate is still returned
        assert_eq!(
            name(matcher.find_avoiding(&ports[..2], Some("/dev/ttyUSB0"))),
            Some("/dev/ttyUSB0".to_string())
        );
        assert_eq!(matcher.find_avoiding(&ports[1..2], None), None);
    }
}
