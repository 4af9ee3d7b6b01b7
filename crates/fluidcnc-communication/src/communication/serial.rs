//! Serial port transport
//!
//! Direct USB/RS-232 connection to the controller. Opens the port 8N1 with
//! DTR asserted and reads on a dedicated thread, since the `serialport` crate
//! only offers blocking I/O.
//!
//! Supports:
//! - Port enumeration and discovery
//! - Baud rate configuration
//! - Realtime bytes written straight to the port

use async_trait::async_trait;
use fluidcnc_core::{ConnectionError, Error, Result, TransportKind};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Inbound, LinkWriter, Transport, TransportLink};
use crate::firmware::connection_watch::ActivityClock;
use crate::firmware::grbl::realtime::RealtimeCommand;

/// USB vendor id of the STM32 boards most grblHAL builds run on
pub const GRBLHAL_STM32_VID: u16 = 0x0483;

/// Short read timeout so the reader thread notices a close quickly
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }

    /// Set manufacturer
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set serial number
    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }

    /// Whether the USB ids look like a grblHAL board
    pub fn is_likely_grblhal(&self) -> bool {
        self.vid == Some(GRBLHAL_STM32_VID)
    }
}

/// List serial ports that could host a CNC controller
///
/// Filters to:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*, and the grblHAL simulator's /dev/ttyGRBL
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        Error::other(format!("Failed to enumerate ports: {}", e))
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_valid_cnc_port(&port.port_name))
        .map(|port| {
            let info = SerialPortInfo::new(&port.port_name, get_port_description(port));
            match &port.port_type {
                serialport::SerialPortType::UsbPort(usb_info) => {
                    let mut info = info.with_usb_ids(usb_info.vid, usb_info.pid);
                    if let Some(ref mfg) = usb_info.manufacturer {
                        info = info.with_manufacturer(mfg);
                    }
                    if let Some(ref serial) = usb_info.serial_number {
                        info = info.with_serial_number(serial);
                    }
                    info
                }
                _ => info,
            }
        })
        .collect())
}

fn is_valid_cnc_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name == "/dev/ttyGRBL"
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

fn get_port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            format!(
                "USB {} {}",
                usb_info.manufacturer.as_deref().unwrap_or("Device"),
                usb_info.product.as_deref().unwrap_or("Serial Port")
            )
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Serial transport
#[derive(Debug, Clone)]
pub struct SerialTransport {
    port: String,
    baud_rate: u32,
}

impl SerialTransport {
    /// Create a transport for `port` at `baud_rate`
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

struct SerialWriter {
    name: String,
    port: Mutex<Box<dyn serialport::SerialPort>>,
    open: Arc<AtomicBool>,
}

impl SerialWriter {
    fn write_bytes(&self, bytes: &[u8]) -> std::result::Result<(), ConnectionError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        let mut port = self.port.lock();
        port.write_all(bytes)
            .and_then(|_| port.flush())
            .map_err(|e| ConnectionError::WriteFailed {
                endpoint: self.name.clone(),
                reason: e.to_string(),
            })
    }
}

impl LinkWriter for SerialWriter {
    fn write_line(&self, line: &str) -> std::result::Result<(), ConnectionError> {
        tracing::trace!("TX {}", line);
        self.write_bytes(format!("{}\n", line).as_bytes())
    }

    fn write_realtime(&self, command: RealtimeCommand) -> std::result::Result<(), ConnectionError> {
        tracing::trace!("TX realtime {}", command);
        self.write_bytes(&[command.byte()])
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("Closing serial port {}", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

fn read_loop(
    mut reader: Box<dyn serialport::SerialPort>,
    inbound: mpsc::UnboundedSender<Inbound>,
    activity: ActivityClock,
    open: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 1024];
    let closed = loop {
        if !open.load(Ordering::SeqCst) {
            break Inbound::Closed {
                clean: true,
                reason: "closed locally".to_string(),
            };
        }
        match reader.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                activity.touch();
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                if inbound.send(Inbound::Text(text)).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                break Inbound::Closed {
                    clean: false,
                    reason: e.to_string(),
                }
            }
        }
    };
    open.store(false, Ordering::SeqCst);
    let _ = inbound.send(closed);
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn endpoint(&self) -> String {
        self.port.clone()
    }

    async fn connect(&self) -> std::result::Result<TransportLink, ConnectionError> {
        let failed = |reason: String| ConnectionError::FailedToOpen {
            endpoint: self.port.clone(),
            reason,
        };
        if self.baud_rate == 0 {
            return Err(ConnectionError::InvalidParameters {
                reason: "baud rate must be positive".to_string(),
            });
        }

        let mut port = serialport::new(&self.port, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| {
                warn!("Failed to open serial port {}: {}", self.port, e);
                failed(e.to_string())
            })?;

        if let Err(e) = port.write_data_terminal_ready(true) {
            warn!("Could not assert DTR on {}: {}", self.port, e);
        }

        let reader = port.try_clone().map_err(|e| failed(e.to_string()))?;
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let activity = ActivityClock::new();
        let open = Arc::new(AtomicBool::new(true));

        let thread_activity = activity.clone();
        let thread_open = Arc::clone(&open);
        std::thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || read_loop(reader, in_tx, thread_activity, thread_open))
            .map_err(|e| failed(e.to_string()))?;

        info!("Opened {} at {} baud", self.port, self.baud_rate);
        Ok(TransportLink {
            writer: Arc::new(SerialWriter {
                name: self.port.clone(),
                port: Mutex::new(port),
                open,
            }),
            inbound: in_rx,
            activity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_filter() {
        assert!(is_valid_cnc_port("COM3"));
        assert!(!is_valid_cnc_port("COM"));
        assert!(!is_valid_cnc_port("COMX"));
        assert!(is_valid_cnc_port("/dev/ttyACM0"));
        assert!(is_valid_cnc_port("/dev/ttyGRBL"));
        assert!(is_valid_cnc_port("/dev/cu.usbmodem1101"));
        assert!(!is_valid_cnc_port("/dev/ttyS0"));
    }

    #[test]
    fn test_grblhal_vid() {
        let info = SerialPortInfo::new("/dev/ttyACM0", "USB").with_usb_ids(0x0483, 0x5740);
        assert!(info.is_likely_grblhal());
        assert!(!SerialPortInfo::new("/dev/ttyUSB0", "USB").is_likely_grblhal());
    }

    #[tokio::test]
    async fn test_missing_port_fails_to_open() {
        let transport = SerialTransport::new("/dev/does-not-exist-fluidcnc", 115_200);
        assert!(matches!(
            transport.connect().await,
            Err(ConnectionError::FailedToOpen { .. })
        ));
    }
}
