//! Blocking serial channel to the knob.
//!
//! Commands are single `\n`-terminated ASCII lines written in 48-byte
//! chunks; answers are every line the device sends until it has been quiet
//! for the command timeout. The channel is owned by one thread (see
//! `actor.rs`) so there is never more than one writer.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

pub const BAUD_RATE: u32 = 115_200;
/// Larger bursts lose bytes on the device's USB CDC endpoint.
pub const CHUNK_SIZE: usize = 48;
pub const DISCOVERY_KEYWORDS: &[&str] = &["usb", "serial", "esp32", "cp210", "ch340"];

pub const PING: &str = "PING";
pub const PONG: &str = "PONG";
pub const ACK: &str = "OK";

/// Byte stream to a serial device. Reads must honour the timeout set
/// through [`SerialLink::set_read_timeout`] and report expiry as
/// `TimedOut` or `WouldBlock`.
pub trait SerialLink: Read + Write + Send {
    fn clear_input(&mut self) -> io::Result<()>;
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

impl SerialLink for Box<dyn serialport::SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout).map_err(io::Error::from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub name: String,
    pub description: String,
}

impl PortCandidate {
    pub fn looks_like_device(&self) -> bool {
        let haystack = format!("{} {}", self.name, self.description).to_lowercase();
        DISCOVERY_KEYWORDS.iter().any(|k| haystack.contains(k))
    }
}

pub trait PortProvider: Send {
    fn candidates(&self) -> io::Result<Vec<PortCandidate>>;
    fn open(&self, port: &str) -> io::Result<Box<dyn SerialLink>>;
}

/// Ports enumerated by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortProvider for SystemPorts {
    fn candidates(&self) -> io::Result<Vec<PortCandidate>> {
        let ports = serialport::available_ports().map_err(io::Error::from)?;
        Ok(ports
            .into_iter()
            .map(|info| {
                let description = match info.port_type {
                    serialport::SerialPortType::UsbPort(usb) => {
                        let mut parts = vec!["USB".to_string()];
                        parts.extend(usb.manufacturer);
                        parts.extend(usb.product);
                        parts.join(" ")
                    }
                    serialport::SerialPortType::PciPort => "PCI".to_string(),
                    serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                    serialport::SerialPortType::Unknown => String::new(),
                };
                PortCandidate {
                    name: info.port_name,
                    description,
                }
            })
            .collect())
    }

    fn open(&self, port: &str) -> io::Result<Box<dyn SerialLink>> {
        let link = serialport::new(port, BAUD_RATE)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(io::Error::from)?;
        Ok(Box::new(link))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelTiming {
    /// Silence that ends a command's response.
    pub quiet_timeout: Duration,
    /// How long discovery waits for `PONG`.
    pub verify_timeout: Duration,
    /// Pause after opening a port before talking to it.
    pub settle: Duration,
    pub chunk_delay: Duration,
    /// Upper bound for a single blocking read.
    pub poll_slice: Duration,
}

impl Default for ChannelTiming {
    fn default() -> Self {
        Self {
            quiet_timeout: Duration::from_secs(3),
            verify_timeout: Duration::from_secs(3),
            settle: Duration::from_millis(500),
            chunk_delay: Duration::from_millis(5),
            poll_slice: Duration::from_millis(100),
        }
    }
}

pub struct DeviceChannel<P> {
    ports: P,
    timing: ChannelTiming,
    link: Option<Box<dyn SerialLink>>,
    port: Option<String>,
    reader: LineReader,
}

impl<P: PortProvider> DeviceChannel<P> {
    pub fn new(ports: P) -> Self {
        Self::with_timing(ports, ChannelTiming::default())
    }

    pub fn with_timing(ports: P, timing: ChannelTiming) -> Self {
        Self {
            ports,
            timing,
            link: None,
            port: None,
            reader: LineReader::default(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    /// First candidate port that answers `PING` with `PONG`.
    pub fn discover(&mut self) -> Option<String> {
        let candidates = match self.ports.candidates() {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Failed to enumerate serial ports: {}", e);
                return None;
            }
        };
        candidates
            .into_iter()
            .filter(PortCandidate::looks_like_device)
            .find(|candidate| self.verify(&candidate.name))
            .map(|candidate| candidate.name)
    }

    /// Open `port`, ping it and close it again.
    pub fn verify(&self, port: &str) -> bool {
        match self.ping(port) {
            Ok(found) => found,
            Err(e) => {
                debug!(port, "Device verification failed: {}", e);
                false
            }
        }
    }

    fn ping(&self, port: &str) -> io::Result<bool> {
        let mut link = self.ports.open(port)?;
        pause(self.timing.settle);
        link.clear_input()?;
        write_chunked(link.as_mut(), format!("{PING}\n").as_bytes(), self.timing.chunk_delay)?;

        let mut reader = LineReader::default();
        let deadline = Instant::now() + self.timing.verify_timeout;
        while let Some(line) = reader.read_line(link.as_mut(), deadline, self.timing.poll_slice)? {
            if line == PONG {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn connect(&mut self, port: &str) -> bool {
        self.disconnect();
        match self.ports.open(port) {
            Ok(link) => {
                pause(self.timing.settle);
                self.link = Some(link);
                self.port = Some(port.to_string());
                info!("Connected to FocusKnob on {}", port);
                true
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", port, e);
                false
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.reader.clear();
        self.port = None;
        if self.link.take().is_some() {
            info!("Disconnected from FocusKnob");
        }
    }

    /// Send one command line and collect its response. An empty result
    /// after an I/O failure leaves the channel disconnected.
    pub fn send_command(&mut self, command: &str) -> Vec<String> {
        let Some(link) = self.link.as_mut() else {
            return Vec::new();
        };
        let line = format!("{}\n", command.replace(['\r', '\n'], " "));
        match exchange(link.as_mut(), &mut self.reader, line.as_bytes(), &self.timing) {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Command failed: {}", e);
                self.disconnect();
                Vec::new()
            }
        }
    }

    pub fn send_ack(&mut self) {
        if let Some(link) = self.link.as_mut() {
            let line = format!("{ACK}\n");
            if let Err(e) = write_chunked(link.as_mut(), line.as_bytes(), self.timing.chunk_delay) {
                debug!("Ack write failed: {}", e);
            }
        }
    }

    /// One line of unsolicited output, if any arrives within `timeout`.
    pub fn read_line(&mut self, timeout: Duration) -> Option<String> {
        let link = self.link.as_mut()?;
        let deadline = Instant::now() + timeout;
        match self.reader.read_line(link.as_mut(), deadline, self.timing.poll_slice) {
            Ok(line) => line,
            Err(e) => {
                debug!("Read error: {}", e);
                None
            }
        }
    }
}

fn exchange(
    link: &mut dyn SerialLink,
    reader: &mut LineReader,
    line: &[u8],
    timing: &ChannelTiming,
) -> io::Result<Vec<String>> {
    write_chunked(link, line, timing.chunk_delay)?;

    let mut responses = Vec::new();
    let mut deadline = Instant::now() + timing.quiet_timeout;
    while let Some(response) = reader.read_line(link, deadline, timing.poll_slice)? {
        responses.push(response);
        deadline = Instant::now() + timing.quiet_timeout;
    }
    Ok(responses)
}

fn write_chunked(link: &mut dyn SerialLink, data: &[u8], delay: Duration) -> io::Result<()> {
    let mut chunks = data.chunks(CHUNK_SIZE).peekable();
    while let Some(chunk) = chunks.next() {
        link.write_all(chunk)?;
        link.flush()?;
        if chunks.peek().is_some() {
            pause(delay);
        }
    }
    Ok(())
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}

/// Splits the byte stream into trimmed, non-empty lines. Bytes of an
/// incomplete line stay buffered across calls.
#[derive(Debug, Default)]
struct LineReader {
    pending: Vec<u8>,
}

impl LineReader {
    fn clear(&mut self) {
        self.pending.clear();
    }

    fn next_buffered(&mut self) -> Option<String> {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    fn read_line(
        &mut self,
        link: &mut dyn SerialLink,
        deadline: Instant,
        slice: Duration,
    ) -> io::Result<Option<String>> {
        let mut chunk = [0u8; 256];
        loop {
            if let Some(line) = self.next_buffered() {
                return Ok(Some(line));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(slice).max(Duration::from_millis(1));
            link.set_read_timeout(wait)?;
            match link.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port closed",
                    ))
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn connected(quiet: Duration) -> (DeviceChannel<ScriptedPorts>, ScriptedLink) {
        let mut ports = ScriptedPorts::default();
        let link = ports.add("/dev/ttyACM0", "USB JTAG/serial debug unit");
        let mut channel = DeviceChannel::with_timing(ports, fast_timing(quiet));
        assert!(channel.connect("/dev/ttyACM0"));
        (channel, link)
    }

    #[test]
    fn long_command_is_chunked_transparently() {
        let (mut channel, link) = connected(ms(50));
        let payload = format!("WEATHER:{}", "x".repeat(130));

        channel.send_command(&payload);

        let script = link.script.lock().unwrap();
        assert_eq!(script.written_text(), format!("{payload}\n"));
        assert!(script.write_sizes.iter().all(|&n| n <= CHUNK_SIZE));
        assert_eq!(script.write_sizes.len(), (payload.len() + 1).div_ceil(CHUNK_SIZE));
    }

    #[test]
    fn embedded_newlines_become_spaces() {
        let (mut channel, link) = connected(ms(30));
        channel.send_command("NOTE:a\r\nb");
        assert_eq!(link.script.lock().unwrap().written_text(), "NOTE:a  b\n");
    }

    #[test]
    fn quiet_timeout_collects_until_silence() {
        let (mut channel, link) = connected(ms(200));
        {
            let mut script = link.script.lock().unwrap();
            script.reply(ms(50), "A\n");
            script.reply(ms(200), "B\n");
            script.reply(ms(320), "C\r\n\n");
            script.reply(ms(720), "LATE\n");
        }

        assert_eq!(channel.send_command("GET_LOGS"), vec!["A", "B", "C"]);
        // The late line is not lost, it is the next unsolicited line.
        assert_eq!(channel.read_line(ms(1000)).as_deref(), Some("LATE"));
    }

    #[test]
    fn silent_device_yields_empty_response_but_stays_connected() {
        let (mut channel, _link) = connected(ms(40));
        assert!(channel.send_command(PING).is_empty());
        assert!(channel.is_connected());
    }

    #[test]
    fn split_line_is_reassembled() {
        let (mut channel, link) = connected(ms(100));
        {
            let mut script = link.script.lock().unwrap();
            script.reply(ms(10), "PO");
            script.reply(ms(30), "NG\nTIME_");
            script.reply(ms(50), "OK\n");
        }
        assert_eq!(channel.send_command(PING), vec!["PONG", "TIME_OK"]);
    }

    #[test]
    fn write_failure_disconnects() {
        let (mut channel, link) = connected(ms(30));
        link.script.lock().unwrap().fail_writes = true;

        assert!(channel.send_command(PING).is_empty());
        assert!(!channel.is_connected());
        assert_eq!(channel.port(), None);
        // Further calls are no-ops rather than errors.
        assert!(channel.send_command(PING).is_empty());
        channel.send_ack();
        assert_eq!(channel.read_line(ms(10)), None);
    }

    #[test]
    fn discover_skips_unlikely_and_silent_ports() {
        let mut ports = ScriptedPorts::default();
        ports.add("/dev/ttyS0", "");
        ports.add("/dev/ttyUSB0", "USB CP2102 UART bridge");
        let knob = ports.add("/dev/ttyACM0", "USB Espressif ESP32-S3");
        knob.script.lock().unwrap().reply(ms(10), "READY:FocusKnob\nPONG\n");
        let opened = ports.opened.clone();

        let mut channel = DeviceChannel::with_timing(ports, fast_timing(ms(80)));
        assert_eq!(channel.discover().as_deref(), Some("/dev/ttyACM0"));
        assert!(!channel.is_connected(), "discovery does not keep the port open");

        assert_eq!(
            *opened.lock().unwrap(),
            vec!["/dev/ttyUSB0".to_string(), "/dev/ttyACM0".to_string()]
        );
        let script = knob.script.lock().unwrap();
        assert_eq!(script.clears, 1);
        assert_eq!(script.written_text(), "PING\n");
    }

    #[test]
    fn ack_is_a_single_ok_line() {
        let (mut channel, link) = connected(ms(30));
        channel.send_ack();
        assert_eq!(link.script.lock().unwrap().written_text(), "OK\n");
    }
}
