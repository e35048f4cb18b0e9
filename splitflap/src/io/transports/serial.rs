use crate::errors::ProtocolError::NotInitialized;
use crate::errors::{Error, SessionError};
use crate::io::IoTransport;
use log::trace;
use parking_lot::Mutex;
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortInfo, SerialPortType, StopBits};
use std::fmt::{Display, Formatter};
use std::io::{BufRead, Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Baud rate of the splitflap firmware.
pub const BAUD_RATE: u32 = 230_400;

/// Default read timeout: short enough for the session reader to notice a shutdown quickly.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug)]
pub struct Serial {
    /// The connection port.
    port: String,
    /// The connection speed.
    baud_rate: u32,
    /// Handle used for reading only.
    #[cfg_attr(feature = "serde", serde(skip))]
    reader: SharedPort,
    /// Handle used for writing only (a clone of the reading one).
    #[cfg_attr(feature = "serde", serde(skip))]
    writer: SharedPort,
}

impl Serial {
    /// Constructs a new `Serial` transport layer instance for communication through the specified port.
    ///
    /// # Arguments
    /// * `port` - The serial port to use for communication.
    ///
    /// # Example
    /// ```
    /// use splitflap::hardware::Splitflap;
    /// use splitflap::io::Serial;
    ///
    /// let session = Splitflap::from(Serial::new("/dev/ttyUSB0"));
    /// ```
    pub fn new<P: Into<String>>(port: P) -> Self {
        Self {
            port: port.into(),
            baud_rate: BAUD_RATE,
            reader: Arc::new(Mutex::new(None)),
            writer: Arc::new(Mutex::new(None)),
        }
    }

    /// Overrides the default baud rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Retrieves the configured port.
    pub fn get_port(&self) -> String {
        self.port.clone()
    }

    /// Retrieves the configured baud rate.
    pub fn get_baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

impl Default for Serial {
    /// Creates a new serial transport connection with the first available port or an empty string if no ports are available.
    ///
    /// # Notes
    /// The first available port will be used, None otherwise, which will probably lead to an error
    /// during the open phase.
    #[cfg(not(tarpaulin_include))]
    fn default() -> Self {
        let ports = serialport::available_ports().unwrap_or_else(|_| vec![]);
        match ports.first() {
            Some(port) => Self::new(&port.port_name),
            None => Self::new(""),
        }
    }
}

impl Display for Serial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Serial({})", self.port)
    }
}

impl IoTransport for Serial {
    fn open(&mut self) -> Result<(), Error> {
        let connexion = serialport::new(self.port.clone(), self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;
        trace!("Serial port is now opened: {:?}", connexion);

        let writer = connexion.try_clone()?;
        *self.reader.lock() = Some(connexion);
        *self.writer.lock() = Some(writer);

        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        *self.writer.lock() = None;
        *self.reader.lock() = None;
        Ok(())
    }

    fn set_timeout(&mut self, duration: Duration) -> Result<(), Error> {
        self.reader
            .lock()
            .as_mut()
            .ok_or(NotInitialized)?
            .set_timeout(duration)?;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut lock = self.writer.lock();
        let port = lock.as_mut().ok_or(NotInitialized)?;
        port.write_all(buf)?;
        port.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut lock = self.reader.lock();
        match lock.as_mut().ok_or(NotInitialized)?.read(buf) {
            Ok(count) => Ok(count),
            Err(error) if error.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(error) => Err(error.into()),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(value: serialport::Error) -> Self {
        std::io::Error::from(value).into()
    }
}

/// Short human description of a port, shown next to its name.
fn describe(port: &SerialPortInfo) -> String {
    match &port.port_type {
        SerialPortType::UsbPort(info) => info
            .product
            .clone()
            .or_else(|| info.manufacturer.clone())
            .unwrap_or_else(|| format!("USB {:04x}:{:04x}", info.vid, info.pid)),
        SerialPortType::PciPort => String::from("PCI"),
        SerialPortType::BluetoothPort => String::from("Bluetooth"),
        SerialPortType::Unknown => String::from("n/a"),
    }
}

/// Lists `ports` to `output` and reads the chosen index from `input`.
///
/// # Errors
/// * `NoSerialPort`: `ports` is empty.
/// * `InvalidSelection`: the answer is not the index of a listed port.
pub fn select_serial_port<R: BufRead, W: Write>(
    ports: &[SerialPortInfo],
    input: &mut R,
    output: &mut W,
) -> Result<String, Error> {
    if ports.is_empty() {
        return Err(SessionError::NoSerialPort.into());
    }

    writeln!(output, "Available ports:")?;
    for (i, port) in ports.iter().enumerate() {
        writeln!(output, "[{:>2}] {} - {}", i, port.port_name, describe(port))?;
    }
    write!(output, "Use which port? ")?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    let answer = answer.trim();

    answer
        .parse::<usize>()
        .ok()
        .and_then(|index| ports.get(index))
        .map(|port| port.port_name.clone())
        .ok_or_else(|| {
            SessionError::InvalidSelection {
                input: answer.to_string(),
            }
            .into()
        })
}

/// Interactively asks which serial port to use (through stdin/stdout).
#[cfg(not(tarpaulin_include))]
pub fn ask_for_serial_port() -> Result<String, Error> {
    let ports = serialport::available_ports()?;
    let stdin = std::io::stdin();
    select_serial_port(&ports, &mut stdin.lock(), &mut std::io::stdout())
}
