use log::info;
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DEVICE: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUD_RATE: u32 = 115200;
pub const DEFAULT_PORT: u16 = 6969;
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "even" | "e" => Ok(Parity::Even),
            "odd" | "o" => Ok(Parity::Odd),
            _ => Err(format!("Invalid parity: {} (none, even, odd)", s)),
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parity::None => write!(f, "none"),
            Parity::Even => write!(f, "even"),
            Parity::Odd => write!(f, "odd"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteSize {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

impl FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "5" => Ok(ByteSize::Five),
            "6" => Ok(ByteSize::Six),
            "7" => Ok(ByteSize::Seven),
            "8" => Ok(ByteSize::Eight),
            _ => Err(format!("Invalid byte size: {} (5, 6, 7, 8)", s)),
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = match self {
            ByteSize::Five => 5,
            ByteSize::Six => 6,
            ByteSize::Seven => 7,
            ByteSize::Eight => 8,
        };
        write!(f, "{}", bits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

impl FromStr for StopBits {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "1" | "one" => Ok(StopBits::One),
            "1.5" | "one-point-five" => Ok(StopBits::OnePointFive),
            "2" | "two" => Ok(StopBits::Two),
            _ => Err(format!("Invalid stop bits: {} (1, 1.5, 2)", s)),
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopBits::One => write!(f, "1"),
            StopBits::OnePointFive => write!(f, "1.5"),
            StopBits::Two => write!(f, "2"),
        }
    }
}

/// Line settings used when opening the serial device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub byte_size: ByteSize,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// RTS/CTS
    pub hardware_flow_control: bool,
    /// XON/XOFF
    pub software_flow_control: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            path: DEFAULT_DEVICE.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            byte_size: ByteSize::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            hardware_flow_control: false,
            software_flow_control: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub serial: SerialSettings,
    pub bind_address: IpAddr,
    pub bind_port: u16,

    /// Size of the buffer each pump reads into. A read returns as soon as any
    /// byte is available, so this only bounds the burst size.
    pub chunk_size: usize,

    /// Idle tick for blocking reads and the accept loop.
    pub poll_interval: Duration,
    pub drain_timeout: Duration,

    /// 0 means unlimited.
    pub max_clients: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            serial: SerialSettings::default(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: DEFAULT_PORT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            drain_timeout: Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MS),
            max_clients: 0,
        }
    }
}

impl BridgeConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.bind_port)
    }

    /// Load the config file. An explicitly given path must exist and parse; the
    /// default `~/.uartbridge` is optional.
    pub fn load(path: Option<PathBuf>) -> Result<Self, String> {
        if let Some(p) = path {
            let config = BridgeConfig::load_from_file(&p)
                .map_err(|e| format!("{}: {}", p.display(), e))?;
            info!("Loaded config from {:?}", p);
            return Ok(config);
        }

        if let Some(p) = dirs::home_dir().map(|home| home.join(".uartbridge"))
            && p.exists()
        {
            let config = BridgeConfig::load_from_file(&p)
                .map_err(|e| format!("{}: {}", p.display(), e))?;
            info!("Loaded config from {:?}", p);
            return Ok(config);
        }

        Ok(BridgeConfig::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let content = fs::read_to_string(path).map_err(|e| e.to_string())?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let mut config = BridgeConfig::default();

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            config
                .parse_line(line)
                .map_err(|e| format!("Line {}: {}", line_num + 1, e))?;
        }

        Ok(config)
    }

    fn parse_line(&mut self, line: &str) -> Result<(), String> {
        let mut parts = line.split_whitespace();

        let directive = parts.next().ok_or("Empty directive")?;
        if directive != "set" {
            return Err(format!("Unknown directive: {}", directive));
        }

        let name = parts.next().ok_or("Missing setting name")?;
        let value = parts.next().ok_or("Missing setting value")?;
        if let Some(extra) = parts.next() {
            return Err(format!("Unexpected trailing value: {}", extra));
        }

        self.set(name, value)
    }

    /// Apply a single named option, as used by `set <name> <value>`.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), String> {
        match name {
            "device" => self.serial.path = value.to_string(),
            "baudrate" => self.serial.baud_rate = parse_number(name, value)?,
            "byte-size" => self.serial.byte_size = value.parse()?,
            "parity" => self.serial.parity = value.parse()?,
            "stop-bits" => self.serial.stop_bits = value.parse()?,
            "rtscts" => self.serial.hardware_flow_control = parse_bool(value)?,
            "xonxoff" => self.serial.software_flow_control = parse_bool(value)?,
            "bind-address" => {
                self.bind_address = value
                    .parse()
                    .map_err(|_| format!("Invalid IP address: {}", value))?
            }
            "port" => self.bind_port = parse_number(name, value)?,
            "chunk-size" => self.chunk_size = parse_number(name, value)?,
            "poll-interval-ms" => {
                self.poll_interval = Duration::from_millis(parse_number(name, value)?)
            }
            "drain-timeout-ms" => {
                self.drain_timeout = Duration::from_millis(parse_number(name, value)?)
            }
            "max-clients" => self.max_clients = parse_number(name, value)?,
            _ => return Err(format!("Unknown setting: {}", name)),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.serial.path.is_empty() {
            return Err("Serial device path is empty".to_string());
        }
        if self.serial.baud_rate == 0 {
            return Err("Baud rate must be greater than 0".to_string());
        }
        if self.serial.hardware_flow_control && self.serial.software_flow_control {
            return Err("Hardware and software flow control cannot both be enabled".to_string());
        }
        if self.chunk_size == 0 {
            return Err("Chunk size must be at least 1".to_string());
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(format!("Chunk size must be at most {}", MAX_CHUNK_SIZE));
        }
        if self.poll_interval.is_zero() {
            return Err("Poll interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Serial device: {}", self.serial.path)?;
        writeln!(f, "Baud rate: {}", self.serial.baud_rate)?;
        writeln!(f, "Byte size: {}", self.serial.byte_size)?;
        writeln!(f, "Parity: {}", self.serial.parity)?;
        writeln!(f, "Stop bits: {}", self.serial.stop_bits)?;
        writeln!(f, "Flow control hardware (RTS/CTS): {}", self.serial.hardware_flow_control)?;
        writeln!(f, "Flow control software (XON/XOFF): {}", self.serial.software_flow_control)?;
        writeln!(f, "Bind address: {}", self.bind_address)?;
        writeln!(f, "Bind port: {}", self.bind_port)?;
        writeln!(f, "Chunk size: {}", self.chunk_size)?;
        match self.max_clients {
            0 => write!(f, "Max clients: unlimited"),
            n => write!(f, "Max clients: {}", n),
        }
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T, String> {
    value
        .parse::<T>()
        .map_err(|_| format!("Invalid number for {}: {}", name, value))
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(format!("Invalid boolean value: {}", value)),
    }
}
