#![allow(dead_code)]

use std::ffi::CStr;
use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => {{
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap();
        println!(
            "{}.{:06} {}",
            now.as_secs(),
            now.subsec_micros(),
            format_args!($($arg)*)
        );
    }};
}

/// Helper to find an available port
pub async fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for a TCP port to become available
pub async fn wait_for_port(port: u16, timeout_ms: u64) -> bool {
    let addr = format!("127.0.0.1:{}", port);
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut attempts = 0;
    while tokio::time::Instant::now() < deadline {
        attempts += 1;
        if TcpStream::connect(&addr).is_ok() {
            tprintln!("wait_for_port: {} ready after {} attempts", addr, attempts);
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tprintln!("wait_for_port: {} TIMEOUT after {} attempts", addr, attempts);
    false
}

/// Connect a client with a read timeout so a missing byte fails the test
/// instead of hanging it.
pub fn connect_client(port: u16) -> TcpStream {
    let client = TcpStream::connect(format!("127.0.0.1:{}", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    client
}

/// Pseudo-terminal pair standing in for a UART. The bridge opens the slave
/// path like any serial device; the test drives the master side.
pub struct Pty {
    master: File,
    slave_path: String,
}

impl Pty {
    pub fn open() -> Self {
        unsafe {
            let fd = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
            assert!(fd >= 0, "posix_openpt failed");
            assert_eq!(libc::grantpt(fd), 0, "grantpt failed");
            assert_eq!(libc::unlockpt(fd), 0, "unlockpt failed");

            let mut name = [0 as libc::c_char; 128];
            assert_eq!(
                libc::ptsname_r(fd, name.as_mut_ptr(), name.len()),
                0,
                "ptsname_r failed"
            );
            let slave_path = CStr::from_ptr(name.as_ptr())
                .to_string_lossy()
                .into_owned();

            Pty {
                master: File::from_raw_fd(fd),
                slave_path,
            }
        }
    }

    pub fn path(&self) -> &str {
        &self.slave_path
    }

    /// Bytes "arriving" on the serial line.
    pub fn send(&mut self, bytes: &[u8]) {
        self.master.write_all(bytes).unwrap();
        self.master.flush().unwrap();
    }

    /// Read exactly `len` bytes the bridge wrote to the serial line.
    pub fn expect(&mut self, len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(len);
        let mut buf = [0u8; 256];

        while out.len() < len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            assert!(
                !remaining.is_zero(),
                "timeout: got {:?}, wanted {} bytes",
                out,
                len
            );

            let mut pfd = libc::pollfd {
                fd: self.master.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ready = unsafe { libc::poll(&mut pfd, 1, remaining.as_millis() as libc::c_int) };
            if ready <= 0 {
                continue;
            }

            let want = (len - out.len()).min(buf.len());
            let n = self.master.read(&mut buf[..want]).unwrap();
            out.extend_from_slice(&buf[..n]);
        }

        out
    }

    /// True if nothing arrives on the serial line within `window`.
    pub fn quiet_for(&mut self, window: Duration) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.master.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, window.as_millis() as libc::c_int) };
        ready == 0
    }
}

/// Log level for uartbridge
#[derive(Debug, Clone, Copy, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn unique_temp(prefix: &str, ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "{}_{}_{}.{}",
        prefix,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos(),
        ext
    ))
}

/// Builder for configuring and spawning a uartbridge process
#[derive(Debug, Default)]
pub struct BridgeBuilder {
    device: Option<String>,
    listen_port: Option<u16>,
    log_level: LogLevel,
    extra_args: Vec<String>,
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serial device path
    pub fn device(mut self, path: &str) -> Self {
        self.device = Some(path.to_string());
        self
    }

    /// Listen for client connections on the given port
    pub fn listen(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Set the log level
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Pass an additional command line argument
    pub fn arg(mut self, arg: &str) -> Self {
        self.extra_args.push(arg.to_string());
        self
    }

    /// Spawn the uartbridge process
    pub fn spawn(self) -> BridgeProcess {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_uartbridge"));

        if let Some(device) = &self.device {
            cmd.arg(device);
        }

        if let Some(port) = self.listen_port {
            cmd.arg("-a").arg("127.0.0.1").arg("-p").arg(port.to_string());
        }

        // Keep a config file in $HOME from leaking into the test.
        let config_file = unique_temp("uartbridge_test", "conf");
        std::fs::write(&config_file, "# test\n").unwrap();
        cmd.arg("--config").arg(&config_file);

        let log_file = unique_temp("uartbridge_test", "log");
        cmd.arg("--log-file").arg(&log_file);
        cmd.arg("--log-level").arg(self.log_level.as_str());
        cmd.arg("--poll-interval-ms").arg("20");

        cmd.args(&self.extra_args);

        tprintln!("Spawning: {:?}", cmd);

        let child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("Failed to spawn uartbridge");

        BridgeProcess {
            child,
            log_file,
            config_file,
        }
    }
}

/// A running uartbridge process with access to logs and cleanup
pub struct BridgeProcess {
    child: Child,
    log_file: PathBuf,
    config_file: PathBuf,
}

impl BridgeProcess {
    /// Create a new builder
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::new()
    }

    /// Check if the process is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Read the contents of the log file
    pub fn read_log(&self) -> String {
        std::fs::read_to_string(&self.log_file).unwrap_or_default()
    }

    /// Read and filter log lines containing any of the given patterns
    pub fn grep_log(&self, patterns: &[&str]) -> Vec<String> {
        self.read_log()
            .lines()
            .filter(|line| patterns.iter().any(|p| line.contains(p)))
            .map(String::from)
            .collect()
    }

    /// Everything the process printed to stdout. Only complete once it exited.
    pub fn read_stdout(&mut self) -> String {
        let mut output = String::new();
        if let Some(mut stdout) = self.child.stdout.take() {
            let _ = stdout.read_to_string(&mut output);
        }
        output
    }

    /// Read stderr from the process (useful if it crashed)
    pub fn read_stderr(&mut self) -> String {
        let mut output = String::new();
        if let Some(mut stderr) = self.child.stderr.take() {
            let _ = stderr.read_to_string(&mut output);
        }
        output
    }

    /// Send SIGINT, like Ctrl+C in a terminal
    pub fn interrupt(&mut self) {
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGINT);
        }
    }

    /// Wait up to `timeout` for the process to exit on its own
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                Err(_) => return None,
            }
        }
        None
    }

    /// Gracefully stop the process (SIGTERM, wait 3s, then SIGKILL if needed)
    pub fn stop(&mut self) -> Option<ExitStatus> {
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGTERM);
        }

        if let Some(status) = self.wait_timeout(Duration::from_secs(3)) {
            return Some(status);
        }

        // Process didn't exit gracefully, force kill
        let _ = self.child.kill();
        let _ = self.child.wait();
        None
    }
}

impl Drop for BridgeProcess {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }

        tprintln!("Log content:\r\n{}", self.read_log());

        let _ = std::fs::remove_file(&self.log_file);
        let _ = std::fs::remove_file(&self.config_file);
    }
}
