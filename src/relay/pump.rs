use log::{debug, info};
use std::fmt;
use std::io::{Error, ErrorKind, Read, Result, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SerialToTcp,
    TcpToSerial,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::SerialToTcp => write!(f, "serial->tcp"),
            Direction::TcpToSerial => write!(f, "tcp->serial"),
        }
    }
}

/// Why a pump returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The source reported end-of-stream.
    SourceClosed,
    /// The stop flag was raised while the pump was idle.
    Stopped,
}

/// Shared, one-way stop signal. Pumps poll it whenever a blocking call times out.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Unidirectional byte relay. Holds at most one chunk in flight: a chunk is
/// fully written before the next read, so back-pressure reaches the source.
pub struct Pump {
    direction: Direction,
    buf: Vec<u8>,
    stop: StopFlag,
    relayed: u64,
}

impl Pump {
    pub fn new(direction: Direction, chunk_size: usize, stop: StopFlag) -> Self {
        Pump {
            direction,
            buf: vec![0u8; chunk_size.max(1)],
            stop,
            relayed: 0,
        }
    }

    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    /// Relay until the source closes, the stop flag is raised, or I/O fails.
    /// There are no retries; any error is terminal for this pump.
    pub fn run<R, W>(&mut self, source: &mut R, destination: &mut W) -> Result<PumpEnd>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        let result = self.relay(source, destination);

        match &result {
            Ok(end) => debug!(
                "Pump({}): {:?} after {} bytes",
                self.direction, end, self.relayed
            ),
            Err(e) => info!(
                "Pump({}): {} after {} bytes",
                self.direction, e, self.relayed
            ),
        }

        result
    }

    fn relay<R, W>(&mut self, source: &mut R, destination: &mut W) -> Result<PumpEnd>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        loop {
            if self.stop.is_raised() {
                return Ok(PumpEnd::Stopped);
            }

            let n = match source.read(&mut self.buf) {
                Ok(0) => return Ok(PumpEnd::SourceClosed),
                Ok(n) => n,
                Err(ref e) if is_idle(e) => continue,
                Err(e) => return Err(e),
            };

            if !self.write_chunk(destination, n)? {
                return Ok(PumpEnd::Stopped);
            }
            self.relayed += n as u64;
        }
    }

    /// Returns false if the stop flag interrupted a stalled write.
    fn write_chunk<W: Write + ?Sized>(&mut self, destination: &mut W, len: usize) -> Result<bool> {
        let mut written = 0;
        while written < len {
            match destination.write(&self.buf[written..len]) {
                Ok(0) => return Err(Error::from(ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(ref e) if is_idle(e) => {
                    if self.stop.is_raised() {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

/// Timeouts and interrupted calls just mean "nothing happened this tick".
fn is_idle(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}
