use mio::Token;
use std::io::{Read, Result, Write};

pub const TOKEN_SERVER: Token = Token(0);
pub const TOKEN_SIGNAL: Token = Token(1);
pub const TOKEN_WAKER: Token = Token(2);

/// A blocking handle to the shared serial device.
///
/// Reads must return within a bounded time (read timeout) so relay loops can
/// observe their stop flag; a timeout surfaces as `TimedOut` or `WouldBlock`.
pub trait SerialHandle: Read + Write + Send {
    /// Open another handle onto the same underlying device. Clones are not
    /// arbitrated: concurrent readers race for bytes, writers interleave.
    fn try_clone_handle(&self) -> Result<Box<dyn SerialHandle>>;

    fn addr_as_string(&self) -> String;

    /// Release this handle. Closing must not fail; problems are only logged.
    fn close(self: Box<Self>) {}
}

#[cfg(test)]
impl SerialHandle for std::os::unix::net::UnixStream {
    fn try_clone_handle(&self) -> Result<Box<dyn SerialHandle>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn addr_as_string(&self) -> String {
        "Serial-Double".to_string()
    }
}

/// Serial test double: the bridge side of a socket pair plus the "wire" end a
/// test drives.
#[cfg(test)]
pub fn serial_double(
    tick: std::time::Duration,
) -> (std::os::unix::net::UnixStream, std::os::unix::net::UnixStream) {
    let (bridge_side, wire) = std::os::unix::net::UnixStream::pair().unwrap();
    bridge_side.set_read_timeout(Some(tick)).unwrap();
    bridge_side.set_write_timeout(Some(tick)).unwrap();
    wire.set_read_timeout(Some(std::time::Duration::from_secs(2)))
        .unwrap();
    (bridge_side, wire)
}
