use log::{error, info, warn};
use mio::net::TcpListener;
use mio::{Interest, Poll, Token};
use std::io::{Error, ErrorKind, Result};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

/// Outcome of a single accept attempt on the non-blocking listener.
#[derive(Debug)]
pub enum Accepted {
    /// A client, already switched to blocking mode.
    Client(TcpStream, SocketAddr),
    /// No more pending connections for this readiness edge.
    Drained,
    /// Something went wrong with one connection; try again on the next tick.
    Transient,
}

pub struct TcpServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TcpServer {
    /// Bind and listen. mio sets SO_REUSEADDR on the socket.
    pub fn new(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        info!("TcpServer: listening on {}", addr);

        Ok(TcpServer { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn register(&mut self, poll: &mut Poll, token: Token) -> Result<()> {
        poll.registry()
            .register(&mut self.listener, token, Interest::READABLE)
    }

    pub fn deregister(&mut self, poll: &mut Poll) {
        if let Err(e) = poll.registry().deregister(&mut self.listener) {
            error!("TcpServer: {} Deregister error: {}", self.addr, e);
        }
    }

    /// Accept one pending connection. An `Err` means the listener itself is
    /// no longer usable.
    pub fn accept(&mut self, tick: std::time::Duration) -> Result<Accepted> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                let stream = TcpStream::from(stream);
                match configure_client(&stream, tick) {
                    Ok(()) => Ok(Accepted::Client(stream, addr)),
                    Err(e) => {
                        warn!("TcpServer: {} cannot configure client {}: {}", self.addr, addr, e);
                        Ok(Accepted::Transient)
                    }
                }
            }

            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(Accepted::Drained),

            Err(e) if listener_unusable(&e) => {
                error!("TcpServer: {} Accept failed fatally: {}", self.addr, e);
                Err(e)
            }

            Err(e) => {
                warn!("TcpServer: {} Accept error: {}", self.addr, e);
                Ok(Accepted::Transient)
            }
        }
    }
}

impl AsRawFd for TcpServer {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        info!("TcpServer: {} closed", self.addr);
    }
}

/// Client sockets are used with blocking calls bounded by `tick`.
fn configure_client(stream: &TcpStream, tick: std::time::Duration) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(tick))?;
    stream.set_write_timeout(Some(tick))?;
    Ok(())
}

/// Errors after which accept() will never succeed again.
fn listener_unusable(err: &Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBADF) | Some(libc::EINVAL) | Some(libc::ENOTSOCK) | Some(libc::EFAULT)
    )
}
