use log::{error, info, trace};
use mio::{Events, Interest, Poll, Waker};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BridgeError;
use crate::io::{Accepted, TcpServer};
use crate::relay::{Admission, SessionRegistry, StopFlag};
use crate::traits::{SerialHandle, TOKEN_SERVER, TOKEN_SIGNAL, TOKEN_WAKER};

/// Why the accept loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    Signal(i32),
    Requested,
}

/// Lets another thread end the accept loop as if a signal had arrived.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
    flag: StopFlag,
}

#[cfg_attr(not(test), allow(dead_code))]
impl ShutdownHandle {
    pub fn request(&self) {
        self.flag.raise();
        if let Err(e) = self.waker.wake() {
            error!("Hub: wake failed: {}", e);
        }
    }
}

/// Session manager: waits for connections and signals, and hands every
/// accepted client to a relay session without waiting on it.
pub struct IoHub {
    poll: Poll,
    signals: Signals,
    waker: Arc<Waker>,
    shutdown: StopFlag,

    registry: SessionRegistry,

    chunk_size: usize,
    tick: Duration,
}

impl IoHub {
    pub fn new(chunk_size: usize, tick: Duration, max_clients: usize) -> std::io::Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let poll = Poll::new()?;

        poll.registry()
            .register(&mut signals, TOKEN_SIGNAL, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), TOKEN_WAKER)?);

        Ok(IoHub {
            poll,
            signals,
            waker,
            shutdown: StopFlag::new(),
            registry: SessionRegistry::new(max_clients),
            chunk_size,
            tick,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: self.waker.clone(),
            flag: self.shutdown.clone(),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Accept loop. Returns on signal or shutdown request, or with an error if
    /// the listener or the poller broke.
    pub fn serve(
        &mut self,
        server: &mut TcpServer,
        serial: &dyn SerialHandle,
    ) -> Result<ServeExit, BridgeError> {
        server
            .register(&mut self.poll, TOKEN_SERVER)
            .map_err(BridgeError::Poll)?;

        let mut events = Events::with_capacity(128);

        // Connections may have queued up before the listener was registered.
        let mut accept_pending = true;

        loop {
            if accept_pending {
                accept_pending = self.accept_all(server, serial)?;
            }

            match self.poll.poll(&mut events, Some(self.tick)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {
                    // EINTR - signal received, it is read on the next iteration
                }
                Err(e) => return Err(BridgeError::Poll(e)),
            }

            let mut exit = None;
            for event in events.iter() {
                match event.token() {
                    TOKEN_SERVER => accept_pending = true,
                    TOKEN_SIGNAL => {
                        for signal in self.signals.pending() {
                            info!("Hub: Received signal {}, initiating graceful shutdown", signal);
                            exit = Some(ServeExit::Signal(signal));
                        }
                    }
                    TOKEN_WAKER => trace!("Hub: woken"),
                    token => trace!("Hub: Ignoring event for unknown token: {}", token.0),
                }
            }

            if let Some(exit) = exit {
                return Ok(exit);
            }

            if self.shutdown.is_raised() {
                info!("Hub: shutdown requested");
                return Ok(ServeExit::Requested);
            }

            let reaped = self.registry.reap();
            if reaped > 0 {
                trace!("Hub: reaped {} sessions, {} active", reaped, self.registry.len());
            }
        }
    }

    /// Must loop until WouldBlock because mio uses edge-triggered epoll. Returns
    /// true if a transient error cut the burst short and accept should be retried.
    fn accept_all(
        &mut self,
        server: &mut TcpServer,
        serial: &dyn SerialHandle,
    ) -> Result<bool, BridgeError> {
        loop {
            match server.accept(self.tick).map_err(BridgeError::Accept)? {
                Accepted::Client(stream, peer) => {
                    match self.registry.admit(stream, peer, serial, self.chunk_size) {
                        Ok(Admission::Started(id)) => {
                            info!("Hub: Session#{}({}) started", id, peer)
                        }
                        Ok(Admission::Rejected) => info!("Hub: {} rejected", peer),
                        Err(e) => error!("Hub: cannot start session for {}: {}", peer, e),
                    }
                }
                Accepted::Drained => return Ok(false),
                Accepted::Transient => return Ok(true),
            }
        }
    }

    /// Stop listening. The listener is closed when the server is dropped.
    pub fn stop_accepting(&mut self, server: &mut TcpServer) {
        server.deregister(&mut self.poll);
    }

    /// Stop and wait for all sessions, bounded by `timeout`. Returns the number
    /// of sessions left running.
    pub fn drain(&mut self, timeout: Duration) -> usize {
        self.registry.drain(timeout)
    }
}
