use log::{error, info, warn};
use std::io::{ErrorKind, Result};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};

use super::pump::{Direction, Pump, PumpEnd, StopFlag};
use crate::traits::SerialHandle;

/// One TCP client paired with the shared serial device. Runs a serial->tcp
/// and a tcp->serial pump concurrently and closes the connection once both
/// have ended.
pub struct RelaySession {
    id: u64,
    peer: SocketAddr,
    stop: StopFlag,

    // Kept to unblock the pumps from the outside.
    control: TcpStream,

    thread: JoinHandle<()>,
}

/// Everything the session thread owns.
struct Endpoints {
    tcp_rx: TcpStream,
    tcp_tx: TcpStream,
    serial_rx: Box<dyn SerialHandle>,
    serial_tx: Box<dyn SerialHandle>,
}

impl RelaySession {
    /// Spawn the session. Fails without side effects on the serial device if the
    /// handles cannot be cloned or the thread cannot be started.
    pub fn start(
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        serial: &dyn SerialHandle,
        chunk_size: usize,
    ) -> Result<Self> {
        let endpoints = Endpoints {
            tcp_rx: stream.try_clone()?,
            tcp_tx: stream.try_clone()?,
            serial_rx: serial.try_clone_handle()?,
            serial_tx: serial.try_clone_handle()?,
        };
        let stop = StopFlag::new();

        let session_stop = stop.clone();
        let thread = thread::Builder::new()
            .name(format!("session-{}", id))
            .spawn(move || run(id, peer, endpoints, session_stop, chunk_size))?;

        Ok(RelaySession {
            id,
            peer,
            stop,
            control: stream,
            thread,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Ask both pumps to end: raise the stop flag and shut the socket down so a
    /// blocked client read returns immediately.
    pub fn stop(&self) {
        self.stop.raise();
        shutdown(&self.control, self.id, self.peer);
    }

    /// Wait for the session thread. Only call once `is_finished()` or after
    /// `stop()`, the accept loop must never block here.
    pub fn join(self) {
        if self.thread.join().is_err() {
            error!("Session#{}({}): thread panicked", self.id, self.peer);
        }
    }
}

fn run(id: u64, peer: SocketAddr, endpoints: Endpoints, stop: StopFlag, chunk_size: usize) {
    println!("New connection from {}", peer.ip());
    info!("Session#{}({}): started", id, peer);

    let Endpoints {
        mut tcp_rx,
        mut tcp_tx,
        mut serial_rx,
        mut serial_tx,
    } = endpoints;

    let (to_tcp, to_serial) = thread::scope(|s| {
        let pump_stop = stop.clone();
        let serial_to_tcp = thread::Builder::new()
            .name(format!("session-{}-rx", id))
            .spawn_scoped(s, move || {
                let mut pump = Pump::new(Direction::SerialToTcp, chunk_size, pump_stop.clone());
                let result = pump.run(serial_rx.as_mut(), &mut tcp_tx);
                pump_stop.raise();
                (result, pump.relayed())
            });

        let serial_to_tcp = match serial_to_tcp {
            Ok(handle) => handle,
            Err(e) => {
                error!("Session#{}({}): cannot start pump: {}", id, peer, e);
                return (None, None);
            }
        };

        let mut pump = Pump::new(Direction::TcpToSerial, chunk_size, stop.clone());
        let result = pump.run(&mut tcp_rx, serial_tx.as_mut());
        stop.raise();
        let to_serial = Some((result, pump.relayed()));

        let to_tcp = match serial_to_tcp.join() {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                error!("Session#{}({}): pump {} panicked", id, peer, Direction::SerialToTcp);
                None
            }
        };

        (to_tcp, to_serial)
    });

    report(id, peer, Direction::SerialToTcp, to_tcp);
    report(id, peer, Direction::TcpToSerial, to_serial);

    shutdown(&tcp_rx, id, peer);
    drop(tcp_rx);

    println!("Connection from {} closed", peer.ip());
    info!("Session#{}({}): closed", id, peer);
}

fn report(id: u64, peer: SocketAddr, direction: Direction, outcome: Option<(Result<PumpEnd>, u64)>) {
    match outcome {
        Some((Ok(end), bytes)) => {
            info!("Session#{}({}): {} {:?}, {} bytes", id, peer, direction, end, bytes)
        }
        Some((Err(e), bytes)) => {
            info!("Session#{}({}): {} ended on {}, {} bytes", id, peer, direction, e, bytes)
        }
        None => {}
    }
}

fn shutdown(stream: &TcpStream, id: u64, peer: SocketAddr) {
    match stream.shutdown(Shutdown::Both) {
        Ok(()) => {}
        Err(ref e) if e.kind() == ErrorKind::NotConnected => {}
        Err(e) => warn!("Session#{}({}): Shutdown error: {}", id, peer, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::serial_double;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    const TICK: Duration = Duration::from_millis(20);

    /// Connected (bridge side, client side) TCP pair, bridge side configured like
    /// an accepted client.
    fn tcp_pair() -> (TcpStream, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (bridge_side, peer) = listener.accept().unwrap();
        bridge_side.set_read_timeout(Some(TICK)).unwrap();
        bridge_side.set_write_timeout(Some(TICK)).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        (bridge_side, peer, client)
    }

    fn wait_finished(session: &RelaySession) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if session.is_finished() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_relays_both_directions() {
        let (serial, mut wire) = serial_double(TICK);
        let (stream, peer, mut client) = tcp_pair();

        let session = RelaySession::start(1, stream, peer, &serial, 1).unwrap();
        assert_eq!(session.id(), 1);
        assert_eq!(session.peer(), peer);

        client.write_all(&[0x41, 0x42, 0x43]).unwrap();
        let mut buf = [0u8; 3];
        wire.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x41, 0x42, 0x43]);

        wire.write_all(&[0x52, 0x53]).unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x52, 0x53]);

        drop(client);
        assert!(wait_finished(&session), "session should end when client leaves");
        session.join();
    }

    #[test]
    fn test_client_close_keeps_serial_open() {
        let (serial, mut wire) = serial_double(TICK);
        let (stream, peer, client) = tcp_pair();

        let session = RelaySession::start(2, stream, peer, &serial, 64).unwrap();
        drop(client);
        assert!(wait_finished(&session));
        session.join();

        // The shared handle still works in both directions.
        let mut serial = serial;
        serial.write_all(b"still here").unwrap();
        let mut buf = [0u8; 10];
        wire.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"still here");

        wire.write_all(b"ok").unwrap();
        let mut buf = [0u8; 2];
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut got = 0;
        while got < 2 && Instant::now() < deadline {
            match serial.read(&mut buf[got..]) {
                Ok(n) => got += n,
                Err(_) => continue,
            }
        }
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn test_stop_unblocks_idle_session() {
        let (serial, _wire) = serial_double(TICK);
        let (stream, peer, mut client) = tcp_pair();

        let session = RelaySession::start(3, stream, peer, &serial, 64).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(!session.is_finished());

        session.stop();
        assert!(wait_finished(&session));
        session.join();

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0, "client should see EOF");
    }

    #[test]
    fn test_serial_failure_ends_session() {
        let (serial, wire) = serial_double(TICK);
        let (stream, peer, mut client) = tcp_pair();

        let session = RelaySession::start(4, stream, peer, &serial, 64).unwrap();
        // Device vanishes: the bridge-side read sees end-of-stream.
        drop(wire);
        assert!(wait_finished(&session));
        session.join();

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
