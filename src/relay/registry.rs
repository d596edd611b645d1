use log::{info, warn};
use std::collections::HashMap;
use std::io::Result;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use super::session::RelaySession;
use crate::traits::SerialHandle;

/// What happened to a freshly accepted client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started(u64),
    Rejected,
}

/// Owns every live relay session so they can be reaped, counted, and drained.
pub struct SessionRegistry {
    sessions: HashMap<u64, RelaySession>,
    next_id: u64,

    // 0 = unlimited. Several sessions share the serial device unarbitrated.
    max_clients: usize,
}

impl SessionRegistry {
    pub fn new(max_clients: usize) -> Self {
        SessionRegistry {
            sessions: HashMap::new(),
            next_id: 1,
            max_clients,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn at_capacity(&self) -> bool {
        self.max_clients > 0 && self.sessions.len() >= self.max_clients
    }

    /// Start a session for `stream`, or close it right away if the client
    /// limit is reached. Never waits on other sessions.
    pub fn admit(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        serial: &dyn SerialHandle,
        chunk_size: usize,
    ) -> Result<Admission> {
        self.reap();

        if self.at_capacity() {
            warn!(
                "Registry: rejecting {}, {} of {} clients connected",
                peer,
                self.sessions.len(),
                self.max_clients
            );
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(Admission::Rejected);
        }

        let id = self.next_id;
        self.next_id += 1;

        let session = RelaySession::start(id, stream, peer, serial, chunk_size)?;
        if !self.sessions.is_empty() {
            warn!(
                "Registry: {} sessions now share the serial device without arbitration",
                self.sessions.len() + 1
            );
        }
        self.sessions.insert(id, session);

        Ok(Admission::Started(id))
    }

    /// Join and forget sessions whose thread has ended. Returns how many.
    pub fn reap(&mut self) -> usize {
        let finished: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_finished())
            .map(|(&id, _)| id)
            .collect();

        for id in &finished {
            if let Some(session) = self.sessions.remove(id) {
                info!("Registry: Session#{}({}) removed", session.id(), session.peer());
                session.join();
            }
        }

        finished.len()
    }

    /// Stop every session and wait up to `timeout` for them to end. Sessions
    /// still running at the deadline are detached; returns how many.
    pub fn drain(&mut self, timeout: Duration) -> usize {
        if self.is_empty() {
            return 0;
        }

        info!("Registry: draining {} sessions", self.sessions.len());
        for session in self.sessions.values() {
            session.stop();
        }

        let deadline = Instant::now() + timeout;
        while !self.sessions.is_empty() && Instant::now() < deadline {
            self.reap();
            std::thread::sleep(Duration::from_millis(10));
        }
        self.reap();

        let abandoned = self.sessions.len();
        for (id, session) in self.sessions.drain() {
            warn!(
                "Registry: Session#{}({}) did not stop within {:?}, abandoning",
                id,
                session.peer(),
                timeout
            );
        }

        abandoned
    }
}
