use std::io;
use std::net::SocketAddr;
use thiserror::Error;

pub const EXIT_OK: i32 = 0;
pub const EXIT_SERIAL: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_NETWORK: i32 = 3;
pub const EXIT_SERVE: i32 = 4;

/// Failures that end the process.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Error opening serial port {path}: {source}")]
    SerialOpen { path: String, source: io::Error },

    #[error("Error creating TCP socket on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("TCP listener failed: {0}")]
    Accept(#[source] io::Error),

    #[error("Event loop failed: {0}")]
    Poll(#[source] io::Error),
}

impl BridgeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::SerialOpen { .. } => EXIT_SERIAL,
            BridgeError::Bind { .. } => EXIT_NETWORK,
            BridgeError::Accept(_) | BridgeError::Poll(_) => EXIT_SERVE,
        }
    }
}
