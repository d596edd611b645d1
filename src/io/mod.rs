pub mod serial_device;
pub mod tcp_server;

pub use serial_device::SerialDevice;
pub use tcp_server::{Accepted, TcpServer};
