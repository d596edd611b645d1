use log::{info, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::hub::{IoHub, ServeExit, ShutdownHandle};
use crate::io::{SerialDevice, TcpServer};
use crate::traits::SerialHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    SerialOpen,
    Listening,
    Serving,
    Draining,
    Closed,
}

/// Process-wide lifecycle: open the device, listen, serve, drain, close.
pub struct Bridge {
    config: BridgeConfig,
    state: LifecycleState,
    hub: IoHub,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        let hub = IoHub::new(config.chunk_size, config.poll_interval, config.max_clients)
            .map_err(BridgeError::Poll)?;

        Ok(Bridge {
            config,
            state: LifecycleState::Uninitialized,
            hub,
        })
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.hub.shutdown_handle()
    }

    fn transition(&mut self, next: LifecycleState) {
        info!("Bridge: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Open the configured serial device and run until shutdown.
    pub fn run(&mut self) -> Result<ServeExit, BridgeError> {
        let serial = match SerialDevice::open(&self.config.serial, self.config.poll_interval) {
            Ok(serial) => serial,
            Err(source) => {
                self.transition(LifecycleState::Closed);
                return Err(BridgeError::SerialOpen {
                    path: self.config.serial.path.clone(),
                    source,
                });
            }
        };

        self.run_with(Box::new(serial))
    }

    /// Run with an already opened serial handle. The handle is closed before
    /// returning, whatever the outcome.
    pub fn run_with(&mut self, serial: Box<dyn SerialHandle>) -> Result<ServeExit, BridgeError> {
        self.transition(LifecycleState::SerialOpen);

        let addr = self.config.bind_addr();
        let mut server = match TcpServer::new(addr) {
            Ok(server) => server,
            Err(source) => {
                serial.close();
                self.transition(LifecycleState::Closed);
                return Err(BridgeError::Bind { addr, source });
            }
        };
        self.transition(LifecycleState::Listening);
        info!(
            "Bridge: relaying {} <-> {}",
            serial.addr_as_string(),
            server.local_addr()
        );

        self.transition(LifecycleState::Serving);
        let result = self.hub.serve(&mut server, serial.as_ref());

        self.transition(LifecycleState::Draining);
        if let Ok(ServeExit::Signal(_)) = result {
            println!("Exiting...");
        }

        self.hub.stop_accepting(&mut server);
        drop(server);

        info!("Bridge: draining {} sessions", self.hub.active_sessions());
        let abandoned = self.hub.drain(self.config.drain_timeout);
        if abandoned > 0 {
            warn!("Bridge: {} sessions abandoned at shutdown", abandoned);
        }

        serial.close();
        self.transition(LifecycleState::Closed);

        result
    }
}
