use log::info;
use mio_serial::{DataBits, FlowControl, SerialPort};
use std::io::{Error, ErrorKind, Read, Result, Write};
use std::time::Duration;

use crate::config::{ByteSize, Parity, SerialSettings, StopBits};
use crate::traits::SerialHandle;

/// Blocking handle onto the UART. The original is opened once per process; every
/// relay session works on clones of it.
pub struct SerialDevice {
    path: String,
    port: Box<dyn SerialPort>,
}

impl SerialDevice {
    /// Open the device with the given line settings. `timeout` bounds every
    /// blocking read and write so callers get a chance to check for shutdown.
    pub fn open(settings: &SerialSettings, timeout: Duration) -> Result<Self> {
        let data_bits = match settings.byte_size {
            ByteSize::Five => DataBits::Five,
            ByteSize::Six => DataBits::Six,
            ByteSize::Seven => DataBits::Seven,
            ByteSize::Eight => DataBits::Eight,
        };

        let parity = match settings.parity {
            Parity::None => mio_serial::Parity::None,
            Parity::Even => mio_serial::Parity::Even,
            Parity::Odd => mio_serial::Parity::Odd,
        };

        let stop_bits = match settings.stop_bits {
            StopBits::One => mio_serial::StopBits::One,
            StopBits::Two => mio_serial::StopBits::Two,
            StopBits::OnePointFive => {
                return Err(Error::new(
                    ErrorKind::Unsupported,
                    "1.5 stop bits are not supported by the serial backend",
                ));
            }
        };

        let flow_control = match (
            settings.hardware_flow_control,
            settings.software_flow_control,
        ) {
            (true, false) => FlowControl::Hardware,
            (false, true) => FlowControl::Software,
            (false, false) => FlowControl::None,
            (true, true) => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "hardware and software flow control are mutually exclusive",
                ));
            }
        };

        let port = mio_serial::new(settings.path.clone(), settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
            .timeout(timeout)
            .open()?;

        info!(
            "UART-Device: {} opened at {} {}{}{}",
            settings.path,
            settings.baud_rate,
            settings.byte_size,
            parity_letter(settings.parity),
            settings.stop_bits
        );

        Ok(SerialDevice {
            path: settings.path.clone(),
            port,
        })
    }
}

fn parity_letter(parity: Parity) -> char {
    match parity {
        Parity::None => 'N',
        Parity::Even => 'E',
        Parity::Odd => 'O',
    }
}

impl Read for SerialDevice {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialDevice {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.port.flush()
    }
}

impl SerialHandle for SerialDevice {
    fn try_clone_handle(&self) -> Result<Box<dyn SerialHandle>> {
        let port = self.port.try_clone()?;
        Ok(Box::new(SerialDevice {
            path: self.path.clone(),
            port,
        }))
    }

    fn addr_as_string(&self) -> String {
        self.path.clone()
    }

    // No tcdrain here: with flow control asserted it could block forever.
    fn close(self: Box<Self>) {
        info!("UART-Device: {} closed", self.path);
    }
}
