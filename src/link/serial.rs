//! Abstract serial-port transport (§6 "Serial port").
//!
//! The link layer only needs four operations on the wire: set the baud
//! rate, drive a BREAK condition, write bytes, and read bytes with a
//! per-call timeout. Everything else (port enumeration, DTR/RTS lines,
//! flow control) is irrelevant to UPDI and is kept out of the trait.

use std::io;
use std::time::Duration;

/// Minimal transport a [`crate::link::Link`] drives.
///
/// A real target is a PC serial port with a resistor between TX and the
/// UPDI pin and TX tied to RX for half-duplex echo (§1); this trait lets
/// the link layer, and everything built on it, be exercised against a
/// scripted fake in tests.
pub trait SerialPort {
    /// Change the baud rate without reopening the port. UPDI fixes parity
    /// at even and framing at 8 data bits / 2 stop bits (§4.1); only the
    /// baud is ever changed after `open`.
    fn set_baud(&mut self, baud: u32) -> io::Result<()>;

    /// Hold the line low for `duration` to reset the UPDI PHY (§4.1).
    fn send_break(&mut self, duration: Duration) -> io::Result<()>;

    /// Write `bytes` to the wire.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout` for the
    /// first byte. Returns the number of bytes actually read; a return of
    /// 0 means the read timed out with nothing available.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// Real backend over the `serialport` crate.
pub struct SerialPortTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialPortTransport {
    /// Open `path` at `baud` with the framing UPDI requires: 8 data bits,
    /// even parity, 2 stop bits (§4.1, §6).
    pub fn open(path: &str, baud: u32, read_timeout: Duration) -> io::Result<Self> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::Even)
            .stop_bits(serialport::StopBits::Two)
            .timeout(read_timeout)
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Self { port })
    }
}

impl SerialPort for SerialPortTransport {
    fn set_baud(&mut self, baud: u32) -> io::Result<()> {
        self.port
            .set_baud_rate(baud)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn send_break(&mut self, duration: Duration) -> io::Result<()> {
        // `serialport` exposes a one-shot break; UPDI's BREAK is a held
        // low level for one inter-byte interval at 300 baud (~24ms), so we
        // approximate it with set_break/sleep/clear_break rather than the
        // crate's fixed-duration helper.
        self.port
            .set_break()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        std::thread::sleep(duration);
        self.port
            .clear_break()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.port.write_all(bytes)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        use std::io::Read;
        self.port
            .set_timeout(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }
}
