//! The UPDI link layer (§4.1): a half-duplex, single-wire, self-synchronising
//! UART variant with parity, echo suppression, a BREAK-based reset, and a
//! specific inter-frame timing model.
//!
//! Every byte this crate writes to the wire comes back as its own echo
//! (TX is tied to RX, §1) before any actual target reply can be read. The
//! [`Link`] hides that bookkeeping behind [`Link::transact`], which is the
//! only entry point [`crate::phy`] uses to talk to the target.

mod serial;

pub use serial::{SerialPort, SerialPortTransport};

use std::io;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Synchronisation character; must be the first byte read after a BREAK.
pub const SYNCH: u8 = 0x55;

/// Baud rate a BREAK is transmitted at (one bit cell ≈ 1/300s).
pub const BREAK_BAUD: u32 = 300;

/// Duration of the BREAK condition: one inter-byte interval at 300 baud.
pub const BREAK_DURATION: Duration = Duration::from_millis(24);

/// Default programming baud rate.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default per-byte read timeout (§4.1 "Response window").
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// UPDI inter-frame guard-time setting, written to `ASI_CTRLA` during the
/// handshake (§4.1 "Guard time"). Values are cycle counts; lower values
/// increase throughput. The target resets to `Cycles128` and programming
/// mode lowers it early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardTime {
    Cycles128,
    Cycles64,
    Cycles32,
    Cycles16,
    Cycles8,
    Cycles4,
    Cycles2,
}

impl GuardTime {
    /// Register value written to `ASI_CTRLA` bits [2:0].
    pub fn reg_value(self) -> u8 {
        match self {
            GuardTime::Cycles128 => 0,
            GuardTime::Cycles64 => 1,
            GuardTime::Cycles32 => 2,
            GuardTime::Cycles16 => 3,
            GuardTime::Cycles8 => 4,
            GuardTime::Cycles4 => 5,
            GuardTime::Cycles2 => 6,
        }
    }
}

/// Which way the wire was last driven; tracked so a caller can assert the
/// echo-before-reply invariant (§3 "Link state") holds across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToTarget,
    FromTarget,
}

/// Errors raised by the link layer (the `LinkFault` kinds of §7).
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("parity error on the wire")]
    Parity,

    #[error("echo mismatch: sent {sent:#04x}, read back {read:#04x}")]
    EchoMismatch { sent: u8, read: u8 },

    #[error("timed out waiting for a reply")]
    ReadTimeout,

    #[error("BREAK recovery failed")]
    BreakRecoveryFailed,

    #[error("serial port I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The UPDI link: owns the serial transport and the handshake/echo state.
pub struct Link {
    port: Box<dyn SerialPort>,
    baud: u32,
    read_timeout: Duration,
    guard_time: GuardTime,
    last_direction: Option<Direction>,
}

impl Link {
    pub fn new(port: Box<dyn SerialPort>, baud: u32, read_timeout: Duration) -> Self {
        Self {
            port,
            baud,
            read_timeout,
            guard_time: GuardTime::Cycles128,
            last_direction: None,
        }
    }

    pub fn guard_time(&self) -> GuardTime {
        self.guard_time
    }

    /// Record a new guard-time setting after the caller has written it to
    /// `ASI_CTRLA` via `phy::stcs`. The link does not issue the write
    /// itself — that is a physical-layer opcode — it only tracks what was
    /// last configured so future timing decisions can use it.
    pub fn note_guard_time(&mut self, gt: GuardTime) {
        self.guard_time = gt;
    }

    /// BREAK + SYNCH: reset the UPDI PHY and re-establish byte sync
    /// (§4.1 "Initialisation / BREAK"). Must be called before the first
    /// transaction of a session and after any unrecoverable link fault.
    pub fn init(&mut self) -> Result<(), LinkError> {
        debug!("sending BREAK to reset UPDI PHY");
        self.port.set_baud(BREAK_BAUD)?;
        self.port.send_break(BREAK_DURATION)?;

        self.port.set_baud(self.baud)?;
        self.echo_send(&[SYNCH])?;
        self.guard_time = GuardTime::Cycles128;
        Ok(())
    }

    /// Change the programming baud rate. Only valid once the link has been
    /// initialised; does not itself re-synchronise.
    pub fn set_baud(&mut self, baud: u32) -> Result<(), LinkError> {
        self.port.set_baud(baud)?;
        self.baud = baud;
        Ok(())
    }

    /// Write `bytes`, then read back and discard exactly `bytes.len()`
    /// echo bytes, failing on the first mismatch (§8 property 1, "echo
    /// symmetry").
    fn echo_send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.port.write(bytes)?;
        self.last_direction = Some(Direction::ToTarget);
        for &sent in bytes {
            let mut buf = [0u8; 1];
            let n = self.port.read(&mut buf, self.read_timeout)?;
            if n == 0 {
                return Err(LinkError::ReadTimeout);
            }
            if buf[0] != sent {
                return Err(LinkError::EchoMismatch {
                    sent,
                    read: buf[0],
                });
            }
        }
        Ok(())
    }

    /// Read `n` raw bytes (a target reply, with echoes already consumed).
    fn recv(&mut self, n: usize) -> Result<Vec<u8>, LinkError> {
        let mut out = vec![0u8; n];
        let mut got = 0;
        while got < n {
            let m = self.port.read(&mut out[got..], self.read_timeout)?;
            if m == 0 {
                return Err(LinkError::ReadTimeout);
            }
            got += m;
        }
        self.last_direction = Some(Direction::FromTarget);
        Ok(out)
    }

    /// Send `tx` (consuming its echo) and read back `reply_len` bytes of
    /// target reply. This is the single choke point every physical opcode
    /// goes through, so the one-automatic-retry policy of §7 lives here:
    /// a link fault triggers exactly one BREAK-and-resync before surfacing
    /// to the caller.
    pub fn transact(&mut self, tx: &[u8], reply_len: usize) -> Result<Vec<u8>, LinkError> {
        match self.try_transact(tx, reply_len) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!(error = %e, "link fault, retrying after BREAK");
                self.init().map_err(|_| LinkError::BreakRecoveryFailed)?;
                self.try_transact(tx, reply_len)
            }
        }
    }

    fn try_transact(&mut self, tx: &[u8], reply_len: usize) -> Result<Vec<u8>, LinkError> {
        self.echo_send(tx)?;
        if reply_len == 0 {
            return Ok(Vec::new());
        }
        self.recv(reply_len)
    }

    /// Send `tx` with no reply expected (e.g. `STCS`, `ST`).
    pub fn send_no_reply(&mut self, tx: &[u8]) -> Result<(), LinkError> {
        match self.echo_send(tx) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "link fault, retrying after BREAK");
                self.init().map_err(|_| LinkError::BreakRecoveryFailed)?;
                self.echo_send(tx)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Hand-rolled fake transport (same pattern as the pack's `MockDevice`
    /// for `MmioBus`): every `write` auto-generates its own echo (TX tied
    /// to RX, §1), and a separately queued `replies` buffer stands in for
    /// whatever the target sends back once its echo has been consumed.
    #[derive(Default)]
    pub(crate) struct FakeSerialPort {
        pub baud_history: Vec<u32>,
        pub breaks: usize,
        pub written: Vec<u8>,
        pending_echoes: VecDeque<u8>,
        replies: VecDeque<u8>,
        /// If set, the echo of the byte at this absolute write index comes
        /// back corrupted, simulating a desynced line.
        pub corrupt_echo_at: Option<usize>,
        write_count: usize,
    }

    impl FakeSerialPort {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue bytes the target will reply with once its echo has been
        /// read back (i.e. `recv`, not `echo_send`, consumes these).
        pub fn queue_reply(&mut self, bytes: &[u8]) {
            self.replies.extend(bytes.iter().copied());
        }
    }

    impl SerialPort for FakeSerialPort {
        fn set_baud(&mut self, baud: u32) -> io::Result<()> {
            self.baud_history.push(baud);
            Ok(())
        }

        fn send_break(&mut self, _duration: Duration) -> io::Result<()> {
            self.breaks += 1;
            Ok(())
        }

        fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
            for &b in bytes {
                self.written.push(b);
                let echoed = if self.corrupt_echo_at == Some(self.write_count) {
                    b.wrapping_add(1)
                } else {
                    b
                };
                self.pending_echoes.push_back(echoed);
                self.write_count += 1;
            }
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            let mut n = 0;
            while n < buf.len() {
                let next = self.pending_echoes.pop_front().or_else(|| self.replies.pop_front());
                match next {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    /// Shared handle so a test can keep inspecting the fake after handing
    /// ownership of a `SerialPort` trait object to a `Link`.
    #[derive(Clone, Default)]
    struct SharedFake(Rc<RefCell<FakeSerialPort>>);

    impl SerialPort for SharedFake {
        fn set_baud(&mut self, baud: u32) -> io::Result<()> {
            self.0.borrow_mut().set_baud(baud)
        }
        fn send_break(&mut self, duration: Duration) -> io::Result<()> {
            self.0.borrow_mut().send_break(duration)
        }
        fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.0.borrow_mut().write(bytes)
        }
        fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            self.0.borrow_mut().read(buf, timeout)
        }
    }

    fn link_with(port: FakeSerialPort) -> Link {
        Link::new(Box::new(port), DEFAULT_BAUD, Duration::from_millis(50))
    }

    #[test]
    fn init_sends_break_then_synch() {
        let shared = SharedFake::default();
        let mut link = Link::new(Box::new(shared.clone()), DEFAULT_BAUD, Duration::from_millis(50));
        link.init().unwrap();
        assert_eq!(shared.0.borrow().breaks, 1);
        assert_eq!(shared.0.borrow().written, vec![SYNCH]);
        assert_eq!(link.guard_time(), GuardTime::Cycles128);
    }

    #[test]
    fn echo_mismatch_is_reported() {
        let mut port = FakeSerialPort::new();
        port.corrupt_echo_at = Some(0);
        let mut link = link_with(port);
        let err = link.send_no_reply(&[0x12]).unwrap_err();
        assert!(matches!(err, LinkError::EchoMismatch { .. }));
    }

    #[test]
    fn transact_reads_reply_after_echo() {
        let mut port = FakeSerialPort::new();
        port.queue_reply(&[0xAA, 0xBB]);
        let mut link = link_with(port);
        let reply = link.transact(&[0x80], 2).unwrap();
        assert_eq!(reply, vec![0xAA, 0xBB]);
    }

    #[test]
    fn no_reply_within_timeout_is_a_fault() {
        let port = FakeSerialPort::new();
        let mut link = link_with(port);
        let err = link.transact(&[0x80], 1).unwrap_err();
        // one failed attempt, one BREAK-and-retry, still no reply queued
        assert!(matches!(err, LinkError::ReadTimeout));
    }
}
