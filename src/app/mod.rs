//! The UPDI application layer (§4.3): SIB read, signature read, entry and
//! exit from programming mode, and the locked-device key flows. This is
//! the layer that turns the raw opcodes of [`crate::phy`] into the
//! specific byte-exact handshake sequences the UPDI PHY requires.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use crate::device::DeviceDescriptor;
use crate::phy::{AddressSize, DataSize, PhyError, Physical};

/// UPDI control/status register addresses, the 4-bit operand of
/// `LDCS`/`STCS`.
pub mod cs {
    pub const STATUSA: u8 = 0x00;
    pub const STATUSB: u8 = 0x01;
    pub const CTRLA: u8 = 0x02;
    pub const CTRLB: u8 = 0x03;
    pub const ASI_KEY_STATUS: u8 = 0x07;
    pub const ASI_RESET_REQ: u8 = 0x08;
    pub const ASI_CTRLA: u8 = 0x09;
    pub const ASI_SYS_CTRLA: u8 = 0x0A;
    pub const ASI_SYS_STATUS: u8 = 0x0B;
    pub const ASI_CRC_STATUS: u8 = 0x0C;
}

/// Bit positions within `CTRLA`.
pub mod ctrla_bits {
    /// Receive Start bit Disable: suppresses the target's ACK after each
    /// `ST`, traded off against losing per-byte feedback (§4.2).
    pub const RSD: u8 = 1 << 3;
}

/// Bit positions within `ASI_SYS_STATUS`.
mod sys_status {
    pub const LOCKSTATUS: u8 = 1 << 0;
    pub const UROWPROG: u8 = 1 << 2;
    pub const NVMPROG: u8 = 1 << 3;
}

/// `CTRLB.UPDIDIS`: disables the UPDI interface, releasing the pin.
const CTRLB_UPDIDIS: u8 = 1 << 2;

/// Values written to `ASI_RESET_REQ` to assert and release target reset.
const RESET_REQ_ASSERT: u8 = 0x59;
const RESET_REQ_RELEASE: u8 = 0x00;

/// The 8-byte ASCII activation keys (§4.3).
const KEY_NVMPROG: &[u8; 8] = b"NVMProg ";
const KEY_CHIPERASE: &[u8; 8] = b"NVMErase";
const KEY_UROW: &[u8; 8] = b"NVMUs&te";

/// How long to poll a status bit before declaring a handshake timeout.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// High-voltage UPDI activation mode (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HvMode {
    #[default]
    None,
    /// Tool cycles target power; HV pulse applied before the first SYNCH.
    ToolTogglePower,
    /// Host prompts the user to cycle power, then sends SYNCH.
    UserTogglePower,
    /// Host drives a brief HV pulse directly. Unsafe on non-HV-tolerant
    /// boards.
    SimpleUnsafePulse,
}

/// Errors raised at the application/handshake layer (part of
/// `ProtocolFault`, §7).
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Phy(#[from] PhyError),

    #[error("SIB reply was not valid ASCII")]
    SibUnparsable,

    #[error("SIB reply too short ({0} bytes)")]
    SibTooShort(usize),

    #[error("timed out waiting for {0}")]
    HandshakeTimeout(&'static str),
}

/// A parsed System Information Block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sib {
    pub family: String,
    /// NVM controller version, parsed from the SIB's version field; `0`,
    /// `2`, `3`, or `5` per §3.
    pub nvm_version: u8,
    pub raw: String,
}

/// Parse a SIB reply.
///
/// This crate's wire layout (there being no authoritative original source
/// to mirror byte-for-byte, see `SPEC_FULL.md` §I) is:
/// `<family, space-padded>:<nvm version digit>:<debug/OCD info...>`,
/// space-padded to the full 16- or 32-byte reply length. Any non-ASCII
/// byte is a garbled line and triggers re-init (§4.3).
pub fn parse_sib(bytes: &[u8]) -> Result<Sib, AppError> {
    if bytes.len() < 16 {
        return Err(AppError::SibTooShort(bytes.len()));
    }
    if !bytes.iter().all(|b| b.is_ascii() && !b.is_ascii_control() || *b == b' ') {
        return Err(AppError::SibUnparsable);
    }
    let raw = String::from_utf8(bytes.to_vec()).map_err(|_| AppError::SibUnparsable)?;
    let mut fields = raw.splitn(3, ':');
    let family = fields.next().ok_or(AppError::SibUnparsable)?.trim().to_string();
    let version_field = fields.next().ok_or(AppError::SibUnparsable)?.trim();
    let nvm_version = version_field
        .chars()
        .next()
        .and_then(|c| c.to_digit(10))
        .ok_or(AppError::SibUnparsable)? as u8;
    Ok(Sib {
        family,
        nvm_version,
        raw,
    })
}

/// The application layer: owns the [`Physical`] opcode interface.
pub struct App {
    phy: Physical,
}

impl App {
    pub fn new(phy: Physical) -> Self {
        Self { phy }
    }

    pub fn physical(&mut self) -> &mut Physical {
        &mut self.phy
    }

    pub fn into_physical(self) -> Physical {
        self.phy
    }

    /// Read the System Information Block (16 bytes, or 32 for the
    /// extended form).
    pub fn read_sib(&mut self, extended: bool) -> Result<Sib, AppError> {
        let len = if extended { 32 } else { 16 };
        let reply = self.phy.read_sib(len)?;
        parse_sib(&reply)
    }

    /// Read the three signature bytes from the device's signature row
    /// (§4.3, §8 property 7).
    pub fn read_device_id(&mut self, device: &DeviceDescriptor) -> Result<[u8; 3], AppError> {
        let addr_size = AddressSize::for_width(device.address_width);
        let bytes = self
            .phy
            .block_read(device.signature_address(), addr_size, 3, DataSize::One)?;
        Ok([bytes[0], bytes[1], bytes[2]])
    }

    /// Lower the target's inter-frame guard time early in programming mode
    /// (§4.1 "Guard time").
    pub fn set_guard_time(&mut self, gt: crate::link::GuardTime) -> Result<(), AppError> {
        self.phy.stcs(cs::ASI_CTRLA, gt.reg_value())?;
        self.phy.link().note_guard_time(gt);
        Ok(())
    }

    /// Assert, then release, target reset via `ASI_RESET_REQ`.
    fn pulse_reset(&mut self) -> Result<(), AppError> {
        self.phy.stcs(cs::ASI_RESET_REQ, RESET_REQ_ASSERT)?;
        self.phy.stcs(cs::ASI_RESET_REQ, RESET_REQ_RELEASE)?;
        Ok(())
    }

    fn poll_sys_status(&mut self, bit: u8, want_set: bool, what: &'static str) -> Result<(), AppError> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let status = self.phy.ldcs(cs::ASI_SYS_STATUS)?;
            let hit = (status & bit != 0) == want_set;
            if hit {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AppError::HandshakeTimeout(what));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Whether the device currently reports itself locked
    /// (`ASI_SYS_STATUS.LOCKSTATUS`).
    pub fn is_locked(&mut self) -> Result<bool, AppError> {
        let status = self.phy.ldcs(cs::ASI_SYS_STATUS)?;
        Ok(status & sys_status::LOCKSTATUS != 0)
    }

    /// Enter programming mode (§4.3): write the NVMPROG key, pulse reset,
    /// poll `ASI_SYS_STATUS.NVMPROG`.
    pub fn enter_programming_mode(&mut self) -> Result<(), AppError> {
        info!("entering programming mode");
        self.phy.key(KEY_NVMPROG)?;
        self.pulse_reset()?;
        self.poll_sys_status(sys_status::NVMPROG, true, "NVMPROG")?;
        self.set_guard_time(crate::link::GuardTime::Cycles16)?;
        debug!("programming mode active");
        Ok(())
    }

    /// Leave programming mode (§4.3): `CTRLB.UPDIDIS`, optionally
    /// preceded by a reset pulse.
    pub fn leave_programming_mode(&mut self, reset_first: bool) -> Result<(), AppError> {
        if reset_first {
            self.pulse_reset()?;
        }
        self.phy.stcs(cs::CTRLB, CTRLB_UPDIDIS)?;
        Ok(())
    }

    /// Chip-erase a locked device (§4.3, §8 scenario S4): send the
    /// CHIPERASE key, pulse reset, poll `LOCKSTATUS` until it clears. The
    /// device is unlocked and erased afterwards.
    pub fn chip_erase_locked(&mut self) -> Result<(), AppError> {
        info!("chip-erasing locked device");
        self.phy.key(KEY_CHIPERASE)?;
        self.pulse_reset()?;
        self.poll_sys_status(sys_status::LOCKSTATUS, false, "LOCKSTATUS clear")
    }

    /// Allow writing the user row on a locked device without a full chip
    /// erase (§4.3).
    pub fn activate_user_row_write(&mut self) -> Result<(), AppError> {
        self.phy.key(KEY_UROW)?;
        self.pulse_reset()?;
        self.poll_sys_status(sys_status::UROWPROG, true, "UROWPROG")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;
    use crate::link::tests::FakeSerialPort;
    use std::time::Duration as StdDuration;

    fn app_with(mut port: FakeSerialPort, replies: &[u8]) -> App {
        port.queue_reply(replies);
        let link = Link::new(Box::new(port), 115_200, StdDuration::from_millis(50));
        App::new(Physical::new(link))
    }

    #[test]
    fn parses_valid_sib() {
        let raw = format!("{:<8}:0:P:2      ", "megaAVR-0");
        let sib = parse_sib(raw.as_bytes()).unwrap();
        assert_eq!(sib.family, "megaAVR-0");
        assert_eq!(sib.nvm_version, 0);
    }

    #[test]
    fn rejects_non_ascii_sib() {
        let mut bytes = vec![0xFFu8; 16];
        bytes[0] = b'm';
        let err = parse_sib(&bytes).unwrap_err();
        assert!(matches!(err, AppError::SibUnparsable));
    }

    #[test]
    fn enter_programming_mode_polls_until_nvmprog_set() {
        // key() has no reply; pulse_reset() has no reply; ASI_SYS_STATUS
        // polls return NVMPROG=0 once then NVMPROG=1; guard-time STCS has
        // no reply.
        let replies = [0x00u8, sys_status::NVMPROG];
        let mut app = app_with(FakeSerialPort::new(), &replies);
        app.enter_programming_mode().unwrap();
    }

    #[test]
    fn chip_erase_locked_polls_until_lockstatus_clears() {
        let replies = [sys_status::LOCKSTATUS, 0x00u8];
        let mut app = app_with(FakeSerialPort::new(), &replies);
        app.chip_erase_locked().unwrap();
    }
}
