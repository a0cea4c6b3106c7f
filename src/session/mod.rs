//! Session orchestration (§4.5): the public surface of this crate.
//!
//! A [`Session`] owns the one [`App`] handle for its lifetime (§5: "the
//! link is mutable; only the session, through the NVM driver, may mutate
//! it") and is the sole place the locked-device and signature-gating rules
//! of §7/§8 are enforced, since every other layer below it is a dumb
//! transport for opcodes.

use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, info_span, warn};

use crate::app::{App, AppError, HvMode, Sib};
use crate::device::{get_device, DeviceDescriptor, DeviceError, RegionKind};
use crate::hex;
use crate::link::{Link, SerialPort};
use crate::nvm::{NvmDriver, NvmError, NvmVersion};

/// Explicit configuration record (§9 "Dynamic argument shapes", `SPEC_FULL.md` §D).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub region: Option<RegionKind>,
    pub offset: u32,
    /// `None` defaults to the target region's full size at the call site.
    pub length: Option<u32>,
    pub verify: bool,
    pub erase: bool,
    pub hv_mode: HvMode,
    pub locked_user_row: bool,
    pub locked_chip_erase: bool,
    /// Whether `write_from_segments` aborts on the first `VerifyMismatch`
    /// rather than continuing through the remaining segments (§7).
    pub fail_fast: bool,
    pub baud: u32,
    pub read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            region: None,
            offset: 0,
            length: None,
            verify: false,
            erase: false,
            hv_mode: HvMode::None,
            locked_user_row: false,
            locked_chip_erase: false,
            fail_fast: false,
            baud: crate::link::DEFAULT_BAUD,
            read_timeout: crate::link::DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Top-level error type the public API returns (§7).
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    App(#[from] AppError),

    #[error(transparent)]
    Nvm(#[from] NvmError),

    #[error(transparent)]
    Hex(#[from] hex::HexError),

    #[error("device signature does not match descriptor")]
    DeviceIdMismatch,

    #[error("device is locked; use chip_erase_locked or user_row_locked_write")]
    Locked,

    #[error("verify mismatch at address {address:#x}")]
    VerifyMismatch { address: u32 },

    #[error("tool error: {0}")]
    ToolError(String),
}

/// Prefer the live SIB's NVM version over the static descriptor table
/// (§4.3 "select the NVM variant in §4.4"), falling back to the
/// descriptor if the SIB reports a digit this crate doesn't recognise.
fn nvm_driver_for(sib: &Sib, device: &DeviceDescriptor) -> NvmDriver {
    match NvmVersion::from_digit(sib.nvm_version) {
        Some(version) => {
            if version != device.nvm_version {
                warn!(
                    sib_version = sib.nvm_version,
                    descriptor_version = ?device.nvm_version,
                    "SIB NVM version disagrees with device descriptor; trusting the live SIB"
                );
            }
            NvmDriver::for_version(version, device.address_width)
        }
        None => {
            warn!(
                sib_version = sib.nvm_version,
                "unrecognised SIB NVM version digit; falling back to device descriptor"
            );
            NvmDriver::new(device)
        }
    }
}

/// The public session surface (§4.5).
pub struct Session {
    device: DeviceDescriptor,
    app: App,
    nvm: NvmDriver,
    locked: bool,
}

impl Session {
    /// Bind to `device_name`, open `transport`, and enter programming mode
    /// (§4.5 `start_session`).
    ///
    /// High-voltage activation (`config.hv_mode`) is recorded for
    /// diagnostics; driving the electrical HV pulse itself needs transport
    /// control lines this crate's [`SerialPort`] trait does not expose
    /// (§6 only specifies `open`/`set_baud`/`send_break`/`write`/`read`), so
    /// non-`None` modes are logged but otherwise a no-op here.
    pub fn start_session(
        device_name: &str,
        transport: Box<dyn SerialPort>,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let device = get_device(device_name)?;
        let span = info_span!("updi_session", device = %device.name);
        let _enter = span.enter();

        if config.hv_mode != HvMode::None {
            info!(hv_mode = ?config.hv_mode, "high-voltage activation requested");
        }

        let mut link = Link::new(transport, config.baud, config.read_timeout);
        link.init()?;
        let mut app = App::new(crate::phy::Physical::new(link));

        let sib = match app.read_sib(false) {
            Ok(sib) => sib,
            Err(AppError::SibUnparsable) | Err(AppError::SibTooShort(_)) => {
                // Link::transact has already retried this exchange once via
                // its own BREAK-and-reinit fault path (§7); a still-garbled
                // SIB at this point reads as a locked device refusing to
                // talk back, not a link fault (§9).
                return Err(SessionError::Locked);
            }
            Err(e) => return Err(e.into()),
        };
        info!(family = %sib.family, sib_nvm_version = sib.nvm_version, "read SIB");
        let nvm = nvm_driver_for(&sib, &device);

        app.enter_programming_mode()?;
        let locked = app.is_locked()?;
        if locked {
            info!("device reports locked");
        }

        Ok(Self {
            device,
            app,
            nvm,
            locked,
        })
    }

    /// Read the three signature bytes and compare against the descriptor
    /// (§4.5 `ping`, §8 property 7).
    pub fn ping(&mut self) -> Result<[u8; 3], SessionError> {
        let id = self.app.read_device_id(&self.device)?;
        if id != self.device.signature {
            return Err(SessionError::DeviceIdMismatch);
        }
        Ok(id)
    }

    fn ensure_signature(&mut self) -> Result<(), SessionError> {
        self.ping().map(|_| ())
    }

    fn ensure_unlocked(&self) -> Result<(), SessionError> {
        if self.locked {
            return Err(SessionError::Locked);
        }
        Ok(())
    }

    /// Erase the whole device, or one region if it supports page erase
    /// (§4.5 `erase`).
    pub fn erase(&mut self, region: Option<RegionKind>) -> Result<(), SessionError> {
        self.ensure_unlocked()?;
        match region {
            None => {
                info!("chip erase");
                self.nvm.chip_erase(&mut self.app)?;
            }
            Some(kind) => {
                let region = self.device.require_region(kind)?;
                self.nvm.erase_region(region, &mut self.app)?;
            }
        }
        Ok(())
    }

    /// Write `data` at `offset` within `region` (§4.5 `write`).
    pub fn write(&mut self, region: RegionKind, offset: u32, data: &[u8]) -> Result<(), SessionError> {
        self.ensure_unlocked()?;
        self.ensure_signature()?;
        let region = self.device.require_region(region)?.clone();
        self.nvm.write_region(&region, offset, data, &mut self.app)?;
        Ok(())
    }

    /// Read `n` bytes from `region` at `offset` (§4.5 `read`). Not gated by
    /// the locked-device rule — only mutating operations are (§8 property 6).
    pub fn read(&mut self, region: RegionKind, offset: u32, n: usize) -> Result<Vec<u8>, SessionError> {
        let region = self.device.require_region(region)?.clone();
        let data = self.nvm.read_region(&region, offset, n, &mut self.app)?;
        Ok(data)
    }

    /// Read back `data.len()` bytes and compare byte-exact (§4.5 `verify`,
    /// §8 property 2).
    pub fn verify(&mut self, region: RegionKind, offset: u32, data: &[u8]) -> Result<(), SessionError> {
        let readback = self.read(region, offset, data.len())?;
        let region_base = self.device.require_region(region)?.base;
        for (i, (&expected, &got)) in data.iter().zip(readback.iter()).enumerate() {
            if expected != got {
                return Err(SessionError::VerifyMismatch {
                    address: region_base + offset + i as u32,
                });
            }
        }
        Ok(())
    }

    /// Chip-erase a locked device (§4.5, §8 scenario S4). Bypasses the
    /// locked-device gate by construction — this *is* one of the two
    /// flows §8 property 6 allows.
    pub fn chip_erase_locked(&mut self) -> Result<(), SessionError> {
        self.app.chip_erase_locked()?;
        self.locked = false;
        self.nvm.chip_erase(&mut self.app)?;
        Ok(())
    }

    /// Write the user row on a locked device without a full chip erase
    /// (§4.5, §8 property 6's other allowed flow).
    pub fn user_row_locked_write(&mut self, offset: u32, data: &[u8]) -> Result<(), SessionError> {
        self.app.activate_user_row_write()?;
        let region = self.device.require_region(RegionKind::UserRow)?.clone();
        self.nvm.write_region(&region, offset, data, &mut self.app)?;
        Ok(())
    }

    /// Route each HEX segment to its region (§6 AVR-HEX convention) and
    /// write it, optionally chip-erasing first and verifying each segment
    /// afterwards (§4.5 `write_from_segments`).
    ///
    /// A `VerifyMismatch` does not abort the remaining segments unless
    /// `fail_fast` is set (§7); in either case the first mismatch
    /// encountered is what's returned.
    pub fn write_from_segments(
        &mut self,
        segments: &[(u32, Vec<u8>)],
        erase: bool,
        verify: bool,
        fail_fast: bool,
    ) -> Result<(), SessionError> {
        self.ensure_unlocked()?;
        self.ensure_signature()?;

        let mut routed: Vec<(RegionKind, u32, Vec<u8>)> = segments
            .iter()
            .map(|(addr, data)| {
                let (kind, offset) = hex::route(*addr)?;
                Ok::<_, SessionError>((kind, offset, data.clone()))
            })
            .collect::<Result<_, _>>()?;
        routed.sort_by_key(|(_, offset, _)| *offset);

        if erase {
            self.nvm.chip_erase(&mut self.app)?;
        }

        let mut first_mismatch: Option<SessionError> = None;
        for (kind, offset, data) in &routed {
            let region = self.device.require_region(*kind)?.clone();
            self.nvm.write_region(&region, *offset, data, &mut self.app)?;
            if verify {
                if let Err(e) = self.verify(*kind, *offset, data) {
                    error!(region = ?kind, offset = format!("{offset:#x}"), "verify mismatch");
                    if fail_fast {
                        return Err(e);
                    }
                    if first_mismatch.is_none() {
                        first_mismatch = Some(e);
                    }
                }
            }
        }
        match first_mismatch {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Leave programming mode (§4.5 `end_session`, last step of "order of
    /// operations for a full hex program").
    pub fn end_session(&mut self, reset_first: bool) -> Result<(), SessionError> {
        self.app.leave_programming_mode(reset_first)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests::FakeSerialPort;
    use crate::phy::ACK;

    /// A syntactically valid 16-byte SIB: family `megaAVR-0`, NVM version 0.
    const VALID_SIB: &[u8; 16] = b"megaAVR-0:0:PG1 ";

    fn session_with(device: &str, trailing_replies: &[u8]) -> Session {
        let mut replies = VALID_SIB.to_vec();
        replies.extend_from_slice(trailing_replies);
        let mut port = FakeSerialPort::new();
        port.queue_reply(&replies);
        let config = SessionConfig::default();
        // start_session drives: read_sib (16-byte reply), key (no reply),
        // pulse_reset (no reply), poll NVMPROG (1 reply), guard time STCS
        // (no reply), is_locked LDCS (1 reply), then whatever the caller
        // appends for the operation under test.
        Session::start_session(device, Box::new(port), &config)
            .unwrap_or_else(|e| panic!("start_session failed: {e}"))
    }

    #[test]
    fn start_session_enters_programming_mode_and_reads_lock_state() {
        let session = session_with("atmega4809", &[sys_status_nvmprog(), 0x00]);
        assert!(!session.locked);
    }

    #[test]
    fn start_session_classifies_unreadable_sib_as_locked() {
        let mut port = FakeSerialPort::new();
        port.queue_reply(&[0xFFu8; 16]); // non-ASCII SIB reply
        let config = SessionConfig::default();
        let err = Session::start_session("atmega4809", Box::new(port), &config).unwrap_err();
        assert!(matches!(err, SessionError::Locked));
    }

    fn sys_status_nvmprog() -> u8 {
        1 << 3
    }

    #[test]
    fn ping_matches_signature() {
        let mut replies = vec![sys_status_nvmprog(), 0x00]; // enter_programming_mode + is_locked
        replies.push(ACK); // ping's block_read ST_PTR
        replies.extend_from_slice(&[0x1E, 0x96, 0x51]);
        let mut session = session_with("atmega4809", &replies);
        let id = session.ping().unwrap();
        assert_eq!(id, [0x1E, 0x96, 0x51]);
    }

    #[test]
    fn ping_mismatch_is_device_id_mismatch() {
        let mut replies = vec![sys_status_nvmprog(), 0x00];
        replies.push(ACK);
        replies.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
        let mut session = session_with("atmega4809", &replies);
        let err = session.ping().unwrap_err();
        assert!(matches!(err, SessionError::DeviceIdMismatch));
    }

    #[test]
    fn locked_device_rejects_plain_write() {
        let replies = vec![sys_status_nvmprog(), sys_status_lockstatus()];
        let mut session = session_with("atmega4809", &replies);
        let err = session.write(RegionKind::Flash, 0, &[0xAA, 0xBB]).unwrap_err();
        assert!(matches!(err, SessionError::Locked));
    }

    fn sys_status_lockstatus() -> u8 {
        1 << 0
    }

    #[test]
    fn write_from_segments_programs_and_verifies_a_fuse_byte() {
        // atmega4809 fuses take the per-byte WRITE_FUSE path (v0), the
        // cheapest NVM sequence to script: STS(addr,val) 2 acks,
        // write_command STS 2 acks, poll_busy 1 ready.
        let mut replies = vec![sys_status_nvmprog(), 0x00]; // start_session
        replies.extend_from_slice(&[ACK, 0x1E, 0x96, 0x51]); // ensure_signature's ping
        replies.extend_from_slice(&[ACK, ACK, ACK, ACK, 0x00]); // write_fuses_per_byte
        replies.extend_from_slice(&[ACK, 0xE0]); // verify's block_read (1 byte, matches)
        let mut session = session_with("atmega4809", &replies);
        session
            .write_from_segments(&[(0x820000, vec![0xE0])], false, true, true)
            .unwrap();
    }

    #[test]
    fn write_from_segments_fail_fast_aborts_on_first_mismatch() {
        let mut replies = vec![sys_status_nvmprog(), 0x00];
        replies.extend_from_slice(&[ACK, 0x1E, 0x96, 0x51]);
        replies.extend_from_slice(&[ACK, ACK, ACK, ACK, 0x00]); // segment 1's write
        replies.extend_from_slice(&[ACK, 0xFF]); // verify read-back: wrong byte
        // No replies queued for a second segment: if fail_fast did not
        // abort immediately, the next wire read would time out instead of
        // surfacing VerifyMismatch, and this assertion would catch it.
        let mut session = session_with("atmega4809", &replies);
        let err = session
            .write_from_segments(
                &[(0x820000, vec![0xE0]), (0x820001, vec![0x01])],
                false,
                true,
                true,
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::VerifyMismatch { address: 0x1280 }));
    }

    #[test]
    fn write_from_segments_without_fail_fast_continues_past_a_mismatch() {
        let mut replies = vec![sys_status_nvmprog(), 0x00];
        replies.extend_from_slice(&[ACK, 0x1E, 0x96, 0x51]);
        replies.extend_from_slice(&[ACK, ACK, ACK, ACK, 0x00]); // segment 1's write
        replies.extend_from_slice(&[ACK, 0xFF]); // verify read-back: wrong byte
        replies.extend_from_slice(&[ACK, ACK, ACK, ACK, 0x00]); // segment 2's write
        replies.extend_from_slice(&[ACK, 0x01]); // verify read-back: correct byte
        let mut session = session_with("atmega4809", &replies);
        let err = session
            .write_from_segments(
                &[(0x820000, vec![0xE0]), (0x820001, vec![0x01])],
                false,
                true,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::VerifyMismatch { address: 0x1280 }));
    }
}
