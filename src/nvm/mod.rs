//! The NVM controller driver (§4.4): family-specific sequences that differ
//! in NVM controller version, in the opcodes they accept, in how page
//! buffers are filled and committed, and in whether EEPROM/user-row need
//! separate erase-write cycles or page-buffer-erase.
//!
//! Per the Design Notes (§9), family dispatch is a tagged variant keyed on
//! `(family, nvm_version)` — concretely, [`NvmVersion`] selects a
//! [`CommandTable`] and a small set of behavioural flags. There is no class
//! hierarchy; every version shares the state machine sketched in §4.4:
//!
//! ```text
//! idle ──write──▶ page_buffer_fill ──commit──▶ busy ──ready──▶ idle
//!       ──erase─▶ busy ──ready──▶ idle
//! ```

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use crate::app::{App, AppError};
use crate::device::{DeviceDescriptor, MemoryRegion, RegionKind};
use crate::phy::{AddressSize, DataSize, PhyError};

/// Address of the NVM controller's command register, `NVMCTRL.CTRLA`.
/// Controller registers live in the low, 16-bit-addressable data space
/// regardless of the device's flash address width.
const NVMCTRL_CTRLA: u32 = 0x1000;
/// Address of `NVMCTRL.STATUS`.
const NVMCTRL_STATUS: u32 = 0x1002;
/// `NVMCTRL.STATUS.BUSY`.
const STATUS_BUSY: u8 = 1 << 0;

const BUSY_TIMEOUT: Duration = Duration::from_millis(50);
const CHIP_ERASE_TIMEOUT: Duration = Duration::from_millis(200);
const POLL_INTERVAL: Duration = Duration::from_micros(500);

/// NVM controller command values, one set per controller generation.
/// These are representative encodings consistent with the publicly
/// documented command layout for each generation; this crate has no
/// byte-exact original source to mirror (see `SPEC_FULL.md` §I).
mod command_value {
    pub const NOP: u8 = 0x00;

    // v0 (tinyAVR-0/1/2, megaAVR-0)
    pub const V0_WRITE_PAGE: u8 = 0x01;
    pub const V0_ERASE_WRITE_PAGE: u8 = 0x02;
    pub const V0_PAGE_BUFFER_CLEAR: u8 = 0x03;
    pub const V0_CHIP_ERASE: u8 = 0x04;
    pub const V0_EEPROM_ERASE: u8 = 0x05;
    pub const V0_WRITE_FUSE: u8 = 0x07;

    // v2 (AVR-Dx)
    pub const V2_WRITE_PAGE: u8 = 0x04;
    pub const V2_ERASE: u8 = 0x08;
    pub const V2_PAGE_BUFFER_CLEAR: u8 = 0x03;
    pub const V2_CHIP_ERASE: u8 = 0x20;
    pub const V2_EEPROM_ERASE_WRITE_PAGE: u8 = 0x13;

    // v3 (AVR-Ex, AVR-DU)
    pub const V3_WRITE_PAGE: u8 = 0x04;
    pub const V3_ERASE: u8 = 0x08;
    pub const V3_PAGE_BUFFER_CLEAR: u8 = 0x03;
    pub const V3_CHIP_ERASE: u8 = 0x20;
    pub const V3_EEPROM_PAGE_BUFFER_ERASE: u8 = 0x18;

    // v5 (AVR-EB, AVR-EA)
    pub const V5_WRITE_PAGE: u8 = 0x04;
    pub const V5_PAGE_BUFFER_ERASE: u8 = 0x0C;
    pub const V5_CHIP_ERASE: u8 = 0x20;
    pub const V5_EEPROM_ERASE: u8 = 0x05;
}

/// NVM controller generation (§3 "NVM command word").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmVersion {
    V0,
    V2,
    V3,
    V5,
}

impl NvmVersion {
    /// Map a SIB NVM-version digit (§4.3) to its controller generation.
    pub fn from_digit(d: u8) -> Option<Self> {
        match d {
            0 => Some(NvmVersion::V0),
            2 => Some(NvmVersion::V2),
            3 => Some(NvmVersion::V3),
            5 => Some(NvmVersion::V5),
            _ => None,
        }
    }
}

/// The command-word table for one [`NvmVersion`], plus the flags that vary
/// alongside it.
struct CommandTable {
    write_page: u8,
    /// Dedicated ERASE command for flash, distinct from WRITE_PAGE
    /// (v2/v3/v5 only — v0 folds erase into ERASE_WRITE_PAGE).
    erase: Option<u8>,
    /// Combined erase+write in one command (v0 flash, v2 EEPROM).
    erase_write_page: Option<u8>,
    page_buffer_clear: u8,
    /// Distinct page-buffer-erase opcode (v5 flash, v3 EEPROM on some
    /// parts).
    page_buffer_erase: Option<u8>,
    chip_erase: u8,
    /// Dedicated EEPROM erase, used with a plain WRITE_PAGE rather than
    /// ERASE_WRITE_PAGE (v5 EA/EB).
    eeprom_erase: Option<u8>,
    /// Per-byte fuse write command (v0 only, §4.4).
    write_fuse: Option<u8>,
    /// Whether EEPROM supports the combined ERASE_WRITE_PAGE command.
    eeprom_erase_write_supported: bool,
}

fn command_table(version: NvmVersion) -> CommandTable {
    use command_value::*;
    match version {
        NvmVersion::V0 => CommandTable {
            write_page: V0_WRITE_PAGE,
            erase: None,
            erase_write_page: Some(V0_ERASE_WRITE_PAGE),
            page_buffer_clear: V0_PAGE_BUFFER_CLEAR,
            page_buffer_erase: None,
            chip_erase: V0_CHIP_ERASE,
            eeprom_erase: Some(V0_EEPROM_ERASE),
            write_fuse: Some(V0_WRITE_FUSE),
            eeprom_erase_write_supported: false,
        },
        NvmVersion::V2 => CommandTable {
            write_page: V2_WRITE_PAGE,
            erase: Some(V2_ERASE),
            erase_write_page: Some(V2_EEPROM_ERASE_WRITE_PAGE),
            page_buffer_clear: V2_PAGE_BUFFER_CLEAR,
            page_buffer_erase: None,
            chip_erase: V2_CHIP_ERASE,
            eeprom_erase: None,
            write_fuse: None,
            eeprom_erase_write_supported: true,
        },
        NvmVersion::V3 => CommandTable {
            write_page: V3_WRITE_PAGE,
            erase: Some(V3_ERASE),
            erase_write_page: None,
            page_buffer_clear: V3_PAGE_BUFFER_CLEAR,
            page_buffer_erase: Some(V3_EEPROM_PAGE_BUFFER_ERASE),
            chip_erase: V3_CHIP_ERASE,
            eeprom_erase: None,
            write_fuse: None,
            eeprom_erase_write_supported: false,
        },
        NvmVersion::V5 => CommandTable {
            write_page: V5_WRITE_PAGE,
            erase: Some(V5_PAGE_BUFFER_ERASE), // flash uses page-buffer-erase, not plain ERASE
            erase_write_page: None,
            page_buffer_clear: NOP, // unused on v5; buffer state is implicit after page-buffer-erase
            page_buffer_erase: Some(V5_PAGE_BUFFER_ERASE),
            chip_erase: V5_CHIP_ERASE,
            eeprom_erase: Some(V5_EEPROM_ERASE),
            write_fuse: None,
            eeprom_erase_write_supported: false,
        },
    }
}

/// A point in the common state machine sketched in §4.4, logged at each
/// transition for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NvmState {
    Idle,
    PageBufferFill,
    Busy,
    Ready,
}

/// Errors raised by the NVM controller driver (§7).
#[derive(Error, Debug)]
pub enum NvmError {
    #[error(transparent)]
    Phy(#[from] PhyError),

    #[error(transparent)]
    App(#[from] AppError),

    #[error("NVM busy bit did not clear within {0:?}")]
    Timeout(Duration),

    #[error("region {0:?} is not writable on this device")]
    UnsupportedMemory(RegionKind),

    #[error("offset/length violates alignment for region {kind:?}: offset={offset}, len={len}")]
    Alignment {
        kind: RegionKind,
        offset: u32,
        len: usize,
    },
}

/// The per-family NVM controller driver.
pub struct NvmDriver {
    version: NvmVersion,
    table: CommandTable,
    addr_size: AddressSize,
}

impl NvmDriver {
    pub fn new(device: &DeviceDescriptor) -> Self {
        Self::for_version(device.nvm_version, device.address_width)
    }

    /// Build a driver from an explicit version instead of a device
    /// descriptor, used when the live SIB (§4.3) should pick the variant
    /// rather than the static descriptor table.
    pub fn for_version(version: NvmVersion, address_width: u8) -> Self {
        Self {
            version,
            table: command_table(version),
            addr_size: AddressSize::for_width(address_width),
        }
    }

    fn write_command(&self, app: &mut App, cmd: u8) -> Result<(), NvmError> {
        trace!(cmd = format!("{cmd:#04x}"), "writing NVMCTRL.CTRLA");
        app.physical()
            .sts(NVMCTRL_CTRLA, AddressSize::Two, DataSize::One, cmd as u32)?;
        Ok(())
    }

    fn poll_busy(&self, app: &mut App, timeout: Duration) -> Result<(), NvmError> {
        debug!(state = ?NvmState::Busy, "waiting for NVMCTRL.STATUS.BUSY to clear");
        let deadline = Instant::now() + timeout;
        loop {
            let status = app
                .physical()
                .lds(NVMCTRL_STATUS, AddressSize::Two, DataSize::One)?;
            if status as u8 & STATUS_BUSY == 0 {
                debug!(state = ?NvmState::Ready, "NVM controller ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(NvmError::Timeout(timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Set the NVM controller's address latch to `addr` without
    /// transferring data. Both data-space accesses and the next
    /// `NVMCTRL.CTRLA` command key off this pointer (§4.4).
    fn latch_address(&self, app: &mut App, addr: u32) -> Result<(), NvmError> {
        app.physical().st_ptr(addr, self.addr_size)?;
        Ok(())
    }

    /// Chip-erase the whole device (§4.5 `erase()` with no region).
    pub fn chip_erase(&self, app: &mut App) -> Result<(), NvmError> {
        debug!(state = ?NvmState::Busy, "chip erase");
        self.write_command(app, self.table.chip_erase)?;
        self.poll_busy(app, CHIP_ERASE_TIMEOUT)
    }

    /// Erase one page-erasable region, page by page.
    pub fn erase_region(&self, region: &MemoryRegion, app: &mut App) -> Result<(), NvmError> {
        if !region.is_page_buffered() {
            return Err(NvmError::UnsupportedMemory(region.kind));
        }
        let page_size = region.page_size.max(1);
        let mut addr = region.base;
        let end = region.base + region.size;
        while addr < end {
            self.latch_address(app, addr)?;
            let cmd = self.erase_command_for(region);
            self.write_command(app, cmd)?;
            self.poll_busy(app, BUSY_TIMEOUT)?;
            addr += page_size;
        }
        Ok(())
    }

    fn erase_command_for(&self, region: &MemoryRegion) -> u8 {
        match region.kind {
            RegionKind::Eeprom => self
                .table
                .eeprom_erase
                .or(self.table.erase)
                .unwrap_or(self.table.page_buffer_clear),
            _ => self
                .table
                .erase
                .or(self.table.page_buffer_erase)
                .unwrap_or(self.table.chip_erase),
        }
    }

    fn validate_alignment(
        &self,
        region: &MemoryRegion,
        offset: u32,
        len: usize,
    ) -> Result<(), NvmError> {
        if region.is_word_oriented() && (offset % 2 != 0 || len % 2 != 0) {
            return Err(NvmError::Alignment {
                kind: region.kind,
                offset,
                len,
            });
        }
        // A region whose write granularity equals its full size must be
        // committed as exactly one page operation (§4.4, §8 scenario S6):
        // AVR-DU's user row, and by the same rule any other
        // whole-region-only write.
        if region.write_granularity == region.size && len as u32 != region.size {
            return Err(NvmError::Alignment {
                kind: region.kind,
                offset,
                len,
            });
        }
        if offset + len as u32 > region.size {
            return Err(NvmError::Alignment {
                kind: region.kind,
                offset,
                len,
            });
        }
        Ok(())
    }

    fn writable(&self, region: &MemoryRegion) -> bool {
        matches!(
            region.kind,
            RegionKind::Flash
                | RegionKind::Eeprom
                | RegionKind::Fuses
                | RegionKind::UserRow
                | RegionKind::BootRow
                | RegionKind::ConfigWords
        )
    }

    /// Write `data` at `offset` within `region`, splitting across pages
    /// and committing each one before continuing (§4.5 `write`).
    pub fn write_region(
        &self,
        region: &MemoryRegion,
        offset: u32,
        data: &[u8],
        app: &mut App,
    ) -> Result<(), NvmError> {
        if !self.writable(region) {
            return Err(NvmError::UnsupportedMemory(region.kind));
        }
        self.validate_alignment(region, offset, data.len())?;

        if region.kind == RegionKind::Fuses && self.table.write_fuse.is_some() {
            return self.write_fuses_per_byte(region, offset, data, app);
        }

        let unit = if region.is_word_oriented() {
            DataSize::Two
        } else {
            DataSize::One
        };
        let page_size = region.page_size.max(1);
        let mut pos = 0usize;
        while pos < data.len() {
            let page_index = (offset + pos as u32) / page_size;
            let page_base = region.base + page_index * page_size;
            let page_offset_in_data_space = offset + pos as u32 - page_index * page_size;
            let room_in_page = (page_size - page_offset_in_data_space) as usize;
            let chunk_len = room_in_page.min(data.len() - pos);
            let chunk = &data[pos..pos + chunk_len];

            self.commit_page(
                region,
                page_base,
                page_offset_in_data_space,
                page_size,
                chunk,
                unit,
                app,
            )?;
            pos += chunk_len;
        }
        Ok(())
    }

    /// Read-modify-write a single page: read the whole page, overlay
    /// `chunk` at `offset_in_page`, clear/erase the page buffer, refill
    /// it, and commit (§4.4 "single-byte writes to user_row must not
    /// corrupt adjacent bytes"; applied uniformly, which also gives §8
    /// property 4, page boundary preservation, for free).
    #[allow(clippy::too_many_arguments)]
    fn commit_page(
        &self,
        region: &MemoryRegion,
        page_base: u32,
        offset_in_page: u32,
        page_size: u32,
        chunk: &[u8],
        unit: DataSize,
        app: &mut App,
    ) -> Result<(), NvmError> {
        debug!(state = ?NvmState::PageBufferFill, page_base = format!("{page_base:#x}"), "filling page buffer");

        let mut page = if chunk.len() as u32 == page_size {
            chunk.to_vec()
        } else {
            let existing = app
                .physical()
                .block_read(page_base, self.addr_size, page_size as usize, DataSize::One)?;
            let mut page = existing;
            page[offset_in_page as usize..offset_in_page as usize + chunk.len()]
                .copy_from_slice(chunk);
            page
        };
        if page.len() as u32 != page_size {
            page.resize(page_size as usize, 0xFF);
        }

        self.latch_address(app, page_base)?;
        self.write_command(app, self.table.page_buffer_clear)?;

        // Accelerate the page-buffer fill by suppressing the per-byte ACK
        // (§4.2 CTRLA.RSD); the commit+poll_busy below is what actually
        // verifies the write landed, via NVM status rather than per-byte
        // feedback.
        app.physical().stcs(crate::app::cs::CTRLA, crate::app::ctrla_bits::RSD)?;
        let fill_result = app
            .physical()
            .block_write_no_ack(page_base, self.addr_size, &page, unit);
        app.physical().stcs(crate::app::cs::CTRLA, 0)?;
        fill_result?;

        let commit_cmd = self.commit_command_for(region);
        self.latch_address(app, page_base)?;
        self.write_command(app, commit_cmd)?;
        self.poll_busy(app, BUSY_TIMEOUT)?;

        if let Some(second) = self.second_commit_command_for(region) {
            self.latch_address(app, page_base)?;
            self.write_command(app, second)?;
            self.poll_busy(app, BUSY_TIMEOUT)?;
        }
        Ok(())
    }

    /// The primary commit command for a page of `region`. For the
    /// "erase-then-write" strategies this is the erase half; the write
    /// half is returned by [`Self::second_commit_command_for`].
    fn commit_command_for(&self, region: &MemoryRegion) -> u8 {
        match (region.kind, self.version) {
            (RegionKind::Flash | RegionKind::BootRow | RegionKind::ConfigWords, NvmVersion::V0) => {
                self.table.erase_write_page.unwrap_or(self.table.write_page)
            }
            (RegionKind::Flash | RegionKind::BootRow | RegionKind::ConfigWords, _) => self
                .table
                .erase
                .or(self.table.page_buffer_erase)
                .unwrap_or(self.table.write_page),
            (RegionKind::Eeprom | RegionKind::UserRow, NvmVersion::V0) => self.table.write_page,
            (RegionKind::Eeprom, NvmVersion::V2) => self
                .table
                .erase_write_page
                .unwrap_or(self.table.write_page),
            (RegionKind::Eeprom, NvmVersion::V3) => self
                .table
                .page_buffer_erase
                .unwrap_or(self.table.write_page),
            (RegionKind::Eeprom, NvmVersion::V5) => {
                self.table.eeprom_erase.unwrap_or(self.table.write_page)
            }
            _ => self.table.write_page,
        }
    }

    /// The second (write) command of a two-command erase-then-write
    /// strategy, or `None` if the primary command already does the whole
    /// job.
    fn second_commit_command_for(&self, region: &MemoryRegion) -> Option<u8> {
        match (region.kind, self.version) {
            (RegionKind::Flash | RegionKind::BootRow | RegionKind::ConfigWords, v)
                if v != NvmVersion::V0 =>
            {
                Some(self.table.write_page)
            }
            (RegionKind::Eeprom, NvmVersion::V3) if !self.table.eeprom_erase_write_supported => {
                Some(self.table.write_page)
            }
            (RegionKind::Eeprom, NvmVersion::V5) => Some(self.table.write_page),
            _ => None,
        }
    }

    fn write_fuses_per_byte(
        &self,
        region: &MemoryRegion,
        offset: u32,
        data: &[u8],
        app: &mut App,
    ) -> Result<(), NvmError> {
        let cmd = self.table.write_fuse.expect("checked by caller");
        for (i, &byte) in data.iter().enumerate() {
            let addr = region.base + offset + i as u32;
            app.physical()
                .sts(addr, self.addr_size, DataSize::One, byte as u32)?;
            self.write_command(app, cmd)?;
            self.poll_busy(app, BUSY_TIMEOUT)?;
        }
        Ok(())
    }

    /// Read `n` bytes from `region` at `offset` (§4.5 `read`, block-read
    /// fast path).
    pub fn read_region(
        &self,
        region: &MemoryRegion,
        offset: u32,
        n: usize,
        app: &mut App,
    ) -> Result<Vec<u8>, NvmError> {
        if offset + n as u32 > region.size {
            return Err(NvmError::Alignment {
                kind: region.kind,
                offset,
                len: n,
            });
        }
        let data = app
            .physical()
            .block_read(region.base + offset, self.addr_size, n, DataSize::One)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::device::{get_device, RegionKind};
    use crate::link::tests::FakeSerialPort;
    use crate::link::Link;
    use crate::phy::{Physical, ACK};
    use std::time::Duration as StdDuration;

    fn app_with(mut port: FakeSerialPort, replies: &[u8]) -> App {
        port.queue_reply(replies);
        let link = Link::new(Box::new(port), 115_200, StdDuration::from_millis(20));
        App::new(Physical::new(link))
    }

    #[test]
    fn chip_erase_polls_busy_to_clear() {
        let device = get_device("atmega4809").unwrap();
        let driver = NvmDriver::new(&device);
        // write_command -> STS two ACKs; poll_busy -> BUSY=1 then BUSY=0
        let mut app = app_with(FakeSerialPort::new(), &[ACK, ACK, STATUS_BUSY, 0x00]);
        driver.chip_erase(&mut app).unwrap();
    }

    #[test]
    fn single_byte_user_row_write_preserves_page() {
        let device = get_device("atmega4809").unwrap();
        let region = device.region(RegionKind::UserRow).unwrap();
        let driver = NvmDriver::new(&device);
        let page_size = region.page_size as usize;
        // block_read of the whole page (ST_PTR ack + page_size LD replies),
        // then commit_page: PBC (STS 2 acks), RSD-suppressed block fill
        // (ST_PTR ack only, no per-byte ACKs), write_page command (STS 2
        // acks), poll busy (1 ready).
        let mut replies = vec![ACK]; // ST_PTR for block_read
        replies.extend(std::iter::repeat(0xFFu8).take(page_size)); // existing page, all erased
        replies.push(ACK); // latch_address for PBC (ST_PTR)
        replies.push(ACK); // PBC command STS phase 1
        replies.push(ACK); // PBC command STS phase 2
        replies.push(ACK); // block_write_no_ack's ST_PTR
        replies.push(ACK); // latch_address before commit
        replies.push(ACK); // commit command STS phase 1
        replies.push(ACK); // commit command STS phase 2
        replies.push(0x00); // poll_busy ready

        let mut app = app_with(FakeSerialPort::new(), &replies);
        driver
            .write_region(region, 4, &[0xAB], &mut app)
            .unwrap();
    }

    #[test]
    fn avr_du_user_row_rejects_partial_write() {
        let device = get_device("avr64du32").unwrap();
        let region = device.region(RegionKind::UserRow).unwrap();
        let driver = NvmDriver::new(&device);
        let mut app = app_with(FakeSerialPort::new(), &[]);
        let err = driver
            .write_region(region, 0, &[0x01, 0x02], &mut app)
            .unwrap_err();
        assert!(matches!(err, NvmError::Alignment { .. }));
    }

    #[test]
    fn word_oriented_region_rejects_odd_length() {
        let device = get_device("atmega4809").unwrap();
        let region = device.region(RegionKind::Flash).unwrap();
        let driver = NvmDriver::new(&device);
        let mut app = app_with(FakeSerialPort::new(), &[]);
        let err = driver
            .write_region(region, 0, &[0x01, 0x02, 0x03], &mut app)
            .unwrap_err();
        assert!(matches!(err, NvmError::Alignment { .. }));
    }

    #[test]
    fn unsupported_region_is_rejected() {
        let device = get_device("atmega4809").unwrap();
        let region = device.region(RegionKind::Signatures).unwrap();
        let driver = NvmDriver::new(&device);
        let mut app = app_with(FakeSerialPort::new(), &[]);
        let err = driver
            .write_region(region, 0, &[0x01], &mut app)
            .unwrap_err();
        assert!(matches!(err, NvmError::UnsupportedMemory(_)));
    }
}
