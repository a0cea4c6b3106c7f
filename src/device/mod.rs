//! Device descriptors and the memory-region map.
//!
//! A [`DeviceDescriptor`] is an immutable record loaded once per session
//! (§3 of the spec this crate implements): family, NVM controller version,
//! address width, expected signature bytes, and a table of [`MemoryRegion`]
//! entries keyed by [`RegionKind`].
//!
//! [`get_device`] stands in for the abstract device-parameter provider of
//! the external-interfaces section; a real distribution would back it with
//! a packs/TDF database, but the shape of the lookup (`name -> descriptor`)
//! is what the rest of the crate depends on.

use std::fmt;

use bitflags::bitflags;
use thiserror::Error;

use crate::nvm::NvmVersion;

/// Errors raised while resolving or inspecting a device descriptor.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No descriptor is known for the requested part name.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The requested memory region is not present on this device.
    #[error("region {0:?} is not present on this device")]
    RegionNotPresent(RegionKind),
}

/// AVR device family, as distinguished by its NVM controller generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    TinyAvr0,
    TinyAvr1,
    TinyAvr2,
    MegaAvr0,
    AvrDx,
    AvrEx,
    AvrDu,
    AvrEb,
    AvrEa,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Family::TinyAvr0 => "tinyAVR-0",
            Family::TinyAvr1 => "tinyAVR-1",
            Family::TinyAvr2 => "tinyAVR-2",
            Family::MegaAvr0 => "megaAVR-0",
            Family::AvrDx => "AVR-Dx",
            Family::AvrEx => "AVR-Ex",
            Family::AvrDu => "AVR-DU",
            Family::AvrEb => "AVR-EB",
            Family::AvrEa => "AVR-EA",
        };
        f.write_str(s)
    }
}

/// The recognised memory-region tags (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Flash,
    Eeprom,
    Fuses,
    Lockbits,
    Signatures,
    UserRow,
    BootRow,
    InternalSram,
    CalibrationRow,
    Dia,
    Dci,
    ConfigWords,
    UserId,
    Icd,
}

bitflags! {
    /// Per-region behavioural flags (§3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        /// The region can be erased a page at a time (as opposed to only
        /// as a whole, or not at all).
        const ERASABLE_AS_PAGE     = 1 << 0;
        /// Writing requires an explicit erase before the write can land
        /// (no erase-write-page combined command for this region).
        const REQUIRES_ERASE_WRITE = 1 << 1;
        /// Accesses must be 16-bit aligned and even-length.
        const WORD_ORIENTED        = 1 << 2;
        /// Not emitted when reading out to a HEX file.
        const HIDDEN_FROM_HEX      = 1 << 3;
    }
}

/// One entry of a device's memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub kind: RegionKind,
    /// Base address in the target's UPDI data-space address map (not the
    /// AVR-HEX-convention offset of §6 — see [`crate::hex`] for that).
    pub base: u32,
    pub size: u32,
    pub page_size: u32,
    /// Minimum granularity of an individual write, in bytes (1 or 2).
    pub write_granularity: u32,
    pub flags: RegionFlags,
}

impl MemoryRegion {
    pub fn is_page_buffered(&self) -> bool {
        self.flags.contains(RegionFlags::ERASABLE_AS_PAGE) && self.page_size > 1
    }

    pub fn is_word_oriented(&self) -> bool {
        self.flags.contains(RegionFlags::WORD_ORIENTED)
    }
}

/// Immutable per-session device record (§3).
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub name: String,
    pub family: Family,
    pub nvm_version: NvmVersion,
    /// 16 or 24.
    pub address_width: u8,
    pub signature: [u8; 3],
    regions: Vec<MemoryRegion>,
}

impl DeviceDescriptor {
    pub fn region(&self, kind: RegionKind) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.kind == kind)
    }

    pub fn require_region(&self, kind: RegionKind) -> Result<&MemoryRegion, DeviceError> {
        self.region(kind).ok_or(DeviceError::RegionNotPresent(kind))
    }

    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter()
    }

    /// Address of the signature row, used by `app::read_device_id` for the
    /// `LDS` that fetches the three signature bytes (§4.3).
    pub fn signature_address(&self) -> u32 {
        self.region(RegionKind::Signatures)
            .map(|r| r.base)
            .unwrap_or(0x1100)
    }
}

fn region(
    kind: RegionKind,
    base: u32,
    size: u32,
    page_size: u32,
    write_granularity: u32,
    flags: RegionFlags,
) -> MemoryRegion {
    MemoryRegion {
        kind,
        base,
        size,
        page_size,
        write_granularity,
        flags,
    }
}

/// Look up a device descriptor by part name (case-insensitive).
///
/// This stands in for the abstract device-parameter provider of §6; it
/// carries one representative part per NVM controller version so every
/// family-specific code path in [`crate::nvm`] is reachable.
pub fn get_device(name: &str) -> Result<DeviceDescriptor, DeviceError> {
    let key = name.to_ascii_lowercase();
    let descriptor = match key.as_str() {
        "attiny1614" => attiny1614(),
        "atmega4809" => atmega4809(),
        "avr128da48" => avr128da48(),
        "avr64du32" => avr64du32(),
        "avr64ea48" => avr64ea48(),
        _ => return Err(DeviceError::UnknownDevice(name.to_string())),
    };
    Ok(descriptor)
}

fn atmega4809() -> DeviceDescriptor {
    DeviceDescriptor {
        name: "atmega4809".into(),
        family: Family::MegaAvr0,
        nvm_version: NvmVersion::V0,
        address_width: 16,
        signature: [0x1E, 0x96, 0x51],
        regions: vec![
            region(
                RegionKind::Flash,
                0x4000,
                0xC000,
                128,
                2,
                RegionFlags::ERASABLE_AS_PAGE | RegionFlags::WORD_ORIENTED,
            ),
            region(
                RegionKind::Eeprom,
                0x1400,
                0x100,
                32,
                1,
                RegionFlags::ERASABLE_AS_PAGE,
            ),
            region(RegionKind::Fuses, 0x1280, 10, 1, 1, RegionFlags::empty()),
            region(
                RegionKind::Lockbits,
                0x128A,
                1,
                1,
                1,
                RegionFlags::HIDDEN_FROM_HEX,
            ),
            region(
                RegionKind::Signatures,
                0x1100,
                3,
                1,
                1,
                RegionFlags::HIDDEN_FROM_HEX,
            ),
            region(RegionKind::UserRow, 0x1300, 32, 32, 1, RegionFlags::ERASABLE_AS_PAGE),
            region(
                RegionKind::InternalSram,
                0x3800,
                0x1800,
                1,
                1,
                RegionFlags::HIDDEN_FROM_HEX,
            ),
        ],
    }
}

fn attiny1614() -> DeviceDescriptor {
    DeviceDescriptor {
        name: "attiny1614".into(),
        family: Family::TinyAvr1,
        nvm_version: NvmVersion::V0,
        address_width: 16,
        signature: [0x1E, 0x94, 0x22],
        regions: vec![
            region(
                RegionKind::Flash,
                0x8000,
                0x4000,
                64,
                2,
                RegionFlags::ERASABLE_AS_PAGE | RegionFlags::WORD_ORIENTED,
            ),
            region(
                RegionKind::Eeprom,
                0x1400,
                0x100,
                32,
                1,
                RegionFlags::ERASABLE_AS_PAGE,
            ),
            region(RegionKind::Fuses, 0x1280, 10, 1, 1, RegionFlags::empty()),
            region(
                RegionKind::Lockbits,
                0x128A,
                1,
                1,
                1,
                RegionFlags::HIDDEN_FROM_HEX,
            ),
            region(
                RegionKind::Signatures,
                0x1100,
                3,
                1,
                1,
                RegionFlags::HIDDEN_FROM_HEX,
            ),
            region(RegionKind::UserRow, 0x1300, 32, 32, 1, RegionFlags::ERASABLE_AS_PAGE),
        ],
    }
}

fn avr128da48() -> DeviceDescriptor {
    DeviceDescriptor {
        name: "avr128da48".into(),
        family: Family::AvrDx,
        nvm_version: NvmVersion::V2,
        address_width: 24,
        signature: [0x1E, 0x97, 0x02],
        regions: vec![
            region(
                RegionKind::Flash,
                0x80_0000,
                0x2_0000,
                512,
                2,
                RegionFlags::ERASABLE_AS_PAGE | RegionFlags::WORD_ORIENTED,
            ),
            region(
                RegionKind::Eeprom,
                0x1400,
                0x200,
                32,
                1,
                RegionFlags::ERASABLE_AS_PAGE,
            ),
            region(RegionKind::Fuses, 0x1050, 15, 1, 1, RegionFlags::empty()),
            region(
                RegionKind::Lockbits,
                0x105F,
                1,
                1,
                1,
                RegionFlags::HIDDEN_FROM_HEX,
            ),
            region(
                RegionKind::Signatures,
                0x1080,
                3,
                1,
                1,
                RegionFlags::HIDDEN_FROM_HEX,
            ),
            region(RegionKind::UserRow, 0x1080, 64, 64, 1, RegionFlags::ERASABLE_AS_PAGE),
        ],
    }
}

fn avr64du32() -> DeviceDescriptor {
    DeviceDescriptor {
        name: "avr64du32".into(),
        family: Family::AvrDu,
        nvm_version: NvmVersion::V3,
        address_width: 24,
        signature: [0x1E, 0x96, 0x2A],
        regions: vec![
            region(
                RegionKind::Flash,
                0x80_0000,
                0x1_0000,
                512,
                2,
                RegionFlags::ERASABLE_AS_PAGE | RegionFlags::WORD_ORIENTED,
            ),
            region(
                RegionKind::Eeprom,
                0x1400,
                0x100,
                32,
                1,
                RegionFlags::ERASABLE_AS_PAGE | RegionFlags::REQUIRES_ERASE_WRITE,
            ),
            region(RegionKind::Fuses, 0x1050, 15, 1, 1, RegionFlags::empty()),
            region(
                RegionKind::Signatures,
                0x1080,
                3,
                1,
                1,
                RegionFlags::HIDDEN_FROM_HEX,
            ),
            // AVR-DU user row: must be committed as one page op (§4.4, S6).
            region(RegionKind::UserRow, 0x1100, 32, 32, 32, RegionFlags::ERASABLE_AS_PAGE),
        ],
    }
}

fn avr64ea48() -> DeviceDescriptor {
    DeviceDescriptor {
        name: "avr64ea48".into(),
        family: Family::AvrEa,
        nvm_version: NvmVersion::V5,
        address_width: 24,
        signature: [0x1E, 0x96, 0x28],
        regions: vec![
            region(
                RegionKind::Flash,
                0x80_0000,
                0x1_0000,
                512,
                2,
                RegionFlags::ERASABLE_AS_PAGE | RegionFlags::WORD_ORIENTED,
            ),
            region(
                RegionKind::Eeprom,
                0x1400,
                0x200,
                64,
                1,
                RegionFlags::ERASABLE_AS_PAGE | RegionFlags::REQUIRES_ERASE_WRITE,
            ),
            region(RegionKind::Fuses, 0x1050, 15, 1, 1, RegionFlags::empty()),
            region(
                RegionKind::Signatures,
                0x1080,
                3,
                1,
                1,
                RegionFlags::HIDDEN_FROM_HEX,
            ),
            region(RegionKind::UserRow, 0x1100, 64, 64, 1, RegionFlags::ERASABLE_AS_PAGE),
            region(
                RegionKind::BootRow,
                0x1200,
                64,
                64,
                2,
                RegionFlags::ERASABLE_AS_PAGE | RegionFlags::WORD_ORIENTED,
            ),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_device_resolves() {
        let d = get_device("ATmega4809").unwrap();
        assert_eq!(d.signature, [0x1E, 0x96, 0x51]);
        assert_eq!(d.family, Family::MegaAvr0);
    }

    #[test]
    fn unknown_device_errors() {
        let err = get_device("not-a-real-part").unwrap_err();
        assert!(matches!(err, DeviceError::UnknownDevice(_)));
    }

    #[test]
    fn avr_du_user_row_is_single_page() {
        let d = avr64du32();
        let user_row = d.region(RegionKind::UserRow).unwrap();
        assert_eq!(user_row.size, user_row.page_size);
        assert_eq!(user_row.write_granularity, user_row.page_size);
    }

    #[test]
    fn flash_is_word_oriented_and_page_buffered() {
        let d = atmega4809();
        let flash = d.region(RegionKind::Flash).unwrap();
        assert!(flash.is_word_oriented());
        assert!(flash.is_page_buffered());
    }
}
