//! HEX file glue (§6 "HEX file offsets (AVR convention)"): routes each
//! Intel HEX segment to the region it addresses, and filters which regions
//! come back out when reading a device to a HEX file.
//!
//! Built on the `ihex` crate (grounded on the pack's
//! `other_examples/.../jonas-schievink-spi-memory`, whose `util` feature
//! pairs `ihex` with a hardware memory driver the same way this module
//! pairs it with [`crate::nvm`]).

use ihex::{create_object_file_representation, Reader, Record};
use thiserror::Error;

use crate::device::RegionKind;

/// AVR-HEX-convention base address for each region (§6).
fn base_for(kind: RegionKind) -> Option<u32> {
    match kind {
        RegionKind::Flash => Some(0x000000),
        RegionKind::Eeprom => Some(0x810000),
        RegionKind::Fuses => Some(0x820000),
        RegionKind::Lockbits => Some(0x830000),
        RegionKind::Signatures => Some(0x840000),
        RegionKind::UserRow => Some(0x850000),
        RegionKind::BootRow => Some(0x860000),
        _ => None,
    }
}

/// Regions emitted when reading a device out to a HEX file (§6).
const EMIT_KINDS: &[RegionKind] = &[
    RegionKind::Eeprom,
    RegionKind::Flash,
    RegionKind::Fuses,
    RegionKind::ConfigWords,
    RegionKind::UserRow,
];

pub fn is_emitted(kind: RegionKind) -> bool {
    EMIT_KINDS.contains(&kind)
}

/// Errors raised parsing or routing HEX content.
#[derive(Error, Debug)]
pub enum HexError {
    #[error("malformed HEX record: {0}")]
    Malformed(String),

    #[error("address {0:#x} does not route to any known region")]
    Unrouted(u32),
}

/// Route an absolute AVR-HEX address to `(region, offset within region)`
/// (§8 property 5).
///
/// Boundaries are checked from the highest base down, since every
/// non-flash region's base is far above any real flash size and flash
/// itself starts at `0x000000`.
pub fn route(addr: u32) -> Result<(RegionKind, u32), HexError> {
    const BASES: &[(u32, RegionKind)] = &[
        (0x860000, RegionKind::BootRow),
        (0x850000, RegionKind::UserRow),
        (0x840000, RegionKind::Signatures),
        (0x830000, RegionKind::Lockbits),
        (0x820000, RegionKind::Fuses),
        (0x810000, RegionKind::Eeprom),
    ];
    for &(base, kind) in BASES {
        if addr >= base {
            return Ok((kind, addr - base));
        }
    }
    if addr < 0x800000 {
        return Ok((RegionKind::Flash, addr));
    }
    Err(HexError::Unrouted(addr))
}

/// Parse Intel HEX text into `(absolute address, data)` segments,
/// resolving `ExtendedLinearAddress`/`ExtendedSegmentAddress` records into
/// the upper bits of each subsequent data record's address. One segment per
/// contiguous `Data` record; segment boundaries as they appear in the file
/// are preserved (§6).
pub fn parse_hex(text: &str) -> Result<Vec<(u32, Vec<u8>)>, HexError> {
    let mut segments = Vec::new();
    let mut upper: u32 = 0;
    for record in Reader::new(text) {
        let record = record.map_err(|e| HexError::Malformed(e.to_string()))?;
        match record {
            Record::Data { offset, value } => {
                let addr = upper | offset as u32;
                segments.push((addr, value));
            }
            Record::ExtendedLinearAddress(hi) => upper = (hi as u32) << 16,
            Record::ExtendedSegmentAddress(seg) => upper = (seg as u32) << 4,
            Record::StartLinearAddress(_) | Record::StartSegmentAddress { .. } => {}
            Record::EndOfFile => break,
        }
    }
    Ok(segments)
}

/// Build Intel HEX text from `(region, offset, data)` triples, emitting
/// only the regions [`is_emitted`] allows and translating each back to its
/// AVR-HEX-convention absolute address.
pub fn write_hex(regions: &[(RegionKind, u32, Vec<u8>)]) -> Result<String, HexError> {
    let mut records = Vec::new();
    let mut last_upper: u32 = 0;
    for (kind, offset, data) in regions {
        if !is_emitted(*kind) {
            continue;
        }
        let base = base_for(*kind).ok_or(HexError::Unrouted(*offset))?;
        let addr = base + offset;
        let upper = addr & 0xFFFF_0000;
        if upper != last_upper {
            records.push(Record::ExtendedLinearAddress((upper >> 16) as u16));
            last_upper = upper;
        }
        for chunk in data.chunks(32) {
            records.push(Record::Data {
                offset: (addr & 0xFFFF) as u16,
                value: chunk.to_vec(),
            });
        }
    }
    records.push(Record::EndOfFile);
    create_object_file_representation(&records).map_err(HexError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_fuses_eeprom_and_flash() {
        assert_eq!(route(0x820003).unwrap(), (RegionKind::Fuses, 3));
        assert_eq!(route(0x810010).unwrap(), (RegionKind::Eeprom, 0x10));
        assert_eq!(route(0x000100).unwrap(), (RegionKind::Flash, 0x100));
    }

    #[test]
    fn routes_user_row_and_boot_row() {
        assert_eq!(route(0x850004).unwrap(), (RegionKind::UserRow, 4));
        assert_eq!(route(0x860008).unwrap(), (RegionKind::BootRow, 8));
    }

    #[test]
    fn emits_only_the_documented_kinds() {
        assert!(is_emitted(RegionKind::Flash));
        assert!(is_emitted(RegionKind::Eeprom));
        assert!(!is_emitted(RegionKind::Signatures));
        assert!(!is_emitted(RegionKind::Lockbits));
    }

    #[test]
    fn parses_flash_and_eeprom_segments() {
        let hex = ":04000000DEADBEEFC4\n\
                   :02000004008179\n\
                   :02000000AABB99\n\
                   :00000001FF\n";
        let segments = parse_hex(hex).unwrap();
        assert_eq!(segments[0], (0x0000_0000, vec![0xDE, 0xAD, 0xBE, 0xEF]));
        assert_eq!(segments[1], (0x0081_0000, vec![0xAA, 0xBB]));
    }
}
