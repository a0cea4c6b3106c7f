//! The UPDI physical instruction set (§4.2): the byte-level opcodes
//! (`LDS`/`STS`/`LD`/`ST`/`LDCS`/`STCS`/`REPEAT`/`KEY`) that are the only
//! primitives the link layer exposes, plus the block read/write fast path
//! built from `ST_PTR` + `REPEAT` + `ST(PTR_INC, ...)`.

use thiserror::Error;

use crate::link::{Link, LinkError};

/// One-byte ACK the UPDI PHY returns between the two phases of an `STS`
/// (and after each `ST`, unless ACK is suppressed via `CTRLA.RSD`).
pub const ACK: u8 = 0x40;

mod opcode {
    pub const LDS: u8 = 0x00;
    pub const STS: u8 = 0x40;
    pub const LD: u8 = 0x20;
    pub const ST: u8 = 0x60;
    pub const LDCS: u8 = 0x80;
    pub const REPEAT: u8 = 0xA0;
    pub const STCS: u8 = 0xC0;
    pub const KEY: u8 = 0xE0;

    /// `KEY` instruction with the SIB flag set reads the System
    /// Information Block instead of writing an activation key (§4.3).
    pub const SIB_FLAG: u8 = 0x04;
}

mod ptr {
    /// Use the pointer as-is, do not change it.
    pub const UNCHANGED: u8 = 0x00;
    /// Use the pointer, then post-increment it.
    pub const INC: u8 = 0x04;
    /// Treat the operand as an immediate address and load it into the
    /// pointer register (`ST_PTR`).
    pub const ADDRESS: u8 = 0x08;
}

/// Address width in bytes for `LDS`/`STS`/`ST_PTR`, encoded in opcode
/// bits [3:2].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSize {
    One,
    Two,
    Three,
}

impl AddressSize {
    fn field(self) -> u8 {
        match self {
            AddressSize::One => 0x00,
            AddressSize::Two => 0x04,
            AddressSize::Three => 0x08,
        }
    }

    fn bytes(self) -> usize {
        match self {
            AddressSize::One => 1,
            AddressSize::Two => 2,
            AddressSize::Three => 3,
        }
    }

    /// The address width a device descriptor declares (16 or 24 bits).
    pub fn for_width(width: u8) -> Self {
        if width > 16 {
            AddressSize::Three
        } else {
            AddressSize::Two
        }
    }
}

/// Data width in bytes for `LDS`/`STS`/`LD`/`ST`, encoded in opcode
/// bits [1:0].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSize {
    One,
    Two,
    Three,
}

impl DataSize {
    fn field(self) -> u8 {
        match self {
            DataSize::One => 0x00,
            DataSize::Two => 0x01,
            DataSize::Three => 0x02,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            DataSize::One => 1,
            DataSize::Two => 2,
            DataSize::Three => 3,
        }
    }
}

/// Count argument to `REPEAT`: the wire value is `n`, the device performs
/// `n + 1` repetitions of the following instruction (§4.2).
#[derive(Debug, Clone, Copy)]
pub enum RepeatCount {
    Byte(u8),
    Word(u16),
}

/// Errors raised at the physical-opcode layer (part of `ProtocolFault`, §7).
#[derive(Error, Debug)]
pub enum PhyError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("expected ACK ({ACK:#04x}), got {0:#04x}")]
    MissingAck(u8),
}

fn le_bytes(value: u32, n: usize) -> Vec<u8> {
    value.to_le_bytes()[..n].to_vec()
}

fn from_le_bytes(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf[..bytes.len()].copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

/// The physical-opcode layer, built directly on a [`Link`].
pub struct Physical {
    link: Link,
}

impl Physical {
    pub fn new(link: Link) -> Self {
        Self { link }
    }

    pub fn link(&mut self) -> &mut Link {
        &mut self.link
    }

    pub fn into_link(self) -> Link {
        self.link
    }

    /// `LDCS(cs)`: read a one-byte control/status register.
    pub fn ldcs(&mut self, cs: u8) -> Result<u8, PhyError> {
        let reply = self.link.transact(&[opcode::LDCS | (cs & 0x0F)], 1)?;
        Ok(reply[0])
    }

    /// `STCS(cs, v)`: write a one-byte control/status register. No reply.
    pub fn stcs(&mut self, cs: u8, value: u8) -> Result<(), PhyError> {
        self.link
            .send_no_reply(&[opcode::STCS | (cs & 0x0F), value])?;
        Ok(())
    }

    /// `KEY(len, key)`: send an 8- or 16-byte activation key. No reply.
    pub fn key(&mut self, key: &[u8]) -> Result<(), PhyError> {
        let size_field = match key.len() {
            8 => 0x00,
            16 => 0x01,
            32 => 0x02,
            n => {
                // Keys are always one of the above; a caller supplying a
                // different length is a programming error in this crate,
                // not a device fault, so fall back to the closest code
                // rather than silently truncating.
                debug_assert!(false, "unsupported key length {n}");
                0x00
            }
        };
        let mut frame = vec![opcode::KEY | size_field];
        // The key is transmitted most-significant-byte-first on the wire
        // relative to its ASCII order, i.e. reversed (§4.3 "little-endian
        // order on the wire").
        frame.extend(key.iter().rev());
        self.link.send_no_reply(&frame)?;
        Ok(())
    }

    /// Read the System Information Block: `len` is 16 or 32 ASCII bytes
    /// (§4.3).
    pub fn read_sib(&mut self, len: usize) -> Result<Vec<u8>, PhyError> {
        let size_field = if len > 16 { 0x01 } else { 0x00 };
        let reply = self
            .link
            .transact(&[opcode::KEY | opcode::SIB_FLAG | size_field], len)?;
        Ok(reply)
    }

    /// `LDS(addr, size)`: load from data space at a direct address.
    pub fn lds(&mut self, addr: u32, addr_size: AddressSize, data_size: DataSize) -> Result<u32, PhyError> {
        let mut frame = vec![opcode::LDS | addr_size.field() | data_size.field()];
        frame.extend(le_bytes(addr, addr_size.bytes()));
        let reply = self.link.transact(&frame, data_size.bytes())?;
        Ok(from_le_bytes(&reply))
    }

    /// `STS(addr, size, data)`: store to data space. Two-phase: the
    /// address phase is ACKed, then the data phase is ACKed (§4.2).
    pub fn sts(
        &mut self,
        addr: u32,
        addr_size: AddressSize,
        data_size: DataSize,
        data: u32,
    ) -> Result<(), PhyError> {
        let mut frame = vec![opcode::STS | addr_size.field() | data_size.field()];
        frame.extend(le_bytes(addr, addr_size.bytes()));
        let ack = self.link.transact(&frame, 1)?;
        if ack[0] != ACK {
            return Err(PhyError::MissingAck(ack[0]));
        }
        let data_bytes = le_bytes(data, data_size.bytes());
        let ack = self.link.transact(&data_bytes, 1)?;
        if ack[0] != ACK {
            return Err(PhyError::MissingAck(ack[0]));
        }
        Ok(())
    }

    /// `ST_PTR(addr)`: load an immediate address into the pointer
    /// register, used to start a block transfer (§4.2).
    pub fn st_ptr(&mut self, addr: u32, addr_size: AddressSize) -> Result<(), PhyError> {
        let data_size = match addr_size {
            AddressSize::One => DataSize::One,
            AddressSize::Two => DataSize::Two,
            AddressSize::Three => DataSize::Three,
        };
        let mut frame = vec![opcode::ST | ptr::ADDRESS | data_size.field()];
        frame.extend(le_bytes(addr, addr_size.bytes()));
        let ack = self.link.transact(&frame, 1)?;
        if ack[0] != ACK {
            return Err(PhyError::MissingAck(ack[0]));
        }
        Ok(())
    }

    /// `ST(ptr_inc, size, data)`: store a single unit of data through the
    /// pointer, optionally auto-incrementing it afterwards.
    pub fn st(&mut self, data: u32, data_size: DataSize, post_increment: bool) -> Result<(), PhyError> {
        let ptr_field = if post_increment { ptr::INC } else { ptr::UNCHANGED };
        let mut frame = vec![opcode::ST | ptr_field | data_size.field()];
        frame.extend(le_bytes(data, data_size.bytes()));
        let ack = self.link.transact(&frame, 1)?;
        if ack[0] != ACK {
            return Err(PhyError::MissingAck(ack[0]));
        }
        Ok(())
    }

    /// `ST(ptr_inc, size, data)` with no ACK expected, for use while
    /// `CTRLA.RSD=1` suppresses the target's per-byte reply (§4.2).
    fn st_no_ack(&mut self, data: u32, data_size: DataSize, post_increment: bool) -> Result<(), PhyError> {
        let ptr_field = if post_increment { ptr::INC } else { ptr::UNCHANGED };
        let mut frame = vec![opcode::ST | ptr_field | data_size.field()];
        frame.extend(le_bytes(data, data_size.bytes()));
        self.link.send_no_reply(&frame)?;
        Ok(())
    }

    /// `LD(ptr_inc, size)`: load a single unit of data through the
    /// pointer, optionally auto-incrementing it afterwards.
    pub fn ld(&mut self, data_size: DataSize, post_increment: bool) -> Result<u32, PhyError> {
        let ptr_field = if post_increment { ptr::INC } else { ptr::UNCHANGED };
        let reply = self
            .link
            .transact(&[opcode::LD | ptr_field | data_size.field()], data_size.bytes())?;
        Ok(from_le_bytes(&reply))
    }

    /// `REPEAT(n)`: the very next instruction executes `n + 1` times.
    /// Must be immediately followed by exactly one `LD`/`ST` (§4.2
    /// invariant: REPEAT does not compose).
    fn repeat(&mut self, count: RepeatCount) -> Result<(), PhyError> {
        let frame = match count {
            RepeatCount::Byte(n) => vec![opcode::REPEAT, n],
            RepeatCount::Word(n) => {
                let mut f = vec![opcode::REPEAT | 0x01];
                f.extend(n.to_le_bytes());
                f
            }
        };
        self.link.send_no_reply(&frame)?;
        Ok(())
    }

    /// Block write fast path (§4.2): `ST_PTR(addr)` + `REPEAT(n-1)` +
    /// `ST(PTR_INC, ...)`, transmitting `data.len() / unit` units
    /// back-to-back. `unit` is 1 or 2 bytes per the region's write
    /// granularity.
    pub fn block_write(
        &mut self,
        addr: u32,
        addr_size: AddressSize,
        data: &[u8],
        unit: DataSize,
    ) -> Result<(), PhyError> {
        let step = unit.bytes();
        assert_eq!(data.len() % step, 0, "block_write data not unit-aligned");
        let units = data.len() / step;
        if units == 0 {
            return Ok(());
        }
        self.st_ptr(addr, addr_size)?;
        if units > 1 {
            self.repeat(repeat_count_for(units - 1))?;
        }
        for chunk in data.chunks(step) {
            let value = from_le_bytes(chunk);
            self.st(value, unit, true)?;
        }
        Ok(())
    }

    /// Block write with the per-unit ACK suppressed (§4.2 "CTRLA.RSD=1").
    /// The pointer-set `ST_PTR` is still ACKed; only the data-streaming
    /// `ST`s that follow lose their reply, which is where the per-byte
    /// cost actually lives. The caller is responsible for setting and
    /// clearing `CTRLA.RSD` around this call and for verifying the result
    /// afterwards via NVM status rather than per-byte ACKs.
    pub fn block_write_no_ack(
        &mut self,
        addr: u32,
        addr_size: AddressSize,
        data: &[u8],
        unit: DataSize,
    ) -> Result<(), PhyError> {
        let step = unit.bytes();
        assert_eq!(data.len() % step, 0, "block_write data not unit-aligned");
        let units = data.len() / step;
        if units == 0 {
            return Ok(());
        }
        self.st_ptr(addr, addr_size)?;
        if units > 1 {
            self.repeat(repeat_count_for(units - 1))?;
        }
        for chunk in data.chunks(step) {
            let value = from_le_bytes(chunk);
            self.st_no_ack(value, unit, true)?;
        }
        Ok(())
    }

    /// Block read fast path: `ST_PTR(addr)` + `REPEAT(n-1)` +
    /// `LD(PTR_INC, ...)`.
    pub fn block_read(
        &mut self,
        addr: u32,
        addr_size: AddressSize,
        n_units: usize,
        unit: DataSize,
    ) -> Result<Vec<u8>, PhyError> {
        if n_units == 0 {
            return Ok(Vec::new());
        }
        self.st_ptr(addr, addr_size)?;
        if n_units > 1 {
            self.repeat(repeat_count_for(n_units - 1))?;
        }
        let mut out = Vec::with_capacity(n_units * unit.bytes());
        for _ in 0..n_units {
            let value = self.ld(unit, true)?;
            out.extend(le_bytes(value, unit.bytes()));
        }
        Ok(out)
    }
}

fn repeat_count_for(n_minus_one: usize) -> RepeatCount {
    if n_minus_one <= u8::MAX as usize {
        RepeatCount::Byte(n_minus_one as u8)
    } else {
        RepeatCount::Word(n_minus_one as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests::FakeSerialPort;
    use std::time::Duration;

    fn physical_with(mut port: FakeSerialPort, replies: &[u8]) -> Physical {
        port.queue_reply(replies);
        let link = Link::new(Box::new(port), 115_200, Duration::from_millis(50));
        Physical::new(link)
    }

    #[test]
    fn ldcs_round_trips_single_byte() {
        let mut phy = physical_with(FakeSerialPort::new(), &[0x51]);
        assert_eq!(phy.ldcs(0x00).unwrap(), 0x51);
    }

    #[test]
    fn sts_requires_ack_both_phases() {
        let mut phy = physical_with(FakeSerialPort::new(), &[ACK, ACK]);
        phy.sts(0x1000, AddressSize::Two, DataSize::One, 0xAA).unwrap();
    }

    #[test]
    fn sts_missing_ack_is_a_fault() {
        let mut phy = physical_with(FakeSerialPort::new(), &[0x00, ACK]);
        let err = phy.sts(0x1000, AddressSize::Two, DataSize::One, 0xAA).unwrap_err();
        assert!(matches!(err, PhyError::MissingAck(0x00)));
    }

    #[test]
    fn block_write_sends_one_ack_per_unit_plus_ptr_set() {
        // 1 ACK for ST_PTR, then one ACK per ST(PTR_INC, ...) of the 4 bytes.
        let mut phy = physical_with(FakeSerialPort::new(), &[ACK, ACK, ACK, ACK, ACK]);
        phy.block_write(0x1400, AddressSize::Two, &[1, 2, 3, 4], DataSize::One)
            .unwrap();
    }

    #[test]
    fn block_write_no_ack_only_acks_the_pointer_set() {
        // 1 ACK for ST_PTR; the 4 data-streaming STs get no reply at all
        // under RSD suppression.
        let mut phy = physical_with(FakeSerialPort::new(), &[ACK]);
        phy.block_write_no_ack(0x1400, AddressSize::Two, &[1, 2, 3, 4], DataSize::One)
            .unwrap();
    }

    #[test]
    fn block_read_returns_requested_bytes() {
        let mut phy = physical_with(FakeSerialPort::new(), &[ACK, 0x11, 0x22, 0x33]);
        let data = phy.block_read(0x1400, AddressSize::Two, 3, DataSize::One).unwrap();
        assert_eq!(data, vec![0x11, 0x22, 0x33]);
    }

    #[test]
    fn key_is_sent_reversed() {
        let mut phy = physical_with(FakeSerialPort::new(), &[]);
        phy.key(b"NVMProg ").unwrap();
    }
}
