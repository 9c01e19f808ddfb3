//! Shared scaffolding for building synthetic dumps.
#![allow(dead_code)]

use lewalk_dump::{ebcdic, AddressSpace, ReadError};
use lewalk_mvs::{LinkageStackEntry, RegisterSet, ThreadControlBlock};
use lewalk_stack::layout;

/// Assembles an [`AddressSpace`] from writable scratch segments.
pub struct SpaceBuilder {
    segments: Vec<(u64, Vec<u8>)>,
    asid: u16,
    release: Option<u32>,
}

impl SpaceBuilder {
    pub fn new() -> SpaceBuilder {
        SpaceBuilder {
            segments: Vec::new(),
            asid: 1,
            release: None,
        }
    }

    pub fn asid(&mut self, asid: u16) -> &mut Self {
        self.asid = asid;
        self
    }

    pub fn release(&mut self, release: u32) -> &mut Self {
        self.release = Some(release);
        self
    }

    pub fn segment(&mut self, base: u64, len: usize) -> &mut Self {
        self.segments.push((base, vec![0u8; len]));
        self
    }

    fn chunk(&mut self, address: u64, len: usize) -> &mut [u8] {
        for (base, bytes) in &mut self.segments {
            if address >= *base && address + len as u64 <= *base + bytes.len() as u64 {
                let start = (address - *base) as usize;
                return &mut bytes[start..start + len];
            }
        }
        panic!("no scratch segment covers {address:#x}");
    }

    pub fn u8(&mut self, address: u64, value: u8) -> &mut Self {
        self.chunk(address, 1)[0] = value;
        self
    }

    pub fn u32(&mut self, address: u64, value: u32) -> &mut Self {
        self.chunk(address, 4).copy_from_slice(&value.to_be_bytes());
        self
    }

    pub fn u64(&mut self, address: u64, value: u64) -> &mut Self {
        self.chunk(address, 8).copy_from_slice(&value.to_be_bytes());
        self
    }

    /// Writes a halfword-length-prefixed EBCDIC string.
    pub fn name(&mut self, address: u64, text: &str) -> &mut Self {
        let encoded = ebcdic::encode(text);
        self.chunk(address, 2)
            .copy_from_slice(&(encoded.len() as u16).to_be_bytes());
        self.chunk(address + 2, encoded.len()).copy_from_slice(&encoded);
        self
    }

    pub fn build(&mut self) -> AddressSpace {
        let mut space = AddressSpace::new();
        space.set_asid(self.asid);
        if let Some(release) = self.release {
            space.set_product_release(release);
        }
        for (base, bytes) in self.segments.drain(..) {
            space.map(base, bytes);
        }
        space
    }
}

/// Writes a 32-bit CAA with a valid eyecatcher and the fields the walk
/// consults.
pub fn write_caa32(
    b: &mut SpaceBuilder,
    address: u64,
    level: u32,
    direction: u8,
    ddsa: u32,
) {
    let lay = &layout::CAA_32;
    b.u32(address - 0x18, layout::CAA_EYE1);
    b.u32(address - 0x14, layout::CAA_EYE2);
    b.u32(address + lay.level, level);
    b.u8(address + lay.stack_direction, direction);
    b.u32(address + lay.ddsa, ddsa);
}

/// Writes an XPLINK function skeleton: entry prefix, PPA1, and name. The
/// PPA1 sits `ppa1_off` bytes past the prefix with no optional areas, so
/// the name follows the fixed header directly.
pub fn write_xplink_function(
    b: &mut SpaceBuilder,
    entry: u64,
    frame_size: u32,
    ppa1_off: u32,
    name: &str,
) {
    let prefix = entry - layout::hepv::ENTRY_POINT;
    b.u64(prefix + layout::hepv::EYECATCH, layout::ENTRY_EYECATCHER);
    b.u32(prefix + layout::hepv::PPA1_OFFSET, ppa1_off);
    b.u32(prefix + layout::hepv::FRAME_SIZE, frame_size);
    let ppa1 = prefix + u64::from(ppa1_off);
    b.name(ppa1 + layout::ppa1h::LEN, name);
}

/// A scriptable [`ThreadControlBlock`].
pub struct MockTcb {
    pub address: u64,
    pub celap: Option<u64>,
    pub stcb: Option<u64>,
    pub rtwa: Option<u64>,
    pub completion: u32,
    pub kernel: Option<RegisterSet>,
    pub saved: Option<RegisterSet>,
    pub usta: Option<RegisterSet>,
    pub linkage: Vec<LinkageStackEntry>,
}

impl MockTcb {
    pub fn at(address: u64) -> MockTcb {
        MockTcb {
            address,
            celap: None,
            stcb: None,
            rtwa: None,
            completion: 0,
            kernel: None,
            saved: None,
            usta: None,
            linkage: Vec::new(),
        }
    }
}

fn unread(address: u64) -> ReadError {
    ReadError { address, len: 4 }
}

impl ThreadControlBlock for MockTcb {
    fn address(&self) -> u64 {
        self.address
    }

    fn celap(&self) -> Result<u64, ReadError> {
        self.celap.ok_or(unread(self.address))
    }

    fn stcb(&self) -> Result<u64, ReadError> {
        self.stcb.ok_or(unread(self.address))
    }

    fn rtwa(&self) -> Result<u64, ReadError> {
        self.rtwa.ok_or(unread(self.address))
    }

    fn completion_code(&self) -> Result<u32, ReadError> {
        Ok(self.completion)
    }

    fn kernel_registers(&self) -> Option<RegisterSet> {
        self.kernel.clone()
    }

    fn saved_registers(&self) -> Option<RegisterSet> {
        self.saved.clone()
    }

    fn usta_registers(&self) -> Option<RegisterSet> {
        self.usta.clone()
    }

    fn linkage_stack(&self) -> Result<Vec<LinkageStackEntry>, ReadError> {
        Ok(self.linkage.clone())
    }
}

/// Builds a z/Architecture linkage stack entry with the given registers.
pub fn z_linkage_entry(pasn: u16, entry_type: u8, regs: &[(usize, u64)]) -> LinkageStackEntry {
    let mut raw = vec![0u8; 0xA8];
    raw[0] = 0x80;
    raw[1] = entry_type;
    raw[6..8].copy_from_slice(&pasn.to_be_bytes());
    for &(r, value) in regs {
        let at = 0x28 + r * 8;
        raw[at..at + 8].copy_from_slice(&value.to_be_bytes());
    }
    LinkageStackEntry::new(raw).expect("entry too short")
}
