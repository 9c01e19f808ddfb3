use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::ebcdic;

/// The longest string a null-terminated read will scan for before giving up.
const MAX_CSTR_LEN: u64 = 256;

/// The longest plausible length prefix of an in-dump name string.
const MAX_STRING_LEN: u16 = 1000;

/// The addressing mode of a pointer read from the dump.
///
/// z/OS runs 31-bit and 64-bit code side by side, sometimes in the same
/// process, so the mode is a property of each individual read rather than of
/// the [`AddressSpace`]. Callers thread the mode through explicitly; a probe
/// performed under one assumption leaves no trace for the next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum AddrMode {
    /// 32-bit words holding 31-bit addresses.
    Bits32,
    /// 64-bit words holding 64-bit addresses.
    Bits64,
}

impl AddrMode {
    /// The width of a pointer in this mode, in bytes.
    pub fn word_len(self) -> u64 {
        match self {
            AddrMode::Bits32 => 4,
            AddrMode::Bits64 => 8,
        }
    }

    /// Returns true for [`AddrMode::Bits64`].
    pub fn is_64bit(self) -> bool {
        self == AddrMode::Bits64
    }

    /// Strips the high-order bit from a 31-bit address.
    ///
    /// In 32-bit mode the top bit of an address word is the AMODE flag, not
    /// part of the address. 64-bit addresses pass through unchanged.
    pub fn strip(self, address: u64) -> u64 {
        match self {
            AddrMode::Bits32 => address & 0x7FFF_FFFF,
            AddrMode::Bits64 => address,
        }
    }
}

impl fmt::Display for AddrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrMode::Bits32 => write!(f, "32-bit"),
            AddrMode::Bits64 => write!(f, "64-bit"),
        }
    }
}

/// An error reading from an [`AddressSpace`].
///
/// The dump did not capture the requested range, or the range straddles a
/// hole. This is an entirely ordinary condition during analysis: candidate
/// pointers routinely turn out to be garbage, and rejecting them starts with
/// a read that fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("cannot read {len} bytes at {address:#x}")]
pub struct ReadError {
    /// The address of the failed read.
    pub address: u64,
    /// The number of bytes requested.
    pub len: u64,
}

/// One contiguous range of captured storage.
#[derive(Clone, Debug)]
pub struct Segment {
    base: u64,
    bytes: Vec<u8>,
}

impl Segment {
    /// The first address covered by this segment.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// The captured bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A read-only view of the dumped storage of one address space.
///
/// The view is assembled from non-overlapping [`Segment`]s by whatever loads
/// the dump container; this crate does not care where the bytes came from.
/// Besides the bytes it carries the address-space id, the product release of
/// the runtime that produced the dump (when the container records one), and
/// an address-keyed memoization cache for resolved routine names.
///
/// All reads are big-endian. The view is immutable once analysis starts;
/// the name cache uses interior mutability and is safe because analysis is
/// single-threaded by design.
#[derive(Debug, Default)]
pub struct AddressSpace {
    segments: Vec<Segment>,
    asid: u16,
    product_release: Option<u32>,
    name_cache: RefCell<BTreeMap<u64, Option<String>>>,
}

impl AddressSpace {
    /// Creates an empty address space.
    pub fn new() -> AddressSpace {
        AddressSpace::default()
    }

    /// Adds a segment of captured storage.
    ///
    /// Segments must not overlap; a read consults the segment whose base is
    /// closest below the requested address. Empty segments are ignored.
    pub fn map(&mut self, base: u64, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let at = self.segments.partition_point(|s| s.base < base);
        self.segments.insert(at, Segment { base, bytes });
    }

    /// Sets the address-space id (ASID) this view belongs to.
    pub fn set_asid(&mut self, asid: u16) {
        self.asid = asid;
    }

    /// The address-space id (ASID) this view belongs to.
    pub fn asid(&self) -> u16 {
        self.asid
    }

    /// Records the product release of the runtime that produced the dump.
    pub fn set_product_release(&mut self, release: u32) {
        self.product_release = Some(release);
    }

    /// The product release of the runtime, if the dump recorded one.
    pub fn product_release(&self) -> Option<u32> {
        self.product_release
    }

    fn slice(&self, address: u64, len: u64) -> Result<&[u8], ReadError> {
        let err = ReadError { address, len };
        let idx = self
            .segments
            .partition_point(|s| s.base <= address)
            .checked_sub(1)
            .ok_or(err)?;
        let seg = &self.segments[idx];
        let start = address - seg.base;
        let end = start.checked_add(len).ok_or(err)?;
        if end > seg.bytes.len() as u64 {
            return Err(err);
        }
        Ok(&seg.bytes[start as usize..end as usize])
    }

    /// Reads an unsigned byte.
    pub fn read_u8(&self, address: u64) -> Result<u8, ReadError> {
        Ok(self.slice(address, 1)?[0])
    }

    /// Reads a signed byte.
    pub fn read_i8(&self, address: u64) -> Result<i8, ReadError> {
        Ok(self.read_u8(address)? as i8)
    }

    /// Reads a big-endian unsigned halfword.
    pub fn read_u16(&self, address: u64) -> Result<u16, ReadError> {
        let bytes = self.slice(address, 2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Reads a big-endian signed halfword.
    pub fn read_i16(&self, address: u64) -> Result<i16, ReadError> {
        Ok(self.read_u16(address)? as i16)
    }

    /// Reads a big-endian unsigned fullword.
    pub fn read_u32(&self, address: u64) -> Result<u32, ReadError> {
        let bytes = self.slice(address, 4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a big-endian signed fullword.
    pub fn read_i32(&self, address: u64) -> Result<i32, ReadError> {
        Ok(self.read_u32(address)? as i32)
    }

    /// Reads a big-endian unsigned doubleword.
    pub fn read_u64(&self, address: u64) -> Result<u64, ReadError> {
        let bytes = self.slice(address, 8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(out))
    }

    /// Reads a big-endian signed doubleword.
    pub fn read_i64(&self, address: u64) -> Result<i64, ReadError> {
        Ok(self.read_u64(address)? as i64)
    }

    /// Reads a pointer-sized word in the given addressing mode.
    ///
    /// The value is widened to `u64` but not stripped of its AMODE bit; see
    /// [`AddrMode::strip`].
    pub fn read_word(&self, mode: AddrMode, address: u64) -> Result<u64, ReadError> {
        match mode {
            AddrMode::Bits32 => Ok(u64::from(self.read_u32(address)?)),
            AddrMode::Bits64 => self.read_u64(address),
        }
    }

    /// Reads a fixed-length EBCDIC string.
    pub fn read_ebcdic(&self, address: u64, len: u64) -> Result<String, ReadError> {
        Ok(ebcdic::decode(self.slice(address, len)?))
    }

    /// Reads a halfword-length-prefixed EBCDIC string.
    ///
    /// This is the layout LE uses for routine names in its metadata blocks.
    /// Implausible lengths (zero, or longer than any real routine name) are
    /// rejected as a read failure since they invariably mean the pointer was
    /// garbage.
    pub fn read_ebcdic_string(&self, address: u64) -> Result<String, ReadError> {
        let len = self.read_u16(address)?;
        if len == 0 || len > MAX_STRING_LEN {
            return Err(ReadError { address, len: 2 });
        }
        self.read_ebcdic(address + 2, u64::from(len))
    }

    /// Reads a null-terminated EBCDIC string, scanning at most 256 bytes.
    pub fn read_ebcdic_cstr(&self, address: u64) -> Result<String, ReadError> {
        for len in 0..MAX_CSTR_LEN {
            if self.read_u8(address + len)? == 0 {
                return self.read_ebcdic(address, len);
            }
        }
        Err(ReadError {
            address,
            len: MAX_CSTR_LEN,
        })
    }

    /// Looks up a previously cached name for the given address.
    ///
    /// The outer `Option` distinguishes "never resolved" from a cached
    /// negative result.
    pub fn cached_name(&self, address: u64) -> Option<Option<String>> {
        self.name_cache.borrow().get(&address).cloned()
    }

    /// Memoizes the resolved name (or the lack of one) for an address.
    pub fn cache_name(&self, address: u64, name: Option<String>) {
        self.name_cache.borrow_mut().insert(address, name);
    }
}
