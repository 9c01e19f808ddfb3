use lewalk_dump::{AddressSpace, ReadError};

use crate::{LinkageStackEntry, RegisterSet};

/// Offset of the thread completion code.
const TCBCMP: u64 = 0x10;

/// Offset of the saved general registers.
const TCBGRS: u64 = 0x80;

/// Offset of the extended-TCB pointer.
const TCBSTCB: u64 = 0x138;

/// Offset of the recovery/termination work area pointer.
const TCBRTWA: u64 = 0xE0;

/// Offset of the CEL anchor pointer.
const TCBCELAP: u64 = 0x2F4;

/// Accessors over one native MVS thread record.
///
/// The TCB itself is a fixed structure in the dump, but much of what
/// analysis needs for a thread — the kernel's register-capture result, the
/// linkage stack extracted from its segments, the user save area — lives in
/// container-specific records only the dump loader knows how to find. This
/// trait is the seam: the loader implements it once per container format,
/// and everything above consumes threads through it.
pub trait ThreadControlBlock {
    /// The address of the TCB in the dumped address space.
    fn address(&self) -> u64;

    /// The CEL anchor pointer (TCBCELAP), the root of the 32-bit runtime
    /// anchor chain.
    fn celap(&self) -> Result<u64, ReadError>;

    /// The extended-TCB pointer (TCBSTCB), the root of the 64-bit runtime
    /// anchor chain.
    fn stcb(&self) -> Result<u64, ReadError>;

    /// The recovery/termination work area pointer (TCBRTWA), nonzero only
    /// for a thread that abended.
    fn rtwa(&self) -> Result<u64, ReadError>;

    /// The thread completion code; nonzero means the thread failed.
    fn completion_code(&self) -> Result<u32, ReadError>;

    /// The register snapshot produced by the kernel's register-capture
    /// service for this thread, if the dump carries one.
    fn kernel_registers(&self) -> Option<RegisterSet>;

    /// The registers saved in the TCB itself.
    fn saved_registers(&self) -> Option<RegisterSet>;

    /// The registers recorded in the thread's user save area, if the dump
    /// carries them. A last-ditch source; callers treat these with
    /// suspicion.
    fn usta_registers(&self) -> Option<RegisterSet>;

    /// The thread's hardware linkage stack entries, oldest first.
    fn linkage_stack(&self) -> Result<Vec<LinkageStackEntry>, ReadError>;
}

/// A [`ThreadControlBlock`] reading the fixed TCB fields straight out of the
/// address space.
///
/// Covers the accessors that are plain storage reads. The container-specific
/// ones (kernel captures, linkage stack, user save area) report nothing;
/// loaders that carry those records wrap or replace this type.
#[derive(Clone, Copy, Debug)]
pub struct DumpTcb<'a> {
    space: &'a AddressSpace,
    address: u64,
}

impl<'a> DumpTcb<'a> {
    /// Creates a view of the TCB at `address`.
    pub fn new(space: &'a AddressSpace, address: u64) -> DumpTcb<'a> {
        DumpTcb { space, address }
    }
}

impl ThreadControlBlock for DumpTcb<'_> {
    fn address(&self) -> u64 {
        self.address
    }

    fn celap(&self) -> Result<u64, ReadError> {
        Ok(u64::from(self.space.read_u32(self.address + TCBCELAP)?))
    }

    fn stcb(&self) -> Result<u64, ReadError> {
        Ok(u64::from(self.space.read_u32(self.address + TCBSTCB)?))
    }

    fn rtwa(&self) -> Result<u64, ReadError> {
        Ok(u64::from(self.space.read_u32(self.address + TCBRTWA)?))
    }

    fn completion_code(&self) -> Result<u32, ReadError> {
        self.space.read_u32(self.address + TCBCMP)
    }

    fn kernel_registers(&self) -> Option<RegisterSet> {
        None
    }

    fn saved_registers(&self) -> Option<RegisterSet> {
        let mut regs = RegisterSet::new();
        for r in 0..16 {
            let value = self.space.read_u32(self.address + TCBGRS + r as u64 * 4).ok()?;
            regs.set_gpr(r, u64::from(value));
        }
        Some(regs)
    }

    fn usta_registers(&self) -> Option<RegisterSet> {
        None
    }

    fn linkage_stack(&self) -> Result<Vec<LinkageStackEntry>, ReadError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fixed_fields() {
        let mut space = AddressSpace::new();
        let mut bytes = vec![0u8; 0x400];
        bytes[TCBCMP as usize..TCBCMP as usize + 4].copy_from_slice(&0x940C_4000u32.to_be_bytes());
        bytes[TCBCELAP as usize..TCBCELAP as usize + 4].copy_from_slice(&0x0002_3400u32.to_be_bytes());
        bytes[TCBGRS as usize + 13 * 4..TCBGRS as usize + 13 * 4 + 4]
            .copy_from_slice(&0x0004_5000u32.to_be_bytes());
        space.map(0x9000, bytes);

        let tcb = DumpTcb::new(&space, 0x9000);
        assert_eq!(tcb.completion_code().unwrap(), 0x940C_4000);
        assert_eq!(tcb.celap().unwrap(), 0x0002_3400);
        let regs = tcb.saved_registers().unwrap();
        assert_eq!(regs.gpr(13), 0x0004_5000);
        assert!(tcb.kernel_registers().is_none());
    }
}
