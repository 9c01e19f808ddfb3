use lewalk_dump::{AddrMode, AddressSpace, ReadError};
use lewalk_mvs::ThreadControlBlock;

use crate::layout::{self, CaaLayout};
use crate::StackFormat;

/// Eyecatcher of a thread value block, "TVB " in EBCDIC.
const TVB_EYE: u32 = 0xE3E5_C240;

/// Eyecatcher of the key data block, "KDB " in EBCDIC.
const KDB_EYE: u32 = 0xD2C4_C240;

/// The LE view of one dumped thread, anchored at its common anchor area
/// (CAA).
///
/// The CAA is the root of every other LE structure for a thread; for
/// programs written in C this is the most useful thread view because it
/// leads to the C stack. Not every TCB has one — system tasks and threads
/// that died before LE initialization do not — so construction goes through
/// [`Caa::locate`], which tries the discovery chains in order and reports
/// `None` when all of them miss.
///
/// A `Caa` is immutable once located. It caches the fields that every later
/// stage needs: the addressing mode that validated, the CEL level, the stack
/// direction, the dummy-frame address marking the bottom of the stack, and
/// (in 64-bit mode) the library anchor the discovery chain ran through.
#[derive(Clone, Debug)]
pub struct Caa {
    address: u64,
    mode: AddrMode,
    layout: &'static CaaLayout,
    level: u32,
    stack_direction: StackFormat,
    dummy_frame: u64,
    laa: Option<u64>,
}

impl Caa {
    /// Locates the CAA of the thread owning `tcb`.
    ///
    /// Three strategies run in order: the 32-bit CEL anchor chain, the
    /// 64-bit library anchor chain, and a last-ditch read of the legacy CAA
    /// pointer in the TCB itself. Each probes the image under its own
    /// addressing-mode assumption, so a failed attempt leaves nothing
    /// behind for the next one. A candidate only survives if the CAA
    /// eyecatcher validates at the fixed negative offsets.
    ///
    /// Returns `None` if the thread has no LE context; callers skip such
    /// threads.
    #[tracing::instrument(level = "trace", name = "Caa::locate", skip_all)]
    pub fn locate<T: ThreadControlBlock + ?Sized>(space: &AddressSpace, tcb: &T) -> Option<Caa> {
        if let Some(address) = Caa::locate_32(space, tcb) {
            return Caa::finish(space, address, AddrMode::Bits32, None);
        }
        if let Some((address, laa)) = Caa::locate_64(space, tcb) {
            return Caa::finish(space, address, AddrMode::Bits64, Some(laa));
        }
        if let Some(address) = Caa::locate_32_last_ditch(space, tcb) {
            tracing::debug!(tcb = tcb.address(), "CAA found by last-ditch probe");
            return Caa::finish(space, address, AddrMode::Bits32, None);
        }
        tracing::trace!(tcb = tcb.address(), "no CAA for this TCB");
        None
    }

    /// Locates the CAAs of all the given threads, silently dropping threads
    /// without one.
    pub fn locate_all<T: ThreadControlBlock>(space: &AddressSpace, tcbs: &[T]) -> Vec<Caa> {
        tcbs.iter().filter_map(|tcb| Caa::locate(space, tcb)).collect()
    }

    /// The 32-bit discovery chain: TCBCELAP → CEL anchor → CAA slot.
    fn locate_32<T: ThreadControlBlock + ?Sized>(space: &AddressSpace, tcb: &T) -> Option<u64> {
        let celap = tcb.celap().ok()?;
        let celap0 = u64::from(space.read_u32(celap).ok()?);
        if celap0 == 0 {
            return None;
        }
        let address = u64::from(space.read_u32(celap0 + 0x20).ok()?);
        Caa::validate(space, address).then_some(address)
    }

    /// The 64-bit discovery chain: STCB → library anchor → library control
    /// area → CAA.
    fn locate_64<T: ThreadControlBlock + ?Sized>(
        space: &AddressSpace,
        tcb: &T,
    ) -> Option<(u64, u64)> {
        let stcb = tcb.stcb().ok()?;
        let laa = space.read_u64(stcb + layout::STCB_LAA).ok()?;
        let lca = space.read_u64(laa + layout::laa::LCA).ok()?;
        let address = space.read_u64(lca + layout::lca::CAA).ok()?;
        Caa::validate(space, address).then_some((address, laa))
    }

    /// Last ditch: the legacy CAA pointer at a fixed offset in the TCB.
    /// There is no validation here beyond the eyecatcher check.
    fn locate_32_last_ditch<T: ThreadControlBlock + ?Sized>(
        space: &AddressSpace,
        tcb: &T,
    ) -> Option<u64> {
        let address = u64::from(space.read_u32(tcb.address() + layout::TCB_CAA_PTR).ok()?);
        if address == 0 {
            return None;
        }
        Caa::validate(space, address).then_some(address)
    }

    /// Checks the "CEECAA" eyecatcher preceding a real CAA.
    fn validate(space: &AddressSpace, address: u64) -> bool {
        let eye1 = match space.read_u32(address.wrapping_sub(0x18)) {
            Ok(word) => word,
            Err(_) => return false,
        };
        let eye2 = match space.read_u32(address.wrapping_sub(0x14)) {
            Ok(word) => word & 0xFFFF_0000,
            Err(_) => return false,
        };
        eye1 == layout::CAA_EYE1 && eye2 == layout::CAA_EYE2
    }

    fn finish(space: &AddressSpace, address: u64, mode: AddrMode, laa: Option<u64>) -> Option<Caa> {
        let lay = layout::caa_layout(mode, space.product_release());
        let level = space.read_u32(address + lay.level).ok()?;
        let stack_direction = if mode.is_64bit() {
            // 64-bit LE only has the down stack.
            StackFormat::Down
        } else if level >= 13 {
            // The direction flag is only valid from level 13 on.
            match space.read_u8(address + lay.stack_direction).ok()? {
                0 => StackFormat::Up,
                _ => StackFormat::Down,
            }
        } else {
            StackFormat::Up
        };
        let dummy_frame = mode.strip(space.read_word(mode, address + lay.ddsa).ok()?);
        tracing::debug!(
            caa = address,
            %mode,
            level,
            direction = %stack_direction,
            "located CAA"
        );
        Some(Caa {
            address,
            mode,
            layout: lay,
            level,
            stack_direction,
            dummy_frame,
            laa,
        })
    }

    /// The address of the CAA.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// The addressing mode the CAA validated under.
    pub fn mode(&self) -> AddrMode {
        self.mode
    }

    /// The CEL level identifier.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// The direction of this thread's stack.
    pub fn stack_direction(&self) -> StackFormat {
        self.stack_direction
    }

    /// The address of the dummy frame marking the bottom of the stack.
    pub fn dummy_frame(&self) -> u64 {
        self.dummy_frame
    }

    /// The library anchor area discovered alongside a 64-bit CAA.
    pub fn laa(&self) -> Option<u64> {
        self.laa
    }

    /// The enclave data block this thread belongs to.
    pub fn edb(&self, space: &AddressSpace) -> Result<Edb, ReadError> {
        let address = space.read_word(self.mode, self.address + self.layout.edb)?;
        Ok(Edb::new(self.mode.strip(address), self.mode))
    }

    /// The region control block address.
    pub fn rcb(&self, space: &AddressSpace) -> Result<u64, ReadError> {
        Ok(self
            .mode
            .strip(space.read_word(self.mode, self.address + self.layout.rcb)?))
    }

    /// The error-handling control block (HCOM) address.
    pub fn errcm(&self, space: &AddressSpace) -> Result<u64, ReadError> {
        Ok(self
            .mode
            .strip(space.read_word(self.mode, self.address + self.layout.errcm)?))
    }

    /// The storage manager control block address.
    pub fn smcb(&self, space: &AddressSpace) -> Result<u64, ReadError> {
        Ok(self
            .mode
            .strip(space.read_word(self.mode, self.address + self.layout.smcb)?))
    }

    /// The thread value block anchor.
    pub fn vba(&self, space: &AddressSpace) -> Result<u64, ReadError> {
        Ok(self
            .mode
            .strip(space.read_word(self.mode, self.address + self.layout.vba)?))
    }

    /// The pthread id of this thread, the doubleword handed back by
    /// `pthread_create`.
    pub fn pthread_id(&self, space: &AddressSpace) -> Result<u64, ReadError> {
        space.read_u64(self.address + self.layout.thdid)
    }

    /// Looks up the thread-specific value stored under `key`, as
    /// `pthread_getspecific` would have returned it in the running process.
    ///
    /// Returns zero when no value was set for the key, mirroring the
    /// runtime's behavior.
    pub fn pthread_getspecific(&self, space: &AddressSpace, key: u64) -> Result<u64, ReadError> {
        let vba = self.vba(space)?;
        if vba == 0 {
            tracing::trace!(caa = self.address, "thread value anchor is zero");
            return Ok(0);
        }
        let eye = match space.read_u32(vba) {
            Ok(eye) => eye,
            Err(_) => {
                tracing::debug!(vba, "unreadable thread value anchor");
                return Ok(0);
            }
        };
        let word = self.mode.word_len();
        if eye == TVB_EYE {
            // Hashed key data block layout.
            let dba = self.edb(space)?.dba(space)?;
            if space.read_u32(dba)? != KDB_EYE {
                tracing::debug!(dba, "key data block eyecatcher mismatch");
                return Ok(0);
            }
            let base = space.read_word(self.mode, dba + 8)?;
            let key_index = (key as i64).wrapping_sub(base as i64) / 16;
            let bucket_number = key_index / 32;
            let bucket_index = key_index % 32;
            if !(0..32).contains(&bucket_number) {
                return Ok(0);
            }
            let bucket = space.read_word(self.mode, vba + word + bucket_number as u64 * word)?;
            if bucket == 0 {
                return Ok(0);
            }
            return space.read_word(self.mode, bucket + word + bucket_index as u64 * word);
        }
        // Flat key/value list.
        let count = space.read_u32(vba + 8)?;
        let mut entry = vba + if self.mode.is_64bit() { 16 } else { 12 };
        for _ in 0..count {
            if space.read_word(self.mode, entry)? == key {
                return space.read_word(self.mode, entry + word);
            }
            entry += 2 * word;
        }
        Ok(0)
    }
}

/// Builds a `Caa` without going through discovery, for tests that only need
/// its cached fields.
#[cfg(test)]
pub(crate) fn test_stub(
    address: u64,
    mode: AddrMode,
    stack_direction: StackFormat,
    dummy_frame: u64,
    laa: Option<u64>,
) -> Caa {
    Caa {
        address,
        mode,
        layout: layout::caa_layout(mode, None),
        level: 13,
        stack_direction,
        dummy_frame,
        laa,
    }
}

/// The enclave data block, shared by every thread of one enclave.
///
/// Only the fields the traceback needs are surfaced here.
#[derive(Clone, Copy, Debug)]
pub struct Edb {
    address: u64,
    mode: AddrMode,
}

impl Edb {
    /// Creates a view of the EDB at `address`.
    pub fn new(address: u64, mode: AddrMode) -> Edb {
        Edb { address, mode }
    }

    /// The address of the EDB.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Entry point of the up-stack signal glue routine.
    pub fn ceeosigr(&self, space: &AddressSpace) -> Result<u64, ReadError> {
        let lay = layout::edb(self.mode);
        Ok(self
            .mode
            .strip(space.read_word(self.mode, self.address + lay.ceeosigr)?))
    }

    /// The key data block anchor.
    pub fn dba(&self, space: &AddressSpace) -> Result<u64, ReadError> {
        let lay = layout::edb(self.mode);
        Ok(self
            .mode
            .strip(space.read_word(self.mode, self.address + lay.dba)?))
    }
}
