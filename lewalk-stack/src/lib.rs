//! Reconstruction of native Language Environment call stacks from z/OS
//! process dumps.
//!
//! This crate answers "what was this native thread doing?" for a process
//! that is no longer running. Given a dumped [`AddressSpace`] and a thread's
//! control block, it locates the thread's LE anchor structure, hunts down a
//! register snapshot it can trust, and walks the native call-frame chain
//! backward to produce a [`Backtrace`] — entry points, routine names, and
//! call sites, as far as the dump allows.
//!
//! # Background
//!
//! Nothing in a dump cooperates. The thread may have died violently, the
//! registers recorded for it may describe some system routine rather than
//! the application, frame chains routinely run through storage the dump did
//! not capture, and corrupted chains can be cyclic. On top of that, two
//! incompatible calling conventions coexist in one process: the classic
//! "up" convention chaining save areas from low to high addresses, and the
//! XPLINK "down" convention growing the stack the other way, with explicit
//! transition frames wherever a call crosses between them.
//!
//! Reconstruction is therefore a pipeline of heuristics, each prepared to be
//! wrong:
//!
//! 1. [`Caa::locate`] finds the per-thread LE anchor (the CAA) by trying
//!    three discovery chains in order, validating each candidate against the
//!    eyecatcher that precedes a real CAA.
//! 2. [`resolve_registers`] tries up to six places where trustworthy
//!    registers might have been captured, validating each candidate frame
//!    pointer by walking its chain all the way to the thread's dummy frame
//!    ([`validate_candidate`]), with tortoise-and-hare loop detection so a
//!    corrupted chain cannot hang the analysis.
//! 3. [`Backtrace::reconstruct`] then builds one [`StackFrame`] per level,
//!    recovering each routine's entry point and name from its metadata
//!    blocks and the exact call site from the caller's saved state.
//!
//! A thread whose stack cannot be reconstructed is reported as having no
//! stack, never as an error; a chain that breaks partway yields a
//! truncated backtrace ending at the last frame that made sense.
//!
//! # Example
//!
//! ```
//! use lewalk_dump::AddressSpace;
//! use lewalk_mvs::DumpTcb;
//! use lewalk_stack::backtrace;
//!
//! # fn scan(space: &AddressSpace, tcb_addrs: &[u64]) -> Result<(), lewalk_stack::TraceError> {
//! for &addr in tcb_addrs {
//!     let tcb = DumpTcb::new(space, addr);
//!     match backtrace(space, &tcb)? {
//!         Some(trace) => {
//!             for frame in trace.frames() {
//!                 println!("{:#x} {}", frame.entry_point(), frame.name().unwrap_or("(unknown)"));
//!             }
//!         }
//!         None => println!("no stack available"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

use std::error::Error;
use std::fmt;

use thiserror::Error;

use lewalk_dump::{AddressSpace, ReadError};
use lewalk_mvs::ThreadControlBlock;

mod caa;
mod chain;
mod frame;
pub mod layout;
mod registers;
mod validate;
mod walk;

pub use caa::{Caa, Edb};
pub use chain::{entry_point_from_call_site, previous_frame};
pub use frame::{entry_point_name, StackFrame};
pub use registers::{resolve_registers, RegisterSource, ResolvedRegisters};
pub use validate::{validate_candidate, StackBounds, Validation};
pub use walk::{Backtrace, MAX_FRAMES};

/// The two native calling conventions, named for the direction their stacks
/// grow.
///
/// The value doubles as the stack direction recorded in the CAA. The two
/// conventions use incompatible frame layouts and backward-chaining rules; a
/// call crossing between them leaves a transition record behind, and the
/// crossing itself is a property of the link between two frames, not of
/// either frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum StackFormat {
    /// The classic save-area convention; the stack grows toward higher
    /// addresses.
    Up,
    /// The XPLINK convention; the stack grows toward lower addresses.
    Down,
}

impl StackFormat {
    /// Returns the name of the format.
    pub fn name(self) -> &'static str {
        match self {
            StackFormat::Up => "up",
            StackFormat::Down => "down",
        }
    }
}

impl fmt::Display for StackFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The error kind for [`TraceError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceErrorKind {
    /// A read against the memory image failed while building a frame.
    Read,
    /// The traceback reached a state the algorithm defines but does not
    /// handle.
    UnimplementedBranch,
}

impl fmt::Display for TraceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "failed to read from the address space"),
            Self::UnimplementedBranch => write!(f, "unhandled traceback state"),
        }
    }
}

/// An error produced while building a [`StackFrame`].
///
/// Read failures are recoverable — the walk simply ends at the previous
/// frame. An unimplemented branch is a loud, distinguishable condition so
/// the caller can decide whether to skip the thread or abort the scan; it is
/// never silently turned into wrong output.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct TraceError {
    kind: TraceErrorKind,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl TraceError {
    pub(crate) fn unimplemented(detail: &'static str) -> Self {
        Self {
            kind: TraceErrorKind::UnimplementedBranch,
            source: Some(detail.into()),
        }
    }

    /// Returns the corresponding [`TraceErrorKind`] for this error.
    pub fn kind(&self) -> TraceErrorKind {
        self.kind
    }
}

impl From<TraceErrorKind> for TraceError {
    fn from(kind: TraceErrorKind) -> Self {
        Self { kind, source: None }
    }
}

impl From<ReadError> for TraceError {
    fn from(e: ReadError) -> Self {
        Self {
            kind: TraceErrorKind::Read,
            source: Some(Box::new(e)),
        }
    }
}

/// Reconstructs the native stack of one thread, end to end.
///
/// Convenience wrapper running [`Caa::locate`] and
/// [`Backtrace::reconstruct`]. Returns `Ok(None)` when the thread has no LE
/// context or no trustworthy register snapshot; both mean "no stack
/// available" and the caller moves on to the next thread.
pub fn backtrace<T: ThreadControlBlock + ?Sized>(
    space: &AddressSpace,
    tcb: &T,
) -> Result<Option<Backtrace>, TraceError> {
    match Caa::locate(space, tcb) {
        Some(caa) => Backtrace::reconstruct(space, tcb, &caa),
        None => Ok(None),
    }
}
