//! `lewalk` reconstructs native call stacks for the threads of a z/OS
//! Language Environment process from a static memory image, without a live
//! debugger and without the cooperation of the target process. It is the
//! analytical core of a post-mortem diagnostic reader; front ends use it to
//! answer "what was this native thread doing?" once the process is gone.
//!
//! The work is split across largely independent crates, re-exported here as
//! modules:
//!
//! - [`dump`]: the read-only memory image — sparse big-endian segments,
//!   EBCDIC string reads, and explicit 31/64-bit addressing modes.
//! - [`mvs`]: the operating-system view of a thread — the opaque
//!   [`ThreadControlBlock`](mvs::ThreadControlBlock) accessor trait,
//!   register snapshots, and linkage stack entries.
//! - [`stack`]: the reconstruction itself — CAA discovery, register
//!   resolution with chain validation, and the per-frame traceback that
//!   produces a [`Backtrace`](stack::Backtrace).
//!
//! # Features
//!
//! - **`stack`** (default): the full reconstruction pipeline.
//! - **`mvs`**: only the thread structures, for front ends that implement
//!   their own analysis.
//! - **`serde`**: `serde::Serialize` implementations on the output types.
//!
//! # Minimal example
//!
//! ```
//! use lewalk::dump::AddressSpace;
//! use lewalk::mvs::DumpTcb;
//!
//! # fn report(space: &AddressSpace, tcb_addr: u64) {
//! let tcb = DumpTcb::new(space, tcb_addr);
//! match lewalk::stack::backtrace(space, &tcb) {
//!     Ok(Some(trace)) => {
//!         for frame in trace.frames() {
//!             println!("{:#010x}  {}", frame.entry_point(), frame.name().unwrap_or("(unknown)"));
//!         }
//!     }
//!     Ok(None) => println!("no stack available"),
//!     Err(e) => eprintln!("traceback aborted: {e}"),
//! }
//! # }
//! ```

#![warn(missing_docs)]

/// The read-only memory image.
pub mod dump {
    pub use lewalk_dump::*;
}

/// Native MVS thread structures.
#[cfg(feature = "mvs")]
pub mod mvs {
    pub use lewalk_mvs::*;
}

/// Call stack reconstruction.
#[cfg(feature = "stack")]
pub mod stack {
    pub use lewalk_stack::*;
}
