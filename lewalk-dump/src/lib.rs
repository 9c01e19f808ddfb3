//! The read-only memory image that all of `lewalk` analyzes.
//!
//! A z/OS process dump is a sparse collection of storage ranges captured at an
//! arbitrary point in time. This crate models that capture as an
//! [`AddressSpace`]: a byte-addressable, random-access view assembled from
//! non-overlapping [`Segment`]s. The view is immutable for the duration of an
//! analysis and possibly inconsistent with itself — the process was never
//! asked whether this was a good moment to be photographed — so every read
//! can fail, and a failed read is an ordinary [`ReadError`], never a panic.
//!
//! Numbers are always big-endian, as on z/Architecture. Addresses come in two
//! widths, selected by an explicit [`AddrMode`] parameter on every
//! word-sized read; there is deliberately no ambient "current mode" on the
//! image itself, so two probes with different assumptions cannot contaminate
//! each other.
//!
//! Character data in the dump is encoded in EBCDIC (code page 1047); the
//! [`ebcdic`] module converts it to and from ASCII.

#![warn(missing_docs)]

pub mod ebcdic;
mod space;

pub use space::{AddrMode, AddressSpace, ReadError, Segment};
