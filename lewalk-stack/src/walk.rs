//! The outward walk: from a validated top frame to the dummy frame.

use lewalk_dump::{AddrMode, AddressSpace};
use lewalk_mvs::ThreadControlBlock;

use crate::caa::Caa;
use crate::frame::StackFrame;
use crate::registers::{resolve_registers, RegisterSource};
use crate::{TraceError, TraceErrorKind};

/// Hard cap on the number of frames in one backtrace.
///
/// The validator's loop detection keeps the chain finite during
/// validation, but the outward walk trusts a chain that validated once;
/// the cap bounds it independently.
pub const MAX_FRAMES: usize = 1024;

/// A reconstructed thread backtrace.
///
/// Frames live in an arena ordered from the top of the stack outward:
/// index 0 is the innermost frame, and each frame's
/// [`parent_index`](StackFrame::parent_index) /
/// [`child_index`](StackFrame::child_index) link it to its caller and
/// callee within the arena. The frame chain in the dump may be arbitrarily
/// corrupted, but the arena itself is always a straight line — a frame
/// owns the link to its parent and nothing points back.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Backtrace {
    frames: Vec<StackFrame>,
    truncated: bool,
    source: RegisterSource,
    failing: bool,
    mode: AddrMode,
}

impl Backtrace {
    /// Reconstructs the backtrace of the thread owning `tcb`.
    ///
    /// Resolves a register snapshot, builds the topmost frame from it, and
    /// walks the chain outward until the dummy frame. A chain that breaks
    /// partway — a read failure or an unchained frame — produces a
    /// truncated backtrace rather than an error. Returns `Ok(None)` when no
    /// register source yields a usable top frame: the thread's stack is
    /// unavailable.
    ///
    /// Only an [`UnimplementedBranch`](TraceErrorKind::UnimplementedBranch)
    /// propagates as an error, leaving the policy — skip the thread or
    /// abort the scan — to the caller.
    #[tracing::instrument(level = "trace", name = "Backtrace::reconstruct", skip_all)]
    pub fn reconstruct<T: ThreadControlBlock + ?Sized>(
        space: &AddressSpace,
        tcb: &T,
        caa: &Caa,
    ) -> Result<Option<Backtrace>, TraceError> {
        let Some(resolved) = resolve_registers(space, tcb, caa) else {
            tracing::debug!(caa = caa.address(), "no stack available for thread");
            return Ok(None);
        };
        if resolved.frame_pointer == 0 {
            return Ok(None);
        }
        let top = match StackFrame::build(
            space,
            caa,
            resolved.frame_pointer,
            resolved.format,
            resolved.registers.clone(),
        ) {
            Ok(frame) => frame,
            Err(e) if e.kind() == TraceErrorKind::Read => {
                tracing::debug!(error = %e, "top frame unreadable, no stack available");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut frames = vec![top];
        let mut truncated = false;
        loop {
            let Some(last) = frames.last() else { break };
            let parent = last.parent_address();
            if parent == 0 || parent == caa.dummy_frame() || parent == last.address() {
                break;
            }
            if frames.len() >= MAX_FRAMES {
                tracing::debug!("frame cap reached, truncating backtrace");
                truncated = true;
                break;
            }
            let parent_format = last.parent_format();
            match StackFrame::build(space, caa, parent, parent_format, None) {
                Ok(frame) => frames.push(frame),
                Err(e) if e.kind() == TraceErrorKind::Read => {
                    tracing::debug!(error = %e, frame = parent, "chain broke, truncating backtrace");
                    truncated = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let len = frames.len();
        for (i, frame) in frames.iter_mut().enumerate() {
            if i + 1 < len {
                frame.set_parent_index(Some(i + 1));
            }
            if i > 0 {
                frame.set_child_index(Some(i - 1));
            }
        }
        tracing::debug!(
            frames = len,
            truncated,
            source = %resolved.source,
            "backtrace reconstructed"
        );
        Ok(Some(Backtrace {
            frames,
            truncated,
            source: resolved.source,
            failing: resolved.failing,
            mode: caa.mode(),
        }))
    }

    /// The frames, from the top of the stack outward.
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    /// The frame at `index`, if any.
    pub fn frame(&self, index: usize) -> Option<&StackFrame> {
        self.frames.get(index)
    }

    /// The number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True if the backtrace holds no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// True if the walk ended early instead of reaching the dummy frame.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Where the top frame's register snapshot came from.
    pub fn source(&self) -> RegisterSource {
        self.source
    }

    /// True when the backtrace describes a failed (abended) thread.
    pub fn failing(&self) -> bool {
        self.failing
    }

    /// The offset into its routine at which the frame at `index` lost
    /// control.
    ///
    /// For the top frame this comes from the PSW; for every other frame it
    /// is the child's call site relative to this frame's entry point.
    pub fn entry_offset(&self, index: usize) -> Option<u64> {
        let frame = self.frames.get(index)?;
        if frame.entry_point() == 0 {
            return None;
        }
        if let Some(regs) = frame.registers() {
            return Some(
                regs.instruction_address(self.mode)
                    .wrapping_sub(frame.entry_point()),
            );
        }
        let child = self.frames.get(frame.child_index()?)?;
        Some(child.call_site()?.wrapping_sub(frame.entry_point()))
    }
}
