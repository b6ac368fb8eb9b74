//! Bump allocator over the stack region of linear memory.
//!
//! The stack pointer moves upward from `base`. The two words just below
//! `max` hold cookie values; allocations stop short of them.

use core::fmt;

use crate::{align_up, Fault, FaultResult, MemoryView, MemoryViewMut, HEAP_MAGIC, STACK_ALIGN};

/// Cookie stored in the word at `max - 4`.
pub const STACK_COOKIE_LOW: u32 = 0x0213_5467;
/// Cookie stored in the word at `max - 8`.
pub const STACK_COOKIE_HIGH: u32 = 0x89BA_CDFE;

const COOKIE_BYTES: u32 = 8;

/// Saved stack pointer. Only obtainable from `StackAllocator::save`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackCheckpoint(u32);

impl StackCheckpoint {
    pub fn address(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointError {
    /// The checkpoint is above the current pointer: a checkpoint taken
    /// later was already released, so this one is out of LIFO order.
    Stale { checkpoint: u32, top: u32 },
    /// Address outside `[base, max - 8]`.
    OutOfRange { address: u32 },
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::Stale { checkpoint, top } => write!(
                f,
                "stack checkpoint {checkpoint} released out of order (stack top is {top})"
            ),
            CheckpointError::OutOfRange { address } => {
                write!(f, "stack pointer {address} is outside the stack region")
            }
        }
    }
}

impl core::error::Error for CheckpointError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackAllocator {
    base: u32,
    max: u32,
    top: u32,
}

impl StackAllocator {
    pub fn new(base: u32, max: u32) -> Self {
        Self {
            base,
            max,
            top: base,
        }
    }

    #[inline(always)]
    pub fn top(&self) -> u32 {
        self.top
    }

    #[inline(always)]
    pub fn base(&self) -> u32 {
        self.base
    }

    #[inline(always)]
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Highest address an allocation may end at (the cookie words start here).
    #[inline(always)]
    pub fn limit(&self) -> u32 {
        self.max.saturating_sub(COOKIE_BYTES).max(self.base)
    }

    pub fn available(&self) -> u32 {
        self.limit().saturating_sub(self.top)
    }

    pub fn save(&self) -> StackCheckpoint {
        StackCheckpoint(self.top)
    }

    /// Return the pointer to `checkpoint`, discarding every allocation made
    /// since it was taken.
    pub fn restore(&mut self, checkpoint: StackCheckpoint) -> Result<(), CheckpointError> {
        if checkpoint.0 > self.top {
            return Err(CheckpointError::Stale {
                checkpoint: checkpoint.0,
                top: self.top,
            });
        }
        self.top = checkpoint.0;
        Ok(())
    }

    /// Set the pointer to a raw address supplied by module code.
    pub fn set_top(&mut self, address: u32) -> Result<(), CheckpointError> {
        if address < self.base || address > self.limit() {
            return Err(CheckpointError::OutOfRange { address });
        }
        self.top = address;
        Ok(())
    }

    /// Reserve `size` bytes; the next frame starts 16-byte aligned.
    /// Memory is not zeroed.
    pub fn alloc(&mut self, size: u32) -> FaultResult<u32> {
        let overflow = Fault::StackOverflow {
            requested: size,
            available: self.available(),
        };
        let end = self
            .top
            .checked_add(size)
            .and_then(|end| align_up(end, STACK_ALIGN))
            .ok_or(overflow.clone())?;
        if end > self.limit() {
            return Err(overflow);
        }
        let ret = self.top;
        self.top = end;
        Ok(ret)
    }

    /// Reset to an empty stack.
    pub fn reset(&mut self) {
        self.top = self.base;
    }

    pub fn write_cookie(&self, mem: &mut MemoryViewMut<'_>) -> FaultResult<()> {
        mem.store_u32(self.max.saturating_sub(4), STACK_COOKIE_LOW)?;
        mem.store_u32(self.max.saturating_sub(8), STACK_COOKIE_HIGH)
    }

    /// Verify both cookie words and the address-zero magic.
    pub fn check_cookie(&self, mem: &MemoryView<'_>) -> FaultResult<()> {
        let low = mem.load_u32(self.max.saturating_sub(4))?;
        let high = mem.load_u32(self.max.saturating_sub(8))?;
        if low != STACK_COOKIE_LOW || high != STACK_COOKIE_HIGH {
            return Err(Fault::StackCookieCorrupted { low, high });
        }
        let found = mem.load_u32(0)?;
        if found != HEAP_MAGIC {
            return Err(Fault::HeapCorrupted { found });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GrowthPolicy, LinearMemory};

    fn stack() -> StackAllocator {
        StackAllocator::new(1024, 1024 + 256)
    }

    #[test]
    fn save_then_restore_is_a_no_op() {
        let mut s = stack();
        s.alloc(20).unwrap();
        let top = s.top();
        let cp = s.save();
        s.restore(cp).unwrap();
        assert_eq!(s.top(), top);
    }

    #[test]
    fn nested_checkpoints_return_exact_pointer() {
        let mut s = stack();
        let outer = s.save();
        s.alloc(3).unwrap();
        let inner = s.save();
        s.alloc(40).unwrap();
        s.alloc(1).unwrap();
        s.restore(inner).unwrap();
        assert_eq!(s.top(), inner.address());
        s.alloc(7).unwrap();
        s.restore(outer).unwrap();
        assert_eq!(s.top(), 1024);
    }

    #[test]
    fn restoring_a_released_checkpoint_is_stale() {
        let mut s = stack();
        let outer = s.save();
        s.alloc(16).unwrap();
        let inner = s.save();
        s.restore(outer).unwrap();
        assert_eq!(
            s.restore(inner),
            Err(CheckpointError::Stale {
                checkpoint: 1040,
                top: 1024
            })
        );
    }

    #[test]
    fn allocations_are_aligned() {
        let mut s = stack();
        assert_eq!(s.alloc(1), Ok(1024));
        assert_eq!(s.alloc(17), Ok(1040));
        assert_eq!(s.top(), 1072);
    }

    #[test]
    fn overflow_reports_request_and_headroom() {
        let mut s = stack();
        s.alloc(200).unwrap();
        let available = s.available();
        assert_eq!(available, 256 - 8 - 208);
        assert_eq!(
            s.alloc(100),
            Err(Fault::StackOverflow {
                requested: 100,
                available
            })
        );
        assert_eq!(s.top(), 1024 + 208);
    }

    #[test]
    fn set_top_checks_range() {
        let mut s = stack();
        assert!(s.set_top(1100).is_ok());
        assert_eq!(
            s.set_top(10),
            Err(CheckpointError::OutOfRange { address: 10 })
        );
        assert!(s.set_top(s.max()).is_err());
    }

    #[test]
    fn cookie_detects_overwrite() {
        let mut mem = LinearMemory::allocate(65536, GrowthPolicy::default()).unwrap();
        let s = stack();
        mem.view_mut().store_u32(0, HEAP_MAGIC).unwrap();
        s.write_cookie(&mut mem.view_mut()).unwrap();
        assert_eq!(s.check_cookie(&mem.view()), Ok(()));

        mem.view_mut().store_u32(s.max() - 8, 0).unwrap();
        assert_eq!(
            s.check_cookie(&mem.view()),
            Err(Fault::StackCookieCorrupted {
                low: STACK_COOKIE_LOW,
                high: 0
            })
        );
    }

    #[test]
    fn cookie_check_detects_null_write() {
        let mut mem = LinearMemory::allocate(65536, GrowthPolicy::default()).unwrap();
        let s = stack();
        s.write_cookie(&mut mem.view_mut()).unwrap();
        assert_eq!(
            s.check_cookie(&mem.view()),
            Err(Fault::HeapCorrupted { found: 0 })
        );
    }
}

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: the stack pointer never passes the cookie words.
    #[kani::proof]
    #[kani::unwind(1)]
    fn alloc_never_passes_limit() {
        let mut s = StackAllocator::new(1024, 4096);
        let size: u32 = kani::any();
        let _ = s.alloc(size);
        kani::assert(s.top() <= s.limit(), "top stays below the cookies");
    }

    /// Proof: restore after save always returns to the saved pointer.
    #[kani::proof]
    #[kani::unwind(1)]
    fn save_alloc_restore_roundtrip() {
        let mut s = StackAllocator::new(1024, 4096);
        let cp = s.save();
        let size: u32 = kani::any();
        let _ = s.alloc(size);
        kani::assert(s.restore(cp).is_ok(), "restore succeeds");
        kani::assert(s.top() == 1024, "pointer returns to checkpoint");
    }
}
