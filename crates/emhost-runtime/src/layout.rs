//! Static / stack / dynamic region layout of linear memory.

use core::fmt;

use crate::{
    align_up, Fault, FaultResult, MemoryView, MemoryViewMut, StackAllocator, GLOBAL_BASE,
    STACK_ALIGN, WASM_PAGE_SIZE,
};

/// Magic word ("emsc") stored at address zero to detect null-pointer writes.
pub const HEAP_MAGIC: u32 = 0x6373_6d65;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// An address computation overflowed 32 bits.
    AddressOverflow,
    /// Total memory is not a whole number of pages.
    UnalignedMemory { total_memory: u32 },
    /// The dynamic region would start at or past the end of memory.
    DoesNotFit { dynamic_base: u32, total_memory: u32 },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::AddressOverflow => write!(f, "memory layout overflows 32-bit addresses"),
            LayoutError::UnalignedMemory { total_memory } => write!(
                f,
                "total memory {total_memory} is not a multiple of the {WASM_PAGE_SIZE}-byte page size"
            ),
            LayoutError::DoesNotFit {
                dynamic_base,
                total_memory,
            } => write!(
                f,
                "total memory {total_memory} is too small for a layout whose heap starts at \
                 {dynamic_base}; raise the total memory or lower the stack size"
            ),
        }
    }
}

impl core::error::Error for LayoutError {}

/// Accumulates static allocations before the layout is fixed.
///
/// `seal` consumes the builder, so no static allocation can happen once
/// the stack and heap boundaries are known.
#[derive(Debug, Clone)]
pub struct LayoutBuilder {
    static_top: u32,
    total_stack: u32,
    total_memory: u32,
}

impl LayoutBuilder {
    /// Start a layout whose static data (module data segments) occupies
    /// `static_bump` bytes from `GLOBAL_BASE`.
    pub fn new(static_bump: u32, total_stack: u32, total_memory: u32) -> Self {
        Self {
            static_top: GLOBAL_BASE.saturating_add(static_bump),
            total_stack,
            total_memory,
        }
    }

    /// Reserve `size` bytes of static memory, returning its address.
    /// The next allocation starts on a 16-byte boundary.
    pub fn static_alloc(&mut self, size: u32) -> Result<u32, LayoutError> {
        let ret = self.static_top;
        let end = ret.checked_add(size).ok_or(LayoutError::AddressOverflow)?;
        self.static_top = align_up(end, STACK_ALIGN).ok_or(LayoutError::AddressOverflow)?;
        Ok(ret)
    }

    pub fn static_top(&self) -> u32 {
        self.static_top
    }

    /// Reserve the runtime's own static slots and fix every boundary.
    pub fn seal(mut self) -> Result<MemoryLayout, LayoutError> {
        if self.total_memory as usize % WASM_PAGE_SIZE != 0 {
            return Err(LayoutError::UnalignedMemory {
                total_memory: self.total_memory,
            });
        }
        let temp_double_ptr = self.static_alloc(16)?;
        let dynamictop_ptr = self.static_alloc(4)?;
        let catch_scratch_ptr = self.static_alloc(4)?;
        let static_end = self.static_top;

        let stack_base = align_up(static_end, STACK_ALIGN).ok_or(LayoutError::AddressOverflow)?;
        let stack_max = stack_base
            .checked_add(self.total_stack)
            .ok_or(LayoutError::AddressOverflow)?;
        let dynamic_base = align_up(stack_max, STACK_ALIGN).ok_or(LayoutError::AddressOverflow)?;
        if dynamic_base >= self.total_memory {
            return Err(LayoutError::DoesNotFit {
                dynamic_base,
                total_memory: self.total_memory,
            });
        }

        Ok(MemoryLayout {
            temp_double_ptr,
            dynamictop_ptr,
            catch_scratch_ptr,
            static_end,
            stack_base,
            stack_max,
            dynamic_base,
            total_memory: self.total_memory,
        })
    }
}

/// Fixed region boundaries for one instantiation.
///
/// `static_end <= stack_base`, `stack_max = stack_base + total_stack`,
/// `dynamic_base = align16(stack_max) < total_memory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// 16-byte scratch slot used for bit-casting doubles.
    pub temp_double_ptr: u32,
    /// Word holding the current end of the dynamic region.
    pub dynamictop_ptr: u32,
    /// Word used to pass the in-flight payload to `__cxa_can_catch`.
    pub catch_scratch_ptr: u32,
    pub static_end: u32,
    pub stack_base: u32,
    pub stack_max: u32,
    pub dynamic_base: u32,
    pub total_memory: u32,
}

impl MemoryLayout {
    /// Write the dynamic-top word and the address-zero magic.
    pub fn initialize(&self, mem: &mut MemoryViewMut<'_>) -> FaultResult<()> {
        mem.store_u32(self.dynamictop_ptr, self.dynamic_base)?;
        mem.store_u32(0, HEAP_MAGIC)
    }

    /// Stack allocator spanning `[stack_base, stack_max)`.
    pub fn stack(&self) -> StackAllocator {
        StackAllocator::new(self.stack_base, self.stack_max)
    }

    /// Current end of the dynamic region as recorded in memory.
    pub fn dynamic_top(&self, mem: &MemoryView<'_>) -> FaultResult<u32> {
        mem.load_u32(self.dynamictop_ptr)
    }

    /// Bump-allocate `size` bytes from the dynamic region.
    ///
    /// Used before the module's own allocator exists. Fails with
    /// `CannotGrowMemory` when the region would pass the end of `mem`;
    /// the caller may grow memory and retry.
    pub fn dynamic_alloc(&self, mem: &mut MemoryViewMut<'_>, size: u32) -> FaultResult<u32> {
        let ret = mem.load_u32(self.dynamictop_ptr)?;
        let overflow = Fault::CannotGrowMemory {
            requested: ret as usize + size as usize,
            current: mem.len(),
        };
        let end = ret
            .checked_add(size)
            .and_then(|end| align_up(end, STACK_ALIGN))
            .ok_or(overflow.clone())?;
        if end as usize > mem.len() {
            return Err(overflow);
        }
        mem.store_u32(self.dynamictop_ptr, end)?;
        Ok(ret)
    }
}
