//! Linear memory: a growable byte buffer plus borrowed typed views.
//!
//! Views borrow the buffer, so the borrow checker rules out any view
//! surviving a `grow`: a grown buffer can only be observed through a view
//! taken after the swap.
//!
//! Load/store operations use the **outline pattern**: the view methods
//! delegate to non-generic inner functions so that only one copy of the
//! bounds-checking logic exists in the binary.

use alloc::vec::Vec;
use core::fmt;
use core::str::FromStr;

use crate::{Fault, FaultResult, ASMJS_PAGE_SIZE, WASM_PAGE_SIZE};

/// Page granularity of the active execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageStrategy {
    /// Native WebAssembly memory, 64 KiB pages.
    #[default]
    Wasm,
    /// asm.js-style heap, 16 MiB pages.
    AsmJs,
}

impl PageStrategy {
    pub const fn page_size(self) -> usize {
        match self {
            PageStrategy::Wasm => WASM_PAGE_SIZE,
            PageStrategy::AsmJs => ASMJS_PAGE_SIZE,
        }
    }

    /// Round `size` up to a whole number of pages.
    pub fn align_up(self, size: usize) -> Option<usize> {
        let page = self.page_size();
        size.checked_add(page - 1).map(|v| v / page * page)
    }
}

/// Why a growth request was refused. The buffer is untouched in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowError {
    /// Memory only grows; shrinking requests are refused.
    NotLarger { current: usize, requested: usize },
    /// The runtime was configured with a fixed-size memory.
    NotGrowable { current: usize, requested: usize },
    /// The rounded size is above the configured maximum.
    ExceedsMaximum { requested: usize, maximum: usize },
    /// The host allocator could not provide the bytes.
    AllocationFailed { requested: usize },
}

impl fmt::Display for GrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrowError::NotLarger { current, requested } => {
                write!(f, "cannot shrink memory from {current} to {requested} bytes")
            }
            GrowError::NotGrowable { current, requested } => write!(
                f,
                "memory is not growable (current {current} bytes, requested {requested})"
            ),
            GrowError::ExceedsMaximum { requested, maximum } => {
                write!(f, "{requested} bytes exceeds the memory maximum of {maximum}")
            }
            GrowError::AllocationFailed { requested } => {
                write!(f, "failed to allocate {requested} bytes of linear memory")
            }
        }
    }
}

impl core::error::Error for GrowError {}

/// Growth rules shared by the host buffer and engine-owned memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GrowthPolicy {
    pub strategy: PageStrategy,
    pub growable: bool,
    /// Upper bound in bytes; `None` means the 4 GiB address space limit.
    pub maximum: Option<usize>,
}

impl GrowthPolicy {
    /// Largest size any 32-bit linear memory can have.
    const ADDRESS_SPACE: usize = 1 << 32;

    /// Validate a request and return the page-rounded target size.
    ///
    /// Equal sizes are accepted and return `current` (a no-op growth).
    pub fn plan(&self, current: usize, requested: usize) -> Result<usize, GrowError> {
        if requested < current {
            return Err(GrowError::NotLarger { current, requested });
        }
        if requested == current {
            return Ok(current);
        }
        if !self.growable {
            return Err(GrowError::NotGrowable { current, requested });
        }
        let maximum = self
            .maximum
            .unwrap_or(Self::ADDRESS_SPACE)
            .min(Self::ADDRESS_SPACE);
        let target = self
            .strategy
            .align_up(requested)
            .ok_or(GrowError::ExceedsMaximum { requested, maximum })?;
        if target > maximum {
            return Err(GrowError::ExceedsMaximum {
                requested: target,
                maximum,
            });
        }
        Ok(target)
    }
}

/// The host-side linear memory buffer.
///
/// Used directly before a module is instantiated (static initializers write
/// here) and as the source for merging into a module-owned memory.
#[derive(Debug, Clone)]
pub struct LinearMemory {
    bytes: Vec<u8>,
    policy: GrowthPolicy,
}

impl LinearMemory {
    /// Allocate a zeroed buffer of `size` bytes, rounded up to whole pages.
    pub fn allocate(size: usize, policy: GrowthPolicy) -> Result<Self, GrowError> {
        let size = policy
            .strategy
            .align_up(size)
            .ok_or(GrowError::AllocationFailed { requested: size })?;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| GrowError::AllocationFailed { requested: size })?;
        bytes.resize(size, 0);
        Ok(Self { bytes, policy })
    }

    /// Adopt an existing buffer. Its length must be a whole number of pages.
    pub fn from_bytes(bytes: Vec<u8>, policy: GrowthPolicy) -> Result<Self, GrowError> {
        if policy.strategy.align_up(bytes.len()) != Some(bytes.len()) {
            return Err(GrowError::AllocationFailed {
                requested: bytes.len(),
            });
        }
        Ok(Self { bytes, policy })
    }

    /// Current size in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn policy(&self) -> GrowthPolicy {
        self.policy
    }

    /// Grow to at least `new_size` bytes, returning the new size.
    ///
    /// The replacement buffer is fully built before the swap, so a failed
    /// allocation leaves the old contents and size intact.
    pub fn grow(&mut self, new_size: usize) -> Result<usize, GrowError> {
        let target = self.policy.plan(self.bytes.len(), new_size)?;
        if target == self.bytes.len() {
            return Ok(target);
        }
        let mut next = Vec::new();
        next.try_reserve_exact(target)
            .map_err(|_| GrowError::AllocationFailed { requested: target })?;
        next.extend_from_slice(&self.bytes);
        next.resize(target, 0);
        self.bytes = next;
        Ok(target)
    }

    #[inline(always)]
    pub fn view(&self) -> MemoryView<'_> {
        MemoryView::new(&self.bytes)
    }

    #[inline(always)]
    pub fn view_mut(&mut self) -> MemoryViewMut<'_> {
        MemoryViewMut::new(&mut self.bytes)
    }

    /// Copy every non-zero byte of this buffer onto `target`, returning the
    /// number of bytes copied. Bytes past `target.len()` are dropped.
    pub fn overlay_onto(&self, target: &mut [u8]) -> usize {
        let mut copied = 0;
        for (dst, &src) in target.iter_mut().zip(self.bytes.iter()) {
            if src != 0 {
                *dst = src;
                copied += 1;
            }
        }
        copied
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

// ── Typed value kinds ─────────────────────────────────────────────────

/// Value kinds accepted by `read_scalar` / `write_scalar`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    I1,
    I8,
    I16,
    I32,
    I64,
    Float,
    Double,
    /// Any pointer type (`*`, `i8*`, ...): stored as a 32-bit address.
    Pointer,
}

impl ValueKind {
    /// Width in bytes of the stored representation.
    pub const fn width(self) -> usize {
        match self {
            ValueKind::I1 | ValueKind::I8 => 1,
            ValueKind::I16 => 2,
            ValueKind::I32 | ValueKind::Float | ValueKind::Pointer => 4,
            ValueKind::I64 | ValueKind::Double => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownValueKind(pub alloc::string::String);

impl fmt::Display for UnknownValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid type for value access: {}", self.0)
    }
}

impl core::error::Error for UnknownValueKind {}

impl FromStr for ValueKind {
    type Err = UnknownValueKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.ends_with('*') {
            return Ok(ValueKind::Pointer);
        }
        match s {
            "i1" => Ok(ValueKind::I1),
            "i8" => Ok(ValueKind::I8),
            "i16" => Ok(ValueKind::I16),
            "i32" => Ok(ValueKind::I32),
            "i64" => Ok(ValueKind::I64),
            "float" => Ok(ValueKind::Float),
            "double" => Ok(ValueKind::Double),
            other => Err(UnknownValueKind(other.into())),
        }
    }
}

/// A scalar crossing the host/module boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Scalar {
    /// Integer view with wrapping (and saturating float) conversion.
    pub fn as_i64(self) -> i64 {
        match self {
            Scalar::I32(v) => v as i64,
            Scalar::I64(v) => v,
            Scalar::F32(v) => v as i64,
            Scalar::F64(v) => v as i64,
        }
    }

    pub fn as_i32(self) -> i32 {
        self.as_i64() as i32
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::I32(v) => v as f64,
            Scalar::I64(v) => v as f64,
            Scalar::F32(v) => v as f64,
            Scalar::F64(v) => v,
        }
    }

    pub fn is_truthy(self) -> bool {
        self.as_f64() != 0.0
    }
}

// ── Views ─────────────────────────────────────────────────────────────

/// Read-only typed view over linear memory. Addresses are module pointers.
#[derive(Clone, Copy)]
pub struct MemoryView<'a> {
    bytes: &'a [u8],
}

impl<'a> MemoryView<'a> {
    #[inline(always)]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bounds-checked sub-slice `[address, address + len)`.
    #[inline(always)]
    pub fn bytes(&self, address: u32, len: usize) -> FaultResult<&'a [u8]> {
        checked_slice(self.bytes, address, len)
    }

    /// Everything from `address` to the end of memory.
    pub fn tail(&self, address: u32) -> FaultResult<&'a [u8]> {
        let start = address as usize;
        self.bytes.get(start..).ok_or(Fault::OutOfBounds { address, len: 0 })
    }

    #[inline(always)]
    pub fn load_u8(&self, address: u32) -> FaultResult<u8> {
        load_u8_inner(self.bytes, address)
    }

    #[inline(always)]
    pub fn load_i8(&self, address: u32) -> FaultResult<i8> {
        load_u8_inner(self.bytes, address).map(|v| v as i8)
    }

    #[inline(always)]
    pub fn load_u16(&self, address: u32) -> FaultResult<u16> {
        load_u16_inner(self.bytes, address)
    }

    #[inline(always)]
    pub fn load_i16(&self, address: u32) -> FaultResult<i16> {
        load_u16_inner(self.bytes, address).map(|v| v as i16)
    }

    #[inline(always)]
    pub fn load_i32(&self, address: u32) -> FaultResult<i32> {
        load_u32_inner(self.bytes, address).map(|v| v as i32)
    }

    #[inline(always)]
    pub fn load_u32(&self, address: u32) -> FaultResult<u32> {
        load_u32_inner(self.bytes, address)
    }

    #[inline(always)]
    pub fn load_i64(&self, address: u32) -> FaultResult<i64> {
        load_u64_inner(self.bytes, address).map(|v| v as i64)
    }

    #[inline(always)]
    pub fn load_f32(&self, address: u32) -> FaultResult<f32> {
        load_u32_inner(self.bytes, address).map(f32::from_bits)
    }

    #[inline(always)]
    pub fn load_f64(&self, address: u32) -> FaultResult<f64> {
        load_u64_inner(self.bytes, address).map(f64::from_bits)
    }

    /// Typed read. Small integer kinds are sign-extended into `Scalar::I32`.
    pub fn read_scalar(&self, address: u32, kind: ValueKind) -> FaultResult<Scalar> {
        Ok(match kind {
            ValueKind::I1 | ValueKind::I8 => Scalar::I32(self.load_i8(address)? as i32),
            ValueKind::I16 => Scalar::I32(self.load_i16(address)? as i32),
            ValueKind::I32 | ValueKind::Pointer => Scalar::I32(self.load_i32(address)?),
            ValueKind::I64 => Scalar::I64(self.load_i64(address)?),
            ValueKind::Float => Scalar::F32(self.load_f32(address)?),
            ValueKind::Double => Scalar::F64(self.load_f64(address)?),
        })
    }
}

/// Mutable typed view over linear memory.
pub struct MemoryViewMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> MemoryViewMut<'a> {
    #[inline(always)]
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// Reborrow as a read-only view.
    #[inline(always)]
    pub fn as_view(&self) -> MemoryView<'_> {
        MemoryView::new(self.bytes)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline(always)]
    pub fn load_i32(&self, address: u32) -> FaultResult<i32> {
        self.as_view().load_i32(address)
    }

    #[inline(always)]
    pub fn load_u32(&self, address: u32) -> FaultResult<u32> {
        self.as_view().load_u32(address)
    }

    /// Copy `data` into memory at `address`. Nothing is written on failure.
    #[inline(always)]
    pub fn write_bytes(&mut self, address: u32, data: &[u8]) -> FaultResult<()> {
        write_bytes_inner(self.bytes, address, data)
    }

    /// `memmove` semantics; both ranges are checked before copying.
    pub fn copy_within(&mut self, dst: u32, src: u32, len: u32) -> FaultResult<()> {
        checked_slice(self.bytes, src, len as usize)?;
        checked_slice(self.bytes, dst, len as usize)?;
        let src = src as usize;
        self.bytes.copy_within(src..src + len as usize, dst as usize);
        Ok(())
    }

    #[inline(always)]
    pub fn store_u8(&mut self, address: u32, value: u8) -> FaultResult<()> {
        write_bytes_inner(self.bytes, address, &[value])
    }

    #[inline(always)]
    pub fn store_u16(&mut self, address: u32, value: u16) -> FaultResult<()> {
        write_bytes_inner(self.bytes, address, &value.to_le_bytes())
    }

    #[inline(always)]
    pub fn store_i32(&mut self, address: u32, value: i32) -> FaultResult<()> {
        write_bytes_inner(self.bytes, address, &value.to_le_bytes())
    }

    #[inline(always)]
    pub fn store_u32(&mut self, address: u32, value: u32) -> FaultResult<()> {
        write_bytes_inner(self.bytes, address, &value.to_le_bytes())
    }

    #[inline(always)]
    pub fn store_i64(&mut self, address: u32, value: i64) -> FaultResult<()> {
        write_bytes_inner(self.bytes, address, &value.to_le_bytes())
    }

    #[inline(always)]
    pub fn store_f32(&mut self, address: u32, value: f32) -> FaultResult<()> {
        write_bytes_inner(self.bytes, address, &value.to_le_bytes())
    }

    #[inline(always)]
    pub fn store_f64(&mut self, address: u32, value: f64) -> FaultResult<()> {
        write_bytes_inner(self.bytes, address, &value.to_le_bytes())
    }

    /// Typed write, converting `value` to the representation of `kind`.
    pub fn write_scalar(&mut self, address: u32, value: Scalar, kind: ValueKind) -> FaultResult<()> {
        match kind {
            ValueKind::I1 | ValueKind::I8 => self.store_u8(address, value.as_i32() as u8),
            ValueKind::I16 => self.store_u16(address, value.as_i32() as u16),
            ValueKind::I32 | ValueKind::Pointer => self.store_i32(address, value.as_i32()),
            ValueKind::I64 => self.store_i64(address, value.as_i64()),
            ValueKind::Float => self.store_f32(address, value.as_f64() as f32),
            ValueKind::Double => self.store_f64(address, value.as_f64()),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Bounds-check and return `memory[address..address+len]`. Never panics.
#[inline(always)]
fn checked_slice(memory: &[u8], address: u32, len: usize) -> FaultResult<&[u8]> {
    let oob = || Fault::OutOfBounds {
        address,
        len: len.min(u32::MAX as usize) as u32,
    };
    let start = address as usize;
    let end = start.checked_add(len).ok_or_else(oob)?;
    memory.get(start..end).ok_or_else(oob)
}

/// Convert a slice to a fixed-size array. Never panics.
#[inline(always)]
fn to_array<const N: usize>(slice: &[u8], address: u32) -> FaultResult<[u8; N]> {
    slice.try_into().map_err(|_| Fault::OutOfBounds {
        address,
        len: N as u32,
    })
}

// ── Non-generic inner functions (outline pattern) ─────────────────────
//
// No unwrap(), no indexing, no panic paths.

#[inline(never)]
fn load_u8_inner(memory: &[u8], address: u32) -> FaultResult<u8> {
    let s = checked_slice(memory, address, 1)?;
    Ok(u8::from_le_bytes(to_array(s, address)?))
}

#[inline(never)]
fn load_u16_inner(memory: &[u8], address: u32) -> FaultResult<u16> {
    let s = checked_slice(memory, address, 2)?;
    Ok(u16::from_le_bytes(to_array(s, address)?))
}

#[inline(never)]
fn load_u32_inner(memory: &[u8], address: u32) -> FaultResult<u32> {
    let s = checked_slice(memory, address, 4)?;
    Ok(u32::from_le_bytes(to_array(s, address)?))
}

#[inline(never)]
fn load_u64_inner(memory: &[u8], address: u32) -> FaultResult<u64> {
    let s = checked_slice(memory, address, 8)?;
    Ok(u64::from_le_bytes(to_array(s, address)?))
}

#[inline(never)]
fn write_bytes_inner(memory: &mut [u8], address: u32, data: &[u8]) -> FaultResult<()> {
    let start = address as usize;
    let oob = Fault::OutOfBounds {
        address,
        len: data.len().min(u32::MAX as usize) as u32,
    };
    let end = start.checked_add(data.len()).ok_or(oob.clone())?;
    let dst = memory.get_mut(start..end).ok_or(oob)?;
    dst.copy_from_slice(data);
    Ok(())
}


// ── Kani proofs ───────────────────────────────────────────────────────

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: typed loads never panic, whatever the address.
    #[kani::proof]
    #[kani::unwind(1)]
    fn load_i32_never_panics() {
        let bytes = [0u8; 16];
        let view = MemoryView::new(&bytes);
        let address: u32 = kani::any();
        let _ = view.load_i32(address);
    }

    /// Proof: a successful write lands inside the buffer.
    #[kani::proof]
    #[kani::unwind(1)]
    fn store_success_implies_valid_range() {
        let mut bytes = [0u8; 16];
        let mut view = MemoryViewMut::new(&mut bytes);
        let address: u32 = kani::any();
        if view.store_i32(address, 1).is_ok() {
            kani::assert(address as usize + 4 <= 16, "store stays in bounds");
        }
    }
}
