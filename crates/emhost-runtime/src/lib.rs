//! `emhost-runtime`: engine-independent core of the emhost host runtime.
//!
//! This crate is `#![no_std]` (with `alloc`). It provides:
//! - `LinearMemory` and borrowed `MemoryView`/`MemoryViewMut` typed views
//! - `MemoryLayout` for the static / stack / dynamic region split
//! - `StackAllocator` with checkpoints and overflow cookies
//! - `strings` codecs (ASCII, UTF-8, UTF-16, UTF-32)
//! - `FunctionTable` for signature-tagged indirect call slots
//! - `ExceptionTable` for reference-counted C++ exception records
//! - `AbortController`, `RunDependencies` and `PhaseQueue` for the
//!   termination and startup protocol
//!
//! Nothing in here knows about a particular WebAssembly engine; the
//! `emhost` crate wires these pieces into one.

#![no_std]

extern crate alloc;

use alloc::string::String;
use core::fmt;

/// WebAssembly page size: 64 KiB.
pub const WASM_PAGE_SIZE: usize = 65536;

/// Page granularity required when memory backs an asm.js heap: 16 MiB.
pub const ASMJS_PAGE_SIZE: usize = 16 * 1024 * 1024;

/// Alignment of stack frames and static/dynamic bump allocations.
pub const STACK_ALIGN: u32 = 16;

/// First address handed out to static data.
pub const GLOBAL_BASE: u32 = 1024;

mod memory;
pub use memory::{
    GrowError, GrowthPolicy, LinearMemory, MemoryView, MemoryViewMut, PageStrategy, Scalar,
    UnknownValueKind, ValueKind,
};

mod layout;
pub use layout::{LayoutBuilder, LayoutError, MemoryLayout, HEAP_MAGIC};

mod stack;
pub use stack::{
    CheckpointError, StackAllocator, StackCheckpoint, STACK_COOKIE_HIGH, STACK_COOKIE_LOW,
};

pub mod strings;

mod table;
pub use table::{FunctionTable, Signature, TableError, ValueType};

mod exceptions;
pub use exceptions::{
    CatchMatch, Disposal, ExceptionRecord, ExceptionTable, Longjmp, ThrownException,
};

mod abort;
pub use abort::{AbortController, AbortSignal, ExitStatus};

mod startup;
pub use startup::{Phase, PhaseQueue, Removal, RunDependencies};

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline(always)]
pub const fn align_up(value: u32, align: u32) -> Option<u32> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Low-level faults. Every one of these is an invariant violation and is
/// routed to the abort path by the host; none of them is recoverable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Access to `[address, address + len)` falls outside linear memory.
    OutOfBounds { address: u32, len: u32 },
    /// Address does not satisfy the alignment a typed view requires.
    Misaligned { address: u32, align: u32 },
    /// A byte length that ends inside a code unit.
    PartialUnit { address: u32, len: u32, unit: u32 },
    /// A stack allocation did not fit in the remaining headroom.
    StackOverflow { requested: u32, available: u32 },
    /// The cookie words just below `STACK_MAX` were overwritten.
    StackCookieCorrupted { low: u32, high: u32 },
    /// The magic word at address zero was overwritten.
    HeapCorrupted { found: u32 },
    /// Indirect call through an empty or signature-mismatched slot.
    InvalidFunctionPointer { signature: String, index: u32 },
    /// No dispatcher exists for the requested signature.
    MissingDispatcher { signature: String },
    /// Memory could not be enlarged to `requested` bytes.
    CannotGrowMemory { requested: usize, current: usize },
    /// Reference count underflow or unknown record in the exception table.
    ExceptionTableCorrupted { ptr: u32 },
    /// `rethrow` with no exception currently caught.
    NoActiveException,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::OutOfBounds { address, len } => {
                write!(f, "memory access out of bounds: {len} bytes at {address}")
            }
            Fault::Misaligned { address, align } => {
                write!(f, "address {address} is not aligned to {align} bytes")
            }
            Fault::PartialUnit { address, len, unit } => write!(
                f,
                "length {len} at {address} is not a multiple of the {unit}-byte code unit"
            ),
            Fault::StackOverflow {
                requested,
                available,
            } => write!(
                f,
                "Stack overflow! Attempted to allocate {requested} bytes on the stack, \
                 but stack has only {available} bytes available!"
            ),
            Fault::StackCookieCorrupted { low, high } => write!(
                f,
                "Stack overflow! Stack cookie has been overwritten, expected hex dwords \
                 0x{STACK_COOKIE_HIGH:08X} and 0x{STACK_COOKIE_LOW:08X}, \
                 but received 0x{high:08X} 0x{low:08X}"
            ),
            Fault::HeapCorrupted { found } => write!(
                f,
                "Runtime error: the application has corrupted its heap memory area \
                 (address zero holds 0x{found:08X})"
            ),
            Fault::InvalidFunctionPointer { signature, index } => write!(
                f,
                "Invalid function pointer {index} called with signature '{signature}'. \
                 Perhaps this is an invalid value (e.g. caused by calling a virtual method \
                 on a NULL pointer)? Or calling a function with an incorrect type?"
            ),
            Fault::MissingDispatcher { signature } => {
                write!(f, "bad function pointer type - no table for sig '{signature}'")
            }
            Fault::CannotGrowMemory { requested, current } => write!(
                f,
                "Cannot enlarge memory arrays to size {requested} bytes (current size \
                 {current}). Raise the total memory or enable memory growth."
            ),
            Fault::ExceptionTableCorrupted { ptr } => {
                write!(f, "exception table corrupted at payload {ptr}")
            }
            Fault::NoActiveException => write!(f, "rethrow with no active exception"),
        }
    }
}

impl core::error::Error for Fault {}

/// Result type for operations that can only fail with a `Fault`.
pub type FaultResult<T> = Result<T, Fault>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0, 16), Some(0));
        assert_eq!(align_up(1, 16), Some(16));
        assert_eq!(align_up(16, 16), Some(16));
        assert_eq!(align_up(u32::MAX, 16), None);
    }

    #[test]
    fn stack_overflow_message_reports_sizes() {
        let fault = Fault::StackOverflow {
            requested: 4096,
            available: 12,
        };
        let msg = fault.to_string();
        assert!(msg.contains("allocate 4096 bytes"));
        assert!(msg.contains("only 12 bytes"));
    }

    #[test]
    fn invalid_pointer_message_names_signature_and_index() {
        let fault = Fault::InvalidFunctionPointer {
            signature: "vii".into(),
            index: 7,
        };
        let msg = fault.to_string();
        assert!(msg.contains("'vii'"));
        assert!(msg.contains("pointer 7"));
    }
}
