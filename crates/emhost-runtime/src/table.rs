//! Host function table: indirect call slots tagged with a signature.
//!
//! Module code calls host functions by small integer index through a
//! per-signature trampoline (`jsCall_vi`, `jsCall_iii`, ...). Each slot
//! stores the function together with the signature it was registered
//! under; a call through an empty slot or under a different signature is
//! an `InvalidFunctionPointer` fault rather than a call with wrong types.
//!
//! Index 0 is the null pointer and is never handed out. Capacity is fixed
//! when the table is created; registration is first-fit from index 1.

use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::str::FromStr;

use crate::{Fault, FaultResult};

/// A value type in a signature string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

impl ValueType {
    fn from_code(code: char) -> Option<Self> {
        match code {
            'i' => Some(ValueType::I32),
            'j' => Some(ValueType::I64),
            'f' => Some(ValueType::F32),
            'd' => Some(ValueType::F64),
            _ => None,
        }
    }

    pub fn code(self) -> char {
        match self {
            ValueType::I32 => 'i',
            ValueType::I64 => 'j',
            ValueType::F32 => 'f',
            ValueType::F64 => 'd',
        }
    }
}

/// A parsed signature string: first character is the result (`v` for
/// none), the rest are parameters. `"vii"` is `fn(i32, i32)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    text: String,
    result: Option<ValueType>,
    params: Vec<ValueType>,
}

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn result(&self) -> Option<ValueType> {
        self.result
    }

    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    /// Build the signature string for a function type.
    pub fn from_types(params: &[ValueType], result: Option<ValueType>) -> Self {
        let mut text = String::with_capacity(params.len() + 1);
        text.push(result.map_or('v', ValueType::code));
        text.extend(params.iter().map(|p| p.code()));
        Self {
            text,
            result,
            params: params.to_vec(),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Signature {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || TableError::BadSignature(s.into());
        let mut chars = s.chars();
        let result = match chars.next().ok_or_else(bad)? {
            'v' => None,
            c => Some(ValueType::from_code(c).ok_or_else(bad)?),
        };
        let params = chars
            .map(|c| ValueType::from_code(c).ok_or_else(bad))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            text: s.into(),
            result,
            params,
        })
    }
}

/// Recoverable table errors (configuration problems, not faults).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    BadSignature(String),
    /// Every slot below the capacity is occupied.
    Exhausted { capacity: usize },
    /// Index 0 or an index at/after the capacity.
    OutOfRange { index: u32 },
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::BadSignature(sig) => write!(f, "malformed signature '{sig}'"),
            TableError::Exhausted { capacity } => write!(
                f,
                "function table exhausted: all {capacity} slots are in use; \
                 raise the table capacity"
            ),
            TableError::OutOfRange { index } => {
                write!(f, "function table index {index} is out of range")
            }
        }
    }
}

impl core::error::Error for TableError {}

struct Slot<F> {
    signature: String,
    func: F,
}

pub struct FunctionTable<F> {
    slots: Vec<Option<Slot<F>>>,
    capacity: usize,
    /// Signatures that have a dispatcher (declared or registered under).
    dispatchers: BTreeSet<String>,
}

impl<F> FunctionTable<F> {
    /// Create a table with `capacity` slots, index 0 included.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
            dispatchers: BTreeSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make `signature` dispatchable even before anything is registered.
    pub fn declare(&mut self, signature: &str) -> Result<(), TableError> {
        Signature::from_str(signature)?;
        self.dispatchers.insert(signature.into());
        Ok(())
    }

    pub fn has_dispatcher(&self, signature: &str) -> bool {
        self.dispatchers.contains(signature)
    }

    /// Place `func` in the first free slot at index 1 or above.
    pub fn register(&mut self, func: F, signature: &str) -> Result<u32, TableError> {
        self.declare(signature)?;
        let free = (1..self.capacity).find(|&i| self.slots.get(i).map_or(true, Option::is_none));
        let index = free.ok_or(TableError::Exhausted {
            capacity: self.capacity,
        })?;
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index] = Some(Slot {
            signature: signature.into(),
            func,
        });
        Ok(index as u32)
    }

    /// Clear slot `index`. Other slots keep their indices.
    pub fn unregister(&mut self, index: u32) -> Result<Option<F>, TableError> {
        let idx = index as usize;
        if idx == 0 || idx >= self.capacity {
            return Err(TableError::OutOfRange { index });
        }
        Ok(self
            .slots
            .get_mut(idx)
            .and_then(Option::take)
            .map(|slot| slot.func))
    }

    /// Resolve a call of `signature` through `index`.
    ///
    /// - `MissingDispatcher` if nothing ever declared `signature`
    /// - `InvalidFunctionPointer` if the slot is empty, null, or holds a
    ///   function of another signature
    pub fn lookup(&self, signature: &str, index: u32) -> FaultResult<&F> {
        if !self.has_dispatcher(signature) {
            return Err(Fault::MissingDispatcher {
                signature: signature.into(),
            });
        }
        self.slots
            .get(index as usize)
            .and_then(Option::as_ref)
            .filter(|slot| index != 0 && slot.signature == signature)
            .map(|slot| &slot.func)
            .ok_or_else(|| Fault::InvalidFunctionPointer {
                signature: signature.into(),
                index,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type HostFn = fn(i32) -> i32;

    fn double(x: i32) -> i32 {
        x * 2
    }

    fn negate(x: i32) -> i32 {
        -x
    }

    #[test]
    fn signature_parsing() {
        let sig: Signature = "vij".parse().unwrap();
        assert_eq!(sig.result(), None);
        assert_eq!(sig.params(), &[ValueType::I32, ValueType::I64]);
        assert_eq!(
            Signature::from_types(&[ValueType::F64], Some(ValueType::I32)).as_str(),
            "id"
        );
        assert_eq!(
            "".parse::<Signature>(),
            Err(TableError::BadSignature(String::new()))
        );
        assert!("vx".parse::<Signature>().is_err());
    }

    #[test]
    fn register_is_first_fit_from_one() {
        let mut table: FunctionTable<HostFn> = FunctionTable::new(4);
        assert_eq!(table.register(double, "ii"), Ok(1));
        assert_eq!(table.register(negate, "ii"), Ok(2));
        table.unregister(1).unwrap();
        assert_eq!(table.register(negate, "ii"), Ok(1));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn register_fails_when_full() {
        let mut table: FunctionTable<HostFn> = FunctionTable::new(3);
        table.register(double, "ii").unwrap();
        table.register(double, "ii").unwrap();
        assert_eq!(
            table.register(double, "ii"),
            Err(TableError::Exhausted { capacity: 3 })
        );
    }

    #[test]
    fn unregister_does_not_compact() {
        let mut table: FunctionTable<HostFn> = FunctionTable::new(8);
        table.register(double, "ii").unwrap();
        table.register(negate, "ii").unwrap();
        table.unregister(1).unwrap();
        let f = table.lookup("ii", 2).unwrap();
        assert_eq!(f(5), -5);
        assert_eq!(table.unregister(0), Err(TableError::OutOfRange { index: 0 }));
    }

    #[test]
    fn lookup_checks_signature_and_slot() {
        let mut table: FunctionTable<HostFn> = FunctionTable::new(8);
        table.declare("vi").unwrap();
        let idx = table.register(double, "ii").unwrap();
        assert_eq!(table.lookup("ii", idx).map(|f| f(21)), Ok(42));
        assert_eq!(
            table.lookup("vi", idx).err(),
            Some(Fault::InvalidFunctionPointer {
                signature: "vi".into(),
                index: idx
            })
        );
        assert!(matches!(
            table.lookup("ii", 0),
            Err(Fault::InvalidFunctionPointer { index: 0, .. })
        ));
        assert!(matches!(
            table.lookup("ii", 7),
            Err(Fault::InvalidFunctionPointer { index: 7, .. })
        ));
        assert_eq!(
            table.lookup("dd", 1).err(),
            Some(Fault::MissingDispatcher {
                signature: "dd".into()
            })
        );
    }
}
