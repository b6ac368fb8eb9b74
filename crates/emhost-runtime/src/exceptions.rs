//! C++ exception bookkeeping.
//!
//! Records are keyed by the address of the thrown payload. A record is
//! created by `throw` with a reference count of zero, gains a reference
//! when a handler begins catching it and loses one when the handler ends.
//! When the count drops to zero and the record is not marked `rethrown`,
//! it is removed and the caller receives a `Disposal` telling it which
//! destructor to run and which payload to free.
//!
//! The table does not call into the module itself: destructor calls,
//! `free` and the `__cxa_can_catch` type check are done by the caller.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use crate::{Fault, FaultResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionRecord {
    pub ptr: u32,
    /// Payload address after base-class adjustment by the matching catch.
    pub adjusted: u32,
    /// Address of the thrown type's `type_info`; 0 if unknown.
    pub type_id: u32,
    /// Table index of the destructor; 0 if none.
    pub destructor: u32,
    pub refcount: u32,
    pub caught: bool,
    pub rethrown: bool,
}

/// Work left to the caller after a record is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disposal {
    pub ptr: u32,
    pub destructor: Option<u32>,
}

/// Result of `find_matching_catch`: the payload address to hand to the
/// landing pad and the selector (matched catch type) it branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchMatch {
    pub ptr: u32,
    pub selector: u32,
}

/// A structured exception unwinding through host frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrownException {
    pub ptr: u32,
}

impl fmt::Display for ThrownException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exception thrown: {}", self.ptr)
    }
}

impl core::error::Error for ThrownException {}

/// `longjmp` unwinding to the `setjmp` buffer at `env`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Longjmp {
    pub env: u32,
    pub value: i32,
}

impl fmt::Display for Longjmp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "longjmp to {} with value {}", self.env, self.value)
    }
}

impl core::error::Error for Longjmp {}

#[derive(Debug, Default)]
pub struct ExceptionTable {
    infos: BTreeMap<u32, ExceptionRecord>,
    /// Payloads currently held by catch handlers, innermost last.
    caught: Vec<u32>,
    /// Most recently thrown payload; 0 when none is in flight.
    last: u32,
    uncaught: u32,
}

impl ExceptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ptr: u32) -> Option<&ExceptionRecord> {
        self.infos.get(&ptr)
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn last(&self) -> u32 {
        self.last
    }

    /// Number of thrown exceptions not yet caught.
    pub fn uncaught(&self) -> u32 {
        self.uncaught
    }

    pub fn caught_depth(&self) -> usize {
        self.caught.len()
    }

    /// Map an adjusted payload address back to the record's key.
    pub fn de_adjust(&self, adjusted: u32) -> u32 {
        if adjusted == 0 || self.infos.contains_key(&adjusted) {
            return adjusted;
        }
        self.infos
            .values()
            .find(|info| info.adjusted == adjusted)
            .map_or(adjusted, |info| info.ptr)
    }

    pub fn throw(&mut self, ptr: u32, type_id: u32, destructor: u32) -> ThrownException {
        self.infos.insert(
            ptr,
            ExceptionRecord {
                ptr,
                adjusted: ptr,
                type_id,
                destructor,
                refcount: 0,
                caught: false,
                rethrown: false,
            },
        );
        self.last = ptr;
        self.uncaught += 1;
        ThrownException { ptr }
    }

    /// Take one reference. Null is ignored; any other pointer must name a
    /// live record.
    pub fn add_ref(&mut self, ptr: u32) -> FaultResult<()> {
        if ptr == 0 {
            return Ok(());
        }
        let info = self
            .infos
            .get_mut(&ptr)
            .ok_or(Fault::ExceptionTableCorrupted { ptr })?;
        info.refcount += 1;
        Ok(())
    }

    /// Drop one reference. Destroys the record at zero unless rethrown.
    pub fn dec_ref(&mut self, ptr: u32) -> FaultResult<Option<Disposal>> {
        if ptr == 0 {
            return Ok(None);
        }
        let info = self
            .infos
            .get_mut(&ptr)
            .ok_or(Fault::ExceptionTableCorrupted { ptr })?;
        if info.refcount == 0 {
            return Err(Fault::ExceptionTableCorrupted { ptr });
        }
        info.refcount -= 1;
        if info.refcount > 0 || info.rethrown {
            return Ok(None);
        }
        let destructor = (info.destructor != 0).then_some(info.destructor);
        self.infos.remove(&ptr);
        Ok(Some(Disposal { ptr, destructor }))
    }

    /// `__cxa_begin_catch`: returns the payload address handed to the handler.
    pub fn begin_catch(&mut self, ptr: u32) -> FaultResult<u32> {
        let key = self.de_adjust(ptr);
        if key != 0 {
            let info = self
                .infos
                .get_mut(&key)
                .ok_or(Fault::ExceptionTableCorrupted { ptr: key })?;
            if !info.caught {
                info.caught = true;
                self.uncaught = self.uncaught.saturating_sub(1);
            }
            info.rethrown = false;
        }
        self.add_ref(key)?;
        self.caught.push(ptr);
        Ok(ptr)
    }

    /// `__cxa_end_catch`: release the innermost handler's reference.
    pub fn end_catch(&mut self) -> FaultResult<Option<Disposal>> {
        let Some(ptr) = self.caught.pop() else {
            return Ok(None);
        };
        let disposal = self.dec_ref(self.de_adjust(ptr))?;
        self.last = 0;
        Ok(disposal)
    }

    /// `__cxa_rethrow`: the innermost caught exception goes back in flight.
    pub fn rethrow(&mut self) -> FaultResult<ThrownException> {
        let ptr = self.caught.pop().ok_or(Fault::NoActiveException)?;
        let ptr = self.de_adjust(ptr);
        let info = self
            .infos
            .get_mut(&ptr)
            .ok_or(Fault::ExceptionTableCorrupted { ptr })?;
        if !info.rethrown {
            info.rethrown = true;
            self.caught.push(ptr);
        }
        self.last = ptr;
        Ok(ThrownException { ptr })
    }

    /// `__resumeException`: continue unwinding `ptr`.
    pub fn resume(&mut self, ptr: u32) -> ThrownException {
        if self.last == 0 {
            self.last = ptr;
        }
        ThrownException { ptr }
    }

    /// `__cxa_free_exception`: forget a payload that was never thrown.
    pub fn free(&mut self, ptr: u32) {
        self.infos.remove(&ptr);
    }

    /// Pick the landing pad for the in-flight exception.
    ///
    /// `can_catch(catch_type, thrown_type, ptr)` returns the adjusted payload
    /// address if a handler for `catch_type` accepts the exception. Zero
    /// candidates are skipped. Without a match the thrown type is the
    /// selector and the payload is returned unadjusted.
    pub fn find_matching_catch<E>(
        &mut self,
        candidates: &[u32],
        mut can_catch: impl FnMut(u32, u32, u32) -> Result<Option<u32>, E>,
    ) -> Result<CatchMatch, E> {
        let thrown = self.last;
        if thrown == 0 {
            return Ok(CatchMatch {
                ptr: 0,
                selector: 0,
            });
        }
        let thrown_type = self.infos.get(&thrown).map_or(0, |info| info.type_id);
        if thrown_type == 0 {
            return Ok(CatchMatch {
                ptr: thrown,
                selector: 0,
            });
        }
        for &catch_type in candidates.iter().filter(|&&t| t != 0) {
            if let Some(adjusted) = can_catch(catch_type, thrown_type, thrown)? {
                if let Some(info) = self.infos.get_mut(&thrown) {
                    info.adjusted = adjusted;
                }
                return Ok(CatchMatch {
                    ptr: adjusted,
                    selector: catch_type,
                });
            }
        }
        Ok(CatchMatch {
            ptr: thrown,
            selector: thrown_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;

    const PAYLOAD: u32 = 5_243_008;
    const INT_TYPE: u32 = 2_000;
    const DTOR: u32 = 7;

    #[test]
    fn throw_catch_end_destroys_once() {
        let mut table = ExceptionTable::new();
        table.throw(PAYLOAD, INT_TYPE, DTOR);
        assert_eq!(table.uncaught(), 1);
        assert_eq!(table.record(PAYLOAD).map(|r| r.refcount), Some(0));

        table.begin_catch(PAYLOAD).unwrap();
        assert_eq!(table.record(PAYLOAD).map(|r| r.refcount), Some(1));
        assert_eq!(table.uncaught(), 0);

        let disposal = table.end_catch().unwrap();
        assert_eq!(
            disposal,
            Some(Disposal {
                ptr: PAYLOAD,
                destructor: Some(DTOR)
            })
        );
        assert!(table.is_empty());
        assert_eq!(table.last(), 0);
        assert_eq!(table.end_catch(), Ok(None));
    }

    #[test]
    fn rethrow_defers_destruction_to_outer_handler() {
        let mut table = ExceptionTable::new();
        table.throw(PAYLOAD, INT_TYPE, 0);
        table.begin_catch(PAYLOAD).unwrap();
        assert_eq!(table.rethrow(), Ok(ThrownException { ptr: PAYLOAD }));
        assert!(table.record(PAYLOAD).unwrap().rethrown);

        table.begin_catch(PAYLOAD).unwrap();
        assert_eq!(table.record(PAYLOAD).map(|r| r.refcount), Some(2));
        assert_eq!(table.end_catch(), Ok(None));
        assert_eq!(table.len(), 1);

        let disposal = table.end_catch().unwrap();
        assert_eq!(
            disposal,
            Some(Disposal {
                ptr: PAYLOAD,
                destructor: None
            })
        );
        assert!(table.is_empty());
    }

    #[test]
    fn rethrown_record_survives_reaching_zero() {
        let mut table = ExceptionTable::new();
        table.throw(PAYLOAD, INT_TYPE, DTOR);
        table.begin_catch(PAYLOAD).unwrap();
        table.rethrow().unwrap();
        // The handler that rethrew ends; the record stays for the next one.
        table.caught.pop();
        assert_eq!(table.dec_ref(PAYLOAD), Ok(None));
        assert_eq!(table.record(PAYLOAD).map(|r| r.refcount), Some(0));
    }

    #[test]
    fn new_throw_while_rethrown_keeps_both_records() {
        const OTHER: u32 = 6_000_000;
        let mut table = ExceptionTable::new();
        table.throw(PAYLOAD, INT_TYPE, 0);
        table.begin_catch(PAYLOAD).unwrap();
        table.rethrow().unwrap();

        // A handler for the rethrown exception throws something new
        // before it ever begins catching the rethrown payload.
        table.throw(OTHER, INT_TYPE, 0);
        assert_eq!(table.last(), OTHER);
        table.begin_catch(OTHER).unwrap();
        let disposal = table.end_catch().unwrap();
        assert_eq!(disposal.map(|d| d.ptr), Some(OTHER));

        let pending = table.record(PAYLOAD).copied().unwrap();
        assert!(pending.rethrown);
        assert_eq!(pending.refcount, 1);
        assert_eq!(table.caught_depth(), 1);
    }

    #[test]
    fn dec_ref_below_zero_is_a_fault() {
        let mut table = ExceptionTable::new();
        table.throw(PAYLOAD, INT_TYPE, 0);
        assert_eq!(
            table.dec_ref(PAYLOAD),
            Err(Fault::ExceptionTableCorrupted { ptr: PAYLOAD })
        );
    }

    #[test]
    fn catching_a_destroyed_payload_is_a_fault() {
        let mut table = ExceptionTable::new();
        table.throw(PAYLOAD, INT_TYPE, 0);
        table.begin_catch(PAYLOAD).unwrap();
        assert!(table.end_catch().unwrap().is_some());

        assert_eq!(
            table.begin_catch(PAYLOAD),
            Err(Fault::ExceptionTableCorrupted { ptr: PAYLOAD })
        );
        assert_eq!(table.caught_depth(), 0);
        assert_eq!(table.end_catch(), Ok(None));
    }

    #[test]
    fn unknown_payloads_are_faults() {
        let mut table = ExceptionTable::new();
        assert_eq!(
            table.add_ref(PAYLOAD),
            Err(Fault::ExceptionTableCorrupted { ptr: PAYLOAD })
        );
        assert_eq!(
            table.dec_ref(PAYLOAD),
            Err(Fault::ExceptionTableCorrupted { ptr: PAYLOAD })
        );
    }

    #[test]
    fn null_payload_is_not_counted() {
        let mut table = ExceptionTable::new();
        assert_eq!(table.add_ref(0), Ok(()));
        assert_eq!(table.dec_ref(0), Ok(None));
        assert_eq!(table.begin_catch(0), Ok(0));
        assert_eq!(table.end_catch(), Ok(None));
        assert!(table.is_empty());
    }

    #[test]
    fn rethrow_without_catch_is_a_fault() {
        let mut table = ExceptionTable::new();
        assert_eq!(table.rethrow(), Err(Fault::NoActiveException));
    }

    #[test]
    fn matching_catch_adjusts_payload() {
        const BASE_TYPE: u32 = 3_000;
        let mut table = ExceptionTable::new();
        table.throw(PAYLOAD, INT_TYPE, 0);
        let found = table
            .find_matching_catch(&[0, 1_111, BASE_TYPE], |catch_type, thrown, ptr| {
                assert_eq!(thrown, INT_TYPE);
                Ok::<_, Infallible>((catch_type == BASE_TYPE).then_some(ptr + 8))
            })
            .unwrap();
        assert_eq!(
            found,
            CatchMatch {
                ptr: PAYLOAD + 8,
                selector: BASE_TYPE
            }
        );
        assert_eq!(table.de_adjust(PAYLOAD + 8), PAYLOAD);

        table.begin_catch(PAYLOAD + 8).unwrap();
        assert_eq!(table.record(PAYLOAD).map(|r| r.refcount), Some(1));
        assert!(table.end_catch().unwrap().is_some());
    }

    #[test]
    fn no_match_defaults_to_thrown_type() {
        let mut table = ExceptionTable::new();
        table.throw(PAYLOAD, INT_TYPE, 0);
        let found = table
            .find_matching_catch(&[1, 2], |_, _, _| Ok::<_, Infallible>(None))
            .unwrap();
        assert_eq!(
            found,
            CatchMatch {
                ptr: PAYLOAD,
                selector: INT_TYPE
            }
        );
    }

    #[test]
    fn nothing_in_flight_selects_zero() {
        let mut table = ExceptionTable::new();
        let found = table
            .find_matching_catch(&[1], |_, _, _| Ok::<_, Infallible>(Some(1)))
            .unwrap();
        assert_eq!(found, CatchMatch { ptr: 0, selector: 0 });
    }

    #[test]
    fn resume_only_sets_last_when_idle() {
        let mut table = ExceptionTable::new();
        table.resume(PAYLOAD);
        assert_eq!(table.last(), PAYLOAD);
        table.resume(PAYLOAD + 4);
        assert_eq!(table.last(), PAYLOAD);
    }
}
