//! Startup gating: run dependencies and ordered phase callbacks.

use alloc::collections::{BTreeSet, VecDeque};
use alloc::string::String;

/// Startup and shutdown phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    PreRun,
    Init,
    PreMain,
    Exit,
    PostRun,
}

impl Phase {
    const COUNT: usize = 5;

    fn slot(self) -> usize {
        self as usize
    }
}

/// What removing a dependency did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The id was not pending.
    Unknown,
    /// Other dependencies are still pending.
    Pending(usize),
    /// The set is empty but nobody is waiting on it.
    Idle,
    /// The set became empty and the armed waiter must run now. The waiter
    /// is disarmed; it re-arms itself by calling `arm` if it defers again.
    Fulfilled,
}

/// Named units of pending work that hold back `run`.
#[derive(Debug, Default)]
pub struct RunDependencies {
    pending: BTreeSet<String>,
    armed: bool,
}

impl RunDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `id` was already pending.
    pub fn add(&mut self, id: &str) -> bool {
        self.pending.insert(id.into())
    }

    pub fn remove(&mut self, id: &str) -> Removal {
        if !self.pending.remove(id) {
            return Removal::Unknown;
        }
        if !self.pending.is_empty() {
            return Removal::Pending(self.pending.len());
        }
        if core::mem::take(&mut self.armed) {
            Removal::Fulfilled
        } else {
            Removal::Idle
        }
    }

    /// Ask to be told (via `Removal::Fulfilled`) once the set empties.
    pub fn arm(&mut self) {
        self.armed = true;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains(id)
    }
}

/// FIFO callback queues, one per phase.
///
/// Draining a phase with `pop` picks up callbacks pushed while the phase is
/// running. Once a phase is closed, further pushes to it are refused.
pub struct PhaseQueue<T> {
    queues: [VecDeque<T>; Phase::COUNT],
    closed: [bool; Phase::COUNT],
}

impl<T> Default for PhaseQueue<T> {
    fn default() -> Self {
        Self {
            queues: core::array::from_fn(|_| VecDeque::new()),
            closed: [false; Phase::COUNT],
        }
    }
}

impl<T> PhaseQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `item` for `phase`. Gives it back if the phase already closed.
    pub fn push(&mut self, phase: Phase, item: T) -> Result<(), T> {
        if self.closed[phase.slot()] {
            return Err(item);
        }
        self.queues[phase.slot()].push_back(item);
        Ok(())
    }

    pub fn pop(&mut self, phase: Phase) -> Option<T> {
        self.queues[phase.slot()].pop_front()
    }

    pub fn close(&mut self, phase: Phase) {
        self.closed[phase.slot()] = true;
    }

    pub fn is_closed(&self, phase: Phase) -> bool {
        self.closed[phase.slot()]
    }

    pub fn len(&self, phase: Phase) -> usize {
        self.queues[phase.slot()].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn fires_once_when_armed_set_empties() {
        let mut deps = RunDependencies::new();
        assert!(deps.add("wasm-instantiate"));
        assert!(!deps.add("wasm-instantiate"));
        assert!(deps.add("preload"));
        deps.arm();

        assert_eq!(deps.remove("wasm-instantiate"), Removal::Pending(1));
        assert_eq!(deps.remove("missing"), Removal::Unknown);
        assert_eq!(deps.remove("preload"), Removal::Fulfilled);
        assert!(!deps.is_armed());

        deps.add("late");
        assert_eq!(deps.remove("late"), Removal::Idle);
    }

    #[test]
    fn rearms_when_new_work_appears_before_firing() {
        let mut deps = RunDependencies::new();
        deps.add("a");
        deps.arm();
        deps.add("b");
        assert_eq!(deps.remove("a"), Removal::Pending(1));
        assert!(deps.is_armed());
        assert_eq!(deps.remove("b"), Removal::Fulfilled);
    }

    #[test]
    fn phase_queue_is_fifo_and_drains_late_pushes() {
        let mut queue: PhaseQueue<u32> = PhaseQueue::new();
        queue.push(Phase::Init, 1).unwrap();
        queue.push(Phase::Init, 2).unwrap();
        queue.push(Phase::PostRun, 9).unwrap();

        let mut order = Vec::new();
        while let Some(item) = queue.pop(Phase::Init) {
            if item == 1 {
                queue.push(Phase::Init, 3).unwrap();
            }
            order.push(item);
        }
        queue.close(Phase::Init);
        assert_eq!(order, [1, 2, 3]);
        assert_eq!(queue.push(Phase::Init, 4), Err(4));
        assert_eq!(queue.len(Phase::PostRun), 1);
    }
}
