//! The single abort path and the `exit` outcome.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use crate::Fault;

/// Unrecoverable termination. Carries the final, decorated message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortSignal {
    pub message: String,
}

impl fmt::Display for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl core::error::Error for AbortSignal {}

/// The module called `exit` (or returned from `main` while the runtime
/// tears down).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit({})", self.code)
    }
}

impl core::error::Error for ExitStatus {}

type AbortHook = Box<dyn FnMut(&str) + Send>;
/// `(message, what) -> message`
type Decorator = Box<dyn Fn(&str, &str) -> String + Send>;

#[derive(Default)]
pub struct AbortController {
    on_abort: Option<AbortHook>,
    decorators: Vec<Decorator>,
    halted: bool,
    exit_status: Option<i32>,
}

impl fmt::Debug for AbortController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortController")
            .field("halted", &self.halted)
            .field("exit_status", &self.exit_status)
            .field("decorators", &self.decorators.len())
            .finish_non_exhaustive()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook run with the raw reason before anything else happens.
    pub fn set_hook(&mut self, hook: impl FnMut(&str) + Send + 'static) {
        self.on_abort = Some(Box::new(hook));
    }

    /// Decorators rewrite the final message, in registration order.
    pub fn add_decorator(&mut self, decorator: impl Fn(&str, &str) -> String + Send + 'static) {
        self.decorators.push(Box::new(decorator));
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// Abort with `what`. The hook runs first, then `emit` receives the raw
    /// reason as diagnostic output; the returned signal carries the
    /// decorated message and must be propagated, never swallowed.
    pub fn abort(&mut self, what: &str, emit: impl FnOnce(&str)) -> AbortSignal {
        if let Some(hook) = self.on_abort.as_mut() {
            hook(what);
        }
        emit(what);
        self.halted = true;
        self.exit_status = Some(1);
        let mut message = format!("abort({what})");
        for decorate in &self.decorators {
            message = decorate(&message, what);
        }
        AbortSignal { message }
    }

    pub fn fault(&mut self, fault: &Fault, emit: impl FnOnce(&str)) -> AbortSignal {
        self.abort(&fault.to_string(), emit)
    }

    /// Record a normal exit. The runtime is halted afterwards as well.
    pub fn exit(&mut self, code: i32) -> ExitStatus {
        self.halted = true;
        self.exit_status = Some(code);
        ExitStatus { code }
    }

    /// Refuse entry into a halted runtime.
    pub fn ensure_running(&self) -> Result<(), AbortSignal> {
        if self.halted {
            return Err(AbortSignal {
                message: String::from("program has already aborted or exited"),
            });
        }
        Ok(())
    }
}
