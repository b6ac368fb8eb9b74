//! Runtime configuration and host callbacks.

use std::fmt;
use std::sync::Arc;

use emhost_runtime::PageStrategy;

use crate::runtime::Callback;

/// Sink for one line of module output.
pub type PrintFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Recognized runtime options.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Arguments passed to `main` after the program name.
    pub arguments: Vec<String>,
    /// `argv[0]`.
    pub program_name: String,
    /// Bytes reserved for the stack region.
    pub total_stack: u32,
    /// Initial linear memory size; a multiple of 64 KiB.
    pub total_memory: u32,
    pub growable_memory: bool,
    /// Growth ceiling in bytes; `None` means the 4 GiB address space.
    pub maximum_memory: Option<usize>,
    /// Host function table slots, including the reserved null slot.
    pub table_capacity: usize,
    /// Invoke `main` as part of startup.
    pub run_automatically: bool,
    pub page_strategy: PageStrategy,
    /// Size of the module's static data. Derived from its data segments
    /// when `None`.
    pub static_bump: Option<u32>,
    /// Tear the runtime down when `main` returns. When `false`, a zero
    /// return keeps the runtime alive for further calls.
    pub exit_runtime_on_return: bool,
    /// Signatures made dispatchable through the host function table even if
    /// the module declares no `jsCall_` trampoline for them.
    pub extra_signatures: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            arguments: Vec::new(),
            program_name: "./this.program".to_string(),
            total_stack: 5 * 1024 * 1024,
            total_memory: 16 * 1024 * 1024,
            growable_memory: false,
            maximum_memory: None,
            table_capacity: 64,
            run_automatically: true,
            page_strategy: PageStrategy::Wasm,
            static_bump: None,
            exit_runtime_on_return: true,
            extra_signatures: Vec::new(),
        }
    }
}

/// Callbacks observed by the runtime. Everything is optional except the
/// print sinks, which default to the process's stdout and stderr.
pub struct Hooks {
    /// Runs with the raw reason before an abort is reported.
    pub on_abort: Option<Box<dyn FnMut(&str) + Send>>,
    /// Runs once the runtime is initialized, before `main`.
    pub on_runtime_ready: Option<Callback>,
    /// Runs with the exit status when the runtime exits.
    pub on_exit: Option<Box<dyn FnMut(i32)>>,
    pub print: PrintFn,
    pub print_err: PrintFn,
    /// Rewrites a module path or URL before it is read.
    pub locate_resource: Option<Box<dyn Fn(&str) -> String + Send>>,
    /// Initial memory contents; must be exactly `total_memory` bytes.
    pub provided_buffer: Option<Vec<u8>>,
    /// Callbacks for the pre-run phase, in order.
    pub pre_run: Vec<Callback>,
    /// Callbacks for the post-run phase, in order.
    pub post_run: Vec<Callback>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            on_abort: None,
            on_runtime_ready: None,
            on_exit: None,
            print: Arc::new(|line: &str| println!("{line}")),
            print_err: Arc::new(|line: &str| eprintln!("{line}")),
            locate_resource: None,
            provided_buffer: None,
            pre_run: Vec::new(),
            post_run: Vec::new(),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_abort", &self.on_abort.is_some())
            .field("on_runtime_ready", &self.on_runtime_ready.is_some())
            .field("on_exit", &self.on_exit.is_some())
            .field("locate_resource", &self.locate_resource.is_some())
            .field("provided_buffer", &self.provided_buffer.as_ref().map(Vec::len))
            .field("pre_run", &self.pre_run.len())
            .field("post_run", &self.post_run.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_classic_layout() {
        let config = RuntimeConfig::default();
        assert_eq!(config.program_name, "./this.program");
        assert_eq!(config.total_stack, 5_242_880);
        assert_eq!(config.total_memory, 16_777_216);
        assert!(config.run_automatically);
        assert!(!config.growable_memory);
        assert_eq!(config.total_memory as usize % emhost_runtime::WASM_PAGE_SIZE, 0);
    }
}
