//! emhost: host runtime for emscripten-style WebAssembly modules.
//!
//! The module is compiled with `wasmtime`; its imports (memory, layout
//! globals, math, syscalls, C++ exception support and the `invoke_`,
//! `jsCall_` and `nullFunc_` trampolines) are supplied from the import
//! section, so the same host runs any module built against the classic
//! glue ABI. Engine-independent state lives in `emhost-runtime`.
//!
//! ```no_run
//! use emhost::{ArgKind, HostValue, ModuleSource, ReturnKind, Runtime, RuntimeConfig, Hooks};
//!
//! let mut runtime = Runtime::instantiate(
//!     ModuleSource::from_arg("hello.wasm"),
//!     RuntimeConfig::default(),
//!     Hooks::default(),
//! )?;
//! let n = runtime.call("add", ReturnKind::Number, &[ArgKind::Number; 2], &[1.into(), 2.into()])?;
//! assert_eq!(n, HostValue::from(3));
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod call;
pub mod config;
pub mod context;
pub mod error;
mod imports;
pub mod parser;
pub mod runtime;
pub mod source;
mod stack;

pub use anyhow::{Context, Result};
pub use call::{ArgKind, HostValue, ReturnKind, WrappedExport};
pub use config::{Hooks, PrintFn, RuntimeConfig};
pub use context::{HostCall, HostFunction, HostState, Stdio};
pub use error::{NotReady, TrampolineMismatch, UnknownExport, UnresolvedImports};
pub use runtime::{Callback, Runtime, INSTANTIATE_DEPENDENCY};
pub use source::ModuleSource;

pub use emhost_runtime::{
    AbortSignal, ExitStatus, Fault, Longjmp, PageStrategy, Phase, Scalar, ThrownException,
};
