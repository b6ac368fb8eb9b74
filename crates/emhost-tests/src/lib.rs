//! Shared setup for the end-to-end scenarios: WAT fixtures from `data/`,
//! a compact memory layout and captured module output.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use emhost::{Hooks, ModuleSource, Runtime, RuntimeConfig};

/// Assemble `data/<name>.wat`.
pub fn fixture(name: &str) -> Result<Vec<u8>> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("data")
        .join(format!("{name}.wat"));
    wat::parse_file(&path).with_context(|| format!("failed to assemble {}", path.display()))
}

/// 1 MiB of memory with a 64 KiB stack; `main` is not run.
pub fn small_config() -> RuntimeConfig {
    RuntimeConfig {
        total_memory: 1 << 20,
        total_stack: 64 << 10,
        run_automatically: false,
        ..RuntimeConfig::default()
    }
}

/// Lines the module printed, per stream.
#[derive(Clone, Default)]
pub struct Output {
    out: Arc<Mutex<Vec<String>>>,
    err: Arc<Mutex<Vec<String>>>,
}

impl Output {
    /// Hooks whose print sinks record into this buffer.
    pub fn hooks(&self) -> Hooks {
        let out = Arc::clone(&self.out);
        let err = Arc::clone(&self.err);
        Hooks {
            print: Arc::new(move |line: &str| {
                if let Ok(mut lines) = out.lock() {
                    lines.push(line.to_string());
                }
            }),
            print_err: Arc::new(move |line: &str| {
                if let Ok(mut lines) = err.lock() {
                    lines.push(line.to_string());
                }
            }),
            ..Hooks::default()
        }
    }

    pub fn stdout(&self) -> Vec<String> {
        self.out.lock().map(|lines| lines.clone()).unwrap_or_default()
    }

    pub fn stderr(&self) -> Vec<String> {
        self.err.lock().map(|lines| lines.clone()).unwrap_or_default()
    }
}

/// Instantiate fixture `name` synchronously.
pub fn load(name: &str, config: RuntimeConfig, hooks: Hooks) -> Result<Runtime> {
    Runtime::instantiate(ModuleSource::Bytes(fixture(name)?), config, hooks)
}

/// Instantiate fixture `name` with `small_config` and captured output.
pub fn load_quiet(name: &str) -> Result<(Runtime, Output)> {
    let output = Output::default();
    let runtime = load(name, small_config(), output.hooks())?;
    Ok((runtime, output))
}
