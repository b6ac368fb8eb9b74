use anyhow::{Context, Result};
use clap::Parser;
use emhost::{AbortSignal, Hooks, ModuleSource, Runtime, RuntimeConfig};
use log::{LevelFilter, Log, Metadata, Record};

/// emhost: run an emscripten-compiled WebAssembly module.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Module to run: a path, or an http(s) URL with the `fetch` feature
    input: String,

    /// Arguments passed to `main` after the program name
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Stack size in bytes
    #[arg(long, default_value_t = 5 * 1024 * 1024)]
    stack_size: u32,

    /// Initial memory size in bytes
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    memory_size: u32,

    /// Let the module grow its memory
    #[arg(long)]
    allow_memory_growth: bool,

    /// Upper bound for growth in bytes
    #[arg(long)]
    maximum_memory: Option<usize>,

    /// Slots reserved for host functions in the function table
    #[arg(long, default_value_t = 64)]
    table_capacity: usize,

    /// Instantiate and run initializers without calling `main`
    #[arg(long)]
    no_main: bool,

    /// Compile the module on a worker thread
    #[arg(long = "async")]
    asynchronous: bool,

    /// Value of argv[0]
    #[arg(long, default_value = "./this.program")]
    program_name: String,

    /// Log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn config(&self) -> RuntimeConfig {
        RuntimeConfig {
            arguments: self.args.clone(),
            program_name: self.program_name.clone(),
            total_stack: self.stack_size,
            total_memory: self.memory_size,
            growable_memory: self.allow_memory_growth,
            maximum_memory: self.maximum_memory,
            table_capacity: self.table_capacity,
            run_automatically: !self.no_main,
            ..RuntimeConfig::default()
        }
    }

    fn level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

struct StderrLog;

impl Log for StderrLog {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("emhost: [{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLog = StderrLog;

fn run(cli: &Cli) -> Result<i32> {
    let source = ModuleSource::from_arg(&cli.input);
    let config = cli.config();
    let runtime = if cli.asynchronous {
        let mut runtime = Runtime::instantiate_async(source, config, Hooks::default())?;
        runtime.wait()?;
        runtime
    } else {
        Runtime::instantiate(source, config, Hooks::default())?
    };
    Ok(runtime.exit_status().unwrap_or(0))
}

fn main() {
    let cli = Cli::parse();
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(cli.level());
    }
    log::info!("running {}", cli.input);

    match run(&cli).with_context(|| format!("failed to run {}", cli.input)) {
        Ok(code) => std::process::exit(code),
        // The message already went to stderr through the abort path.
        Err(err) if err.is::<AbortSignal>() => std::process::abort(),
        Err(err) => {
            eprintln!("emhost: {err:#}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_defaults() {
        let cli = Cli::parse_from(["emhost", "hello.wasm"]);
        assert_eq!(cli.input, "hello.wasm");
        assert!(cli.args.is_empty());
        assert!(!cli.no_main);
        let config = cli.config();
        assert_eq!(config.total_stack, 5 * 1024 * 1024);
        assert_eq!(config.program_name, "./this.program");
        assert!(config.run_automatically);
        assert_eq!(cli.level(), LevelFilter::Warn);
    }

    #[test]
    fn trailing_arguments_go_to_main() {
        let cli = Cli::parse_from(["emhost", "-vv", "prog.wasm", "--flag", "x"]);
        assert_eq!(cli.args, ["--flag", "x"]);
        assert_eq!(cli.level(), LevelFilter::Debug);
    }
}
