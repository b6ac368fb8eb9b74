//! The runtime driver: instantiation, startup phases, `main`, and exit.

use std::iter;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use emhost_runtime::{
    AbortSignal, ExitStatus, GrowthPolicy, LayoutBuilder, LinearMemory, Longjmp, MemoryLayout,
    Phase, PhaseQueue, Removal, RunDependencies, Scalar, ThrownException, ValueKind,
    WASM_PAGE_SIZE,
};
use wasmtime::{AsContextMut, Engine, Func, Instance, Linker, Memory, MemoryType, Store, Trap, Val, ValType};

use crate::config::{Hooks, RuntimeConfig};
use crate::context::{
    self, abort, call_func, check_stack_cookie, fault, to_scalar, to_val, with_view, with_view_mut,
    HostCall, HostFunction, HostState, ModuleStack, Stdio,
};
use crate::error::{NotReady, UnknownExport};
use crate::imports;
use crate::parser::{self, ModuleInterface};
use crate::source::{self, Loaded, ModuleSource, PendingModule};
use crate::stack;

/// A callback queued for a startup or shutdown phase.
pub type Callback = Box<dyn FnOnce(&mut Runtime) -> Result<()>>;

/// Held while the module is being acquired and instantiated.
pub const INSTANTIATE_DEPENDENCY: &str = "wasm-instantiate";

/// How `main` finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MainOutcome {
    Returned(i32),
    /// `exit` was called, or an exception escaped; teardown already ran.
    Exited(i32),
}

pub(crate) struct Live {
    pub store: Store<HostState>,
    pub instance: Instance,
    pub interface: ModuleInterface,
}

/// One instantiated module and the host state around it.
pub struct Runtime {
    engine: Engine,
    config: RuntimeConfig,
    hooks: Hooks,
    phases: PhaseQueue<Callback>,
    dependencies: RunDependencies,
    pending: Option<PendingModule>,
    pub(crate) live: Option<Live>,
    called_run: bool,
    initialized: bool,
    exited: bool,
}

impl Runtime {
    fn new(config: RuntimeConfig, mut hooks: Hooks) -> Result<Self> {
        let pre_run = std::mem::take(&mut hooks.pre_run);
        let post_run = std::mem::take(&mut hooks.post_run);
        let mut runtime = Self {
            engine: Engine::default(),
            config,
            hooks,
            phases: PhaseQueue::new(),
            dependencies: RunDependencies::new(),
            pending: None,
            live: None,
            called_run: false,
            initialized: false,
            exited: false,
        };
        for callback in pre_run {
            runtime.add_callback(Phase::PreRun, callback)?;
        }
        for callback in post_run {
            runtime.add_callback(Phase::PostRun, callback)?;
        }
        Ok(runtime)
    }

    /// Load, instantiate and start a module on the calling thread.
    ///
    /// Returns once startup finished: `main` has run (when configured) or
    /// startup is waiting on run dependencies the caller added in a pre-run
    /// callback.
    pub fn instantiate(source: ModuleSource, config: RuntimeConfig, hooks: Hooks) -> Result<Self> {
        let mut runtime = Self::new(config, hooks)?;
        let source = source.locate(runtime.hooks.locate_resource.as_deref());
        runtime.add_run_dependency(INSTANTIATE_DEPENDENCY);
        let loaded = source::compile(&runtime.engine, source)?;
        runtime.finish_loading(loaded)?;
        runtime.run()?;
        Ok(runtime)
    }

    /// Start acquiring and compiling the module on a worker thread. Drive
    /// it with `poll` or `wait`; startup runs as soon as it is instantiated.
    pub fn instantiate_async(
        source: ModuleSource,
        config: RuntimeConfig,
        hooks: Hooks,
    ) -> Result<Self> {
        let mut runtime = Self::new(config, hooks)?;
        let source = source.locate(runtime.hooks.locate_resource.as_deref());
        runtime.add_run_dependency(INSTANTIATE_DEPENDENCY);
        runtime.pending = Some(PendingModule::spawn(runtime.engine.clone(), source)?);
        runtime.run()?;
        Ok(runtime)
    }

    /// Finish an async load if the worker is done. Returns whether the
    /// module is instantiated.
    pub fn poll(&mut self) -> Result<bool> {
        if self.live.is_some() {
            return Ok(true);
        }
        let Some(pending) = self.pending.as_ref() else {
            return Err(NotReady.into());
        };
        match pending.try_take() {
            None => Ok(false),
            Some(loaded) => {
                self.pending = None;
                self.finish_loading(loaded?)?;
                Ok(true)
            }
        }
    }

    /// Block until an async load completes and startup has run.
    pub fn wait(&mut self) -> Result<()> {
        if self.live.is_some() {
            return Ok(());
        }
        let pending = self.pending.take().ok_or(NotReady)?;
        let loaded = pending.wait()?;
        self.finish_loading(loaded)
    }

    fn finish_loading(&mut self, loaded: Loaded) -> Result<()> {
        self.instantiate_module(loaded)?;
        self.remove_run_dependency(INSTANTIATE_DEPENDENCY)
    }

    fn memory_type(&self, len: usize) -> MemoryType {
        let pages = (len / WASM_PAGE_SIZE) as u32;
        let maximum = if self.config.growable_memory {
            self.config
                .maximum_memory
                .map_or(65536, |max| (max / WASM_PAGE_SIZE) as u32)
        } else {
            pages
        };
        MemoryType::new(pages, Some(maximum.max(pages)))
    }

    fn instantiate_module(&mut self, loaded: Loaded) -> Result<()> {
        let interface = parser::scan_module(&loaded.bytes)?;
        interface.check_trampolines()?;
        let config = &self.config;

        let static_bump = config.static_bump.unwrap_or_else(|| interface.static_bump());
        let layout = LayoutBuilder::new(static_bump, config.total_stack, config.total_memory)
            .seal()
            .context("invalid memory layout")?;
        let policy = GrowthPolicy {
            strategy: config.page_strategy,
            growable: config.growable_memory,
            maximum: config.maximum_memory,
        };
        let mut staging = match self.hooks.provided_buffer.take() {
            Some(buffer) => {
                if buffer.len() != config.total_memory as usize {
                    bail!(
                        "provided buffer is {} bytes but total_memory is {}",
                        buffer.len(),
                        config.total_memory
                    );
                }
                LinearMemory::from_bytes(buffer, policy)?
            }
            None => LinearMemory::allocate(config.total_memory as usize, policy)?,
        };
        layout.initialize(&mut staging.view_mut())?;
        log::debug!("memory layout: {layout:?}");

        let stdio = Stdio::new(Arc::clone(&self.hooks.print), Arc::clone(&self.hooks.print_err));
        let mut state = HostState::new(layout, policy, config.table_capacity, stdio);
        if let Some(hook) = self.hooks.on_abort.take() {
            state.aborts.set_hook(hook);
        }
        for signature in &config.extra_signatures {
            state.functions.declare(signature)?;
        }
        let mut store = Store::new(&self.engine, state);

        let host_memory = Memory::new(&mut store, self.memory_type(staging.len()))?;
        host_memory.data_mut(&mut store)[..staging.len()].copy_from_slice(staging.as_slice());

        let mut linker = Linker::new(&self.engine);
        imports::resolve(&mut linker, &mut store, &loaded.module, host_memory)?;
        let instance = linker
            .instantiate(&mut store, &loaded.module)
            .context("failed to instantiate module")?;

        let memory = if interface.imports_memory() {
            host_memory
        } else if let Some(own) = instance.get_memory(&mut store, "memory") {
            merge_memory(&mut store, own, &staging)
                .context("module-defined memory cannot hold the host layout")?;
            own
        } else {
            host_memory
        };

        let shares_stack = interface
            .imports
            .iter()
            .any(|import| import.canonical_name() == "STACKTOP");
        let module_stack = match (
            instance.get_func(&mut store, "stackSave"),
            instance.get_func(&mut store, "stackRestore"),
        ) {
            (Some(save), Some(restore)) if shares_stack => Some(ModuleStack { save, restore }),
            _ => None,
        };

        let state = store.data_mut();
        state.memory = Some(memory);
        state.instance = Some(instance);
        state.module_stack = module_stack;

        let constructors: Vec<String> = interface.static_constructors().map(str::to_string).collect();
        log::info!(
            "instantiated module: {} imports, {} exports, {} static constructors",
            interface.imports.len(),
            interface.exports.len(),
            constructors.len()
        );
        self.live = Some(Live {
            store,
            instance,
            interface,
        });
        for name in constructors {
            self.add_callback(
                Phase::Init,
                Box::new(move |runtime: &mut Runtime| runtime.call_raw(&name, &[]).map(drop)),
            )?;
        }
        Ok(())
    }

    // ── Startup protocol ──────────────────────────────────────────────

    /// Queue `callback` for `phase`. Fails once the phase has run.
    pub fn add_callback(&mut self, phase: Phase, callback: Callback) -> Result<()> {
        self.phases
            .push(phase, callback)
            .map_err(|_| anyhow!("the {phase:?} phase has already run"))
    }

    /// Hold back `run` until `id` is removed. Duplicates are ignored.
    pub fn add_run_dependency(&mut self, id: &str) {
        if !self.dependencies.add(id) {
            log::warn!("run dependency {id} added twice");
        }
    }

    /// Release `id`; if that empties the set and `run` was waiting, it
    /// runs now.
    pub fn remove_run_dependency(&mut self, id: &str) -> Result<()> {
        match self.dependencies.remove(id) {
            Removal::Unknown => {
                log::warn!("run dependency {id} was not pending");
                Ok(())
            }
            Removal::Pending(left) => {
                log::debug!("run dependency {id} done, {left} still pending");
                Ok(())
            }
            Removal::Idle => Ok(()),
            Removal::Fulfilled => self.run(),
        }
    }

    pub fn pending_dependencies(&self) -> usize {
        self.dependencies.len()
    }

    /// Run startup: pre-run, init, pre-main, ready hook, `main`, post-run.
    /// Defers (and re-arms) while run dependencies are pending.
    pub fn run(&mut self) -> Result<()> {
        if !self.dependencies.is_empty() {
            log::debug!("run deferred: {} dependencies pending", self.dependencies.len());
            self.dependencies.arm();
            return Ok(());
        }
        if self.called_run {
            return Ok(());
        }
        self.write_stack_cookie()?;
        self.run_phase(Phase::PreRun)?;
        if !self.dependencies.is_empty() {
            self.dependencies.arm();
            return Ok(());
        }
        if self.called_run {
            return Ok(());
        }
        self.called_run = true;
        self.phases.close(Phase::PreRun);
        if self.is_halted() {
            return Ok(());
        }

        self.ensure_initialized()?;
        self.run_phase(Phase::PreMain)?;
        self.phases.close(Phase::PreMain);
        if let Some(ready) = self.hooks.on_runtime_ready.take() {
            ready(self)?;
        }

        let outcome = if self.config.run_automatically && self.has_main() {
            let arguments = self.config.arguments.clone();
            Some(self.call_main(&arguments)?)
        } else {
            None
        };
        if let Some(MainOutcome::Exited(_)) = outcome {
            return Ok(());
        }
        self.run_phase(Phase::PostRun)?;
        self.phases.close(Phase::PostRun);
        if let Some(MainOutcome::Returned(code)) = outcome {
            self.exit(code, true)?;
        }
        Ok(())
    }

    fn run_phase(&mut self, phase: Phase) -> Result<()> {
        while let Some(callback) = self.phases.pop(phase) {
            self.check_stack_cookie()?;
            callback(self)?;
            self.check_stack_cookie()?;
        }
        Ok(())
    }

    fn ensure_initialized(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.initialized = true;
        self.run_phase(Phase::Init)?;
        self.phases.close(Phase::Init);
        Ok(())
    }

    fn write_stack_cookie(&mut self) -> Result<()> {
        let store = &mut self.live_mut()?.store;
        with_view_mut(store, |view, state| state.stack.write_cookie(view))?
            .map_err(|err| anyhow!(err))
    }

    fn check_stack_cookie(&mut self) -> Result<()> {
        match self.live.as_mut() {
            Some(live) => check_stack_cookie(&mut live.store),
            None => Ok(()),
        }
    }

    // ── main and exit ─────────────────────────────────────────────────

    fn has_main(&self) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| live.interface.function_export("main").is_some())
    }

    /// Call `main` with `args` after the program name and exit with its
    /// result (subject to `exit_runtime_on_return`).
    pub fn invoke_main(&mut self, args: &[String]) -> Result<i32> {
        match self.call_main(args)? {
            MainOutcome::Returned(code) => self.exit(code, true),
            MainOutcome::Exited(code) => Ok(code),
        }
    }

    fn call_main(&mut self, args: &[String]) -> Result<MainOutcome> {
        self.ensure_running()?;
        self.ensure_initialized()?;
        let func = self.resolve_export("main")?;
        let program = self.config.program_name.clone();
        let store = &mut self.live_mut()?.store;
        check_stack_cookie(store)?;

        let checkpoint = stack::save(store)?;
        let param_types: Vec<ValType> = func.ty(&*store).params().collect();
        let mut params = Vec::with_capacity(param_types.len());
        if !param_types.is_empty() {
            let argc = args.len() + 1;
            let argv = stack::alloc(store, ((argc + 1) * 4) as u32)?;
            for (i, arg) in iter::once(&program).chain(args).enumerate() {
                let ptr = stack::push_utf8(store, arg)?;
                with_view_mut(store, |view, _| view.store_u32(argv + 4 * i as u32, ptr))?
                    .map_err(|err| anyhow!(err))?;
            }
            with_view_mut(store, |view, _| view.store_u32(argv + 4 * argc as u32, 0))?
                .map_err(|err| anyhow!(err))?;
            params.push(Val::I32(argc as i32));
            params.push(Val::I32(argv as i32));
            // envp
            let filled = params.len();
            params.extend(param_types.iter().skip(filled).map(context::zero));
        }
        log::debug!("calling main with {} arguments", args.len());

        match call_func(store, func, &params) {
            Ok(ret) => {
                stack::restore(store, checkpoint)?;
                let code = ret.as_ref().and_then(Val::i32).unwrap_or(0);
                Ok(MainOutcome::Returned(code))
            }
            Err(err) => {
                if let Some(status) = err.downcast_ref::<ExitStatus>() {
                    let code = status.code;
                    self.exit(code, false)?;
                    return Ok(MainOutcome::Exited(code));
                }
                if err.is::<ThrownException>() || err.is::<Longjmp>() {
                    let message = match err.downcast_ref::<ThrownException>() {
                        Some(thrown) => thrown.to_string(),
                        None => format!("exception thrown: {err}"),
                    };
                    (self.hooks.print_err)(&message);
                    self.exit(1, false)?;
                    return Ok(MainOutcome::Exited(1));
                }
                Err(self.settle(err))
            }
        }
    }

    /// Tear down with `code`. An implicit zero exit keeps the runtime alive
    /// when `exit_runtime_on_return` is off.
    pub fn exit(&mut self, code: i32, implicit: bool) -> Result<i32> {
        if implicit && code == 0 && !self.config.exit_runtime_on_return {
            log::debug!("main returned 0; keeping the runtime alive");
            return Ok(code);
        }
        if self.exited {
            return Ok(code);
        }
        self.exited = true;
        self.check_stack_cookie()?;
        self.run_phase(Phase::Exit)?;
        self.phases.close(Phase::Exit);
        if let Some(live) = self.live.as_mut() {
            let state = live.store.data_mut();
            state.stdio.flush();
            state.aborts.exit(code);
            state.stack.reset();
        }
        if let Some(on_exit) = self.hooks.on_exit.as_mut() {
            on_exit(code);
        }
        log::info!("exited with status {code}");
        Ok(code)
    }

    // ── Termination ───────────────────────────────────────────────────

    /// Abort from the host side. The returned error carries the
    /// `AbortSignal`.
    pub fn abort(&mut self, what: &str) -> anyhow::Error {
        match self.live.as_mut() {
            Some(live) => abort(&mut live.store, what),
            None => {
                (self.hooks.print_err)(what);
                AbortSignal {
                    message: format!("abort({what})"),
                }
                .into()
            }
        }
    }

    /// Turn an error out of module code into what the host reports: traps
    /// go through the abort path, `exit` tears the runtime down, everything
    /// else passes through.
    pub(crate) fn settle(&mut self, err: anyhow::Error) -> anyhow::Error {
        if let Some(status) = err.downcast_ref::<ExitStatus>() {
            let code = status.code;
            if let Err(teardown) = self.exit(code, false) {
                return teardown;
            }
            return err;
        }
        if err.is::<AbortSignal>() {
            return err;
        }
        if let Some(trap) = err.downcast_ref::<Trap>() {
            let what = trap.to_string();
            return self.abort(&what);
        }
        err
    }

    pub fn is_halted(&self) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| live.store.data().aborts.halted())
    }

    /// Status recorded by `exit` or an abort.
    pub fn exit_status(&self) -> Option<i32> {
        self.live
            .as_ref()
            .and_then(|live| live.store.data().aborts.exit_status())
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        let live = self.live.as_ref().ok_or(NotReady)?;
        live.store.data().aborts.ensure_running()?;
        Ok(())
    }

    // ── Accessors ─────────────────────────────────────────────────────

    pub(crate) fn live_mut(&mut self) -> Result<&mut Live> {
        self.live.as_mut().ok_or_else(|| NotReady.into())
    }

    fn live(&self) -> Result<&Live> {
        self.live.as_ref().ok_or_else(|| NotReady.into())
    }

    pub fn is_ready(&self) -> bool {
        self.live.is_some()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn state(&self) -> Result<&HostState> {
        Ok(self.live()?.store.data())
    }

    pub fn state_mut(&mut self) -> Result<&mut HostState> {
        Ok(self.live_mut()?.store.data_mut())
    }

    pub fn layout(&self) -> Result<MemoryLayout> {
        Ok(self.state()?.layout)
    }

    pub fn interface(&self) -> Result<&ModuleInterface> {
        Ok(&self.live()?.interface)
    }

    pub(crate) fn resolve_export(&mut self, name: &str) -> Result<Func> {
        let live = self.live_mut()?;
        let func = live
            .interface
            .function_export(name)
            .map(str::to_string)
            .and_then(|export| live.instance.get_func(&mut live.store, &export));
        func.ok_or_else(|| UnknownExport { name: name.into() }.into())
    }

    /// Call an export with raw scalars.
    pub fn call_raw(&mut self, name: &str, args: &[Scalar]) -> Result<Option<Scalar>> {
        let func = self.resolve_export(name)?;
        self.call_scalars(func, args)
    }

    fn call_scalars(&mut self, func: Func, args: &[Scalar]) -> Result<Option<Scalar>> {
        self.ensure_running()?;
        let store = &mut self.live_mut()?.store;
        let param_types: Vec<ValType> = func.ty(&*store).params().collect();
        if param_types.len() != args.len() {
            bail!("expected {} arguments, got {}", param_types.len(), args.len());
        }
        let params = args
            .iter()
            .zip(&param_types)
            .map(|(arg, ty)| to_val(*arg, ty))
            .collect::<Result<Vec<_>>>()?;
        match call_func(store, func, &params) {
            Ok(ret) => ret.as_ref().map(to_scalar).transpose(),
            Err(err) => Err(self.settle(err)),
        }
    }

    // ── Memory ────────────────────────────────────────────────────────

    /// Read a value of `kind` (`i8`, `i32`, `double`, `i8*`, ...).
    pub fn read_at(&mut self, address: u32, kind: &str) -> Result<Scalar> {
        let kind: ValueKind = kind.parse()?;
        let store = &mut self.live_mut()?.store;
        with_view(store, |view| view.read_scalar(address, kind))?.map_err(|err| anyhow!(err))
    }

    pub fn write_at(&mut self, address: u32, value: Scalar, kind: &str) -> Result<()> {
        let kind: ValueKind = kind.parse()?;
        let store = &mut self.live_mut()?.store;
        with_view_mut(store, |view, _| view.write_scalar(address, value, kind))?
            .map_err(|err| anyhow!(err))
    }

    pub fn read_bytes(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        let store = &mut self.live_mut()?.store;
        with_view(store, |view| view.bytes(address, len).map(<[u8]>::to_vec))?
            .map_err(|err| anyhow!(err))
    }

    /// Decode the NUL-terminated UTF-8 string at `address`.
    pub fn read_utf8(&mut self, address: u32) -> Result<String> {
        let store = &mut self.live_mut()?.store;
        HostCall::new(store.as_context_mut()).read_utf8(address)
    }

    /// Copy `s` into memory obtained from the module's `malloc`.
    pub fn allocate_utf8(&mut self, s: &str) -> Result<u32> {
        use emhost_runtime::strings::{self, Utf8};

        let len = strings::measure_with_terminator::<Utf8>(s).map_err(|err| anyhow!(err))?;
        let ptr = self
            .call_raw("malloc", &[Scalar::I32(len as i32)])?
            .map_or(0, |ret| ret.as_i32() as u32);
        if ptr == 0 {
            bail!("malloc({len}) failed");
        }
        let store = &mut self.live_mut()?.store;
        with_view_mut(store, |view, _| strings::encode::<Utf8>(view, s, ptr, len))?
            .map_err(|err| anyhow!(err))?;
        Ok(ptr)
    }

    /// Copy `s` onto the stack. It stays valid until the caller restores a
    /// checkpoint taken before this call.
    pub fn allocate_utf8_on_stack(&mut self, s: &str) -> Result<u32> {
        stack::push_utf8(&mut self.live_mut()?.store, s)
    }

    /// Bump the dynamic top for allocations made before the module's own
    /// allocator is up.
    pub fn dynamic_alloc(&mut self, size: u32) -> Result<u32> {
        let store = &mut self.live_mut()?.store;
        let result = with_view_mut(store, |view, state| state.layout.dynamic_alloc(view, size))?;
        result.map_err(|err| fault(store, &err))
    }

    pub fn stack_top(&self) -> Result<u32> {
        Ok(self.state()?.stack.top())
    }

    pub fn memory_size(&mut self) -> Result<usize> {
        let store = &mut self.live_mut()?.store;
        let memory = context::memory(store)?;
        Ok(memory.data_size(&*store))
    }

    /// Grow linear memory to at least `requested` bytes. The contents are
    /// preserved; a refused request leaves memory untouched.
    pub fn grow_memory(&mut self, requested: usize) -> Result<usize> {
        imports::grow_memory(&mut self.live_mut()?.store, requested)
    }

    // ── Function table ────────────────────────────────────────────────

    /// Make `func` callable from module code as `jsCall_SIG(index, ...)`.
    pub fn register_function<F>(&mut self, signature: &str, func: F) -> Result<u32>
    where
        F: Fn(&mut HostCall<'_>, &[Scalar]) -> Result<Option<Scalar>> + Send + Sync + 'static,
    {
        let func: HostFunction = Arc::new(func);
        let index = self.state_mut()?.functions.register(func, signature)?;
        log::debug!("registered host function {index} as '{signature}'");
        Ok(index)
    }

    pub fn unregister_function(&mut self, index: u32) -> Result<()> {
        self.state_mut()?.functions.unregister(index)?;
        Ok(())
    }

    /// Call a host function through the table, as module code would.
    pub fn invoke_function(
        &mut self,
        signature: &str,
        index: u32,
        args: &[Scalar],
    ) -> Result<Option<Scalar>> {
        self.ensure_running()?;
        let store = &mut self.live_mut()?.store;
        let lookup = store
            .data()
            .functions
            .lookup(signature, index)
            .map(Arc::clone);
        let func = match lookup {
            Ok(func) => func,
            Err(err) => return Err(fault(store, &err)),
        };
        func(&mut HostCall::new(store.as_context_mut()), args)
    }

    /// Call entry `index` of the module's own table through `dynCall_SIG`.
    pub fn dyn_call(&mut self, signature: &str, index: u32, args: &[Scalar]) -> Result<Option<Scalar>> {
        let func = match self.resolve_export(&format!("dynCall_{signature}")) {
            Ok(func) => func,
            Err(err) if err.is::<UnknownExport>() => {
                let store = &mut self.live_mut()?.store;
                return Err(fault(
                    store,
                    &emhost_runtime::Fault::MissingDispatcher {
                        signature: signature.into(),
                    },
                ));
            }
            Err(err) => return Err(err),
        };
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(Scalar::I32(index as i32));
        full.extend_from_slice(args);
        self.call_scalars(func, &full)
    }
}

/// Grow a module-owned memory to the host buffer's size and copy the host's
/// non-zero bytes over it.
fn merge_memory(store: &mut Store<HostState>, own: Memory, staging: &LinearMemory) -> Result<()> {
    let current = own.data_size(&*store);
    if current < staging.len() {
        let pages = (staging.len() - current).div_ceil(WASM_PAGE_SIZE) as u64;
        own.grow(&mut *store, pages).with_context(|| {
            format!(
                "failed to grow module memory from {current} to {} bytes",
                staging.len()
            )
        })?;
    }
    let copied = staging.overlay_onto(own.data_mut(&mut *store));
    log::debug!("merged {copied} bytes of host state into module memory");
    Ok(())
}
