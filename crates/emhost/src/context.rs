//! Per-instance host state and the helpers host functions share.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use emhost_runtime::strings::{self, Utf8};
use emhost_runtime::{
    AbortController, ExceptionTable, Fault, FunctionTable, GrowthPolicy, MemoryLayout, MemoryView,
    MemoryViewMut, Scalar, StackAllocator, ValueKind,
};
use wasmtime::{AsContext, AsContextMut, Func, Instance, Memory, StoreContextMut, Val, ValType};

use crate::config::PrintFn;

/// A host function callable from module code through the function table.
pub type HostFunction = Arc<dyn Fn(&mut HostCall<'_>, &[Scalar]) -> Result<Option<Scalar>> + Send + Sync>;

/// Line-buffered stdout/stderr for module output.
pub struct Stdio {
    out: Vec<u8>,
    err: Vec<u8>,
    pub print: PrintFn,
    pub print_err: PrintFn,
}

impl Stdio {
    pub fn new(print: PrintFn, print_err: PrintFn) -> Self {
        Self {
            out: Vec::new(),
            err: Vec::new(),
            print,
            print_err,
        }
    }

    /// Append bytes for `fd`; a newline or NUL completes a line. Returns
    /// `false` for anything but stdout and stderr.
    pub fn write(&mut self, fd: i32, bytes: &[u8]) -> bool {
        let (buffer, sink) = match fd {
            1 => (&mut self.out, &self.print),
            2 => (&mut self.err, &self.print_err),
            _ => return false,
        };
        for &byte in bytes {
            if byte == b'\n' || byte == 0 {
                sink(&String::from_utf8_lossy(buffer));
                buffer.clear();
            } else {
                buffer.push(byte);
            }
        }
        true
    }

    /// Emit any partial lines.
    pub fn flush(&mut self) {
        if !self.out.is_empty() {
            (self.print)(&String::from_utf8_lossy(&self.out));
            self.out.clear();
        }
        if !self.err.is_empty() {
            (self.print_err)(&String::from_utf8_lossy(&self.err));
            self.err.clear();
        }
    }
}

/// The module's own stack-pointer accessors, when it exports them.
#[derive(Clone, Copy)]
pub(crate) struct ModuleStack {
    pub save: Func,
    pub restore: Func,
}

/// Everything the host functions of one instance share. Lives in the
/// `wasmtime::Store`.
pub struct HostState {
    pub layout: MemoryLayout,
    pub stack: StackAllocator,
    pub exceptions: ExceptionTable,
    pub functions: FunctionTable<HostFunction>,
    pub aborts: AbortController,
    pub stdio: Stdio,
    pub policy: GrowthPolicy,
    /// High word of an i64 returned in two parts.
    pub temp_ret0: i32,
    /// `setThrew` arguments, kept here when the module does not export it.
    pub threw: (i32, i32),
    pub(crate) memory: Option<Memory>,
    pub(crate) instance: Option<Instance>,
    pub(crate) module_stack: Option<ModuleStack>,
}

impl fmt::Debug for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostState")
            .field("layout", &self.layout)
            .field("stack", &self.stack)
            .field("exceptions", &self.exceptions)
            .field("functions", &self.functions.len())
            .field("aborts", &self.aborts)
            .field("temp_ret0", &self.temp_ret0)
            .finish_non_exhaustive()
    }
}

impl HostState {
    pub fn new(layout: MemoryLayout, policy: GrowthPolicy, table_capacity: usize, stdio: Stdio) -> Self {
        Self {
            layout,
            stack: layout.stack(),
            exceptions: ExceptionTable::new(),
            functions: FunctionTable::new(table_capacity),
            aborts: AbortController::new(),
            stdio,
            policy,
            temp_ret0: 0,
            threw: (0, 0),
            memory: None,
            instance: None,
            module_stack: None,
        }
    }
}

/// Handle given to host functions invoked through the function table.
pub struct HostCall<'a> {
    pub(crate) ctx: StoreContextMut<'a, HostState>,
}

impl<'a> HostCall<'a> {
    pub(crate) fn new(ctx: StoreContextMut<'a, HostState>) -> Self {
        Self { ctx }
    }

    /// Read a NUL-terminated UTF-8 string.
    pub fn read_utf8(&mut self, ptr: u32) -> Result<String> {
        with_view(&mut self.ctx, |view| strings::decode::<Utf8>(view, ptr, None))?
            .map_err(|fault| anyhow!(fault))
    }

    pub fn read_at(&mut self, address: u32, kind: ValueKind) -> Result<Scalar> {
        with_view(&mut self.ctx, |view| view.read_scalar(address, kind))?
            .map_err(|fault| anyhow!(fault))
    }

    pub fn write_at(&mut self, address: u32, value: Scalar, kind: ValueKind) -> Result<()> {
        with_view_mut(&mut self.ctx, |view, _| view.write_scalar(address, value, kind))?
            .map_err(|fault| anyhow!(fault))
    }

    pub fn state(&mut self) -> &mut HostState {
        self.ctx.data_mut()
    }
}

// ── Store helpers ─────────────────────────────────────────────────────

pub(crate) fn memory<C: AsContextMut<Data = HostState>>(ctx: &mut C) -> Result<Memory> {
    ctx.as_context()
        .data()
        .memory
        .ok_or_else(|| anyhow!("module has no linear memory"))
}

pub(crate) fn with_view<C, R>(ctx: &mut C, f: impl FnOnce(&MemoryView<'_>) -> R) -> Result<R>
where
    C: AsContextMut<Data = HostState>,
{
    let memory = memory(ctx)?;
    let view = MemoryView::new(memory.data(ctx.as_context()));
    Ok(f(&view))
}

pub(crate) fn with_view_mut<C, R>(
    ctx: &mut C,
    f: impl FnOnce(&mut MemoryViewMut<'_>, &mut HostState) -> R,
) -> Result<R>
where
    C: AsContextMut<Data = HostState>,
{
    let memory = memory(ctx)?;
    let (bytes, state) = memory.data_and_store_mut(ctx.as_context_mut());
    let mut view = MemoryViewMut::new(bytes);
    Ok(f(&mut view, state))
}

/// Route `what` through the abort path and return the error to propagate.
pub(crate) fn abort<C: AsContextMut<Data = HostState>>(ctx: &mut C, what: &str) -> anyhow::Error {
    let mut cx = ctx.as_context_mut();
    let state = cx.data_mut();
    state.stdio.flush();
    let print_err = Arc::clone(&state.stdio.print_err);
    let signal = state.aborts.abort(what, |reason| print_err(reason));
    log::debug!("{}", signal.message);
    anyhow::Error::new(signal)
}

pub(crate) fn fault<C: AsContextMut<Data = HostState>>(ctx: &mut C, fault: &Fault) -> anyhow::Error {
    abort(ctx, &fault.to_string())
}

/// Abort if the stack cookie or the address-zero magic was overwritten.
pub(crate) fn check_stack_cookie<C: AsContextMut<Data = HostState>>(ctx: &mut C) -> Result<()> {
    let stack = ctx.as_context().data().stack.clone();
    match with_view(ctx, |view| stack.check_cookie(view))? {
        Ok(()) => Ok(()),
        Err(err) => Err(fault(ctx, &err)),
    }
}

/// First exported function among `names`.
pub(crate) fn export<C: AsContextMut<Data = HostState>>(ctx: &mut C, names: &[&str]) -> Option<Func> {
    let instance = ctx.as_context().data().instance?;
    names
        .iter()
        .find_map(|name| instance.get_func(&mut *ctx, name))
}

/// Call `func` and return its single result, if any.
pub(crate) fn call_func<C: AsContextMut<Data = HostState>>(
    ctx: &mut C,
    func: Func,
    args: &[Val],
) -> Result<Option<Val>> {
    let ty = func.ty(&*ctx);
    let mut results: Vec<Val> = ty.results().map(|t| zero(&t)).collect();
    func.call(&mut *ctx, args, &mut results)?;
    Ok(results.into_iter().next())
}

// ── Value conversion ──────────────────────────────────────────────────

pub(crate) fn zero(ty: &ValType) -> Val {
    match ty {
        ValType::I64 => Val::I64(0),
        ValType::F32 => Val::F32(0),
        ValType::F64 => Val::F64(0),
        _ => Val::I32(0),
    }
}

pub(crate) fn to_val(value: Scalar, ty: &ValType) -> Result<Val> {
    Ok(match ty {
        ValType::I32 => Val::I32(value.as_i32()),
        ValType::I64 => Val::I64(value.as_i64()),
        ValType::F32 => Val::F32((value.as_f64() as f32).to_bits()),
        ValType::F64 => Val::F64(value.as_f64().to_bits()),
        other => bail!("unsupported value type {other:?}"),
    })
}

pub(crate) fn to_scalar(value: &Val) -> Result<Scalar> {
    Ok(match value {
        Val::I32(v) => Scalar::I32(*v),
        Val::I64(v) => Scalar::I64(*v),
        Val::F32(bits) => Scalar::F32(f32::from_bits(*bits)),
        Val::F64(bits) => Scalar::F64(f64::from_bits(*bits)),
        _ => bail!("reference values cannot cross the host boundary"),
    })
}

/// Read an `i32` argument as an address.
pub(crate) fn addr(value: &Val) -> u32 {
    value.i32().unwrap_or(0) as u32
}
