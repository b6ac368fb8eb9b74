//! Memory growth, stack and raw-copy imports.

use anyhow::Result;
use emhost_runtime::{Fault, GrowError, WASM_PAGE_SIZE};
use wasmtime::{AsContext, AsContextMut, Caller, FuncType, Linker, Val};

use crate::context::{self, abort, call_func, export, fault, with_view, with_view_mut, HostState};
use crate::stack;

pub(super) fn define(
    linker: &mut Linker<HostState>,
    module: &str,
    name: &str,
    bare: &str,
    ty: &FuncType,
) -> Result<bool> {
    match bare {
        "enlargeMemory" => linker.func_wrap(module, name, enlarge_memory)?,
        "getTotalMemory" => linker.func_wrap(module, name, total_memory)?,
        "abortOnCannotGrowMemory" => {
            linker.func_new(module, name, ty.clone(), |mut caller, params, _| {
                let requested = params.first().map(context::addr).unwrap_or(0) as usize;
                Err(cannot_grow(&mut caller, requested))
            })?
        }
        "abortStackOverflow" => linker.func_wrap(module, name, abort_stack_overflow)?,
        "emscripten_memcpy_big" => linker.func_wrap(module, name, memcpy_big)?,
        "stackAlloc" => linker.func_wrap(
            module,
            name,
            |mut caller: Caller<'_, HostState>, size: i32| -> Result<i32> {
                Ok(stack::alloc(&mut caller, size as u32)? as i32)
            },
        )?,
        "stackSave" => linker.func_wrap(
            module,
            name,
            |mut caller: Caller<'_, HostState>| -> Result<i32> {
                Ok(stack::save(&mut caller)?.address() as i32)
            },
        )?,
        "stackRestore" => linker.func_wrap(
            module,
            name,
            |mut caller: Caller<'_, HostState>, top: i32| -> Result<()> {
                stack::set_top(&mut caller, top as u32)
            },
        )?,
        "setErrNo" => linker.func_new(module, name, ty.clone(), |mut caller, params, results| {
            let value = params.first().and_then(Val::i32).unwrap_or(0);
            set_errno(&mut caller, value)?;
            if let Some(slot) = results.first_mut() {
                *slot = Val::I32(value);
            }
            Ok(())
        })?,
        _ => return Ok(false),
    };
    Ok(true)
}

/// Grow the live memory to at least `requested` bytes under the configured
/// policy. Refusals surface as a `GrowError`.
pub(crate) fn grow_memory<C: AsContextMut<Data = HostState>>(
    ctx: &mut C,
    requested: usize,
) -> Result<usize> {
    let memory = context::memory(ctx)?;
    let current = memory.data_size(&*ctx);
    let target = ctx.as_context().data().policy.plan(current, requested)?;
    if target > current {
        let pages = ((target - current) / WASM_PAGE_SIZE) as u64;
        memory
            .grow(&mut *ctx, pages)
            .map_err(|_| GrowError::AllocationFailed { requested: target })?;
        log::debug!("memory grown from {current} to {target} bytes");
    }
    Ok(target)
}

fn cannot_grow<C: AsContextMut<Data = HostState>>(ctx: &mut C, requested: usize) -> anyhow::Error {
    let current = match context::memory(ctx) {
        Ok(memory) => memory.data_size(&*ctx),
        Err(err) => return err,
    };
    fault(ctx, &Fault::CannotGrowMemory { requested, current })
}

/// Make room up to the dynamic top. Returns 1 on success, 0 if growth was
/// refused; a fixed-size memory aborts.
fn enlarge_memory(mut caller: Caller<'_, HostState>) -> Result<i32> {
    let layout = caller.data().layout;
    let top = match with_view(&mut caller, |view| layout.dynamic_top(view))? {
        Ok(top) => top as usize,
        Err(err) => return Err(fault(&mut caller, &err)),
    };
    let current = context::memory(&mut caller)?.data_size(&caller);
    if top <= current {
        return Ok(1);
    }
    if !caller.data().policy.growable {
        return Err(cannot_grow(&mut caller, top));
    }
    match grow_memory(&mut caller, top) {
        Ok(_) => Ok(1),
        Err(err) if err.is::<GrowError>() => {
            log::warn!("enlargeMemory: {err}");
            Ok(0)
        }
        Err(err) => Err(err),
    }
}

fn total_memory(mut caller: Caller<'_, HostState>) -> Result<i32> {
    let memory = context::memory(&mut caller)?;
    Ok(memory.data_size(&caller) as i32)
}

fn abort_stack_overflow(mut caller: Caller<'_, HostState>, requested: i32) -> Result<()> {
    stack::save(&mut caller)?;
    let available = caller.data().stack.available();
    Err(fault(
        &mut caller,
        &Fault::StackOverflow {
            requested: requested as u32,
            available,
        },
    ))
}

fn memcpy_big(mut caller: Caller<'_, HostState>, dest: i32, src: i32, num: i32) -> Result<i32> {
    let copied = with_view_mut(&mut caller, |view, _| {
        view.copy_within(dest as u32, src as u32, num as u32)
    })?;
    match copied {
        Ok(()) => Ok(dest),
        Err(err) => Err(fault(&mut caller, &err)),
    }
}

/// Store `value` where the module's `errno` lives.
fn set_errno<C: AsContextMut<Data = HostState>>(ctx: &mut C, value: i32) -> Result<()> {
    let Some(location) = export(ctx, &["___errno_location", "__errno_location"]) else {
        log::debug!("errno {value} dropped: module exports no ___errno_location");
        return Ok(());
    };
    let address = call_func(ctx, location, &[])?
        .as_ref()
        .map(context::addr)
        .unwrap_or(0);
    match with_view_mut(ctx, |view, _| view.store_i32(address, value))? {
        Ok(()) => Ok(()),
        Err(err) => Err(abort(ctx, &err.to_string())),
    }
}
