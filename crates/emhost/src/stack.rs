//! Stack operations against a live store.
//!
//! When the module exports `stackSave`/`stackRestore` it owns the stack
//! pointer; the host allocator is synced from it before every operation and
//! published back afterwards, so host frames never overlap module frames.

use anyhow::{anyhow, Result};
use emhost_runtime::strings::{self, Utf8};
use emhost_runtime::StackCheckpoint;
use wasmtime::{AsContext, AsContextMut, Val};

use crate::context::{abort, fault, with_view_mut, HostState};

fn sync_from_module<C: AsContextMut<Data = HostState>>(ctx: &mut C) -> Result<()> {
    let Some(module_stack) = ctx.as_context().data().module_stack else {
        return Ok(());
    };
    let mut out = [Val::I32(0)];
    module_stack.save.call(&mut *ctx, &[], &mut out)?;
    let top = out[0].i32().unwrap_or(0) as u32;
    let result = ctx.as_context_mut().data_mut().stack.set_top(top);
    if let Err(err) = result {
        return Err(abort(ctx, &err.to_string()));
    }
    Ok(())
}

fn publish<C: AsContextMut<Data = HostState>>(ctx: &mut C) -> Result<()> {
    let state = ctx.as_context().data();
    let (Some(module_stack), top) = (state.module_stack, state.stack.top()) else {
        return Ok(());
    };
    module_stack
        .restore
        .call(&mut *ctx, &[Val::I32(top as i32)], &mut [])
}

pub(crate) fn save<C: AsContextMut<Data = HostState>>(ctx: &mut C) -> Result<StackCheckpoint> {
    sync_from_module(ctx)?;
    Ok(ctx.as_context().data().stack.save())
}

/// Reserve `size` bytes; overflow goes through the abort path.
pub(crate) fn alloc<C: AsContextMut<Data = HostState>>(ctx: &mut C, size: u32) -> Result<u32> {
    sync_from_module(ctx)?;
    let result = ctx.as_context_mut().data_mut().stack.alloc(size);
    match result {
        Ok(address) => {
            publish(ctx)?;
            Ok(address)
        }
        Err(err) => Err(fault(ctx, &err)),
    }
}

pub(crate) fn restore<C: AsContextMut<Data = HostState>>(
    ctx: &mut C,
    checkpoint: StackCheckpoint,
) -> Result<()> {
    sync_from_module(ctx)?;
    let result = ctx.as_context_mut().data_mut().stack.restore(checkpoint);
    if let Err(err) = result {
        return Err(abort(ctx, &err.to_string()));
    }
    publish(ctx)
}

/// Set the pointer to an address supplied by module code.
pub(crate) fn set_top<C: AsContextMut<Data = HostState>>(ctx: &mut C, address: u32) -> Result<()> {
    let result = ctx.as_context_mut().data_mut().stack.set_top(address);
    if let Err(err) = result {
        return Err(abort(ctx, &err.to_string()));
    }
    publish(ctx)
}

/// Copy `s` with its terminator onto the stack.
pub(crate) fn push_utf8<C: AsContextMut<Data = HostState>>(ctx: &mut C, s: &str) -> Result<u32> {
    let len = strings::measure_with_terminator::<Utf8>(s).map_err(|err| anyhow!(err))?;
    let address = alloc(ctx, len as u32)?;
    with_view_mut(ctx, |view, _| strings::encode::<Utf8>(view, s, address, len))?
        .map_err(|err| anyhow!(err))?;
    Ok(address)
}

/// Copy raw bytes onto the stack.
pub(crate) fn push_bytes<C: AsContextMut<Data = HostState>>(ctx: &mut C, bytes: &[u8]) -> Result<u32> {
    let address = alloc(ctx, bytes.len() as u32)?;
    with_view_mut(ctx, |view, _| view.write_bytes(address, bytes))?.map_err(|err| anyhow!(err))?;
    Ok(address)
}
