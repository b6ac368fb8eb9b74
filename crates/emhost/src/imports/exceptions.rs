//! C++ exception imports (`__cxa_*`, `__resumeException`, landing-pad
//! matching) over the shared `ExceptionTable`.

use anyhow::Result;
use emhost_runtime::{Disposal, Fault};
use wasmtime::{AsContext, AsContextMut, Caller, FuncType, Linker, Val};

use crate::context::{self, abort, call_func, export, fault, with_view, with_view_mut, HostState};

pub(super) fn define(
    linker: &mut Linker<HostState>,
    module: &str,
    name: &str,
    bare: &str,
    ty: &FuncType,
) -> Result<bool> {
    if bare.starts_with("cxa_find_matching_catch") {
        linker.func_new(module, name, ty.clone(), find_matching_catch)?;
        return Ok(true);
    }
    match bare {
        "cxa_allocate_exception" => linker.func_wrap(module, name, allocate_exception)?,
        "cxa_free_exception" => linker.func_wrap(module, name, free_exception)?,
        "cxa_throw" => linker.func_wrap(module, name, throw)?,
        "cxa_begin_catch" => linker.func_wrap(module, name, begin_catch)?,
        "cxa_end_catch" => linker.func_wrap(module, name, end_catch)?,
        "cxa_rethrow" => linker.func_wrap(module, name, rethrow)?,
        "cxa_uncaught_exception" | "ZSt18uncaught_exceptionv" => {
            linker.func_wrap(module, name, |caller: Caller<'_, HostState>| {
                (caller.data().exceptions.uncaught() > 0) as i32
            })?
        }
        "resumeException" => linker.func_wrap(module, name, resume_exception)?,
        "cxa_pure_virtual" => linker.func_wrap(
            module,
            name,
            |mut caller: Caller<'_, HostState>| -> Result<()> {
                Err(abort(&mut caller, "Pure virtual function called!"))
            },
        )?,
        "gxx_personality_v0" => {
            let result_types: Vec<_> = ty.results().collect();
            linker.func_new(module, name, ty.clone(), move |_, _, results| {
                for (slot, ty) in results.iter_mut().zip(&result_types) {
                    *slot = context::zero(ty);
                }
                Ok(())
            })?
        }
        "llvm_eh_typeid_for" => {
            linker.func_wrap(module, name, |_: Caller<'_, HostState>, type_id: i32| type_id)?
        }
        _ => return Ok(false),
    };
    Ok(true)
}

/// Record a `setThrew(threw, value)` on the module, or locally if it does
/// not export one. The first throw wins until it is cleared.
pub(crate) fn set_threw<C: AsContextMut<Data = HostState>>(
    ctx: &mut C,
    threw: i32,
    value: i32,
) -> Result<()> {
    if let Some(func) = export(ctx, &["setThrew", "_setThrew"]) {
        call_func(ctx, func, &[Val::I32(threw), Val::I32(value)])?;
        return Ok(());
    }
    let mut cx = ctx.as_context_mut();
    let state = cx.data_mut();
    if state.threw.0 == 0 || threw == 0 {
        state.threw = (threw, value);
    }
    Ok(())
}

fn allocate_exception(mut caller: Caller<'_, HostState>, size: i32) -> Result<i32> {
    let Some(malloc) = export(&mut caller, &["_malloc", "malloc"]) else {
        return Err(abort(&mut caller, "exception allocation requires an exported malloc"));
    };
    let ptr = call_func(&mut caller, malloc, &[Val::I32(size)])?
        .as_ref()
        .and_then(Val::i32)
        .unwrap_or(0);
    Ok(ptr)
}

fn free_exception(mut caller: Caller<'_, HostState>, ptr: i32) -> Result<()> {
    caller.data_mut().exceptions.free(ptr as u32);
    release(&mut caller, ptr as u32)
}

fn release<C: AsContextMut<Data = HostState>>(ctx: &mut C, ptr: u32) -> Result<()> {
    match export(ctx, &["_free", "free"]) {
        Some(free) => call_func(ctx, free, &[Val::I32(ptr as i32)]).map(drop),
        None => {
            log::debug!("exception payload {ptr} leaked: module exports no free");
            Ok(())
        }
    }
}

/// Run the payload's destructor (if any) and free it.
fn dispose<C: AsContextMut<Data = HostState>>(ctx: &mut C, disposal: Disposal) -> Result<()> {
    if let Some(destructor) = disposal.destructor {
        let Some(dyn_call) = export(ctx, &["dynCall_vi", "_dynCall_vi"]) else {
            return Err(fault(
                ctx,
                &Fault::MissingDispatcher {
                    signature: "vi".into(),
                },
            ));
        };
        call_func(
            ctx,
            dyn_call,
            &[Val::I32(destructor as i32), Val::I32(disposal.ptr as i32)],
        )?;
    }
    release(ctx, disposal.ptr)
}

fn throw(mut caller: Caller<'_, HostState>, ptr: i32, type_id: i32, destructor: i32) -> Result<()> {
    let thrown = caller
        .data_mut()
        .exceptions
        .throw(ptr as u32, type_id as u32, destructor as u32);
    log::trace!("{thrown} (type {type_id})");
    Err(thrown.into())
}

fn begin_catch(mut caller: Caller<'_, HostState>, ptr: i32) -> Result<i32> {
    let caught = caller.data_mut().exceptions.begin_catch(ptr as u32);
    match caught {
        Ok(ptr) => Ok(ptr as i32),
        Err(err) => Err(fault(&mut caller, &err)),
    }
}

fn end_catch(mut caller: Caller<'_, HostState>) -> Result<()> {
    set_threw(&mut caller, 0, 0)?;
    let ended = caller.data_mut().exceptions.end_catch();
    match ended {
        Ok(Some(disposal)) => dispose(&mut caller, disposal),
        Ok(None) => Ok(()),
        Err(err) => Err(fault(&mut caller, &err)),
    }
}

fn rethrow(mut caller: Caller<'_, HostState>) -> Result<()> {
    let rethrown = caller.data_mut().exceptions.rethrow();
    match rethrown {
        Ok(thrown) => Err(thrown.into()),
        Err(err) => Err(fault(&mut caller, &err)),
    }
}

fn resume_exception(mut caller: Caller<'_, HostState>, ptr: i32) -> Result<()> {
    Err(caller.data_mut().exceptions.resume(ptr as u32).into())
}

/// `__cxa_find_matching_catch_N(types...)`: returns the payload to hand to
/// the landing pad and leaves the selector in `tempRet0`.
fn find_matching_catch(
    mut caller: Caller<'_, HostState>,
    params: &[Val],
    results: &mut [Val],
) -> Result<()> {
    let candidates: Vec<u32> = params.iter().map(context::addr).collect();
    // `___cxa_can_catch` is a pure type check and never re-enters these imports.
    let mut table = std::mem::take(&mut caller.data_mut().exceptions);
    let found = table.find_matching_catch(&candidates, |catch_type, thrown_type, ptr| {
        can_catch(&mut caller, catch_type, thrown_type, ptr)
    });
    caller.data_mut().exceptions = table;
    let found = found?;

    caller.data_mut().temp_ret0 = found.selector as i32;
    if let Some(slot) = results.first_mut() {
        *slot = Val::I32(found.ptr as i32);
    }
    Ok(())
}

/// Ask the module whether a handler for `catch_type` accepts the payload.
/// The payload address goes through a scratch word so the module can
/// adjust it for base-class catches.
fn can_catch<C: AsContextMut<Data = HostState>>(
    ctx: &mut C,
    catch_type: u32,
    thrown_type: u32,
    ptr: u32,
) -> Result<Option<u32>> {
    let scratch = ctx.as_context().data().layout.catch_scratch_ptr;
    if let Err(err) = with_view_mut(ctx, |view, _| view.store_u32(scratch, ptr))? {
        return Err(fault(ctx, &err));
    }
    let Some(func) = export(ctx, &["___cxa_can_catch", "__cxa_can_catch"]) else {
        return Err(abort(ctx, "exception matching requires an exported ___cxa_can_catch"));
    };
    let args = [
        Val::I32(catch_type as i32),
        Val::I32(thrown_type as i32),
        Val::I32(scratch as i32),
    ];
    let accepted = call_func(ctx, func, &args)?
        .as_ref()
        .and_then(Val::i32)
        .unwrap_or(0);
    if accepted == 0 {
        return Ok(None);
    }
    match with_view(ctx, |view| view.load_u32(scratch))? {
        Ok(adjusted) => Ok(Some(adjusted)),
        Err(err) => Err(fault(ctx, &err)),
    }
}
