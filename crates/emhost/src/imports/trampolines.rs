//! Trampoline families synthesized from the module's imports.
//!
//! - `invoke_SIG(index, args...)`: call `dynCall_SIG` and turn a C++ throw or
//!   a longjmp into `setThrew(1, 0)` plus a zero result
//! - `jsCall_SIG(index, args...)`: call a host function from the table
//! - `nullFunc_SIG(index)`: report an invalid function pointer
//!
//! Signatures are whatever the suffix says; nothing is precompiled per SIG.

use std::sync::Arc;

use anyhow::Result;
use emhost_runtime::{Fault, Longjmp, Scalar, ThrownException};
use wasmtime::{AsContextMut, Caller, FuncType, Linker, Store, ValType};

use super::exceptions::set_threw;
use crate::context::{self, export, fault, to_scalar, to_val, HostCall, HostState};
use crate::stack;

pub(super) fn define(
    linker: &mut Linker<HostState>,
    store: &mut Store<HostState>,
    module: &str,
    name: &str,
    bare: &str,
    ty: &FuncType,
) -> Result<bool> {
    if let Some(sig) = bare.strip_prefix("invoke_") {
        define_invoke(linker, module, name, sig, ty)?;
    } else if let Some(sig) = bare.strip_prefix("jsCall_") {
        store.data_mut().functions.declare(sig)?;
        define_js_call(linker, module, name, sig, ty)?;
    } else if let Some(sig) = bare.strip_prefix("nullFunc_") {
        let signature = sig.to_string();
        linker.func_new(module, name, ty.clone(), move |mut caller, params, _| {
            let index = params.first().map(context::addr).unwrap_or(0);
            Err(fault(
                &mut caller,
                &Fault::InvalidFunctionPointer {
                    signature: signature.clone(),
                    index,
                },
            ))
        })?;
    } else if bare == "emscripten_longjmp" || bare == "longjmp" {
        linker.func_wrap(module, name, longjmp)?;
    } else {
        return Ok(false);
    }
    Ok(true)
}

/// Errors that unwind through an `invoke_` frame instead of terminating.
fn unwinds(err: &anyhow::Error) -> bool {
    err.is::<ThrownException>() || err.is::<Longjmp>()
}

fn define_invoke(
    linker: &mut Linker<HostState>,
    module: &str,
    name: &str,
    sig: &str,
    ty: &FuncType,
) -> Result<()> {
    let signature = sig.to_string();
    let dispatchers = [format!("dynCall_{sig}"), format!("_dynCall_{sig}")];
    let result_types: Vec<ValType> = ty.results().collect();

    linker.func_new(module, name, ty.clone(), move |mut caller, params, results| {
        let names = [dispatchers[0].as_str(), dispatchers[1].as_str()];
        let Some(dyn_call) = export(&mut caller, &names) else {
            return Err(fault(
                &mut caller,
                &Fault::MissingDispatcher {
                    signature: signature.clone(),
                },
            ));
        };
        let checkpoint = stack::save(&mut caller)?;
        match dyn_call.call(&mut caller, params, results) {
            Ok(()) => Ok(()),
            Err(err) if unwinds(&err) => {
                log::trace!("invoke_{signature}: {err}");
                stack::set_top(&mut caller, checkpoint.address())?;
                set_threw(&mut caller, 1, 0)?;
                for (slot, ty) in results.iter_mut().zip(&result_types) {
                    *slot = context::zero(ty);
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    })?;
    Ok(())
}

fn define_js_call(
    linker: &mut Linker<HostState>,
    module: &str,
    name: &str,
    sig: &str,
    ty: &FuncType,
) -> Result<()> {
    let signature = sig.to_string();
    let result_types: Vec<ValType> = ty.results().collect();

    linker.func_new(module, name, ty.clone(), move |mut caller, params, results| {
        let index = params.first().map(context::addr).unwrap_or(0);
        let lookup = caller
            .data()
            .functions
            .lookup(&signature, index)
            .map(Arc::clone);
        let func = match lookup {
            Ok(func) => func,
            Err(err) => return Err(fault(&mut caller, &err)),
        };
        let args = params
            .get(1..)
            .unwrap_or_default()
            .iter()
            .map(to_scalar)
            .collect::<Result<Vec<_>>>()?;
        let ret = func(&mut HostCall::new(caller.as_context_mut()), &args)?;
        if let (Some(slot), Some(ty)) = (results.first_mut(), result_types.first()) {
            *slot = to_val(ret.unwrap_or(Scalar::I32(0)), ty)?;
        }
        Ok(())
    })?;
    Ok(())
}

fn longjmp(mut caller: Caller<'_, HostState>, env: i32, value: i32) -> Result<()> {
    let value = if value == 0 { 1 } else { value };
    set_threw(&mut caller, env, value)?;
    Err(Longjmp {
        env: env as u32,
        value,
    }
    .into())
}
