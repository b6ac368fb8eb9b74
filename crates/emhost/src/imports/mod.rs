//! Import resolution.
//!
//! Every import the module declares is matched by its canonical name
//! (leading underscores stripped) against the host families below. Anything
//! left over is reported in one `UnresolvedImports` error before the module
//! is instantiated.

mod exceptions;
mod memory;
mod syscalls;
mod trampolines;

pub(crate) use exceptions::set_threw;
pub(crate) use memory::grow_memory;

use anyhow::Result;
use emhost_runtime::{ExitStatus, Scalar, GLOBAL_BASE};
use wasmtime::{Caller, ExternType, FuncType, Global, GlobalType, Linker, Memory, Module, Store, Val};

use crate::context::{abort, to_val, HostState};
use crate::error::UnresolvedImports;
use crate::parser::canonical;

/// Define every import of `module` in `linker`. Returns how many were
/// resolved.
pub(crate) fn resolve(
    linker: &mut Linker<HostState>,
    store: &mut Store<HostState>,
    module: &Module,
    memory: Memory,
) -> Result<usize> {
    let mut resolved = 0;
    let mut unresolved = Vec::new();

    for import in module.imports() {
        let (module_name, name) = (import.module(), import.name());
        let bare = canonical(name);
        let defined = match import.ty() {
            ExternType::Func(ty) => define_func(linker, store, module_name, name, bare, &ty)?,
            ExternType::Global(ty) => define_global(linker, store, module_name, name, bare, ty)?,
            ExternType::Memory(_) if bare == "memory" => {
                linker.define(&*store, module_name, name, memory)?;
                true
            }
            _ => false,
        };
        if defined {
            resolved += 1;
        } else {
            unresolved.push(format!("{module_name}.{name}"));
        }
    }

    if !unresolved.is_empty() {
        return Err(UnresolvedImports { names: unresolved }.into());
    }
    log::debug!("resolved {resolved} imports");
    Ok(resolved)
}

fn define_func(
    linker: &mut Linker<HostState>,
    store: &mut Store<HostState>,
    module: &str,
    name: &str,
    bare: &str,
    ty: &FuncType,
) -> Result<bool> {
    if module == "global.Math" {
        return define_math(linker, module, name);
    }
    Ok(define_process(linker, module, name, bare, ty)?
        || memory::define(linker, module, name, bare, ty)?
        || exceptions::define(linker, module, name, bare, ty)?
        || trampolines::define(linker, store, module, name, bare, ty)?
        || syscalls::define(linker, module, name, bare)?)
}

fn define_process(
    linker: &mut Linker<HostState>,
    module: &str,
    name: &str,
    bare: &str,
    ty: &FuncType,
) -> Result<bool> {
    match bare {
        "abort" => linker.func_new(module, name, ty.clone(), |mut caller, params, _| {
            let what = params
                .first()
                .and_then(Val::i32)
                .map(|code| code.to_string())
                .unwrap_or_default();
            Err(abort(&mut caller, &what))
        })?,
        "exit" => linker.func_wrap(
            module,
            name,
            |_: Caller<'_, HostState>, code: i32| -> Result<()> { Err(ExitStatus { code }.into()) },
        )?,
        "getTempRet0" => linker.func_wrap(module, name, |caller: Caller<'_, HostState>| {
            caller.data().temp_ret0
        })?,
        "setTempRet0" => linker.func_wrap(
            module,
            name,
            |mut caller: Caller<'_, HostState>, value: i32| {
                caller.data_mut().temp_ret0 = value;
            },
        )?,
        "lock" | "unlock" => {
            linker.func_wrap(module, name, |_: Caller<'_, HostState>, _lock: i32| {})?
        }
        _ => return Ok(false),
    };
    Ok(true)
}

fn define_math(linker: &mut Linker<HostState>, module: &str, name: &str) -> Result<bool> {
    let unary: fn(f64) -> f64 = match name {
        "exp" => f64::exp,
        "log" => f64::ln,
        "sqrt" => f64::sqrt,
        "sin" => f64::sin,
        "cos" => f64::cos,
        "tan" => f64::tan,
        "asin" => f64::asin,
        "acos" => f64::acos,
        "atan" => f64::atan,
        "floor" => f64::floor,
        "ceil" => f64::ceil,
        "abs" => f64::abs,
        "pow" => {
            linker.func_wrap(module, name, |_: Caller<'_, HostState>, x: f64, y: f64| x.powf(y))?;
            return Ok(true);
        }
        "atan2" => {
            linker.func_wrap(module, name, |_: Caller<'_, HostState>, y: f64, x: f64| y.atan2(x))?;
            return Ok(true);
        }
        _ => return Ok(false),
    };
    linker.func_wrap(module, name, move |_: Caller<'_, HostState>, x: f64| unary(x))?;
    Ok(true)
}

fn define_global(
    linker: &mut Linker<HostState>,
    store: &mut Store<HostState>,
    module: &str,
    name: &str,
    bare: &str,
    ty: GlobalType,
) -> Result<bool> {
    let layout = store.data().layout;
    let value = match bare {
        "STACKTOP" => Scalar::I32(layout.stack_base as i32),
        "STACK_MAX" => Scalar::I32(layout.stack_max as i32),
        "DYNAMICTOP_PTR" => Scalar::I32(layout.dynamictop_ptr as i32),
        "tempDoublePtr" => Scalar::I32(layout.temp_double_ptr as i32),
        "ABORT" => Scalar::I32(0),
        "memoryBase" => Scalar::I32(GLOBAL_BASE as i32),
        "tableBase" => Scalar::I32(0),
        "NaN" => Scalar::F64(f64::NAN),
        "Infinity" => Scalar::F64(f64::INFINITY),
        _ => return Ok(false),
    };
    let init = to_val(value, ty.content())?;
    let global = Global::new(&mut *store, ty, init)?;
    linker.define(&*store, module, name, global)?;
    Ok(true)
}
