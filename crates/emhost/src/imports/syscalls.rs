//! The syscalls a filesystem-less program reaches: `writev` to stdout and
//! stderr, a tty `ioctl`, and stream operations that abort.

use anyhow::Result;
use emhost_runtime::FaultResult;
use wasmtime::{Caller, Linker};

use crate::context::{abort, fault, with_view_mut, HostState};

const EBADF: i32 = 9;

pub(super) fn define(
    linker: &mut Linker<HostState>,
    module: &str,
    name: &str,
    bare: &str,
) -> Result<bool> {
    match bare {
        "syscall146" => linker.func_wrap(module, name, writev)?,
        "syscall54" => linker.func_wrap(module, name, |_: Caller<'_, HostState>, _: i32, _: i32| 0)?,
        "syscall6" | "syscall140" | "syscall145" => linker.func_wrap(module, name, unsupported)?,
        _ => return Ok(false),
    };
    Ok(true)
}

/// `writev(fd, iov, iovcnt)` with the arguments packed at `varargs`.
fn writev(mut caller: Caller<'_, HostState>, _which: i32, varargs: i32) -> Result<i32> {
    let varargs = varargs as u32;
    let written = with_view_mut(&mut caller, |view, state| -> FaultResult<Option<i32>> {
        let view = view.as_view();
        let fd = view.load_i32(varargs)?;
        let iov = view.load_u32(varargs.wrapping_add(4))?;
        let iovcnt = view.load_i32(varargs.wrapping_add(8))?;
        let mut total = 0i32;
        for i in 0..iovcnt.max(0) as u32 {
            let entry = iov.wrapping_add(i.wrapping_mul(8));
            let ptr = view.load_u32(entry)?;
            let len = view.load_u32(entry.wrapping_add(4))?;
            if !state.stdio.write(fd, view.bytes(ptr, len as usize)?) {
                return Ok(None);
            }
            total = total.wrapping_add(len as i32);
        }
        Ok(Some(total))
    })?;
    match written {
        Ok(Some(total)) => Ok(total),
        Ok(None) => Ok(-EBADF),
        Err(err) => Err(fault(&mut caller, &err)),
    }
}

fn unsupported(mut caller: Caller<'_, HostState>, which: i32, _varargs: i32) -> Result<i32> {
    Err(abort(
        &mut caller,
        &format!("syscall {which} operates on streams, which require a filesystem this runtime does not provide"),
    ))
}
