//! Calling exports by name with host values: strings and byte arrays are
//! copied onto the stack for the duration of the call, results are
//! converted back according to the declared return kind.

use anyhow::{anyhow, bail, Result};
use emhost_runtime::{Scalar, StackCheckpoint};
use wasmtime::{AsContextMut, Func, Val, ValType};

use crate::context::{check_stack_cookie, to_scalar, to_val, HostCall, HostState};
use crate::runtime::Runtime;
use crate::stack;

/// How to interpret an export's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Number,
    Boolean,
    /// A pointer to a NUL-terminated UTF-8 string.
    String,
    Void,
}

/// How to pass an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Number,
    Boolean,
    /// Copied to the stack as NUL-terminated UTF-8.
    String,
    /// Copied to the stack as raw bytes.
    Array,
}

/// A value on the host side of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Number(Scalar),
    Boolean(bool),
    Str(String),
    Bytes(Vec<u8>),
    /// A null pointer argument, or the result of a void call.
    Null,
}

impl HostValue {
    pub fn as_number(&self) -> Option<Scalar> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        HostValue::Number(Scalar::I32(v))
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Number(Scalar::F64(v))
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Boolean(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::Str(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::Str(v)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(v: Vec<u8>) -> Self {
        HostValue::Bytes(v)
    }
}

/// An export resolved once and called many times.
#[derive(Debug, Clone)]
pub struct WrappedExport {
    name: String,
    func: Func,
    ret: ReturnKind,
    args: Vec<ArgKind>,
}

impl WrappedExport {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, runtime: &mut Runtime, values: &[HostValue]) -> Result<HostValue> {
        runtime.call_with(&self.name, self.func, self.ret, &self.args, values)
    }
}

impl Runtime {
    /// Call export `name` (with or without its leading underscore).
    pub fn call(
        &mut self,
        name: &str,
        ret: ReturnKind,
        args: &[ArgKind],
        values: &[HostValue],
    ) -> Result<HostValue> {
        let func = self.resolve_export(name)?;
        self.call_with(name, func, ret, args, values)
    }

    /// Resolve `name` now and return a reusable caller.
    pub fn wrap(&mut self, name: &str, ret: ReturnKind, args: &[ArgKind]) -> Result<WrappedExport> {
        let func = self.resolve_export(name)?;
        Ok(WrappedExport {
            name: name.to_string(),
            func,
            ret,
            args: args.to_vec(),
        })
    }

    pub(crate) fn call_with(
        &mut self,
        name: &str,
        func: Func,
        ret: ReturnKind,
        kinds: &[ArgKind],
        values: &[HostValue],
    ) -> Result<HostValue> {
        if kinds.len() != values.len() {
            bail!(
                "'{name}' declares {} arguments but was given {}",
                kinds.len(),
                values.len()
            );
        }
        self.ensure_running()?;
        let store = &mut self.live_mut()?.store;
        check_stack_cookie(store)?;

        let param_types: Vec<ValType> = func.ty(&*store).params().collect();
        if param_types.len() != values.len() {
            bail!(
                "'{name}' takes {} arguments, got {}",
                param_types.len(),
                values.len()
            );
        }
        let result_types: Vec<ValType> = func.ty(&*store).results().collect();

        let mut checkpoint = None;
        let outcome = marshal(store, name, kinds, values, &param_types, &mut checkpoint).and_then(
            |params| {
                let mut results: Vec<Val> = result_types.iter().map(crate::context::zero).collect();
                func.call(&mut *store, &params, &mut results)?;
                Ok(results)
            },
        );
        let converted = match outcome {
            Ok(results) => convert_result(store, ret, results.first()),
            Err(err) => Err(err),
        };
        let restored = match checkpoint {
            Some(checkpoint) => stack::restore(store, checkpoint),
            None => Ok(()),
        };
        match converted {
            Ok(value) => {
                restored?;
                Ok(value)
            }
            Err(err) => Err(self.settle(err)),
        }
    }
}

fn marshal<C: AsContextMut<Data = HostState>>(
    ctx: &mut C,
    name: &str,
    kinds: &[ArgKind],
    values: &[HostValue],
    types: &[ValType],
    checkpoint: &mut Option<StackCheckpoint>,
) -> Result<Vec<Val>> {
    let mut params = Vec::with_capacity(values.len());
    for (i, ((kind, value), ty)) in kinds.iter().zip(values).zip(types).enumerate() {
        let param = match (kind, value) {
            (ArgKind::Number, HostValue::Number(n)) => to_val(*n, ty)?,
            (ArgKind::Number, HostValue::Boolean(b)) | (ArgKind::Boolean, HostValue::Boolean(b)) => {
                to_val(Scalar::I32(*b as i32), ty)?
            }
            (ArgKind::Boolean, HostValue::Number(n)) => to_val(Scalar::I32(n.is_truthy() as i32), ty)?,
            (ArgKind::String | ArgKind::Array, HostValue::Null) => to_val(Scalar::I32(0), ty)?,
            (ArgKind::String, HostValue::Str(s)) => {
                if checkpoint.is_none() {
                    *checkpoint = Some(stack::save(ctx)?);
                }
                to_val(Scalar::I32(stack::push_utf8(ctx, s)? as i32), ty)?
            }
            (ArgKind::Array, HostValue::Bytes(bytes)) => {
                if checkpoint.is_none() {
                    *checkpoint = Some(stack::save(ctx)?);
                }
                to_val(Scalar::I32(stack::push_bytes(ctx, bytes)? as i32), ty)?
            }
            (kind, value) => bail!("argument {i} of '{name}': {kind:?} parameter cannot take {value:?}"),
        };
        params.push(param);
    }
    Ok(params)
}

fn convert_result<C: AsContextMut<Data = HostState>>(
    ctx: &mut C,
    ret: ReturnKind,
    result: Option<&Val>,
) -> Result<HostValue> {
    if ret == ReturnKind::Void {
        return Ok(HostValue::Null);
    }
    let scalar = result
        .map(to_scalar)
        .transpose()?
        .ok_or_else(|| anyhow!("expected a {ret:?} result, but the export returns nothing"))?;
    Ok(match ret {
        ReturnKind::Number => HostValue::Number(scalar),
        ReturnKind::Boolean => HostValue::Boolean(scalar.is_truthy()),
        ReturnKind::String => {
            let ptr = scalar.as_i32() as u32;
            HostValue::Str(HostCall::new(ctx.as_context_mut()).read_utf8(ptr)?)
        }
        ReturnKind::Void => HostValue::Null,
    })
}
