//! End-to-end tests for emhost: WAT in, instantiated runtime out.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use emhost::{
    ArgKind, Hooks, HostValue, ModuleSource, ReturnKind, Runtime, RuntimeConfig, Scalar,
    TrampolineMismatch,
};

fn config() -> RuntimeConfig {
    RuntimeConfig {
        total_memory: 1 << 20,
        total_stack: 64 << 10,
        run_automatically: false,
        ..RuntimeConfig::default()
    }
}

fn quiet() -> Hooks {
    Hooks {
        print: Arc::new(|_: &str| {}),
        print_err: Arc::new(|_: &str| {}),
        ..Hooks::default()
    }
}

fn instantiate_wat(wat_source: &str) -> Result<Runtime> {
    let wasm = wat::parse_str(wat_source).context("failed to parse WAT")?;
    Runtime::instantiate(ModuleSource::Bytes(wasm), config(), quiet())
}

#[test]
fn test_stack_globals_match_layout() -> Result<()> {
    let mut rt = instantiate_wat(
        r#"
        (module
            (import "env" "memory" (memory 1))
            (import "env" "STACKTOP" (global $top i32))
            (import "env" "STACK_MAX" (global $max i32))
            (import "env" "memoryBase" (global $base i32))
            (import "env" "tableBase" (global $table i32))
            (func (export "_stack_size") (result i32)
                (i32.sub (global.get $max) (global.get $top)))
            (func (export "_memory_base") (result i32)
                (global.get $base))
        )
    "#,
    )?;
    let layout = rt.layout()?;
    let size = rt.call("stack_size", ReturnKind::Number, &[], &[])?;
    assert_eq!(size, HostValue::from((layout.stack_max - layout.stack_base) as i32));
    let base = rt.call("memory_base", ReturnKind::Number, &[], &[])?;
    assert_eq!(base, HostValue::from(1024));
    Ok(())
}

#[test]
fn test_math_imports() -> Result<()> {
    let mut rt = instantiate_wat(
        r#"
        (module
            (import "global.Math" "pow" (func $pow (param f64 f64) (result f64)))
            (import "global.Math" "floor" (func $floor (param f64) (result f64)))
            (import "env" "memory" (memory 1))
            (func (export "_pow_floor") (param f64 f64) (result f64)
                (call $floor (call $pow (local.get 0) (local.get 1))))
        )
    "#,
    )?;
    let ret = rt.call(
        "pow_floor",
        ReturnKind::Number,
        &[ArgKind::Number; 2],
        &[1.5.into(), 3.0.into()],
    )?;
    assert_eq!(ret, HostValue::Number(Scalar::F64(3.0)));
    Ok(())
}

#[test]
fn test_temp_ret0() -> Result<()> {
    let mut rt = instantiate_wat(
        r#"
        (module
            (import "env" "memory" (memory 1))
            (import "env" "setTempRet0" (func $set (param i32)))
            (import "env" "getTempRet0" (func $get (result i32)))
            (func (export "_high_word") (param i32) (result i32)
                (call $set (local.get 0))
                (call $get))
        )
    "#,
    )?;
    let ret = rt.call("high_word", ReturnKind::Number, &[ArgKind::Number], &[77.into()])?;
    assert_eq!(ret, HostValue::from(77));
    assert_eq!(rt.state()?.temp_ret0, 77);
    Ok(())
}

#[test]
fn test_errno_goes_through_errno_location() -> Result<()> {
    let mut rt = instantiate_wat(
        r#"
        (module
            (import "env" "memory" (memory 1))
            (import "env" "___setErrNo" (func $set_errno (param i32) (result i32)))
            (data (i32.const 1024) "\00\00\00\00")
            (func (export "___errno_location") (result i32) (i32.const 1024))
            (func (export "_fail_with") (param i32) (result i32)
                (drop (call $set_errno (local.get 0)))
                (i32.const -1))
        )
    "#,
    )?;
    rt.call("fail_with", ReturnKind::Number, &[ArgKind::Number], &[22.into()])?;
    assert_eq!(rt.read_at(1024, "i32")?, Scalar::I32(22));
    Ok(())
}

#[test]
fn test_memcpy_big() -> Result<()> {
    let mut rt = instantiate_wat(
        r#"
        (module
            (import "env" "memory" (memory 1))
            (import "env" "_emscripten_memcpy_big" (func $copy (param i32 i32 i32) (result i32)))
            (func (export "_copy") (param i32 i32 i32) (result i32)
                (call $copy (local.get 0) (local.get 1) (local.get 2)))
        )
    "#,
    )?;
    rt.write_at(4096, Scalar::I32(0x0102_0304), "i32")?;
    let ret = rt.call(
        "copy",
        ReturnKind::Number,
        &[ArgKind::Number; 3],
        &[8192.into(), 4096.into(), 4.into()],
    )?;
    assert_eq!(ret, HostValue::from(8192));
    assert_eq!(rt.read_at(8192, "i32")?, Scalar::I32(0x0102_0304));
    Ok(())
}

#[test]
fn test_module_from_path_with_locate_resource() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("emhost-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let wasm = wat::parse_str(
        r#"(module
            (import "env" "memory" (memory 1))
            (func (export "_seven") (result i32) (i32.const 7)))"#,
    )?;
    std::fs::write(dir.join("seven.wasm"), wasm)?;

    let located = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&located);
    let prefix = dir.clone();
    let mut hooks = quiet();
    hooks.locate_resource = Some(Box::new(move |name: &str| {
        record.lock().unwrap().push(name.to_string());
        prefix.join(name).display().to_string()
    }));
    let mut rt = Runtime::instantiate(ModuleSource::from_arg("seven.wasm"), config(), hooks)?;

    assert_eq!(*located.lock().unwrap(), ["seven.wasm"]);
    assert_eq!(rt.call("seven", ReturnKind::Number, &[], &[])?, HostValue::from(7));
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn test_mistyped_invoke_import_is_rejected() {
    let err = instantiate_wat(
        r#"
        (module
            (import "env" "memory" (memory 1))
            (import "env" "invoke_vii" (func (param i32 i32)))
        )
    "#,
    )
    .err()
    .unwrap();
    let mismatch = err.downcast_ref::<TrampolineMismatch>().unwrap();
    assert_eq!(mismatch.name, "invoke_vii");
    assert_eq!(mismatch.expected, "viii");
    assert_eq!(mismatch.declared, "vii");
}

#[test]
fn test_missing_file_is_an_error() {
    let err = Runtime::instantiate(
        ModuleSource::from_arg("/nonexistent/emhost/module.wasm"),
        config(),
        quiet(),
    )
    .err()
    .unwrap();
    assert!(format!("{err:#}").contains("failed to read"));
}
