//! C++ exceptions and setjmp/longjmp unwinding through `invoke_*`.

use anyhow::Result;
use emhost::{AbortSignal, ArgKind, HostValue, ReturnKind, RuntimeConfig};
use emhost_tests::{load, load_quiet, small_config, Output};

#[test]
fn caught_exception_is_destroyed_once() -> Result<()> {
    let (mut rt, _) = load_quiet("exceptions")?;

    let caught = rt.call("catch_it", ReturnKind::Number, &[ArgKind::Number], &[41.into()])?;
    assert_eq!(caught, HostValue::from(42));

    // catch (...) with no candidates selects the thrown type.
    let selector = rt.call("selector", ReturnKind::Number, &[], &[])?;
    assert_eq!(selector, HostValue::from(7));

    let uncaught = rt.call("uncaught", ReturnKind::Boolean, &[], &[])?;
    assert_eq!(uncaught, HostValue::Boolean(false));
    assert!(rt.state()?.exceptions.is_empty());

    let frees = rt.call("frees", ReturnKind::Number, &[], &[])?;
    assert_eq!(frees, HostValue::from(1));
    Ok(())
}

#[test]
fn repeated_throws_do_not_leak_records() -> Result<()> {
    let (mut rt, _) = load_quiet("exceptions")?;
    let catch_it = rt.wrap("catch_it", ReturnKind::Number, &[ArgKind::Number])?;
    for i in 0..10 {
        assert_eq!(catch_it.call(&mut rt, &[i.into()])?, HostValue::from(i + 1));
    }
    assert!(rt.state()?.exceptions.is_empty());
    assert_eq!(rt.call("frees", ReturnKind::Number, &[], &[])?, HostValue::from(10));
    Ok(())
}

#[test]
fn catching_a_destroyed_payload_aborts() -> Result<()> {
    let (mut rt, output) = load_quiet("exceptions")?;
    rt.call("catch_it", ReturnKind::Number, &[ArgKind::Number], &[1.into()])?;
    assert!(rt.state()?.exceptions.is_empty());

    let err = rt
        .call("catch_again", ReturnKind::Number, &[ArgKind::Number], &[4096.into()])
        .unwrap_err();
    let signal = err.downcast_ref::<AbortSignal>().unwrap();
    assert!(signal.message.contains("exception table corrupted at payload 4096"));
    assert!(rt.is_halted());
    assert!(output.stderr()[0].contains("exception table corrupted"));
    Ok(())
}

#[test]
fn exception_escaping_main_exits_with_one() -> Result<()> {
    let output = Output::default();
    let config = RuntimeConfig {
        run_automatically: true,
        ..small_config()
    };
    let rt = load("exceptions", config, output.hooks())?;

    assert_eq!(rt.exit_status(), Some(1));
    let stderr = output.stderr();
    assert_eq!(stderr.len(), 1);
    assert!(stderr[0].starts_with("exception thrown: "), "{stderr:?}");
    Ok(())
}

#[test]
fn longjmp_unwinds_to_the_invoke_frame() -> Result<()> {
    let (mut rt, _) = load_quiet("trampolines")?;
    let top = rt.stack_top()?;

    let seen = rt.call("try_jump", ReturnKind::Number, &[ArgKind::Number], &[5.into()])?;
    assert_eq!(seen, HostValue::from(5));

    // longjmp(env, 0) delivers 1.
    let seen = rt.call("try_jump", ReturnKind::Number, &[ArgKind::Number], &[0.into()])?;
    assert_eq!(seen, HostValue::from(1));

    assert_eq!(rt.stack_top()?, top);
    assert!(!rt.is_halted());
    Ok(())
}

#[test]
fn invoke_passes_results_through_when_nothing_throws() -> Result<()> {
    let (mut rt, _) = load_quiet("trampolines")?;
    let doubled = rt.call("invoke_double", ReturnKind::Number, &[ArgKind::Number], &[21.into()])?;
    assert_eq!(doubled, HostValue::from(42));
    Ok(())
}
