//! Runtime contract tests: call bridge validation, locking, stack
//! limits, exception vectors and the native type lifecycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use beryl_core::{CallArg, CallOutcome, HandleRef, LibError, Machine, Vector, VmError};
use beryl_sdk::{NativeError, NativeMessage, NativeType};

fn boot(source: &str) -> Machine {
    let mut vm = Machine::new();
    vm.compile("test", source).expect("compile");
    vm.link().expect("link");
    vm.run().expect("run");
    vm
}

#[test]
fn test_null_handle_release_is_noop() {
    let mut vm = Machine::new();
    let before = vm.handle_count();
    for _ in 0..10 {
        vm.release(HandleRef::NULL);
    }
    assert_eq!(vm.handle_count(), before);
    assert!(vm.is_live(HandleRef::NULL));
}

#[test]
fn test_argument_tags_are_validated() {
    let mut vm = boot("function int id(int v) { return v; }");
    // Wrong tag: a float does not silently convert to int.
    let err = vm
        .call_function("id", &[CallArg::Float(1.0)])
        .unwrap_err();
    assert_eq!(err, LibError::IllegalArgument);
    // Wrong arity.
    let err = vm.call_function("id", &[]).unwrap_err();
    assert_eq!(err, LibError::IllegalArgument);
    // Right tag works.
    let outcome = vm.call_function("id", &[CallArg::Int(5)]).unwrap();
    assert!(matches!(outcome, CallOutcome::Return(_)));
}

#[test]
fn test_blocked_machine_refuses_calls() {
    let mut vm = boot("function int f() { return 1; }");
    vm.set_blocked(true);
    assert_eq!(
        vm.call_function("f", &[]).unwrap_err(),
        LibError::RuntimeBlocked
    );
    vm.set_blocked(false);
    assert!(vm.call_function("f", &[]).is_ok());
}

#[test]
fn test_uninitialized_machine_refuses_calls() {
    let mut vm = Machine::new();
    vm.compile("t", "function int f() { return 1; }").unwrap();
    vm.link().unwrap();
    assert_eq!(
        vm.call_function("f", &[]).unwrap_err(),
        LibError::CodeNotInitialized
    );
}

#[test]
fn test_compile_locked_after_run() {
    let mut vm = boot("function int f() { return 1; }");
    assert_eq!(
        vm.compile("more", "function int g() { return 2; }")
            .unwrap_err(),
        LibError::RuntimeLocked
    );
}

#[test]
fn test_runtime_options_locked_after_run() {
    let mut vm = Machine::new();
    vm.set_options("data-stack-size=1024").unwrap();
    vm.compile("t", "function int f() { return 1; }").unwrap();
    vm.link().unwrap();
    vm.run().unwrap();
    assert_eq!(
        vm.set_options("data-stack-size=2048").unwrap_err(),
        LibError::RuntimeLocked
    );
    // Compile-only options stay legal.
    vm.set_options("verbose=1").unwrap();
}

#[test]
fn test_call_stack_overflow_is_detected() {
    let mut vm = Machine::new();
    vm.set_options("call-stack-size=16").unwrap();
    vm.compile("t", "function int rec(int n) { return rec(n + 1); }")
        .unwrap();
    vm.link().unwrap();
    vm.run().unwrap();
    let outcome = vm.call_function("rec", &[CallArg::Int(0)]).unwrap();
    let exc = match outcome {
        CallOutcome::Exception(h) => h,
        CallOutcome::Return(_) => panic!("runaway recursion returned"),
    };
    let code = match vm.call_method(exc, "getError", &[]).unwrap() {
        CallOutcome::Return(h) => h,
        _ => panic!("getError threw"),
    };
    assert_eq!(
        vm.int_value(code),
        Some(VmError::StackOverflow.code() as i64)
    );
    vm.release(code);
    vm.release(exc);
}

#[test]
fn test_get_function_object_static_quirk() {
    let mut vm = boot(
        "class c {\n\
         \tint v;\n\
         \tmethod c() { v = 1; }\n\
         \tmethod int get() { return v; }\n\
         }\n\
         function int free_fn() { return 2; }\n\
         function var make() { return new c(); }\n",
    );
    let obj = match vm.call_function("make", &[]).unwrap() {
        CallOutcome::Return(h) => h,
        _ => panic!("make threw"),
    };

    // Plain lookups work both ways.
    assert!(vm.get_function("free_fn", None).is_some());
    assert!(vm.get_function("get", Some(obj)).is_some());
    // A non-null object with a static (non-method) name resolves to
    // nothing; the sample runtime returned null here and we keep that.
    assert!(vm.get_function("free_fn", Some(obj)).is_none());
    assert!(vm.get_function("get", None).is_none());
    vm.release(obj);
}

#[test]
fn test_break_vector_fires() {
    let fired = Arc::new(AtomicUsize::new(0));
    let seen = fired.clone();
    let mut vm = boot("function int f() { __brk; return 9; }");
    vm.set_vector(
        Vector::Break,
        Box::new(move |err, _| {
            assert_eq!(err, VmError::Break);
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let outcome = vm.call_function("f", &[]).unwrap();
    assert!(matches!(outcome, CallOutcome::Return(_)));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_machine_vector_fires_on_error() {
    let fired = Arc::new(AtomicUsize::new(0));
    let seen = fired.clone();
    let mut vm = boot("function int crash() { return 1 / zero(); }\nfunction int zero() { return 0; }");
    vm.set_vector(
        Vector::Machine,
        Box::new(move |err, _| {
            assert_eq!(err, VmError::DivideByZero);
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let outcome = vm.call_function("crash", &[]).unwrap();
    assert!(matches!(outcome, CallOutcome::Exception(_)));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

// ===== Native type lifecycle =====

struct CounterType {
    live: Arc<AtomicUsize>,
}

struct CounterObj {
    value: i64,
}

impl NativeType for CounterType {
    fn class_name(&self) -> &str {
        "counter"
    }

    fn declaration(&self) -> &str {
        "class counter {\n\
         \tmethod counter();\n\
         \tmethod int get();\n\
         \tmethod inc();\n\
         \tfunction int answer();\n\
         }\n"
    }

    fn author_name(&self) -> &str {
        "tests"
    }

    fn dispatch(&mut self, msg: NativeMessage<'_>) -> Result<(), NativeError> {
        match msg {
            NativeMessage::NewObject { out } => {
                self.live.fetch_add(1, Ordering::SeqCst);
                *out = Some(Box::new(CounterObj { value: 0 }));
                Ok(())
            }
            NativeMessage::DestroyObject { .. } => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            NativeMessage::CallMember {
                func_idx,
                object,
                frame,
            } => {
                let obj = object
                    .downcast_mut::<CounterObj>()
                    .ok_or(NativeError::Unsupported)?;
                match func_idx {
                    0 => {} // constructor
                    1 => frame.ret_int(obj.value),
                    2 => obj.value += 1,
                    other => return Err(NativeError::UnknownFunction(other)),
                }
                Ok(())
            }
            NativeMessage::CallStatic { func_idx: 3, frame } => {
                frame.ret_int(42);
                Ok(())
            }
            NativeMessage::CallStatic { func_idx, .. } => {
                Err(NativeError::UnknownFunction(func_idx))
            }
            _ => Ok(()),
        }
    }
}

#[test]
fn test_native_type_member_and_static_calls() {
    let live = Arc::new(AtomicUsize::new(0));
    let mut vm = Machine::new();
    vm.register_native_type(Box::new(CounterType { live: live.clone() }))
        .unwrap();
    vm.compile(
        "t",
        "function int use() {\n\
         \tcounter c = new counter();\n\
         \tc.inc();\n\
         \tc.inc();\n\
         \treturn c.get() + counter::answer();\n\
         }\n",
    )
    .unwrap();
    vm.link().unwrap();
    vm.run().unwrap();

    let outcome = vm.call_function("use", &[]).unwrap();
    let h = match outcome {
        CallOutcome::Return(h) => h,
        CallOutcome::Exception(_) => panic!("native call threw"),
    };
    assert_eq!(vm.int_value(h), Some(44));
    vm.release(h);
    // The local released when the frame unwound.
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_native_object_lifecycle_balances_pools() {
    let live = Arc::new(AtomicUsize::new(0));
    let mut vm = Machine::new();
    vm.register_native_type(Box::new(CounterType { live: live.clone() }))
        .unwrap();
    vm.compile("t", "function poke() { counter c = new counter(); c.inc(); }")
        .unwrap();
    vm.link().unwrap();
    vm.run().unwrap();

    let stats_before = vm.fixmem_stats();
    let handles_before = vm.handle_count();
    let _ = vm.call_function("poke", &[]).unwrap();
    assert_eq!(live.load(Ordering::SeqCst), 0);
    assert_eq!(vm.fixmem_stats().live_blocks, stats_before.live_blocks);
    assert_eq!(vm.fixmem_stats().live_bytes, stats_before.live_bytes);
    assert_eq!(vm.handle_count(), handles_before);
}

#[test]
fn test_incompatible_native_version_is_rejected() {
    struct Stale;
    impl NativeType for Stale {
        fn class_name(&self) -> &str {
            "stale"
        }
        fn declaration(&self) -> &str {
            "class stale { method stale(); }"
        }
        fn interface_version(&self) -> u32 {
            1
        }
        fn dispatch(&mut self, _: NativeMessage<'_>) -> Result<(), NativeError> {
            Ok(())
        }
    }
    let mut vm = Machine::new();
    assert_eq!(
        vm.register_native_type(Box::new(Stale)).unwrap_err(),
        LibError::IncompatibleNativeType
    );
}

#[test]
fn test_bad_native_declaration_aborts_registration() {
    struct Broken;
    impl NativeType for Broken {
        fn class_name(&self) -> &str {
            "broken"
        }
        fn declaration(&self) -> &str {
            "class broken { method broken(" // truncated on purpose
        }
        fn dispatch(&mut self, _: NativeMessage<'_>) -> Result<(), NativeError> {
            Ok(())
        }
    }
    let mut vm = Machine::new();
    assert_eq!(
        vm.register_native_type(Box::new(Broken)).unwrap_err(),
        LibError::RegisterTypeFailed
    );
}

#[test]
fn test_gc_interval_schedule_runs() {
    let mut vm = boot(
        "class pair { pair buddy; }\n\
         function churn() {\n\
         \tfor (int i = 0; i < 50; i++) {\n\
         \t\tpair a = new pair();\n\
         \t\tpair b = new pair();\n\
         \t\ta.buddy = b;\n\
         \t\tb.buddy = a;\n\
         \t\ta.buddy = null;\n\
         \t}\n\
         }\n",
    );
    vm.set_gc_interval(128);
    let baseline = vm.handle_count();
    let _ = vm.call_function("churn", &[]).unwrap();
    vm.gc_collect();
    assert_eq!(vm.handle_count(), baseline);
}
