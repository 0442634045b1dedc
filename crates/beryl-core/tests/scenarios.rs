//! End-to-end scenarios: compile, link, run, call through the bridge.

use beryl_core::{CallArg, CallOutcome, HandleRef, Machine};

fn boot(source: &str) -> Machine {
    let mut vm = Machine::new();
    if vm.compile("test", source).is_err() {
        let mut msgs = Vec::new();
        while let Some(m) = vm.next_error() {
            msgs.push(m);
        }
        panic!("compile failed:\n{}", msgs.join("\n"));
    }
    if vm.link().is_err() {
        let mut msgs = Vec::new();
        while let Some(m) = vm.next_error() {
            msgs.push(m);
        }
        panic!("link failed:\n{}", msgs.join("\n"));
    }
    vm.run().expect("run");
    vm
}

fn expect_return(outcome: CallOutcome) -> HandleRef {
    match outcome {
        CallOutcome::Return(h) => h,
        CallOutcome::Exception(_) => panic!("unexpected exception"),
    }
}

fn expect_exception(outcome: CallOutcome) -> HandleRef {
    match outcome {
        CallOutcome::Exception(h) => h,
        CallOutcome::Return(_) => panic!("expected an exception"),
    }
}

#[test]
fn test_hello_return() {
    let mut vm = boot("function int main() { return 42; }");
    let result = vm.call_function("main", &[]).unwrap();
    let h = expect_return(result);
    assert_eq!(vm.type_of(h), Some(beryl_bytecode::type_ids::INT));
    assert_eq!(vm.int_value(h), Some(42));
    vm.release(h);
}

#[test]
fn test_arguments_and_arithmetic() {
    let mut vm = boot(
        "function int mix(int a, int b) { return a * 10 + b % 3; }\n\
         function float half(float x) { return x / 2.0; }\n",
    );
    let h = expect_return(
        vm.call_function("mix", &[CallArg::Int(4), CallArg::Int(8)])
            .unwrap(),
    );
    assert_eq!(vm.int_value(h), Some(42));
    vm.release(h);

    let h = expect_return(
        vm.call_function("half", &[CallArg::Float(5.0)]).unwrap(),
    );
    assert_eq!(vm.float_value(h), Some(2.5));
    vm.release(h);
}

#[test]
fn test_control_flow_and_locals() {
    let mut vm = boot(
        "function int sum(int n) {\n\
         \tint total = 0;\n\
         \tfor (int i = 1; i <= n; i++) { total += i; }\n\
         \treturn total;\n\
         }\n",
    );
    let h = expect_return(vm.call_function("sum", &[CallArg::Int(10)]).unwrap());
    assert_eq!(vm.int_value(h), Some(55));
    vm.release(h);
}

#[test]
fn test_class_methods_and_members() {
    let mut vm = boot(
        "class point {\n\
         \tint x;\n\
         \tint y;\n\
         \tmethod point(int px, int py) { x = px; y = py; }\n\
         \tmethod int manhattan() { return x + y; }\n\
         }\n\
         function int use() { point p = new point(30, 12); return p.manhattan(); }\n",
    );
    let h = expect_return(vm.call_function("use", &[]).unwrap());
    assert_eq!(vm.int_value(h), Some(42));
    vm.release(h);
}

#[test]
fn test_exception_bridge() {
    let mut vm = boot(
        "class boom implements exception {\n\
         \tint code;\n\
         \tstring msg;\n\
         \tmethod boom() { code = 7; msg = \"boom\"; }\n\
         \tmethod int getError() { return code; }\n\
         \tmethod string getMessage() { return msg; }\n\
         }\n\
         function fail() { throw new boom(); }\n",
    );
    let exc = expect_exception(vm.call_function("fail", &[]).unwrap());

    let code = expect_return(vm.call_method(exc, "getError", &[]).unwrap());
    assert_eq!(vm.int_value(code), Some(7));
    vm.release(code);

    let msg = expect_return(vm.call_method(exc, "getMessage", &[]).unwrap());
    assert_eq!(vm.str_value(msg), Some("boom"));
    vm.release(msg);
    vm.release(exc);
}

#[test]
fn test_closure_lifetime() {
    let mut vm = boot(
        "function var make() {\n\
         \tint x = 5;\n\
         \treturn () => x;\n\
         }\n",
    );
    let delegate = expect_return(vm.call_function("make", &[]).unwrap());

    // The outer frame is long gone; the closure still sees its capture.
    let value = expect_return(vm.call_delegate(delegate, &[]).unwrap());
    assert_eq!(vm.int_value(value), Some(5));
    vm.release(value);

    // Releasing the delegate drops it and its captured environment.
    let before = vm.handle_count();
    vm.release(delegate);
    assert!(!vm.is_live(delegate));
    assert!(vm.handle_count() < before);
}

#[test]
fn test_cofunction_yields_then_exhausts() {
    let mut vm = boot("cofunction int gen() { yield 1; yield 2; yield 3; }");
    let task = vm.new_task("gen", &[]).unwrap();

    for expected in 1..=3 {
        let h = expect_return(vm.resume_task(task).unwrap());
        assert_eq!(vm.int_value(h), Some(expected));
        vm.release(h);
    }

    // The fourth resume raises a software exception.
    let exc = expect_exception(vm.resume_task(task).unwrap());
    let code = expect_return(vm.call_method(exc, "getError", &[]).unwrap());
    assert_eq!(
        vm.int_value(code),
        Some(beryl_core::VmError::SoftwareException.code() as i64)
    );
    vm.release(code);
    vm.release(exc);
    vm.release(task);
}

#[test]
fn test_cofunction_in_script() {
    let mut vm = boot(
        "cofunction int counter(int start) { yield start; yield start + 1; }\n\
         function int drive() {\n\
         \tcounter c = new counter(10);\n\
         \treturn c() + c();\n\
         }\n",
    );
    let h = expect_return(vm.call_function("drive", &[]).unwrap());
    assert_eq!(vm.int_value(h), Some(21));
    vm.release(h);
}

#[test]
fn test_chunk_round_trip() {
    let mut vm = boot("function int main() { return 42; }");
    let chunk = vm.save_chunk(None);

    // save -> load -> save must be byte-identical.
    let mut vm2 = Machine::new();
    vm2.load_chunk(&chunk).unwrap();
    let chunk2 = vm2.save_chunk(None);
    assert_eq!(chunk, chunk2);

    vm2.run().unwrap();
    let h = expect_return(vm2.call_function("main", &[]).unwrap());
    assert_eq!(vm2.int_value(h), Some(42));
    vm2.release(h);
}

#[test]
fn test_gc_breaks_cycles() {
    let mut vm = boot(
        "class node { node other; }\n\
         function cycle() {\n\
         \tnode a = new node();\n\
         \tnode b = new node();\n\
         \ta.other = b;\n\
         \tb.other = a;\n\
         }\n",
    );
    let baseline = vm.handle_count();
    expect_return(vm.call_function("cycle", &[]).unwrap());
    // The two nodes keep each other alive through strong references.
    assert!(vm.handle_count() >= baseline + 2);

    let stats = vm.gc_collect();
    assert!(stats.collected >= 2);
    assert_eq!(vm.handle_count(), baseline);
}

#[test]
fn test_delegates_bound_and_global() {
    let mut vm = boot(
        "function int twice(int v) { return v * 2; }\n\
         class holder {\n\
         \tint base;\n\
         \tmethod holder(int b) { base = b; }\n\
         \tmethod int plus(int v) { return base + v; }\n\
         }\n\
         function var pick(int which) {\n\
         \tif (which) { return twice; }\n\
         \tholder h = new holder(40);\n\
         \treturn h.plus;\n\
         }\n",
    );
    let global = expect_return(vm.call_function("pick", &[CallArg::Int(1)]).unwrap());
    let h = expect_return(vm.call_delegate(global, &[CallArg::Int(21)]).unwrap());
    assert_eq!(vm.int_value(h), Some(42));
    vm.release(h);
    vm.release(global);

    let bound = expect_return(vm.call_function("pick", &[CallArg::Int(0)]).unwrap());
    let h = expect_return(vm.call_delegate(bound, &[CallArg::Int(2)]).unwrap());
    assert_eq!(vm.int_value(h), Some(42));
    vm.release(h);
    vm.release(bound);
}

#[test]
fn test_switch_with_fallthrough_and_default() {
    let mut vm = boot(
        "function int classify(int v) {\n\
         \tint r = 0;\n\
         \tswitch (v) {\n\
         \tcase 1:\n\
         \tcase 2:\n\
         \t\tr = 10;\n\
         \t\tbreak;\n\
         \tcase 3:\n\
         \t\tr = 20;\n\
         \t\tbreak;\n\
         \tdefault:\n\
         \t\tr = 99;\n\
         \t}\n\
         \treturn r;\n\
         }\n",
    );
    for (input, expected) in [(1, 10), (2, 10), (3, 20), (7, 99)] {
        let h = expect_return(vm.call_function("classify", &[CallArg::Int(input)]).unwrap());
        assert_eq!(vm.int_value(h), Some(expected), "classify({input})");
        vm.release(h);
    }
}

#[test]
fn test_global_variables_initialize_on_run() {
    let mut vm = boot(
        "int base = 40;\n\
         function int ans() { return base + 2; }\n",
    );
    let h = expect_return(vm.call_function("ans", &[]).unwrap());
    assert_eq!(vm.int_value(h), Some(42));
    vm.release(h);
}

#[test]
fn test_interface_dispatch() {
    let mut vm = boot(
        "interface shape { method int area(); }\n\
         class square implements shape {\n\
         \tint side;\n\
         \tmethod square(int s) { side = s; }\n\
         \tmethod int area() { return side * side; }\n\
         }\n\
         function int measure() {\n\
         \tshape s = new square(6);\n\
         \treturn s.area() + 6;\n\
         }\n",
    );
    let h = expect_return(vm.call_function("measure", &[]).unwrap());
    assert_eq!(vm.int_value(h), Some(42));
    vm.release(h);
}

#[test]
fn test_hybrid_inherits_implementation() {
    let mut vm = boot(
        "class base {\n\
         \tint v;\n\
         \tmethod base() { v = 40; }\n\
         \tmethod int value() { return v; }\n\
         }\n\
         class derived hybrid base {\n\
         \tmethod derived() { v = 40; }\n\
         \tmethod int bonus() { return value() + 2; }\n\
         }\n\
         function int use() { derived d = new derived(); return d.bonus(); }\n",
    );
    let h = expect_return(vm.call_function("use", &[]).unwrap());
    assert_eq!(vm.int_value(h), Some(42));
    vm.release(h);
}

#[test]
fn test_accessors_guard_private_members() {
    let mut vm = boot(
        "class account {\n\
         \tprivate int balance;\n\
         \tmethod account() { balance = 0; }\n\
         \taccessor int amount() { return balance; }\n\
         \taccessor amount(int v) { balance = v; }\n\
         }\n\
         function int roundtrip(int v) {\n\
         \taccount a = new account();\n\
         \ta.amount = v;\n\
         \treturn a.amount + 2;\n\
         }\n",
    );
    let h = expect_return(vm.call_function("roundtrip", &[CallArg::Int(40)]).unwrap());
    assert_eq!(vm.int_value(h), Some(42));
    vm.release(h);
}

#[test]
fn test_declared_delegate_type() {
    let mut vm = boot(
        "delegate int producer();\n\
         function var make() { return () => 41; }\n\
         function int use() {\n\
         \tproducer p = make();\n\
         \treturn p() + 1;\n\
         }\n",
    );
    let h = expect_return(vm.call_function("use", &[]).unwrap());
    assert_eq!(vm.int_value(h), Some(42));
    vm.release(h);
}

#[test]
fn test_string_concat_and_tostring() {
    let mut vm = boot(
        "function string greet(string name) { return \"hello \" + name + \"!\"; }\n",
    );
    let h = expect_return(
        vm.call_function("greet", &[CallArg::Str("world".into())])
            .unwrap(),
    );
    assert_eq!(vm.str_value(h), Some("hello world!"));
    vm.release(h);
}

#[test]
fn test_divide_by_zero_becomes_runtime_exception() {
    let mut vm = boot("function int crash(int d) { return 10 / d; }");
    let exc = expect_exception(vm.call_function("crash", &[CallArg::Int(0)]).unwrap());
    let code = expect_return(vm.call_method(exc, "getError", &[]).unwrap());
    assert_eq!(
        vm.int_value(code),
        Some(beryl_core::VmError::DivideByZero.code() as i64)
    );
    vm.release(code);
    vm.release(exc);
}
