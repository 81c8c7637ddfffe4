use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::bytecode::builder::FunctionBuilder;
use crate::bytecode::op::NumOp;
use crate::error::{Error, HostFunctionId};
use crate::handles::Handle;
use crate::heap::HeapSettings;
use crate::image::builder::{ImageBuilder, ShortCallTarget};
use crate::jobs::PromiseState;
use crate::value::{RomPtr, Value};
use crate::vm::{HostFunction, Vm, VmCreateInfo};

fn host(
    f: impl Fn(&mut Vm<'_>, HostFunctionId, &[Value]) -> Result<Value, Error> + 'static,
) -> HostFunction {
    Rc::new(f)
}

fn single_export(f: FunctionBuilder) -> Vec<u8> {
    let mut b = ImageBuilder::new();
    let function = b.function(f);
    b.export(1, function);
    b.build()
}

/// `(a, b) => a + b`
fn add_function() -> FunctionBuilder {
    let mut f = FunctionBuilder::new();
    f.load_arg(1);
    f.load_arg(2);
    f.add();
    f.return_();
    f
}

#[test]
fn adds_small_and_large_numbers() {
    let image = single_export(add_function());
    let mut vm = Vm::restore(&image, |_| None).unwrap();
    let add = vm.resolve_export(1).unwrap();

    assert_eq!(vm.call(add, &[Value::Int(2), Value::Int(3)]).unwrap(), Value::Int(5));

    let big = vm.new_number(2e9).unwrap();
    let sum = vm.call(add, &[big, big]).unwrap();
    assert_eq!(vm.to_f64(sum), 4_000_000_000.0);

    let max = vm.new_int32(i32::MAX).unwrap();
    let sum = vm.call(add, &[max, Value::Int(1)]).unwrap();
    assert_eq!(vm.to_f64(sum), 2_147_483_648.0);
    assert_eq!(vm.value_to_string(sum), "2147483648");
}

#[test]
fn negative_zero_and_nan() {
    let mut b = ImageBuilder::new();
    let mut negate = FunctionBuilder::new();
    negate.load_arg(1);
    negate.num_op(NumOp::Negate);
    negate.return_();
    let negate = b.function(negate);
    b.export(1, negate);
    let mut divide = FunctionBuilder::new();
    divide.load_arg(1);
    divide.load_arg(2);
    divide.num_op(NumOp::Divide);
    divide.return_();
    let divide = b.function(divide);
    b.export(2, divide);
    let image = b.build();

    let mut vm = Vm::restore(&image, |_| None).unwrap();
    let negate = vm.resolve_export(1).unwrap();
    let divide = vm.resolve_export(2).unwrap();

    let zero = vm.call(negate, &[Value::Int(0)]).unwrap();
    assert_eq!(zero, Value::NegZero);
    assert!(vm.equal(zero, Value::Int(0)));
    assert_eq!(vm.value_to_string(zero), "0");

    let nan = vm.call(divide, &[Value::Int(0), Value::Int(0)]).unwrap();
    assert!(vm.is_nan(nan));
    assert!(!vm.equal(nan, nan));

    let inf = vm.call(divide, &[Value::Int(1), zero]).unwrap();
    assert_eq!(vm.to_f64(inf), f64::NEG_INFINITY);
}

#[test]
fn unreferenced_object_is_collected() {
    let mut b = ImageBuilder::new();
    let x = b.string("x");
    let mut f = FunctionBuilder::new();
    f.object_new();
    f.load_var(0);
    f.load_int(1);
    f.object_set_key(x);
    f.load_literal(Value::Undefined);
    f.return_();
    let function = b.function(f);
    b.export(1, function);
    let image = b.build();

    let mut vm = Vm::restore(&image, |_| None).unwrap();
    let function = vm.resolve_export(1).unwrap();
    vm.call(function, &[]).unwrap();
    assert!(vm.memory_stats().heap_used > 0);
    vm.collect_garbage(false);
    assert_eq!(vm.memory_stats().heap_used, 0);
    assert_eq!(vm.memory_stats().gc_count, 1);
}

#[test]
fn exception_unwinds_to_a_handler_in_the_caller() {
    let mut b = ImageBuilder::new();
    let oops = b.string("oops");
    let mut inner = FunctionBuilder::new();
    inner.load_literal(oops);
    inner.throw();
    let inner = b.function(inner);

    let mut outer = FunctionBuilder::new();
    let handler = outer.new_label();
    outer.start_try(handler);
    outer.load_literal(inner);
    outer.load_literal(Value::Undefined);
    outer.call(1);
    outer.return_();
    outer.bind(handler);
    outer.enter_handler();
    outer.return_();
    let outer = b.function(outer);
    b.export(1, outer);
    b.export(2, inner);
    let image = b.build();

    let mut vm = Vm::restore(&image, |_| None).unwrap();
    let outer = vm.resolve_export(1).unwrap();
    let caught = vm.call(outer, &[]).unwrap();
    assert_eq!(vm.value_to_string(caught), "oops");
    assert!(vm.stack.is_empty());
    assert!(vm.frames.is_empty());

    let inner = vm.resolve_export(2).unwrap();
    match vm.call(inner, &[]) {
        Err(Error::Exception(value)) => assert_eq!(vm.value_to_string(value), "oops"),
        other => panic!("expected an exception, got {other:?}"),
    }
}

#[test]
fn unbounded_recursion_overflows_the_stack() {
    let mut b = ImageBuilder::new();
    let recurse = b.declare_function();
    let mut f = FunctionBuilder::new();
    f.load_literal(recurse);
    f.load_literal(Value::Undefined);
    f.call(1);
    f.return_();
    b.define_function(recurse, f);
    b.export(1, recurse);
    let add = b.function(add_function());
    b.export(2, add);
    let image = b.build();

    let info = VmCreateInfo {
        stack_size: 64,
        ..VmCreateInfo::default()
    };
    let mut vm = Vm::restore_with(&image, info, |_| None).unwrap();
    let recurse = vm.resolve_export(1).unwrap();
    assert!(matches!(vm.call(recurse, &[]), Err(Error::StackOverflow)));
    assert!(vm.stack.is_empty());
    assert!(vm.frames.is_empty());

    let add = vm.resolve_export(2).unwrap();
    assert_eq!(vm.call(add, &[Value::Int(1), Value::Int(1)]).unwrap(), Value::Int(2));
}

#[test]
fn instruction_budget_stops_a_loop_once() {
    let mut b = ImageBuilder::new();
    let mut spin = FunctionBuilder::new();
    let top = spin.new_label();
    spin.bind(top);
    spin.jump(top);
    let spin = b.function(spin);
    b.export(1, spin);
    let add = b.function(add_function());
    b.export(2, add);
    let image = b.build();

    let mut vm = Vm::restore(&image, |_| None).unwrap();
    let spin = vm.resolve_export(1).unwrap();
    let add = vm.resolve_export(2).unwrap();
    vm.stop_after_n_instructions(Some(1000));
    assert!(matches!(vm.call(spin, &[]), Err(Error::InstructionCountReached)));
    assert!(vm.frames.is_empty());
    assert_eq!(vm.call(add, &[Value::Int(2), Value::Int(2)]).unwrap(), Value::Int(4));
}

#[test]
fn breakpoint_reports_its_address() {
    let image = single_export(add_function());
    let mut vm = Vm::restore(&image, |_| None).unwrap();
    let add = vm.resolve_export(1).unwrap();
    let Value::Rom(RomPtr(body)) = add else {
        panic!("export is not a ROM function");
    };
    let entry = body as usize + 1;

    let hits = Rc::new(RefCell::new(Vec::new()));
    let seen = hits.clone();
    vm.set_breakpoint(entry);
    vm.set_breakpoint_callback(Some(Box::new(move |_vm: &mut Vm<'_>, address: usize| {
        seen.borrow_mut().push(address);
    })));
    vm.call(add, &[Value::Int(1), Value::Int(2)]).unwrap();
    vm.call(add, &[Value::Int(1), Value::Int(2)]).unwrap();
    assert_eq!(*hits.borrow(), vec![entry, entry]);

    vm.remove_breakpoint(entry);
    vm.call(add, &[Value::Int(1), Value::Int(2)]).unwrap();
    assert_eq!(hits.borrow().len(), 2);
}

#[test]
fn host_function_can_reenter_the_vm() {
    let mut b = ImageBuilder::new();
    let twice = b.import(7);
    let mut main = FunctionBuilder::new();
    main.load_literal(Value::Undefined);
    main.load_arg(1);
    main.call_host(twice, 2);
    main.return_();
    let main = b.function(main);
    b.export(1, main);
    let mut double = FunctionBuilder::new();
    double.load_arg(1);
    double.load_arg(1);
    double.add();
    double.return_();
    let double = b.function(double);
    b.export(2, double);
    let image = b.build();

    let twice = host(|vm, id, args| {
        assert_eq!(id, 7);
        let double = vm.resolve_export(2)?;
        vm.call(double, &[args[0]])
    });
    let mut vm = Vm::restore(&image, |id| (id == 7).then(|| twice.clone())).unwrap();
    let main = vm.resolve_export(1).unwrap();
    assert_eq!(vm.call(main, &[Value::Int(21)]).unwrap(), Value::Int(42));
}

#[test]
fn host_exception_is_catchable() {
    let mut b = ImageBuilder::new();
    let fail = b.import(1);
    let mut f = FunctionBuilder::new();
    let handler = f.new_label();
    f.start_try(handler);
    f.load_literal(Value::Undefined);
    f.call_host(fail, 1);
    f.return_();
    f.bind(handler);
    f.enter_handler();
    f.return_();
    let function = b.function(f);
    b.export(1, function);
    let image = b.build();

    let fail = host(|_, _, _| Err(Error::Exception(Value::Int(99))));
    let mut vm = Vm::restore(&image, |_| Some(fail.clone())).unwrap();
    let function = vm.resolve_export(1).unwrap();
    assert_eq!(vm.call(function, &[]).unwrap(), Value::Int(99));
}

#[test]
fn short_calls_reach_functions_and_imports() {
    // return add(a, 1) + host(a)
    let mut b = ImageBuilder::new();
    let add = b.function(add_function());
    let square = b.import(4);
    let to_add = b.short_call(ShortCallTarget::Function(add), 3);
    let to_host = b.short_call(ShortCallTarget::Host { import: square }, 2);
    let mut f = FunctionBuilder::new();
    f.load_literal(Value::Undefined);
    f.load_arg(1);
    f.load_int(1);
    f.call_short(to_add, 3);
    f.load_literal(Value::Undefined);
    f.load_arg(1);
    f.call_short(to_host, 2);
    f.add();
    f.return_();
    let main = b.function(f);
    b.export(1, main);
    let image = b.build();

    let square = host(|vm, id, args| {
        assert_eq!(id, 4);
        let n = vm.to_f64(args[0]);
        vm.new_number(n * n)
    });
    let mut vm = Vm::restore(&image, |_| Some(square.clone())).unwrap();
    let main = vm.resolve_export(1).unwrap();
    assert_eq!(vm.call(main, &[Value::Int(5)]).unwrap(), Value::Int(31));
    assert!(vm.stack.is_empty());
}

#[test]
fn object_keys_follow_insertion_order() {
    let mut b = ImageBuilder::new();
    let second = b.string("second");
    let first = b.string("first");
    let mut f = FunctionBuilder::new();
    f.object_new();
    f.load_var(0);
    f.load_int(1);
    f.object_set_key(second);
    f.load_var(0);
    f.load_int(2);
    f.object_set_key(first);
    f.load_var(0);
    f.object_keys();
    f.return_();
    let main = b.function(f);
    b.export(1, main);
    b.export(2, second);
    b.export(3, first);
    let image = b.build();

    let mut vm = Vm::restore(&image, |_| None).unwrap();
    let main = vm.resolve_export(1).unwrap();
    let second = vm.resolve_export(2).unwrap();
    let first = vm.resolve_export(3).unwrap();
    let keys = vm.call(main, &[]).unwrap();
    assert_eq!(vm.get_property(keys, Value::StrLength).unwrap(), Value::Int(2));
    assert_eq!(vm.get_property(keys, Value::Int(0)).unwrap(), second);
    assert_eq!(vm.get_property(keys, Value::Int(1)).unwrap(), first);
}

#[test]
fn class_construction_runs_the_constructor() {
    let mut b = ImageBuilder::new();
    let x = b.string("x");
    let greet = b.string("greet");
    let prototype_key = b.string("prototype");

    let mut ctor = FunctionBuilder::new();
    ctor.load_arg(0);
    ctor.load_arg(1);
    ctor.object_set_key(x);
    ctor.load_literal(Value::Undefined);
    ctor.return_();
    let ctor = b.function(ctor);
    let prototype = b.rom_object(Value::Null.into(), &[(greet, Value::Int(5).into())]);
    let statics = b.rom_object(Value::Null.into(), &[(prototype_key, prototype)]);
    let class = b.rom_class(ctor, statics);

    let mut main = FunctionBuilder::new();
    main.load_literal(class);
    main.load_arg(1);
    main.new_object_of(1);
    main.return_();
    let main = b.function(main);
    b.export(1, main);
    b.export(2, x);
    b.export(3, greet);
    let image = b.build();

    let mut vm = Vm::restore(&image, |_| None).unwrap();
    let main = vm.resolve_export(1).unwrap();
    let x = vm.resolve_export(2).unwrap();
    let greet = vm.resolve_export(3).unwrap();
    let object = vm.call(main, &[Value::Int(9)]).unwrap();
    assert_eq!(vm.get_property(object, x).unwrap(), Value::Int(9));
    assert_eq!(vm.get_property(object, greet).unwrap(), Value::Int(5));
    assert!(vm.stack.is_empty());
}

#[test]
fn computed_keys_are_interned() {
    // o = {}; o["na" + "me"] = 1; o["zz" + "top"] = 2;
    // return o.name + o["zz" + "top"]
    let mut b = ImageBuilder::new();
    let na = b.string("na");
    let me = b.string("me");
    let name = b.string("name");
    let zz = b.string("zz");
    let top = b.string("top");

    let mut f = FunctionBuilder::new();
    f.object_new();
    for (left, right, value) in [(na, me, 1), (zz, top, 2)] {
        f.load_var(0);
        f.load_literal(left);
        f.load_literal(right);
        f.add();
        f.load_int(value);
        f.object_set();
    }
    f.load_var(0);
    f.object_get_key(name);
    f.load_var(0);
    f.load_literal(zz);
    f.load_literal(top);
    f.add();
    f.object_get();
    f.add();
    f.return_();
    let function = b.function(f);
    b.export(1, function);
    let image = b.build();

    let mut vm = Vm::restore(&image, |_| None).unwrap();
    let function = vm.resolve_export(1).unwrap();
    assert_eq!(vm.call(function, &[]).unwrap(), Value::Int(3));
    // A second run after a collection reuses the rebuilt intern list.
    vm.collect_garbage(true);
    assert_eq!(vm.call(function, &[]).unwrap(), Value::Int(3));
}

// ── async ──────────────────────────────────────────────────────────

/// Promise held across calls that may collect.
fn promise_outcome(vm: &Vm<'_>, promise: &Handle) -> (PromiseState, Value) {
    let value = vm.handle_value(promise).unwrap();
    vm.promise_state(value).expect("not a promise")
}

#[test]
fn await_of_a_plain_value_resumes_once_through_the_queue() {
    // async (x) => { const y = await x; log(y); return y + 1 }
    let mut b = ImageBuilder::new();
    let log = b.import(1);
    let mut f = FunctionBuilder::new();
    f.async_start(8);
    f.load_arg(1);
    f.await_();
    f.load_literal(Value::Undefined);
    f.load_var(2);
    f.call_host(log, 2);
    f.pop();
    f.load_int(1);
    f.add();
    f.async_return();
    let function = b.function(f);
    b.export(1, function);
    let image = b.build();

    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let log = host(move |_, _, args| {
        assert_eq!(args, &[Value::Int(41)]);
        counter.set(counter.get() + 1);
        Ok(Value::Undefined)
    });
    let mut vm = Vm::restore(&image, |_| Some(log.clone())).unwrap();
    let function = vm.resolve_export(1).unwrap();
    let promise = vm.call(function, &[Value::Int(41)]).unwrap();
    let promise = vm.new_handle(promise);

    assert_eq!(calls.get(), 1);
    assert!(!vm.has_pending_jobs());
    assert_eq!(promise_outcome(&vm, &promise), (PromiseState::Resolved, Value::Int(42)));
    assert!(vm.stack.is_empty());
}

#[test]
fn await_of_a_rejected_promise_throws_into_the_function() {
    // async function fail() { throw "boom" }
    // async function f() { try { await fail(); return "no" } catch (e) { return e } }
    let mut b = ImageBuilder::new();
    let boom = b.string("boom");
    let no = b.string("no");

    let mut fail = FunctionBuilder::new();
    fail.async_start(5);
    fail.load_literal(boom);
    fail.throw();
    let fail = b.function(fail);

    let mut f = FunctionBuilder::new();
    let handler = f.new_label();
    f.async_start(8);
    f.start_try(handler);
    f.load_literal(fail);
    f.load_literal(Value::Undefined);
    f.call(1);
    f.await_();
    f.pop();
    f.load_literal(no);
    f.async_return();
    f.bind(handler);
    f.enter_handler();
    f.async_return();
    let f = b.function(f);
    b.export(1, f);
    b.export(2, fail);
    let image = b.build();

    let mut vm = Vm::restore(&image, |_| None).unwrap();
    let f = vm.resolve_export(1).unwrap();
    let promise = vm.call(f, &[]).unwrap();
    let promise = vm.new_handle(promise);
    let (state, value) = promise_outcome(&vm, &promise);
    assert_eq!(state, PromiseState::Resolved);
    assert_eq!(vm.value_to_string(value), "boom");

    // Called directly, the rejection stays in the returned promise.
    let fail = vm.resolve_export(2).unwrap();
    let rejected = vm.call(fail, &[]).unwrap();
    let (state, value) = vm.promise_state(rejected).unwrap();
    assert_eq!(state, PromiseState::Rejected);
    assert_eq!(vm.value_to_string(value), "boom");
}

#[test]
fn jobs_run_in_the_order_they_were_queued() {
    // async function tagged(t) { await undefined; log(t) }
    // function main() { tagged(1); tagged(2); tagged(3) }
    let mut b = ImageBuilder::new();
    let log = b.import(1);
    let mut tagged = FunctionBuilder::new();
    tagged.async_start(8);
    tagged.load_arg(1);
    tagged.load_literal(Value::Undefined);
    tagged.await_();
    tagged.pop();
    tagged.load_literal(Value::Undefined);
    tagged.load_var(2);
    tagged.call_host(log, 2);
    tagged.pop();
    tagged.load_literal(Value::Undefined);
    tagged.async_return();
    let tagged = b.function(tagged);

    let mut main = FunctionBuilder::new();
    for tag in 1..=3 {
        main.load_literal(tagged);
        main.load_literal(Value::Undefined);
        main.load_int(tag);
        main.call_void(2);
    }
    main.load_literal(Value::Undefined);
    main.return_();
    let main = b.function(main);
    b.export(1, main);
    let image = b.build();

    let order = Rc::new(RefCell::new(Vec::new()));
    let sink = order.clone();
    let log = host(move |_, _, args| {
        sink.borrow_mut().push(args[0]);
        Ok(Value::Undefined)
    });
    let mut vm = Vm::restore(&image, |_| Some(log.clone())).unwrap();
    let main = vm.resolve_export(1).unwrap();
    assert_eq!(vm.call(main, &[]).unwrap(), Value::Undefined);
    assert_eq!(*order.borrow(), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
}

#[test]
fn host_completes_an_awaited_call_later() {
    // async function f() { return (await delay()) + 1 }
    let mut b = ImageBuilder::new();
    let delay = b.import(5);
    let delay = b.host_function(delay);
    let mut f = FunctionBuilder::new();
    f.async_start(8);
    f.load_literal(delay);
    f.load_literal(Value::Undefined);
    f.await_call(1);
    f.load_int(1);
    f.add();
    f.async_return();
    let f = b.function(f);
    b.export(1, f);
    let image = b.build();

    let pending: Rc<RefCell<Option<Handle>>> = Rc::new(RefCell::new(None));
    let slot = pending.clone();
    let delay = host(move |vm, _, _| {
        let completion = vm.async_start()?;
        *slot.borrow_mut() = Some(vm.new_handle(completion.callback));
        Ok(completion.result)
    });
    let mut vm = Vm::restore(&image, |_| Some(delay.clone())).unwrap();
    let f = vm.resolve_export(1).unwrap();
    let promise = vm.call(f, &[]).unwrap();
    let promise = vm.new_handle(promise);
    assert_eq!(promise_outcome(&vm, &promise).0, PromiseState::Pending);

    vm.collect_garbage(false);
    let callback = pending.borrow_mut().take().expect("delay did not start");
    let callback = vm.release_handle(callback).unwrap();
    vm.call(callback, &[Value::True, Value::Int(7)]).unwrap();
    assert_eq!(promise_outcome(&vm, &promise), (PromiseState::Resolved, Value::Int(8)));
}

#[test]
fn async_call_from_a_host_function_gets_its_own_promise() {
    // async function inner() { return 1 }
    // async function outer() { const r = await reenter(); log(r); return r }
    // where reenter() calls inner() through the host API.
    let mut b = ImageBuilder::new();
    let reenter = b.import(1);
    let reenter = b.host_function(reenter);
    let log = b.import(2);

    let mut inner = FunctionBuilder::new();
    inner.async_start(5);
    inner.load_int(1);
    inner.async_return();
    let inner = b.function(inner);

    let mut outer = FunctionBuilder::new();
    outer.async_start(8);
    outer.load_literal(reenter);
    outer.load_literal(Value::Undefined);
    outer.await_call(1);
    outer.load_literal(Value::Undefined);
    outer.load_var(2);
    outer.call_host(log, 2);
    outer.pop();
    outer.async_return();
    let outer = b.function(outer);
    b.export(1, outer);
    b.export(2, inner);
    let image = b.build();

    let nested = Rc::new(RefCell::new(None));
    let nested_sink = nested.clone();
    let reenter = host(move |vm, _, _| {
        let inner = vm.resolve_export(2)?;
        let promise = vm.call(inner, &[])?;
        *nested_sink.borrow_mut() = Some(vm.promise_state(promise));
        Ok(Value::Int(5))
    });
    let logged = Rc::new(RefCell::new(Vec::new()));
    let log_sink = logged.clone();
    let log = host(move |_, _, args| {
        log_sink.borrow_mut().push(args[0]);
        Ok(Value::Undefined)
    });
    let mut vm = Vm::restore(&image, |id| match id {
        1 => Some(reenter.clone()),
        2 => Some(log.clone()),
        _ => None,
    })
    .unwrap();
    let outer = vm.resolve_export(1).unwrap();
    let promise = vm.call(outer, &[]).unwrap();
    let promise = vm.new_handle(promise);

    assert_eq!(
        *nested.borrow(),
        Some(Some((PromiseState::Resolved, Value::Int(1))))
    );
    assert_eq!(*logged.borrow(), vec![Value::Int(5)]);
    assert_eq!(promise_outcome(&vm, &promise), (PromiseState::Resolved, Value::Int(5)));
    assert_eq!(vm.cps_callback, Value::Undefined);
}

#[test]
fn await_of_a_resolved_promise_resumes_once() {
    // async function one() { return 1 }
    // async function f(p) { log(0); const v = await p; log(v); return v + 1 }
    let mut b = ImageBuilder::new();
    let log = b.import(1);

    let mut one = FunctionBuilder::new();
    one.async_start(5);
    one.load_int(1);
    one.async_return();
    let one = b.function(one);

    let mut f = FunctionBuilder::new();
    f.async_start(8);
    f.load_literal(Value::Undefined);
    f.load_int(0);
    f.call_host(log, 2);
    f.pop();
    f.load_arg(1);
    f.await_();
    f.load_literal(Value::Undefined);
    f.load_var(2);
    f.call_host(log, 2);
    f.pop();
    f.load_int(1);
    f.add();
    f.async_return();
    let f = b.function(f);
    b.export(1, f);
    b.export(2, one);
    let image = b.build();

    let logged = Rc::new(RefCell::new(Vec::new()));
    let sink = logged.clone();
    let log = host(move |_, _, args| {
        sink.borrow_mut().push(args[0]);
        Ok(Value::Undefined)
    });
    let mut vm = Vm::restore(&image, |_| Some(log.clone())).unwrap();
    let one = vm.resolve_export(2).unwrap();
    let resolved = vm.call(one, &[]).unwrap();
    assert_eq!(vm.promise_state(resolved), Some((PromiseState::Resolved, Value::Int(1))));

    let f = vm.resolve_export(1).unwrap();
    let promise = vm.call(f, &[resolved]).unwrap();
    let promise = vm.new_handle(promise);
    assert_eq!(*logged.borrow(), vec![Value::Int(0), Value::Int(1)]);
    assert!(!vm.has_pending_jobs());
    assert_eq!(promise_outcome(&vm, &promise), (PromiseState::Resolved, Value::Int(2)));
}

#[test]
fn subscribers_of_a_pending_promise_resume_in_order_when_it_settles() {
    // async function waiter(p, tag) { const v = await p; log(tag, v) }
    // function main() { const p = delay(); waiter(p, 1); waiter(p, 2); return p }
    let mut b = ImageBuilder::new();
    let delay = b.import(1);
    let log = b.import(2);

    let mut waiter = FunctionBuilder::new();
    waiter.async_start(8);
    waiter.load_arg(2);
    waiter.load_arg(1);
    waiter.await_();
    waiter.load_literal(Value::Undefined);
    waiter.load_var(2);
    waiter.load_var(3);
    waiter.call_host(log, 3);
    waiter.pop();
    waiter.load_literal(Value::Undefined);
    waiter.async_return();
    let waiter = b.function(waiter);

    let mut main = FunctionBuilder::new();
    main.load_literal(Value::Undefined);
    main.call_host(delay, 1);
    for tag in 1..=2 {
        main.load_literal(waiter);
        main.load_literal(Value::Undefined);
        main.load_var(0);
        main.load_int(tag);
        main.call_void(3);
    }
    main.return_();
    let main = b.function(main);
    b.export(1, main);
    let image = b.build();

    let pending: Rc<RefCell<Option<Handle>>> = Rc::new(RefCell::new(None));
    let slot = pending.clone();
    let delay = host(move |vm, _, _| {
        let completion = vm.async_start()?;
        *slot.borrow_mut() = Some(vm.new_handle(completion.callback));
        Ok(completion.result)
    });
    let logged = Rc::new(RefCell::new(Vec::new()));
    let sink = logged.clone();
    let log = host(move |_, _, args| {
        sink.borrow_mut().push((args[0], args[1]));
        Ok(Value::Undefined)
    });
    let mut vm = Vm::restore(&image, |id| match id {
        1 => Some(delay.clone()),
        2 => Some(log.clone()),
        _ => None,
    })
    .unwrap();
    let main = vm.resolve_export(1).unwrap();
    let promise = vm.call(main, &[]).unwrap();
    let promise = vm.new_handle(promise);
    assert_eq!(promise_outcome(&vm, &promise).0, PromiseState::Pending);
    assert!(logged.borrow().is_empty());
    assert!(!vm.has_pending_jobs());

    vm.collect_garbage(false);
    let callback = pending.borrow_mut().take().expect("delay did not start");
    let callback = vm.release_handle(callback).unwrap();
    vm.call(callback, &[Value::True, Value::Int(7)]).unwrap();
    assert_eq!(
        *logged.borrow(),
        vec![(Value::Int(1), Value::Int(7)), (Value::Int(2), Value::Int(7))]
    );
    assert_eq!(promise_outcome(&vm, &promise), (PromiseState::Resolved, Value::Int(7)));
    assert!(!vm.has_pending_jobs());
}

// ── host API ───────────────────────────────────────────────────────

#[test]
fn running_out_of_heap_outside_a_call_kills_the_vm() {
    let image = single_export(add_function());
    let info = VmCreateInfo {
        heap: HeapSettings {
            bucket_size: 64,
            max_heap_size: 512,
        },
        ..VmCreateInfo::default()
    };
    let mut vm = Vm::restore_with(&image, info, |_| None).unwrap();
    let add = vm.resolve_export(1).unwrap();

    let mut held = Vec::new();
    let err = loop {
        match vm.new_string("sixteen bytes!!!") {
            Ok(s) => held.push(vm.new_handle(s)),
            Err(err) => break err,
        }
        assert!(held.len() < 100, "heap limit never reached");
    };
    assert!(matches!(err, Error::OutOfMemory));
    assert!(matches!(
        vm.call(add, &[Value::Int(1), Value::Int(2)]),
        Err(Error::Dead)
    ));
    assert!(matches!(vm.new_object(), Err(Error::Dead)));
}

#[test]
fn host_arguments_survive_a_collection_through_handles() {
    let mut b = ImageBuilder::new();
    let inspect = b.import(3);
    let key = b.string("key");
    let mut f = FunctionBuilder::new();
    // Garbage below the object so a collection moves it.
    f.array_new(0);
    f.pop();
    f.object_new();
    f.load_var(0);
    f.load_int(11);
    f.object_set_key(key);
    f.load_literal(Value::Undefined);
    f.load_var(0);
    f.call_host(inspect, 2);
    f.return_();
    let function = b.function(f);
    b.export(1, function);
    b.export(2, key);
    let image = b.build();

    let inspect = host(|vm, _, args| {
        let object = vm.new_handle(args[0]);
        vm.collect_garbage(false);
        let key = vm.resolve_export(2)?;
        let moved = vm.release_handle(object)?;
        assert_ne!(moved, args[0]);
        vm.get_property(moved, key)
    });
    let mut vm = Vm::restore(&image, |_| Some(inspect.clone())).unwrap();
    let function = vm.resolve_export(1).unwrap();
    assert_eq!(vm.call(function, &[]).unwrap(), Value::Int(11));
}
