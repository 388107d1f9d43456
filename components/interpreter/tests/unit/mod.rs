//! Unit tests for interpreter components

use std::sync::Arc;

use bytecode_system::{Capture, ClosureTemplate, Opcode, TemplateBuilder};
use core_types::{kinds, TypeTag, Value};
use interpreter::{
    BitSet, Closure, Debugger, Definition, ExecutionContext, Fiber, Frame, Generator,
    GeneratorState, MethodScope, RuntimeConfig, Vm, VmError,
};
use parking_lot::Mutex;

fn add() -> Value {
    Value::native("add", |args| match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => Value::Int(a + b),
        (Value::Real(a), Value::Real(b)) => Value::Real(a + b),
        _ => Value::error(kinds::TYPE_ERROR, "add expects numbers"),
    })
}

fn dec() -> Value {
    Value::native("dec", |args| match args[0] {
        Value::Int(n) => Value::Int(n - 1),
        _ => Value::error(kinds::TYPE_ERROR, "dec expects an int"),
    })
}

// Nil unless the argument is zero, so it feeds `JumpIfNil` directly.
fn is_zero() -> Value {
    Value::native("zero?", |args| match args[0] {
        Value::Int(0) => Value::Bool(true),
        _ => Value::Nil,
    })
}

fn echo() -> Value {
    Value::native("echo", |args| Value::tuple(args.to_vec()))
}

/// fib(n, a, b) with a tail call per step
fn fib_template() -> Arc<ClosureTemplate> {
    let mut b = TemplateBuilder::new("fib", "fib.src").params(3).locals(3);
    let recurse = b.label();
    b.line(1)
        .emit(Opcode::Const(is_zero()))
        .emit(Opcode::LoadLocal(0))
        .emit(Opcode::Call(1))
        .jump_if_nil(recurse);
    b.line(2).emit(Opcode::LoadLocal(1)).emit(Opcode::Return);
    b.place(recurse);
    b.line(3)
        .emit(Opcode::LoadSelf)
        .emit(Opcode::Const(dec()))
        .emit(Opcode::LoadLocal(0))
        .emit(Opcode::Call(1))
        .emit(Opcode::LoadLocal(2))
        .emit(Opcode::Const(add()))
        .emit(Opcode::LoadLocal(1))
        .emit(Opcode::LoadLocal(2))
        .emit(Opcode::Call(2))
        .emit(Opcode::TailCall(3));
    b.build().unwrap()
}

/// Yields each constant in turn, then returns
fn generator_template(values: &[i64]) -> Arc<ClosureTemplate> {
    let mut b = TemplateBuilder::new("gen", "gen.src");
    for (line, value) in values.iter().enumerate() {
        b.line(line as u32 + 1)
            .emit(Opcode::Const(Value::Int(*value)))
            .emit(Opcode::Suspend)
            .emit(Opcode::Pop);
    }
    b.emit(Opcode::Nil).emit(Opcode::Return);
    b.build().unwrap()
}

fn closure(template: Arc<ClosureTemplate>) -> Value {
    Closure::new(template, Vec::new()).value()
}

fn call(ctx: &ExecutionContext, callee: &Value, args: Vec<Value>) -> Value {
    Fiber::call(callee.clone(), args).run_to_completion(ctx, Value::Nil)
}

// ============================================================================
// Frame Tests
// ============================================================================

#[test]
fn test_frame_enter_binds_params_and_locals() {
    let ctx = ExecutionContext::default();
    let mut b = TemplateBuilder::new("f", "f.src").params(2).locals(4);
    b.emit(Opcode::Nil).emit(Opcode::Return);
    let f = Closure::new(b.build().unwrap(), Vec::new());

    let frame = Frame::enter(f, vec![Value::Int(1), Value::Int(2)], &ctx).unwrap();
    assert_eq!(frame.local(0), Value::Int(1));
    assert_eq!(frame.local(1), Value::Int(2));
    assert_eq!(frame.local(3), Value::Nil);
    assert_eq!(frame.depth(), 0);
    assert!(frame.is_pooled());
    assert!(!frame.is_suspended());
}

#[test]
fn test_frame_returns_buffer_on_drop() {
    let ctx = ExecutionContext::default();
    let before = ctx.pool().stats();
    let mut b = TemplateBuilder::new("f", "f.src");
    b.emit(Opcode::Nil).emit(Opcode::Return);
    let f = Closure::new(b.build().unwrap(), Vec::new());

    let frame = Frame::enter(f, Vec::new(), &ctx).unwrap();
    assert_eq!(ctx.pool().stats().in_use, before.in_use + 1);
    drop(frame);
    assert_eq!(ctx.pool().stats().available, before.available);
}

#[test]
fn test_oversized_frame_falls_back() {
    let config = RuntimeConfig {
        frame_size_class: 2,
        ..RuntimeConfig::default()
    };
    let ctx = ExecutionContext::new(config);
    let mut b = TemplateBuilder::new("big", "big.src").locals(8);
    b.emit(Opcode::Nil).emit(Opcode::Return);
    let f = Closure::new(b.build().unwrap(), Vec::new());

    let frame = Frame::enter(f, Vec::new(), &ctx).unwrap();
    assert!(!frame.is_pooled());
    assert_eq!(ctx.pool().stats().fallbacks, 1);
}

#[test]
fn test_arity_mismatch() {
    let ctx = ExecutionContext::default();
    let mut b = TemplateBuilder::new("two", "two.src").params(2).locals(2);
    b.emit(Opcode::Nil).emit(Opcode::Return);
    let f = Closure::new(b.build().unwrap(), Vec::new());
    let err = Frame::enter(f, vec![Value::Int(1)], &ctx).unwrap_err();
    let err = err.as_error().unwrap();
    assert_eq!(err.kind(), kinds::ARITY_ERROR);
    assert!(err.message().contains("expects 2"));
}

#[test]
fn test_variadic_rest_tuple() {
    let ctx = ExecutionContext::default();
    let mut b = TemplateBuilder::new("rest", "rest.src")
        .params(1)
        .variadic(true)
        .locals(2);
    b.emit(Opcode::LoadLocal(1)).emit(Opcode::Return);
    let f = closure(b.build().unwrap());

    let result = call(&ctx, &f, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert_eq!(result, Value::tuple(vec![Value::Int(2), Value::Int(3)]));
    let empty = call(&ctx, &f, vec![Value::Int(1)]);
    assert_eq!(empty, Value::tuple(Vec::new()));
}

// ============================================================================
// Call Tests
// ============================================================================

#[test]
fn test_fixed_and_generic_call_paths_agree() {
    let ctx = ExecutionContext::default();
    for argc in 0..=12u32 {
        let mut b = TemplateBuilder::new("caller", "caller.src");
        b.emit(Opcode::Const(echo()));
        for i in 0..argc {
            b.emit(Opcode::Const(Value::Int(i as i64)));
        }
        b.emit(Opcode::Call(argc)).emit(Opcode::Return);
        let f = closure(b.build().unwrap());

        let expected: Vec<Value> = (0..argc as i64).map(Value::Int).collect();
        assert_eq!(call(&ctx, &f, Vec::new()), Value::tuple(expected), "argc {}", argc);
    }
}

#[test]
fn test_closure_calls_with_many_arguments() {
    let ctx = ExecutionContext::default();
    let mut callee = TemplateBuilder::new("last", "last.src").params(11).locals(11);
    callee.emit(Opcode::LoadLocal(10)).emit(Opcode::Return);
    let callee = closure(callee.build().unwrap());

    let mut b = TemplateBuilder::new("caller", "caller.src");
    b.emit(Opcode::Const(callee));
    for i in 0..11 {
        b.emit(Opcode::Const(Value::Int(i)));
    }
    b.emit(Opcode::Call(11)).emit(Opcode::Return);
    assert_eq!(call(&ctx, &closure(b.build().unwrap()), Vec::new()), Value::Int(10));
}

#[test]
fn test_tail_recursion_reuses_frame() {
    let ctx = ExecutionContext::default();
    let before = ctx.pool().stats();
    let fib = closure(fib_template());
    let result = call(&ctx, &fib, vec![Value::Int(30), Value::Int(0), Value::Int(1)]);
    assert_eq!(result, Value::Int(832_040));

    let after = ctx.pool().stats();
    assert_eq!(after.available, before.available);
    assert_eq!(after.in_use, 0);
    assert_eq!(after.fallbacks, 0);
}

#[test]
fn test_native_tail_call_returns_result() {
    let ctx = ExecutionContext::default();
    let mut b = TemplateBuilder::new("t", "t.src");
    b.emit(Opcode::Const(dec()))
        .emit(Opcode::Const(Value::Int(5)))
        .emit(Opcode::TailCall(1));
    assert_eq!(call(&ctx, &closure(b.build().unwrap()), Vec::new()), Value::Int(4));
}

#[test]
fn test_calling_a_non_callable_is_type_error() {
    let ctx = ExecutionContext::default();
    let mut b = TemplateBuilder::new("t", "t.src");
    b.emit(Opcode::Const(Value::Int(3))).emit(Opcode::Call(0)).emit(Opcode::Return);
    let result = call(&ctx, &closure(b.build().unwrap()), Vec::new());
    assert_eq!(result.as_error().unwrap().kind(), kinds::TYPE_ERROR);
}

// ============================================================================
// Closure Tests
// ============================================================================

#[test]
fn test_forward_reference_bound_after_capture() {
    let ctx = ExecutionContext::default();

    let mut inner = TemplateBuilder::new("inner", "fwd.src");
    inner.capture(Capture::Local(0));
    inner.emit(Opcode::LoadUpvalue(1)).emit(Opcode::Return);
    let inner = inner.build().unwrap();

    let mut outer = TemplateBuilder::new("outer", "fwd.src").locals(2);
    outer
        .emit(Opcode::DeclareForward(0))
        .emit(Opcode::MakeClosure(inner))
        .emit(Opcode::StoreLocal(1))
        .emit(Opcode::Const(Value::Int(42)))
        .emit(Opcode::Bind(0))
        .emit(Opcode::LoadLocal(1))
        .emit(Opcode::Call(0))
        .emit(Opcode::Return);

    assert_eq!(call(&ctx, &closure(outer.build().unwrap()), Vec::new()), Value::Int(42));
}

#[test]
fn test_unbound_forward_is_unbound_error() {
    let ctx = ExecutionContext::default();

    let mut inner = TemplateBuilder::new("inner", "fwd.src");
    inner.capture(Capture::Local(0));
    inner.emit(Opcode::LoadUpvalue(1)).emit(Opcode::Return);
    let inner = inner.build().unwrap();

    let mut outer = TemplateBuilder::new("outer", "fwd.src").locals(1);
    outer
        .emit(Opcode::DeclareForward(0))
        .emit(Opcode::MakeClosure(inner))
        .emit(Opcode::Call(0))
        .emit(Opcode::Return);

    let result = call(&ctx, &closure(outer.build().unwrap()), Vec::new());
    let error = result.as_error().unwrap();
    assert_eq!(error.kind(), kinds::UNBOUND_ERROR);
    // One entry for the reading frame, one for its caller.
    assert_eq!(error.trace_len(), 2);
}

#[test]
fn test_capture_after_bind_is_eager() {
    let ctx = ExecutionContext::default();

    let mut inner = TemplateBuilder::new("inner", "eager.src");
    inner.capture(Capture::Local(0));
    inner.emit(Opcode::Nil).emit(Opcode::Return);
    let inner = inner.build().unwrap();

    let mut outer = TemplateBuilder::new("outer", "eager.src").locals(1);
    outer
        .emit(Opcode::DeclareForward(0))
        .emit(Opcode::Const(Value::Int(7)))
        .emit(Opcode::Bind(0))
        .emit(Opcode::MakeClosure(inner))
        .emit(Opcode::Return);

    let made = call(&ctx, &closure(outer.build().unwrap()), Vec::new());
    let made = made.downcast_arc::<Closure>().unwrap();
    assert_eq!(made.raw_upvalue(1), Value::Int(7));
}

#[test]
fn test_double_bind_is_type_error() {
    let ctx = ExecutionContext::default();
    let mut b = TemplateBuilder::new("twice", "twice.src").locals(2);
    b.emit(Opcode::DeclareForward(0))
        .emit(Opcode::LoadLocal(0))
        .emit(Opcode::StoreLocal(1))
        .emit(Opcode::Const(Value::Int(1)))
        .emit(Opcode::Bind(0))
        // Rebinding through the original placeholder fails.
        .emit(Opcode::LoadLocal(1))
        .emit(Opcode::StoreLocal(0))
        .emit(Opcode::Const(Value::Int(2)))
        .emit(Opcode::Bind(0))
        .emit(Opcode::Nil)
        .emit(Opcode::Return);
    let result = call(&ctx, &closure(b.build().unwrap()), Vec::new());
    assert_eq!(result.as_error().unwrap().kind(), kinds::TYPE_ERROR);
}

// ============================================================================
// Error Handling Tests
// ============================================================================

fn raise_and_catch(payload: Value) -> Arc<ClosureTemplate> {
    let mut b = TemplateBuilder::new("guarded", "guarded.src");
    let handler = b.label();
    b.line(1).try_to(handler);
    b.line(2).emit(Opcode::Const(payload)).emit(Opcode::Raise);
    b.place(handler);
    b.line(3).emit(Opcode::Catch).emit(Opcode::Return);
    b.build().unwrap()
}

#[test]
fn test_catch_at_same_depth() {
    let ctx = ExecutionContext::default();
    let range = Value::error("RangeError", "index out of range");
    let result = call(&ctx, &closure(raise_and_catch(range)), Vec::new());

    let Value::Exception(error) = result else {
        panic!("expected a caught exception, got {:?}", result);
    };
    assert_eq!(error.kind(), "RangeError");
    let trace: Vec<_> = error.trace().collect();
    assert_eq!(trace.len(), 1);
    assert_eq!(&*trace[0].source, "guarded.src");
    assert_eq!(trace[0].line, 2);
}

#[test]
fn test_raised_payload_is_wrapped() {
    let ctx = ExecutionContext::default();
    let result = call(&ctx, &closure(raise_and_catch(Value::Int(99))), Vec::new());
    let error = result.as_error().unwrap();
    assert_eq!(error.kind(), kinds::RAISED);
    assert_eq!(error.payload(), &Value::Int(99));
}

#[test]
fn test_rethrow_preserves_trace() {
    let ctx = ExecutionContext::default();

    // Raises from its own frame.
    let mut thrower = TemplateBuilder::new("thrower", "thrower.src");
    thrower
        .line(10)
        .emit(Opcode::Const(Value::str("boom")))
        .emit(Opcode::Raise);
    let thrower = closure(thrower.build().unwrap());

    // Catches, then raises the same error again.
    let mut b = TemplateBuilder::new("relay", "relay.src");
    let handler = b.label();
    b.line(20).try_to(handler);
    b.line(21).emit(Opcode::Const(thrower)).emit(Opcode::Call(0)).emit(Opcode::Return);
    b.place(handler);
    b.line(22).emit(Opcode::Catch).emit(Opcode::Raise);

    let result = call(&ctx, &closure(b.build().unwrap()), Vec::new());
    let error = result.as_error().unwrap();
    let lines: Vec<u32> = error.trace().map(|entry| entry.line).collect();
    assert_eq!(lines, vec![10, 21]);
}

#[test]
fn test_retry_signals_current_handler() {
    let ctx = ExecutionContext::default();
    let mut b = TemplateBuilder::new("retry", "retry.src");
    let first = b.label();
    let second = b.label();
    b.try_to(first)
        .emit(Opcode::Const(Value::str("x")))
        .emit(Opcode::Raise);
    b.place(first);
    b.emit(Opcode::Catch).try_to(second).emit(Opcode::Retry);
    b.place(second);
    b.emit(Opcode::Catch).emit(Opcode::Return);

    let result = call(&ctx, &closure(b.build().unwrap()), Vec::new());
    let error = result.as_error().unwrap();
    assert!(matches!(result, Value::Exception(_)));
    assert_eq!(error.payload(), &Value::str("x"));
    assert_eq!(error.trace_len(), 1);
}

#[test]
fn test_end_try_removes_handler() {
    let ctx = ExecutionContext::default();
    let mut b = TemplateBuilder::new("scoped", "scoped.src");
    let handler = b.label();
    b.try_to(handler)
        .emit(Opcode::EndTry)
        .emit(Opcode::Const(Value::str("late")))
        .emit(Opcode::Raise);
    b.place(handler);
    b.emit(Opcode::Catch).emit(Opcode::Return);

    let result = call(&ctx, &closure(b.build().unwrap()), Vec::new());
    assert!(result.is_error(), "the handler was removed before the raise");
}

#[test]
fn test_trace_depth_follows_config() {
    let config = RuntimeConfig {
        max_trace_depth: 2,
        ..RuntimeConfig::default()
    };
    let ctx = ExecutionContext::new(config);

    let mut leaf = TemplateBuilder::new("leaf", "deep.src");
    leaf.emit(Opcode::Const(Value::Int(0))).emit(Opcode::Raise);
    let mut callee = closure(leaf.build().unwrap());
    for depth in 0..4 {
        let mut b = TemplateBuilder::new(format!("level{}", depth), "deep.src");
        b.emit(Opcode::Const(callee)).emit(Opcode::Call(0)).emit(Opcode::Return);
        callee = closure(b.build().unwrap());
    }

    let result = call(&ctx, &callee, Vec::new());
    assert_eq!(result.as_error().unwrap().trace_len(), 2);
}

// ============================================================================
// Generator Tests
// ============================================================================

#[test]
fn test_generator_yields_then_ends() {
    let vm = Vm::default();
    let gen = vm.instantiate(&generator_template(&[1, 2, 3])).unwrap();
    let generator = vm.call(&gen, Vec::new()).unwrap();

    let handle = generator.downcast_arc::<Generator>().unwrap();
    assert_eq!(handle.state(), GeneratorState::Suspended);
    assert_eq!(handle.current(), Value::Int(1));

    assert_eq!(
        vm.collect(&generator).unwrap(),
        vec![Value::Int(1), Value::Int(2), Value::Int(3)]
    );
    assert!(handle.is_done());
    assert_eq!(vm.next(&generator).unwrap(), Value::Nil);
}

#[test]
fn test_generator_keys_count_yields() {
    let vm = Vm::default();
    let gen = vm.instantiate(&generator_template(&[5, 6])).unwrap();
    let generator = vm.call(&gen, Vec::new()).unwrap();
    let handle = generator.downcast_arc::<Generator>().unwrap();
    assert_eq!(handle.key(), 0);
    vm.next(&generator).unwrap();
    assert_eq!(handle.key(), 1);
    assert_eq!(handle.current(), Value::Int(6));
}

#[test]
fn test_generator_driven_from_bytecode() {
    let ctx = ExecutionContext::default();
    let producer = closure(generator_template(&[1, 2, 3, 4]));

    let mut b = TemplateBuilder::new("sum", "sum.src").locals(2);
    let top = b.label();
    let done = b.label();
    b.emit(Opcode::Const(Value::Int(0)))
        .emit(Opcode::StoreLocal(0))
        .emit(Opcode::Const(producer))
        .emit(Opcode::Call(0))
        .emit(Opcode::Iterate)
        .emit(Opcode::StoreLocal(1));
    b.place(top);
    b.emit(Opcode::LoadLocal(1)).jump_if_nil(done);
    b.emit(Opcode::Const(add()))
        .emit(Opcode::LoadLocal(0))
        .emit(Opcode::LoadLocal(1))
        .emit(Opcode::IterValue)
        .emit(Opcode::Call(2))
        .emit(Opcode::StoreLocal(0))
        .emit(Opcode::LoadLocal(1))
        .emit(Opcode::IterNext)
        .emit(Opcode::StoreLocal(1))
        .jump(top);
    b.place(done);
    b.emit(Opcode::LoadLocal(0)).emit(Opcode::Return);

    assert_eq!(call(&ctx, &closure(b.build().unwrap()), Vec::new()), Value::Int(10));
    assert_eq!(ctx.pool().stats().in_use, 0);
}

#[test]
fn test_resume_value_is_delivered() {
    let ctx = ExecutionContext::default();
    // Yields 0, then yields whatever it was resumed with, doubled into a tuple.
    let mut b = TemplateBuilder::new("echo", "echo.src");
    b.emit(Opcode::Const(Value::Int(0)))
        .emit(Opcode::Suspend)
        .emit(Opcode::Dup)
        .emit(Opcode::BuildTuple(2))
        .emit(Opcode::Suspend)
        .emit(Opcode::Return);
    let generator = call(&ctx, &closure(b.build().unwrap()), Vec::new());
    let handle = generator.downcast_arc::<Generator>().unwrap();

    let again = Fiber::resume(Arc::clone(&handle)).run_to_completion(&ctx, Value::str("hi"));
    assert_eq!(again, generator);
    assert_eq!(
        handle.current(),
        Value::tuple(vec![Value::str("hi"), Value::str("hi")])
    );
}

#[test]
fn test_generator_error_finishes_it() {
    let vm = Vm::default();
    let mut b = TemplateBuilder::new("fails", "fails.src");
    b.emit(Opcode::Const(Value::Int(1)))
        .emit(Opcode::Suspend)
        .emit(Opcode::Raise);
    let gen = vm.instantiate(&b.build().unwrap()).unwrap();
    let generator = vm.call(&gen, Vec::new()).unwrap();

    let err = vm.next(&generator).unwrap_err();
    assert!(matches!(err, VmError::Uncaught(_)));
    assert!(generator.downcast_arc::<Generator>().unwrap().is_done());
}

#[test]
fn test_generator_frame_is_promoted() {
    let ctx = ExecutionContext::default();
    let before = ctx.pool().stats();
    let generator = call(&ctx, &closure(generator_template(&[1])), Vec::new());
    let after = ctx.pool().stats();
    assert_eq!(after.promotions, before.promotions + 1);
    assert_eq!(after.available, before.available);
    drop(generator);
    assert_eq!(ctx.pool().stats().available, before.available);
}

// ============================================================================
// Iteration Tests
// ============================================================================

#[test]
fn test_iterate_tuple_keys_and_values() {
    let ctx = ExecutionContext::default();
    let mut b = TemplateBuilder::new("pairs", "pairs.src").locals(1);
    b.emit(Opcode::Const(Value::tuple(vec![Value::str("a"), Value::str("b")])))
        .emit(Opcode::Iterate)
        .emit(Opcode::IterNext)
        .emit(Opcode::StoreLocal(0))
        .emit(Opcode::LoadLocal(0))
        .emit(Opcode::IterKey)
        .emit(Opcode::LoadLocal(0))
        .emit(Opcode::IterValue)
        .emit(Opcode::BuildTuple(2))
        .emit(Opcode::Return);
    assert_eq!(
        call(&ctx, &closure(b.build().unwrap()), Vec::new()),
        Value::tuple(vec![Value::Int(1), Value::str("b")])
    );
}

#[test]
fn test_iterate_non_iterable_signals() {
    let ctx = ExecutionContext::default();
    let mut b = TemplateBuilder::new("bad", "bad.src");
    b.emit(Opcode::Const(Value::Bool(true)))
        .emit(Opcode::Iterate)
        .emit(Opcode::Return);
    let result = call(&ctx, &closure(b.build().unwrap()), Vec::new());
    assert_eq!(result.as_error().unwrap().kind(), kinds::TYPE_ERROR);
}

// ============================================================================
// Method Dispatch Tests
// ============================================================================

fn method_call(name: &str, args: Vec<Value>) -> Arc<ClosureTemplate> {
    let argc = args.len() as u32;
    let mut b = TemplateBuilder::new("site", "site.src");
    for arg in args {
        b.emit(Opcode::Const(arg));
    }
    b.emit(Opcode::CallMethod(Arc::new(bytecode_system::CallSite::new(name, argc))))
        .emit(Opcode::Return);
    b.build().unwrap()
}

#[test]
fn test_method_selects_by_argument_types() {
    let vm = Vm::default();
    vm.define_method(
        "add",
        Definition::new(vec![TypeTag::Int, TypeTag::Int], Value::native("int", |_| Value::str("int"))),
    );
    vm.define_method(
        "add",
        Definition::new(vec![TypeTag::Real, TypeTag::Real], Value::native("real", |_| Value::str("real"))),
    );

    let ints = vm.instantiate(&method_call("add", vec![Value::Int(1), Value::Int(2)])).unwrap();
    let reals = vm
        .instantiate(&method_call("add", vec![Value::Real(1.0), Value::Real(2.0)]))
        .unwrap();
    assert_eq!(vm.call(&ints, Vec::new()).unwrap(), Value::str("int"));
    assert_eq!(vm.call(&reals, Vec::new()).unwrap(), Value::str("real"));
}

#[test]
fn test_method_callback_may_be_closure() {
    let vm = Vm::default();
    let mut body = TemplateBuilder::new("swap", "swap.src").params(2).locals(2);
    body.emit(Opcode::LoadLocal(1))
        .emit(Opcode::LoadLocal(0))
        .emit(Opcode::BuildTuple(2))
        .emit(Opcode::Return);
    let body = vm.instantiate(&body.build().unwrap()).unwrap();
    vm.define_method("swap", Definition::new(vec![TypeTag::Any, TypeTag::Any], body));

    let site = vm
        .instantiate(&method_call("swap", vec![Value::Int(1), Value::str("b")]))
        .unwrap();
    assert_eq!(
        vm.call(&site, Vec::new()).unwrap(),
        Value::tuple(vec![Value::str("b"), Value::Int(1)])
    );
}

#[test]
fn test_no_method_error_lists_types() {
    let vm = Vm::default();
    vm.define_method("neg", Definition::new(vec![TypeTag::Int], dec()));
    let site = vm.instantiate(&method_call("neg", vec![Value::str("x")])).unwrap();
    let err = vm.call(&site, Vec::new()).unwrap_err();
    let error = err.error_value().unwrap();
    assert_eq!(error.kind(), kinds::NO_METHOD_ERROR);
    assert!(error.message().contains("(str)"), "{}", error.message());
}

#[test]
fn test_variadic_definition() {
    let scope = MethodScope::new();
    scope.define("log", Definition::new(vec![TypeTag::Str], echo()).variadic());
    let args = [Value::str("fmt"), Value::Int(1), Value::Nil];
    let definition = scope.lookup("log", &args, None, 4).unwrap();
    assert!(definition.is_variadic());
    assert!(scope.lookup("log", &[Value::Int(1)], None, 4).is_err());
}

// ============================================================================
// Debugger Tests
// ============================================================================

#[derive(Default)]
struct Recorder {
    lines: Mutex<Vec<u32>>,
    breakpoints: Vec<usize>,
}

impl Debugger for Recorder {
    fn run(&self, frame: &Frame, _value: &Value) {
        self.lines.lock().push(frame.line());
    }

    fn breakpoints(&self, _source: &str, max_line: u32) -> BitSet {
        let mut set = BitSet::with_len(max_line as usize + 1);
        for line in &self.breakpoints {
            set.insert(*line);
        }
        set
    }

    fn revision(&self) -> u64 {
        1
    }
}

fn three_lines() -> Arc<ClosureTemplate> {
    let mut b = TemplateBuilder::new("lines", "lines.src");
    b.line(1).emit(Opcode::Const(Value::Int(1))).emit(Opcode::Pop);
    b.line(2).emit(Opcode::Const(Value::Int(2))).emit(Opcode::Pop);
    b.line(3).emit(Opcode::Nil).emit(Opcode::Return);
    b.build().unwrap()
}

#[test]
fn test_debugger_runs_on_line_changes() {
    let recorder = Arc::new(Recorder::default());
    let vm = Vm::default().with_debugger(recorder.clone());
    let f = vm.instantiate(&three_lines()).unwrap();
    vm.call(&f, Vec::new()).unwrap();
    assert_eq!(*recorder.lines.lock(), vec![1, 2, 3]);
}

#[test]
fn test_debugger_runs_on_every_breakpoint_instruction() {
    let recorder = Arc::new(Recorder {
        lines: Mutex::new(Vec::new()),
        breakpoints: vec![2],
    });
    let vm = Vm::default().with_debugger(recorder.clone());
    let f = vm.instantiate(&three_lines()).unwrap();
    vm.call(&f, Vec::new()).unwrap();
    assert_eq!(*recorder.lines.lock(), vec![1, 2, 2, 3]);
}
