//! Integration test suite for the interpreter core
//!
//! This crate holds cross-component scenarios and the small programs they
//! share. Programs are assembled with [`TemplateBuilder`]; host functions
//! stand in for the primitives a front end would provide.

use std::sync::Arc;

use bytecode_system::{CallSite, ClosureTemplate, Opcode, TemplateBuilder};
use core_types::{kinds, Value};

/// Re-export components for test convenience
pub mod components {
    pub use async_runtime;
    pub use bytecode_system;
    pub use core_types;
    pub use interpreter;
    pub use memory_manager;
}

/// Host functions used by the sample programs
pub mod natives {
    use super::*;

    fn int_args(name: &str, args: &[Value]) -> Result<Vec<i64>, Value> {
        args.iter()
            .map(|arg| {
                arg.as_int().ok_or_else(|| {
                    Value::error(
                        kinds::TYPE_ERROR,
                        format!("{} expects ints, got {}", name, arg.type_tag()),
                    )
                })
            })
            .collect()
    }

    fn int_op(name: &'static str, op: fn(&[i64]) -> i64) -> Value {
        Value::native(name, move |args| match int_args(name, args) {
            Ok(ints) => Value::Int(op(&ints)),
            Err(error) => error,
        })
    }

    /// a + b
    pub fn add() -> Value {
        int_op("add", |n| n[0] + n[1])
    }

    /// n + 1
    pub fn inc() -> Value {
        int_op("inc", |n| n[0] + 1)
    }

    /// n - 1
    pub fn dec() -> Value {
        int_op("dec", |n| n[0] - 1)
    }

    /// true when a <= b, nil otherwise
    pub fn le() -> Value {
        Value::native("le", |args| match int_args("le", args) {
            Ok(n) if n[0] <= n[1] => Value::Bool(true),
            Ok(_) => Value::Nil,
            Err(error) => error,
        })
    }

    /// true when n is zero, nil otherwise
    pub fn is_zero() -> Value {
        Value::native("zero?", |args| match args[0] {
            Value::Int(0) => Value::Bool(true),
            _ => Value::Nil,
        })
    }

    /// A new tuple with `value` appended
    pub fn append() -> Value {
        Value::native("append", |args| {
            let mut items = args[0].as_tuple().map(<[Value]>::to_vec).unwrap_or_default();
            items.push(args[1].clone());
            Value::tuple(items)
        })
    }
}

/// fib(n, a, b): tail-recursive Fibonacci; fib(n, 0, 1) is the n-th number
pub fn fib_tail() -> Arc<ClosureTemplate> {
    let mut b = TemplateBuilder::new("fib", "fib.src").params(3).locals(3);
    let recurse = b.label();
    b.line(1)
        .emit(Opcode::Const(natives::is_zero()))
        .emit(Opcode::LoadLocal(0))
        .emit(Opcode::Call(1))
        .jump_if_nil(recurse);
    b.line(2).emit(Opcode::LoadLocal(1)).emit(Opcode::Return);
    b.place(recurse);
    b.line(3)
        .emit(Opcode::LoadSelf)
        .emit(Opcode::Const(natives::dec()))
        .emit(Opcode::LoadLocal(0))
        .emit(Opcode::Call(1))
        .emit(Opcode::LoadLocal(2))
        .emit(Opcode::Const(natives::add()))
        .emit(Opcode::LoadLocal(1))
        .emit(Opcode::LoadLocal(2))
        .emit(Opcode::Call(2))
        .emit(Opcode::TailCall(3));
    b.build().expect("fib verifies")
}

/// counting(n) over 1..=n.
///
/// With `suspend` the loop yields each number; without it the loop
/// collects them into a tuple and returns it.
pub fn counting(suspend: bool) -> Arc<ClosureTemplate> {
    let mut b = TemplateBuilder::new("counting", "counting.src")
        .params(1)
        .locals(3);
    let top = b.label();
    let end = b.label();
    b.line(1)
        .emit(Opcode::Const(Value::Int(1)))
        .emit(Opcode::StoreLocal(1))
        .emit(Opcode::Const(Value::tuple(Vec::new())))
        .emit(Opcode::StoreLocal(2));
    b.place(top);
    b.line(2)
        .emit(Opcode::Const(natives::le()))
        .emit(Opcode::LoadLocal(1))
        .emit(Opcode::LoadLocal(0))
        .emit(Opcode::Call(2))
        .jump_if_nil(end);
    b.line(3);
    if suspend {
        b.emit(Opcode::LoadLocal(1))
            .emit(Opcode::Suspend)
            .emit(Opcode::Pop);
    } else {
        b.emit(Opcode::Const(natives::append()))
            .emit(Opcode::LoadLocal(2))
            .emit(Opcode::LoadLocal(1))
            .emit(Opcode::Call(2))
            .emit(Opcode::StoreLocal(2));
    }
    b.line(4)
        .emit(Opcode::Const(natives::inc()))
        .emit(Opcode::LoadLocal(1))
        .emit(Opcode::Call(1))
        .emit(Opcode::StoreLocal(1))
        .jump(top);
    b.place(end);
    b.line(5);
    if suspend {
        b.emit(Opcode::Nil);
    } else {
        b.emit(Opcode::LoadLocal(2));
    }
    b.emit(Opcode::Return);
    b.build().expect("counting verifies")
}

/// Calls method `name` on its `argc` parameters
pub fn method_site(name: &str, argc: u32) -> Arc<ClosureTemplate> {
    let mut b = TemplateBuilder::new(format!("call_{}", name), "site.src")
        .params(argc)
        .locals(argc);
    for slot in 0..argc {
        b.emit(Opcode::LoadLocal(slot));
    }
    b.line(1)
        .emit(Opcode::CallMethod(Arc::new(CallSite::new(name, argc))))
        .emit(Opcode::Return);
    b.build().expect("method site verifies")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natives() {
        assert_eq!(natives::add().call(&[Value::Int(2), Value::Int(3)]), Value::Int(5));
        assert_eq!(natives::le().call(&[Value::Int(3), Value::Int(2)]), Value::Nil);
        assert!(natives::inc().call(&[Value::str("x")]).is_error());
        assert_eq!(
            natives::append().call(&[Value::tuple(vec![Value::Int(1)]), Value::Int(2)]),
            Value::tuple(vec![Value::Int(1), Value::Int(2)])
        );
    }
}
