//! Persisted templates
//!
//! Programs are encoded, decoded through the `Vm`, and executed. Host
//! functions have no persistent form, so these programs reach them through
//! globals and methods.

use std::sync::Arc;

use bytecode_system::codec::{self, FORMAT_VERSION};
use bytecode_system::{Capture, ClosureTemplate, DecodeError, EncodeError, Opcode, TemplateBuilder};
use core_types::{TypeTag, Value};
use integration_tests::natives;
use interpreter::{Definition, Vm, VmError};

fn vm_with_primitives() -> Vm {
    let vm = Vm::default();
    vm.define_global("dec", natives::dec());
    vm.define_global("zero?", natives::is_zero());
    vm.define_method("plus", Definition::new(vec![TypeTag::Int, TypeTag::Int], natives::add()));
    vm
}

/// fib(n, a, b) using globals and a method instead of constants
fn portable_fib() -> Arc<ClosureTemplate> {
    let mut b = TemplateBuilder::new("fib", "fib.src").params(3).locals(3);
    b.declare("n", 0, 1).declare("a", 1, 1).declare("b", 2, 1);
    let recurse = b.label();
    b.line(1)
        .emit(Opcode::LoadGlobal("zero?".into()))
        .emit(Opcode::LoadLocal(0))
        .emit(Opcode::Call(1))
        .jump_if_nil(recurse);
    b.line(2).emit(Opcode::LoadLocal(1)).emit(Opcode::Return);
    b.place(recurse);
    b.line(3)
        .emit(Opcode::LoadSelf)
        .emit(Opcode::LoadGlobal("dec".into()))
        .emit(Opcode::LoadLocal(0))
        .emit(Opcode::Call(1))
        .emit(Opcode::LoadLocal(2))
        .emit(Opcode::LoadLocal(1))
        .emit(Opcode::LoadLocal(2))
        .emit(Opcode::CallMethod(Arc::new(bytecode_system::CallSite::new("plus", 2))))
        .emit(Opcode::TailCall(3));
    b.build().unwrap()
}

#[test]
fn test_decoded_program_runs() {
    let vm = vm_with_primitives();
    let bytes = codec::encode(&portable_fib()).unwrap();
    let template = vm.load(&bytes).unwrap();
    assert_eq!(template.local_name(1), Some("a"));

    let fib = vm.instantiate(&template).unwrap();
    let result = vm
        .call(&fib, vec![Value::Int(20), Value::Int(0), Value::Int(1)])
        .unwrap();
    assert_eq!(result, Value::Int(6765));
}

#[test]
fn test_nested_templates_survive() {
    let vm = Vm::default();
    let mut adder = TemplateBuilder::new("adder", "nest.src").params(1).locals(1);
    let captured = adder.capture(Capture::Local(0));
    adder
        .emit(Opcode::LoadUpvalue(captured))
        .emit(Opcode::LoadLocal(0))
        .emit(Opcode::BuildTuple(2))
        .emit(Opcode::Return);
    let adder = adder.build().unwrap();

    let mut make = TemplateBuilder::new("make", "nest.src").params(1).locals(1);
    make.emit(Opcode::MakeClosure(Arc::clone(&adder)))
        .emit(Opcode::Return);
    let original = make.build().unwrap();

    let decoded = vm.load(&codec::encode(&original).unwrap()).unwrap();
    assert!(decoded.same_structure(&original));
    assert_eq!(decoded.digest(), original.digest());

    let make = vm.instantiate(&decoded).unwrap();
    let closure = vm.call(&make, vec![Value::str("left")]).unwrap();
    let pair = vm.call(&closure, vec![Value::str("right")]).unwrap();
    assert_eq!(pair, Value::tuple(vec![Value::str("left"), Value::str("right")]));
}

#[test]
fn test_version_mismatch_is_rejected() {
    let vm = Vm::default();
    let mut bytes = codec::encode(&portable_fib()).unwrap();
    // The version varint follows the four magic bytes.
    bytes[4] = (FORMAT_VERSION + 1) as u8;
    match vm.load(&bytes) {
        Err(VmError::Decode(DecodeError::VersionMismatch { found, expected })) => {
            assert_eq!(found, FORMAT_VERSION + 1);
            assert_eq!(expected, FORMAT_VERSION);
        }
        other => panic!("expected a version mismatch, got {:?}", other),
    }
}

#[test]
fn test_truncated_input_is_rejected() {
    let vm = Vm::default();
    let bytes = codec::encode(&portable_fib()).unwrap();
    for len in [0, 3, 5, bytes.len() / 2, bytes.len() - 1] {
        assert!(
            matches!(vm.load(&bytes[..len]), Err(VmError::Decode(_))),
            "prefix of {} bytes",
            len
        );
    }
}

#[test]
fn test_host_functions_are_not_encodable() {
    let mut b = TemplateBuilder::new("host", "host.src");
    b.emit(Opcode::Const(natives::inc())).emit(Opcode::Return);
    let template = b.build().unwrap();
    assert!(matches!(
        codec::encode(&template),
        Err(EncodeError::UnencodableConstant { .. })
    ));
}
