//! Contract tests for the interpreter API
//!
//! These tests pin down the behavior hosts rely on: configuration,
//! method definition and caching, and the `Vm` facade.

use std::sync::Arc;

use bytecode_system::{codec, CallSite, ClosureTemplate, Opcode, TemplateBuilder};
use core_types::{kinds, TypeTag, Value};
use interpreter::{
    Definition, InlineCache, MethodScope, Preemption, RuntimeConfig, Vm, VmError,
    POLYMORPHIC_WIDTH,
};

fn tagged(label: &'static str) -> Value {
    Value::native(label, move |_| Value::str(label))
}

fn method_site(name: &str, args: Vec<Value>) -> Arc<ClosureTemplate> {
    let argc = args.len() as u32;
    let mut b = TemplateBuilder::new("site", "site.src");
    for arg in args {
        b.emit(Opcode::Const(arg));
    }
    b.emit(Opcode::CallMethod(Arc::new(CallSite::new(name, argc))))
        .emit(Opcode::Return);
    b.build().unwrap()
}

// ============================================================================
// Configuration Contract
// ============================================================================

/// Test a partial document fills in every default
#[test]
fn test_config_partial_json_contract() {
    let config = RuntimeConfig::from_json(r#"{"max_trace_depth": 8}"#).unwrap();
    assert_eq!(config.max_trace_depth, 8);
    assert_eq!(config.preemption, Preemption::None);
    assert_eq!(config.inline_cache_width, POLYMORPHIC_WIDTH);
}

/// Test preemption modes use a `mode` tag
#[test]
fn test_config_preemption_tag_contract() {
    let config =
        RuntimeConfig::from_json(r#"{"preemption": {"mode": "counter", "quantum": 100}}"#).unwrap();
    assert_eq!(config.preemption, Preemption::Counter { quantum: 100 });

    let json = config.to_json().unwrap();
    assert!(json.contains("\"mode\": \"counter\""), "{}", json);
    assert_eq!(RuntimeConfig::from_json(&json).unwrap(), config);
}

/// Test unknown modes are rejected
#[test]
fn test_config_rejects_unknown_mode_contract() {
    assert!(RuntimeConfig::from_json(r#"{"preemption": {"mode": "sometimes"}}"#).is_err());
}

/// Test cache width is clamped to what a site holds
#[test]
fn test_config_cache_width_contract() {
    let wide = RuntimeConfig {
        inline_cache_width: 64,
        ..RuntimeConfig::default()
    };
    assert_eq!(wide.cache_width(), POLYMORPHIC_WIDTH);
    let zero = RuntimeConfig {
        inline_cache_width: 0,
        ..RuntimeConfig::default()
    };
    assert_eq!(zero.cache_width(), 1);
}

// ============================================================================
// Method Scope Contract
// ============================================================================

/// Test the most specific applicable definition wins
#[test]
fn test_most_specific_definition_contract() {
    let scope = MethodScope::new();
    scope.define("f", Definition::new(vec![TypeTag::Any], tagged("any")));
    scope.define("f", Definition::new(vec![TypeTag::Number], tagged("number")));
    scope.define("f", Definition::new(vec![TypeTag::Int], tagged("int")));

    let pick = |arg: Value| {
        let definition = scope.lookup("f", &[arg.clone()], None, 4).unwrap();
        definition.callback().call(&[arg])
    };
    assert_eq!(pick(Value::Int(1)), Value::str("int"));
    assert_eq!(pick(Value::Real(1.0)), Value::str("number"));
    assert_eq!(pick(Value::str("s")), Value::str("any"));
}

/// Test a same-signature definition replaces the earlier one
#[test]
fn test_same_signature_replaces_contract() {
    let scope = MethodScope::new();
    scope.define("f", Definition::new(vec![TypeTag::Int], tagged("old")));
    scope.define("f", Definition::new(vec![TypeTag::Int], tagged("new")));

    let method = scope.method("f").unwrap();
    assert_eq!(method.definitions().len(), 1);
    let definition = scope.lookup("f", &[Value::Int(1)], None, 4).unwrap();
    assert_eq!(definition.callback().call(&[]), Value::str("new"));
}

/// Test exact arity beats a variadic match of equal specificity
#[test]
fn test_exact_arity_preferred_contract() {
    let scope = MethodScope::new();
    scope.define(
        "f",
        Definition::new(vec![TypeTag::Int], tagged("rest")).variadic(),
    );
    scope.define("f", Definition::new(vec![TypeTag::Int], tagged("exact")));
    let definition = scope.lookup("f", &[Value::Int(1)], None, 4).unwrap();
    assert!(!definition.is_variadic());
}

/// Test a child scope's definitions shadow its parent's
#[test]
fn test_child_scope_shadows_contract() {
    let root = MethodScope::new();
    root.define("f", Definition::new(vec![TypeTag::Int], tagged("root")));
    let child = MethodScope::child(&root);
    child.define("f", Definition::new(vec![TypeTag::Int], tagged("child")));

    let definition = child.lookup("f", &[Value::Int(1)], None, 4).unwrap();
    assert_eq!(definition.callback().call(&[]), Value::str("child"));
    let definition = root.lookup("f", &[Value::Int(1)], None, 4).unwrap();
    assert_eq!(definition.callback().call(&[]), Value::str("root"));
}

/// Test an outer definition is used only when strictly more specific
#[test]
fn test_outer_scope_more_specific_contract() {
    let root = MethodScope::new();
    root.define("f", Definition::new(vec![TypeTag::Int], tagged("root")));
    let child = MethodScope::child(&root);
    child.define("f", Definition::new(vec![TypeTag::Any], tagged("child")));

    let definition = child.lookup("f", &[Value::Int(1)], None, 4).unwrap();
    assert_eq!(definition.callback().call(&[]), Value::str("root"));
}

/// Test cached resolutions are invalidated by later definitions
#[test]
fn test_define_invalidates_cache_contract() {
    let root = MethodScope::new();
    root.define("f", Definition::new(vec![TypeTag::Any], tagged("any")));
    let child = MethodScope::child(&root);

    let site = InlineCache::new();
    let first = child.lookup("f", &[Value::Int(1)], Some(&site), 4).unwrap();
    assert_eq!(first.callback().call(&[]), Value::str("any"));
    assert_eq!(site.len(), 1);

    // Defining in the parent reaches the child's cached entry.
    root.define("f", Definition::new(vec![TypeTag::Int], tagged("int")));
    assert_eq!(root.stats().invalidations, 1);

    let second = child.lookup("f", &[Value::Int(1)], Some(&site), 4).unwrap();
    assert_eq!(second.callback().call(&[]), Value::str("int"));
    assert_eq!(child.stats().misses, 2);
}

/// Test repeated lookups are answered from the caches
#[test]
fn test_cache_hits_contract() {
    let scope = MethodScope::new();
    scope.define("f", Definition::new(vec![TypeTag::Int], tagged("int")));
    let site = InlineCache::new();

    for _ in 0..3 {
        scope.lookup("f", &[Value::Int(1)], Some(&site), 4).unwrap();
    }
    // Without a site the scope table answers.
    scope.lookup("f", &[Value::Int(2)], None, 4).unwrap();

    let stats = scope.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.resolutions, 1);
    assert_eq!(stats.hits, 3);
}

/// Test cached and uncached resolution agree
#[test]
fn test_cache_matches_uncached_contract() {
    let scope = MethodScope::new();
    scope.define("f", Definition::new(vec![TypeTag::Number, TypeTag::Any], tagged("na")));
    scope.define("f", Definition::new(vec![TypeTag::Int, TypeTag::Str], tagged("is")));
    scope.define("f", Definition::new(vec![TypeTag::Any], tagged("a")).variadic());

    let samples = [
        Value::Int(1),
        Value::Real(2.0),
        Value::str("s"),
        Value::Nil,
        Value::Bool(true),
    ];
    let site = InlineCache::new();
    for _ in 0..2 {
        for a in &samples {
            for b in &samples {
                let args = [a.clone(), b.clone()];
                let types: Vec<TypeTag> = args.iter().map(Value::type_tag).collect();
                let cached = scope.lookup("f", &args, Some(&site), 4).ok();
                let uncached = scope.resolve_uncached("f", &types);
                assert_eq!(
                    cached.map(|d| d.serial()),
                    uncached.map(|d| d.serial()),
                    "{:?}",
                    types
                );
            }
        }
    }
}

/// Test a site widens up to its width, then gives up
#[test]
fn test_inline_cache_widening_contract() {
    let scope = MethodScope::new();
    scope.define("f", Definition::new(vec![TypeTag::Any], tagged("any")));
    let site = InlineCache::new();

    let samples = [
        Value::Int(1),
        Value::Real(1.0),
        Value::str("s"),
        Value::Bool(true),
        Value::Nil,
    ];
    for (seen, arg) in samples.iter().enumerate() {
        scope.lookup("f", &[arg.clone()], Some(&site), 4).unwrap();
        if seen < POLYMORPHIC_WIDTH {
            assert_eq!(site.len(), seen + 1);
        }
    }
    assert!(site.is_megamorphic());
    assert!(site.is_empty());
}

/// Test the no-method error names the argument types
#[test]
fn test_no_method_contract() {
    let scope = MethodScope::new();
    let err = scope
        .lookup("missing", &[Value::Int(1), Value::str("x")], None, 4)
        .unwrap_err();
    let error = err.as_error().unwrap();
    assert_eq!(error.kind(), kinds::NO_METHOD_ERROR);
    assert_eq!(error.message(), "no method missing accepts (int, str)");
}

// ============================================================================
// Vm Contract
// ============================================================================

/// Test templates survive the binary format
#[test]
fn test_vm_load_contract() {
    let vm = Vm::default();
    let template = method_site("anything", vec![Value::Int(1)]);
    let bytes = codec::encode(&template).unwrap();
    let loaded = vm.load(&bytes).unwrap();
    assert!(loaded.same_structure(&template));
}

/// Test an uncaught error comes back as `VmError::Uncaught`
#[test]
fn test_vm_uncaught_contract() {
    let vm = Vm::default();
    let site = vm.instantiate(&method_site("missing", vec![])).unwrap();
    match vm.call(&site, Vec::new()) {
        Err(VmError::Uncaught(error)) => {
            assert_eq!(error.kind(), kinds::NO_METHOD_ERROR);
            assert_eq!(error.trace_len(), 1);
        }
        other => panic!("expected an uncaught error, got {:?}", other),
    }
}

/// Test a call site reuses its resolution
#[test]
fn test_vm_call_site_caches_contract() {
    let vm = Vm::default();
    vm.define_method("add", Definition::new(vec![TypeTag::Int, TypeTag::Int], tagged("int")));
    let site = vm
        .instantiate(&method_site("add", vec![Value::Int(1), Value::Int(2)]))
        .unwrap();

    vm.call(&site, Vec::new()).unwrap();
    vm.call(&site, Vec::new()).unwrap();
    let stats = vm.context().methods().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

/// Test globals are readable from bytecode
#[test]
fn test_vm_globals_contract() {
    let vm = Vm::default();
    vm.define_global("answer", Value::Int(42));
    let mut b = TemplateBuilder::new("g", "g.src");
    b.emit(Opcode::LoadGlobal("answer".into())).emit(Opcode::Return);
    let f = vm.instantiate(&b.build().unwrap()).unwrap();
    assert_eq!(vm.call(&f, Vec::new()).unwrap(), Value::Int(42));
    assert_eq!(vm.global("answer"), Some(Value::Int(42)));
}

/// Test execution counters move
#[test]
fn test_vm_stats_contract() {
    let vm = Vm::default();
    let mut b = TemplateBuilder::new("k", "k.src");
    b.emit(Opcode::Const(Value::Int(1))).emit(Opcode::Return);
    let f = vm.instantiate(&b.build().unwrap()).unwrap();
    vm.call(&f, Vec::new()).unwrap();

    let stats = vm.stats();
    assert_eq!(stats.instructions, 2);
    assert_eq!(stats.calls, 1);
    assert_eq!(stats.preemptions, 0);
}
