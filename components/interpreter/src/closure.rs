//! Closure instances and forward references
//!
//! A [`Closure`] pairs an immutable template with the values it captured
//! when it was materialized. Upvalue 0 is the closure itself, kept as a weak
//! self reference so direct recursion needs neither a global lookup nor a
//! reference cycle.
//!
//! A [`Forward`] stands in for a binding that is declared before its value
//! exists (mutual recursion, `letrec`-style groups). Closures that capture
//! it while unbound keep the placeholder and read through it later; closures
//! materialized after it is bound capture the value directly.

use std::sync::{Arc, OnceLock, Weak};

use bytecode_system::ClosureTemplate;
use core_types::{kinds, mix64, Object, TypeOps, TypeTag, Value};

/// A compiled function plus its captured values
pub struct Closure {
    template: Arc<ClosureTemplate>,
    // Upvalues 1..; upvalue 0 is `this`.
    captured: Box<[Value]>,
    this: Weak<Closure>,
}

impl Closure {
    /// Materialize `template` over `captured` (upvalues 1.. in order)
    pub fn new(template: Arc<ClosureTemplate>, captured: Vec<Value>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            template,
            captured: captured.into_boxed_slice(),
            this: this.clone(),
        })
    }

    /// The closure's template
    pub fn template(&self) -> &Arc<ClosureTemplate> {
        &self.template
    }

    /// The closure as a value
    pub fn value(self: &Arc<Self>) -> Value {
        Value::Object(Arc::clone(self) as Arc<dyn Object>)
    }

    /// Upvalue `index` as captured, without reading through forwards
    pub fn raw_upvalue(&self, index: u32) -> Value {
        match index {
            0 => self
                .this
                .upgrade()
                .map(|this| Value::Object(this as Arc<dyn Object>))
                .unwrap_or_default(),
            n => self
                .captured
                .get(n as usize - 1)
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Upvalue `index`, reading through a forward reference.
    ///
    /// An unbound forward yields an `UnboundError` value.
    pub fn upvalue(&self, index: u32) -> Value {
        let value = self.raw_upvalue(index);
        match value.downcast_ref::<Forward>() {
            Some(forward) => forward.resolve(),
            None => value,
        }
    }

    /// Number of upvalues including the self reference
    pub fn upvalue_count(&self) -> u32 {
        self.captured.len() as u32 + 1
    }
}

impl std::fmt::Debug for Closure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closure")
            .field("name", self.template.name())
            .field("upvalues", &self.upvalue_count())
            .finish()
    }
}

impl TypeOps for Closure {
    fn tag(&self) -> TypeTag {
        TypeTag::Closure
    }

    fn hash(&self, _this: &Value) -> u64 {
        mix64(self as *const Closure as usize as u64)
    }

    // Bytecode closures need a frame; the dispatch engine and `Vm::call`
    // recognize them before falling back to the vtable.
    fn call(&self, _this: &Value, _args: &[Value]) -> Value {
        Value::error(
            kinds::INTERNAL_ERROR,
            format!(
                "closure {} must be invoked through the interpreter",
                self.template.name()
            ),
        )
    }
}

impl Object for Closure {
    fn type_ops(&self) -> &dyn TypeOps {
        self
    }

    fn describe(&self) -> String {
        format!("<closure {}>", self.template.name())
    }
}

/// Placeholder for a binding whose value is not known yet
#[derive(Debug, Default)]
pub struct Forward {
    bound: OnceLock<Value>,
}

impl Forward {
    /// Create an unbound forward reference
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unbound forward reference as a value
    pub fn value() -> Value {
        Value::object(Self::new())
    }

    /// Bind the reference. Returns false if it was already bound.
    pub fn bind(&self, value: Value) -> bool {
        self.bound.set(value).is_ok()
    }

    /// Bound value, if any
    pub fn get(&self) -> Option<&Value> {
        self.bound.get()
    }

    /// Bound value, or an `UnboundError` value
    pub fn resolve(&self) -> Value {
        match self.bound.get() {
            Some(value) => value.clone(),
            None => Value::error(
                kinds::UNBOUND_ERROR,
                "binding used before it was initialized",
            ),
        }
    }
}

impl TypeOps for Forward {
    fn tag(&self) -> TypeTag {
        TypeTag::Opaque
    }

    fn hash(&self, _this: &Value) -> u64 {
        mix64(self as *const Forward as usize as u64)
    }

    fn dereference(&self, _this: &Value) -> Value {
        self.resolve()
    }
}

impl Object for Forward {
    fn type_ops(&self) -> &dyn TypeOps {
        self
    }

    fn describe(&self) -> String {
        match self.bound.get() {
            Some(value) => format!("<forward {}>", value),
            None => "<forward unbound>".to_string(),
        }
    }
}

/// Resolve a captured value: bound forwards are replaced by their value.
pub(crate) fn capture(value: Value) -> Value {
    match value.downcast_ref::<Forward>().and_then(Forward::get) {
        Some(bound) => bound.clone(),
        None => value,
    }
}
