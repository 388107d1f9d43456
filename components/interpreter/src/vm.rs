//! Virtual machine facade
//!
//! Main entry point for hosts: loads and verifies templates, instantiates
//! closures, calls them synchronously, and drives scheduled fibers through
//! an event loop until it is idle.

use std::sync::Arc;

use async_runtime::{EventLoop, Schedule};
use bytecode_system::{codec, verify, ClosureTemplate, DecodeError, VerifyError};
use core_types::{ErrorValue, NameTable, Value};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::closure::Closure;
use crate::config::RuntimeConfig;
use crate::context::{ContextStats, ExecutionContext};
use crate::debugger::Debugger;
use crate::dispatch::{Completion, Fiber};
use crate::generator::Generator;
use crate::iteration;
use crate::methods::Definition;

/// Host-facing failure
#[derive(Debug, Error)]
pub enum VmError {
    /// A program error reached the outermost caller
    #[error("uncaught {0}")]
    Uncaught(Arc<ErrorValue>),
    /// A template failed load-time verification
    #[error(transparent)]
    Verify(#[from] VerifyError),
    /// A persisted template could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The host broke a calling contract
    #[error("contract violation: {0}")]
    Contract(String),
}

impl VmError {
    /// The program error, for `Uncaught`
    pub fn error_value(&self) -> Option<&Arc<ErrorValue>> {
        match self {
            VmError::Uncaught(error) => Some(error),
            _ => None,
        }
    }
}

/// Virtual machine executing closure templates
///
/// # Example
///
/// ```
/// use bytecode_system::{Opcode, TemplateBuilder};
/// use core_types::Value;
/// use interpreter::{RuntimeConfig, Vm};
///
/// let vm = Vm::new(RuntimeConfig::default());
/// let mut builder = TemplateBuilder::new("answer", "answer.src");
/// builder.emit(Opcode::Const(Value::Int(42))).emit(Opcode::Return);
/// let template = vm.load_template(builder.build().unwrap()).unwrap();
///
/// let answer = vm.instantiate(&template).unwrap();
/// assert_eq!(vm.call(&answer, Vec::new()).unwrap(), Value::Int(42));
/// ```
pub struct Vm {
    ctx: ExecutionContext,
    event_loop: Arc<EventLoop<Fiber>>,
    exports: RwLock<NameTable<Value>>,
}

impl Vm {
    /// Create a VM whose scheduled fibers run under `config`'s budget
    pub fn new(config: RuntimeConfig) -> Self {
        let event_loop = Arc::new(EventLoop::with_budget(config.budget()));
        let schedule: Arc<dyn Schedule<Fiber>> = Arc::clone(&event_loop) as Arc<dyn Schedule<Fiber>>;
        let ctx = ExecutionContext::new(config).with_schedule(schedule);
        Self {
            ctx,
            event_loop,
            exports: RwLock::new(NameTable::new()),
        }
    }

    /// Attach a debugger to every frame entered from now on
    pub fn with_debugger(mut self, debugger: Arc<dyn Debugger>) -> Self {
        self.ctx = self.ctx.with_debugger(debugger);
        self
    }

    /// The execution context
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Decode a persisted template; decoding re-verifies it
    pub fn load(&self, bytes: &[u8]) -> Result<Arc<ClosureTemplate>, VmError> {
        let template = codec::decode(bytes)?;
        debug!(target: "interpreter::vm", name = %template.name(), "template loaded");
        Ok(template)
    }

    /// Verify a template produced in memory
    pub fn load_template(
        &self,
        template: Arc<ClosureTemplate>,
    ) -> Result<Arc<ClosureTemplate>, VmError> {
        verify(&template)?;
        Ok(template)
    }

    /// Materialize a top-level closure. Templates that capture from an
    /// enclosing frame can only be materialized by `MakeClosure`.
    pub fn instantiate(&self, template: &Arc<ClosureTemplate>) -> Result<Value, VmError> {
        if !template.captures().is_empty() {
            return Err(VmError::Contract(format!(
                "template {} captures {} values and cannot be instantiated at top level",
                template.name(),
                template.captures().len()
            )));
        }
        verify(template)?;
        Ok(Closure::new(Arc::clone(template), Vec::new()).value())
    }

    /// Call `callee` with `args` and run to completion
    pub fn call(&self, callee: &Value, args: Vec<Value>) -> Result<Value, VmError> {
        let result = Fiber::call(callee.clone(), args).run_to_completion(&self.ctx, Value::Nil);
        into_result(result)
    }

    /// Add a method definition to the root scope
    pub fn define_method(&self, name: &str, definition: Definition) -> Arc<Definition> {
        self.ctx.methods().define(name, definition)
    }

    /// Define or overwrite a global
    pub fn define_global(&self, name: &str, value: Value) {
        self.ctx.define_global(name, value);
    }

    /// Value of a global
    pub fn global(&self, name: &str) -> Option<Value> {
        self.ctx.global(name)
    }

    /// Publish `value` under `name`
    pub fn export(&self, name: &str, value: Value) {
        self.exports.write().insert(name, value);
    }

    /// Exported value `name`
    pub fn exported(&self, name: &str) -> Option<Value> {
        self.exports.read().get(name).cloned()
    }

    /// Exports whose names start with `prefix`, in name order
    pub fn exports(&self, prefix: &str) -> Vec<(String, Value)> {
        self.exports
            .read()
            .prefixed(prefix)
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    /// Schedule `callee(args)` to run on the next [`run_scheduled`](Self::run_scheduled).
    /// Returns the fiber id.
    pub fn spawn(&self, callee: Value, args: Vec<Value>) -> u64 {
        let fiber = Fiber::call(callee, args);
        let id = fiber.id();
        self.event_loop.add(fiber, Value::Nil);
        id
    }

    /// Run `op` on a worker thread, then call `callback` with its result.
    /// Returns the id of the callback's fiber.
    pub fn defer<F>(&self, op: F, callback: Value) -> u64
    where
        F: FnOnce() -> Value + Send + 'static,
    {
        let fiber = Fiber::continuation(callback);
        let id = fiber.id();
        self.event_loop.defer(fiber, op);
        id
    }

    /// Drive scheduled fibers until nothing is ready or outstanding.
    ///
    /// Returns each finished fiber's id and result in completion order.
    pub fn run_scheduled(&self) -> Vec<(u64, Result<Value, VmError>)> {
        let mut finished = Vec::new();
        self.event_loop.run(|fiber, pending| {
            let id = fiber.id();
            if let Completion::Done(value) = fiber.run(&self.ctx, pending) {
                finished.push((id, into_result(value)));
            }
        });
        finished
    }

    /// Advance an iterator; nil at the end. Generators are resumed.
    pub fn next(&self, iterator: &Value) -> Result<Value, VmError> {
        match iterator.downcast_arc::<Generator>() {
            Some(generator) => {
                into_result(Fiber::resume(generator).run_to_completion(&self.ctx, Value::Nil))
            }
            None => into_result(iteration::iterator_next(iterator)),
        }
    }

    /// Collect every value `iterable` produces
    pub fn collect(&self, iterable: &Value) -> Result<Vec<Value>, VmError> {
        let mut values = Vec::new();
        let mut iterator = into_result(iteration::iterate(iterable))?;
        while !iterator.is_nil() {
            values.push(into_result(iteration::iterator_value(&iterator))?);
            iterator = self.next(&iterator)?;
        }
        Ok(values)
    }

    /// Execution counters
    pub fn stats(&self) -> ContextStats {
        self.ctx.stats()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("ctx", &self.ctx)
            .field("event_loop", &self.event_loop)
            .field("exports", &self.exports.read().len())
            .finish()
    }
}

fn into_result(value: Value) -> Result<Value, VmError> {
    match value {
        Value::Error(error) => {
            warn!(target: "interpreter::vm", error = %error, "uncaught error");
            Err(VmError::Uncaught(error))
        }
        other => Ok(other),
    }
}
