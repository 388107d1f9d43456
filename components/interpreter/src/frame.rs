//! Activation records
//!
//! A [`Frame`] is one invocation of a closure: its instruction pointer, a
//! single slot buffer holding the locals followed by the evaluation stack,
//! the stack of on-error targets and the bookkeeping used by the pool,
//! generators and the debugger.
//!
//! The slot buffer comes from the context's frame pool when it fits the
//! pool's size class. Dropping a frame returns the buffer; exposing it as a
//! generator promotes it to heap lifetime instead.

use std::sync::Arc;

use bytecode_system::{ClosureTemplate, Slot, Target};
use core_types::{kinds, Value};
use memory_manager::{FramePool, Lease};
use tracing::{trace, warn};

use crate::closure::Closure;
use crate::context::ExecutionContext;
use crate::debugger::DebugState;
use crate::generator::Generator;

/// An on-error target together with the stack depth to unwind to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    /// Instruction that receives the error
    pub target: Target,
    /// Evaluation stack depth when the handler was installed
    pub depth: usize,
}

/// Per-invocation interpreter state
pub struct Frame {
    id: u64,
    closure: Arc<Closure>,
    pub(crate) ip: usize,
    slots: Vec<Value>,
    locals: usize,
    frame_size: usize,
    handlers: Vec<Handler>,
    pooled: Option<(Arc<FramePool>, Lease)>,
    suspended: bool,
    // Set while a resumed generator's frame runs on a fiber.
    pub(crate) resume: Option<Arc<Generator>>,
    pub(crate) debug: Option<DebugState>,
}

pub(crate) fn internal_error(message: impl Into<String>) -> Value {
    Value::error(kinds::INTERNAL_ERROR, message)
}

impl Frame {
    /// Enter `closure` with `args`.
    ///
    /// Fails with an `ArityError` value when the argument count does not
    /// fit the template.
    pub fn enter<A>(closure: Arc<Closure>, args: A, ctx: &ExecutionContext) -> Result<Frame, Value>
    where
        A: IntoIterator<Item = Value>,
        A::IntoIter: ExactSizeIterator,
    {
        let template = Arc::clone(closure.template());
        let args = args.into_iter();
        check_arity(&template, args.len())?;

        let frame_size = template.frame_size() as usize;
        let (lease, mut slots) = ctx.pool().acquire(frame_size);
        bind_args(&mut slots, &template, args);
        Ok(Frame {
            id: ctx.next_frame_id(),
            closure,
            ip: 0,
            slots,
            locals: template.locals() as usize,
            frame_size,
            handlers: Vec::new(),
            pooled: lease.map(|lease| (Arc::clone(ctx.pool()), lease)),
            suspended: false,
            resume: None,
            debug: ctx.debugger().map(|_| DebugState::new()),
        })
    }

    /// Returns true if this frame's buffer can host a call to `closure`
    pub(crate) fn can_host(&self, closure: &Closure) -> bool {
        self.slots.capacity() >= closure.template().frame_size() as usize
    }

    /// Reinitialize this frame for a tail call to `closure`.
    ///
    /// The caller checks [`can_host`](Self::can_host) first.
    pub(crate) fn reenter<A>(
        &mut self,
        closure: Arc<Closure>,
        args: A,
        ctx: &ExecutionContext,
    ) -> Result<(), Value>
    where
        A: IntoIterator<Item = Value>,
        A::IntoIter: ExactSizeIterator,
    {
        let template = Arc::clone(closure.template());
        let args = args.into_iter();
        check_arity(&template, args.len())?;

        self.slots.clear();
        bind_args(&mut self.slots, &template, args);
        self.id = ctx.next_frame_id();
        self.closure = closure;
        self.ip = 0;
        self.locals = template.locals() as usize;
        self.frame_size = template.frame_size() as usize;
        self.handlers.clear();
        if self.debug.is_some() {
            self.debug = Some(DebugState::new());
        }
        Ok(())
    }

    /// Unique id of this activation
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The running closure
    pub fn closure(&self) -> &Arc<Closure> {
        &self.closure
    }

    /// The running closure's template
    pub fn template(&self) -> &Arc<ClosureTemplate> {
        self.closure.template()
    }

    /// Index of the next instruction
    pub fn ip(&self) -> usize {
        self.ip
    }

    /// Source line of the instruction being executed
    pub fn line(&self) -> u32 {
        self.template()
            .code()
            .get(self.ip.saturating_sub(1))
            .map_or(0, |inst| inst.line)
    }

    /// Returns true once the frame has been exposed as a generator
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Returns true if the slot buffer came from the pool
    pub fn is_pooled(&self) -> bool {
        self.pooled.is_some()
    }

    /// Current evaluation stack depth
    pub fn depth(&self) -> usize {
        self.slots.len() - self.locals
    }

    /// Value of local `slot`
    pub fn local(&self, slot: Slot) -> Value {
        self.slots
            .get(..self.locals)
            .and_then(|locals| locals.get(slot as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// Value of the local declared as `name` at the current line
    pub fn local_named(&self, name: &str) -> Option<Value> {
        self.template()
            .declarations_at(self.line())
            .find(|decl| &*decl.name == name)
            .map(|decl| self.local(decl.slot))
    }

    /// Top of the evaluation stack
    pub fn peek(&self) -> Option<&Value> {
        if self.slots.len() > self.locals {
            self.slots.last()
        } else {
            None
        }
    }

    pub(crate) fn set_local(&mut self, slot: Slot, value: Value) -> Result<(), Value> {
        match self.slots.get_mut(..self.locals).and_then(|l| l.get_mut(slot as usize)) {
            Some(local) => {
                *local = value;
                Ok(())
            }
            None => Err(internal_error(format!("local {} out of range", slot))),
        }
    }

    pub(crate) fn push(&mut self, value: Value) -> Result<(), Value> {
        if self.slots.len() >= self.frame_size {
            return Err(internal_error(format!(
                "evaluation stack overflow in {}",
                self.template().name()
            )));
        }
        self.slots.push(value);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<Value, Value> {
        if self.slots.len() <= self.locals {
            return Err(self.underflow());
        }
        self.slots.pop().ok_or_else(|| self.underflow())
    }

    /// Pop the top `N` values, deepest first.
    pub(crate) fn pop_array<const N: usize>(&mut self) -> Result<[Value; N], Value> {
        let start = self.stack_start(N)?;
        let mut drained = self.slots.drain(start..);
        Ok(std::array::from_fn(|_| drained.next().unwrap_or_default()))
    }

    /// Pop the top `n` values, deepest first.
    pub(crate) fn pop_vec(&mut self, n: usize) -> Result<Vec<Value>, Value> {
        let start = self.stack_start(n)?;
        Ok(self.slots.split_off(start))
    }

    fn stack_start(&self, n: usize) -> Result<usize, Value> {
        match self.slots.len().checked_sub(n) {
            Some(start) if start >= self.locals => Ok(start),
            _ => Err(self.underflow()),
        }
    }

    fn underflow(&self) -> Value {
        internal_error(format!(
            "evaluation stack underflow in {}",
            self.template().name()
        ))
    }

    pub(crate) fn jump(&mut self, target: Target) {
        self.ip = target as usize;
    }

    pub(crate) fn push_handler(&mut self, target: Target) {
        let depth = self.depth();
        self.handlers.push(Handler { target, depth });
    }

    pub(crate) fn pop_handler(&mut self) -> Option<Handler> {
        self.handlers.pop()
    }

    /// Innermost on-error target
    pub fn handler(&self) -> Option<Handler> {
        self.handlers.last().copied()
    }

    /// Route `error` to the innermost handler: unwind the stack to the
    /// handler's depth, push the error and jump to its target.
    ///
    /// Returns the error back if this frame has no handler.
    pub(crate) fn catch(&mut self, error: Value) -> Result<(), Value> {
        let Some(handler) = self.handler() else {
            return Err(error);
        };
        self.slots.truncate(self.locals + handler.depth);
        self.slots.push(error);
        self.ip = handler.target as usize;
        Ok(())
    }

    /// Detach the frame from the pool so it can outlive its call.
    pub(crate) fn expose(&mut self) {
        self.suspended = true;
        if let Some((pool, lease)) = self.pooled.take() {
            if let Err(err) = pool.promote(lease) {
                warn!(target: "interpreter::frame", error = %err, "failed to promote frame buffer");
            }
            trace!(target: "interpreter::frame", frame = self.id, "frame promoted to generator");
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some((pool, lease)) = self.pooled.take() {
            let slots = std::mem::take(&mut self.slots);
            if let Err(err) = pool.release(lease, slots) {
                warn!(target: "interpreter::frame", error = %err, "frame buffer released twice");
            }
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("closure", self.template().name())
            .field("ip", &self.ip)
            .field("depth", &self.depth())
            .field("handlers", &self.handlers)
            .field("pooled", &self.pooled.is_some())
            .field("suspended", &self.suspended)
            .finish()
    }
}

fn check_arity(template: &ClosureTemplate, argc: usize) -> Result<(), Value> {
    let params = template.params() as usize;
    let fits = if template.variadic() {
        argc >= params
    } else {
        argc == params
    };
    if fits {
        return Ok(());
    }
    let expected = if template.variadic() {
        format!("at least {}", params)
    } else {
        params.to_string()
    };
    Err(Value::error(
        kinds::ARITY_ERROR,
        format!(
            "{} expects {} arguments, got {}",
            template.name(),
            expected,
            argc
        ),
    ))
}

// Lays out parameters, the variadic rest tuple and nil-initialized locals.
fn bind_args<I>(slots: &mut Vec<Value>, template: &ClosureTemplate, mut args: I)
where
    I: Iterator<Item = Value>,
{
    let params = template.params() as usize;
    slots.extend(args.by_ref().take(params));
    if template.variadic() {
        slots.push(Value::tuple(args.collect::<Vec<_>>()));
    }
    slots.resize(template.locals() as usize, Value::Nil);
}
