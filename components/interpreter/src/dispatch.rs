//! Dispatch loop for bytecode execution
//!
//! A [`Fiber`] is an explicit chain of frames. Running it executes the top
//! frame's instructions until control leaves that frame (call, return,
//! suspend, resume or an uncaught error), then applies the transfer to the
//! chain and carries on. A run ends when the outermost frame returns or the
//! budget handed out by the context's schedule is spent; a preempted fiber
//! is passed to the schedule together with its pending value. A fiber
//! dropped before it completes finishes every generator it was resuming.
//!
//! Errors are values. A primitive that fails produces an error value, which
//! is routed to the innermost on-error target after appending one trace
//! entry for the frame it was raised in. Frames without a handler are
//! unwound and record their own entry as the error passes through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_runtime::Quantum;
use bytecode_system::{Capture, ClosureTemplate, Opcode};
use core_types::{kinds, ErrorValue, TraceEntry, Value, VarCell};
use tracing::{debug, trace, warn};

use crate::closure::{capture, Closure, Forward};
use crate::context::ExecutionContext;
use crate::debugger::Debugger;
use crate::frame::{internal_error, Frame};
use crate::generator::Generator;
use crate::iteration;
use crate::method_cache::InlineCache;

static NEXT_FIBER: AtomicU64 = AtomicU64::new(1);

/// How a fiber starts on its first run
#[derive(Debug)]
enum Entry {
    /// Call a value with arguments
    Call(Value, Vec<Value>),
    /// Call a value with the pending value as its only argument
    Continue(Value),
    /// Resume a generator with the pending value
    Resume(Arc<Generator>),
}

/// Result of one fiber run
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The outermost frame returned this value (an error if uncaught)
    Done(Value),
    /// The budget ran out; the fiber was handed to the schedule
    Preempted,
}

/// A chain of frames executed as one unit of scheduling
pub struct Fiber {
    id: u64,
    frames: Vec<Frame>,
    entry: Option<Entry>,
}

// Control transfer out of the instruction loop.
enum Flow {
    Next,
    Enter(Frame),
    Replace(Frame),
    Restart,
    Return(Value),
    Suspend(Value),
    Resume(Arc<Generator>, Value),
    Signal(Value),
    Rethrow(Value),
    Preempt,
    Done(Value),
}

impl Fiber {
    fn with_entry(entry: Entry) -> Self {
        Self {
            id: NEXT_FIBER.fetch_add(1, Ordering::Relaxed),
            frames: Vec::new(),
            entry: Some(entry),
        }
    }

    /// A fiber that calls `callee` with `args`
    pub fn call(callee: Value, args: Vec<Value>) -> Self {
        Self::with_entry(Entry::Call(callee, args))
    }

    /// A fiber that calls `callee` with the value it is first run with
    pub fn continuation(callee: Value) -> Self {
        Self::with_entry(Entry::Continue(callee))
    }

    /// A fiber that resumes `generator` with the value it is first run with
    pub fn resume(generator: Arc<Generator>) -> Self {
        Self::with_entry(Entry::Resume(generator))
    }

    /// Unique fiber id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of live frames
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// The innermost frame
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Run under the context's budget.
    ///
    /// `pending` feeds a continuation or resume entry and is ignored when
    /// the fiber continues after preemption.
    pub fn run(mut self, ctx: &ExecutionContext, pending: Value) -> Completion {
        let mut quantum = ctx.budget().start();
        match self.drive(ctx, pending, &mut quantum) {
            Some(value) => Completion::Done(value),
            None => {
                ctx.counters.preemption();
                match ctx.schedule() {
                    Some(schedule) => {
                        debug!(
                            target: "interpreter::dispatch",
                            fiber = self.id,
                            depth = self.frames.len(),
                            "fiber preempted"
                        );
                        schedule.add(self, Value::Nil);
                    }
                    None => {
                        warn!(target: "interpreter::dispatch", fiber = self.id, "preempted fiber has no schedule, dropped");
                    }
                }
                Completion::Preempted
            }
        }
    }

    /// Run without a budget until the outermost frame returns
    pub fn run_to_completion(mut self, ctx: &ExecutionContext, pending: Value) -> Value {
        let mut quantum = Quantum::unlimited();
        self.drive(ctx, pending, &mut quantum).unwrap_or_default()
    }

    // Returns `None` when preempted.
    fn drive(&mut self, ctx: &ExecutionContext, pending: Value, quantum: &mut Quantum) -> Option<Value> {
        let mut flow = match self.entry.take() {
            Some(Entry::Call(callee, args)) => self.start(callee, args, ctx),
            Some(Entry::Continue(callee)) => self.start(callee, vec![pending], ctx),
            Some(Entry::Resume(generator)) => Flow::Resume(generator, pending),
            None => Flow::Next,
        };

        loop {
            flow = match flow {
                Flow::Next | Flow::Restart => self.execute(ctx, quantum),
                Flow::Enter(frame) => {
                    self.frames.push(frame);
                    Flow::Next
                }
                Flow::Replace(mut frame) => {
                    if let Some(mut current) = self.frames.pop() {
                        frame.resume = current.resume.take();
                    }
                    self.frames.push(frame);
                    Flow::Next
                }
                Flow::Return(value) => {
                    let finished = self.frames.pop().and_then(|mut frame| frame.resume.take());
                    match finished {
                        Some(generator) => {
                            generator.finish();
                            self.deliver(Value::Nil)
                        }
                        None => self.deliver(value),
                    }
                }
                Flow::Suspend(value) => self.suspend(value, ctx),
                Flow::Resume(generator, value) => self.resume_generator(generator, value),
                Flow::Signal(error) => self.unwind(error, true, ctx),
                Flow::Rethrow(error) => self.unwind(error, false, ctx),
                Flow::Preempt => return None,
                Flow::Done(value) => return Some(value),
            };
        }
    }

    fn start(&mut self, callee: Value, args: Vec<Value>, ctx: &ExecutionContext) -> Flow {
        ctx.counters.call();
        if let Some(closure) = callee.downcast_arc::<Closure>() {
            return match Frame::enter(closure, args, ctx) {
                Ok(frame) => Flow::Enter(frame),
                Err(error) => Flow::Signal(error),
            };
        }
        let result = callee.call(&args);
        if result.is_error() {
            Flow::Signal(result)
        } else {
            Flow::Done(result)
        }
    }

    // Push a value produced by a finished callee onto the caller's stack.
    fn deliver(&mut self, value: Value) -> Flow {
        match self.frames.last_mut() {
            None => Flow::Done(value),
            Some(frame) => match frame.push(value) {
                Ok(()) => Flow::Next,
                Err(error) => Flow::Signal(error),
            },
        }
    }

    fn suspend(&mut self, value: Value, ctx: &ExecutionContext) -> Flow {
        let Some(mut frame) = self.frames.pop() else {
            return Flow::Done(value);
        };
        ctx.counters.suspension();
        let generator = match frame.resume.take() {
            Some(generator) => {
                generator.park(frame, value);
                generator
            }
            None => {
                trace!(target: "interpreter::dispatch", frame = frame.id(), "frame suspended");
                Generator::new(frame, value)
            }
        };
        self.deliver(generator.value())
    }

    fn resume_generator(&mut self, generator: Arc<Generator>, value: Value) -> Flow {
        match generator.take_frame() {
            Ok(Some(mut frame)) => match frame.push(value) {
                Ok(()) => {
                    frame.resume = Some(generator);
                    self.frames.push(frame);
                    Flow::Next
                }
                Err(error) => {
                    generator.finish();
                    Flow::Signal(error)
                }
            },
            Ok(None) => self.deliver(Value::Nil),
            Err(error) => Flow::Signal(error),
        }
    }

    // Route `error` to the nearest handler, unwinding frames without one.
    fn unwind(&mut self, mut error: Value, mut record: bool, ctx: &ExecutionContext) -> Flow {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                debug!(target: "interpreter::dispatch", fiber = self.id, error = %error, "uncaught error");
                return Flow::Done(error);
            };
            if record {
                error = record_trace(error, frame, ctx.config().max_trace_depth);
            }
            record = true;
            match frame.catch(error) {
                Ok(()) => return Flow::Next,
                Err(uncaught) => {
                    error = uncaught;
                    let finished = self.frames.pop().and_then(|mut frame| frame.resume.take());
                    if let Some(generator) = finished {
                        generator.finish();
                    }
                }
            }
        }
    }

    // Execute the top frame until control leaves it.
    fn execute(&mut self, ctx: &ExecutionContext, quantum: &mut Quantum) -> Flow {
        let Some(frame) = self.frames.last_mut() else {
            return Flow::Done(Value::Nil);
        };
        let template = Arc::clone(frame.template());
        let code = template.code();
        let debugger = ctx.debugger();
        let mut executed = 0;

        let flow = loop {
            if !quantum.tick() {
                break Flow::Preempt;
            }
            let Some(instruction) = code.get(frame.ip) else {
                break Flow::Signal(internal_error(format!(
                    "instruction pointer {} out of range in {}",
                    frame.ip,
                    template.name()
                )));
            };
            frame.ip += 1;
            executed += 1;

            if let Some(debugger) = debugger {
                hook(frame, debugger, &template, instruction.line);
            }

            match step(frame, &instruction.opcode, ctx) {
                Ok(Flow::Next) => {}
                Ok(flow) => break flow,
                Err(error) => break Flow::Signal(error),
            }
        };
        ctx.counters.instructions(executed);
        flow
    }
}

// An abandoned fiber takes the frames of any generators it was running
// with it; those generators are finished rather than left running.
impl Drop for Fiber {
    fn drop(&mut self) {
        if self.frames.is_empty() {
            return;
        }
        debug!(
            target: "interpreter::dispatch",
            fiber = self.id,
            depth = self.frames.len(),
            "fiber dropped before completion"
        );
        for frame in &mut self.frames {
            if let Some(generator) = frame.resume.take() {
                generator.finish();
            }
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("frames", &self.frames)
            .field("entry", &self.entry)
            .finish()
    }
}

fn hook(frame: &mut Frame, debugger: &dyn Debugger, template: &ClosureTemplate, line: u32) {
    let stop = match frame.debug.as_mut() {
        Some(state) => state.should_stop(debugger, template.source(), template.max_line(), line),
        None => false,
    };
    if stop {
        let top = frame.peek().cloned().unwrap_or_default();
        debugger.run(frame, &top);
    }
}

fn record_trace(error: Value, frame: &Frame, max_depth: usize) -> Value {
    match error {
        Value::Error(mut inner) => {
            let value = Arc::make_mut(&mut inner);
            if value.trace_len() == 0 {
                *value = value.clone().with_max_depth(max_depth);
            }
            value.push_trace(TraceEntry::new(
                Arc::clone(frame.template().source()),
                frame.line(),
                frame.id(),
            ));
            Value::Error(inner)
        }
        other => other,
    }
}

// Errors produced by primitives redirect control instead of being pushed.
fn checked(value: Value) -> Result<Value, Value> {
    if value.is_error() {
        Err(value)
    } else {
        Ok(value)
    }
}

fn step(frame: &mut Frame, opcode: &Opcode, ctx: &ExecutionContext) -> Result<Flow, Value> {
    match opcode {
        // Stack
        Opcode::Const(value) => frame.push(value.clone())?,
        Opcode::Nil => frame.push(Value::Nil)?,
        Opcode::Pop => {
            frame.pop()?;
        }
        Opcode::Dup => {
            let top = frame.peek().cloned().ok_or_else(|| internal_error("dup on empty stack"))?;
            frame.push(top)?;
        }
        Opcode::Swap => {
            let [a, b] = frame.pop_array::<2>()?;
            frame.push(b)?;
            frame.push(a)?;
        }

        // Locals and upvalues
        Opcode::LoadLocal(slot) => {
            let value = frame.local(*slot);
            frame.push(value)?;
        }
        Opcode::StoreLocal(slot) => {
            let value = frame.pop()?;
            frame.set_local(*slot, value)?;
        }
        Opcode::LoadUpvalue(index) => {
            let value = checked(frame.closure().upvalue(*index))?;
            frame.push(value)?;
        }
        Opcode::LoadSelf => {
            let this = frame.closure().value();
            frame.push(this)?;
        }
        Opcode::LoadGlobal(name) => {
            let value = ctx.global(name).ok_or_else(|| {
                Value::error(kinds::NAME_ERROR, format!("undefined global {}", name))
            })?;
            frame.push(value)?;
        }

        // Scoped variables
        Opcode::EnterScope(slot) => {
            let init = frame.pop()?;
            frame.set_local(*slot, Value::Cell(VarCell::new(init)))?;
        }
        Opcode::ExitScope(slot) => frame.set_local(*slot, Value::Nil)?,
        Opcode::Deref => {
            let reference = frame.pop()?;
            let value = checked(reference.dereference())?;
            frame.push(value)?;
        }
        Opcode::Assign => {
            let [reference, value] = frame.pop_array::<2>()?;
            let assigned = checked(reference.assign(value))?;
            frame.push(assigned)?;
        }
        Opcode::DeclareForward(slot) => frame.set_local(*slot, Forward::value())?,
        Opcode::Bind(slot) => {
            let value = frame.pop()?;
            if let Some(forward) = frame.local(*slot).downcast_ref::<Forward>() {
                if !forward.bind(value.clone()) {
                    return Err(Value::error(
                        kinds::TYPE_ERROR,
                        format!("binding in slot {} is already initialized", slot),
                    ));
                }
            }
            frame.set_local(*slot, value)?;
        }

        // Branches
        Opcode::Jump(target) => frame.jump(*target),
        Opcode::JumpIfNil(target) => {
            if frame.pop()?.is_nil() {
                frame.jump(*target);
            }
        }
        Opcode::JumpUnlessNil(target) => {
            if !frame.pop()?.is_nil() {
                frame.jump(*target);
            }
        }
        Opcode::Switch(table) => {
            let selector = frame.pop()?;
            frame.jump(table.select(&selector));
        }

        // Iteration protocol
        Opcode::Iterate => {
            let iterable = frame.pop()?;
            frame.push(checked(iteration::iterate(&iterable))?)?;
        }
        Opcode::IterNext => {
            let iterator = frame.pop()?;
            if let Some(generator) = iterator.downcast_arc::<Generator>() {
                return Ok(Flow::Resume(generator, Value::Nil));
            }
            frame.push(checked(iteration::iterator_next(&iterator))?)?;
        }
        Opcode::IterKey => {
            let iterator = frame.pop()?;
            frame.push(checked(iteration::iterator_key(&iterator))?)?;
        }
        Opcode::IterValue => {
            let iterator = frame.pop()?;
            frame.push(checked(iteration::iterator_value(&iterator))?)?;
        }

        // Calls
        Opcode::Call(argc) => return call(frame, *argc, false, ctx),
        Opcode::TailCall(argc) => return call(frame, *argc, true, ctx),
        Opcode::CallMethod(site) => {
            let args = frame.pop_vec(site.argc as usize)?;
            let cache = site.cache_or_init(InlineCache::new);
            let definition =
                ctx.methods()
                    .lookup(&site.method, &args, cache, ctx.config().cache_width())?;
            let callee = definition.callback().clone();
            return invoke(frame, callee, args, false, ctx);
        }

        // Errors
        Opcode::Try(target) => frame.push_handler(*target),
        Opcode::EndTry => {
            frame.pop_handler();
        }
        Opcode::Catch => {
            frame.pop_handler();
            let caught = match frame.pop()? {
                Value::Error(error) | Value::Exception(error) => Value::Exception(error),
                other => match internal_error(format!("expected error, got {}", other.type_tag())) {
                    Value::Error(error) => Value::Exception(error),
                    synthesized => synthesized,
                },
            };
            frame.push(caught)?;
        }
        Opcode::Raise => {
            let error = match frame.pop()? {
                Value::Error(error) | Value::Exception(error) => Value::Error(error),
                payload => Value::Error(Arc::new(
                    ErrorValue::raised(payload).with_max_depth(ctx.config().max_trace_depth),
                )),
            };
            return Err(error);
        }
        Opcode::Retry => {
            return match frame.pop()? {
                Value::Error(error) | Value::Exception(error) => {
                    Ok(Flow::Rethrow(Value::Error(error)))
                }
                other => Err(internal_error(format!(
                    "retry expects a caught error, got {}",
                    other.type_tag()
                ))),
            };
        }

        // Closures
        Opcode::MakeClosure(template) => {
            let captured = template
                .captures()
                .iter()
                .map(|source| {
                    capture(match *source {
                        Capture::Local(slot) => frame.local(slot),
                        Capture::Upvalue(index) => frame.closure().raw_upvalue(index),
                    })
                })
                .collect();
            let closure = Closure::new(Arc::clone(template), captured);
            frame.push(closure.value())?;
        }

        // Builders
        Opcode::BuildTuple(n) => {
            let items = frame.pop_vec(*n as usize)?;
            frame.push(Value::tuple(items))?;
        }
        Opcode::BuildString(n) => {
            let parts = frame.pop_vec(*n as usize)?;
            let joined: String = parts.iter().map(ToString::to_string).collect();
            frame.push(Value::str(joined))?;
        }

        // Control
        Opcode::Suspend => return Ok(Flow::Suspend(frame.pop()?)),
        Opcode::Return => return Ok(Flow::Return(frame.pop()?)),
        Opcode::Halt => return Ok(Flow::Return(Value::Nil)),
    }
    Ok(Flow::Next)
}

fn call(frame: &mut Frame, argc: u32, tail: bool, ctx: &ExecutionContext) -> Result<Flow, Value> {
    match argc {
        0 => call_fixed::<0>(frame, tail, ctx),
        1 => call_fixed::<1>(frame, tail, ctx),
        2 => call_fixed::<2>(frame, tail, ctx),
        3 => call_fixed::<3>(frame, tail, ctx),
        4 => call_fixed::<4>(frame, tail, ctx),
        5 => call_fixed::<5>(frame, tail, ctx),
        6 => call_fixed::<6>(frame, tail, ctx),
        7 => call_fixed::<7>(frame, tail, ctx),
        8 => call_fixed::<8>(frame, tail, ctx),
        9 => call_fixed::<9>(frame, tail, ctx),
        n => call_generic(frame, n as usize, tail, ctx),
    }
}

#[inline]
fn call_fixed<const N: usize>(
    frame: &mut Frame,
    tail: bool,
    ctx: &ExecutionContext,
) -> Result<Flow, Value> {
    let args = frame.pop_array::<N>()?;
    let callee = frame.pop()?;
    invoke(frame, callee, args, tail, ctx)
}

fn call_generic(
    frame: &mut Frame,
    argc: usize,
    tail: bool,
    ctx: &ExecutionContext,
) -> Result<Flow, Value> {
    let args = frame.pop_vec(argc)?;
    let callee = frame.pop()?;
    invoke(frame, callee, args, tail, ctx)
}

fn invoke<A>(
    frame: &mut Frame,
    callee: Value,
    args: A,
    tail: bool,
    ctx: &ExecutionContext,
) -> Result<Flow, Value>
where
    A: AsRef<[Value]> + IntoIterator<Item = Value>,
    A::IntoIter: ExactSizeIterator,
{
    ctx.counters.call();
    if let Some(closure) = callee.downcast_arc::<Closure>() {
        if !tail {
            return Ok(Flow::Enter(Frame::enter(closure, args, ctx)?));
        }
        if frame.can_host(&closure) {
            frame.reenter(closure, args, ctx)?;
            return Ok(Flow::Restart);
        }
        return Ok(Flow::Replace(Frame::enter(closure, args, ctx)?));
    }

    let result = checked(callee.call(args.as_ref()))?;
    if tail {
        Ok(Flow::Return(result))
    } else {
        frame.push(result)?;
        Ok(Flow::Next)
    }
}
