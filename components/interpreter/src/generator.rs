//! Generators
//!
//! A generator is a frame that executed `Suspend` and was handed to its
//! caller as a value. It remembers the last yielded value and how many
//! values it has produced; resuming it pushes the frame back onto a fiber,
//! where it continues right after the suspend point.

use std::sync::Arc;

use core_types::{kinds, mix64, Object, TypeOps, TypeTag, Value};
use parking_lot::Mutex;

use crate::frame::Frame;

/// Lifecycle of a generator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Parked at a suspend point
    Suspended,
    /// Its frame is on a fiber
    Running,
    /// Returned or unwound; yields nothing more
    Done,
}

struct Inner {
    state: GeneratorState,
    frame: Option<Frame>,
    current: Value,
    key: i64,
}

/// A suspended frame exposed as an iterator value
pub struct Generator {
    name: Arc<str>,
    inner: Mutex<Inner>,
}

impl Generator {
    /// Park `frame`, which just yielded `current`
    pub(crate) fn new(mut frame: Frame, current: Value) -> Arc<Self> {
        frame.expose();
        Arc::new(Self {
            name: Arc::clone(frame.template().name()),
            inner: Mutex::new(Inner {
                state: GeneratorState::Suspended,
                frame: Some(frame),
                current,
                key: 0,
            }),
        })
    }

    /// The generator as a value
    pub fn value(self: &Arc<Self>) -> Value {
        Value::Object(Arc::clone(self) as Arc<dyn Object>)
    }

    /// Current state
    pub fn state(&self) -> GeneratorState {
        self.inner.lock().state
    }

    /// Returns true once the generator has finished
    pub fn is_done(&self) -> bool {
        self.state() == GeneratorState::Done
    }

    /// Last yielded value; nil once done
    pub fn current(&self) -> Value {
        self.inner.lock().current.clone()
    }

    /// Zero-based index of the last yielded value
    pub fn key(&self) -> i64 {
        self.inner.lock().key
    }

    /// Take the parked frame to resume it.
    ///
    /// Returns `Ok(None)` when the generator is done and an error value when
    /// it is already running.
    pub(crate) fn take_frame(&self) -> Result<Option<Frame>, Value> {
        let mut inner = self.inner.lock();
        match inner.state {
            GeneratorState::Suspended => {
                inner.state = GeneratorState::Running;
                Ok(inner.frame.take())
            }
            GeneratorState::Done => Ok(None),
            GeneratorState::Running => Err(Value::error(
                kinds::TYPE_ERROR,
                format!("generator {} is already running", self.name),
            )),
        }
    }

    /// Park the frame again after it yielded `current`
    pub(crate) fn park(&self, mut frame: Frame, current: Value) {
        // A tail call may have moved the generator onto a pooled frame.
        frame.expose();
        frame.resume = None;
        let mut inner = self.inner.lock();
        inner.state = GeneratorState::Suspended;
        inner.frame = Some(frame);
        inner.current = current;
        inner.key += 1;
    }

    /// Mark the generator finished
    pub(crate) fn finish(&self) {
        let mut inner = self.inner.lock();
        inner.state = GeneratorState::Done;
        inner.frame = None;
        inner.current = Value::Nil;
    }
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Generator")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("key", &inner.key)
            .finish()
    }
}

impl TypeOps for Generator {
    fn tag(&self) -> TypeTag {
        TypeTag::Generator
    }

    fn hash(&self, _this: &Value) -> u64 {
        mix64(self as *const Generator as usize as u64)
    }
}

impl Object for Generator {
    fn type_ops(&self) -> &dyn TypeOps {
        self
    }

    fn describe(&self) -> String {
        format!("<generator {}>", self.name)
    }

    fn iterate(&self, this: &Value) -> Value {
        if self.is_done() {
            Value::Nil
        } else {
            this.clone()
        }
    }

    // Advancing needs a fiber; the dispatch engine and `Vm::next` handle it.
    fn iterator_next(&self, _this: &Value) -> Value {
        Value::error(
            kinds::INTERNAL_ERROR,
            "generators are resumed by the interpreter",
        )
    }

    fn iterator_key(&self, _this: &Value) -> Value {
        Value::Int(self.key())
    }

    fn iterator_value(&self, _this: &Value) -> Value {
        self.current()
    }
}
