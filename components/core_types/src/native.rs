//! Host functions callable from bytecode.

use std::fmt;
use std::sync::Arc;

use crate::Value;

type NativeBody = dyn Fn(&[Value]) -> Value + Send + Sync;

/// A named host function.
///
/// Host functions follow the same failure convention as primitives: they
/// report problems by returning a [`Value::Error`].
#[derive(Clone)]
pub struct NativeFn {
    name: Arc<str>,
    body: Arc<NativeBody>,
}

impl NativeFn {
    /// Wraps a closure.
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
        }
    }

    /// Name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the function.
    pub fn invoke(&self, args: &[Value]) -> Value {
        (self.body)(args)
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &NativeFn) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }

    /// Address of the shared body.
    pub fn as_ptr(&self) -> *const () {
        Arc::as_ptr(&self.body) as *const ()
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NativeFn").field(&self.name).finish()
    }
}
