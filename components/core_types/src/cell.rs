//! Mutable variable cells.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::Value;

/// A shared, assignable variable.
///
/// Scoped variables that are captured by closures live in cells so that every
/// closure observes later assignments.
#[derive(Clone)]
pub struct VarCell(Arc<Mutex<Value>>);

impl VarCell {
    /// Creates a cell holding `value`.
    pub fn new(value: Value) -> Self {
        VarCell(Arc::new(Mutex::new(value)))
    }

    /// Reads the current value.
    pub fn get(&self) -> Value {
        self.0.lock().clone()
    }

    /// Replaces the current value.
    pub fn set(&self, value: Value) {
        *self.0.lock() = value;
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &VarCell) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address of the shared storage.
    pub fn as_ptr(&self) -> *const Mutex<Value> {
        Arc::as_ptr(&self.0)
    }
}

impl fmt::Debug for VarCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VarCell").field(&*self.0.lock()).finish()
    }
}
