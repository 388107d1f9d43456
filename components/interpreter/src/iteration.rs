//! Iteration protocol
//!
//! Four operations drive every loop: `iterate` turns an iterable into an
//! iterator (or nil when there is nothing to visit), `iterator_next`
//! advances (returning nil at the end), and `iterator_key` /
//! `iterator_value` read the current position. Tuples and strings get
//! positional iterators here; host objects answer through their own hooks.
//! Generators are resumed by the dispatch engine and never reach
//! [`iterator_next`].

use std::sync::Arc;

use core_types::{kinds, mix64, Object, TypeOps, TypeTag, Value};

#[derive(Debug, Clone)]
enum Sequence {
    Tuple(Arc<[Value]>),
    Str(Arc<str>),
}

/// Immutable positional iterator over a tuple or a string
#[derive(Debug, Clone)]
pub struct SeqIter {
    sequence: Sequence,
    // Element index, and byte offset for strings.
    index: usize,
    offset: usize,
}

impl SeqIter {
    fn start(sequence: Sequence) -> Value {
        let iter = SeqIter {
            sequence,
            index: 0,
            offset: 0,
        };
        if iter.at_end() {
            Value::Nil
        } else {
            Value::object(iter)
        }
    }

    fn at_end(&self) -> bool {
        match &self.sequence {
            Sequence::Tuple(items) => self.index >= items.len(),
            Sequence::Str(s) => self.offset >= s.len(),
        }
    }

    fn element(&self) -> Value {
        match &self.sequence {
            Sequence::Tuple(items) => items.get(self.index).cloned().unwrap_or_default(),
            Sequence::Str(s) => s[self.offset..]
                .chars()
                .next()
                .map(|c| Value::str(c.to_string()))
                .unwrap_or_default(),
        }
    }

    fn advance(&self) -> Value {
        let offset = match &self.sequence {
            Sequence::Tuple(_) => self.offset,
            Sequence::Str(s) => {
                self.offset + s[self.offset..].chars().next().map_or(1, char::len_utf8)
            }
        };
        let next = SeqIter {
            sequence: self.sequence.clone(),
            index: self.index + 1,
            offset,
        };
        if next.at_end() {
            Value::Nil
        } else {
            Value::object(next)
        }
    }
}

impl TypeOps for SeqIter {
    fn tag(&self) -> TypeTag {
        TypeTag::SeqIter
    }

    fn hash(&self, _this: &Value) -> u64 {
        mix64(self as *const SeqIter as usize as u64)
    }
}

impl Object for SeqIter {
    fn type_ops(&self) -> &dyn TypeOps {
        self
    }

    fn iterate(&self, this: &Value) -> Value {
        this.clone()
    }

    fn iterator_next(&self, _this: &Value) -> Value {
        self.advance()
    }

    fn iterator_key(&self, _this: &Value) -> Value {
        Value::Int(self.index as i64)
    }

    fn iterator_value(&self, _this: &Value) -> Value {
        self.element()
    }
}

/// Start iterating `value`
pub fn iterate(value: &Value) -> Value {
    match value {
        Value::Nil => Value::Nil,
        Value::Tuple(items) => SeqIter::start(Sequence::Tuple(Arc::clone(items))),
        Value::Str(s) => SeqIter::start(Sequence::Str(Arc::clone(s))),
        Value::Object(obj) => obj.iterate(value),
        other => Value::error(
            kinds::TYPE_ERROR,
            format!("{} is not iterable", other.type_tag()),
        ),
    }
}

/// Advance `iterator`; nil at the end
pub fn iterator_next(iterator: &Value) -> Value {
    match iterator {
        Value::Object(obj) => obj.iterator_next(iterator),
        other => not_an_iterator(other),
    }
}

/// Key of the iterator's current element
pub fn iterator_key(iterator: &Value) -> Value {
    match iterator {
        Value::Object(obj) => obj.iterator_key(iterator),
        other => not_an_iterator(other),
    }
}

/// The iterator's current element
pub fn iterator_value(iterator: &Value) -> Value {
    match iterator {
        Value::Object(obj) => obj.iterator_value(iterator),
        other => not_an_iterator(other),
    }
}

fn not_an_iterator(value: &Value) -> Value {
    Value::error(
        kinds::TYPE_ERROR,
        format!("{} is not an iterator", value.type_tag()),
    )
}
