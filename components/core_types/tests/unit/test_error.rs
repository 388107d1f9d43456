//! Unit tests for ErrorValue and its trace

use core_types::{kinds, ErrorValue, TraceEntry, Value, DEFAULT_MAX_TRACE_DEPTH};

#[cfg(test)]
mod trace_tests {
    use super::*;

    #[test]
    fn test_default_bound() {
        let mut err = ErrorValue::new("E", "deep");
        for frame in 0..(DEFAULT_MAX_TRACE_DEPTH as u64 + 10) {
            err.push_trace(TraceEntry::new("s", frame as u32, frame));
        }
        assert_eq!(err.trace_len(), DEFAULT_MAX_TRACE_DEPTH);
        // The ten oldest entries were dropped.
        assert_eq!(err.trace().next().map(|e| e.frame), Some(10));
    }

    #[test]
    fn test_shrinking_bound_trims_oldest() {
        let mut err = ErrorValue::new("E", "m");
        for frame in 1..=5 {
            err.push_trace(TraceEntry::new("s", 0, frame));
        }
        let err = err.with_max_depth(2);
        let frames: Vec<u64> = err.trace().map(|e| e.frame).collect();
        assert_eq!(frames, vec![4, 5]);
    }

    #[test]
    fn test_order_preserved_across_clones() {
        let mut err = ErrorValue::new("E", "m");
        err.push_trace(TraceEntry::new("a", 1, 1));
        let mut copy = err.clone();
        copy.push_trace(TraceEntry::new("b", 2, 2));
        assert_eq!(err.trace_len(), 1);
        let sources: Vec<&str> = copy.trace().map(|e| &*e.source).collect();
        assert_eq!(sources, vec!["a", "b"]);
    }
}

#[cfg(test)]
mod kind_tests {
    use super::*;

    #[test]
    fn test_builtin_kind_strings() {
        assert_eq!(kinds::TYPE_ERROR, "TypeError");
        assert_eq!(kinds::NO_METHOD_ERROR, "NoMethodError");
        assert_eq!(kinds::INTERNAL_ERROR, "InternalError");
        assert_eq!(kinds::RAISED, "Error");
    }

    #[test]
    fn test_raised_wraps_payload() {
        let err = ErrorValue::raised(Value::str("oops"));
        assert_eq!(err.kind(), kinds::RAISED);
        assert_eq!(err.payload().as_str(), Some("oops"));
    }
}
