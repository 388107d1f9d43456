//! Unit tests for IdTable and NameTable

use core_types::{IdTable, NameTable};

#[cfg(test)]
mod id_table_tests {
    use super::*;

    #[test]
    fn test_pointer_like_keys() {
        let mut table = IdTable::new();
        let keys: Vec<u64> = (0..64u64).map(|i| 0x7f00_0000_1000 + i * 16).collect();
        for (i, key) in keys.iter().enumerate() {
            table.insert(*key, i);
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(table.get(*key), Some(&i));
        }
        assert_eq!(table.len(), keys.len());
    }

    #[test]
    fn test_mixed_insert_remove_matches_model() {
        use std::collections::HashMap;

        let mut table = IdTable::new();
        let mut model = HashMap::new();
        let mut state = 0x1234_5678u64;
        for _ in 0..2000 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let key = (state >> 33) % 97;
            if state & 1 == 0 {
                assert_eq!(table.insert(key, state), model.insert(key, state));
            } else {
                assert_eq!(table.remove(key), model.remove(&key));
            }
        }
        assert_eq!(table.len(), model.len());
        for (key, value) in &model {
            assert_eq!(table.get(*key), Some(value));
        }
    }

    #[test]
    fn test_get_mut() {
        let mut table = IdTable::new();
        table.insert(1, 1);
        if let Some(v) = table.get_mut(1) {
            *v += 41;
        }
        assert_eq!(table.get(1), Some(&42));
    }
}

#[cfg(test)]
mod name_table_tests {
    use super::*;

    #[test]
    fn test_iteration_is_ordered() {
        let mut table = NameTable::new();
        for name in ["zeta", "alpha", "mu"] {
            table.insert(name, name.len());
        }
        let names: Vec<&str> = table.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["alpha", "mu", "zeta"]);
    }

    #[test]
    fn test_remove() {
        let mut table = NameTable::new();
        table.insert("x", 1);
        assert_eq!(table.remove("x"), Some(1));
        assert!(table.is_empty());
    }
}
