use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Enum group used for 64-bit constants whose declaration was compiled away.
pub const UNKNOWN_ENUM: &str = "UnknownEnum";

/// Symbol lookups supplied by the container layer.
pub trait NameResolver: Sync {
    fn function_name(&self, index: u32) -> Option<&str>;
    fn variable_name(&self, index: u32) -> Option<&str>;
    fn string(&self, index: u32) -> Option<&str>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolTable {
    #[serde(default)]
    pub functions: Vec<String>,
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub strings: Vec<String>,
}

impl NameResolver for SymbolTable {
    fn function_name(&self, index: u32) -> Option<&str> {
        self.functions.get(index as usize).map(String::as_str)
    }

    fn variable_name(&self, index: u32) -> Option<&str> {
        self.variables.get(index as usize).map(String::as_str)
    }

    fn string(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }
}

/// Named value groupings discovered while decompiling.
#[derive(Debug, Default)]
pub struct EnumRegistry {
    groups: Mutex<BTreeMap<String, BTreeSet<i64>>>,
}

impl EnumRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the value was not registered before.
    pub fn register(&self, group: &str, value: i64) -> bool {
        let mut groups = self.groups.lock();
        let added = groups.entry(group.to_string()).or_default().insert(value);
        if added {
            trace!(group, value, "registered enum value");
        }
        added
    }

    pub fn is_registered(&self, group: &str) -> bool {
        self.groups.lock().contains_key(group)
    }

    pub fn contains(&self, group: &str, value: i64) -> bool {
        self.groups.lock().get(group).is_some_and(|values| values.contains(&value))
    }

    pub fn values(&self, group: &str) -> BTreeSet<i64> {
        self.groups.lock().get(group).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn symbol_table_lookups() {
        let t = SymbolTable {
            functions: vec!["show_message".into()],
            variables: vec!["x".into(), "y".into()],
            strings: vec!["hello".into()],
        };
        assert_eq!(t.function_name(0), Some("show_message"));
        assert_eq!(t.variable_name(1), Some("y"));
        assert_eq!(t.string(0), Some("hello"));
        assert_eq!(t.variable_name(2), None);
    }

    #[test]
    fn concurrent_registration_keeps_one_entry_per_value() {
        let registry = Arc::new(EnumRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || (0..100).filter(|v| registry.register(UNKNOWN_ENUM, *v)).count())
            })
            .collect();
        let added: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(added, 100);
        assert!(registry.is_registered(UNKNOWN_ENUM));
        assert_eq!(registry.values(UNKNOWN_ENUM).len(), 100);
        assert!(registry.contains(UNKNOWN_ENUM, 42));
        assert!(!registry.is_registered("Other"));
    }
}
