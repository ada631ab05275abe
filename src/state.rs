//! String-keyed dependency-injection context.
//!
//! Middleware and handlers share collaborators (config, cache handles,
//! scanner instances) through this store. Values are keyed by short
//! strings and stored type-erased; retrieval checks the concrete type, so
//! a key collision with the wrong type reads as absent rather than
//! panicking.
//!
//! # Examples
//!
//! ```rust
//! use catzilla::state::{set_state, get_state};
//!
//! set_state("app_name", "upload-gateway".to_string());
//! let name = get_state::<String>("app_name").unwrap();
//! assert_eq!(name.as_str(), "upload-gateway");
//! assert!(get_state::<u32>("app_name").is_none());
//! ```

use std::{any::Any, sync::Arc};

use dashmap::DashMap;
use once_cell::sync::Lazy;

static GLOBAL_STATE: Lazy<DashMap<String, Arc<dyn Any + Send + Sync>>> = Lazy::new(DashMap::new);

/// Stores `value` under `key`, replacing any previous value.
pub fn set_state<T: Send + Sync + 'static>(key: &str, value: T) {
    GLOBAL_STATE.insert(key.to_owned(), Arc::new(value));
}

/// Retrieves the value stored under `key` when its type matches `T`.
pub fn get_state<T: Send + Sync + 'static>(key: &str) -> Option<Arc<T>> {
    GLOBAL_STATE
        .get(key)
        .map(|v| v.clone())
        .and_then(|v| v.downcast::<T>().ok())
}

/// Removes the value stored under `key`. Returns whether one existed.
pub fn remove_state(key: &str) -> bool {
    GLOBAL_STATE.remove(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_and_type_check() {
        set_state("state-test-count", 7u64);
        assert_eq!(*get_state::<u64>("state-test-count").unwrap(), 7);
        assert!(get_state::<String>("state-test-count").is_none());
        assert!(remove_state("state-test-count"));
        assert!(get_state::<u64>("state-test-count").is_none());
    }
}
