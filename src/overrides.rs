//! Scoped switch overrides, mostly for tests.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

#[derive(Debug, Default)]
pub(crate) struct Overrides {
    values: RwLock<HashMap<String, bool>>,
}

impl Overrides {
    pub(crate) fn get(&self, key: &str) -> Option<bool> {
        self.values
            .read()
            .expect("thread holding overrides lock should not panic")
            .get(key)
            .copied()
    }

    fn set(&self, key: &str, value: Option<bool>) -> Option<bool> {
        let mut values = self
            .values
            .write()
            .expect("thread holding overrides lock should not panic");
        match value {
            Some(value) => values.insert(key.to_owned(), value),
            None => values.remove(key),
        }
    }
}

/// Forces a switch to a fixed result while alive.
///
/// Returned by [`SwitchManager::override_switch`](crate::SwitchManager::override_switch).
/// Dropping the guard restores whatever override (or lack of one) was in place before, so guards
/// nest as long as they are dropped in reverse order.
#[must_use = "the override is removed as soon as the guard is dropped"]
#[derive(Debug)]
pub struct OverrideGuard {
    overrides: Arc<Overrides>,
    key: String,
    previous: Option<bool>,
}

impl OverrideGuard {
    pub(crate) fn new(overrides: Arc<Overrides>, key: &str, value: bool) -> OverrideGuard {
        let previous = overrides.set(key, Some(value));
        log::debug!(target: "switchyard", key, value; "overriding switch");
        OverrideGuard {
            overrides,
            key: key.to_owned(),
            previous,
        }
    }

    /// Key of the overridden switch.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for OverrideGuard {
    fn drop(&mut self) {
        self.overrides.set(&self.key, self.previous);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{OverrideGuard, Overrides};

    #[test]
    fn nested_guards_restore_in_order() {
        let overrides = Arc::new(Overrides::default());
        assert_eq!(overrides.get("test"), None);

        let outer = OverrideGuard::new(overrides.clone(), "test", true);
        assert_eq!(overrides.get("test"), Some(true));
        {
            let _inner = OverrideGuard::new(overrides.clone(), "test", false);
            assert_eq!(overrides.get("test"), Some(false));
        }
        assert_eq!(overrides.get("test"), Some(true));

        drop(outer);
        assert_eq!(overrides.get("test"), None);
    }
}
