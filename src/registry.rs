//! Registry of condition sets consulted by the evaluation engine.
use std::sync::{Arc, RwLock};

use crate::{condition_set::ConditionSet, field::Field};

/// Thread-safe collection of registered condition sets, keyed by [`ConditionSet::id`].
///
/// Expected to be populated once at startup and read-mostly afterwards. Registering a set whose id
/// is already present replaces the previous registration in place.
#[derive(Default)]
pub struct Registry {
    condition_sets: RwLock<Vec<Arc<dyn ConditionSet>>>,
}

/// One field of a registered condition set, as enumerated by [`Registry::all_conditions`].
#[derive(Debug, Clone)]
pub struct ConditionDescriptor {
    /// Id of the condition set.
    pub condition_set: String,
    /// Group label of the condition set.
    pub group_label: String,
    /// The field itself.
    pub field: Field,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Register a condition set, replacing any registration with the same id.
    pub fn register(&self, condition_set: impl ConditionSet + 'static) {
        self.register_arc(Arc::new(condition_set));
    }

    /// Construct and register a default-constructible condition set.
    pub fn register_default<C: ConditionSet + Default + 'static>(&self) {
        self.register(C::default());
    }

    /// Like [`Registry::register`] for a condition set that is already shared.
    pub fn register_arc(&self, condition_set: Arc<dyn ConditionSet>) {
        let id = condition_set.id();
        log::debug!(target: "switchyard", condition_set:display = id; "registering condition set");

        let mut condition_sets = self
            .condition_sets
            .write()
            .expect("thread holding registry lock should not panic");
        match condition_sets.iter_mut().find(|existing| existing.id() == id) {
            Some(slot) => *slot = condition_set,
            None => condition_sets.push(condition_set),
        }
    }

    /// Remove the condition set with the given id. Absent ids are ignored.
    pub fn unregister(&self, id: &str) -> Option<Arc<dyn ConditionSet>> {
        let mut condition_sets = self
            .condition_sets
            .write()
            .expect("thread holding registry lock should not panic");
        let index = condition_sets.iter().position(|c| c.id() == id)?;
        Some(condition_sets.remove(index))
    }

    /// Condition set registered under `id`.
    pub fn get(&self, id: &str) -> Option<Arc<dyn ConditionSet>> {
        self.read().into_iter().find(|c| c.id() == id)
    }

    /// Whether a condition set is registered under `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Snapshot of registered condition sets in registration order. This is the order evaluation
    /// consults them in.
    pub fn condition_sets(&self) -> Vec<Arc<dyn ConditionSet>> {
        self.read()
    }

    /// Snapshot of registered condition sets ordered by group label, for presentation.
    pub fn condition_sets_by_label(&self) -> Vec<Arc<dyn ConditionSet>> {
        let mut condition_sets = self.read();
        condition_sets.sort_by_cached_key(|c| c.group_label());
        condition_sets
    }

    /// Every field of every registered condition set, ordered by group label and then by field
    /// declaration order.
    pub fn all_conditions(&self) -> Vec<ConditionDescriptor> {
        self.condition_sets_by_label()
            .into_iter()
            .flat_map(|condition_set| {
                let id = condition_set.id();
                let group_label = condition_set.group_label();
                condition_set
                    .fields()
                    .iter()
                    .map(|field| ConditionDescriptor {
                        condition_set: id.clone(),
                        group_label: group_label.clone(),
                        field: field.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Number of registered condition sets.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Vec<Arc<dyn ConditionSet>> {
        self.condition_sets
            .read()
            .expect("thread holding registry lock should not panic")
            .clone()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.read().iter().map(|c| c.id()))
            .finish()
    }
}
