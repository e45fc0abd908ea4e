use std::sync::Arc;

use crate::{
    condition_set::{ConditionSet, Verdict},
    field::RawInputs,
    overrides::{OverrideGuard, Overrides},
    refresher::{RefresherThread, RefresherThreadConfig},
    registry::{ConditionDescriptor, Registry},
    store::SwitchListener,
    subject::{self, Subject},
    switch::{self, ActiveCondition},
    Error, ManagerConfig, Result, Switch, SwitchStatus, SwitchStore,
};

/// Evaluates switches for subjects and applies administrative changes to them.
///
/// In order to create a manager instance, first create [`ManagerConfig`].
///
/// # Examples
/// ```
/// # use switchyard::{Entity, ManagerConfig, SwitchStatus, condition_set::SubjectConditionSet};
/// let manager = ManagerConfig::in_memory().to_manager();
/// manager.register(SubjectConditionSet::new("auth.user"));
///
/// manager.set_status("checkout", SwitchStatus::Selective)?;
/// manager.add_condition(
///     "checkout",
///     "switchyard::SubjectConditionSet(auth.user)",
///     "percent",
///     "0-50",
///     false,
/// )?;
///
/// assert!(manager.is_active("checkout", &[&Entity::new("auth.user", 5)]));
/// assert!(!manager.is_active("checkout", &[&Entity::new("auth.user", 8771)]));
/// # Ok::<(), switchyard::Error>(())
/// ```
pub struct SwitchManager {
    registry: Arc<Registry>,
    store: Arc<SwitchStore>,
    overrides: Arc<Overrides>,
}

impl SwitchManager {
    /// Create a new `SwitchManager` using the specified configuration.
    pub fn new(config: ManagerConfig) -> SwitchManager {
        SwitchManager {
            store: Arc::new(config.to_store()),
            registry: config.registry,
            overrides: Arc::new(Overrides::default()),
        }
    }

    /// Condition sets consulted by this manager.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Switch store backing this manager.
    pub fn store(&self) -> &Arc<SwitchStore> {
        &self.store
    }

    /// Register a condition set with this manager's registry.
    pub fn register(&self, condition_set: impl ConditionSet + 'static) {
        self.registry.register(condition_set);
    }

    /// Remove a condition set. Its stored conditions are ignored from then on.
    pub fn unregister(&self, id: &str) -> Option<Arc<dyn ConditionSet>> {
        self.registry.unregister(id)
    }

    /// Whether the switch `key` is active for `subjects`, falling back to `false`.
    ///
    /// Never fails: errors are logged and the fallback is returned.
    pub fn is_active(&self, key: &str, subjects: &[&dyn Subject]) -> bool {
        self.is_active_or(key, subjects, false)
    }

    /// Like [`SwitchManager::is_active`] with a caller-supplied fallback for keys that have no
    /// opinion (absent, inheriting, or selective with nothing configured).
    pub fn is_active_or(&self, key: &str, subjects: &[&dyn Subject], default: bool) -> bool {
        match self.try_is_active_or(key, subjects, default) {
            Ok(active) => active,
            Err(err) => {
                log::warn!(target: "switchyard", key, default;
                    "error occurred while evaluating a switch: {:?}", err);
                default
            }
        }
    }

    /// Like [`SwitchManager::is_active`], but surfaces storage failures and field type mismatches.
    pub fn try_is_active(&self, key: &str, subjects: &[&dyn Subject]) -> Result<bool> {
        self.try_is_active_or(key, subjects, false)
    }

    /// Like [`SwitchManager::is_active_or`], but surfaces errors.
    pub fn try_is_active_or(
        &self,
        key: &str,
        subjects: &[&dyn Subject],
        default: bool,
    ) -> Result<bool> {
        let subjects = subject::expand(subjects);
        let verdict = self.evaluate(key, &subjects, Verdict::Indifferent)?;

        log::trace!(target: "switchyard", key, subjects = subjects.len(), verdict:?; "evaluated a switch");
        Ok(verdict.unwrap_or(default))
    }

    /// Resolve `key` against its ancestors and its own status.
    ///
    /// Ancestors are evaluated with no default: an `Inactive` ancestor vetoes, an `Active` one
    /// replaces `default` for this level, an `Indifferent` one leaves `default` untouched.
    fn evaluate(
        &self,
        key: &str,
        subjects: &[&dyn Subject],
        mut default: Verdict,
    ) -> Result<Verdict> {
        if let Some(value) = self.overrides.get(key) {
            return Ok(Verdict::from(value));
        }

        if let Some(parent) = switch::parent_key(key) {
            match self.evaluate(parent, subjects, Verdict::Indifferent)? {
                Verdict::Inactive => return Ok(Verdict::Inactive),
                Verdict::Active => default = Verdict::Active,
                Verdict::Indifferent => {}
            }
        }

        let Some(switch) = self.store.lookup(key)? else {
            return Ok(default);
        };

        match switch.status {
            SwitchStatus::Global => Ok(Verdict::Active),
            SwitchStatus::Disabled => Ok(Verdict::Inactive),
            SwitchStatus::Inherit => Ok(default),
            SwitchStatus::Selective if !switch.has_conditions() => Ok(default),
            SwitchStatus::Selective => self.evaluate_conditions(&switch, subjects),
        }
    }

    /// Combine every registered condition set. A configured selective switch never defers: if no
    /// set has an opinion, it is inactive.
    fn evaluate_conditions(&self, switch: &Switch, subjects: &[&dyn Subject]) -> Result<Verdict> {
        let mut active = false;
        for condition_set in self.registry.condition_sets() {
            match condition_set.has_active_condition(&switch.conditions, subjects)? {
                Verdict::Inactive => {
                    log::trace!(target: "switchyard",
                        key:display = switch.key,
                        condition_set:display = condition_set.id();
                        "switch vetoed by condition set");
                    return Ok(Verdict::Inactive);
                }
                Verdict::Active => active = true,
                Verdict::Indifferent => {}
            }
        }
        Ok(Verdict::from(active))
    }

    /// Force `key` to evaluate to `value` until the returned guard is dropped.
    ///
    /// The override applies wherever `key` is consulted, including as an ancestor of other keys.
    ///
    /// ```
    /// # use switchyard::ManagerConfig;
    /// let manager = ManagerConfig::in_memory().auto_create(false).to_manager();
    /// {
    ///     let _guard = manager.override_switch("new_checkout", true);
    ///     assert!(manager.is_active("new_checkout", &[]));
    /// }
    /// assert!(!manager.is_active("new_checkout", &[]));
    /// ```
    pub fn override_switch(&self, key: &str, value: bool) -> OverrideGuard {
        OverrideGuard::new(self.overrides.clone(), key, value)
    }

    /// Get a switch, auto-creating it if enabled.
    pub fn get(&self, key: &str) -> Result<Arc<Switch>> {
        self.store.get(key)
    }

    /// Whether `key` is stored. Never auto-creates.
    pub fn contains(&self, key: &str) -> Result<bool> {
        self.store.contains(key)
    }

    /// Every stored switch, ordered by key.
    pub fn list(&self) -> Result<Vec<Arc<Switch>>> {
        self.store.list()
    }

    /// Change the status of a switch, creating it if missing.
    pub fn set_status(&self, key: &str, status: SwitchStatus) -> Result<Arc<Switch>> {
        self.store.set_status(key, status)
    }

    /// Delete a switch. Deleting a missing key is not an error.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(key)
    }

    /// Clean `raw` through a field of a registered condition set and store it on the switch.
    pub fn add_condition(
        &self,
        key: &str,
        condition_set_id: &str,
        field: &str,
        raw: &str,
        exclude: bool,
    ) -> Result<Arc<Switch>> {
        let condition_set = self.condition_set(condition_set_id)?;
        self.store
            .update(key, |switch| {
                switch.add_condition(condition_set.as_ref(), field, raw, exclude)
            })
            .map(|(switch, ())| switch)
    }

    /// Like [`SwitchManager::add_condition`], reading the raw input from form-style inputs
    /// (`percent[min]`, `percent[max]`, ...).
    pub fn add_condition_from_inputs(
        &self,
        key: &str,
        condition_set_id: &str,
        field: &str,
        inputs: &RawInputs,
        exclude: bool,
    ) -> Result<Arc<Switch>> {
        let condition_set = self.condition_set(condition_set_id)?;
        self.store
            .update(key, |switch| {
                switch.add_condition_from_inputs(condition_set.as_ref(), field, inputs, exclude)
            })
            .map(|(switch, ())| switch)
    }

    /// Remove every stored condition of `field` equal to `value`. Returns whether anything was
    /// removed.
    pub fn remove_condition(
        &self,
        key: &str,
        condition_set_id: &str,
        field: &str,
        value: &str,
    ) -> Result<bool> {
        let condition_set = self.condition_set(condition_set_id)?;
        self.store
            .update(key, |switch| {
                Ok(switch.remove_condition(condition_set.as_ref(), field, value))
            })
            .map(|(_, removed)| removed)
    }

    /// Remove all conditions of one field, or of the whole condition set namespace.
    pub fn clear_conditions(
        &self,
        key: &str,
        condition_set_id: &str,
        field: Option<&str>,
    ) -> Result<Arc<Switch>> {
        let condition_set = self.condition_set(condition_set_id)?;
        self.store
            .update(key, |switch| {
                switch.clear_conditions(condition_set.as_ref(), field);
                Ok(())
            })
            .map(|(switch, ())| switch)
    }

    /// Presentation view of the stored conditions of `key`. Empty if the switch does not exist.
    pub fn active_conditions(&self, key: &str) -> Result<Vec<ActiveCondition>> {
        Ok(self
            .store
            .lookup(key)?
            .map(|switch| switch.active_conditions(&self.registry))
            .unwrap_or_default())
    }

    /// Registered condition sets ordered by group label.
    pub fn condition_sets(&self) -> Vec<Arc<dyn ConditionSet>> {
        self.registry.condition_sets_by_label()
    }

    /// Every field of every registered condition set.
    pub fn all_conditions(&self) -> Vec<ConditionDescriptor> {
        self.registry.all_conditions()
    }

    /// Register a listener fired after every save and delete.
    pub fn subscribe(&self, listener: impl SwitchListener + 'static) {
        self.store.subscribe(listener);
    }

    /// Start a thread periodically reloading the store from its backend.
    pub fn start_refresher_thread(&self, config: RefresherThreadConfig) -> Result<RefresherThread> {
        RefresherThread::start(self.store.clone(), config)
    }

    fn condition_set(&self, id: &str) -> Result<Arc<dyn ConditionSet>> {
        self.registry
            .get(id)
            .ok_or_else(|| Error::UnknownConditionSet(id.to_owned()))
    }
}

impl std::fmt::Debug for SwitchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchManager")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
