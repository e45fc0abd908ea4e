use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    backend::{Backend, MemoryBackend},
    Registry, Result, SwitchManager, SwitchStatus, SwitchStore,
};

/// Static defaults applied when a switch is auto-created.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SwitchDefault {
    /// Auto-created switches are `Global` when `true`, `Disabled` otherwise.
    #[serde(default)]
    pub is_active: bool,
    /// Label given to the created switch.
    #[serde(default)]
    pub label: Option<String>,
    /// Description given to the created switch.
    #[serde(default)]
    pub description: Option<String>,
}

impl SwitchDefault {
    /// Status of a switch created from this entry.
    pub fn status(&self) -> SwitchStatus {
        if self.is_active {
            SwitchStatus::Global
        } else {
            SwitchStatus::Disabled
        }
    }
}

/// Per-key defaults table.
pub type SwitchDefaults = HashMap<String, SwitchDefault>;

/// How a [`SwitchStore`] notices writes made through other stores sharing its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    /// Never look for foreign writes. Own writes are still visible immediately.
    Never,
    /// Compare the backend generation on every read and drop the cache when it changed.
    #[default]
    OnGenerationChange,
    /// Reload the whole table once the cache is older than the interval.
    Interval(Duration),
}

/// Configuration for [`SwitchManager`].
///
/// ```
/// # use switchyard::ManagerConfig;
/// let manager = ManagerConfig::in_memory()
///     .auto_create(false)
///     .to_manager();
/// assert!(!manager.is_active("new_checkout", &[]));
/// ```
pub struct ManagerConfig {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) auto_create: bool,
    pub(crate) switch_defaults: SwitchDefaults,
    pub(crate) refresh_policy: RefreshPolicy,
}

impl ManagerConfig {
    /// Create a default configuration over the given backend.
    pub fn new(backend: impl Backend + 'static) -> ManagerConfig {
        ManagerConfig::from_backend(Arc::new(backend))
    }

    /// Create a default configuration over a shared backend.
    pub fn from_backend(backend: Arc<dyn Backend>) -> ManagerConfig {
        ManagerConfig {
            backend,
            registry: Arc::new(Registry::new()),
            auto_create: ManagerConfig::DEFAULT_AUTO_CREATE,
            switch_defaults: SwitchDefaults::new(),
            refresh_policy: RefreshPolicy::default(),
        }
    }

    /// Create a default configuration over a fresh [`MemoryBackend`].
    pub fn in_memory() -> ManagerConfig {
        ManagerConfig::new(MemoryBackend::new())
    }

    /// Default value for [`ManagerConfig::auto_create`].
    pub const DEFAULT_AUTO_CREATE: bool = true;

    /// Whether reading a missing switch through [`SwitchStore::get`] persists a new one.
    pub fn auto_create(mut self, auto_create: bool) -> ManagerConfig {
        self.auto_create = auto_create;
        self
    }

    /// Use an existing (possibly shared) registry instead of a fresh empty one.
    pub fn registry(mut self, registry: Arc<Registry>) -> ManagerConfig {
        self.registry = registry;
        self
    }

    /// Set the per-key defaults table.
    pub fn switch_defaults(mut self, switch_defaults: SwitchDefaults) -> ManagerConfig {
        self.switch_defaults = switch_defaults;
        self
    }

    /// Parse the per-key defaults table from JSON.
    ///
    /// ```
    /// # use switchyard::ManagerConfig;
    /// let config = ManagerConfig::in_memory().switch_defaults_from_json(r#"{
    ///     "active_by_default": {"is_active": true, "label": "Default Active"}
    /// }"#)?;
    /// # Ok::<(), switchyard::Error>(())
    /// ```
    pub fn switch_defaults_from_json(self, json: &str) -> Result<ManagerConfig> {
        let switch_defaults: SwitchDefaults = serde_json::from_str(json)?;
        Ok(self.switch_defaults(switch_defaults))
    }

    /// How the store picks up writes made by other stores over the same backend.
    pub fn refresh_policy(mut self, refresh_policy: RefreshPolicy) -> ManagerConfig {
        self.refresh_policy = refresh_policy;
        self
    }

    pub(crate) fn to_store(&self) -> SwitchStore {
        SwitchStore::new(self.backend.clone())
            .with_auto_create(self.auto_create)
            .with_switch_defaults(self.switch_defaults.clone())
            .with_refresh_policy(self.refresh_policy)
    }

    /// Create a new [`SwitchManager`] using this configuration.
    pub fn to_manager(self) -> SwitchManager {
        SwitchManager::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::{ManagerConfig, SwitchDefault};
    use crate::SwitchStatus;

    #[test]
    fn parses_switch_defaults() {
        let config = ManagerConfig::in_memory()
            .switch_defaults_from_json(
                r#"{
                    "active_by_default": {
                        "is_active": true,
                        "label": "Default Active",
                        "description": "When you want the newness"
                    },
                    "inactive_by_default": {"label": "Default Inactive"}
                }"#,
            )
            .unwrap();

        let active = &config.switch_defaults["active_by_default"];
        assert_eq!(active.status(), SwitchStatus::Global);
        assert_eq!(active.label.as_deref(), Some("Default Active"));

        let inactive = &config.switch_defaults["inactive_by_default"];
        assert_eq!(inactive.status(), SwitchStatus::Disabled);
        assert_eq!(inactive.description, None);
    }

    #[test]
    fn rejects_malformed_defaults() {
        assert!(ManagerConfig::in_memory()
            .switch_defaults_from_json(r#"{"x": {"is_active": "yes"}}"#)
            .is_err());
    }

    #[test]
    fn default_status_is_disabled() {
        assert_eq!(SwitchDefault::default().status(), SwitchStatus::Disabled);
    }
}
