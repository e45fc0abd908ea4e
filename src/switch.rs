use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    condition_set::ConditionSet, field::RawInputs, registry::Registry, Error, Result,
};

/// Stored conditions of a switch: namespace → field name → ordered conditions.
pub type Conditions = BTreeMap<String, BTreeMap<String, Vec<StoredCondition>>>;

/// Status of a switch. Transitions only happen through explicit mutation.
///
/// Serialized as an integer: `Disabled = 1`, `Selective = 2`, `Global = 3`, `Inherit = 4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SwitchStatus {
    /// Inactive for everyone.
    Disabled,
    /// Active only when stored conditions match.
    Selective,
    /// Active for everyone.
    Global,
    /// Defers to the nearest ancestor.
    Inherit,
}

impl From<SwitchStatus> for u8 {
    fn from(value: SwitchStatus) -> u8 {
        match value {
            SwitchStatus::Disabled => 1,
            SwitchStatus::Selective => 2,
            SwitchStatus::Global => 3,
            SwitchStatus::Inherit => 4,
        }
    }
}

impl TryFrom<u8> for SwitchStatus {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<SwitchStatus, String> {
        match value {
            1 => Ok(SwitchStatus::Disabled),
            2 => Ok(SwitchStatus::Selective),
            3 => Ok(SwitchStatus::Global),
            4 => Ok(SwitchStatus::Inherit),
            other => Err(format!("invalid switch status: {other}")),
        }
    }
}

/// One configured rule value. Serialized as `[exclude, value]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(bool, String)", into = "(bool, String)")]
pub struct StoredCondition {
    /// `true` means "active unless this matches".
    pub exclude: bool,
    /// Canonical stored condition string, as produced by the field's `clean`.
    pub value: String,
}

impl StoredCondition {
    /// A cleaned condition value, optionally excluding matches.
    pub fn new(value: impl Into<String>, exclude: bool) -> StoredCondition {
        StoredCondition {
            exclude,
            value: value.into(),
        }
    }
}

impl From<(bool, String)> for StoredCondition {
    fn from((exclude, value): (bool, String)) -> Self {
        StoredCondition { exclude, value }
    }
}

impl From<StoredCondition> for (bool, String) {
    fn from(value: StoredCondition) -> Self {
        (value.exclude, value.value)
    }
}

/// A persisted feature switch.
///
/// Keys may contain a colon-separated hierarchy (`"parent:child"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Switch {
    /// Unique key.
    pub key: String,
    /// How the switch is evaluated.
    pub status: SwitchStatus,
    /// Stored conditions by namespace and field.
    #[serde(default)]
    pub conditions: Conditions,
    /// Human label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// When the switch was first saved.
    #[serde(default = "Utc::now")]
    pub date_created: DateTime<Utc>,
}

/// A stored condition resolved against the registry, ready for presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveCondition {
    /// Id of the condition set.
    pub condition_set: String,
    /// Group label of the condition set.
    pub group_label: String,
    /// Name of the field.
    pub field: String,
    /// Stored condition value.
    pub value: String,
    /// Human-readable rendering of the condition.
    pub display: String,
    /// Whether matching subjects are excluded rather than included.
    pub exclude: bool,
}

impl Switch {
    /// Create a switch with no conditions.
    pub fn new(key: impl Into<String>, status: SwitchStatus) -> Switch {
        Switch {
            key: key.into(),
            status,
            conditions: Conditions::new(),
            label: None,
            description: None,
            date_created: Utc::now(),
        }
    }

    /// Set the human label.
    pub fn with_label(mut self, label: impl Into<String>) -> Switch {
        self.label = Some(label.into());
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Switch {
        self.description = Some(description.into());
        self
    }

    /// Whether at least one condition is stored under any namespace.
    pub fn has_conditions(&self) -> bool {
        self.conditions
            .values()
            .flat_map(|by_field| by_field.values())
            .any(|field_conditions| !field_conditions.is_empty())
    }

    /// Parent key in the hierarchy, if any (`"a:b:c"` → `"a:b"`).
    pub fn parent_key(&self) -> Option<&str> {
        parent_key(&self.key)
    }

    /// Clean `raw` through the named field of `condition_set` and store it.
    ///
    /// Adding a condition that is already present is a no-op.
    pub fn add_condition(
        &mut self,
        condition_set: &dyn ConditionSet,
        field_name: &str,
        raw: &str,
        exclude: bool,
    ) -> Result<()> {
        let field = condition_set
            .fields()
            .get(field_name)
            .ok_or_else(|| unknown_field(condition_set, field_name))?;
        let value = field.clean(raw)?;
        self.push_condition(condition_set, field_name, value, exclude);
        Ok(())
    }

    /// Like [`Switch::add_condition`], reading the field's raw input from a form-style mapping
    /// (e.g. `percent[min]` / `percent[max]` for ranges).
    pub fn add_condition_from_inputs(
        &mut self,
        condition_set: &dyn ConditionSet,
        field_name: &str,
        inputs: &RawInputs,
        exclude: bool,
    ) -> Result<()> {
        let field = condition_set
            .fields()
            .get(field_name)
            .ok_or_else(|| unknown_field(condition_set, field_name))?;
        let value = field.validate(inputs)?;
        if value.is_empty() {
            return Err(crate::error::ValidationError::new(format!(
                "A value is required for {}.",
                field.label()
            ))
            .into());
        }
        self.push_condition(condition_set, field_name, value, exclude);
        Ok(())
    }

    fn push_condition(
        &mut self,
        condition_set: &dyn ConditionSet,
        field_name: &str,
        value: String,
        exclude: bool,
    ) {
        let field_conditions = self
            .conditions
            .entry(condition_set.namespace())
            .or_default()
            .entry(field_name.to_owned())
            .or_default();

        let condition = StoredCondition::new(value, exclude);
        if !field_conditions.contains(&condition) {
            field_conditions.push(condition);
        }
    }

    /// Remove every stored condition of the field with the given stored value. Returns whether
    /// anything was removed.
    pub fn remove_condition(
        &mut self,
        condition_set: &dyn ConditionSet,
        field_name: &str,
        value: &str,
    ) -> bool {
        let namespace = condition_set.namespace();
        let Some(by_field) = self.conditions.get_mut(&namespace) else {
            return false;
        };
        let Some(field_conditions) = by_field.get_mut(field_name) else {
            return false;
        };

        let before = field_conditions.len();
        field_conditions.retain(|condition| condition.value != value);
        let removed = field_conditions.len() != before;

        if field_conditions.is_empty() {
            by_field.remove(field_name);
        }
        if by_field.is_empty() {
            self.conditions.remove(&namespace);
        }
        removed
    }

    /// Remove all conditions of one field, or of the whole namespace when `field_name` is `None`.
    pub fn clear_conditions(&mut self, condition_set: &dyn ConditionSet, field_name: Option<&str>) {
        let namespace = condition_set.namespace();
        match field_name {
            None => {
                self.conditions.remove(&namespace);
            }
            Some(field_name) => {
                if let Some(by_field) = self.conditions.get_mut(&namespace) {
                    by_field.remove(field_name);
                    if by_field.is_empty() {
                        self.conditions.remove(&namespace);
                    }
                }
            }
        }
    }

    /// List stored conditions whose condition set and field are still registered, grouped in
    /// registry presentation order.
    pub fn active_conditions(&self, registry: &Registry) -> Vec<ActiveCondition> {
        let mut result = Vec::new();
        for condition_set in registry.condition_sets_by_label() {
            let Some(by_field) = self.conditions.get(&condition_set.namespace()) else {
                continue;
            };
            for field in condition_set.fields().iter() {
                for condition in by_field.get(field.name()).into_iter().flatten() {
                    result.push(ActiveCondition {
                        condition_set: condition_set.id(),
                        group_label: condition_set.group_label(),
                        field: field.name().to_owned(),
                        value: condition.value.clone(),
                        display: field.display(&condition.value),
                        exclude: condition.exclude,
                    });
                }
            }
        }
        result
    }
}

pub(crate) fn parent_key(key: &str) -> Option<&str> {
    key.rsplit_once(':').map(|(parent, _)| parent)
}

fn unknown_field(condition_set: &dyn ConditionSet, field_name: &str) -> Error {
    Error::UnknownField {
        condition_set: condition_set.id(),
        field: field_name.to_owned(),
    }
}
