//! Condition sets bind a group of fields to a kind of subject and turn the stored conditions of a
//! switch into one [`Verdict`] per subject.
use crate::{
    field::{Field, Fields, Percent, ValueSource},
    subject::Subject,
    switch::Conditions,
    Result, Value,
};

/// Three-valued outcome of evaluating conditions.
///
/// Combination rules used throughout evaluation:
/// - `Inactive` is a veto and short-circuits.
/// - `Active` survives only if nothing vetoes.
/// - `Indifferent` means "no opinion" and never changes the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Conditions matched.
    Active,
    /// The subject is explicitly excluded, or the switch is off.
    Inactive,
    /// No condition applied.
    Indifferent,
}

impl Verdict {
    /// `Some(true)` for `Active`, `Some(false)` for `Inactive`, `None` for `Indifferent`.
    pub fn to_option(self) -> Option<bool> {
        match self {
            Verdict::Active => Some(true),
            Verdict::Inactive => Some(false),
            Verdict::Indifferent => None,
        }
    }

    /// Collapse to a boolean, substituting `default` for `Indifferent`.
    pub fn unwrap_or(self, default: bool) -> bool {
        self.to_option().unwrap_or(default)
    }
}

impl From<bool> for Verdict {
    fn from(value: bool) -> Self {
        if value {
            Verdict::Active
        } else {
            Verdict::Inactive
        }
    }
}

impl From<Option<bool>> for Verdict {
    fn from(value: Option<bool>) -> Self {
        value.map_or(Verdict::Indifferent, Verdict::from)
    }
}

/// A pluggable rule group.
///
/// Implementors provide an id and their fields; every other method has a default that matches the
/// common case and can be overridden per subject kind.
pub trait ConditionSet: Send + Sync {
    /// Globally stable identifier, used as the registry key and in administrative calls.
    fn id(&self) -> String;

    /// Storage grouping of stored conditions. Several condition sets may share a namespace.
    ///
    /// Defaults to the last path segment of [`ConditionSet::id`].
    fn namespace(&self) -> String {
        let id = self.id();
        id.rsplit("::").next().unwrap_or(&id).to_owned()
    }

    /// Declared fields, in declaration order.
    fn fields(&self) -> &Fields;

    /// Human-readable name of the group, used to order presentation.
    fn group_label(&self) -> String {
        self.namespace()
    }

    /// Whether this set can evaluate `subject`. `None` stands for "no specific subject" and is
    /// how subject-independent rules (host, current time) get evaluated.
    fn can_execute(&self, _subject: Option<&dyn Subject>) -> bool {
        true
    }

    /// Live value of `field` for `subject`.
    fn field_value(&self, subject: Option<&dyn Subject>, field: &Field) -> Value {
        let Some(subject) = subject else {
            return Value::Null;
        };
        match field.source() {
            ValueSource::Identity => subject.identity(),
            ValueSource::Attribute => subject.attribute(field.name()).unwrap_or(Value::Null),
        }
    }

    /// Evaluate the stored conditions of this set's namespace against one subject.
    ///
    /// Stored conditions for fields this set does not declare are ignored.
    fn is_active(&self, subject: Option<&dyn Subject>, conditions: &Conditions) -> Result<Verdict> {
        let Some(by_field) = conditions.get(&self.namespace()) else {
            return Ok(Verdict::Indifferent);
        };

        let mut verdict = Verdict::Indifferent;
        for field in self.fields().iter() {
            let Some(field_conditions) = by_field.get(field.name()).filter(|c| !c.is_empty())
            else {
                continue;
            };

            let value = self.field_value(subject, field);
            for condition in field_conditions {
                let matches = field.is_active(&condition.value, &value)?;
                match (matches, condition.exclude) {
                    (true, true) => return Ok(Verdict::Inactive),
                    (true, false) | (false, true) => verdict = Verdict::Active,
                    (false, false) => {}
                }
            }
        }

        Ok(verdict)
    }

    /// Evaluate against every executable subject plus the implicit "no subject".
    fn has_active_condition(
        &self,
        conditions: &Conditions,
        subjects: &[&dyn Subject],
    ) -> Result<Verdict> {
        let mut verdict = Verdict::Indifferent;
        for subject in subjects.iter().copied().map(Some).chain([None]) {
            if !self.can_execute(subject) {
                continue;
            }
            match self.is_active(subject, conditions)? {
                Verdict::Inactive => return Ok(Verdict::Inactive),
                Verdict::Active => verdict = Verdict::Active,
                Verdict::Indifferent => {}
            }
        }
        Ok(verdict)
    }
}

/// A condition set bound to one subject kind, with a `percent` field bucketing on the subject's
/// identity.
///
/// ```
/// # use switchyard::{condition_set::{ConditionSet, SubjectConditionSet}, field::{Field, Text}};
/// let accounts = SubjectConditionSet::new("billing.account")
///     .with_field(Field::new("plan", Text));
/// assert_eq!(accounts.id(), "switchyard::SubjectConditionSet(billing.account)");
/// assert_eq!(accounts.namespace(), "billing.account");
/// assert_eq!(accounts.group_label(), "Account");
/// ```
#[derive(Debug, Clone)]
pub struct SubjectConditionSet {
    kind: String,
    label: String,
    fields: Fields,
}

impl SubjectConditionSet {
    /// A condition set for subjects of `kind`, with only the base fields.
    pub fn new(kind: impl Into<String>) -> SubjectConditionSet {
        let kind = kind.into();
        SubjectConditionSet {
            label: default_label(&kind),
            kind,
            fields: SubjectConditionSet::base_fields(),
        }
    }

    /// Fields every subject-bound set starts with.
    pub fn base_fields() -> Fields {
        Fields::new().with(Field::identity("percent", Percent))
    }

    /// Add a field, replacing any field with the same name.
    pub fn with_field(mut self, field: Field) -> SubjectConditionSet {
        self.fields.insert(field);
        self
    }

    /// Override the group label shown next to this set's conditions.
    pub fn with_label(mut self, label: impl Into<String>) -> SubjectConditionSet {
        self.label = label.into();
        self
    }

    /// Subject kind this set executes for.
    pub fn kind(&self) -> &str {
        &self.kind
    }
}

fn default_label(kind: &str) -> String {
    let name = kind.rsplit('.').next().unwrap_or(kind);
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl ConditionSet for SubjectConditionSet {
    fn id(&self) -> String {
        format!("switchyard::SubjectConditionSet({})", self.kind)
    }

    fn namespace(&self) -> String {
        self.kind.clone()
    }

    fn fields(&self) -> &Fields {
        &self.fields
    }

    fn group_label(&self) -> String {
        self.label.clone()
    }

    fn can_execute(&self, subject: Option<&dyn Subject>) -> bool {
        subject.is_some_and(|subject| subject.kind() == self.kind)
    }
}
