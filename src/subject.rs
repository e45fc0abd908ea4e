//! Subjects are the things a switch is evaluated against: users, requests, raw values.
//!
//! Condition sets never inspect concrete subject types. They go through the [`Subject`] adapter,
//! which exposes a kind tag, named attributes, an identity used for bucketing, and any subjects
//! embedded in this one (e.g. the authenticated user of a request).
use std::collections::HashMap;

use crate::Value;

/// Adapter between caller-side types and condition sets.
pub trait Subject {
    /// Tag identifying the kind of subject, matched by condition sets in `can_execute`.
    fn kind(&self) -> &str;

    /// Value of the named attribute, or `None` if the subject has no such attribute.
    fn attribute(&self, name: &str) -> Option<Value>;

    /// Identity used for percentage bucketing. Defaults to no identity.
    fn identity(&self) -> Value {
        Value::Null
    }

    /// Subjects carried by this one that should be evaluated alongside it.
    fn embedded_subjects(&self) -> Vec<&dyn Subject> {
        Vec::new()
    }
}

/// A raw value is a subject of kind [`Value::SUBJECT_KIND`]; it is its own identity and exposes
/// no attributes.
impl Subject for Value {
    fn kind(&self) -> &str {
        Value::SUBJECT_KIND
    }

    fn attribute(&self, _name: &str) -> Option<Value> {
        None
    }

    fn identity(&self) -> Value {
        self.clone()
    }
}

impl Value {
    /// Kind tag of raw values used as subjects.
    pub const SUBJECT_KIND: &'static str = "value";
}

/// A generic attribute-bag subject for callers that don't want a dedicated adapter type.
///
/// ```
/// # use switchyard::{Entity, Subject};
/// let account = Entity::new("billing.account", 42)
///     .with_attribute("plan", "enterprise")
///     .with_attribute("seats", 250);
/// assert_eq!(account.kind(), "billing.account");
/// assert_eq!(account.attribute("plan"), Some("enterprise".into()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    kind: String,
    id: Value,
    attributes: HashMap<String, Value>,
}

impl Entity {
    /// An entity of `kind` identified by `id`, with no attributes.
    pub fn new(kind: impl Into<String>, id: impl Into<Value>) -> Entity {
        Entity {
            kind: kind.into(),
            id: id.into(),
            attributes: HashMap::new(),
        }
    }

    /// Set an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Entity {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

impl Subject for Entity {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.clone()),
            _ => self.attributes.get(name).cloned(),
        }
    }

    fn identity(&self) -> Value {
        self.id.clone()
    }
}

/// Expand `subjects` with their embedded subjects, preserving order. Embedded subjects are
/// appended after all explicitly supplied ones.
pub(crate) fn expand<'a>(subjects: &[&'a dyn Subject]) -> Vec<&'a dyn Subject> {
    let mut expanded = subjects.to_vec();
    for &subject in subjects {
        expanded.extend(subject.embedded_subjects());
    }
    expanded
}
