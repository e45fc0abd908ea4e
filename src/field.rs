//! Field types: the typed matching units a condition set is built from.
//!
//! A [`Field`] pairs a name and human label with a [`FieldType`] implementation. The field type
//! knows how to turn raw administrative input into a canonical stored condition (`clean`) and how
//! to decide whether a live [`Value`] satisfies a stored condition (`is_active`).
use std::{collections::HashMap, fmt::Debug, net::Ipv4Addr, sync::Arc};

use chrono::NaiveDate;

use crate::{error::ValidationError, Error, Result, Value};

/// Raw administrative input, keyed by input name (e.g. `percent[min]`).
pub type RawInputs = HashMap<String, String>;

/// Returned by [`FieldType::is_active`] when a live value has a kind the field cannot compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// Kind of value the field understands.
    pub expected: &'static str,
}

/// Matching semantics of one field. Implement this to add new kinds of conditions.
pub trait FieldType: Debug + Send + Sync {
    /// Turn raw input into a canonical stored condition.
    fn clean(&self, raw: &str) -> std::result::Result<String, ValidationError> {
        Ok(raw.to_owned())
    }

    /// Extract this field's raw input from `inputs` and clean it. Empty input yields an empty
    /// string.
    fn validate(
        &self,
        name: &str,
        inputs: &RawInputs,
    ) -> std::result::Result<String, ValidationError> {
        match inputs.get(name).filter(|raw| !raw.is_empty()) {
            Some(raw) => self.clean(raw),
            None => Ok(String::new()),
        }
    }

    /// Decide whether `value` satisfies the stored `condition`.
    fn is_active(&self, condition: &str, value: &Value) -> std::result::Result<bool, Mismatch>;

    /// Human-readable rendering of a stored condition.
    fn display(&self, _label: &str, condition: &str) -> String {
        condition.to_owned()
    }

    /// Help text shown next to the field unless the field sets its own.
    fn default_help_text(&self) -> Option<&'static str> {
        None
    }
}

/// Where a condition set reads a field's live value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueSource {
    /// The subject attribute named like the field.
    #[default]
    Attribute,
    /// The subject's identity (primary key), used for bucketing.
    Identity,
}

/// A named field within a condition set.
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    label: String,
    help_text: Option<String>,
    source: ValueSource,
    kind: Arc<dyn FieldType>,
}

impl Field {
    /// Create a field. The label defaults to the title-cased name (`is_staff` → `Is Staff`).
    pub fn new(name: impl Into<String>, kind: impl FieldType + 'static) -> Field {
        let name = name.into();
        Field {
            label: titlize(&name),
            name,
            help_text: None,
            source: ValueSource::Attribute,
            kind: Arc::new(kind),
        }
    }

    /// Create a field whose live value is the subject's identity rather than an attribute.
    pub fn identity(name: impl Into<String>, kind: impl FieldType + 'static) -> Field {
        Field {
            source: ValueSource::Identity,
            ..Field::new(name, kind)
        }
    }

    /// Set the human label. Defaults to the capitalized name.
    pub fn with_label(mut self, label: impl Into<String>) -> Field {
        self.label = label.into();
        self
    }

    /// Set the help text shown next to the field.
    pub fn with_help_text(mut self, help_text: impl Into<String>) -> Field {
        self.help_text = Some(help_text.into());
        self
    }

    /// Name of the field, unique within its condition set.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Where the live value comes from.
    pub fn source(&self) -> ValueSource {
        self.source
    }

    /// Help text, falling back to the field type's default.
    pub fn help_text(&self) -> Option<&str> {
        self.help_text
            .as_deref()
            .or_else(|| self.kind.default_help_text())
    }

    /// Canonicalize raw input into a stored condition.
    pub fn clean(&self, raw: &str) -> Result<String> {
        Ok(self.kind.clean(raw)?)
    }

    /// Like [`Field::clean`], reading the inputs this field type expects from a form.
    pub fn validate(&self, inputs: &RawInputs) -> Result<String> {
        Ok(self.kind.validate(&self.name, inputs)?)
    }

    /// Evaluate a stored condition against a live value.
    ///
    /// Fails with [`Error::TypeMismatch`] only for field types that treat a wrong value kind as a
    /// contract violation (dates). Numeric fields simply don't match.
    pub fn is_active(&self, condition: &str, value: &Value) -> Result<bool> {
        self.kind
            .is_active(condition, value)
            .map_err(|mismatch| Error::TypeMismatch {
                field: self.name.clone(),
                expected: mismatch.expected,
                found: value.kind(),
            })
    }

    /// Human-readable rendering of a stored condition, prefixed with the label.
    pub fn display(&self, condition: &str) -> String {
        self.kind.display(&self.label, condition)
    }
}

/// Ordered field declarations of a condition set.
///
/// Inserting a field whose name is already present replaces it in place, so composing a base set
/// of fields with overrides keeps the base declaration order.
#[derive(Debug, Clone, Default)]
pub struct Fields(Vec<Field>);

impl Fields {
    /// No fields.
    pub fn new() -> Fields {
        Fields::default()
    }

    /// Builder-style [`Fields::insert`].
    pub fn with(mut self, field: Field) -> Fields {
        self.insert(field);
        self
    }

    /// Builder-style merge of all fields of `base`, followed by the fields already present.
    ///
    /// ```
    /// # use switchyard::field::{Field, Fields, Percent, Text};
    /// let base = Fields::new().with(Field::new("percent", Percent));
    /// let fields = Fields::new()
    ///     .with(Field::new("username", Text))
    ///     .extending(&base);
    /// assert_eq!(fields.names().collect::<Vec<_>>(), ["percent", "username"]);
    /// ```
    pub fn extending(self, base: &Fields) -> Fields {
        let mut merged = base.clone();
        for field in self.0 {
            merged.insert(field);
        }
        merged
    }

    /// Add a field, replacing any field with the same name in place.
    pub fn insert(&mut self, field: Field) {
        match self.0.iter_mut().find(|f| f.name == field.name) {
            Some(slot) => *slot = field,
            None => self.0.push(field),
        }
    }

    /// Field named `name`.
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.0.iter().find(|f| f.name == name)
    }

    /// Fields in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.0.iter()
    }

    /// Field names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|f| f.name.as_str())
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn titlize(name: &str) -> String {
    name.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Presence flag. Any stored condition means "the live value must be truthy".
#[derive(Debug, Clone, Copy, Default)]
pub struct Boolean;

impl FieldType for Boolean {
    fn clean(&self, _raw: &str) -> std::result::Result<String, ValidationError> {
        Ok("1".to_owned())
    }

    fn is_active(&self, _condition: &str, value: &Value) -> std::result::Result<bool, Mismatch> {
        Ok(value.is_truthy())
    }

    fn display(&self, label: &str, _condition: &str) -> String {
        label.to_owned()
    }
}

/// Exact string equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct Text;

impl FieldType for Text {
    fn is_active(&self, condition: &str, value: &Value) -> std::result::Result<bool, Mismatch> {
        Ok(value.as_str() == Some(condition))
    }
}

/// String equality restricted to a fixed set of choices.
#[derive(Debug, Clone, Default)]
pub struct Choice {
    choices: Vec<String>,
}

impl Choice {
    /// A field accepting only `choices`.
    pub fn new<I, S>(choices: I) -> Choice
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Choice {
            choices: choices.into_iter().map(Into::into).collect(),
        }
    }
}

impl FieldType for Choice {
    fn clean(&self, raw: &str) -> std::result::Result<String, ValidationError> {
        if self.choices.iter().any(|c| c == raw) {
            Ok(raw.to_owned())
        } else {
            Err(ValidationError::new(format!(
                "Select one of: {}.",
                self.choices.join(", ")
            )))
        }
    }

    fn is_active(&self, condition: &str, value: &Value) -> std::result::Result<bool, Mismatch> {
        Ok(value
            .as_str()
            .is_some_and(|v| v == condition && self.choices.iter().any(|c| c == v)))
    }
}

/// IPv4 literal compared by string equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpAddress;

impl FieldType for IpAddress {
    fn clean(&self, raw: &str) -> std::result::Result<String, ValidationError> {
        raw.parse::<Ipv4Addr>()
            .map(|ip| ip.to_string())
            .map_err(|_| ValidationError::new("Enter a valid IPv4 address."))
    }

    fn is_active(&self, condition: &str, value: &Value) -> std::result::Result<bool, Mismatch> {
        Text.is_active(condition, value)
    }
}

/// Inclusive integer range stored as `"min-max"`. Non-numeric live values never match.
#[derive(Debug, Clone, Copy, Default)]
pub struct Range;

impl Range {
    fn bounds(condition: &str) -> Option<(i64, i64)> {
        let (min, max) = condition.split_once('-')?;
        Some((min.parse().ok()?, max.parse().ok()?))
    }

    fn validate_range(
        field: &dyn FieldType,
        name: &str,
        inputs: &RawInputs,
    ) -> std::result::Result<String, ValidationError> {
        let min = inputs.get(&format!("{name}[min]")).map_or("", String::as_str);
        let max = inputs.get(&format!("{name}[max]")).map_or("", String::as_str);

        let raw = if !min.is_empty() && !max.is_empty() {
            format!("{min}-{max}")
        } else {
            String::new()
        };

        field.clean(&raw)
    }
}

impl FieldType for Range {
    fn clean(&self, raw: &str) -> std::result::Result<String, ValidationError> {
        let error = || {
            ValidationError::new("You must enter two valid integer values separated by a dash.")
        };

        let bounds = raw
            .split('-')
            .map(|part| part.parse::<i64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| error())?;

        match bounds.as_slice() {
            [min, max] => Ok(format!("{min}-{max}")),
            _ => Err(error()),
        }
    }

    fn validate(
        &self,
        name: &str,
        inputs: &RawInputs,
    ) -> std::result::Result<String, ValidationError> {
        Range::validate_range(self, name, inputs)
    }

    fn is_active(&self, condition: &str, value: &Value) -> std::result::Result<bool, Mismatch> {
        let (Some(value), Some((min, max))) = (value.as_f64(), Range::bounds(condition)) else {
            return Ok(false);
        };
        Ok(min as f64 <= value && value <= max as f64)
    }

    fn display(&self, label: &str, condition: &str) -> String {
        match Range::bounds(condition) {
            Some((min, max)) => format!("{label}: {min}-{max}"),
            None => format!("{label}: {condition}"),
        }
    }
}

/// Percentage bucket stored as `"min-max"` within `0..=100`.
///
/// The live value is an integer bucket id (primary key, folded address) reduced modulo 100.
/// String ids are folded into a bucket through md5 first.
#[derive(Debug, Clone, Copy, Default)]
pub struct Percent;

impl Percent {
    fn bucket(value: &Value) -> Option<f64> {
        match value {
            Value::Integer(i) => Some(i.rem_euclid(100) as f64),
            Value::Number(n) if n.is_finite() => Some(n.rem_euclid(100.0)),
            Value::String(s) => Some(md5_bucket(s) as f64),
            _ => None,
        }
    }
}

/// Stable bucket in `0..100` for a string id: the first four bytes of its md5 digest.
fn md5_bucket(input: &str) -> u64 {
    let digest = md5::compute(input);
    u64::from(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])) % 100
}

impl FieldType for Percent {
    fn clean(&self, raw: &str) -> std::result::Result<String, ValidationError> {
        let value = Range.clean(raw)?;
        let (min, max) = Range::bounds(&value).ok_or_else(|| {
            ValidationError::new("You must enter two valid integer values separated by a dash.")
        })?;

        if !(0..=100).contains(&min) || !(0..=100).contains(&max) {
            return Err(ValidationError::new("You must enter values between 0 and 100."));
        }
        if min > max {
            return Err(ValidationError::new("Start value must be less than end value."));
        }

        Ok(value)
    }

    fn validate(
        &self,
        name: &str,
        inputs: &RawInputs,
    ) -> std::result::Result<String, ValidationError> {
        Range::validate_range(self, name, inputs)
    }

    fn is_active(&self, condition: &str, value: &Value) -> std::result::Result<bool, Mismatch> {
        let (Some(bucket), Some((min, max))) = (Percent::bucket(value), Range::bounds(condition))
        else {
            return Ok(false);
        };
        Ok(min as f64 <= bucket && bucket <= max as f64)
    }

    fn display(&self, label: &str, condition: &str) -> String {
        match Range::bounds(condition) {
            Some((min, max)) => format!("{label}: {}% ({min}-{max})", max - min),
            None => format!("{label}: {condition}"),
        }
    }

    /// Help text shown next to the field unless the field sets its own.
    fn default_help_text(&self) -> Option<&'static str> {
        Some("Enter two ranges. e.g. 0-50 is lower 50%")
    }
}

const DATE_FORMAT: &str = "%Y-%m-%d";
const PRETTY_DATE_FORMAT: &str = "%d %b %Y";

fn clean_date(raw: &str) -> std::result::Result<String, ValidationError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map(|date| date.format(DATE_FORMAT).to_string())
        .map_err(|err| {
            ValidationError::new(format!(
                "Date must be a valid date in the format YYYY-MM-DD.\n({err})"
            ))
        })
}

fn display_date(label: &str, condition: &str) -> String {
    match NaiveDate::parse_from_str(condition, DATE_FORMAT) {
        Ok(date) => format!("{label}: {}", date.format(PRETTY_DATE_FORMAT)),
        Err(_) => format!("{label}: {condition}"),
    }
}

/// Compare a live date against a stored one. Non-date live values are a contract violation.
fn compare_date(
    condition: &str,
    value: &Value,
    op: fn(NaiveDate, NaiveDate) -> bool,
) -> std::result::Result<bool, Mismatch> {
    let value = value.as_date().ok_or(Mismatch { expected: "date" })?;
    Ok(NaiveDate::parse_from_str(condition, DATE_FORMAT).is_ok_and(|stored| op(value, stored)))
}

/// Active when the live date is strictly before the stored date.
#[derive(Debug, Clone, Copy, Default)]
pub struct BeforeDate;

impl FieldType for BeforeDate {
    fn clean(&self, raw: &str) -> std::result::Result<String, ValidationError> {
        clean_date(raw)
    }

    fn is_active(&self, condition: &str, value: &Value) -> std::result::Result<bool, Mismatch> {
        compare_date(condition, value, |value, stored| value < stored)
    }

    fn display(&self, label: &str, condition: &str) -> String {
        display_date(label, condition)
    }
}

/// Active when the live date is on or after the stored date.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnOrAfterDate;

impl FieldType for OnOrAfterDate {
    fn clean(&self, raw: &str) -> std::result::Result<String, ValidationError> {
        clean_date(raw)
    }

    fn is_active(&self, condition: &str, value: &Value) -> std::result::Result<bool, Mismatch> {
        compare_date(condition, value, |value, stored| value >= stored)
    }

    fn display(&self, label: &str, condition: &str) -> String {
        display_date(label, condition)
    }
}
