//! Declarative description of the fields a task type accepts.
//!
//! A task type declares a static [Schema], a list of [Field]s each naming
//! whether it's required, how to derive a default and how to validate a
//! value. [Schema::read] applies it to a configuration table and collects
//! every problem instead of stopping at the first one.

use std::fmt;

use derive_more::{Display, Error};
use toml::{Table, Value};

/// Checks a configured value, returning a message on failure.
pub type Validator = fn(&Value) -> Result<(), String>;

/// Derives the value of an absent field from the whole configuration.
pub type DefaultFn = fn(&Table) -> Option<Value>;

/// A field of a task [Schema].
#[derive(Debug, Clone, Copy)]
pub struct Field {
    /// Canonical name of the field.
    pub name: &'static str,
    /// Alternative keys accepted in configurations.
    pub aliases: &'static [&'static str],
    /// Absence is an error unless a default applies.
    pub required: bool,
    pub default: Option<DefaultFn>,
    pub validator: Option<Validator>,
}

impl Field {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            aliases: &[],
            required: true,
            default: None,
            validator: None,
        }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self {
            required: false,
            ..Self::required(name)
        }
    }

    pub const fn aliases(self, aliases: &'static [&'static str]) -> Self {
        Self { aliases, ..self }
    }

    pub const fn default_with(self, default: DefaultFn) -> Self {
        Self {
            default: Some(default),
            ..self
        }
    }

    pub const fn validate_with(self, validator: Validator) -> Self {
        Self {
            validator: Some(validator),
            ..self
        }
    }

    /// Configured value, blank values count as absent.
    fn lookup<'a>(&self, config: &'a Table) -> Option<&'a Value> {
        std::iter::once(&self.name)
            .chain(self.aliases)
            .filter_map(|key| config.get(*key))
            .find(|value| !is_blank(value))
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Table(t) => t.is_empty(),
        _ => false,
    }
}

/// Fields of a task type.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    fields: &'static [Field],
}

impl Schema {
    pub const fn new(fields: &'static [Field]) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &'static [Field] {
        self.fields
    }

    /// Reads all fields from `config`.
    ///
    /// Returns the valid values keyed by canonical name together with the
    /// errors of all other fields.
    pub fn read(&self, config: &Table) -> (Table, FieldErrors) {
        let mut values = Table::new();
        let mut errors = FieldErrors::default();

        for field in self.fields {
            let value = match field.lookup(config) {
                Some(value) => value.clone(),
                None => match field.default.and_then(|default| default(config)) {
                    Some(value) => value,
                    None => {
                        if field.required {
                            errors.missing(field.name);
                        }
                        continue;
                    }
                },
            };

            if let Some(validate) = field.validator {
                if let Err(message) = validate(&value) {
                    errors.invalid(field.name, message);
                    continue;
                }
            }
            values.insert(field.name.to_string(), value);
        }

        (values, errors)
    }

    /// Re-runs the validators on already read `values`.
    pub fn revalidate(&self, values: &Table) -> FieldErrors {
        let mut errors = FieldErrors::default();
        for field in self.fields {
            let (Some(value), Some(validate)) = (values.get(field.name), field.validator) else {
                continue;
            };
            if let Err(message) = validate(value) {
                errors.invalid(field.name, message);
            }
        }
        errors
    }
}

/// Why a field failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldErrorKind {
    /// A required field is absent.
    #[display("missing")]
    Missing,
    /// The value failed validation.
    #[display("invalid")]
    Invalid,
    /// The value is structurally wrong, e.g. an unknown backend type.
    #[display("configuration")]
    Configuration,
}

/// Failure of a single field.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldError {
    pub field: String,
    pub kind: FieldErrorKind,
    pub message: String,
}

/// All field failures of a task, in schema order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error, serde::Serialize)]
pub struct FieldErrors {
    errors: Vec<FieldError>,
}

impl FieldErrors {
    pub fn push(&mut self, field: &str, kind: FieldErrorKind, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.to_string(),
            kind,
            message: message.into(),
        });
    }

    pub fn missing(&mut self, field: &str) {
        self.push(
            field,
            FieldErrorKind::Missing,
            format!("The field {field} is required"),
        );
    }

    pub fn invalid(&mut self, field: &str, message: impl Into<String>) {
        self.push(field, FieldErrorKind::Invalid, message);
    }

    pub fn configuration(&mut self, field: &str, message: impl Into<String>) {
        self.push(field, FieldErrorKind::Configuration, message);
    }

    pub fn extend(&mut self, other: FieldErrors) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.errors.iter()
    }

    /// Names of the missing required fields.
    pub fn missing_fields(&self) -> Vec<&str> {
        self.errors
            .iter()
            .filter(|e| e.kind == FieldErrorKind::Missing)
            .map(|e| e.field.as_str())
            .collect()
    }

    /// First message recorded for `field`.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.errors
            .iter()
            .find(|e| e.field == field)
            .map(|e| e.message.as_str())
    }

    /// `Ok(value)` if no error was recorded.
    pub fn into_result<T>(self, value: T) -> Result<T, FieldErrors> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl From<FieldError> for FieldErrors {
    fn from(error: FieldError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields: Vec<&str> = self.errors.iter().map(|e| e.field.as_str()).collect();
        fields.dedup();
        write!(f, "Can't validate fields: {}", fields.join(", "))?;
        for error in &self.errors {
            write!(f, "\n  {}: {}", error.field, error.message)?;
        }
        Ok(())
    }
}
