use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use snafu::{Snafu, ensure};
use strum::AsRefStr;

static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();

#[derive(Snafu, Debug, PartialEq)]
pub enum Error {
    #[snafu(display("Cannot escape binding of type {type_name} into a SQL literal"))]
    UnsupportedBindingType { type_name: String },

    #[snafu(display(
        "The SQL contains {placeholders} placeholders, but {bindings} bindings were passed"
    ))]
    BindingCountMismatch { placeholders: usize, bindings: usize },
}

/// A value bound to a placeholder of a statement.
#[derive(Clone, Debug, PartialEq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Varchar(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Array(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &str {
        self.as_ref()
    }
}

impl From<Option<Value>> for Value {
    fn from(value: Option<Value>) -> Self {
        value.unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Varchar(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Varchar(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::Timestamp(value)
    }
}

/// Quotes `value` as a SQL string literal, doubling embedded single quotes.
pub fn quote_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Renders `value` as a literal that can be pasted into SQL text.
///
/// This only covers the scalar types whose literal syntax can not be abused. Anything
/// else (nested values, non-finite doubles) is rejected instead of being rendered in some
/// best-effort way.
pub fn escape_literal(value: &Value) -> Result<String, Error> {
    Ok(match value {
        Value::Null => "NULL".to_owned(),
        Value::Boolean(true) => "TRUE".to_owned(),
        Value::Boolean(false) => "FALSE".to_owned(),
        Value::Integer(integer) => integer.to_string(),
        // `Debug` keeps the fraction or exponent, so `1.0` does not turn into an integer literal
        Value::Double(double) if double.is_finite() => format!("{double:?}"),
        Value::Varchar(string) => quote_string(string),
        Value::Date(date) => format!("DATE '{}'", date.format("%Y-%m-%d")),
        Value::Timestamp(timestamp) => {
            format!("TIMESTAMP '{}'", timestamp.format("%Y-%m-%d %H:%M:%S%.3f"))
        }
        Value::Double(_) | Value::Array(_) => UnsupportedBindingTypeSnafu {
            type_name: value.type_name(),
        }
        .fail()?,
    })
}

/// Replaces every `%s` placeholder in `sql` with the next of the already rendered `literals`.
/// `%%` stands for a literal `%`.
pub fn substitute_placeholders(sql: &str, literals: &[String]) -> Result<String, Error> {
    let placeholder_regex = PLACEHOLDER_REGEX.get_or_init(|| Regex::new("%[%s]").unwrap());

    let placeholders = placeholder_regex
        .find_iter(sql)
        .filter(|m| m.as_str() == "%s")
        .count();
    ensure!(
        placeholders == literals.len(),
        BindingCountMismatchSnafu {
            placeholders,
            bindings: literals.len(),
        }
    );

    let mut literals = literals.iter();
    let substituted = placeholder_regex.replace_all(sql, |captures: &regex::Captures| {
        match &captures[0] {
            "%%" => "%".to_owned(),
            // The number of `%s` placeholders was checked above
            _ => literals.next().cloned().unwrap_or_default(),
        }
    });

    Ok(substituted.into_owned())
}
