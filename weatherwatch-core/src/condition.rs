//! The condition language: `attribute:operator:operand` for numeric
//! attributes and `main:label` for the weather category.
//!
//! ```text
//! temperature:>:30
//! humidity:<=:40
//! main:Rain
//! ```

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::{error::ConditionError, model::WeatherSnapshot};

/// Numeric snapshot fields a threshold can be set on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    Temperature,
    FeelsLike,
    Humidity,
}

impl Attribute {
    pub fn as_str(&self) -> &'static str {
        match self {
            Attribute::Temperature => "temperature",
            Attribute::FeelsLike => "feels_like",
            Attribute::Humidity => "humidity",
        }
    }

    pub const fn all() -> &'static [Attribute] {
        &[Attribute::Temperature, Attribute::FeelsLike, Attribute::Humidity]
    }

    fn read(&self, snapshot: &WeatherSnapshot) -> f64 {
        match self {
            Attribute::Temperature => snapshot.temperature_c,
            Attribute::FeelsLike => snapshot.feels_like_c,
            Attribute::Humidity => f64::from(snapshot.humidity_pct),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        }
    }

    pub const fn all() -> &'static [Operator] {
        &[
            Operator::Eq,
            Operator::Ne,
            Operator::Lt,
            Operator::Le,
            Operator::Gt,
            Operator::Ge,
        ]
    }

    fn from_token(token: &str) -> Option<Self> {
        Operator::all().iter().copied().find(|op| op.as_str() == token)
    }

    /// Plain IEEE-754 comparison; `==` and `!=` compare exact values.
    #[allow(clippy::float_cmp)]
    pub fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Operator::Eq => lhs == rhs,
            Operator::Ne => lhs != rhs,
            Operator::Lt => lhs < rhs,
            Operator::Le => lhs <= rhs,
            Operator::Gt => lhs > rhs,
            Operator::Ge => lhs >= rhs,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed weather condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Condition {
    Threshold {
        attribute: Attribute,
        operator: Operator,
        value: f64,
    },
    /// Case-insensitive match on the snapshot's `main` label.
    Category { label: String },
}

impl Condition {
    pub fn parse(text: &str) -> Result<Self, ConditionError> {
        let segments: Vec<&str> = text.split(':').collect();
        if segments.len() < 2 {
            return Err(ConditionError::malformed(
                text,
                "expected at least two ':'-separated segments",
            ));
        }

        let attribute = match segments[0] {
            "main" => {
                return Ok(Condition::Category {
                    label: segments[1].to_string(),
                });
            }
            "temperature" => Attribute::Temperature,
            "feels_like" => Attribute::FeelsLike,
            "humidity" => Attribute::Humidity,
            other => {
                return Err(ConditionError::malformed(
                    text,
                    format!(
                        "unknown attribute '{other}', expected one of: main, temperature, feels_like, humidity"
                    ),
                ));
            }
        };

        if segments.len() != 3 {
            return Err(ConditionError::malformed(
                text,
                format!("'{attribute}' conditions take the form {attribute}:<operator>:<number>"),
            ));
        }

        let operator = Operator::from_token(segments[1]).ok_or_else(|| {
            ConditionError::malformed(text, format!("unknown operator '{}'", segments[1]))
        })?;

        let value = segments[2]
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| {
                ConditionError::malformed(text, format!("'{}' is not a number", segments[2]))
            })?;

        Ok(Condition::Threshold {
            attribute,
            operator,
            value,
        })
    }

    /// Whether `snapshot` satisfies this condition.
    pub fn evaluate(&self, snapshot: &WeatherSnapshot) -> bool {
        match self {
            Condition::Threshold {
                attribute,
                operator,
                value,
            } => operator.apply(attribute.read(snapshot), *value),
            Condition::Category { label } => {
                snapshot.main.to_lowercase() == label.to_lowercase()
            }
        }
    }
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Condition::parse(s)
    }
}

impl TryFrom<String> for Condition {
    type Error = ConditionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Condition::parse(&value)
    }
}

impl From<Condition> for String {
    fn from(condition: Condition) -> Self {
        condition.to_string()
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Threshold {
                attribute,
                operator,
                value,
            } => write!(f, "{attribute}:{operator}:{value}"),
            Condition::Category { label } => write!(f, "main:{label}"),
        }
    }
}
