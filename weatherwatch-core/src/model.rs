use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{condition::Condition, error::ConditionError};

/// Current weather for a city, as returned by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub city: String,
    pub temperature_c: f64,
    pub feels_like_c: f64,
    pub humidity_pct: u8,
    /// Short category label, e.g. "Rain" or "Clear".
    pub main: String,
    pub description: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub owner_id: i64,
    pub owner_email: String,
    pub city: String,
    /// Condition in its textual form, e.g. "temperature:>:30".
    pub condition: String,
}

impl Subscription {
    /// Parse the stored condition text.
    ///
    /// Conditions are validated on registration, but rows written by other
    /// tools may still carry text that no longer parses.
    pub fn parsed_condition(&self) -> Result<Condition, ConditionError> {
        self.condition.parse()
    }
}

/// A subscription waiting to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscription {
    pub owner_id: i64,
    pub city: String,
    pub condition: Condition,
}

/// Append-only fact that an alert was delivered for a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub subscription_id: i64,
    pub owner_id: i64,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub subscription_id: i64,
    pub owner_id: i64,
    pub sent_at: DateTime<Utc>,
}
