use async_trait::async_trait;
use std::fmt::Debug;

use crate::{
    error::StoreError,
    model::{NewNotification, NotificationRecord, Subscription},
};

mod migrations;
pub mod sqlite;

pub use sqlite::SqliteStore;

/// Persistence the dispatcher reads subscriptions from and writes
/// notification history to.
#[async_trait]
pub trait SubscriptionStore: Send + Sync + Debug {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    async fn record_notification(
        &self,
        notification: &NewNotification,
    ) -> Result<NotificationRecord, StoreError>;

    /// Whether further alerts for this subscription are held back until its
    /// condition clears. Only consulted under `ResendPolicy::OncePerActivation`.
    async fn is_suppressed(&self, subscription_id: i64) -> Result<bool, StoreError>;

    async fn set_suppressed(&self, subscription_id: i64, suppressed: bool)
    -> Result<(), StoreError>;
}
