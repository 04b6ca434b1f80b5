//! SQLite-backed store.
//!
//! Every statement runs on the single background thread owned by the
//! tokio-rusqlite connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{ErrorCode, OptionalExtension, Row, params, types::Type};
use std::path::Path;
use tracing::{debug, info};

use crate::{
    error::StoreError,
    model::{NewNotification, NewSubscription, NotificationRecord, Subscription, User},
};

use super::{SubscriptionStore, migrations};

const SUBSCRIPTION_COLUMNS: &str =
    "s.id, s.user_id, u.email, s.city, s.condition FROM subscriptions s JOIN users u ON u.id = s.user_id";

fn map_tr_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> StoreError {
    StoreError::database(e)
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        owner_email: row.get(2)?,
        city: row.get(3)?,
        condition: row.get(4)?,
    })
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationRecord> {
    let sent_at: String = row.get(3)?;
    let sent_at = DateTime::parse_from_rfc3339(&sent_at)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);

    Ok(NotificationRecord {
        id: row.get(0)?,
        subscription_id: row.get(1)?,
        owner_id: row.get(2)?,
        sent_at,
    })
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the database file and ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(StoreError::database)?;
        }

        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(StoreError::database)?;
        let store = Self { conn };
        store.init().await?;

        info!(path = %path.display(), "database opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(StoreError::database)?;
        let store = Self { conn };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"))
            .await
            .map_err(map_tr_err)?;

        let report = self
            .conn
            .call(migrations::run)
            .await
            .map_err(StoreError::database)?;
        for migration in report.applied_migrations() {
            info!(version = migration.version(), name = migration.name(), "migration applied");
        }
        Ok(())
    }

    pub async fn create_user(&self, name: &str, email: &str) -> Result<User, StoreError> {
        let (name, email) = (name.to_string(), email.to_string());
        let key = email.clone();

        let inserted = self
            .conn
            .call(move |conn| {
                let result = conn.execute(
                    "INSERT INTO users (name, email) VALUES (?1, ?2)",
                    params![name, email],
                );
                match result {
                    Ok(_) => Ok(Some(User {
                        id: conn.last_insert_rowid(),
                        name,
                        email,
                    })),
                    Err(e) if is_constraint_violation(&e) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(map_tr_err)?;

        inserted.ok_or(StoreError::Conflict { entity: "user", key })
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let email = email.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, name, email FROM users WHERE email = ?1",
                    params![email],
                    |row| {
                        Ok(User {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            email: row.get(2)?,
                        })
                    },
                )
                .optional()
            })
            .await
            .map_err(map_tr_err)
    }

    pub async fn insert_subscription(
        &self,
        subscription: &NewSubscription,
    ) -> Result<Subscription, StoreError> {
        let owner_id = subscription.owner_id;
        let city = subscription.city.clone();
        let condition = subscription.condition.to_string();

        let inserted = self
            .conn
            .call(move |conn| {
                match conn.execute(
                    "INSERT INTO subscriptions (user_id, city, condition) VALUES (?1, ?2, ?3)",
                    params![owner_id, city, condition],
                ) {
                    Ok(_) => {}
                    Err(e) if is_constraint_violation(&e) => return Ok(None),
                    Err(e) => return Err(e),
                }
                let id = conn.last_insert_rowid();
                conn.query_row(
                    &format!("SELECT {SUBSCRIPTION_COLUMNS} WHERE s.id = ?1"),
                    params![id],
                    subscription_from_row,
                )
                .map(Some)
            })
            .await
            .map_err(map_tr_err)?;

        let created = inserted.ok_or(StoreError::NotFound {
            entity: "user",
            key: owner_id.to_string(),
        })?;
        debug!(subscription_id = created.id, city = %created.city, "subscription stored");
        Ok(created)
    }

    pub async fn subscription(&self, id: i64) -> Result<Option<Subscription>, StoreError> {
        self.conn
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {SUBSCRIPTION_COLUMNS} WHERE s.id = ?1"),
                    params![id],
                    subscription_from_row,
                )
                .optional()
            })
            .await
            .map_err(map_tr_err)
    }

    pub async fn subscriptions_for_owner(
        &self,
        email: &str,
    ) -> Result<Vec<Subscription>, StoreError> {
        let email = email.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SUBSCRIPTION_COLUMNS} WHERE u.email = ?1 ORDER BY s.id"
                ))?;
                let rows = stmt.query_map(params![email], subscription_from_row)?;
                rows.collect()
            })
            .await
            .map_err(map_tr_err)
    }

    /// Delete a subscription together with its history and state.
    pub async fn delete_subscription(&self, id: i64) -> Result<(), StoreError> {
        let deleted = self
            .conn
            .call(move |conn| conn.execute("DELETE FROM subscriptions WHERE id = ?1", params![id]))
            .await
            .map_err(map_tr_err)?;

        if deleted == 0 {
            return Err(StoreError::NotFound {
                entity: "subscription",
                key: id.to_string(),
            });
        }
        Ok(())
    }

    /// Notification history, newest first, optionally for one subscription.
    pub async fn notifications(
        &self,
        subscription_id: Option<i64>,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, subscription_id, user_id, sent_at FROM notifications
                     WHERE ?1 IS NULL OR subscription_id = ?1
                     ORDER BY sent_at DESC, id DESC",
                )?;
                let rows = stmt.query_map(params![subscription_id], notification_from_row)?;
                rows.collect()
            })
            .await
            .map_err(map_tr_err)
    }
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {SUBSCRIPTION_COLUMNS} ORDER BY s.id"))?;
                let rows = stmt.query_map([], subscription_from_row)?;
                rows.collect()
            })
            .await
            .map_err(map_tr_err)
    }

    async fn record_notification(
        &self,
        notification: &NewNotification,
    ) -> Result<NotificationRecord, StoreError> {
        let record = notification.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO notifications (user_id, subscription_id, sent_at)
                     VALUES (?1, ?2, ?3)",
                    params![
                        record.owner_id,
                        record.subscription_id,
                        record.sent_at.to_rfc3339()
                    ],
                )?;
                Ok(NotificationRecord {
                    id: conn.last_insert_rowid(),
                    subscription_id: record.subscription_id,
                    owner_id: record.owner_id,
                    sent_at: record.sent_at,
                })
            })
            .await
            .map_err(map_tr_err)
    }

    async fn is_suppressed(&self, subscription_id: i64) -> Result<bool, StoreError> {
        self.conn
            .call(move |conn| {
                let suppressed: Option<bool> = conn
                    .query_row(
                        "SELECT suppressed FROM subscription_state WHERE subscription_id = ?1",
                        params![subscription_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(suppressed.unwrap_or(false))
            })
            .await
            .map_err(map_tr_err)
    }

    async fn set_suppressed(
        &self,
        subscription_id: i64,
        suppressed: bool,
    ) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO subscription_state (subscription_id, suppressed) VALUES (?1, ?2)
                     ON CONFLICT(subscription_id) DO UPDATE SET suppressed = excluded.suppressed",
                    params![subscription_id, suppressed],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use chrono::TimeZone;

    async fn store_with_user() -> (SqliteStore, User) {
        let store = SqliteStore::open_in_memory().await.expect("in-memory db");
        let user = store
            .create_user("Ann", "ann@example.com")
            .await
            .expect("user created");
        (store, user)
    }

    fn new_sub(owner_id: i64, city: &str, cond: &str) -> NewSubscription {
        NewSubscription {
            owner_id,
            city: city.into(),
            condition: Condition::parse(cond).unwrap(),
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_conflict() {
        let (store, _) = store_with_user().await;
        let err = store.create_user("Other", "ann@example.com").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { entity: "user", .. }));
    }

    #[tokio::test]
    async fn finds_user_by_email() {
        let (store, user) = store_with_user().await;
        assert_eq!(store.user_by_email("ann@example.com").await.unwrap(), Some(user));
        assert_eq!(store.user_by_email("bob@example.com").await.unwrap(), None);
    }

    #[tokio::test]
    async fn subscriptions_carry_owner_email() {
        let (store, user) = store_with_user().await;
        let created = store
            .insert_subscription(&new_sub(user.id, "Lviv", "temperature:>:30"))
            .await
            .unwrap();
        store
            .insert_subscription(&new_sub(user.id, "Kyiv", "main:Rain"))
            .await
            .unwrap();

        assert_eq!(created.owner_email, "ann@example.com");
        assert_eq!(created.condition, "temperature:>:30");

        let all = store.list_subscriptions().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].city, "Kyiv");
        assert_eq!(all[1].parsed_condition().unwrap(), Condition::Category { label: "Rain".into() });

        let owned = store.subscriptions_for_owner("ann@example.com").await.unwrap();
        assert_eq!(owned, all);
        assert_eq!(store.subscription(created.id).await.unwrap(), Some(created));
    }

    #[tokio::test]
    async fn subscription_for_missing_user_is_not_found() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let err = store
            .insert_subscription(&new_sub(42, "Lviv", "humidity:>:50"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "user", .. }));
    }

    #[tokio::test]
    async fn records_and_lists_notifications() {
        let (store, user) = store_with_user().await;
        let a = store
            .insert_subscription(&new_sub(user.id, "Lviv", "temperature:>:30"))
            .await
            .unwrap();
        let b = store
            .insert_subscription(&new_sub(user.id, "Kyiv", "main:Rain"))
            .await
            .unwrap();

        let t1 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
        for (sub, at) in [(&a, t1), (&a, t2), (&b, t1)] {
            store
                .record_notification(&NewNotification {
                    subscription_id: sub.id,
                    owner_id: user.id,
                    sent_at: at,
                })
                .await
                .unwrap();
        }

        let all = store.notifications(None).await.unwrap();
        assert_eq!(all.len(), 3);

        let for_a = store.notifications(Some(a.id)).await.unwrap();
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].sent_at, t2);
        assert_eq!(for_a[1].sent_at, t1);
        assert!(for_a.iter().all(|n| n.owner_id == user.id));
    }

    #[tokio::test]
    async fn delete_cascades_history() {
        let (store, user) = store_with_user().await;
        let sub = store
            .insert_subscription(&new_sub(user.id, "Lviv", "temperature:>:30"))
            .await
            .unwrap();
        store
            .record_notification(&NewNotification {
                subscription_id: sub.id,
                owner_id: user.id,
                sent_at: Utc::now(),
            })
            .await
            .unwrap();
        store.set_suppressed(sub.id, true).await.unwrap();

        store.delete_subscription(sub.id).await.unwrap();

        assert!(store.list_subscriptions().await.unwrap().is_empty());
        assert!(store.notifications(None).await.unwrap().is_empty());
        assert!(!store.is_suppressed(sub.id).await.unwrap());

        let err = store.delete_subscription(sub.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "subscription", .. }));
    }

    #[tokio::test]
    async fn suppression_flag_round_trips() {
        let (store, user) = store_with_user().await;
        let sub = store
            .insert_subscription(&new_sub(user.id, "Lviv", "main:Clear"))
            .await
            .unwrap();

        assert!(!store.is_suppressed(sub.id).await.unwrap());
        store.set_suppressed(sub.id, true).await.unwrap();
        assert!(store.is_suppressed(sub.id).await.unwrap());
        store.set_suppressed(sub.id, false).await.unwrap();
        assert!(!store.is_suppressed(sub.id).await.unwrap());
    }

    #[tokio::test]
    async fn record_for_unknown_subscription_fails() {
        let (store, user) = store_with_user().await;
        let err = store
            .record_notification(&NewNotification {
                subscription_id: 999,
                owner_id: user.id,
                sent_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[tokio::test]
    async fn open_creates_file() {
        let dir = std::env::temp_dir().join(format!("weatherwatch-test-{}", std::process::id()));
        let path = dir.join("nested").join("ww.db");
        let store = SqliteStore::open(&path).await.expect("file db");
        store.create_user("Ann", "ann@example.com").await.unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path).await.expect("reopen");
        assert!(reopened.user_by_email("ann@example.com").await.unwrap().is_some());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn migrations_apply_once() {
        let dir = std::env::temp_dir().join(format!("weatherwatch-migrate-{}", std::process::id()));
        let path = dir.join("ww.db");
        drop(SqliteStore::open(&path).await.expect("first open"));
        let store = SqliteStore::open(&path).await.expect("second open");

        let versions: Vec<i64> = store
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT version FROM refinery_schema_history ORDER BY version")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<i64>>>()
            })
            .await
            .map_err(map_tr_err)
            .unwrap();
        assert_eq!(versions, vec![1]);
        let _ = std::fs::remove_dir_all(dir);
    }
}
