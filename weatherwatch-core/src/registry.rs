//! Registration of users and subscriptions.

use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    condition::Condition,
    error::{ProviderError, RegistryError},
    model::{NewSubscription, Subscription, User},
    provider::WeatherProvider,
    store::SqliteStore,
};

/// Input checks applied before anything is persisted.
#[derive(Debug, Clone)]
pub struct Validator {
    max_len: usize,
}

impl Default for Validator {
    fn default() -> Self {
        Self { max_len: 254 }
    }
}

impl Validator {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    fn required<'a>(&self, field: &'static str, value: &'a str) -> Result<&'a str, RegistryError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(RegistryError::Invalid {
                field,
                reason: "must not be empty".into(),
            });
        }
        if value.chars().count() > self.max_len {
            return Err(RegistryError::Invalid {
                field,
                reason: format!("must be at most {} characters", self.max_len),
            });
        }
        Ok(value)
    }

    pub fn name<'a>(&self, name: &'a str) -> Result<&'a str, RegistryError> {
        self.required("name", name)
    }

    pub fn city<'a>(&self, city: &'a str) -> Result<&'a str, RegistryError> {
        self.required("city", city)
    }

    pub fn email<'a>(&self, email: &'a str) -> Result<&'a str, RegistryError> {
        let email = self.required("email", email)?;
        let invalid = || RegistryError::Invalid {
            field: "email",
            reason: format!("'{email}' is not an email address"),
        };

        let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
        let domain_ok = !domain.contains('@')
            && domain.contains('.')
            && !domain.starts_with('.')
            && !domain.ends_with('.');
        if local.is_empty() || !domain_ok || email.chars().any(char::is_whitespace) {
            return Err(invalid());
        }
        Ok(email)
    }

    pub fn condition(&self, condition: &str) -> Result<Condition, RegistryError> {
        Ok(Condition::parse(condition)?)
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    store: SqliteStore,
    provider: Arc<dyn WeatherProvider>,
    validator: Validator,
}

impl Registry {
    pub fn new(store: SqliteStore, provider: Arc<dyn WeatherProvider>, validator: Validator) -> Self {
        Self {
            store,
            provider,
            validator,
        }
    }

    pub async fn register_user(&self, name: &str, email: &str) -> Result<User, RegistryError> {
        let name = self.validator.name(name)?;
        let email = self.validator.email(email)?;

        let user = self.store.create_user(name, email).await?;
        info!(user_id = user.id, email = %user.email, "user registered");
        Ok(user)
    }

    /// Validate and store a new subscription for the user owning `email`.
    pub async fn subscribe(
        &self,
        email: &str,
        city: &str,
        condition: &str,
    ) -> Result<Subscription, RegistryError> {
        let email = self.validator.email(email)?;
        let city = self.validator.city(city)?;
        let condition = self.validator.condition(condition)?;

        let owner = self
            .store
            .user_by_email(email)
            .await?
            .ok_or_else(|| RegistryError::UnknownUser(email.to_string()))?;

        match self.provider.city_exists(city).await {
            Ok(true) => {}
            Ok(false) | Err(ProviderError::CityNotFound(_)) => {
                return Err(RegistryError::CityNotFound(city.to_string()));
            }
            Err(e) => {
                // Only a definite not-found rejects.
                warn!(city, error = %e, "could not verify city, accepting subscription");
            }
        }

        let subscription = self
            .store
            .insert_subscription(&NewSubscription {
                owner_id: owner.id,
                city: city.to_string(),
                condition,
            })
            .await?;

        info!(
            subscription_id = subscription.id,
            owner_id = owner.id,
            city = %subscription.city,
            condition = %subscription.condition,
            "subscription created"
        );
        Ok(subscription)
    }

    pub async fn unsubscribe(&self, id: i64) -> Result<(), RegistryError> {
        self.store.delete_subscription(id).await?;
        info!(subscription_id = id, "subscription deleted");
        Ok(())
    }

    pub async fn subscriptions_for(&self, email: &str) -> Result<Vec<Subscription>, RegistryError> {
        let email = self.validator.email(email)?;
        if self.store.user_by_email(email).await?.is_none() {
            return Err(RegistryError::UnknownUser(email.to_string()));
        }
        Ok(self.store.subscriptions_for_owner(email).await?)
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }
}
