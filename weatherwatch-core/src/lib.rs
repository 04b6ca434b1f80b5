//! Core library for the `weatherwatch` alert service.
//!
//! This crate defines:
//! - The condition language (`temperature:>:30`, `main:Rain`) and its evaluator
//! - Abstractions over weather providers, mail delivery and storage
//! - The notification dispatcher and its scheduler
//! - Configuration & credentials handling
//!
//! It is used by `weatherwatch-cli`, but can also be embedded in other binaries or services.

pub mod condition;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod mailer;
pub mod model;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use condition::{Attribute, Condition, Operator};
pub use config::{Config, MailerKind, ProviderConfig};
pub use dispatcher::{Dispatcher, Outcome, ResendPolicy, RunReport};
pub use error::{ConditionError, MailError, ProviderError, RegistryError, RunError, StoreError};
pub use mailer::{Email, Mailer};
pub use model::{NotificationRecord, Subscription, User, WeatherSnapshot};
pub use provider::{ProviderId, WeatherProvider};
pub use registry::{Registry, Validator};
pub use scheduler::Schedule;
pub use store::{SqliteStore, SubscriptionStore};
