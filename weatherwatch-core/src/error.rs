use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A textual condition that does not follow `attribute:operator:operand`
/// (or `main:label`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("malformed condition '{input}': {reason}")]
    Malformed { input: String, reason: String },
}

impl ConditionError {
    pub(crate) fn malformed(input: &str, reason: impl Into<String>) -> Self {
        ConditionError::Malformed {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("city '{0}' not found")]
    CityNotFound(String),

    #[error("{provider} request failed: {source}")]
    Request {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} request failed with status {status}: {body}")]
    Status {
        provider: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("failed to parse {provider} response: {source}")]
    Decode {
        provider: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("failed to reach mail service: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("mail service rejected message to {to} with status {status}: {body}")]
    Rejected {
        to: String,
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[source] BoxError),

    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} {key} already exists")]
    Conflict { entity: &'static str, key: String },
}

impl StoreError {
    pub(crate) fn database(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Database(Box::new(err))
    }
}

/// Errors returned to callers registering users and subscriptions.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error(transparent)]
    MalformedCondition(#[from] ConditionError),

    #[error("no user registered with email '{0}'")]
    UnknownUser(String),

    #[error("city '{0}' not found")]
    CityNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The single failure that aborts a dispatcher run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to list subscriptions: {0}")]
    ListSubscriptions(#[source] StoreError),
}
