//! Error taxonomy for providers and aggregation rounds.
//!
//! Failures are tagged where they are detected: adapters produce
//! [`ProviderError`], the engine produces [`ServiceError`]. Both report an
//! [`ErrorKind`] directly. [`classify`] falls back to message matching only
//! for errors that carry no tag.

use std::fmt::Display;
use thiserror::Error;

use super::context::CancelCause;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoProviders,
    ContextCancelled,
    /// Generic upstream failure.
    ProviderFailed,
    /// Connection, timeout or upstream status failures.
    NetworkError,
    /// Body could not be parsed or failed validation.
    InvalidResponse,
    Unknown,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ErrorKind::NoProviders => "no_providers",
                ErrorKind::ContextCancelled => "context_cancelled",
                ErrorKind::ProviderFailed => "provider_failed",
                ErrorKind::NetworkError => "network_error",
                ErrorKind::InvalidResponse => "invalid_response",
                ErrorKind::Unknown => "unknown",
            }
        )
    }
}

/// Failure of a single provider fetch.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("network error from {provider}: {message}")]
    Request { provider: String, message: String },

    #[error("{provider} returned status {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("invalid response from {provider}: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("request to {provider} aborted: {cause}")]
    Cancelled {
        provider: String,
        cause: CancelCause,
    },

    #[error("provider {provider} failed: {message}")]
    Failed { provider: String, message: String },
}

impl ProviderError {
    pub fn invalid_response(provider: &str, message: impl Into<String>) -> Self {
        ProviderError::InvalidResponse {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            ProviderError::Request { provider, .. }
            | ProviderError::Status { provider, .. }
            | ProviderError::InvalidResponse { provider, .. }
            | ProviderError::Cancelled { provider, .. }
            | ProviderError::Failed { provider, .. } => provider,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Request { .. } | ProviderError::Status { .. } => ErrorKind::NetworkError,
            ProviderError::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            ProviderError::Cancelled { .. } => ErrorKind::ContextCancelled,
            ProviderError::Failed { .. } => ErrorKind::ProviderFailed,
        }
    }
}

/// Failure of a whole aggregation round, as seen by callers.
///
/// `Clone` so one round's outcome can be handed to every deduplicated waiter.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("no exchange rate providers configured")]
    NoProviders,

    #[error("rates request cancelled: {0}")]
    ContextCancelled(CancelCause),

    #[error("all {attempted} exchange rate providers failed, first error: {first}")]
    AllProvidersFailed {
        attempted: usize,
        #[source]
        first: ProviderError,
    },

    #[error("rate not found for {to} (base {from})")]
    RateNotFound { from: String, to: String },

    #[error("rates round aborted: {0}")]
    RoundAborted(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::NoProviders => ErrorKind::NoProviders,
            ServiceError::ContextCancelled(_) => ErrorKind::ContextCancelled,
            ServiceError::AllProvidersFailed { first, .. } => first.kind(),
            ServiceError::RateNotFound { .. } | ServiceError::RoundAborted(_) => ErrorKind::Unknown,
        }
    }
}

/// Classifies any error into an [`ErrorKind`].
///
/// Walks the source chain looking for a tagged error first, then matches the
/// top-level message.
pub fn classify(err: &(dyn std::error::Error + 'static)) -> ErrorKind {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(service_err) = e.downcast_ref::<ServiceError>() {
            return service_err.kind();
        }
        if let Some(provider_err) = e.downcast_ref::<ProviderError>() {
            return provider_err.kind();
        }
        current = e.source();
    }
    classify_message(&err.to_string())
}

/// Substring fallback for opaque errors.
pub fn classify_message(message: &str) -> ErrorKind {
    let message = message.to_lowercase();
    let contains_any = |tokens: &[&str]| tokens.iter().any(|t| message.contains(t));

    if contains_any(&["context canceled", "deadline exceeded"]) {
        ErrorKind::ContextCancelled
    } else if contains_any(&["network", "connection", "timeout"]) {
        ErrorKind::NetworkError
    } else if contains_any(&["invalid response", "parse"]) {
        ErrorKind::InvalidResponse
    } else {
        ErrorKind::Unknown
    }
}
