//! Core types shared by providers, the engine and the outer layers

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod log;
pub mod rates;

// Re-export main types for cleaner imports
pub use cache::CacheSlot;
pub use context::{CancelCause, RequestContext};
pub use error::{ErrorKind, ProviderError, ServiceError, classify};
pub use rates::{Conversion, ProviderStatus, RateProvider, RateSnapshot, normalize_currency};
