//! Rate snapshot types and the provider abstraction

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::context::RequestContext;
use super::error::ProviderError;

/// One immutable set of exchange rates fetched from a single provider.
///
/// A snapshot returned by a provider always has a non-blank `base` and at
/// least one entry in `rates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateSnapshot {
    pub base: String,
    /// Unix seconds the provider reports as the effective time of the rates.
    pub timestamp: i64,
    pub rates: HashMap<String, f64>,
    pub provider: String,
}

impl RateSnapshot {
    pub fn rate_for(&self, currency: &str) -> Option<f64> {
        self.rates.get(&currency.trim().to_uppercase()).copied()
    }
}

/// Introspection record for the provider status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub from: String,
    pub to: String,
    pub amount: f64,
    pub rate: f64,
    pub converted: f64,
    pub provider: String,
}

#[async_trait]
pub trait RateProvider: Send + Sync {
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    fn priority(&self) -> i32;

    async fn fetch_rates(
        &self,
        ctx: &RequestContext,
        base_currency: &str,
    ) -> Result<RateSnapshot, ProviderError>;

    fn status(&self) -> ProviderStatus {
        ProviderStatus {
            name: self.name().to_string(),
            enabled: self.is_enabled(),
            priority: self.priority(),
        }
    }
}

/// Uppercases and trims a currency code the way every lookup expects it.
pub fn normalize_currency(code: &str) -> String {
    code.trim().to_uppercase()
}
