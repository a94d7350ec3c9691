use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::debug;

use super::http_provider::HttpRateProvider;
use crate::core::RateProvider;
use crate::core::config::ProviderDescriptor;

/// Builds adapters for the enabled descriptors, ordered by priority.
///
/// The sort is stable, so providers sharing a priority keep their
/// configured order.
pub fn build_providers(descriptors: &[ProviderDescriptor]) -> Result<Vec<Arc<dyn RateProvider>>> {
    let mut enabled: Vec<&ProviderDescriptor> = descriptors.iter().filter(|d| d.enabled).collect();
    enabled.sort_by_key(|d| d.priority);

    enabled
        .into_iter()
        .map(|descriptor| {
            debug!(
                provider = %descriptor.name,
                priority = descriptor.priority,
                "Registering rate provider"
            );
            let provider = HttpRateProvider::new(descriptor.clone())
                .with_context(|| format!("Failed to create provider: {}", descriptor.name))?;
            Ok(Arc::new(provider) as Arc<dyn RateProvider>)
        })
        .collect()
}
