use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

use crate::core::config::ProviderDescriptor;
use crate::core::{ProviderError, RateProvider, RateSnapshot, RequestContext, normalize_currency};

/// URL and body conventions of the upstream APIs we know by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiStyle {
    /// `{url}/{BASE}`, `{base_code, time_last_update_unix, rates}`
    ErApi,
    /// `{url}?app_id={key}&base={BASE}`, `{base, timestamp, rates}`
    OpenExchangeRates,
    /// `{url}?from={BASE}`, `{base, date, rates}`
    Frankfurter,
    /// `{url}?base={BASE}`, `{base, timestamp, rates}`
    ExchangeRateHost,
    Generic,
}

impl ApiStyle {
    fn from_name(name: &str) -> Self {
        match name {
            "erapi" => ApiStyle::ErApi,
            "openexchangerates" => ApiStyle::OpenExchangeRates,
            "frankfurter" => ApiStyle::Frankfurter,
            "exchangerate.host" => ApiStyle::ExchangeRateHost,
            _ => ApiStyle::Generic,
        }
    }
}

#[derive(Deserialize, Debug)]
struct ErApiResponse {
    #[serde(default)]
    base_code: String,
    time_last_update_unix: Option<i64>,
    #[serde(default)]
    rates: HashMap<String, f64>,
}

#[derive(Deserialize, Debug)]
struct LatestResponse {
    #[serde(default)]
    base: String,
    timestamp: Option<i64>,
    #[serde(default)]
    rates: HashMap<String, f64>,
}

#[derive(Deserialize, Debug)]
struct FrankfurterResponse {
    #[serde(default)]
    base: String,
    date: Option<String>,
    #[serde(default)]
    rates: HashMap<String, f64>,
}

#[derive(Deserialize, Debug)]
struct GenericResponse {
    #[serde(default, alias = "base_code")]
    base: String,
    #[serde(alias = "time_last_update_unix")]
    timestamp: Option<i64>,
    date: Option<String>,
    #[serde(default)]
    rates: HashMap<String, f64>,
}

/// Fields common to every schema, before validation.
struct RawRates {
    base: String,
    timestamp: Option<i64>,
    date: Option<String>,
    rates: HashMap<String, f64>,
}

/// Adapter for one upstream HTTP rate API.
pub struct HttpRateProvider {
    descriptor: ProviderDescriptor,
    style: ApiStyle,
    client: reqwest::Client,
}

impl HttpRateProvider {
    pub fn new(descriptor: ProviderDescriptor) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fxagg/", env!("CARGO_PKG_VERSION")))
            .timeout(descriptor.timeout())
            .build()?;
        Ok(HttpRateProvider {
            style: ApiStyle::from_name(&descriptor.name),
            descriptor,
            client,
        })
    }

    /// `base` must already be normalized.
    pub fn build_url(&self, base: &str) -> String {
        let url = self.descriptor.base_url.trim_end_matches('/');
        match self.style {
            ApiStyle::ErApi => format!("{url}/{base}"),
            ApiStyle::OpenExchangeRates => {
                let app_id = self.descriptor.api_key.as_deref().unwrap_or_default();
                format!("{url}?app_id={app_id}&base={base}")
            }
            ApiStyle::Frankfurter => format!("{url}?from={base}"),
            ApiStyle::ExchangeRateHost => format!("{url}?base={base}"),
            ApiStyle::Generic => {
                let separator = if url.contains('?') { '&' } else { '?' };
                format!("{url}{separator}base={base}")
            }
        }
    }

    async fn request(&self, base: &str) -> Result<RateSnapshot, ProviderError> {
        let url = self.build_url(base);
        debug!("Requesting rates from {}", url);

        let mut request = self.client.get(&url).header(ACCEPT, "application/json");
        if let Some(key) = self.descriptor.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.request_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.request_error(e))?;

        if !status.is_success() {
            return Err(ProviderError::Status {
                provider: self.descriptor.name.clone(),
                status: status.as_u16(),
                body,
            });
        }

        self.parse_body(&body, base)
    }

    fn request_error(&self, err: reqwest::Error) -> ProviderError {
        let message = if err.is_timeout() {
            format!("timeout: {err}")
        } else if err.is_connect() {
            format!("connection failed: {err}")
        } else {
            err.to_string()
        };
        ProviderError::Request {
            provider: self.descriptor.name.clone(),
            message,
        }
    }

    fn decode<T: DeserializeOwned>(&self, body: &str) -> Result<T, ProviderError> {
        serde_json::from_str(body).map_err(|e| {
            ProviderError::invalid_response(
                &self.descriptor.name,
                format!("failed to parse JSON body: {e}"),
            )
        })
    }

    fn parse_body(&self, body: &str, requested_base: &str) -> Result<RateSnapshot, ProviderError> {
        let raw = match self.style {
            ApiStyle::ErApi => {
                let data: ErApiResponse = self.decode(body)?;
                RawRates {
                    base: data.base_code,
                    timestamp: data.time_last_update_unix,
                    date: None,
                    rates: data.rates,
                }
            }
            ApiStyle::OpenExchangeRates | ApiStyle::ExchangeRateHost => {
                let data: LatestResponse = self.decode(body)?;
                RawRates {
                    base: data.base,
                    timestamp: data.timestamp,
                    date: None,
                    rates: data.rates,
                }
            }
            ApiStyle::Frankfurter => {
                let data: FrankfurterResponse = self.decode(body)?;
                RawRates {
                    base: data.base,
                    timestamp: None,
                    date: data.date,
                    rates: data.rates,
                }
            }
            ApiStyle::Generic => {
                let data: GenericResponse = self.decode(body)?;
                RawRates {
                    base: data.base,
                    timestamp: data.timestamp,
                    date: data.date,
                    rates: data.rates,
                }
            }
        };

        let base = normalize_currency(&raw.base);
        if base.is_empty() {
            return Err(ProviderError::invalid_response(
                &self.descriptor.name,
                "missing base currency",
            ));
        }
        if raw.rates.is_empty() {
            return Err(ProviderError::invalid_response(
                &self.descriptor.name,
                "empty rates",
            ));
        }
        if base != requested_base {
            warn!(
                provider = %self.descriptor.name,
                requested = requested_base,
                returned = %base,
                "Provider answered with a different base currency"
            );
        }

        Ok(RateSnapshot {
            base,
            timestamp: resolve_timestamp(raw.timestamp, raw.date.as_deref()),
            rates: raw.rates,
            provider: self.descriptor.name.clone(),
        })
    }
}

/// Numeric timestamp if present, else midnight UTC of `date`, else now.
fn resolve_timestamp(timestamp: Option<i64>, date: Option<&str>) -> i64 {
    timestamp
        .filter(|ts| *ts > 0)
        .or_else(|| {
            date.and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc().timestamp())
        })
        .unwrap_or_else(|| Utc::now().timestamp())
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn is_enabled(&self) -> bool {
        self.descriptor.enabled
    }

    fn priority(&self) -> i32 {
        self.descriptor.priority
    }

    #[instrument(
        name = "ProviderFetch",
        skip(self, ctx),
        fields(provider = %self.descriptor.name, base = %base_currency)
    )]
    async fn fetch_rates(
        &self,
        ctx: &RequestContext,
        base_currency: &str,
    ) -> Result<RateSnapshot, ProviderError> {
        let base = normalize_currency(base_currency);
        let cancelled = |cause| ProviderError::Cancelled {
            provider: self.descriptor.name.clone(),
            cause,
        };

        if let Some(cause) = ctx.err() {
            return Err(cancelled(cause));
        }

        tokio::select! {
            cause = ctx.done() => Err(cancelled(cause)),
            result = self.request(&base) => result,
        }
    }
}
