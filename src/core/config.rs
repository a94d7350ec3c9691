use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use std::{fs, path::PathBuf};
use tracing::debug;

/// Environment variable names a provider reads its overrides from.
///
/// Most fields are `{prefix}_ENABLED`, `{prefix}_TIMEOUT` and so on, but the
/// built-in providers name their URL and key variables individually.
struct ProviderEnv<'a> {
    prefix: &'a str,
    base_url: &'a str,
    api_key: &'a str,
}

struct BuiltinProvider {
    name: &'static str,
    url: &'static str,
    priority: i32,
    env: ProviderEnv<'static>,
}

const BUILTIN_PROVIDERS: [BuiltinProvider; 4] = [
    BuiltinProvider {
        name: "erapi",
        url: "https://open.er-api.com/v6/latest",
        priority: 1,
        env: ProviderEnv {
            prefix: "EXCHANGE_RATE_API",
            base_url: "EXCHANGE_RATE_API_BASE_URL",
            api_key: "EXCHANGE_RATE_API_KEY",
        },
    },
    BuiltinProvider {
        name: "openexchangerates",
        url: "https://openexchangerates.org/api/latest.json",
        priority: 2,
        env: ProviderEnv {
            prefix: "OPEN_EXCHANGE_RATES",
            base_url: "OPEN_EXCHANGE_RATES_BASE_URL",
            api_key: "OPEN_EXCHANGE_RATES_API_KEY",
        },
    },
    BuiltinProvider {
        name: "frankfurter",
        url: "https://api.frankfurter.app/latest",
        priority: 3,
        env: ProviderEnv {
            prefix: "FRANKFURTER",
            base_url: "FRANKFURTER_API_BASE_URL",
            api_key: "FRANKFURTER_API_KEY",
        },
    },
    BuiltinProvider {
        name: "exchangerate.host",
        url: "https://api.exchangerate.host/latest",
        priority: 4,
        env: ProviderEnv {
            prefix: "EXCHANGE_RATE_HOST",
            base_url: "EXCHANGE_RATE_HOST_BASE_URL",
            api_key: "EXCHANGE_RATE_HOST_API_KEY",
        },
    },
];

const MAX_EXTRA_PROVIDERS: usize = 10;

fn default_true() -> bool {
    true
}

fn default_priority() -> i32 {
    10
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_base_currency() -> String {
    "USD".to_string()
}

/// Declared retry policy for a provider. Carried for reporting, the adapter
/// issues a single request per round.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub count: u32,
    pub delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            count: 3,
            delay_secs: 1,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProviderDescriptor {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower is listed first. Does not influence which response wins.
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl ProviderDescriptor {
    pub fn new(name: &str, base_url: &str) -> Self {
        ProviderDescriptor {
            name: name.to_string(),
            base_url: base_url.to_string(),
            api_key: None,
            enabled: true,
            priority: default_priority(),
            timeout_secs: default_timeout_secs(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_providers() -> Vec<ProviderDescriptor> {
    BUILTIN_PROVIDERS
        .iter()
        .map(|builtin| ProviderDescriptor {
            priority: builtin.priority,
            ..ProviderDescriptor::new(builtin.name, builtin.url)
        })
        .collect()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "0.0.0.0:8081".to_string(),
            request_timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Upper bound on provider requests in flight per round; 0 means one slot
    /// per provider.
    #[serde(default)]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_base_currency")]
    pub default_base: String,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderDescriptor>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            server: ServerConfig::default(),
            cache_ttl_secs: default_cache_ttl_secs(),
            max_concurrent_requests: 0,
            default_base: default_base_currency(),
            log_level: None,
            providers: default_providers(),
        }
    }
}

impl AppConfig {
    /// Loads the file at `path` (or the default location when it exists),
    /// then applies `.env` and process environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", env_file.display());
        }

        let mut config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => {
                let default_path = Self::default_config_path()?;
                if default_path.exists() {
                    Self::load_from_path(&default_path)?
                } else {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))?;
        Ok(config)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("dev", "fxagg", "fxagg")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }

    /// Applies overrides from `lookup`, which returns `None` for unset keys.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.listen_addr = format!("0.0.0.0:{port}");
        }
        if let Some(addr) = lookup("LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = Some(level);
        }
        if let Some(base) = lookup("DEFAULT_BASE_CURRENCY") {
            self.default_base = base.to_uppercase();
        }
        if let Some(ttl) = parse_var(&lookup, "RATES_CACHE_TTL_SECONDS")? {
            self.cache_ttl_secs = ttl;
        }
        if let Some(max) = parse_var(&lookup, "MAX_CONCURRENT_REQUESTS")? {
            self.max_concurrent_requests = max;
        }
        if let Some(timeout) = parse_var(&lookup, "REQUEST_TIMEOUT_SECONDS")? {
            self.server.request_timeout_secs = timeout;
        }

        for builtin in &BUILTIN_PROVIDERS {
            if let Some(provider) = self.providers.iter_mut().find(|p| p.name == builtin.name) {
                apply_provider_overrides(provider, &builtin.env, &lookup)?;
            }
        }

        for index in 1..=MAX_EXTRA_PROVIDERS {
            let prefix = format!("PROVIDER_{index}");
            let Some(name) = lookup(&format!("{prefix}_NAME")) else {
                break;
            };
            let base_url_var = format!("{prefix}_BASE_URL");
            let api_key_var = format!("{prefix}_API_KEY");
            let env = ProviderEnv {
                prefix: &prefix,
                base_url: &base_url_var,
                api_key: &api_key_var,
            };
            let mut provider = ProviderDescriptor::new(&name, "");
            apply_provider_overrides(&mut provider, &env, &lookup)?;
            if let Some(priority) = parse_var(&lookup, &format!("{prefix}_PRIORITY"))? {
                provider.priority = priority;
            }
            if provider.base_url.is_empty() {
                debug!("Skipping provider {} without a base URL", name);
                continue;
            }
            self.providers.push(provider);
        }

        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}

fn apply_provider_overrides<F>(
    provider: &mut ProviderDescriptor,
    env: &ProviderEnv<'_>,
    lookup: &F,
) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = env.prefix;
    if let Some(url) = lookup(env.base_url) {
        provider.base_url = url;
    }
    if let Some(key) = lookup(env.api_key) {
        provider.api_key = Some(key);
    }
    if let Some(enabled) = lookup(&format!("{prefix}_ENABLED")) {
        provider.enabled = parse_bool(&enabled)
            .ok_or_else(|| anyhow!("Invalid value for {prefix}_ENABLED: {enabled}"))?;
    }
    if let Some(timeout) = parse_var(lookup, &format!("{prefix}_TIMEOUT"))? {
        provider.timeout_secs = timeout;
    }
    if let Some(count) = parse_var(lookup, &format!("{prefix}_RETRY_COUNT"))? {
        provider.retry.count = count;
    }
    if let Some(delay) = parse_var(lookup, &format!("{prefix}_RETRY_DELAY"))? {
        provider.retry.delay_secs = delay;
    }
    Ok(())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {key}: {raw}"))
        })
        .transpose()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.max_concurrent_requests, 0);
        assert_eq!(config.default_base, "USD");
        let names: Vec<_> = config.providers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["erapi", "openexchangerates", "frankfurter", "exchangerate.host"]
        );
        assert!(config.providers.iter().all(|p| p.enabled));
    }

    #[test]
    fn test_config_deserialization() {
        let yaml_str = r#"
server:
  listen_addr: "127.0.0.1:9000"
cache_ttl_secs: 120
max_concurrent_requests: 2
providers:
  - name: "erapi"
    base_url: "http://example.com/erapi"
    priority: 1
  - name: "custom"
    base_url: "http://example.com/custom?format=json"
    api_key: "secret"
    enabled: false
    timeout_secs: 5
"#;

        let config: AppConfig = serde_yaml::from_str(yaml_str).expect("Failed to deserialize");
        assert_eq!(config.server.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.cache_ttl_secs, 120);
        assert_eq!(config.max_concurrent_requests, 2);
        assert_eq!(config.providers.len(), 2);

        let custom = &config.providers[1];
        assert_eq!(custom.name, "custom");
        assert_eq!(custom.api_key.as_deref(), Some("secret"));
        assert!(!custom.enabled);
        assert_eq!(custom.priority, 10);
        assert_eq!(custom.timeout(), Duration::from_secs(5));
        assert_eq!(custom.retry, RetryPolicy::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(lookup_from(&[
                ("PORT", "9090"),
                ("RATES_CACHE_TTL_SECONDS", "15"),
                ("MAX_CONCURRENT_REQUESTS", "3"),
                ("FRANKFURTER_ENABLED", "false"),
                ("EXCHANGE_RATE_API_BASE_URL", "http://localhost:1234/erapi"),
                ("OPEN_EXCHANGE_RATES_API_KEY", "app-123"),
                ("EXCHANGE_RATE_HOST_TIMEOUT", "7"),
                ("FRANKFURTER_API_BASE_URL", "http://localhost:1234/frankfurter"),
                ("FRANKFURTER_RETRY_COUNT", "5"),
                ("EXCHANGE_RATE_API_KEY", "erapi-key"),
            ]))
            .unwrap();

        assert_eq!(config.server.listen_addr, "0.0.0.0:9090");
        assert_eq!(config.cache_ttl_secs, 15);
        assert_eq!(config.max_concurrent_requests, 3);

        let by_name = |name: &str| config.providers.iter().find(|p| p.name == name).unwrap();
        assert!(!by_name("frankfurter").enabled);
        assert_eq!(by_name("erapi").base_url, "http://localhost:1234/erapi");
        assert_eq!(
            by_name("openexchangerates").api_key.as_deref(),
            Some("app-123")
        );
        assert_eq!(by_name("exchangerate.host").timeout_secs, 7);
        assert_eq!(
            by_name("frankfurter").base_url,
            "http://localhost:1234/frankfurter"
        );
        assert_eq!(by_name("frankfurter").retry.count, 5);
        assert_eq!(by_name("erapi").api_key.as_deref(), Some("erapi-key"));
    }

    #[test]
    fn test_builtin_url_variables_need_exact_names() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(lookup_from(&[
                ("FRANKFURTER_BASE_URL", "http://ignored.local"),
                ("EXCHANGE_RATE_API_API_KEY", "ignored"),
            ]))
            .unwrap();

        let frankfurter = config.providers.iter().find(|p| p.name == "frankfurter").unwrap();
        assert_eq!(frankfurter.base_url, "https://api.frankfurter.app/latest");
        let erapi = config.providers.iter().find(|p| p.name == "erapi").unwrap();
        assert!(erapi.api_key.is_none());
    }

    #[test]
    fn test_additional_providers_from_env() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(lookup_from(&[
                ("PROVIDER_1_NAME", "backup"),
                ("PROVIDER_1_BASE_URL", "http://backup.local/latest"),
                ("PROVIDER_1_PRIORITY", "5"),
                // No base URL, skipped
                ("PROVIDER_2_NAME", "broken"),
                ("PROVIDER_3_NAME", "late"),
                ("PROVIDER_3_BASE_URL", "http://late.local"),
                // Gap at 4 stops the scan
                ("PROVIDER_5_NAME", "unreachable"),
                ("PROVIDER_5_BASE_URL", "http://unreachable.local"),
            ]))
            .unwrap();

        let extra: Vec<_> = config.providers.iter().skip(4).collect();
        assert_eq!(extra.len(), 2);
        assert_eq!(extra[0].name, "backup");
        assert_eq!(extra[0].priority, 5);
        assert_eq!(extra[1].name, "late");
        assert_eq!(extra[1].priority, 10);
    }

    #[test]
    fn test_invalid_numeric_override_is_rejected() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(lookup_from(&[("RATES_CACHE_TTL_SECONDS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("RATES_CACHE_TTL_SECONDS"));
    }

    #[test]
    fn test_load_from_path() -> Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        fs::write(file.path(), "cache_ttl_secs: 5\n")?;

        let config = AppConfig::load_from_path(file.path())?;
        assert_eq!(config.cache_ttl_secs, 5);
        assert_eq!(config.providers.len(), 4);
        Ok(())
    }
}
