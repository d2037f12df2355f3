use arc_swap::ArcSwap;
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::VeilError;
use crate::keys::Role;

// ─── Environment config ────────────────────────────────────────────────────

/// Process-wide configuration, sourced from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    /// Direct upstream target. Either this or `router_config` must be set.
    pub target_url: Option<String>,
    pub log_level: String,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,

    pub redis_addr: Option<String>,
    pub redis_password: Option<String>,

    /// Decoded 32-byte vault encryption key (64 hex chars in the env).
    pub encryption_key: Option<Vec<u8>>,

    /// Path to the router YAML. Presence toggles router mode.
    pub router_config: Option<String>,

    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub discord_webhook_url: Option<String>,
    pub slack_webhook_url: Option<String>,

    pub body_limit_bytes: usize,
    pub default_role: Role,
    /// Parsed by the guard crate; kept as text here.
    pub block_threshold: String,
    /// Parsed by the detector crate; kept as text here.
    pub sensitivity: String,
    /// Originals the detector must never report (comma-separated env).
    pub allow_list: Vec<String>,
    /// Originals the detector always reports (comma-separated env).
    pub block_list: Vec<String>,
    pub session_ttl_secs: u64,
    pub session_max_rpm: u32,
    pub rate_limit_per_min: u32,
    pub max_output_tokens: usize,
    /// Inject leak canaries into upstream prompts.
    pub canary_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8089".to_string(),
            target_url: None,
            log_level: "info".to_string(),
            tls_cert: None,
            tls_key: None,
            redis_addr: None,
            redis_password: None,
            encryption_key: None,
            router_config: None,
            webhook_url: None,
            webhook_secret: None,
            discord_webhook_url: None,
            slack_webhook_url: None,
            body_limit_bytes: 10 * 1024 * 1024,
            default_role: Role::Viewer,
            block_threshold: "high".to_string(),
            sensitivity: "medium".to_string(),
            allow_list: Vec::new(),
            block_list: Vec::new(),
            session_ttl_secs: 30 * 60,
            session_max_rpm: 60,
            rate_limit_per_min: 120,
            max_output_tokens: 0,
            canary_enabled: false,
        }
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_list(name: &str) -> Vec<String> {
    env_opt(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, VeilError> {
    match env_opt(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| VeilError::Config(format!("{name}: invalid value {raw:?}"))),
        None => Ok(default),
    }
}

impl Config {
    /// Read configuration from the environment and validate it.
    /// Configuration errors at startup are fatal.
    pub fn from_env() -> Result<Self, VeilError> {
        let defaults = Config::default();

        let encryption_key = match env_opt("VEIL_ENCRYPTION_KEY") {
            Some(raw) => {
                let bytes = hex::decode(&raw).map_err(|e| {
                    VeilError::Config(format!("VEIL_ENCRYPTION_KEY: invalid hex: {e}"))
                })?;
                if bytes.len() != 32 {
                    return Err(VeilError::Config(format!(
                        "VEIL_ENCRYPTION_KEY must decode to 32 bytes, got {}",
                        bytes.len()
                    )));
                }
                Some(bytes)
            }
            None => None,
        };

        let default_role = match env_opt("VEIL_DEFAULT_ROLE") {
            Some(raw) => raw
                .parse::<Role>()
                .map_err(|e| VeilError::Config(format!("VEIL_DEFAULT_ROLE: {e}")))?,
            None => defaults.default_role,
        };

        let body_limit_mb: usize = env_parse("VEIL_BODY_LIMIT_MB", 10)?;

        let config = Self {
            listen_addr: env_opt("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            target_url: env_opt("TARGET_URL"),
            log_level: env_opt("LOG_LEVEL").unwrap_or(defaults.log_level),
            tls_cert: env_opt("TLS_CERT"),
            tls_key: env_opt("TLS_KEY"),
            redis_addr: env_opt("REDIS_ADDR"),
            redis_password: env_opt("REDIS_PASSWORD"),
            encryption_key,
            router_config: env_opt("VEIL_ROUTER_CONFIG"),
            webhook_url: env_opt("VEIL_WEBHOOK_URL"),
            webhook_secret: env_opt("VEIL_WEBHOOK_SECRET"),
            discord_webhook_url: env_opt("VEIL_DISCORD_WEBHOOK_URL"),
            slack_webhook_url: env_opt("VEIL_SLACK_WEBHOOK_URL"),
            body_limit_bytes: body_limit_mb * 1024 * 1024,
            default_role,
            block_threshold: env_opt("VEIL_BLOCK_THRESHOLD").unwrap_or(defaults.block_threshold),
            sensitivity: env_opt("VEIL_SENSITIVITY").unwrap_or(defaults.sensitivity),
            allow_list: env_list("VEIL_ALLOW_LIST"),
            block_list: env_list("VEIL_BLOCK_LIST"),
            session_ttl_secs: env_parse("VEIL_SESSION_TTL_SECS", defaults.session_ttl_secs)?,
            session_max_rpm: env_parse("VEIL_SESSION_MAX_RPM", defaults.session_max_rpm)?,
            rate_limit_per_min: env_parse("VEIL_RATE_LIMIT_PER_MIN", defaults.rate_limit_per_min)?,
            max_output_tokens: env_parse("VEIL_MAX_OUTPUT_TOKENS", defaults.max_output_tokens)?,
            canary_enabled: env_opt("VEIL_CANARY_ENABLED")
                .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), VeilError> {
        if self.target_url.is_none() && self.router_config.is_none() {
            return Err(VeilError::Config(
                "either TARGET_URL or VEIL_ROUTER_CONFIG must be set".to_string(),
            ));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(VeilError::Config(
                "TLS_CERT and TLS_KEY must be set together".to_string(),
            ));
        }
        if let Some(target) = &self.target_url
            && !target.starts_with("http://")
            && !target.starts_with("https://")
        {
            return Err(VeilError::Config(format!(
                "TARGET_URL must be http(s), got {target:?}"
            )));
        }
        Ok(())
    }
}

// ─── Router config (YAML) ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RouterConfig {
    pub providers: Vec<ProviderConfig>,
    pub routes: Vec<RouteConfig>,
    pub fallback: FallbackConfig,
    pub load_balance: LoadBalanceStrategy,
    pub default_route: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    /// Literal key, or `$NAME` resolved from the environment at load time.
    pub api_key: String,
    pub auth_method: AuthMethod,
    /// Query parameter name when `auth_method: query`.
    pub auth_param: Option<String>,
    pub model: Option<String>,
    /// Lower value = higher priority.
    pub priority: u32,
    pub weight: u32,
    pub max_retries: u32,
    pub timeout_sec: u64,
    pub enabled: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_url: String::new(),
            api_key: String::new(),
            auth_method: AuthMethod::Header,
            auth_param: None,
            model: None,
            priority: 100,
            weight: 1,
            max_retries: 2,
            timeout_sec: 60,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    /// `Authorization: Bearer <key>`
    #[default]
    Header,
    #[serde(rename = "x-api-key")]
    XApiKey,
    Query,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouteConfig {
    pub path_prefix: String,
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub retry_delay_sec: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            retry_delay_sec: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    Priority,
    RoundRobin,
    Weighted,
}

impl RouterConfig {
    /// Load router config from a YAML file, sanitize, and validate.
    pub fn load(path: &str) -> Result<Self, VeilError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| VeilError::Config(format!("cannot read {path}: {e}")))?;
        let mut config: RouterConfig = serde_yml::from_str(&contents)
            .map_err(|e| VeilError::Config(format!("invalid router config {path}: {e}")))?;
        config.sanitize()?;
        config.validate()?;
        Ok(config)
    }

    /// Normalize entries and resolve `$ENV` credential references.
    fn sanitize(&mut self) -> Result<(), VeilError> {
        self.providers.retain(|p| p.enabled);
        for provider in self.providers.iter_mut() {
            while provider.base_url.ends_with('/') {
                provider.base_url.pop();
            }
            if let Some(env_name) = provider.api_key.strip_prefix('$') {
                provider.api_key = std::env::var(env_name).map_err(|_| {
                    VeilError::Config(format!(
                        "provider {:?}: environment variable {env_name} is not set",
                        provider.name
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), VeilError> {
        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(VeilError::Config("provider name must not be empty".into()));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(VeilError::Config(format!(
                    "duplicate provider name {:?}",
                    provider.name
                )));
            }
            if provider.base_url.is_empty() {
                return Err(VeilError::Config(format!(
                    "provider {:?}: base_url must not be empty",
                    provider.name
                )));
            }
            if provider.auth_method == AuthMethod::Query && provider.auth_param.is_none() {
                return Err(VeilError::Config(format!(
                    "provider {:?}: auth_method query requires auth_param",
                    provider.name
                )));
            }
        }
        for route in &self.routes {
            if !names.contains(route.provider.as_str()) {
                return Err(VeilError::Config(format!(
                    "route {:?} references unknown provider {:?}",
                    route.path_prefix, route.provider
                )));
            }
        }
        if let Some(default) = &self.default_route
            && !names.contains(default.as_str())
        {
            return Err(VeilError::Config(format!(
                "default_route references unknown provider {default:?}"
            )));
        }
        Ok(())
    }
}

// ─── Router config watcher ─────────────────────────────────────────────────

pub struct RouterWatcher {
    _watcher: notify::RecommendedWatcher,
}

impl RouterWatcher {
    /// Start watching the router YAML. On changes (debounced 150ms, SHA256
    /// dedup), reload and atomically swap the config in via ArcSwap.
    pub fn start(
        path: String,
        config: Arc<ArcSwap<RouterConfig>>,
        on_reload: impl Fn(&RouterConfig) + Send + Sync + 'static,
    ) -> Result<Self, VeilError> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(16);

        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
            if let Ok(event) = res
                && (event.kind.is_modify() || event.kind.is_create())
            {
                let _ = tx.blocking_send(());
            }
        })
        .map_err(|e| VeilError::Config(format!("router watcher: {e}")))?;
        watcher
            .watch(Path::new(&path), RecursiveMode::NonRecursive)
            .map_err(|e| VeilError::Config(format!("router watcher: {e}")))?;

        tokio::spawn(async move {
            let mut last_hash: Option<[u8; 32]> = None;
            let mut debounce: Option<tokio::time::Instant> = None;

            loop {
                tokio::select! {
                    Some(()) = rx.recv() => {
                        debounce = Some(tokio::time::Instant::now() + Duration::from_millis(150));
                    }
                    _ = async {
                        match debounce {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        debounce = None;
                        match std::fs::read(&path) {
                            Ok(contents) => {
                                let hash: [u8; 32] = sha2::Sha256::digest(&contents).into();
                                if last_hash.as_ref() == Some(&hash) {
                                    continue;
                                }
                                last_hash = Some(hash);

                                match RouterConfig::load(&path) {
                                    Ok(new_cfg) => {
                                        tracing::info!("router config reloaded");
                                        on_reload(&new_cfg);
                                        config.store(Arc::new(new_cfg));
                                    }
                                    Err(e) => {
                                        tracing::error!("router config reload failed: {e}");
                                    }
                                }
                            }
                            Err(e) => tracing::error!("router config read failed: {e}"),
                        }
                    }
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
providers:
  - name: primary
    base_url: "https://api.openai.com/"
    api_key: "sk-test"
    priority: 1
  - name: secondary
    base_url: "https://api.anthropic.com"
    api_key: "sk-ant-test"
    auth_method: x-api-key
    priority: 2
    weight: 3
routes:
  - path_prefix: "/anthropic"
    provider: secondary
fallback:
  enabled: true
  max_attempts: 2
load_balance: round_robin
default_route: primary
"#;

    #[test]
    fn test_router_config_parse() {
        let mut config: RouterConfig = serde_yml::from_str(SAMPLE).unwrap();
        config.sanitize().unwrap();
        config.validate().unwrap();

        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].base_url, "https://api.openai.com");
        assert_eq!(config.providers[1].auth_method, AuthMethod::XApiKey);
        assert_eq!(config.providers[1].weight, 3);
        assert_eq!(config.load_balance, LoadBalanceStrategy::RoundRobin);
        assert!(config.fallback.enabled);
        assert_eq!(config.fallback.max_attempts, 2);
        assert_eq!(config.default_route.as_deref(), Some("primary"));
    }

    #[test]
    fn test_router_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = RouterConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.providers.len(), 2);

        assert!(RouterConfig::load("/nonexistent/router.yaml").is_err());
    }

    #[test]
    fn test_router_config_rejects_unknown_route_provider() {
        let yaml = r#"
providers:
  - name: only
    base_url: "http://localhost:1234"
    api_key: "k"
routes:
  - path_prefix: "/x"
    provider: missing
"#;
        let mut config: RouterConfig = serde_yml::from_str(yaml).unwrap();
        config.sanitize().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_router_config_rejects_duplicate_names() {
        let yaml = r#"
providers:
  - name: dup
    base_url: "http://a"
    api_key: "k"
  - name: dup
    base_url: "http://b"
    api_key: "k2"
"#;
        let mut config: RouterConfig = serde_yml::from_str(yaml).unwrap();
        config.sanitize().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_reference_resolution() {
        unsafe { std::env::set_var("VEIL_TEST_PROVIDER_KEY", "resolved-key") };
        let yaml = r#"
providers:
  - name: env
    base_url: "http://a"
    api_key: "$VEIL_TEST_PROVIDER_KEY"
"#;
        let mut config: RouterConfig = serde_yml::from_str(yaml).unwrap();
        config.sanitize().unwrap();
        assert_eq!(config.providers[0].api_key, "resolved-key");
    }

    #[test]
    fn test_query_auth_requires_param() {
        let yaml = r#"
providers:
  - name: g
    base_url: "http://a"
    api_key: "k"
    auth_method: query
"#;
        let mut config: RouterConfig = serde_yml::from_str(yaml).unwrap();
        config.sanitize().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_providers_dropped() {
        let yaml = r#"
providers:
  - name: off
    base_url: "http://a"
    api_key: "k"
    enabled: false
"#;
        let mut config: RouterConfig = serde_yml::from_str(yaml).unwrap();
        config.sanitize().unwrap();
        assert!(config.providers.is_empty());
    }
}
