//! Multi-provider routing: health tracking, strategies, fallback order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use veil_core::config::{
    AuthMethod, FallbackConfig, LoadBalanceStrategy, ProviderConfig, RouterConfig,
};
use veil_core::error::VeilError;

pub const DEFAULT_RECOVERY: Duration = Duration::from_secs(30);

/// One configured upstream provider with its runtime health flag.
pub struct Provider {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub auth_method: AuthMethod,
    pub auth_param: Option<String>,
    pub model: Option<String>,
    pub priority: u32,
    pub weight: u32,
    pub max_retries: u32,
    pub timeout: Duration,
    healthy: AtomicBool,
    last_failure: Mutex<Option<Instant>>,
    recovery: Duration,
}

impl Provider {
    fn from_config(config: &ProviderConfig, recovery: Duration) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            auth_method: config.auth_method,
            auth_param: config.auth_param.clone(),
            model: config.model.clone(),
            priority: config.priority,
            weight: config.weight.max(1),
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_sec),
            healthy: AtomicBool::new(true),
            last_failure: Mutex::new(None),
            recovery,
        }
    }

    /// Health decays back to healthy after the recovery timer; no manual
    /// intervention.
    pub fn is_healthy(&self) -> bool {
        if self.healthy.load(Ordering::Relaxed) {
            return true;
        }
        let mut last = self.last_failure.lock().unwrap();
        match *last {
            Some(at) if at.elapsed() >= self.recovery => {
                *last = None;
                self.healthy.store(true, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
        *self.last_failure.lock().unwrap() = Some(Instant::now());
    }
}

/// Where a request resolved to, and the path it should carry upstream.
pub struct Resolution {
    pub provider: Arc<Provider>,
    pub path: String,
}

pub struct ProviderRouter {
    /// Sorted by ascending priority.
    providers: RwLock<Vec<Arc<Provider>>>,
    routes: RwLock<Vec<(String, String)>>,
    default_route: RwLock<Option<String>>,
    strategy: RwLock<LoadBalanceStrategy>,
    fallback: RwLock<FallbackConfig>,
    /// One cursor lock covers round-robin and weighted advancement.
    cursor: Mutex<usize>,
    recovery: Duration,
}

impl ProviderRouter {
    pub fn new(config: &RouterConfig) -> Self {
        Self::with_recovery(config, DEFAULT_RECOVERY)
    }

    pub fn with_recovery(config: &RouterConfig, recovery: Duration) -> Self {
        let router = Self {
            providers: RwLock::new(Vec::new()),
            routes: RwLock::new(Vec::new()),
            default_route: RwLock::new(None),
            strategy: RwLock::new(LoadBalanceStrategy::Priority),
            fallback: RwLock::new(FallbackConfig::default()),
            cursor: Mutex::new(0),
            recovery,
        };
        router.update_from_config(config);
        router
    }

    /// Rebuild from config, preserving health state by provider name.
    pub fn update_from_config(&self, config: &RouterConfig) {
        let mut rebuilt: Vec<Arc<Provider>> = config
            .providers
            .iter()
            .map(|p| Arc::new(Provider::from_config(p, self.recovery)))
            .collect();
        rebuilt.sort_by_key(|p| p.priority);

        {
            let old = self.providers.read().unwrap();
            for provider in &rebuilt {
                if let Some(prev) = old.iter().find(|o| o.name == provider.name)
                    && !prev.is_healthy()
                {
                    provider.healthy.store(false, Ordering::Relaxed);
                    *provider.last_failure.lock().unwrap() = *prev.last_failure.lock().unwrap();
                }
            }
        }

        // Longest prefix first so nested routes win.
        let mut routes: Vec<(String, String)> = config
            .routes
            .iter()
            .map(|r| (r.path_prefix.clone(), r.provider.clone()))
            .collect();
        routes.sort_by_key(|(prefix, _)| std::cmp::Reverse(prefix.len()));

        *self.providers.write().unwrap() = rebuilt;
        *self.routes.write().unwrap() = routes;
        *self.default_route.write().unwrap() = config.default_route.clone();
        *self.strategy.write().unwrap() = config.load_balance;
        *self.fallback.write().unwrap() = config.fallback.clone();
    }

    pub fn get(&self, name: &str) -> Option<Arc<Provider>> {
        self.providers
            .read()
            .unwrap()
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    pub fn fallback_config(&self) -> FallbackConfig {
        self.fallback.read().unwrap().clone()
    }

    /// Resolve a provider for a request: explicit header, then route prefix
    /// (stripped before forwarding), then default route, then strategy.
    pub fn resolve(&self, provider_header: Option<&str>, path: &str) -> Result<Resolution, VeilError> {
        if let Some(name) = provider_header
            && let Some(provider) = self.get(name)
        {
            return Ok(Resolution {
                provider,
                path: path.to_string(),
            });
        }

        {
            let routes = self.routes.read().unwrap();
            for (prefix, name) in routes.iter() {
                if let Some(stripped) = path.strip_prefix(prefix.as_str())
                    && let Some(provider) = self.get(name)
                {
                    let path = if stripped.starts_with('/') {
                        stripped.to_string()
                    } else {
                        format!("/{stripped}")
                    };
                    return Ok(Resolution { provider, path });
                }
            }
        }

        if let Some(name) = self.default_route.read().unwrap().as_deref()
            && let Some(provider) = self.get(name)
            && provider.is_healthy()
        {
            return Ok(Resolution {
                provider,
                path: path.to_string(),
            });
        }

        let provider = self.pick().ok_or(VeilError::NoHealthyProvider)?;
        Ok(Resolution {
            provider,
            path: path.to_string(),
        })
    }

    /// Apply the load-balance strategy over healthy providers.
    pub fn pick(&self) -> Option<Arc<Provider>> {
        let providers = self.providers.read().unwrap();
        let healthy: Vec<&Arc<Provider>> =
            providers.iter().filter(|p| p.is_healthy()).collect();
        if healthy.is_empty() {
            return None;
        }

        let strategy = *self.strategy.read().unwrap();
        match strategy {
            LoadBalanceStrategy::Priority => Some(healthy[0].clone()),
            LoadBalanceStrategy::RoundRobin => {
                let mut cursor = self.cursor.lock().unwrap();
                let picked = healthy[*cursor % healthy.len()].clone();
                *cursor = cursor.wrapping_add(1);
                Some(picked)
            }
            LoadBalanceStrategy::Weighted => {
                let expanded: Vec<&Arc<Provider>> = healthy
                    .iter()
                    .flat_map(|p| std::iter::repeat_n(*p, p.weight as usize))
                    .collect();
                let mut cursor = self.cursor.lock().unwrap();
                let picked = expanded[*cursor % expanded.len()].clone();
                *cursor = cursor.wrapping_add(1);
                Some(picked)
            }
        }
    }

    /// Attempt order for fallback: the resolved provider first, then the
    /// remaining providers by ascending priority.
    pub fn fallback_order(&self, first: &Arc<Provider>) -> Vec<Arc<Provider>> {
        let providers = self.providers.read().unwrap();
        let mut order = vec![first.clone()];
        for provider in providers.iter() {
            if provider.name != first.name {
                order.push(provider.clone());
            }
        }
        order
    }
}
