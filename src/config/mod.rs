use derive_with::With;

#[derive(Debug, Clone, Copy, With)]
pub struct LockConfig {
    /// Consecutive restarts tolerated before the retry loop starts sleeping.
    pub max_restarts: usize,
    /// Base of the exponential backoff once `max_restarts` is exceeded.
    pub restart_backoff_base_us: u64,
    /// Verify owner bookkeeping of a node lock after every grant and release.
    pub debug_checks: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            max_restarts: 64,
            restart_backoff_base_us: 50,
            debug_checks: cfg!(debug_assertions),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, With)]
pub struct TreeConfig {
    pub lock: LockConfig,
}

impl TreeConfig {
    /// Defaults overlaid with `ZTREE_MAX_RESTARTS`, `ZTREE_BACKOFF_BASE_US`
    /// and `ZTREE_DEBUG_CHECKS` when they are set and parse.
    pub fn from_env() -> Self {
        let mut lock = LockConfig::default();
        if let Some(v) = env_parse::<usize>("ZTREE_MAX_RESTARTS") {
            lock.max_restarts = v;
        }
        if let Some(v) = env_parse::<u64>("ZTREE_BACKOFF_BASE_US") {
            lock.restart_backoff_base_us = v;
        }
        if let Ok(v) = std::env::var("ZTREE_DEBUG_CHECKS") {
            lock.debug_checks = matches!(v.as_str(), "1" | "true" | "on");
        }
        TreeConfig { lock }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
