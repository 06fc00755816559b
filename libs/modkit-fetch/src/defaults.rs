//! Seed values applied to every request.
//!
//! [`Defaults`] is an immutable value; clients capture it when they are
//! constructed. The process-wide override below is read by
//! [`Defaults::current`] and only affects clients created after it changes.
//! It lives for the whole process and has no teardown.

use crate::config::Config;
use parking_lot::RwLock;
use std::sync::LazyLock;
use std::time::Duration;

/// Default request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default `User-Agent` header value.
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-fetch/", env!("CARGO_PKG_VERSION"));

static PROCESS_DEFAULTS: LazyLock<RwLock<Defaults>> =
    LazyLock::new(|| RwLock::new(Defaults::default()));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    /// Prefix for relative request URLs; empty means none
    pub base_url: String,
    /// Round-trip deadline; zero disables it
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl Defaults {
    /// Snapshot of the process-wide defaults.
    #[must_use]
    pub fn current() -> Self {
        PROCESS_DEFAULTS.read().clone()
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Seed configuration carrying base URL, timeout and `user-agent`.
    #[must_use]
    pub fn to_config(&self) -> Config {
        let mut config = Config {
            base_url: self.base_url.clone(),
            timeout: Some(self.timeout),
            ..Config::default()
        };
        if !self.user_agent.is_empty() {
            config.headers.set("user-agent", self.user_agent.as_str());
        }
        config
    }
}

/// Replace the process-wide defaults.
pub fn set_defaults(defaults: Defaults) {
    *PROCESS_DEFAULTS.write() = defaults;
}

pub fn set_base_url(base_url: impl Into<String>) {
    PROCESS_DEFAULTS.write().base_url = base_url.into();
}

pub fn set_timeout(timeout: Duration) {
    PROCESS_DEFAULTS.write().timeout = timeout;
}

pub fn set_user_agent(user_agent: impl Into<String>) {
    PROCESS_DEFAULTS.write().user_agent = user_agent.into();
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let d = Defaults::default();
        assert!(d.base_url.is_empty());
        assert_eq!(d.timeout, Duration::from_secs(60));
        assert!(d.user_agent.starts_with("modkit-fetch/"));
    }

    #[test]
    fn test_to_config_seeds_user_agent() {
        let config = Defaults::default()
            .with_base_url("https://api.example.com")
            .with_user_agent("fetch-test/1.0")
            .to_config();

        assert_eq!(config.base_url, "https://api.example.com");
        assert_eq!(config.timeout, Some(DEFAULT_TIMEOUT));
        assert_eq!(config.headers.get("User-Agent"), Some("fetch-test/1.0"));
    }

    #[test]
    fn test_process_override_affects_later_snapshots() {
        let before = Defaults::current();
        let custom = DEFAULT_TIMEOUT + Duration::from_secs(1);

        set_timeout(custom);
        assert_eq!(Defaults::current().timeout, custom);
        // snapshots taken earlier are unaffected
        assert_eq!(before.timeout, DEFAULT_TIMEOUT);

        set_timeout(DEFAULT_TIMEOUT);
    }
}
