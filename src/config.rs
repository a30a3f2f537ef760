use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

use crate::{
    common::ensure_parent_dir,
    constants::{
        DEFAULT_CACHE_DB, DEFAULT_MAX_KEY_ATTEMPTS, DEFAULT_REQUEST_LIMIT,
        DEFAULT_REQUEST_TIMEOUT_SECONDS, DEFAULT_SRZ_BASE_URL, DEFAULT_THREAD_LIMIT,
    },
    credentials::Credential,
    patients_file::ColumnAlias,
    scheduler::{RefundPolicy, SchedulerOptions},
    session::{ProxyConfig, SrzEndpoint},
};

/// Settings file. Everything except credentials has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub base_url: String,
    pub proxy: Option<ProxyConfig>,
    pub credentials: Vec<Credential>,
    pub thread_limit: usize,
    pub request_limit: usize,
    pub requests_per_second: u32,
    pub max_key_attempts: u32,
    pub refund_policy: RefundPolicy,
    pub request_timeout_seconds: u64,
    pub column_aliases: Vec<ColumnAlias>,
    pub cache_db: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SRZ_BASE_URL.to_string(),
            proxy: None,
            credentials: Vec::new(),
            thread_limit: DEFAULT_THREAD_LIMIT,
            request_limit: DEFAULT_REQUEST_LIMIT,
            requests_per_second: 0,
            max_key_attempts: DEFAULT_MAX_KEY_ATTEMPTS,
            refund_policy: RefundPolicy::default(),
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECONDS,
            column_aliases: Vec::new(),
            cache_db: PathBuf::from(DEFAULT_CACHE_DB),
        }
    }
}

/// Command-line values that win over the file when present.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub proxy_address: Option<String>,
    pub proxy_port: Option<u16>,
    pub thread_limit: Option<usize>,
    pub request_limit: Option<usize>,
    pub cache_db: Option<PathBuf>,
}

impl Settings {
    /// Reads `path` when it exists; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed reading settings {}", path.display()))?;
        let settings: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed parsing settings {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply(&mut self, overrides: &Overrides) -> Result<()> {
        if let Some(base_url) = &overrides.base_url {
            self.base_url = base_url.clone();
        }
        match (&overrides.proxy_address, overrides.proxy_port) {
            (Some(address), Some(port)) => {
                self.proxy = Some(ProxyConfig {
                    address: address.clone(),
                    port,
                });
            }
            (None, None) => {}
            _ => bail!("--proxy-address and --proxy-port must be given together"),
        }
        if let Some(threads) = overrides.thread_limit {
            self.thread_limit = threads;
        }
        if let Some(limit) = overrides.request_limit {
            self.request_limit = limit;
        }
        if let Some(cache_db) = &overrides.cache_db {
            self.cache_db = cache_db.clone();
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            bail!("base_url must not be empty");
        }
        if self.thread_limit == 0 {
            bail!("thread_limit must be at least 1");
        }
        if self.max_key_attempts == 0 {
            bail!("max_key_attempts must be at least 1");
        }
        for credential in &self.credentials {
            if credential.login.trim().is_empty() {
                bail!("Credential with an empty login in settings");
            }
        }
        Ok(())
    }

    pub fn endpoint(&self) -> SrzEndpoint {
        let mut endpoint = SrzEndpoint::new(&self.base_url);
        endpoint.proxy = self.proxy.clone();
        endpoint.timeout = Duration::from_secs(self.request_timeout_seconds.max(1));
        endpoint
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            thread_limit: self.thread_limit,
            max_key_attempts: self.max_key_attempts,
            refund_policy: self.refund_policy,
            requests_per_second: self.requests_per_second,
        }
    }

    pub fn total_quota(&self) -> u64 {
        self.credentials.iter().map(|c| c.request_quota).sum()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        ensure_parent_dir(path)?;
        let text = serde_json::to_string_pretty(self).context("Failed serializing settings")?;
        fs::write(path, text)
            .with_context(|| format!("Failed writing settings {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.thread_limit, DEFAULT_THREAD_LIMIT);
        assert_eq!(settings.refund_policy, RefundPolicy::NoRefund);
        assert!(settings.credentials.is_empty());
    }

    #[test]
    fn partial_file_keeps_defaults_and_reads_credentials() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{
                "base_url": "http://registry.local/",
                "refund_policy": "refund_on_transport_failure",
                "credentials": [
                    {"login": "a", "password": "x", "requests_limit": 100},
                    {"login": "b", "password": "y", "request_quota": 50, "max_requests_per_session": 20}
                ]
            }"#,
        )
        .unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.base_url, "http://registry.local/");
        assert_eq!(settings.request_limit, DEFAULT_REQUEST_LIMIT);
        assert_eq!(settings.total_quota(), 150);
        assert_eq!(settings.credentials[1].max_requests_per_session, Some(20));
        assert_eq!(
            settings.scheduler_options().refund_policy,
            RefundPolicy::RefundOnTransportFailure
        );
    }

    #[test]
    fn overrides_win_and_proxy_needs_both_parts() {
        let mut settings = Settings::default();
        settings
            .apply(&Overrides {
                thread_limit: Some(8),
                proxy_address: Some("10.0.0.2".into()),
                proxy_port: Some(3128),
                ..Overrides::default()
            })
            .unwrap();
        assert_eq!(settings.thread_limit, 8);
        assert_eq!(settings.endpoint().proxy.unwrap().port, 3128);

        let err = settings.apply(&Overrides {
            proxy_port: Some(1),
            ..Overrides::default()
        });
        assert!(err.is_err());
    }

    #[test]
    fn zero_threads_is_rejected() {
        let mut settings = Settings::default();
        let result = settings.apply(&Overrides {
            thread_limit: Some(0),
            ..Overrides::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn save_then_load_keeps_credentials() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = Settings {
            credentials: vec![Credential::new("a", "x", 7)],
            ..Settings::default()
        };
        settings.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.credentials[0].request_quota, 7);
    }
}
