use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::outbox::RetryPolicy;

const CONFIG_FILE: &str = "chatsync_config.json";

const DEFAULT_PAGE_SIZE: u32 = 50;
const DEFAULT_SEND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRY_BASE_MS: u64 = 1_000;
const DEFAULT_RETRY_CAP_MS: u64 = 30_000;
const DEFAULT_MAX_AUTO_RETRIES: u32 = 5;
const DEFAULT_MAX_WINDOW: usize = 1_000;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub(super) struct AppConfig {
    pub(super) disable_cache: Option<bool>,
    pub(super) page_size: Option<u32>,
    pub(super) send_timeout_secs: Option<u64>,
    pub(super) retry_base_ms: Option<u64>,
    pub(super) retry_cap_ms: Option<u64>,
    pub(super) max_auto_retries: Option<u32>,
    pub(super) retry_jitter: Option<bool>,
    // Confirmed messages kept per conversation that is not open.
    pub(super) max_window_per_conversation: Option<usize>,
}

pub(super) fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE);
    let Ok(bytes) = std::fs::read(&path) else {
        return AppConfig::default();
    };
    match serde_json::from_slice::<AppConfig>(&bytes) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "ignoring malformed config");
            AppConfig::default()
        }
    }
}

pub(super) fn cache_enabled(config: &AppConfig) -> bool {
    // Used to keep Rust tests deterministic and free of on-disk state.
    if let Some(disable) = config.disable_cache {
        return !disable;
    }
    std::env::var("CHATSYNC_DISABLE_CACHE").ok().as_deref() != Some("1")
}

impl AppConfig {
    pub(super) fn page_size(&self) -> u32 {
        self.page_size.filter(|n| *n > 0).unwrap_or(DEFAULT_PAGE_SIZE)
    }

    pub(super) fn send_timeout(&self) -> Duration {
        Duration::from_secs(
            self.send_timeout_secs
                .filter(|s| *s > 0)
                .unwrap_or(DEFAULT_SEND_TIMEOUT_SECS),
        )
    }

    pub(super) fn max_window(&self) -> usize {
        self.max_window_per_conversation
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_WINDOW)
    }

    pub(super) fn retry_policy(&self) -> RetryPolicy {
        let base = self.retry_base_ms.unwrap_or(DEFAULT_RETRY_BASE_MS).max(1);
        let cap = self.retry_cap_ms.unwrap_or(DEFAULT_RETRY_CAP_MS).max(base);
        RetryPolicy {
            base: Duration::from_millis(base),
            cap: Duration::from_millis(cap),
            max_auto_retries: self.max_auto_retries.unwrap_or(DEFAULT_MAX_AUTO_RETRIES),
            jitter: self.retry_jitter.unwrap_or(true),
        }
    }
}

/// Default config with every knob spelled out, for apps that ship a template.
pub fn default_app_config_json() -> String {
    let cfg = AppConfig {
        disable_cache: Some(false),
        page_size: Some(DEFAULT_PAGE_SIZE),
        send_timeout_secs: Some(DEFAULT_SEND_TIMEOUT_SECS),
        retry_base_ms: Some(DEFAULT_RETRY_BASE_MS),
        retry_cap_ms: Some(DEFAULT_RETRY_CAP_MS),
        max_auto_retries: Some(DEFAULT_MAX_AUTO_RETRIES),
        retry_jitter: Some(true),
        max_window_per_conversation: Some(DEFAULT_MAX_WINDOW),
    };
    serde_json::to_string_pretty(&cfg).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_app_config(&dir.path().to_string_lossy());
        assert_eq!(cfg.page_size(), 50);
        assert_eq!(cfg.send_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.max_window(), 1_000);
        let policy = cfg.retry_policy();
        assert_eq!(policy.base, Duration::from_secs(1));
        assert_eq!(policy.cap, Duration::from_secs(30));
        assert_eq!(policy.max_auto_retries, 5);
        assert!(policy.jitter);
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"disable_cache": true, "retry_base_ms": 10, "retry_cap_ms": 5, "page_size": 0}"#,
        )
        .unwrap();
        let cfg = load_app_config(&dir.path().to_string_lossy());
        assert!(!cache_enabled(&cfg));
        assert_eq!(cfg.page_size(), 50);
        let policy = cfg.retry_policy();
        assert_eq!(policy.base, Duration::from_millis(10));
        // Cap never sits below base.
        assert_eq!(policy.cap, Duration::from_millis(10));
    }

    #[test]
    fn malformed_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), b"{not json").unwrap();
        let cfg = load_app_config(&dir.path().to_string_lossy());
        assert!(cfg.disable_cache.is_none());
    }

    #[test]
    fn template_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), default_app_config_json()).unwrap();
        let cfg = load_app_config(&dir.path().to_string_lossy());
        assert_eq!(cfg.max_auto_retries, Some(5));
        assert_eq!(cfg.retry_jitter, Some(true));
    }
}
