// src/config/scheduler.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_CONFIG_PATH: &str = "CATALOG_WATCH_CONFIG";
pub const DEFAULT_TOML_PATH: &str = "config/catalog_watch.toml";
pub const DEFAULT_JSON_PATH: &str = "config/catalog_watch.json";

/// Every tunable of the scheduler. Missing fields fall back to [`Default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Acquisition tick period.
    pub tick_ms: u64,
    /// Upstream requests allowed per 24h epoch.
    pub daily_quota: u32,
    /// Subtracted from the persisted budget on restart.
    pub quota_safety_margin: u32,
    /// Pause after a rate-limit answer without a retry delay.
    pub default_pause_secs: u64,
    pub gate_max_requests: u32,
    pub gate_interval_ms: u64,
    /// Events kept per item.
    pub events_cap: usize,
    pub checkpoint_secs: u64,
    pub catalog_refresh_secs: u64,
    pub state_dir: PathBuf,
    /// `None` runs against the in-memory fixture provider.
    pub upstream_base_url: Option<String>,
    pub merge_parallel_threshold: usize,
    pub fanout_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            daily_quota: 100_000,
            quota_safety_margin: 200,
            default_pause_secs: 300,
            gate_max_requests: 1,
            gate_interval_ms: 1_000,
            events_cap: crate::store::DEFAULT_EVENTS_CAP,
            checkpoint_secs: 60,
            catalog_refresh_secs: 6 * 3600,
            state_dir: PathBuf::from("state"),
            upstream_base_url: None,
            merge_parallel_threshold: crate::merge::DEFAULT_PARALLEL_THRESHOLD,
            fanout_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    /// Load from an explicit path. Supports TOML or JSON formats.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading scheduler config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let cfg = match ext.as_str() {
            "json" => serde_json::from_str::<Self>(&content).context("parsing json config")?,
            _ => toml::from_str::<Self>(&content).context("parsing toml config")?,
        };
        Ok(cfg.sanitized())
    }

    /// Load using env var + fallbacks, then apply `CW_*` overrides:
    /// 1) $CATALOG_WATCH_CONFIG
    /// 2) config/catalog_watch.toml
    /// 3) config/catalog_watch.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            Self::load_from(&pb)?
        } else if Path::new(DEFAULT_TOML_PATH).exists() {
            Self::load_from(Path::new(DEFAULT_TOML_PATH))?
        } else if Path::new(DEFAULT_JSON_PATH).exists() {
            Self::load_from(Path::new(DEFAULT_JSON_PATH))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg.sanitized())
    }

    pub fn apply_env_overrides(&mut self) {
        override_from("CW_TICK_MS", &mut self.tick_ms);
        override_from("CW_DAILY_QUOTA", &mut self.daily_quota);
        override_from("CW_QUOTA_SAFETY_MARGIN", &mut self.quota_safety_margin);
        override_from("CW_DEFAULT_PAUSE_SECS", &mut self.default_pause_secs);
        override_from("CW_GATE_MAX_REQUESTS", &mut self.gate_max_requests);
        override_from("CW_GATE_INTERVAL_MS", &mut self.gate_interval_ms);
        override_from("CW_EVENTS_CAP", &mut self.events_cap);
        override_from("CW_CHECKPOINT_SECS", &mut self.checkpoint_secs);
        override_from("CW_CATALOG_REFRESH_SECS", &mut self.catalog_refresh_secs);
        override_from("CW_STATE_DIR", &mut self.state_dir);
        if let Ok(url) = std::env::var("CW_UPSTREAM_BASE_URL") {
            let url = url.trim();
            self.upstream_base_url = (!url.is_empty()).then(|| url.to_string());
        }
    }

    /// Zero periods and caps would stall or break the loop; put defaults back.
    pub fn sanitized(mut self) -> Self {
        let d = Self::default();
        if self.tick_ms == 0 {
            self.tick_ms = d.tick_ms;
        }
        if self.gate_max_requests == 0 {
            self.gate_max_requests = d.gate_max_requests;
        }
        if self.gate_interval_ms == 0 {
            self.gate_interval_ms = d.gate_interval_ms;
        }
        if self.events_cap == 0 {
            self.events_cap = d.events_cap;
        }
        if self.checkpoint_secs == 0 {
            self.checkpoint_secs = d.checkpoint_secs;
        }
        if self.catalog_refresh_secs == 0 {
            self.catalog_refresh_secs = d.catalog_refresh_secs;
        }
        if self.fanout_capacity == 0 {
            self.fanout_capacity = d.fanout_capacity;
        }
        self
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn gate_interval(&self) -> Duration {
        Duration::from_millis(self.gate_interval_ms)
    }

    pub fn checkpoint_period(&self) -> Duration {
        Duration::from_secs(self.checkpoint_secs)
    }

    pub fn catalog_refresh_period(&self) -> Duration {
        Duration::from_secs(self.catalog_refresh_secs)
    }
}

fn override_from<T: FromStr>(name: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(target: "config", var = name, value = %raw, "ignoring unparsable override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    #[test]
    fn toml_and_json_fill_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();

        let p_toml = dir.path().join("cw.toml");
        fs::write(&p_toml, "daily_quota = 500\ntick_ms = 0\n").unwrap();
        let t = SchedulerConfig::load_from(&p_toml).unwrap();
        assert_eq!(t.daily_quota, 500);
        assert_eq!(t.tick_ms, 1_000, "zero tick sanitised");
        assert_eq!(t.quota_safety_margin, 200);

        let p_json = dir.path().join("cw.json");
        fs::write(&p_json, r#"{"events_cap": 4, "upstream_base_url": "http://x"}"#).unwrap();
        let j = SchedulerConfig::load_from(&p_json).unwrap();
        assert_eq!(j.events_cap, 4);
        assert_eq!(j.upstream_base_url.as_deref(), Some("http://x"));
    }

    #[serial_test::serial]
    #[test]
    fn env_path_then_fallbacks_then_overrides() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_CONFIG_PATH);
        env::remove_var("CW_DAILY_QUOTA");

        assert_eq!(
            SchedulerConfig::load_default().unwrap(),
            SchedulerConfig::default()
        );

        fs::create_dir_all(tmp.path().join("config")).unwrap();
        fs::write(tmp.path().join(DEFAULT_TOML_PATH), "daily_quota = 42\n").unwrap();
        assert_eq!(SchedulerConfig::load_default().unwrap().daily_quota, 42);

        let p_env = tmp.path().join("other.json");
        fs::write(&p_env, r#"{"daily_quota": 7}"#).unwrap();
        env::set_var(ENV_CONFIG_PATH, p_env.display().to_string());
        assert_eq!(SchedulerConfig::load_default().unwrap().daily_quota, 7);

        env::set_var("CW_DAILY_QUOTA", "9");
        assert_eq!(SchedulerConfig::load_default().unwrap().daily_quota, 9);
        env::set_var("CW_DAILY_QUOTA", "lots");
        assert_eq!(SchedulerConfig::load_default().unwrap().daily_quota, 7);

        env::remove_var("CW_DAILY_QUOTA");
        env::remove_var(ENV_CONFIG_PATH);
        env::set_current_dir(&old).unwrap();
    }
}
