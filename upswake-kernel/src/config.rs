//! Configuration: UPS sources, their wake targets, and process settings.
//!
//! The YAML file (default `upswake.yaml`, override with `UPSWAKE_CONFIG`)
//! looks like:
//!
//! ```yaml
//! nut_servers:
//!   - name: rack-ups
//!     host: 192.168.1.10
//!     port: 3493
//!     username: monuser
//!     password: secret
//!     targets:
//!       - name: nas
//!         mac: "00:11:22:33:44:55"
//!         broadcast: 192.168.1.255
//!         interval: 5m
//!         rules: [on-line-power, battery-charged]
//! ```

use crate::policy::{PolicyEngine, PolicyError};
use crate::wol::{MacAddr, DEFAULT_WOL_PORT};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

pub const DEFAULT_NUT_PORT: u16 = 3493;
pub const REDACTED: &str = "********";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{context}: {reason}")]
    Invalid { context: String, reason: String },
    #[error("{context}: rule {rule:?} is not valid: {source}")]
    Rule {
        context: String,
        rule: String,
        #[source]
        source: PolicyError,
    },
    #[error("environment variable {name}: {reason}")]
    Env { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub nut_servers: Vec<NutSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NutSource {
    pub name: String,
    pub host: String,
    /// 0 means the NUT default port.
    #[serde(default)]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub targets: Vec<WakeTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeTarget {
    pub name: String,
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<String>,
    #[serde(default = "default_wol_port")]
    pub port: u16,
    pub interval: String,
    /// Rule document names, evaluated in order; first true wins.
    #[serde(default)]
    pub rules: Vec<String>,
}

fn default_wol_port() -> u16 {
    DEFAULT_WOL_PORT
}

impl NutSource {
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_NUT_PORT
        } else {
            self.port
        }
    }
}

impl WakeTarget {
    pub fn interval(&self) -> Result<Duration, String> {
        parse_interval(&self.interval)
    }
}

/// Upper bound for a wake interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Parses a humantime duration (`30s`, `5m`, `1h30m`, `250ms`).
/// Must be between 1ms and [`MAX_INTERVAL`].
pub fn parse_interval(s: &str) -> Result<Duration, String> {
    let d = humantime::parse_duration(s.trim())
        .map_err(|e| format!("invalid interval {s:?}: {e}"))?;
    if d < Duration::from_millis(1) {
        return Err(format!("interval {s:?} must be at least 1ms"));
    }
    if d > MAX_INTERVAL {
        return Err(format!("interval {s:?} must be at most 366 days"));
    }
    Ok(d)
}

impl Config {
    pub fn from_yaml(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(txt)?)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reads, parses and fully validates a config file.
    pub async fn load(path: &Path, policy: &dyn PolicyEngine) -> Result<Self, ConfigError> {
        let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg = Self::from_yaml(&txt)?;
        cfg.validate(policy).await?;
        Ok(cfg)
    }

    pub async fn store(&self, path: &Path) -> Result<(), ConfigError> {
        let txt = self.to_yaml()?;
        fs::write(path, txt).await.map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Structural checks plus a validity check of every referenced rule.
    pub async fn validate(&self, policy: &dyn PolicyEngine) -> Result<(), ConfigError> {
        self.check_fields()?;
        for (src, target) in self.targets() {
            for rule in &target.rules {
                policy.validate(rule).await.map_err(|source| ConfigError::Rule {
                    context: format!("nut_servers[{}].targets[{}]", src.name, target.name),
                    rule: rule.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Field-level checks that do not need the policy engine.
    pub fn check_fields(&self) -> Result<(), ConfigError> {
        for src in &self.nut_servers {
            let ctx = format!("nut_servers[{}]", src.name);
            let invalid = |reason: &str| ConfigError::Invalid {
                context: ctx.clone(),
                reason: reason.to_string(),
            };
            if src.name.trim().is_empty() {
                return Err(invalid("name is empty"));
            }
            if src.host.trim().is_empty() {
                return Err(invalid("host is empty"));
            }
            if !is_valid_host(&src.host) {
                let reason = format!("host {:?} is neither an IP nor a hostname", src.host);
                return Err(invalid(&reason));
            }
            if src.username.is_empty() {
                return Err(invalid("username is empty"));
            }
            if src.password.is_empty() {
                return Err(invalid("password is empty"));
            }

            for target in &src.targets {
                check_target(&ctx, target)?;
            }
        }
        Ok(())
    }

    pub fn targets(&self) -> impl Iterator<Item = (&NutSource, &WakeTarget)> {
        self.nut_servers
            .iter()
            .flat_map(|src| src.targets.iter().map(move |t| (src, t)))
    }

    pub fn target_count(&self) -> usize {
        self.targets().count()
    }

    /// Copy safe to expose over the API.
    pub fn redacted(&self) -> Vec<NutSource> {
        self.nut_servers
            .iter()
            .cloned()
            .map(|mut src| {
                src.password = REDACTED.to_string();
                src
            })
            .collect()
    }
}

fn check_target(parent: &str, target: &WakeTarget) -> Result<(), ConfigError> {
    let ctx = format!("{parent}.targets[{}]", target.name);
    let invalid = |reason: String| ConfigError::Invalid {
        context: ctx.clone(),
        reason,
    };
    if target.name.trim().is_empty() {
        return Err(invalid("name is empty".into()));
    }
    if target.mac.trim().is_empty() {
        return Err(invalid("mac is empty".into()));
    }
    target
        .mac
        .parse::<MacAddr>()
        .map_err(|e| invalid(e.to_string()))?;
    if let Some(b) = target.broadcast.as_deref().filter(|b| !b.trim().is_empty()) {
        b.trim()
            .parse::<IpAddr>()
            .map_err(|_| invalid(format!("broadcast {b:?} is not an IP address")))?;
    }
    if target.port == 0 {
        return Err(invalid("port must be in 1..=65535".into()));
    }
    target.interval().map_err(invalid)?;
    Ok(())
}

/// IP literal or RFC 1123 hostname.
pub fn is_valid_host(host: &str) -> bool {
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// How scheduler workers reach the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Loopback `POST /api/upswake`.
    Http,
    /// Direct call into the wake service.
    InProcess,
}

/// Process settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: PathBuf,
    pub rules_dir: PathBuf,
    pub listen: SocketAddr,
    pub base_url: String,
    /// `None` when hot reload is off.
    pub reload_debounce: Option<Duration>,
    pub trigger: TriggerMode,
    pub nut_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let listen: SocketAddr = match get("UPSWAKE_LISTEN") {
            Some(v) => v.parse().map_err(|e| ConfigError::Env {
                name: "UPSWAKE_LISTEN",
                reason: format!("{v:?}: {e}"),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };
        let base_url = get("UPSWAKE_BASE_URL")
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", listen.port()))
            .trim_end_matches('/')
            .to_string();
        let reload = match get("UPSWAKE_RELOAD").as_deref().map(str::trim) {
            None | Some("") | Some("1") | Some("true") | Some("on") => true,
            Some("0") | Some("false") | Some("off") => false,
            Some(other) => {
                return Err(ConfigError::Env {
                    name: "UPSWAKE_RELOAD",
                    reason: format!("expected true or false, got {other:?}"),
                })
            }
        };
        let debounce_ms = parse_u64(&get, "UPSWAKE_RELOAD_DEBOUNCE_MS", 250)?;
        let nut_secs = parse_u64(&get, "UPSWAKE_NUT_TIMEOUT_SECS", 10)?;
        let trigger = match get("UPSWAKE_TRIGGER").as_deref().map(str::trim) {
            None | Some("") | Some("http") => TriggerMode::Http,
            Some("inprocess") => TriggerMode::InProcess,
            Some(other) => {
                return Err(ConfigError::Env {
                    name: "UPSWAKE_TRIGGER",
                    reason: format!("expected http or inprocess, got {other:?}"),
                })
            }
        };

        Ok(Self {
            config_path: get("UPSWAKE_CONFIG").unwrap_or_else(|| "upswake.yaml".into()).into(),
            rules_dir: get("UPSWAKE_RULES_DIR").unwrap_or_else(|| "rules".into()).into(),
            listen,
            base_url,
            reload_debounce: reload.then(|| Duration::from_millis(debounce_ms)),
            trigger,
            nut_timeout: Duration::from_secs(nut_secs.max(1)),
        })
    }
}

fn parse_u64(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match get(name) {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Env {
            name,
            reason: format!("{v:?} is not a non-negative integer"),
        }),
        None => Ok(default),
    }
}
