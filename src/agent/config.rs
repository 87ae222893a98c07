use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::net::{IpAddr, SocketAddr};

use crate::commands::timeout::TimeoutStrategy;
use crate::utils::logging;
use crate::{SERVICE_NAME, VERSION};

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const EXECUTION_POLICIES: &[&str] = &[
    "AllSigned",
    "Bypass",
    "Default",
    "RemoteSigned",
    "Restricted",
    "Undefined",
    "Unrestricted",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub log_level: String,
    pub command_timeout_secs: u64,
    pub powershell_path: String,
    pub execution_policy: String,
    pub require_admin: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            debug: false,
            log_level: "info".to_string(),
            command_timeout_secs: 30,
            powershell_path: "pwsh".to_string(),
            execution_policy: "Bypass".to_string(),
            require_admin: true,
        }
    }
}

impl Config {
    /// Load from `WEBHOOK_*`, `LOG_LEVEL`, `COMMAND_TIMEOUT_SECS`,
    /// `POWERSHELL_*` and `REQUIRE_ADMIN`, falling back to defaults.
    /// `FLASK_HOST`, `FLASK_PORT`, `FLASK_DEBUG` and `POWERSHELL_TIMEOUT`
    /// are honored when the newer name is unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();

        if let Some((_, host)) = first_of(&lookup, &["WEBHOOK_HOST", "FLASK_HOST"]) {
            cfg.host = host;
        }
        if let Some((key, port)) = first_of(&lookup, &["WEBHOOK_PORT", "FLASK_PORT"]) {
            cfg.port = port
                .trim()
                .parse()
                .with_context(|| format!("{} is not a port number: {}", key, port))?;
        }
        if let Some((_, debug)) = first_of(&lookup, &["WEBHOOK_DEBUG", "FLASK_DEBUG"]) {
            cfg.debug = parse_flag(&debug);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            cfg.log_level = level.to_lowercase();
        }
        if let Some((key, secs)) = first_of(&lookup, &["COMMAND_TIMEOUT_SECS", "POWERSHELL_TIMEOUT"]) {
            cfg.command_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("{} is not a number: {}", key, secs))?;
        }
        if let Some(path) = lookup("POWERSHELL_PATH") {
            cfg.powershell_path = path;
        }
        if let Some(policy) = lookup("POWERSHELL_EXECUTION_POLICY") {
            cfg.execution_policy = policy;
        }
        if let Some(require) = lookup("REQUIRE_ADMIN") {
            cfg.require_admin = parse_flag(&require);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let mut cfg: Config = serde_json::from_str(&raw).context("parsing JSON")?;
        cfg.log_level = cfg.log_level.to_lowercase();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.host
            .parse::<IpAddr>()
            .with_context(|| format!("host is not an IP address: {}", self.host))?;

        if self.port == 0 {
            bail!("port must be between 1 and 65535");
        }
        if !(1..=3600).contains(&self.command_timeout_secs) {
            bail!(
                "command timeout must be between 1 and 3600 seconds, got {}",
                self.command_timeout_secs
            );
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            bail!(
                "unknown log level '{}', expected one of {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            );
        }
        if !EXECUTION_POLICIES
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&self.execution_policy))
        {
            bail!("unknown PowerShell execution policy '{}'", self.execution_policy);
        }
        if self.powershell_path.trim().is_empty() {
            bail!("PowerShell path must not be empty");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("host is not an IP address: {}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Debug mode always logs at debug level
    pub fn effective_log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }

    pub fn timeout_strategy(&self) -> TimeoutStrategy {
        TimeoutStrategy::with_timeout(self.command_timeout_secs)
    }

    /// Grouped view of the effective settings, for `show-config`
    pub fn summary(&self) -> serde_json::Value {
        json!({
            "server": {
                "host": self.host,
                "port": self.port,
                "debug": self.debug,
            },
            "logging": {
                "level": self.effective_log_level(),
                "format": logging::LOG_FORMAT,
            },
            "powershell": {
                "path": self.powershell_path,
                "timeout": self.command_timeout_secs,
                "execution_policy": self.execution_policy,
                "require_admin": self.require_admin,
            },
            "service": {
                "name": SERVICE_NAME,
                "version": VERSION,
            }
        })
    }
}

/// First key that is set, with its value
fn first_of<F>(lookup: &F, keys: &[&'static str]) -> Option<(&'static str, String)>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter()
        .find_map(|key| lookup(key).map(|value| (*key, value)))
}

fn parse_flag(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}
