// src/config.rs

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::ConfigError;
use crate::sys::secrets::SecretSource;

// 🛡️ No leading '-': these end up as ssh arguments.
static HOST_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("host pattern compiles"));
static USER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]*$").expect("user pattern compiles"));

const TUNNEL_KEYS: [&str; 9] = [
    "CRAFT_SSH",
    "CRAFT_TUNNEL_HOST",
    "CRAFT_TUNNEL_USER",
    "CRAFT_TUNNEL_PORT",
    "CRAFT_TUNNEL_KEY",
    "CRAFT_TUNNEL_LOCAL_PORT",
    "CRAFT_TUNNEL_REMOTE_HOST",
    "CRAFT_TUNNEL_REMOTE_PORT",
    "CRAFT_TUNNEL_TIMEOUT_SECS",
];

#[derive(Clone, Debug)]
pub struct PilotConfig {
    // 📂 Delegated executables
    pub simulator_path: PathBuf,
    pub library_path: String,
    pub python: String,
    pub runtime_dir: PathBuf,

    // 🛡️ Secrets & forwarding
    pub secret_source: SecretSource,
    pub tunnel: TunnelSettings,
}

/// Raw `CRAFT_TUNNEL_*` values. They are only validated when a tunnel is
/// actually opened, so a typo here never blocks modes that run without one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TunnelSettings {
    raw: BTreeMap<&'static str, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelConfig {
    pub ssh_program: String,
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub ready_timeout: Duration,
}

impl TunnelConfig {
    /// `user@host` or bare `host`, as ssh expects it.
    pub fn destination(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        Some(match &self.user {
            Some(user) => format!("{}@{}", user, host),
            None => host.to_string(),
        })
    }
}

impl PilotConfig {
    /// Reads `CRAFT_*` variables from the process environment.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| non_empty(lookup(key));
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let secret_source = match get("CRAFT_SECRET_COMMAND") {
            Some(template) => SecretSource::Command(template),
            None => SecretSource::Directory(PathBuf::from(or("CRAFT_SECRET_DIR", "/run/secrets"))),
        };

        Self {
            simulator_path: PathBuf::from(or("CRAFT_SIMULATOR", "target/release/craft-simulator")),
            library_path: or("CRAFT_LIBRARY_PATH", "/workdir/target/release/"),
            python: or("CRAFT_PYTHON", "python3"),
            runtime_dir: PathBuf::from(or("CRAFT_RUNTIME_DIR", "pysrc")),
            secret_source,
            tunnel: TunnelSettings::from_lookup(&lookup),
        }
    }
}

impl TunnelSettings {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let raw = TUNNEL_KEYS
            .iter()
            .filter_map(|&key| non_empty(lookup(key)).map(|value| (key, value)))
            .collect();
        Self { raw }
    }

    pub fn resolve(&self) -> Result<TunnelConfig, ConfigError> {
        let get = |key: &str| self.raw.get(key).cloned();
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let host = get("CRAFT_TUNNEL_HOST");
        if let Some(host) = &host {
            check_pattern("CRAFT_TUNNEL_HOST", host, &HOST_PATTERN)?;
        }
        let user = get("CRAFT_TUNNEL_USER");
        if let Some(user) = &user {
            check_pattern("CRAFT_TUNNEL_USER", user, &USER_PATTERN)?;
        }
        let remote_host = or("CRAFT_TUNNEL_REMOTE_HOST", "127.0.0.1");
        check_pattern("CRAFT_TUNNEL_REMOTE_HOST", &remote_host, &HOST_PATTERN)?;

        Ok(TunnelConfig {
            ssh_program: or("CRAFT_SSH", "ssh"),
            host,
            user,
            port: parse_port("CRAFT_TUNNEL_PORT", get("CRAFT_TUNNEL_PORT"), 22)?,
            identity_file: get("CRAFT_TUNNEL_KEY").map(PathBuf::from),
            local_port: parse_port("CRAFT_TUNNEL_LOCAL_PORT", get("CRAFT_TUNNEL_LOCAL_PORT"), 3306)?,
            remote_host,
            remote_port: parse_port("CRAFT_TUNNEL_REMOTE_PORT", get("CRAFT_TUNNEL_REMOTE_PORT"), 3306)?,
            ready_timeout: parse_timeout(get("CRAFT_TUNNEL_TIMEOUT_SECS"))?,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn check_pattern(key: &'static str, value: &str, pattern: &Regex) -> Result<(), ConfigError> {
    if pattern.is_match(value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            key,
            reason: format!("`{}` contains characters ssh would misread", value),
        })
    }
}

fn parse_port(key: &'static str, raw: Option<String>, default: u16) -> Result<u16, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    // Port 0 would let the kernel pick, which the readiness probe cannot follow.
    match raw.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ConfigError::Invalid {
            key,
            reason: format!("`{}` is not a port number", raw),
        }),
    }
}

fn parse_timeout(raw: Option<String>) -> Result<Duration, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Duration::from_secs(15));
    };
    match raw.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Ok(Duration::from_secs_f64(secs)),
        _ => Err(ConfigError::Invalid {
            key: "CRAFT_TUNNEL_TIMEOUT_SECS",
            reason: format!("`{}` is not a positive number of seconds", raw),
        }),
    }
}
