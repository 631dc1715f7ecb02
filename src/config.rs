use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::session::USER_AGENT;

pub const DEFAULT_HOST: &str = "www.tesla.com";
pub const DEFAULT_ACCOUNT_PATH: &str = "teslaaccount";
pub const DEFAULT_CONFIG_FILE: &str = ".tesladeliverydate";

/// Delay after a failed login or fetch before trying again.
pub const COOLDOWN: Duration = Duration::from_secs(60);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest accepted poll interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(366 * 24 * 3600);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no {0} specified")]
    Missing(&'static str),
}

/// Account credentials and the reservation to watch.
///
/// Keys in the file match regardless of case (`Username`, `username`,
/// `USERNAME`).
#[derive(Clone, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub reservation: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("reservation", &self.reservation)
            .finish()
    }
}

impl Credentials {
    /// Load credentials from a JSON file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let parse_err = |source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        };
        let raw: Map<String, Value> = serde_json::from_str(content).map_err(parse_err)?;
        let folded: Map<String, Value> = raw
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        let creds: Credentials =
            serde_json::from_value(Value::Object(folded)).map_err(parse_err)?;
        creds.validate()?;
        Ok(creds)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.username.is_empty() {
            return Err(ConfigError::Missing("username"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Missing("password"));
        }
        if self.reservation.is_empty() {
            return Err(ConfigError::Missing("reservation"));
        }
        Ok(())
    }
}

/// Default config location: `$HOME/.tesladeliverydate`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_CONFIG_FILE)
}

/// Where the account portal lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub host: String,
    pub account_path: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            account_path: DEFAULT_ACCOUNT_PATH.to_string(),
        }
    }
}

impl Endpoints {
    pub fn new(host: &str, account_path: &str) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            account_path: account_path.trim_matches('/').to_string(),
        }
    }

    pub fn login_url(&self) -> String {
        format!(
            "https://{}/user/login/?destination=/{}",
            self.host, self.account_path
        )
    }

    pub fn profile_url(&self, reservation: &str) -> String {
        format!(
            "https://{}/{}/profile?rn={}",
            self.host, self.account_path, reservation
        )
    }
}

/// Everything the monitor needs, fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub credentials: Credentials,
    pub endpoints: Endpoints,
    pub interval: Duration,
    pub cooldown: Duration,
    pub user_agent: String,
}

impl Settings {
    pub fn new(credentials: Credentials, endpoints: Endpoints, interval: Duration) -> Self {
        Self {
            credentials,
            endpoints,
            interval: interval.min(MAX_INTERVAL),
            cooldown: COOLDOWN,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

/// Parse a duration like `90s`, `15m`, `1h30m` or a bare number of seconds.
/// Anything longer than [`MAX_INTERVAL`] is rejected.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let too_large = || format!("duration '{}' too large", s);
    if let Ok(secs) = s.parse::<u64>() {
        return bounded(s, Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(format!("invalid duration '{}'", s));
        }
        let n: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{}'", s))?;
        digits.clear();
        let unit = match c {
            'h' => n.checked_mul(3600).map(Duration::from_secs),
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Some(Duration::from_millis(n))
            }
            'm' => n.checked_mul(60).map(Duration::from_secs),
            's' => Some(Duration::from_secs(n)),
            _ => return Err(format!("unknown unit '{}' in duration '{}'", c, s)),
        };
        total = unit
            .and_then(|u| total.checked_add(u))
            .ok_or_else(too_large)?;
    }
    if !digits.is_empty() {
        return Err(format!("missing unit in duration '{}'", s));
    }
    bounded(s, total)
}

fn bounded(s: &str, d: Duration) -> Result<Duration, String> {
    if d > MAX_INTERVAL {
        return Err(format!("duration '{}' too large", s));
    }
    if d.is_zero() {
        return Err("duration must be positive".to_string());
    }
    Ok(d)
}
