use crate::auth::{AuthPolicy, HostnameRule, PolicyKind};
use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the agent configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/trafic/config.toml";

/// Agent configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Top-level domain projects are served under (`<project>.<tld>`). Required.
    #[serde(default)]
    pub tld: String,

    /// Front door port (default: 9876)
    #[serde(default = "default_port")]
    pub port: u32,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// SQLite registry location
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// YAML list of known projects maintained by the project tool
    #[serde(default = "default_project_list_path")]
    pub project_list_path: String,

    /// Directory holding `wait.html` and `error.html` (inline pages when unset)
    pub templates_dir: Option<String>,

    /// Default idle time before a project is stopped, e.g. "30m"
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,

    /// How often the idle evictor runs
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval: String,

    /// Fallback poll of the project list in case file events are missed
    #[serde(default = "default_project_poll_interval")]
    pub project_poll_interval: String,

    /// Access log rows older than this are pruned
    #[serde(default = "default_access_log_retain_days")]
    pub access_log_retain_days: u32,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub control: ControlConfig,

    /// File this configuration was loaded from, archived by backups
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// allow | deny | basic | token (default: basic)
    #[serde(default = "default_policy")]
    pub default_policy: String,

    /// Realm announced in `WWW-Authenticate`
    #[serde(default = "default_realm")]
    pub realm: String,

    #[serde(default)]
    pub allowed_ips: Vec<String>,

    #[serde(default)]
    pub tokens: Vec<String>,

    /// `user:pass` pairs
    #[serde(default)]
    pub basic_auth: Vec<String>,

    /// Per-hostname rules, first match wins
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            default_policy: default_policy(),
            realm: default_realm(),
            allowed_ips: Vec::new(),
            tokens: Vec::new(),
            basic_auth: Vec::new(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuleConfig {
    /// Hostname glob
    #[serde(rename = "match")]
    pub pattern: String,

    pub policy: String,

    pub tokens: Option<Vec<String>>,

    pub allowed_ips: Option<Vec<String>>,

    pub basic_auth: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackupConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Local hour (0-23) after which the daily backup runs
    #[serde(default = "default_schedule_hour")]
    pub schedule_hour: u32,

    /// Date directories older than this many days are removed
    #[serde(default = "default_retain_days")]
    pub retain_days: u32,

    #[serde(default = "default_backup_dir")]
    pub local_dir: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule_hour: default_schedule_hour(),
            retain_days: default_retain_days(),
            local_dir: default_backup_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    /// Project tool executable
    #[serde(default = "default_control_binary")]
    pub binary: String,

    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    #[serde(default = "default_describe_timeout")]
    pub describe_timeout_secs: u64,

    #[serde(default = "default_transfer_timeout")]
    pub export_timeout_secs: u64,

    #[serde(default = "default_transfer_timeout")]
    pub import_timeout_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            binary: default_control_binary(),
            start_timeout_secs: default_start_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            describe_timeout_secs: default_describe_timeout(),
            export_timeout_secs: default_transfer_timeout(),
            import_timeout_secs: default_transfer_timeout(),
        }
    }
}

impl ControlConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn describe_timeout(&self) -> Duration {
        Duration::from_secs(self.describe_timeout_secs)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }

    pub fn import_timeout(&self) -> Duration {
        Duration::from_secs(self.import_timeout_secs)
    }
}

fn default_port() -> u32 {
    9876
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_db_path() -> String {
    "/var/lib/trafic/db.sqlite".to_string()
}

fn default_project_list_path() -> String {
    "/home/ddev/.ddev/project_list.yaml".to_string()
}

fn default_idle_timeout() -> String {
    "30m".to_string()
}

fn default_idle_check_interval() -> String {
    "5m".to_string()
}

fn default_project_poll_interval() -> String {
    "1m".to_string()
}

fn default_access_log_retain_days() -> u32 {
    30
}

fn default_policy() -> String {
    "basic".to_string()
}

fn default_realm() -> String {
    "Trafic".to_string()
}

fn default_schedule_hour() -> u32 {
    3
}

fn default_retain_days() -> u32 {
    7
}

fn default_backup_dir() -> String {
    "/var/backups/trafic".to_string()
}

fn default_control_binary() -> String {
    "ddev".to_string()
}

fn default_start_timeout() -> u64 {
    120
}

fn default_stop_timeout() -> u64 {
    60
}

fn default_describe_timeout() -> u64 {
    10
}

fn default_transfer_timeout() -> u64 {
    300
}

/// Parse a duration such as "45s", "30m", "1h", "2h30m" or "1d".
/// A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let invalid = || format!("invalid duration \"{}\"", input);

    let mut total: u64 = 0;
    let mut digits = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        let unit: u64 = match c.to_ascii_lowercase() {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => return Err(invalid()),
        };

        if digits.is_empty() {
            return Err(invalid());
        }

        let value: u64 = digits.parse().map_err(|_| invalid())?;
        total = value
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(invalid());
    }

    Ok(Duration::from_secs(total))
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.source_path = Some(path.to_path_buf());
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration held in memory
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.tld.trim().is_empty() {
            errors.push("tld is required".to_string());
        }

        if self.port == 0 || self.port > u16::MAX as u32 {
            errors.push(format!("port must be between 1 and 65535 (got {})", self.port));
        }

        for (field, value) in [
            ("idle_timeout", &self.idle_timeout),
            ("idle_check_interval", &self.idle_check_interval),
            ("project_poll_interval", &self.project_poll_interval),
        ] {
            match parse_duration(value) {
                Ok(d) if d.is_zero() => errors.push(format!("{} must be greater than zero", field)),
                Ok(_) => {}
                Err(e) => errors.push(format!("{}: {}", field, e)),
            }
        }

        if let Err(e) = self.auth.default_policy.parse::<PolicyKind>() {
            errors.push(format!("auth.default_policy: {}", e));
        }

        for (i, rule) in self.auth.rules.iter().enumerate() {
            if rule.pattern.trim().is_empty() {
                errors.push(format!("auth.rules[{}]: match pattern must not be empty", i));
            }
            if let Err(e) = rule.policy.parse::<PolicyKind>() {
                errors.push(format!("auth.rules[{}] ({}): {}", i, rule.pattern, e));
            }
        }

        if self.backup.schedule_hour > 23 {
            errors.push(format!(
                "backup.schedule_hour must be between 0 and 23 (got {})",
                self.backup.schedule_hour
            ));
        }

        if self.control.binary.trim().is_empty() {
            errors.push("control.binary must not be empty".to_string());
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(())
    }

    pub fn port(&self) -> u16 {
        u16::try_from(self.port).unwrap_or(default_port() as u16)
    }

    pub fn idle_timeout(&self) -> Duration {
        parse_duration(&self.idle_timeout).unwrap_or(Duration::from_secs(30 * 60))
    }

    pub fn idle_check_interval(&self) -> Duration {
        parse_duration(&self.idle_check_interval).unwrap_or(Duration::from_secs(5 * 60))
    }

    pub fn project_poll_interval(&self) -> Duration {
        parse_duration(&self.project_poll_interval).unwrap_or(Duration::from_secs(60))
    }

    /// Global authorization policy built from the `[auth]` table
    pub fn auth_policy(&self) -> AuthPolicy {
        let auth = &self.auth;
        AuthPolicy {
            default_policy: auth.default_policy.parse().unwrap_or(PolicyKind::Basic),
            allowed_ips: auth.allowed_ips.clone(),
            tokens: auth.tokens.clone(),
            basic_auth: auth.basic_auth.clone(),
            rules: auth
                .rules
                .iter()
                .filter_map(|rule| {
                    let policy = rule.policy.parse().ok()?;
                    Some(HostnameRule {
                        pattern: rule.pattern.trim().to_string(),
                        policy,
                        tokens: rule.tokens.clone(),
                        allowed_ips: rule.allowed_ips.clone(),
                        basic_auth: rule.basic_auth.clone(),
                    })
                })
                .collect(),
        }
    }
}
