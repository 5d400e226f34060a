//! Configuring certwatchd.
//!
//! The configuration is loaded from a YAML file, overridden from
//! `TLS_MONITOR_*` environment variables and validated. The resulting
//! [`Config`] is an immutable snapshot; the hot-reload coordinator replaces
//! the whole snapshot atomically rather than mutating it in place.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// The environment variable prefix for configuration overrides.
const ENV_PREFIX: &str = "TLS_MONITOR_";

/// File extensions recognized as certificate files (lower case).
pub const SUPPORTED_EXTENSIONS: &[&str] = &["pem", "crt", "cer", "cert", "der", "p12", "pfx"];

/// Directories that must never be monitored.
///
/// Entries containing `*` match a single path component at that position.
const FORBIDDEN_PATHS: &[&str] = &[
    "/etc/shadow",
    "/etc/passwd",
    "/etc/sudoers",
    "/private/etc/shadow",
    "/private/etc/passwd",
    "/proc",
    "/sys",
    "/dev",
    "/root/.ssh",
    "/home/*/.ssh",
    "/Users/*/.ssh",
    "/var/log/auth.log",
    "/var/log/secure",
];

//------------ TimeSpan ------------------------------------------------------

/// A duration in the `^\d+[smhd]$` grammar, e.g. `30s`, `5m`, `1h`, `7d`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeSpan {
    secs: u64,
}

impl TimeSpan {
    pub fn from_secs(secs: u64) -> Self {
        Self { secs }
    }

    pub fn as_secs(&self) -> u64 {
        self.secs
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.secs)
    }
}

impl FromStr for TimeSpan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.is_ascii() || s.len() < 2 {
            return Err(format!(
                "invalid duration '{s}': expected e.g. '30s', '5m', '1h'"
            ));
        }
        let (digits, unit) = s.split_at(s.len() - 1);
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{s}': expected e.g. '30s', '5m', '1h'"))?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!(
                "invalid duration '{s}': expected e.g. '30s', '5m', '1h'"
            ));
        }
        let multiplier = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            _ => {
                return Err(format!(
                    "invalid duration '{s}': unit must be one of s, m, h, d"
                ))
            }
        };
        Ok(Self {
            secs: value * multiplier,
        })
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.secs;
        if secs != 0 && secs % 86400 == 0 {
            write!(f, "{}d", secs / 86400)
        } else if secs != 0 && secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{secs}s")
        }
    }
}

impl Serialize for TimeSpan {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeSpan {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

//------------ LogLevel ------------------------------------------------------

/// The minimum severity of messages to log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            _ => Err(format!(
                "invalid log level '{s}': expected DEBUG, INFO, WARNING, ERROR or CRITICAL"
            )),
        }
    }
}

//------------ CacheType -----------------------------------------------------

/// Where cached parse results live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Memory,
    File,
    Both,
}

impl CacheType {
    /// Whether this cache type keeps a disk snapshot.
    pub fn persists(&self) -> bool {
        matches!(self, Self::File | Self::Both)
    }
}

impl FromStr for CacheType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "both" => Ok(Self::Both),
            _ => Err(format!(
                "invalid cache type '{s}': expected memory, file or both"
            )),
        }
    }
}

//------------ Config --------------------------------------------------------

/// A validated configuration snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Server settings.
    pub port: u16,
    pub bind_address: String,

    // TLS settings for the metrics endpoint.
    pub tls_cert: Option<Utf8PathBuf>,
    pub tls_key: Option<Utf8PathBuf>,

    // Certificate monitoring.
    pub certificate_directories: Vec<Utf8PathBuf>,
    pub exclude_directories: Vec<Utf8PathBuf>,
    pub exclude_file_patterns: Vec<String>,

    // PKCS#12 passwords to attempt, in order.
    pub p12_passwords: Vec<String>,

    // Scan settings.
    pub scan_interval: TimeSpan,
    pub workers: usize,

    // Logging.
    pub log_level: LogLevel,
    pub log_file: Option<Utf8PathBuf>,

    // Operation modes.
    pub dry_run: bool,
    pub hot_reload: bool,

    // Cache settings.
    pub cache_type: CacheType,
    pub cache_dir: Utf8PathBuf,
    pub cache_ttl: TimeSpan,
    pub cache_max_size: u64,

    // Security settings.
    pub allowed_ips: Vec<String>,
    pub enable_ip_whitelist: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3200,
            bind_address: "0.0.0.0".into(),
            tls_cert: None,
            tls_key: None,
            certificate_directories: vec!["/etc/ssl/certs".into()],
            exclude_directories: Vec::new(),
            exclude_file_patterns: vec!["dhparam.pem".into()],
            p12_passwords: vec![
                // The empty password plus the usual keystore defaults.
                "".into(),
                "changeit".into(),
                "password".into(),
                "123456".into(),
            ],
            scan_interval: TimeSpan::from_secs(300),
            workers: 4,
            log_level: LogLevel::Info,
            log_file: None,
            dry_run: false,
            hot_reload: true,
            cache_type: CacheType::Memory,
            cache_dir: "./cache".into(),
            cache_ttl: TimeSpan::from_secs(3600),
            cache_max_size: 10 * 1024 * 1024,
            allowed_ips: vec!["127.0.0.1".into(), "::1".into()],
            enable_ip_whitelist: true,
        }
    }
}

impl Config {
    /// Whether a certificate file name has a supported extension.
    pub fn is_supported_extension(path: &Utf8Path) -> bool {
        path.extension()
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                SUPPORTED_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
    }

    /// Whether a client address passes the IP allow-list.
    ///
    /// Bare addresses match exactly; CIDR entries match by containment.
    /// Invalid entries are skipped with a warning.
    pub fn ip_allowed(&self, client: IpAddr) -> bool {
        for allowed in &self.allowed_ips {
            if allowed.contains('/') {
                match allowed.parse::<IpNet>() {
                    Ok(net) => {
                        if net.contains(&client) {
                            return true;
                        }
                    }
                    Err(err) => warn!("Invalid IP configuration '{allowed}': {err}"),
                }
            } else {
                match allowed.parse::<IpAddr>() {
                    Ok(addr) => {
                        if addr == client {
                            return true;
                        }
                    }
                    Err(err) => warn!("Invalid IP configuration '{allowed}': {err}"),
                }
            }
        }
        false
    }

    /// Compile the exclude-file patterns, dropping invalid ones with a
    /// warning. Matching is case-insensitive, like the rest of discovery.
    pub fn compiled_exclude_patterns(&self) -> Vec<Regex> {
        self.exclude_file_patterns
            .iter()
            .filter_map(|pattern| {
                match regex::RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                {
                    Ok(re) => Some(re),
                    Err(err) => {
                        warn!("Invalid regex pattern '{pattern}': {err}");
                        None
                    }
                }
            })
            .collect()
    }

    /// Validate and normalize the configuration in place.
    ///
    /// Unsafe monitored directories and invalid allow-list entries are
    /// dropped; out-of-range scalar values are clamped with a warning.
    fn validate(&mut self) {
        if self.port == 0 {
            warn!("Invalid port 0; falling back to 3200");
            self.port = 3200;
        }

        if !(1..=32).contains(&self.workers) {
            let clamped = self.workers.clamp(1, 32);
            warn!("workers must be between 1 and 32; clamping {} to {clamped}", self.workers);
            self.workers = clamped;
        }

        self.certificate_directories = validate_directories(&self.certificate_directories);
        self.allowed_ips = validate_allowed_ips(&self.allowed_ips);

        // Surface invalid exclude patterns at load time; discovery drops
        // them again on every scan.
        let _ = self.compiled_exclude_patterns();
    }
}

/// Resolve and filter the monitored directories.
fn validate_directories(dirs: &[Utf8PathBuf]) -> Vec<Utf8PathBuf> {
    let mut validated = Vec::new();

    for dir in dirs {
        // Resolve symlinks where possible; a directory that does not exist
        // yet is kept (it may be created later, e.g. in containers).
        let resolved = match dir.canonicalize_utf8() {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("Certificate directory does not exist: {dir}");
                dir.clone()
            }
            Err(err) => {
                error!("Invalid certificate directory {dir}: {err}");
                continue;
            }
        };

        if is_forbidden_path(resolved.as_str()) {
            error!("Access to directory {dir} is forbidden for security reasons");
            continue;
        }

        if resolved.exists() && !resolved.is_dir() {
            error!("Certificate directory path is not a directory: {dir}");
            continue;
        }

        validated.push(resolved);
    }

    if validated.is_empty() {
        warn!("No valid certificate directories configured");
    }

    validated
}

/// Whether a resolved path equals or descends into a forbidden location.
fn is_forbidden_path(path: &str) -> bool {
    FORBIDDEN_PATHS.iter().any(|forbidden| {
        if forbidden.contains('*') {
            let pattern = format!("^{}", regex::escape(forbidden).replace(r"\*", "[^/]*"));
            Regex::new(&pattern)
                .map(|re| re.is_match(path))
                .unwrap_or(false)
        } else {
            path == *forbidden || path.starts_with(forbidden)
        }
    })
}

/// Drop invalid allow-list entries and ensure localhost is present.
fn validate_allowed_ips(ips: &[String]) -> Vec<String> {
    let mut validated: Vec<String> = Vec::new();

    for entry in ips {
        let valid = if entry.contains('/') {
            entry.parse::<IpNet>().is_ok()
        } else {
            entry.parse::<IpAddr>().is_ok()
        };
        if valid {
            validated.push(entry.clone());
        } else {
            error!("Invalid IP address or network '{entry}'");
        }
    }

    // Localhost must always be able to reach the health endpoint.
    for localhost in ["127.0.0.1", "::1"] {
        if !validated.iter().any(|ip| ip == localhost) {
            info!("Added {localhost} to allowed IPs for localhost access");
            validated.push(localhost.into());
        }
    }

    validated
}

//------------ Loading -------------------------------------------------------

/// An error that prevented the configuration from loading.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file does not exist.
    Missing(Utf8PathBuf),

    /// The configuration file could not be read.
    Read(Utf8PathBuf, io::Error),

    /// The configuration file could not be parsed.
    Parse(serde_yaml::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(path) => write!(f, "configuration file not found: {path}"),
            Self::Read(path, err) => write!(f, "could not read {path}: {err}"),
            Self::Parse(err) => write!(f, "could not parse configuration: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load the configuration from a file and the environment.
///
/// A missing file is fatal when one was explicitly requested. Environment
/// variables override file values; invalid overrides are skipped with a
/// warning.
pub fn load(path: Option<&Utf8Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::Missing(path.to_owned()));
            }
            let text = std::fs::read_to_string(path)
                .map_err(|err| ConfigError::Read(path.to_owned(), err))?;
            serde_yaml::from_str(&text).map_err(ConfigError::Parse)?
        }
        None => Config::default(),
    };

    apply_env_overrides(&mut config);
    config.validate();
    Ok(config)
}

/// Parse a boolean override: `true`, `1` and `yes` (case-insensitive) are
/// true, anything else is false.
fn env_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// Split a comma-separated override into trimmed entries.
fn env_list(value: &str) -> Vec<String> {
    value.split(',').map(|s| s.trim().to_string()).collect()
}

fn apply_env_overrides(config: &mut Config) {
    fn get(name: &str) -> Option<String> {
        std::env::var(format!("{ENV_PREFIX}{name}")).ok()
    }

    fn set_parsed<T: FromStr>(name: &str, dst: &mut T)
    where
        T::Err: fmt::Display,
    {
        if let Some(value) = get(name) {
            match value.parse() {
                Ok(parsed) => *dst = parsed,
                Err(err) => warn!("Invalid value for {ENV_PREFIX}{name}: {value} - {err}"),
            }
        }
    }

    set_parsed("PORT", &mut config.port);
    if let Some(value) = get("BIND_ADDRESS") {
        config.bind_address = value;
    }
    if let Some(value) = get("TLS_CERT") {
        config.tls_cert = Some(value.into());
    }
    if let Some(value) = get("TLS_KEY") {
        config.tls_key = Some(value.into());
    }
    set_parsed("SCAN_INTERVAL", &mut config.scan_interval);
    set_parsed("WORKERS", &mut config.workers);
    set_parsed("LOG_LEVEL", &mut config.log_level);
    if let Some(value) = get("LOG_FILE") {
        config.log_file = Some(value.into());
    }
    if let Some(value) = get("DRY_RUN") {
        config.dry_run = env_bool(&value);
    }
    if let Some(value) = get("HOT_RELOAD") {
        config.hot_reload = env_bool(&value);
    }
    set_parsed("CACHE_TYPE", &mut config.cache_type);
    if let Some(value) = get("CACHE_DIR") {
        config.cache_dir = value.into();
    }
    set_parsed("CACHE_TTL", &mut config.cache_ttl);
    set_parsed("CACHE_MAX_SIZE", &mut config.cache_max_size);
    if let Some(value) = get("ENABLE_IP_WHITELIST") {
        config.enable_ip_whitelist = env_bool(&value);
    }

    if let Some(value) = get("CERT_DIRECTORIES") {
        config.certificate_directories = env_list(&value).into_iter().map(Into::into).collect();
    }
    if let Some(value) = get("EXCLUDE_DIRECTORIES") {
        config.exclude_directories = env_list(&value).into_iter().map(Into::into).collect();
    }
    if let Some(value) = get("EXCLUDE_FILE_PATTERNS") {
        config.exclude_file_patterns = env_list(&value);
    }
    if let Some(value) = get("P12_PASSWORDS") {
        config.p12_passwords = env_list(&value);
    }
    if let Some(value) = get("ALLOWED_IPS") {
        config.allowed_ips = env_list(&value);
    }
}
