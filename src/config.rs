use crate::signals;
use nix::sys::signal::Signal;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

/// Default poll interval shared by all sentinels.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Whole-string shape of a duration: one or more `<number><unit>` pairs.
static DURATION_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:\d+(?:\.\d*)?|\.\d+)(?:ns|us|µs|μs|ms|s|m|h))+$").unwrap()
});

/// A single `<number><unit>` component of a duration.
static DURATION_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d*)?|\.\d+)(ns|us|µs|μs|ms|s|m|h)").unwrap()
});

/// One `--watch` rule: when `path` changes, deliver `signal` to the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRule {
    pub path: PathBuf,
    pub signal: Signal,
}

/// Fully resolved supervisor configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub command: String,
    pub args: Vec<String>,
    pub watches: Vec<WatchRule>,
    pub interval: Duration,
    pub stop_timeout: Duration,
}

/// Values taken from the command line. `None` means "not given".
#[derive(Debug, Default)]
pub struct Overrides {
    pub config_file: Option<PathBuf>,
    pub command: Vec<String>,
    pub watches: Vec<WatchRule>,
    pub interval: Option<Duration>,
    pub stop_timeout: Option<Duration>,
}

/// Optional TOML configuration file.
///
/// ```toml
/// interval = "5s"
/// stop_timeout = "1m"
///
/// [[watch]]
/// path = "/etc/app/config.yaml"
/// signal = "SIGHUP"
/// ```
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub interval: Option<String>,
    pub stop_timeout: Option<String>,
    pub watch: Vec<WatchEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WatchEntry {
    pub path: PathBuf,
    pub signal: String,
}

/// Errors detected while assembling the configuration. All of them are fatal
/// and happen before any child is launched.
#[derive(Debug)]
pub enum ConfigError {
    /// A watch rule did not have exactly two `:`-separated fields.
    WatchFormat { rule: String },
    /// A watch rule named a signal that does not exist.
    UnknownSignal { rule: String, signal: String },
    /// A duration could not be parsed.
    InvalidDuration { value: String },
    /// The poll interval was zero.
    ZeroInterval,
    /// No child command was supplied.
    MissingCommand,
    /// The config file could not be read.
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for [`FileConfig`].
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::WatchFormat { rule } => {
                write!(
                    f,
                    "invalid watch rule '{rule}'. Format: '/file/path:SIGNAME'"
                )
            }
            ConfigError::UnknownSignal { rule, signal } => {
                write!(
                    f,
                    "invalid watch rule '{rule}'. Signal '{signal}' is not valid"
                )
            }
            ConfigError::InvalidDuration { value } => {
                write!(f, "invalid duration '{value}' (examples: 500ms, 10s, 1m30s)")
            }
            ConfigError::ZeroInterval => write!(f, "poll interval must be greater than zero"),
            ConfigError::MissingCommand => write!(f, "no main command defined"),
            ConfigError::ReadFile { path, source } => {
                write!(f, "failed to read config file {}: {}", path.display(), source)
            }
            ConfigError::ParseFile { path, source } => {
                write!(f, "failed to parse config file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFile { source, .. } => Some(source),
            ConfigError::ParseFile { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl FromStr for WatchRule {
    type Err = ConfigError;

    fn from_str(rule: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = rule.split(':').collect();
        let [path, signal] = fields.as_slice() else {
            return Err(ConfigError::WatchFormat {
                rule: rule.to_string(),
            });
        };
        if path.is_empty() {
            return Err(ConfigError::WatchFormat {
                rule: rule.to_string(),
            });
        }
        WatchRule::new(rule, *path, signal)
    }
}

impl WatchRule {
    fn new(rule: &str, path: impl Into<PathBuf>, signal: &str) -> Result<Self, ConfigError> {
        let signal = signals::resolve(signal).ok_or_else(|| ConfigError::UnknownSignal {
            rule: rule.to_string(),
            signal: signal.to_string(),
        })?;
        Ok(WatchRule {
            path: path.into(),
            signal,
        })
    }
}

/// clap value parser for `--watch`.
pub fn parse_watch_rule(rule: &str) -> Result<WatchRule, ConfigError> {
    rule.parse()
}

/// Parse a duration in the `300ms` / `1.5s` / `2m30s` style.
///
/// A bare `0` is accepted; any other number needs a unit
/// (`ns`, `us`, `µs`, `ms`, `s`, `m`, `h`).
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let trimmed = value.trim();
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }
    if !DURATION_SHAPE.is_match(trimmed) {
        return Err(ConfigError::InvalidDuration {
            value: value.to_string(),
        });
    }

    let mut total_nanos = 0f64;
    for caps in DURATION_PART.captures_iter(trimmed) {
        let amount: f64 = caps[1].parse().map_err(|_| ConfigError::InvalidDuration {
            value: value.to_string(),
        })?;
        let unit_nanos = match &caps[2] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => unreachable!("unit alternatives are fixed by DURATION_PART"),
        };
        total_nanos += amount * unit_nanos;
    }

    let total_nanos = total_nanos.round();
    if !total_nanos.is_finite() || total_nanos >= u64::MAX as f64 {
        return Err(ConfigError::InvalidDuration {
            value: value.to_string(),
        });
    }
    Ok(Duration::from_nanos(total_nanos as u64))
}

/// Read and parse a TOML config file.
pub fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::ParseFile {
        path: path.to_path_buf(),
        source: e,
    })
}

impl Config {
    /// Merge the optional config file with command-line values.
    ///
    /// Command-line durations win over file durations; command-line watch
    /// rules are appended after the file's rules.
    pub fn resolve(overrides: Overrides) -> Result<Config, ConfigError> {
        let file = match &overrides.config_file {
            Some(path) => load_file(path)?,
            None => FileConfig::default(),
        };
        Self::merge(file, overrides)
    }

    fn merge(file: FileConfig, overrides: Overrides) -> Result<Config, ConfigError> {
        let mut command = overrides.command.into_iter();
        let program = command.next().ok_or(ConfigError::MissingCommand)?;

        let mut watches = Vec::with_capacity(file.watch.len() + overrides.watches.len());
        for entry in file.watch {
            let rule = format!("{}:{}", entry.path.display(), entry.signal);
            watches.push(WatchRule::new(&rule, entry.path, &entry.signal)?);
        }
        watches.extend(overrides.watches);

        let interval = match (overrides.interval, file.interval.as_deref()) {
            (Some(d), _) => d,
            (None, Some(s)) => parse_duration(s)?,
            (None, None) => DEFAULT_INTERVAL,
        };
        if interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        let stop_timeout = match (overrides.stop_timeout, file.stop_timeout.as_deref()) {
            (Some(d), _) => d,
            (None, Some(s)) => parse_duration(s)?,
            (None, None) => DEFAULT_STOP_TIMEOUT,
        };

        Ok(Config {
            command: program,
            args: command.collect(),
            watches,
            interval,
            stop_timeout,
        })
    }
}
