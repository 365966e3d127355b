//! Environment-driven configuration, mirroring `envconfig.InitWithPrefix(&cfg, "APP")`
//! from the original Go service: every key is read with an `APP_` prefix and a default.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

const PREFIX: &str = "APP";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} is not a valid {expected}: {value:?}")]
    Invalid { key: &'static str, expected: &'static str, value: String },
}

/// The log level vocabulary spec'd for `APP_LOG_LEVEL`. `fatal` and `panic` both map onto
/// `tracing::Level::ERROR`, the most severe level `tracing` has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(raw: &str) -> Option<LogLevel> {
        match raw.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" | "fatal" | "panic" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// The aggregator's full runtime configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub tcp_addr: SocketAddr,
    pub tcp_buffer_size: usize,
    pub metrics_addr: SocketAddr,
    pub log_level: LogLevel,
    /// `0` means auto (let Tokio pick based on available parallelism).
    pub max_procs: usize,
    pub expiration_time: Duration,
    pub ingress_queue_size: usize,
    /// Accepted and recorded per spec, but routing always serves self-metrics at `/metricz`
    /// regardless of this value; see `DESIGN.md`.
    pub metrics_path: String,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Testable indirection over `std::env::var`, so tests don't need to mutate the real
    /// process environment.
    fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let tcp_host = get(&lookup, "TCP_HOST", "0.0.0.0");
        let tcp_port = get(&lookup, "TCP_PORT", "8080");
        let metrics_host = get(&lookup, "METRICS_HOST", "0.0.0.0");
        let metrics_port = get(&lookup, "METRICS_PORT", "9090");

        Ok(Config {
            tcp_addr: parse_addr("TCP_HOST/TCP_PORT", &tcp_host, &tcp_port)?,
            tcp_buffer_size: parse(&lookup, "TCP_BUFFER_SIZE", "65536", "unsigned integer")?,
            metrics_addr: parse_addr("METRICS_HOST/METRICS_PORT", &metrics_host, &metrics_port)?,
            log_level: {
                let raw = get(&lookup, "LOG_LEVEL", "info");
                LogLevel::parse(&raw).ok_or_else(|| ConfigError::Invalid {
                    key: "LOG_LEVEL",
                    expected: "one of debug/info/warn/error/fatal/panic",
                    value: raw.clone(),
                })?
            },
            max_procs: parse(&lookup, "MAX_PROCS", "0", "unsigned integer")?,
            expiration_time: {
                let raw = get(&lookup, "EXPIRATION_TIME", "100");
                let secs: u64 = raw.parse().map_err(|_| ConfigError::Invalid {
                    key: "EXPIRATION_TIME",
                    expected: "unsigned integer",
                    value: raw.clone(),
                })?;
                if secs == 0 {
                    return Err(ConfigError::Invalid {
                        key: "EXPIRATION_TIME",
                        expected: "a positive number of seconds (0 would evict every child immediately)",
                        value: raw,
                    });
                }
                Duration::from_secs(secs)
            },
            ingress_queue_size: parse(&lookup, "INGRESS_QUEUE_SIZE", "102400", "unsigned integer")?,
            metrics_path: get(&lookup, "METRICS_PATH", "/metrics"),
        })
    }

    /// The expiration sweep's tick interval: equal to the TTL. `from_source` parses
    /// `EXPIRATION_TIME` in whole seconds and rejects zero, so this is always >= 1s already.
    pub fn expiration_tick(&self) -> Duration {
        self.expiration_time
    }
}

fn get(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(&format!("{PREFIX}_{key}")).unwrap_or_else(|| default.to_string())
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    let raw = get(lookup, key, default);
    raw.parse().map_err(|_| ConfigError::Invalid { key, expected, value: raw })
}

fn parse_addr(key: &'static str, host: &str, port: &str) -> Result<SocketAddr, ConfigError> {
    let ip: IpAddr = host.parse().map_err(|_| ConfigError::Invalid {
        key,
        expected: "an IP address",
        value: host.to_string(),
    })?;
    let port: u16 = port.parse().map_err(|_| ConfigError::Invalid {
        key,
        expected: "a 16-bit port number",
        value: port.to_string(),
    })?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (format!("APP_{k}"), v.to_string())).collect();
        Config::from_source(move |key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_set() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.tcp_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.metrics_addr, "0.0.0.0:9090".parse().unwrap());
        assert_eq!(cfg.tcp_buffer_size, 65536);
        assert_eq!(cfg.ingress_queue_size, 102400);
        assert_eq!(cfg.expiration_time, Duration::from_secs(100));
        assert_eq!(cfg.log_level, LogLevel::Info);
        assert_eq!(cfg.max_procs, 0);
    }

    #[test]
    fn overrides_from_environment() {
        let cfg = config_from(&[("TCP_PORT", "9999"), ("LOG_LEVEL", "DEBUG"), ("MAX_PROCS", "4")]).unwrap();
        assert_eq!(cfg.tcp_addr.port(), 9999);
        assert_eq!(cfg.log_level, LogLevel::Debug);
        assert_eq!(cfg.max_procs, 4);
    }

    #[test]
    fn rejects_invalid_log_level() {
        let err = config_from(&[("LOG_LEVEL", "verbose")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "LOG_LEVEL", .. }));
    }

    #[test]
    fn maps_fatal_and_panic_to_error_level() {
        assert_eq!(config_from(&[("LOG_LEVEL", "fatal")]).unwrap().log_level, LogLevel::Error);
        assert_eq!(config_from(&[("LOG_LEVEL", "panic")]).unwrap().log_level, LogLevel::Error);
    }

    #[test]
    fn rejects_zero_expiration_time() {
        let err = config_from(&[("EXPIRATION_TIME", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "EXPIRATION_TIME", .. }));
    }

    #[test]
    fn expiration_tick_matches_expiration_time() {
        let cfg = config_from(&[("EXPIRATION_TIME", "42")]).unwrap();
        assert_eq!(cfg.expiration_tick(), Duration::from_secs(42));
    }
}
