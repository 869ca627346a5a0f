//! Log level and format selection for the `pb-core` binary.
//!
//! Highest precedence first: CLI flags, `PB_LOG` and `PB_LOG_FORMAT`, the
//! level named in `RUST_LOG`, then `info` in human format.

use clap::ValueEnum;
use tracing_subscriber::filter::LevelFilter;

/// Crates whose events the binary shows.
const TARGETS: [&str; 3] = ["pb_core", "pb_arena", "pb_config"];

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Human,
    /// One JSON object per line, event fields flattened.
    #[value(alias = "json")]
    Jsonl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    #[value(alias = "warning")]
    Warn,
    Error,
    Off,
}

impl LogLevel {
    pub fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: LogLevel,
}

impl LogConfig {
    /// Resolve from the process environment, with CLI flags on top.
    pub fn from_env(cli_level: Option<LogLevel>, cli_format: Option<LogFormat>) -> Self {
        Self::resolve(|name| std::env::var(name).ok(), cli_level, cli_format)
    }

    /// Resolve against an arbitrary variable lookup. Unparseable values are
    /// ignored.
    pub fn resolve(
        var: impl Fn(&str) -> Option<String>,
        cli_level: Option<LogLevel>,
        cli_format: Option<LogFormat>,
    ) -> Self {
        let env_level = match var("PB_LOG") {
            Some(value) => LogLevel::from_str(&value, true).ok(),
            None => var("RUST_LOG").and_then(|value| level_from_directive(&value)),
        };
        let env_format =
            var("PB_LOG_FORMAT").and_then(|value| LogFormat::from_str(&value, true).ok());

        LogConfig {
            format: cli_format.or(env_format).unwrap_or_default(),
            level: cli_level.or(env_level).unwrap_or_default(),
        }
    }

    /// `EnvFilter` directive applying the level to the buffer crates only.
    pub fn directive(&self) -> String {
        let level = self.level.filter().to_string().to_lowercase();
        TARGETS
            .iter()
            .map(|target| format!("{target}={level}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// First level named in a `RUST_LOG` directive such as `pb_core=debug`.
fn level_from_directive(directive: &str) -> Option<LogLevel> {
    directive
        .split(',')
        .filter_map(|part| part.rsplit('=').next())
        .find_map(|level| LogLevel::from_str(level.trim(), true).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(vars: &[(&str, &str)]) -> LogConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogConfig::resolve(|name| vars.get(name).cloned(), None, None)
    }

    #[test]
    fn test_defaults_without_environment() {
        assert_eq!(resolve(&[]), LogConfig::default());
        assert_eq!(LogConfig::default().level, LogLevel::Info);
    }

    #[test]
    fn test_pb_log_shadows_rust_log() {
        let config = resolve(&[("PB_LOG", "error"), ("RUST_LOG", "pb_core=trace")]);
        assert_eq!(config.level, LogLevel::Error);

        let config = resolve(&[("RUST_LOG", "hyper=bogus,pb_core=warn")]);
        assert_eq!(config.level, LogLevel::Warn);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = resolve(&[("PB_LOG", "loud"), ("PB_LOG_FORMAT", "xml")]);
        assert_eq!(config, LogConfig::default());
    }

    #[test]
    fn test_cli_flags_win() {
        let vars: HashMap<&str, &str> = [("PB_LOG", "error"), ("PB_LOG_FORMAT", "human")].into();
        let config = LogConfig::resolve(
            |name| vars.get(name).map(|v| v.to_string()),
            Some(LogLevel::Debug),
            Some(LogFormat::Jsonl),
        );
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Jsonl);
    }

    #[test]
    fn test_aliases() {
        assert_eq!(resolve(&[("PB_LOG_FORMAT", "JSON")]).format, LogFormat::Jsonl);
        assert_eq!(resolve(&[("PB_LOG", "warning")]).level, LogLevel::Warn);
    }

    #[test]
    fn test_directive_covers_buffer_crates() {
        let config = LogConfig {
            level: LogLevel::Off,
            ..Default::default()
        };
        assert_eq!(config.directive(), "pb_core=off,pb_arena=off,pb_config=off");
    }
}
