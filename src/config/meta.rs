use rand::random;
use serde::{Deserialize, Serialize};
use tracing::Level;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MetaConfig {
    /// Drives gadget sampling and candidate order. Random when absent.
    #[serde(default = "random")]
    pub seed: i64,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl MetaConfig {
    /// The seed as the random number generators take it.
    pub fn rng_seed(&self) -> u64 {
        self.seed as u64
    }
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self { seed: random(), log_level: default_log_level() }
    }
}
