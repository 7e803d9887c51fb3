// Run configuration: instrument sizing policies and session schedules
use crate::clock::{ClockError, SessionClock};
use chrono::{Duration, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-instrument sizing and bracket policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentPolicy {
    pub symbol: String,
    pub tick_size: f64,
    pub quantity: u32,
    /// Profit target distance in price units
    pub target_distance: f64,
    /// k in `stop = min(range, k * target)`
    #[serde(default = "default_stop_multiplier")]
    pub stop_multiplier: f64,
    /// Fraction of target distance that arms the break-even move
    #[serde(default = "default_breakeven_fraction")]
    pub breakeven_fraction: f64,
    #[serde(default = "default_breakeven_offset_ticks")]
    pub breakeven_offset_ticks: u32,
}

/// One trading session: a shared range start, several lock slots, one cutoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub name: String,
    #[serde(with = "hhmm")]
    pub range_start: NaiveTime,
    #[serde(with = "hhmm_vec")]
    pub slots: Vec<NaiveTime>,
    #[serde(with = "hhmm")]
    pub cutoff: NaiveTime,
    pub instruments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub timezone: String,
    #[serde(default = "default_bar_interval_secs")]
    pub bar_interval_secs: u64,
    #[serde(default = "default_backfill_timeout_secs")]
    pub backfill_timeout_secs: u64,
    #[serde(default = "default_journal_path")]
    pub journal_path: PathBuf,
    pub instruments: Vec<InstrumentPolicy>,
    pub sessions: Vec<SessionConfig>,
}

/// Everything needed to build one stream, independent of trading date
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub policy: Arc<InstrumentPolicy>,
    pub session: String,
    pub range_start: NaiveTime,
    pub slot: NaiveTime,
    pub cutoff: NaiveTime,
}

fn default_stop_multiplier() -> f64 {
    3.0
}

fn default_breakeven_fraction() -> f64 {
    0.65
}

fn default_breakeven_offset_ticks() -> u32 {
    1
}

fn default_bar_interval_secs() -> u64 {
    60
}

fn default_backfill_timeout_secs() -> u64 {
    30
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("data/execution_journal.jsonl")
}

impl EngineConfig {
    /// Load from a TOML file, with `RANGEBOT__*` environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(::config::Environment::with_prefix("RANGEBOT").separator("__"))
            .build()?;

        let cfg: EngineConfig = settings.try_deserialize()?;
        cfg.validate()?;

        tracing::info!(
            path = %path.display(),
            instruments = cfg.instruments.len(),
            sessions = cfg.sessions.len(),
            "Loaded configuration"
        );

        Ok(cfg)
    }

    /// Parse and validate an inline TOML document
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from_str(toml, ::config::FileFormat::Toml))
            .build()?;

        let cfg: EngineConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        SessionClock::from_name(&self.timezone)?;

        if self.bar_interval_secs == 0 {
            return Err(ConfigError::Invalid("bar_interval_secs must be > 0".into()));
        }

        let mut symbols = HashSet::new();
        for policy in &self.instruments {
            if !symbols.insert(policy.symbol.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate instrument {}",
                    policy.symbol
                )));
            }
            if !(policy.tick_size > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{}: tick_size must be > 0",
                    policy.symbol
                )));
            }
            if policy.quantity == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{}: quantity must be > 0",
                    policy.symbol
                )));
            }
            if !(policy.target_distance > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{}: target_distance must be > 0",
                    policy.symbol
                )));
            }
            if !(policy.stop_multiplier > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{}: stop_multiplier must be > 0",
                    policy.symbol
                )));
            }
            if !(policy.breakeven_fraction > 0.0 && policy.breakeven_fraction <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "{}: breakeven_fraction must be in (0, 1]",
                    policy.symbol
                )));
            }
        }

        let mut session_names = HashSet::new();
        for session in &self.sessions {
            if !session_names.insert(session.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate session {}",
                    session.name
                )));
            }
            if session.slots.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "session {} has no slots",
                    session.name
                )));
            }
            let mut slots = HashSet::new();
            for slot in &session.slots {
                if !slots.insert(*slot) {
                    return Err(ConfigError::Invalid(format!(
                        "session {} lists slot {} twice",
                        session.name, slot
                    )));
                }
                if *slot <= session.range_start || *slot >= session.cutoff {
                    return Err(ConfigError::Invalid(format!(
                        "session {}: slot {} must lie between range start {} and cutoff {}",
                        session.name, slot, session.range_start, session.cutoff
                    )));
                }
            }
            for symbol in &session.instruments {
                if !symbols.contains(symbol.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "session {} references unknown instrument {}",
                        session.name, symbol
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn clock(&self) -> Result<SessionClock, ConfigError> {
        Ok(SessionClock::from_name(&self.timezone)?)
    }

    pub fn bar_interval(&self) -> Duration {
        Duration::seconds(self.bar_interval_secs as i64)
    }

    pub fn backfill_timeout(&self) -> Duration {
        Duration::seconds(self.backfill_timeout_secs as i64)
    }

    pub fn instrument(&self, symbol: &str) -> Option<&InstrumentPolicy> {
        self.instruments.iter().find(|p| p.symbol == symbol)
    }

    /// Expand sessions into one spec per instrument x session x slot
    ///
    /// Each spec carries its own snapshot of the instrument policy.
    pub fn stream_specs(&self) -> Vec<StreamSpec> {
        let mut specs = Vec::new();
        for session in &self.sessions {
            for symbol in &session.instruments {
                let Some(policy) = self.instrument(symbol) else {
                    continue;
                };
                let policy = Arc::new(policy.clone());
                for slot in &session.slots {
                    specs.push(StreamSpec {
                        policy: policy.clone(),
                        session: session.name.clone(),
                        range_start: session.range_start,
                        slot: *slot,
                        cutoff: session.cutoff,
                    });
                }
            }
        }
        specs
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| format!("invalid time '{}': {}", s, e))
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_hhmm(&raw).map_err(serde::de::Error::custom)
    }
}

mod hhmm_vec {
    use chrono::NaiveTime;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(times: &[NaiveTime], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(times.len()))?;
        for t in times {
            seq.serialize_element(&t.format("%H:%M").to_string())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<NaiveTime>, D::Error> {
        let raw = Vec::<String>::deserialize(d)?;
        raw.iter()
            .map(|s| super::parse_hhmm(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
