//! Options of a recovery run.

use std::str::FromStr;
use thiserror::Error;

use crate::arch::{Architecture, Processor};


/// How computed jump targets that do not reduce to a constant are handled.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DynamicJumpPolicy {
    /// The most targets a single jump may be resolved to.
    pub threshold: usize,
    /// Whether to try the defined addresses of the memory image as
    /// candidate targets at all.
    pub map_to_memory: bool,
}

impl Default for DynamicJumpPolicy {
    fn default() -> DynamicJumpPolicy {
        DynamicJumpPolicy { threshold: 16, map_to_memory: false }
    }
}

/// All options of a recovery run.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct RecoveryConfig {
    /// Registers seeded with concrete values in the initial state.
    pub init_registers: Vec<(String, u64)>,
    /// How often one instruction may be expanded. Zero means no bound.
    pub max_visits_per_address: usize,
    pub dynamic_jumps: DynamicJumpPolicy,
    /// Log every expanded state.
    pub show_states: bool,
}

/// An invalid configuration property.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown property {0}")]
    UnknownKey(String),
    #[error("invalid value {value:?} for property {key}")]
    InvalidValue { key: String, value: String },
    #[error("line {0} is not of the form `key = value`")]
    Syntax(usize),
    #[error("unknown register {0}")]
    UnknownRegister(String),
    #[error("image is built for {image} but the decoder handles {decoder}")]
    ArchitectureMismatch { image: Processor, decoder: Processor },
}

const PREFIX: &str = "disas.symsim.";

impl RecoveryConfig {
    /// Parse `key = value` lines. Blank lines and lines starting with `#`
    /// are skipped.
    pub fn from_properties(text: &str) -> Result<RecoveryConfig, ConfigError> {
        let mut config = RecoveryConfig::default();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(ConfigError::Syntax(index + 1))?;
            config.set_property(key.trim(), value.trim())?;
        }
        Ok(config)
    }

    /// Set a single property.
    ///
    /// Recognized keys are `disas.symsim.x86_32.init-esp`,
    /// `disas.symsim.init-register.<name>`, `disas.symsim.nb-visits-per-address`,
    /// `disas.symsim.debug.show-states`, `disas.symsim.dynamic-jump-threshold`
    /// and `disas.symsim.map-dynamic-jump-to-memory`.
    pub fn set_property(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let name = key.strip_prefix(PREFIX)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;

        match name {
            "x86_32.init-esp" => self.set_init_register("esp", parse_int(key, value)?),
            "nb-visits-per-address" => self.max_visits_per_address = parse(key, value)?,
            "debug.show-states" => self.show_states = parse_bool(key, value)?,
            "dynamic-jump-threshold" => self.dynamic_jumps.threshold = parse(key, value)?,
            "map-dynamic-jump-to-memory" => {
                self.dynamic_jumps.map_to_memory = parse_bool(key, value)?;
            },
            _ => match name.strip_prefix("init-register.") {
                Some(reg) if !reg.is_empty() => self.set_init_register(reg, parse_int(key, value)?),
                _ => return Err(ConfigError::UnknownKey(key.to_string())),
            },
        }

        Ok(())
    }

    /// Seed a register, replacing an earlier seed of the same register.
    pub fn set_init_register(&mut self, name: &str, value: u64) {
        self.init_registers.retain(|(reg, _)| reg != name);
        self.init_registers.push((name.to_string(), value));
    }

    /// Check that all seeded registers exist on the architecture.
    pub fn validate(&self, arch: &Architecture) -> Result<(), ConfigError> {
        for (name, _) in &self.init_registers {
            if arch.register(name).is_none() {
                return Err(ConfigError::UnknownRegister(name.clone()));
            }
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

/// Parse a decimal or `0x`-prefixed hexadecimal integer.
pub fn parse_int(key: &str, value: &str) -> Result<u64, ConfigError> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() }
}
