//! Extender configuration
//!
//! Settings are stored as JSON. Missing fields take their defaults and
//! unknown fields are rejected so typos do not go unnoticed.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read or write config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Processor reported to clients through 0400h and 1687h
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CpuModel {
    Intel8086,
    Intel8088,
    Intel80186,
    Intel80188,
    Intel80286,
    #[default]
    Intel80386,
    Intel80486,
    Intel80486SX,
    Intel80486DX2,
    Intel80486SX2,
    Intel80486DX4,
    IntelPentium,
    IntelPentiumMMX,
}

impl CpuModel {
    /// DPMI processor type byte (00h = 8086 ... 05h = Pentium)
    pub fn processor_level(self) -> u8 {
        match self {
            CpuModel::Intel8086 | CpuModel::Intel8088 => 0x00,
            CpuModel::Intel80186 | CpuModel::Intel80188 => 0x01,
            CpuModel::Intel80286 => 0x02,
            CpuModel::Intel80386 => 0x03,
            CpuModel::Intel80486
            | CpuModel::Intel80486SX
            | CpuModel::Intel80486DX2
            | CpuModel::Intel80486SX2
            | CpuModel::Intel80486DX4 => 0x04,
            CpuModel::IntelPentium | CpuModel::IntelPentiumMMX => 0x05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DpmiConfig {
    pub cpu_model: CpuModel,
    /// Conventional memory size in KB (top of the DOS arena)
    pub conventional_kb: u32,
    /// Extended memory handed to the XMS driver, in KB
    pub extended_kb: u32,
    /// Host page size reported by 0604h
    pub page_size: u32,
    /// Lowest address the simulated host will hand out for linear blocks
    pub linear_base: u32,
    /// End (exclusive) of the simulated host address space
    pub linear_limit: u32,
    /// Maximum jump hops followed before a real-mode call gives up
    pub max_jump_chain: u32,
    /// First paragraph available to the conventional memory arena
    pub arena_start_segment: u16,
}

impl Default for DpmiConfig {
    fn default() -> Self {
        Self {
            cpu_model: CpuModel::default(),
            conventional_kb: 640,
            extended_kb: 15 * 1024,
            page_size: 4096,
            linear_base: 0x0040_0000,
            linear_limit: 0x8000_0000,
            max_jump_chain: 32,
            arena_start_segment: 0x0100,
        }
    }
}

impl DpmiConfig {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Save settings to a JSON file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "page_size {:#X} is not a power of two",
                self.page_size
            )));
        }
        if self.linear_base >= self.linear_limit {
            return Err(ConfigError::Invalid(
                "linear_base must be below linear_limit".to_string(),
            ));
        }
        if self.linear_base & 0xFFFF != 0 {
            return Err(ConfigError::Invalid(
                "linear_base must be 64KB aligned".to_string(),
            ));
        }
        if !(64..=640).contains(&self.conventional_kb) {
            return Err(ConfigError::Invalid(format!(
                "conventional_kb {} outside 64..=640",
                self.conventional_kb
            )));
        }
        if self.arena_start_segment < 0x0060
            || self.arena_start_segment >= self.conventional_top_segment()
        {
            return Err(ConfigError::Invalid(format!(
                "arena_start_segment {:#06X} outside conventional memory",
                self.arena_start_segment
            )));
        }
        Ok(())
    }

    /// First paragraph past conventional memory (A000h for 640KB)
    pub fn conventional_top_segment(&self) -> u16 {
        (self.conventional_kb.min(640) * 64) as u16
    }
}
