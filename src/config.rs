/*
 * This file is part of Bridgehead.
 *
 * Copyright (C) 2025 Bridgehead contributors
 *
 * Bridgehead is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Bridgehead is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Bridgehead. If not, see <https://www.gnu.org/licenses/>.
 */

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::FrameFormat;
use crate::serial;

/// Number of PWM ports on the fan controller board
pub const CHANNEL_COUNT: usize = 8;

/// Sane sensor range for a target temperature, in °C
pub const LIMIT_MIN_C: i64 = -40;
pub const LIMIT_MAX_C: i64 = 150;

/// Proportional gain; usually in (0.01, 0.1)
pub const DEFAULT_GAIN: f64 = 0.05;

fn default_device() -> PathBuf { PathBuf::from("/dev/ttyACM0") }
fn default_baud_rate() -> u32 { 9600 }
fn default_read_timeout_ms() -> u64 { 1000 }
fn default_gain() -> f64 { DEFAULT_GAIN }

/// External sensor identifier: hwmon chip name plus feature, e.g. `k10temp` / `temp1`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorRef {
    pub chip: String,
    pub feature: String,
}

impl std::fmt::Display for SensorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chip, self.feature)
    }
}

/// Control parameters of a populated port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelControl {
    pub name: String,
    pub sensor: SensorRef,
    /// Target temperature in °C
    pub limit: i32,
    /// Half-width of the no-adjustment band in °C
    pub hysteresis: u32,
}

/// One physical fan port. `control` is `None` for unpopulated ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub port: u8,
    /// Initial setpoint; for inactive ports this is the fixed idle value
    pub pwm: u8,
    pub control: Option<ChannelControl>,
}

impl Channel {
    pub fn is_active(&self) -> bool {
        self.control.is_some()
    }

    pub fn name(&self) -> Option<&str> {
        self.control.as_ref().map(|c| c.name.as_str())
    }
}

/// A channel as written in the config file. Every control field is optional
/// here; [`ChannelConfiguration::new`] enforces that they come as a set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelEntry {
    pub port: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hysteresis: Option<i64>,
    pub pwm: i64,
}

impl ChannelEntry {
    pub fn active(
        port: u8,
        name: &str,
        chip: &str,
        feature: &str,
        limit: i64,
        hysteresis: i64,
        pwm: i64,
    ) -> Self {
        Self {
            port,
            name: Some(name.to_string()),
            chip: Some(chip.to_string()),
            feature: Some(feature.to_string()),
            limit: Some(limit),
            hysteresis: Some(hysteresis),
            pwm,
        }
    }

    pub fn inactive(port: u8, pwm: i64) -> Self {
        Self { port, name: None, chip: None, feature: None, limit: None, hysteresis: None, pwm }
    }
}

/// The board as shipped: CPU on k10temp, two case fans on the SuperIO, GPU on port 4.
pub fn reference_channels() -> Vec<ChannelEntry> {
    vec![
        ChannelEntry::active(0, "CPU", "k10temp", "temp1", 55, 3, 178),
        ChannelEntry::active(1, "Case", "it8718", "temp1", 40, 3, 255),
        ChannelEntry::active(2, "Case", "it8718", "temp1", 50, 3, 255),
        ChannelEntry::inactive(3, 0),
        ChannelEntry::active(4, "GPU", "radeon", "temp1", 75, 3, 45),
        ChannelEntry::inactive(5, 0),
        ChannelEntry::inactive(6, 0),
        ChannelEntry::inactive(7, 0),
    ]
}

/// Validated, immutable per-port configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfiguration {
    channels: Vec<Channel>,
}

impl ChannelConfiguration {
    /// Validate raw entries. Requires exactly [`CHANNEL_COUNT`] entries in port order.
    pub fn new(entries: &[ChannelEntry]) -> Result<Self, ConfigError> {
        if entries.len() != CHANNEL_COUNT {
            return Err(ConfigError::ChannelCount { expected: CHANNEL_COUNT, found: entries.len() });
        }
        let channels = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| validate_entry(index, entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { channels })
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Setpoints the loop starts from
    pub fn initial_pwms(&self) -> Vec<u8> {
        self.channels.iter().map(|c| c.pwm).collect()
    }

    pub fn active_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| c.is_active())
    }
}

fn validate_entry(index: usize, entry: &ChannelEntry) -> Result<Channel, ConfigError> {
    let port = entry.port;
    if port as usize != index {
        return Err(ConfigError::PortMismatch { index, port });
    }
    if !(0..=255).contains(&entry.pwm) {
        return Err(ConfigError::PwmOutOfRange { port, value: entry.pwm });
    }
    let pwm = entry.pwm as u8;

    let present = [
        ("name", entry.name.is_some()),
        ("chip", entry.chip.is_some()),
        ("feature", entry.feature.is_some()),
        ("limit", entry.limit.is_some()),
        ("hysteresis", entry.hysteresis.is_some()),
    ];
    if present.iter().all(|(_, p)| !p) {
        return Ok(Channel { port, pwm, control: None });
    }

    let (Some(name), Some(chip), Some(feature), Some(limit), Some(hysteresis)) = (
        entry.name.as_ref(),
        entry.chip.as_ref(),
        entry.feature.as_ref(),
        entry.limit,
        entry.hysteresis,
    ) else {
        let missing = present
            .iter()
            .filter(|(_, p)| !p)
            .map(|(field, _)| *field)
            .collect::<Vec<_>>()
            .join(", ");
        return Err(ConfigError::PartialChannel { port, missing });
    };

    if hysteresis < 0 {
        return Err(ConfigError::NegativeHysteresis { port, value: hysteresis });
    }
    if !(LIMIT_MIN_C..=LIMIT_MAX_C).contains(&limit) {
        return Err(ConfigError::LimitOutOfRange {
            port,
            value: limit,
            min: LIMIT_MIN_C,
            max: LIMIT_MAX_C,
        });
    }
    // Bounded by the sensor range, so the band never needs more than u32
    let hysteresis = u32::try_from(hysteresis.min(LIMIT_MAX_C - LIMIT_MIN_C)).unwrap_or(u32::MAX);

    Ok(Channel {
        port,
        pwm,
        control: Some(ChannelControl {
            name: name.clone(),
            sensor: SensorRef { chip: chip.clone(), feature: feature.clone() },
            limit: limit as i32,
            hysteresis,
        }),
    })
}

/// Everything the bridge reads from its config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default = "default_device")]
    pub device: PathBuf,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Bound on a single line read from the link
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Optional bound on waiting for a telemetry reply; `None` waits forever
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
    #[serde(default = "default_gain")]
    pub gain: f64,
    #[serde(default)]
    pub frame: FrameFormat,
    #[serde(default = "reference_channels")]
    pub channels: Vec<ChannelEntry>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            response_timeout_ms: None,
            gain: default_gain(),
            frame: FrameFormat::default(),
            channels: reference_channels(),
        }
    }
}

impl BridgeConfig {
    /// Check every setting and build the channel table
    pub fn validate(&self) -> Result<ChannelConfiguration, ConfigError> {
        if !self.gain.is_finite() || self.gain <= 0.0 || self.gain > 1.0 {
            return Err(ConfigError::InvalidGain(self.gain));
        }
        if serial::termios_speed(self.baud_rate).is_none() {
            return Err(ConfigError::serial(format!("unsupported baud rate {}", self.baud_rate)));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::serial("read_timeout_ms must be greater than zero"));
        }
        if self.response_timeout_ms == Some(0) {
            return Err(ConfigError::serial(
                "response_timeout_ms must be greater than zero when set",
            ));
        }
        self.frame.validate()?;
        ChannelConfiguration::new(&self.channels)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        return Path::new(&xdg).join("bridgehead").join("config.json");
    }
    if let Ok(home) = env::var("HOME") {
        return Path::new(&home)
            .join(".config")
            .join("bridgehead")
            .join("config.json");
    }
    system_config_path()
}

pub fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/bridgehead/config.json")
}

pub fn load_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let data = fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    serde_json::from_str(&data)
        .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}

/// Load an explicitly requested file, or the user config if present, or the
/// reference defaults. Returns the path actually used, if any.
pub fn load_config_or_default(
    explicit: Option<&Path>,
) -> Result<(BridgeConfig, Option<PathBuf>), ConfigError> {
    if let Some(path) = explicit {
        return load_config(path).map(|cfg| (cfg, Some(path.to_path_buf())));
    }
    for path in [config_path(), system_config_path()] {
        if path.exists() {
            return load_config(&path).map(|cfg| (cfg, Some(path)));
        }
    }
    Ok((BridgeConfig::default(), None))
}
