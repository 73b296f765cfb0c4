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

//! Error types for Bridgehead
//!
//! One enum per failure class. Only [`ConfigError`] (and failing to open the
//! serial link) is fatal; the others are recovered inside the control loop.

use std::io;
use std::path::PathBuf;

/// Result type alias using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Top-level error for startup and wiring code
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Sensor read error: {0}")]
    Sensor(#[from] SensorReadError),

    #[error("Failed to open serial device {path}: {source}")]
    SerialOpen {
        path: PathBuf,
        source: io::Error,
    },
}

// ============================================================================
// Configuration
// ============================================================================

/// Invalid channel or bridge configuration, detected at startup
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("expected exactly {expected} channels, found {found}")]
    ChannelCount {
        expected: usize,
        found: usize,
    },

    #[error("channel #{index} declares port {port}; ports must match their position")]
    PortMismatch {
        index: usize,
        port: u8,
    },

    #[error("port {port}: control fields must be all set or all omitted (missing: {missing})")]
    PartialChannel {
        port: u8,
        missing: String,
    },

    #[error("port {port}: hysteresis must be non-negative, got {value}")]
    NegativeHysteresis {
        port: u8,
        value: i64,
    },

    #[error("port {port}: limit {value}°C outside sensor range [{min}, {max}]")]
    LimitOutOfRange {
        port: u8,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("port {port}: PWM value {value} (must be 0-255)")]
    PwmOutOfRange {
        port: u8,
        value: i64,
    },

    #[error("gain {0} must be finite and within (0, 1]")]
    InvalidGain(f64),

    #[error("invalid frame format: {0}")]
    InvalidFrameFormat(String),

    #[error("invalid serial settings: {0}")]
    InvalidSerial(String),

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

// ============================================================================
// Wire protocol
// ============================================================================

/// Malformed telemetry frame; the frame is discarded
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount {
        expected: usize,
        found: usize,
    },

    #[error("port {port}: invalid RPM field {field:?}")]
    InvalidField {
        port: u8,
        field: String,
    },

    #[error("frame contains non-ASCII bytes")]
    NotAscii,
}

// ============================================================================
// Serial transport
// ============================================================================

/// Link-level failure; the partial line is discarded and the read retried
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("line contains non-ASCII bytes ({len} bytes discarded)")]
    NotAscii {
        len: usize,
    },

    #[error("line of {len} bytes exceeds the {max} byte limit")]
    LineTooLong {
        len: usize,
        max: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serial link closed")]
    Closed,
}

// ============================================================================
// Sensors
// ============================================================================

/// Temperature probe failure; the channel reads as absent for the cycle
#[derive(thiserror::Error, Debug)]
pub enum SensorReadError {
    #[error("hwmon chip {0} not found")]
    ChipNotFound(String),

    #[error("Failed to read temperature from {path}: {source}")]
    Io {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to parse temperature from {path}: {raw:?}")]
    Parse {
        path: PathBuf,
        raw: String,
    },
}

impl ConfigError {
    /// Create an invalid frame format error from a string
    pub fn frame_format(msg: impl Into<String>) -> Self {
        Self::InvalidFrameFormat(msg.into())
    }

    /// Create an invalid serial settings error from a string
    pub fn serial(msg: impl Into<String>) -> Self {
        Self::InvalidSerial(msg.into())
    }
}
