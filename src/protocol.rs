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

//! Line protocol spoken with the fan controller firmware
//!
//! Host → board: one PWM value per port, `178,255,255,0,45,0,0,0\n`.
//! Board → host: one RPM value per port in the same order.
//!
//! Field position is the only addressing; there are no IDs or checksums.

use serde::{Deserialize, Serialize};

use crate::config::ChannelConfiguration;
use crate::error::{ConfigError, FrameError};

/// Frame terminator on both directions
pub const LINE_TERMINATOR: u8 = b'\n';

/// Longest telemetry line we accept before treating it as garbage
pub const MAX_LINE_LEN: usize = 256;

/// Separator and placeholder used on the wire. Must match the firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrameFormat {
    pub delimiter: char,
    /// Token sent for unpopulated ports instead of their idle PWM value
    pub inactive_placeholder: Option<String>,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self { delimiter: ',', inactive_placeholder: None }
    }
}

impl FrameFormat {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = self.delimiter;
        if !d.is_ascii() || (d.is_ascii_control() && d != '\t') {
            let msg = format!("delimiter {d:?} must be printable ASCII");
            return Err(ConfigError::frame_format(msg));
        }
        if d.is_ascii_digit() || d == '-' || d == '+' {
            let msg = format!("delimiter {d:?} collides with numeric fields");
            return Err(ConfigError::frame_format(msg));
        }
        if let Some(token) = &self.inactive_placeholder {
            if token.is_empty() || !token.is_ascii() {
                return Err(ConfigError::frame_format("placeholder must be non-empty ASCII"));
            }
            if token.contains(d) || token.contains('\n') || token.contains('\r') {
                return Err(ConfigError::frame_format(
                    "placeholder must not contain the delimiter or line breaks",
                ));
            }
        }
        Ok(())
    }
}

/// Encoder/decoder bound to one channel layout
#[derive(Debug, Clone)]
pub struct Codec {
    format: FrameFormat,
    active: Vec<bool>,
}

impl Codec {
    pub fn new(format: FrameFormat, channels: &ChannelConfiguration) -> Self {
        Self {
            format,
            active: channels.channels().iter().map(|c| c.is_active()).collect(),
        }
    }

    /// Number of fields in every frame
    pub fn width(&self) -> usize {
        self.active.len()
    }

    /// Serialize a PWM vector (one value per port) into a command line.
    pub fn encode_command(&self, pwms: &[u8]) -> Vec<u8> {
        let mut delim = [0u8; 4];
        let delim = self.format.delimiter.encode_utf8(&mut delim).as_bytes();

        let mut out = Vec::with_capacity(pwms.len() * 4 + 1);
        for (port, pwm) in pwms.iter().enumerate() {
            if port > 0 {
                out.extend_from_slice(delim);
            }
            let active = self.active.get(port).copied().unwrap_or(true);
            match (&self.format.inactive_placeholder, active) {
                (Some(token), false) => out.extend_from_slice(token.as_bytes()),
                _ => out.extend_from_slice(pwm.to_string().as_bytes()),
            }
        }
        out.push(LINE_TERMINATOR);
        out
    }

    /// Parse one telemetry line into per-port RPM readings.
    ///
    /// Inactive ports always decode to `None`, whatever the board sent for them.
    pub fn decode_telemetry(&self, line: &str) -> Result<Vec<Option<u32>>, FrameError> {
        if !line.is_ascii() {
            return Err(FrameError::NotAscii);
        }
        let line = line.trim_matches(|c: char| c == '\n' || c == '\r');

        let fields: Vec<&str> = if self.format.delimiter.is_ascii_whitespace() {
            line.split_ascii_whitespace().collect()
        } else {
            line.split(self.format.delimiter).map(str::trim).collect()
        };

        if fields.len() != self.active.len() {
            return Err(FrameError::FieldCount { expected: self.active.len(), found: fields.len() });
        }

        fields
            .iter()
            .zip(&self.active)
            .enumerate()
            .map(|(port, (field, active))| {
                if !active {
                    return Ok(None);
                }
                parse_rpm(field).map(Some).ok_or_else(|| FrameError::InvalidField {
                    port: port as u8,
                    field: field.to_string(),
                })
            })
            .collect()
    }
}

fn parse_rpm(field: &str) -> Option<u32> {
    // u32::from_str accepts a leading '+', the firmware never sends one
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}
