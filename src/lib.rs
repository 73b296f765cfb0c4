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

//! Bridgehead - closed-loop fan control over a serial fan controller
//!
//! The host measures temperatures, runs a hysteresis-gated proportional step
//! per fan port and sends the resulting PWM vector to a microcontroller as
//! one ASCII line. The board answers each command with a line of RPM readings.

pub mod config;
pub mod control;
pub mod error;
pub mod logger;
pub mod protocol;
pub mod report;
pub mod sensors;
pub mod serial;
pub mod service;
pub mod transport;

pub use error::{BridgeError, Result};
