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

//! Per-channel fan control step
//!
//! # How It Works
//!
//! 1. **Hysteresis**: while the temperature is within `hysteresis` °C of the
//!    limit, the setpoint is left alone.
//!
//! 2. **Proportional correction**: outside the band, the setpoint moves by
//!    `gain` times its *current* value, towards cooling when above the limit
//!    and towards quiet when below. Corrections are therefore large at high
//!    speeds and small near idle.
//!
//! 3. **Fail-safe hold**: without a temperature the setpoint is kept as is.
//!
//! All rounding is half-to-even.

use serde::{Serialize, Serializer};

use crate::config::Channel;

/// PWM duty cycle range
pub const PWM_MIN: i32 = 0;
pub const PWM_MAX: i32 = 255;

/// Which way the setpoint should move: `sign(limit - temp)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Hotter than the limit
    Down,
    /// Exactly at the limit
    Hold,
    /// Cooler than the limit
    Up,
}

impl Direction {
    pub fn from_error(error: i32) -> Self {
        match error.signum() {
            1 => Direction::Up,
            -1 => Direction::Down,
            _ => Direction::Hold,
        }
    }

    pub fn signum(self) -> i8 {
        match self {
            Direction::Down => -1,
            Direction::Hold => 0,
            Direction::Up => 1,
        }
    }
}

impl Serialize for Direction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(self.signum())
    }
}

/// Result of one control step, including the intermediates shown in reports.
/// `None` means unknown (no temperature, or inactive port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub decision: Option<bool>,
    pub direction: Option<Direction>,
    pub difference: Option<i32>,
    pub new_pwm: u8,
}

impl StepOutcome {
    /// Nothing known; the setpoint is held
    pub fn hold(previous_pwm: u8) -> Self {
        Self { decision: None, direction: None, difference: None, new_pwm: previous_pwm }
    }
}

/// Compute the next setpoint for one active channel.
pub fn step(
    limit: i32,
    hysteresis: u32,
    previous_pwm: u8,
    temp: Option<i32>,
    gain: f64,
) -> StepOutcome {
    let Some(temp) = temp else {
        return StepOutcome::hold(previous_pwm);
    };

    let error = i64::from(limit) - i64::from(temp);
    let decision = error.unsigned_abs() > u64::from(hysteresis);
    let direction = Direction::from_error(error.signum() as i32);

    if !decision {
        return StepOutcome {
            decision: Some(false),
            direction: Some(direction),
            difference: None,
            new_pwm: previous_pwm,
        };
    }

    let raw = f64::from(previous_pwm) * f64::from(direction.signum()) * gain;
    let difference = raw.round_ties_even() as i32;
    let new_pwm = (i32::from(previous_pwm) + difference).clamp(PWM_MIN, PWM_MAX) as u8;

    StepOutcome {
        decision: Some(true),
        direction: Some(direction),
        difference: Some(difference),
        new_pwm,
    }
}

/// Run [`step`] for a configured channel. Inactive channels keep their setpoint.
pub fn step_channel(
    channel: &Channel,
    previous_pwm: u8,
    temp: Option<i32>,
    gain: f64,
) -> StepOutcome {
    match &channel.control {
        Some(control) => step(control.limit, control.hysteresis, previous_pwm, temp, gain),
        None => StepOutcome::hold(previous_pwm),
    }
}

/// Round a sensor reading to whole degrees. Non-finite readings are treated as absent.
pub fn round_temperature(celsius: f64) -> Option<i32> {
    if !celsius.is_finite() {
        return None;
    }
    Some(celsius.round_ties_even().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
}
