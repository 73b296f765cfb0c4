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

//! Temperature sources for active channels

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::config::SensorRef;
use crate::error::SensorReadError;

pub const HWMON_ROOT: &str = "/sys/class/hwmon";

/// Something that can report the temperature of a `chip:feature` pair in °C.
#[cfg_attr(test, mockall::automock)]
pub trait TemperatureProbe: Send + Sync {
    /// `Ok(None)` if the sensor exists but has no reading right now
    fn read(&self, chip: &str, feature: &str) -> Result<Option<f64>, SensorReadError>;

    fn read_ref(&self, sensor: &SensorRef) -> Result<Option<f64>, SensorReadError> {
        self.read(&sensor.chip, &sensor.feature)
    }
}

/// Reads `<feature>_input` (millidegrees) from the hwmon chip whose `name` matches.
#[derive(Debug, Clone)]
pub struct HwmonProbe {
    root: PathBuf,
}

impl Default for HwmonProbe {
    fn default() -> Self {
        Self::new(HWMON_ROOT)
    }
}

impl HwmonProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    // Resolve the sysfs directory for a chip name; "name@hwmonX" pins a specific instance
    fn resolve_chip_dir(&self, chip_selector: &str) -> Option<PathBuf> {
        let (want_name, tag) = match chip_selector.split_once('@') {
            Some((name, tag)) => (name, Some(tag)),
            None => (chip_selector, None),
        };

        let mut entries: Vec<PathBuf> =
            fs::read_dir(&self.root).ok()?.flatten().map(|e| e.path()).collect();
        // read_dir order is unspecified; first match must be stable across runs
        entries.sort();

        entries.into_iter().find(|dir| {
            let dir_tag = dir.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if tag.is_some_and(|t| t != dir_tag) {
                return false;
            }
            read_trimmed(dir.join("name")).is_ok_and(|name| name == want_name)
        })
    }
}

impl TemperatureProbe for HwmonProbe {
    fn read(&self, chip: &str, feature: &str) -> Result<Option<f64>, SensorReadError> {
        let dir = self
            .resolve_chip_dir(chip)
            .ok_or_else(|| SensorReadError::ChipNotFound(chip.to_string()))?;
        let path = dir.join(format!("{}_input", feature));

        let raw = match read_trimmed(&path) {
            Ok(raw) => raw,
            // Some drivers report ENODATA while the sensor is idle
            Err(e) if e.raw_os_error() == Some(libc::ENODATA) => return Ok(None),
            Err(source) => return Err(SensorReadError::Io { path, source }),
        };

        let millideg: i64 = raw
            .parse()
            .map_err(|_| SensorReadError::Parse { path: path.clone(), raw: raw.clone() })?;
        Ok(Some(millideg as f64 / 1000.0))
    }
}

fn read_trimmed<P: AsRef<Path>>(p: P) -> io::Result<String> {
    let mut s = String::new();
    fs::File::open(p)?.read_to_string(&mut s)?;
    Ok(s.trim().to_string())
}
