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

//! JSON-lines event log, enabled with `--logging`
//!
//! Each line is `{"ts_ms": .., "event": .., "data": ..}`. Events are dropped
//! silently until [`init_logging`] has opened a file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use serde_json::{json, Value};

pub const DEFAULT_LOG_PATH: &str = "/var/log/bridgehead/events.json";
const FALLBACK_LOG_PATH: &str = "/tmp/bridgehead_events.json";

/// Recovered errors are logged on the first occurrence and every Nth after
pub const MAX_CONSECUTIVE_ERRORS: u64 = 10;

lazy_static! {
    static ref LOG_FILE: Mutex<Option<File>> = Mutex::new(None);
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Throttle for repeated recoverable errors: true for the 1st, 10th, 20th...
pub fn should_log(count: u64) -> bool {
    count == 1 || (count > 0 && count % MAX_CONSECUTIVE_ERRORS == 0)
}

fn open_append(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}

/// Open the event log at the default location, falling back to /tmp.
/// Returns the path actually used.
pub fn init_logging() -> Option<PathBuf> {
    init_logging_at(Path::new(DEFAULT_LOG_PATH))
        .or_else(|| init_logging_at(Path::new(FALLBACK_LOG_PATH)))
}

/// Open the event log at `path`, replacing any previously opened file.
pub fn init_logging_at(path: &Path) -> Option<PathBuf> {
    let file = open_append(path)?;
    let mut guard = LOG_FILE.lock().ok()?;
    *guard = Some(file);
    Some(path.to_path_buf())
}

pub fn log_event(event: &str, data: Value) {
    let Ok(mut guard) = LOG_FILE.lock() else {
        return;
    };
    let Some(file) = guard.as_mut() else {
        return;
    };
    let line = json!({
        "ts_ms": now_millis(),
        "event": event,
        "data": data,
    });
    let _ = writeln!(file, "{}", line);
}

/// Close the event log; later events are dropped
pub fn shutdown_logging() {
    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(file) = guard.as_mut() {
            let _ = file.flush();
        }
        *guard = None;
    }
}
