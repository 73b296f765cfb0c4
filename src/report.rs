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

//! Per-cycle diagnostics
//!
//! The control loop hands each [`CycleSnapshot`] to a [`ReportHandle`], which
//! queues it for a blocking reporter thread and never waits. When the queue is
//! full the snapshot is dropped and counted.

use std::fmt::{self, Display};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ChannelConfiguration;
use crate::control::{Direction, StepOutcome};
use crate::logger;

/// Snapshots that may wait for the reporter before new ones are dropped
pub const REPORT_QUEUE_DEPTH: usize = 16;

/// Everything the loop knew about one cycle, indexed by port
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSnapshot {
    pub cycle: u64,
    pub names: Vec<Option<String>>,
    pub ports: Vec<u8>,
    pub pwms: Vec<u8>,
    pub rpms: Vec<Option<u32>>,
    pub temps: Vec<Option<i32>>,
    pub limits: Vec<Option<i32>>,
    pub hysteresises: Vec<Option<u32>>,
    pub decisions: Vec<Option<bool>>,
    pub directions: Vec<Option<Direction>>,
    pub differences: Vec<Option<i32>>,
    pub pwms_new: Vec<u8>,
}

impl CycleSnapshot {
    pub fn new(
        cycle: u64,
        channels: &ChannelConfiguration,
        pwms: &[u8],
        rpms: &[Option<u32>],
        temps: &[Option<i32>],
        outcomes: &[StepOutcome],
    ) -> Self {
        let channels = channels.channels();
        Self {
            cycle,
            names: channels.iter().map(|c| c.name().map(str::to_string)).collect(),
            ports: channels.iter().map(|c| c.port).collect(),
            pwms: pwms.to_vec(),
            rpms: rpms.to_vec(),
            temps: temps.to_vec(),
            limits: channels.iter().map(|c| c.control.as_ref().map(|c| c.limit)).collect(),
            hysteresises: channels
                .iter()
                .map(|c| c.control.as_ref().map(|c| c.hysteresis))
                .collect(),
            decisions: outcomes.iter().map(|o| o.decision).collect(),
            directions: outcomes.iter().map(|o| o.direction).collect(),
            differences: outcomes.iter().map(|o| o.difference).collect(),
            pwms_new: outcomes.iter().map(|o| o.new_pwm).collect(),
        }
    }
}

/// Consumer of cycle snapshots. Runs on the reporter thread, so it may block.
#[cfg_attr(test, mockall::automock)]
pub trait Reporter: Send {
    fn report(&mut self, snapshot: &CycleSnapshot);
}

/// Prints one labelled row per field, `-` for unknown entries, then a blank line.
pub struct ConsoleTableReporter<W: Write + Send> {
    out: W,
}

impl ConsoleTableReporter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: std::io::stdout() }
    }
}

impl<W: Write + Send> ConsoleTableReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

const LABEL_WIDTH: usize = 12;
const CELL_WIDTH: usize = 7;

struct Cell<T>(Option<T>);

impl<T: Display> Display for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(v) => write!(f, "{:>width$}", v.to_string(), width = CELL_WIDTH),
            None => write!(f, "{:>width$}", "-", width = CELL_WIDTH),
        }
    }
}

fn row<T: Display>(label: &str, values: impl IntoIterator<Item = Option<T>>) -> String {
    let mut line = format!("{:<width$}", label, width = LABEL_WIDTH);
    for v in values {
        line.push_str(&Cell(v).to_string());
    }
    line
}

/// Render a snapshot as the console table
pub fn render_table(s: &CycleSnapshot) -> String {
    let rows = [
        row("fans", s.names.iter().map(|n| n.as_deref())),
        row("ports", s.ports.iter().copied().map(Some)),
        row("pwms", s.pwms.iter().copied().map(Some)),
        row("rpms", s.rpms.iter().copied()),
        row("temps", s.temps.iter().copied()),
        row("limits", s.limits.iter().copied()),
        row("hysteresises", s.hysteresises.iter().copied()),
        row("decisions", s.decisions.iter().copied()),
        row("directions", s.directions.iter().map(|d| d.map(Direction::signum))),
        row("differences", s.differences.iter().copied()),
        row("pwms_new", s.pwms_new.iter().copied().map(Some)),
    ];
    let mut out = rows.join("\n");
    out.push_str("\n\n");
    out
}

impl<W: Write + Send> Reporter for ConsoleTableReporter<W> {
    fn report(&mut self, snapshot: &CycleSnapshot) {
        let table = render_table(snapshot);
        if let Err(e) = self.out.write_all(table.as_bytes()).and_then(|_| self.out.flush()) {
            debug!("Console report failed: {}", e);
        }
    }
}

/// Writes each snapshot as a `cycle` event to the JSON event log
#[derive(Debug, Default)]
pub struct JsonEventReporter;

impl Reporter for JsonEventReporter {
    fn report(&mut self, snapshot: &CycleSnapshot) {
        match serde_json::to_value(snapshot) {
            Ok(data) => logger::log_event("cycle", data),
            Err(e) => debug!("Failed to serialize snapshot: {}", e),
        }
    }
}

/// Non-blocking entry point used by the control loop
#[derive(Debug, Clone)]
pub struct ReportHandle {
    tx: mpsc::Sender<CycleSnapshot>,
    dropped: Arc<AtomicU64>,
}

impl ReportHandle {
    /// Queue a snapshot. Returns false if it was dropped.
    pub fn submit(&self, snapshot: CycleSnapshot) -> bool {
        match self.tx.try_send(snapshot) {
            Ok(()) => true,
            Err(TrySendError::Full(s)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if logger::should_log(dropped) {
                    warn!(
                        "Reporter is behind, dropped snapshot for cycle {} (total dropped: {})",
                        s.cycle, dropped
                    );
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Start the reporter thread. It exits once every [`ReportHandle`] is dropped.
pub fn spawn_reporters(
    mut reporters: Vec<Box<dyn Reporter>>,
    depth: usize,
) -> (ReportHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<CycleSnapshot>(depth.max(1));
    let task = tokio::task::spawn_blocking(move || {
        while let Some(snapshot) = rx.blocking_recv() {
            for reporter in reporters.iter_mut() {
                reporter.report(&snapshot);
            }
        }
        debug!("Reporter thread exiting");
    });
    (ReportHandle { tx, dropped: Arc::new(AtomicU64::new(0)) }, task)
}
