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

//! Control loop and service wiring
//!
//! One cycle: send the PWM vector, wait for the RPM reply, sample
//! temperatures, step every channel, report. Repeats until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, ChannelConfiguration};
use crate::control::{round_temperature, step_channel, StepOutcome};
use crate::error::{Result, SensorReadError};
use crate::logger::should_log;
use crate::protocol::{Codec, FrameFormat};
use crate::report::{
    spawn_reporters, ConsoleTableReporter, CycleSnapshot, JsonEventReporter, ReportHandle,
    Reporter, REPORT_QUEUE_DEPTH,
};
use crate::sensors::{HwmonProbe, TemperatureProbe};
use crate::serial;
use crate::transport::{
    spawn_transport, LinkEnds, ReaderStats, Shutdown, TelemetryLine, WriterStats,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub frame_errors: u64,
    pub missed_responses: u64,
    pub stale_responses: u64,
    pub sensor_errors: u64,
    pub reports_dropped: u64,
}

/// Counters from every task, collected at shutdown
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStats {
    pub control: LoopStats,
    pub reader: ReaderStats,
    pub writer: WriterStats,
}

enum Response {
    Line(TelemetryLine),
    TimedOut,
    Closed,
}

/// Working state of the bridge: current setpoints and last known RPMs
pub struct ControlLoop {
    channels: Arc<ChannelConfiguration>,
    codec: Codec,
    gain: f64,
    probe: Arc<dyn TemperatureProbe>,
    response_timeout: Option<Duration>,
    reports: Option<ReportHandle>,
    pwms: Vec<u8>,
    rpms: Vec<Option<u32>>,
    // Replies still owed for commands whose wait timed out. The board answers
    // every command exactly once, so the next `owed` lines belong to those.
    owed: u64,
    stats: LoopStats,
}

impl ControlLoop {
    pub fn new(
        channels: ChannelConfiguration,
        format: FrameFormat,
        gain: f64,
        probe: Arc<dyn TemperatureProbe>,
    ) -> Self {
        let codec = Codec::new(format, &channels);
        let pwms = channels.initial_pwms();
        let rpms = vec![None; channels.len()];
        Self {
            channels: Arc::new(channels),
            codec,
            gain,
            probe,
            response_timeout: None,
            reports: None,
            pwms,
            rpms,
            owed: 0,
            stats: LoopStats::default(),
        }
    }

    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_reports(mut self, reports: ReportHandle) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn pwms(&self) -> &[u8] {
        &self.pwms
    }

    pub fn rpms(&self) -> &[Option<u32>] {
        &self.rpms
    }

    pub fn stats(&self) -> LoopStats {
        let mut stats = self.stats;
        stats.reports_dropped = self.reports.as_ref().map(ReportHandle::dropped).unwrap_or(0);
        stats
    }

    /// Run cycles until shutdown or until the transport goes away.
    pub async fn run(&mut self, link: &mut LinkEnds, shutdown: &Shutdown) -> LoopStats {
        info!(
            "Control loop starting with {} active channel(s)",
            self.channels.active_channels().count()
        );

        while !shutdown.is_triggered() {
            if self.run_cycle(link, shutdown).await.is_none() {
                break;
            }
        }

        let stats = self.stats();
        info!(
            cycles = stats.cycles,
            frame_errors = stats.frame_errors,
            missed_responses = stats.missed_responses,
            stale_responses = stats.stale_responses,
            sensor_errors = stats.sensor_errors,
            reports_dropped = stats.reports_dropped,
            "Control loop stopped"
        );
        stats
    }

    /// One command/response exchange and control step. `None` if cancelled.
    pub async fn run_cycle(
        &mut self,
        link: &mut LinkEnds,
        shutdown: &Shutdown,
    ) -> Option<CycleSnapshot> {
        let frame = self.codec.encode_command(&self.pwms);
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            sent = link.commands.send(frame) => {
                if sent.is_err() {
                    debug!("Command mailbox closed");
                    return None;
                }
            }
        }

        let deadline = self.response_timeout.map(|limit| Instant::now() + limit);
        let response = loop {
            let response = tokio::select! {
                _ = shutdown.cancelled() => return None,
                response = recv_response(&mut link.telemetry, deadline) => response,
            };
            match response {
                Response::Line(line) if self.owed > 0 => {
                    self.owed -= 1;
                    self.stats.stale_responses += 1;
                    debug!("Discarding late reply {:?} ({} still owed)", line, self.owed);
                }
                response => break response,
            }
        };

        match response {
            Response::Line(line) => self.apply_telemetry(&line),
            Response::TimedOut => {
                self.stats.missed_responses += 1;
                self.owed += 1;
                if should_log(self.stats.missed_responses) {
                    warn!(
                        "No telemetry within {:?}, keeping previous RPMs (count: {})",
                        self.response_timeout, self.stats.missed_responses
                    );
                }
            }
            Response::Closed => {
                debug!("Telemetry mailbox closed");
                return None;
            }
        }

        let temps = self.sample_temperatures().await;

        let outcomes: Vec<StepOutcome> = self
            .channels
            .channels()
            .iter()
            .zip(&self.pwms)
            .zip(&temps)
            .map(|((channel, pwm), temp)| step_channel(channel, *pwm, *temp, self.gain))
            .collect();

        self.stats.cycles += 1;
        let snapshot = CycleSnapshot::new(
            self.stats.cycles,
            &self.channels,
            &self.pwms,
            &self.rpms,
            &temps,
            &outcomes,
        );
        self.pwms = outcomes.iter().map(|o| o.new_pwm).collect();

        debug!(cycle = self.stats.cycles, pwms = ?self.pwms, rpms = ?self.rpms, "Cycle complete");
        if let Some(reports) = &self.reports {
            reports.submit(snapshot.clone());
        }
        Some(snapshot)
    }

    fn apply_telemetry(&mut self, line: &str) {
        match self.codec.decode_telemetry(line) {
            Ok(rpms) => self.rpms = rpms,
            Err(e) => {
                self.stats.frame_errors += 1;
                if should_log(self.stats.frame_errors) {
                    warn!(
                        "FRAME: discarding {:?}: {} (count: {})",
                        line, e, self.stats.frame_errors
                    );
                }
                self.rpms = vec![None; self.codec.width()];
            }
        }
    }

    async fn sample_temperatures(&mut self) -> Vec<Option<i32>> {
        let channels = Arc::clone(&self.channels);
        let probe = Arc::clone(&self.probe);

        // sysfs reads block; keep them off the async workers
        let readings = tokio::task::spawn_blocking(move || {
            channels
                .channels()
                .iter()
                .map(|channel| match &channel.control {
                    Some(control) => probe
                        .read_ref(&control.sensor)
                        .map_err(|e| (control.sensor.to_string(), e)),
                    None => Ok(None),
                })
                .collect::<Vec<std::result::Result<Option<f64>, (String, SensorReadError)>>>()
        })
        .await;

        let readings = match readings {
            Ok(readings) => readings,
            Err(e) => {
                warn!("Temperature sampling task failed: {}", e);
                return vec![None; self.channels.len()];
            }
        };

        readings
            .into_iter()
            .map(|reading| match reading {
                Ok(celsius) => celsius.and_then(round_temperature),
                Err((sensor, e)) => {
                    self.stats.sensor_errors += 1;
                    if should_log(self.stats.sensor_errors) {
                        warn!("SENSOR: {}: {} (count: {})", sensor, e, self.stats.sensor_errors);
                    }
                    None
                }
            })
            .collect()
    }
}

async fn recv_response(
    telemetry: &mut mpsc::Receiver<TelemetryLine>,
    deadline: Option<Instant>,
) -> Response {
    let received = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, telemetry.recv()).await {
            Ok(received) => received,
            Err(_) => return Response::TimedOut,
        },
        None => telemetry.recv().await,
    };
    match received {
        Some(line) => Response::Line(line),
        None => Response::Closed,
    }
}

/// Which reporters to attach
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOptions {
    pub console: bool,
    pub event_log: bool,
}

/// Run the bridge over an already open link until `shutdown` fires.
pub async fn run_bridge<R, W>(
    read_half: R,
    write_half: W,
    config: &BridgeConfig,
    channels: ChannelConfiguration,
    probe: Arc<dyn TemperatureProbe>,
    reporters: Vec<Box<dyn Reporter>>,
    shutdown: Shutdown,
) -> ServiceStats
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (mut link, transport) =
        spawn_transport(read_half, write_half, config.read_timeout(), &shutdown);
    let (reports, reporter_task) = spawn_reporters(reporters, REPORT_QUEUE_DEPTH);

    let mut control = ControlLoop::new(channels, config.frame.clone(), config.gain, probe)
        .with_response_timeout(config.response_timeout())
        .with_reports(reports);

    let control_stats = control.run(&mut link, &shutdown).await;

    // The loop may have stopped on its own; make sure the transport follows
    shutdown.trigger();
    drop(control);
    drop(link);

    let (reader, writer) = transport.join().await;
    if let Err(e) = reporter_task.await {
        warn!("Reporter thread failed: {}", e);
    }

    ServiceStats { control: control_stats, reader, writer }
}

/// Validate the configuration, open the serial device and run until shutdown.
pub async fn run_service(
    config: BridgeConfig,
    options: ReportOptions,
    shutdown: Shutdown,
) -> Result<ServiceStats> {
    let channels = config.validate()?;

    let mut reporters: Vec<Box<dyn Reporter>> = Vec::new();
    if options.console {
        reporters.push(Box::new(ConsoleTableReporter::stdout()));
    }
    if options.event_log {
        reporters.push(Box::new(JsonEventReporter));
    }

    let link = serial::open(&config.device, config.baud_rate)?;
    let probe: Arc<dyn TemperatureProbe> = Arc::new(HwmonProbe::default());

    info!(
        "Bridge running on {} (gain {}, read timeout {:?}, response timeout {:?})",
        config.device.display(),
        config.gain,
        config.read_timeout(),
        config.response_timeout()
    );

    Ok(run_bridge(link.reader, link.writer, &config, channels, probe, reporters, shutdown).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{reference_channels, SensorRef};
    use crate::control::Direction;
    use crate::report::MockReporter;
    use crate::sensors::MockTemperatureProbe;
    use crate::transport::{mailbox, CommandFrame};
    use tokio::time::timeout;

    fn reference() -> ChannelConfiguration {
        ChannelConfiguration::new(&reference_channels()).unwrap()
    }

    fn steady_probe() -> Arc<dyn TemperatureProbe> {
        let mut probe = MockTemperatureProbe::new();
        probe.expect_read_ref().returning(|sensor: &SensorRef| match sensor.chip.as_str() {
            "k10temp" => Ok(Some(60.0)),
            "it8718" => Ok(Some(41.0)),
            "radeon" => Ok(Some(70.0)),
            other => Err(SensorReadError::ChipNotFound(other.to_string())),
        });
        Arc::new(probe)
    }

    fn controller(probe: Arc<dyn TemperatureProbe>) -> ControlLoop {
        ControlLoop::new(reference(), FrameFormat::default(), 0.05, probe)
    }

    struct Board {
        commands: mpsc::Receiver<CommandFrame>,
        telemetry: mpsc::Sender<TelemetryLine>,
    }

    fn link() -> (LinkEnds, Board) {
        let (cmd_tx, cmd_rx) = mailbox();
        let (tel_tx, tel_rx) = mailbox();
        (
            LinkEnds { commands: cmd_tx, telemetry: tel_rx },
            Board { commands: cmd_rx, telemetry: tel_tx },
        )
    }

    #[tokio::test]
    async fn test_cycle_sends_pwms_and_steps_channels() {
        let (mut ends, mut board) = link();
        let shutdown = Shutdown::new();
        let mut control = controller(steady_probe());

        board.telemetry.send("1200,800,810,0,1500,0,0,0".into()).await.unwrap();
        let snapshot = control.run_cycle(&mut ends, &shutdown).await.unwrap();

        assert_eq!(board.commands.recv().await.unwrap(), b"178,255,255,0,45,0,0,0\n".to_vec());
        assert_eq!(snapshot.cycle, 1);
        assert_eq!(
            snapshot.rpms,
            vec![Some(1200), Some(800), Some(810), None, Some(1500), None, None, None]
        );
        assert_eq!(
            snapshot.temps,
            vec![Some(60), Some(41), Some(41), None, Some(70), None, None, None]
        );
        assert_eq!(snapshot.directions[0], Some(Direction::Down));
        assert_eq!(snapshot.decisions[1], Some(false));
        assert_eq!(control.pwms(), &[169, 255, 255, 0, 47, 0, 0, 0]);

        board.telemetry.send("1100,800,810,0,1500,0,0,0".into()).await.unwrap();
        control.run_cycle(&mut ends, &shutdown).await.unwrap();
        assert_eq!(board.commands.recv().await.unwrap(), b"169,255,255,0,47,0,0,0\n".to_vec());
    }

    #[tokio::test]
    async fn test_frame_error_clears_rpms_but_still_steps() {
        let (mut ends, mut board) = link();
        let shutdown = Shutdown::new();
        let mut control = controller(steady_probe());

        board.telemetry.send("1200,,810,0,1500,0,0,0".into()).await.unwrap();
        let snapshot = control.run_cycle(&mut ends, &shutdown).await.unwrap();
        let _ = board.commands.recv().await;

        assert_eq!(snapshot.rpms, vec![None; 8]);
        assert_eq!(snapshot.pwms_new[0], 169);
        assert_eq!(control.stats().frame_errors, 1);
    }

    #[tokio::test]
    async fn test_sensor_failure_holds_setpoint() {
        let mut probe = MockTemperatureProbe::new();
        probe.expect_read_ref().returning(|sensor: &SensorRef| {
            if sensor.chip == "k10temp" {
                Err(SensorReadError::ChipNotFound(sensor.chip.clone()))
            } else {
                Ok(None)
            }
        });
        let (mut ends, mut board) = link();
        let shutdown = Shutdown::new();
        let mut control = controller(Arc::new(probe));

        board.telemetry.send("0,0,0,0,0,0,0,0".into()).await.unwrap();
        let snapshot = control.run_cycle(&mut ends, &shutdown).await.unwrap();
        let _ = board.commands.recv().await;

        assert_eq!(snapshot.temps, vec![None; 8]);
        assert_eq!(snapshot.decisions, vec![None; 8]);
        assert_eq!(control.pwms(), &[178, 255, 255, 0, 45, 0, 0, 0]);
        assert_eq!(control.stats().sensor_errors, 1);
    }

    #[tokio::test]
    async fn test_inactive_ports_never_probed() {
        let mut probe = MockTemperatureProbe::new();
        probe.expect_read_ref().times(4).returning(|_: &SensorRef| Ok(Some(55.0)));
        let (mut ends, mut board) = link();
        let shutdown = Shutdown::new();
        let mut control = controller(Arc::new(probe));

        board.telemetry.send("0,0,0,0,0,0,0,0".into()).await.unwrap();
        control.run_cycle(&mut ends, &shutdown).await.unwrap();
        let _ = board.commands.recv().await;
    }

    #[tokio::test]
    async fn test_response_timeout_keeps_previous_rpms() {
        let (mut ends, mut board) = link();
        let shutdown = Shutdown::new();
        let mut control =
            controller(steady_probe()).with_response_timeout(Some(Duration::from_millis(20)));

        board.telemetry.send("1200,800,810,0,1500,0,0,0".into()).await.unwrap();
        control.run_cycle(&mut ends, &shutdown).await.unwrap();
        let _ = board.commands.recv().await;

        // No reply this time
        let snapshot = control.run_cycle(&mut ends, &shutdown).await.unwrap();
        let _ = board.commands.recv().await;
        assert_eq!(snapshot.rpms[0], Some(1200));
        assert_eq!(control.stats().missed_responses, 1);

        // The late reply shows up before the next command and is dropped
        board.telemetry.send("1,1,1,0,1,0,0,0".into()).await.unwrap();
        let task = async {
            let snapshot = control.run_cycle(&mut ends, &shutdown).await;
            (snapshot, control.stats())
        };
        let board_side = async {
            let _ = board.commands.recv().await;
            board.telemetry.send("900,800,810,0,1500,0,0,0".into()).await.unwrap();
        };
        let ((snapshot, stats), ()) = tokio::join!(task, board_side);
        assert_eq!(snapshot.unwrap().rpms[0], Some(900));
        assert_eq!(stats.stale_responses, 1);
    }

    #[tokio::test]
    async fn test_reply_arriving_after_next_command_is_discarded() {
        let (mut ends, mut board) = link();
        let shutdown = Shutdown::new();
        let mut control =
            controller(steady_probe()).with_response_timeout(Some(Duration::from_millis(20)));

        // Answers command n with RPM n on port 0. The reply to command 2 only
        // leaves the board once command 3 is already on the wire.
        let firmware = tokio::spawn(async move {
            let mut n = 0u32;
            while board.commands.recv().await.is_some() {
                n += 1;
                let replies = match n {
                    2 => vec![],
                    3 => vec![2, 3],
                    n => vec![n],
                };
                for rpm in replies {
                    let line = format!("{},0,0,0,0,0,0,0", rpm);
                    if board.telemetry.send(line).await.is_err() {
                        return;
                    }
                }
            }
        });

        let mut rpms = Vec::new();
        for _ in 0..4 {
            let snapshot = control.run_cycle(&mut ends, &shutdown).await.unwrap();
            rpms.push(snapshot.rpms[0]);
        }

        // Cycle 2 holds the RPMs of cycle 1; every later cycle sees its own reply
        assert_eq!(rpms, vec![Some(1), Some(1), Some(3), Some(4)]);
        let stats = control.stats();
        assert_eq!(stats.missed_responses, 1);
        assert_eq!(stats.stale_responses, 1);

        drop(ends);
        timeout(Duration::from_secs(1), firmware).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_response_deadline_covers_discarded_replies() {
        let (mut ends, mut board) = link();
        let shutdown = Shutdown::new();
        let mut control =
            controller(steady_probe()).with_response_timeout(Some(Duration::from_millis(30)));

        // Cycle 1 times out, so one reply is owed
        control.run_cycle(&mut ends, &shutdown).await.unwrap();
        let _ = board.commands.recv().await;

        // The owed reply arrives, the current one never does
        board.telemetry.send("5,0,0,0,0,0,0,0".into()).await.unwrap();
        let snapshot = timeout(Duration::from_secs(1), control.run_cycle(&mut ends, &shutdown))
            .await
            .unwrap()
            .unwrap();
        let _ = board.commands.recv().await;

        assert_eq!(snapshot.rpms[0], None);
        let stats = control.stats();
        assert_eq!(stats.missed_responses, 2);
        assert_eq!(stats.stale_responses, 1);
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_reply() {
        let (mut ends, mut board) = link();
        let shutdown = Shutdown::new();
        let mut control = controller(steady_probe());

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            let _ = board.commands.recv().await;
            trigger.trigger();
            board
        });

        let stats =
            timeout(Duration::from_secs(1), control.run(&mut ends, &shutdown)).await.unwrap();
        assert_eq!(stats.cycles, 0);
    }

    #[tokio::test]
    async fn test_run_stops_when_transport_closes() {
        let (mut ends, board) = link();
        drop(board);
        let shutdown = Shutdown::new();
        let mut control = controller(steady_probe());
        let stats =
            timeout(Duration::from_secs(1), control.run(&mut ends, &shutdown)).await.unwrap();
        assert_eq!(stats.cycles, 0);
    }

    #[tokio::test]
    async fn test_snapshots_reach_reporter() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut reporter = MockReporter::new();
        reporter.expect_report().returning(move |s| sink.lock().unwrap().push(s.clone()));
        let (handle, reporter_task) = spawn_reporters(vec![Box::new(reporter)], 4);

        let (mut ends, mut board) = link();
        let shutdown = Shutdown::new();
        let mut control = controller(steady_probe()).with_reports(handle);

        board.telemetry.send("0,0,0,0,0,0,0,0".into()).await.unwrap();
        control.run_cycle(&mut ends, &shutdown).await.unwrap();
        let _ = board.commands.recv().await;

        drop(control);
        reporter_task.await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].cycle, 1);
        assert_eq!(seen[0].pwms, vec![178, 255, 255, 0, 45, 0, 0, 0]);
        assert_eq!(seen[0].pwms_new[0], 169);
    }
}
