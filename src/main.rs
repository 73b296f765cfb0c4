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

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tracing::{error, info, warn};

use bridgehead::config::load_config_or_default;
use bridgehead::logger;
use bridgehead::service::{run_service, ReportOptions};
use bridgehead::transport::Shutdown;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long blocked serial reads may delay process exit
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    device: Option<PathBuf>,
    baud: Option<u32>,
    logging: bool,
    print_config: bool,
    quiet: bool,
}

#[derive(Debug, PartialEq)]
enum Cli {
    Run(Args),
    Help,
    Version,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Cli, String> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Cli::Help),
            "-v" | "--version" => return Ok(Cli::Version),
            "-c" | "--config" => {
                let path = args.next().ok_or("--config requires a path argument")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "-d" | "--device" => {
                let path = args.next().ok_or("--device requires a path argument")?;
                parsed.device = Some(PathBuf::from(path));
            }
            "-b" | "--baud" => {
                let rate = args.next().ok_or("--baud requires a rate argument")?;
                let rate = rate.parse().map_err(|_| format!("invalid baud rate: {}", rate))?;
                parsed.baud = Some(rate);
            }
            "--logging" => parsed.logging = true,
            "--print-config" => parsed.print_config = true,
            "-q" | "--quiet" => parsed.quiet = true,
            other => return Err(format!("Unknown argument: {}", other)),
        }
    }
    Ok(Cli::Run(parsed))
}

fn print_help() {
    eprintln!("bridgehead {} - closed-loop fan control over a serial fan controller", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    bridgehead [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH   Config file (default:");
    eprintln!("                        $XDG_CONFIG_HOME/bridgehead/config.json,");
    eprintln!("                        then /etc/bridgehead/config.json, then built-in defaults)");
    eprintln!("    -d, --device PATH   Serial device, overrides the config file");
    eprintln!("    -b, --baud RATE     Baud rate, overrides the config file");
    eprintln!("    -q, --quiet         Do not print the per-cycle table");
    eprintln!("        --logging       Write JSON events to {}", logger::DEFAULT_LOG_PATH);
    eprintln!("        --print-config  Print the effective configuration and exit");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    BRIDGEHEAD_LOG      Log filter (trace, debug, info, warn, error)");
}

fn print_version() {
    println!("bridgehead {}", VERSION);
}

fn init_tracing() {
    let log_level = std::env::var("BRIDGEHEAD_LOG").unwrap_or_else(|_| "info".to_string());

    // Prefer the systemd journal when it is there, stderr otherwise
    let mut use_journald = std::path::Path::new("/run/systemd/journal/socket").exists();
    if use_journald {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stderr", e);
                use_journald = false;
            }
        }
    }
    if !use_journald {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_level(true)
            .with_env_filter(&log_level)
            .init();
    }

    info!("STARTUP: bridgehead {} starting", VERSION);
    info!("STARTUP: Logging to {}", if use_journald { "systemd journal" } else { "stderr" });
}

async fn wait_for_signal(shutdown: Shutdown) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = shutdown.cancelled() => return,
        res = ctrl_c => {
            if let Err(e) = res {
                warn!("Failed to listen for SIGINT: {}", e);
                return;
            }
        }
        _ = terminate => {}
    }
    info!("SIGNAL: shutdown requested");
    shutdown.trigger();
}

fn main() -> anyhow::Result<()> {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(Cli::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Cli::Version) => {
            print_version();
            return Ok(());
        }
        Ok(Cli::Run(args)) => args,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            print_help();
            std::process::exit(2);
        }
    };

    let (mut config, source) = load_config_or_default(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_tracing();
    match &source {
        Some(path) => info!("STARTUP: Configuration from {}", path.display()),
        None => info!("STARTUP: No config file found, using built-in defaults"),
    }

    if args.logging {
        match logger::init_logging() {
            Some(path) => info!("STARTUP: Event log at {}", path.display()),
            None => warn!("Could not open an event log file, events disabled"),
        }
        logger::log_event("startup", json!({
            "version": VERSION,
            "device": config.device,
            "baud_rate": config.baud_rate,
            "config_path": source,
        }));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("bridgehead-worker")
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    let options = ReportOptions { console: !args.quiet, event_log: args.logging };
    let shutdown = Shutdown::new();
    let result = runtime.block_on(async {
        tokio::spawn(wait_for_signal(shutdown.clone()));
        run_service(config, options, shutdown.clone()).await
    });

    // A reader blocked on a silent tty would otherwise hold the runtime open
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);

    match result {
        Ok(stats) => {
            info!(
                cycles = stats.control.cycles,
                frame_errors = stats.control.frame_errors,
                missed_responses = stats.control.missed_responses,
                lines_read = stats.reader.lines,
                frames_written = stats.writer.frames,
                "SHUTDOWN: bridge stopped"
            );
            logger::shutdown_logging();
            Ok(())
        }
        Err(e) => {
            error!("FATAL: {}", e);
            logger::log_event("fatal_error", json!({ "error": e.to_string() }));
            logger::shutdown_logging();
            Err(e.into())
        }
    }
}
