use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use obci_duo::{check_distinct, load_device_config, Bridge, BridgeOptions, DeviceConfig, RunSummary, StopReason, MAX_TICK};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_CONFIG: u8 = 1;
const EXIT_START: u8 = 2;
const EXIT_ALL_FAILED: u8 = 3;

/// Stream two OpenBCI boards as discoverable network outlets.
#[derive(Parser, Debug)]
#[command(name = "obci_duo", version)]
struct Cli {
    /// Settings file for device 1
    config_1: PathBuf,
    /// Settings file for device 2
    config_2: PathBuf,
    /// Polling interval in milliseconds
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..=MAX_TICK.as_millis() as u64))]
    tick_ms: u64,
    /// Warn when device 2 is polled this many milliseconds after device 1
    #[arg(long, default_value_t = 10)]
    skew_warn_ms: u64,
    /// Address answering stream discovery queries
    #[arg(long, default_value = "0.0.0.0:16571")]
    discovery_addr: SocketAddr,
    /// Do not answer discovery queries
    #[arg(long)]
    no_discovery: bool,
}

enum Failure {
    Config(anyhow::Error),
    Start(anyhow::Error),
}

fn load_configs(cli: &Cli) -> anyhow::Result<(DeviceConfig, DeviceConfig)> {
    let first = load_device_config(&cli.config_1)
        .with_context(|| format!("device 1 settings '{}'", cli.config_1.display()))?;
    let second = load_device_config(&cli.config_2)
        .with_context(|| format!("device 2 settings '{}'", cli.config_2.display()))?;
    check_distinct(&first, &second).context("device settings conflict")?;
    Ok((first, second))
}

fn run_bridge(first: DeviceConfig, second: DeviceConfig, options: BridgeOptions, stop: &AtomicBool) -> Result<RunSummary, Failure> {
    let mut bridge = Bridge::from_configs(&first, &second, options);
    bridge
        .start()
        .context("bridge failed to start")
        .map_err(Failure::Start)?;
    bridge
        .run(stop)
        .context("bridge run failed")
        .map_err(Failure::Start)
}

fn report(summary: &RunSummary) {
    for (index, device) in summary.devices.iter().enumerate() {
        match &device.failure {
            Some(e) => tracing::warn!(
                "Device {} ('{}'): {} frames, failed: {}",
                index + 1,
                device.stream,
                device.frames,
                e
            ),
            None => tracing::info!(
                "Device {} ('{}'): {} frames, {} publish errors",
                index + 1,
                device.stream,
                device.frames,
                device.publish_errors
            ),
        }
    }
    tracing::info!(
        "Ran {} ticks in {:?}; poll skew max {:?}, mean {:?}",
        summary.ticks,
        summary.elapsed,
        summary.max_skew,
        summary.mean_skew
    );
}

async fn run(cli: Cli) -> Result<RunSummary, Failure> {
    let (first, second) = load_configs(&cli).map_err(Failure::Config)?;

    let options = BridgeOptions {
        tick: Duration::from_millis(cli.tick_ms),
        skew_warn: Duration::from_millis(cli.skew_warn_ms),
        run_limit: Some(first.run_limit().min(second.run_limit())),
        max_ticks: None,
        discovery: (!cli.no_discovery).then_some(cli.discovery_addr),
    };

    let stop = Arc::new(AtomicBool::new(false));
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received. Stopping bridge...");
                signal_stop.store(true, Ordering::SeqCst);
            }
            Err(e) => tracing::error!("Could not listen for Ctrl-C: {}", e),
        }
    });

    tokio::task::spawn_blocking(move || run_bridge(first, second, options, &stop))
        .await
        .context("bridge thread panicked")
        .map_err(Failure::Start)?
}

/// Process exit status for a finished run.
fn exit_code(outcome: &Result<RunSummary, Failure>) -> u8 {
    match outcome {
        Ok(summary) if summary.reason == StopReason::AllDevicesFailed => EXIT_ALL_FAILED,
        Ok(_) => 0,
        Err(Failure::Config(_)) => EXIT_CONFIG,
        Err(Failure::Start(_)) => EXIT_START,
    }
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "obci_duo=info,obci_sensors=info,lsl_outlet=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::info!("OBCI duo bridge starting...");

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Could not start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(run(cli));
    match &outcome {
        Ok(summary) => {
            report(summary);
            if summary.reason == StopReason::AllDevicesFailed {
                tracing::error!("Every device failed; exiting");
            } else {
                tracing::info!("Bridge stopped gracefully ({:?}).", summary.reason);
            }
        }
        Err(Failure::Config(e)) => tracing::error!("Configuration error: {:#}", e),
        Err(Failure::Start(e)) => tracing::error!("{:#}", e),
    }
    ExitCode::from(exit_code(&outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(reason: StopReason) -> Result<RunSummary, Failure> {
        Ok(RunSummary {
            reason,
            ticks: 10,
            elapsed: Duration::from_millis(100),
            devices: Vec::new(),
            max_skew: Duration::ZERO,
            mean_skew: Duration::ZERO,
        })
    }

    #[test]
    fn normal_stops_exit_cleanly() {
        assert_eq!(exit_code(&finished(StopReason::Interrupted)), 0);
        assert_eq!(exit_code(&finished(StopReason::TimeLimit)), 0);
        assert_eq!(exit_code(&finished(StopReason::TickBudget)), 0);
    }

    #[test]
    fn failures_map_to_distinct_codes() {
        assert_eq!(exit_code(&finished(StopReason::AllDevicesFailed)), EXIT_ALL_FAILED);
        assert_eq!(exit_code(&Err(Failure::Config(anyhow::anyhow!("bad yaml")))), EXIT_CONFIG);
        assert_eq!(exit_code(&Err(Failure::Start(anyhow::anyhow!("no port")))), EXIT_START);
    }

    #[test]
    fn tick_must_be_positive_and_bounded() {
        assert!(Cli::try_parse_from(["obci_duo", "a.yml", "b.yml", "--tick-ms", "0"]).is_err());
        assert!(Cli::try_parse_from(["obci_duo", "a.yml", "b.yml", "--tick-ms", "18446744073709551615"]).is_err());
        let cli = Cli::try_parse_from(["obci_duo", "a.yml", "b.yml", "--tick-ms", "4"]).unwrap();
        assert_eq!(cli.tick_ms, 4);
    }
}
